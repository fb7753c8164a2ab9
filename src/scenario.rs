//! Scenarios as data: a suite is a corpus plus named scenarios, each an
//! ordered list of steps. The executor materializes a working repo, applies
//! the steps against the saved-state strategy, and always stops the server.

use anyhow::{bail, Context, Result};
use regex::Regex;
use serde::Deserialize;
use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::client::Toolchain;
use crate::corpus::{self, Corpus};
use crate::diagnostics::{self, Diagnostic};
use crate::error::{HarnessError, Mismatch};
use crate::fixture::TestFixture;
use crate::log;
use crate::saved_state::{ArtifactRef, ChangeSet, SavedStateStrategy};
use crate::server::{ServerController, ServerState};
use crate::verify::{self, Verifier};
use crate::wait::{self, Backoff};

const BUILTIN: &str = include_str!("../scenarios/builtin.toml");

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Suite {
    #[serde(default)]
    pub corpus: Option<Corpus>,
    #[serde(rename = "scenario", default)]
    pub scenarios: Vec<Scenario>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Scenario {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "step", default)]
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Step {
    Write {
        path: String,
        content: String,
    },
    Remove {
        path: String,
    },
    Rename {
        from: String,
        to: String,
    },
    Copy {
        from: String,
        to: String,
    },
    /// Files changed since the saved state was taken.
    Declare {
        #[serde(default)]
        paths: Vec<String>,
    },
    StartServer,
    Check {
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        stdin: Option<String>,
        /// Exact stdout lines; omitted means stdout is not checked.
        #[serde(default)]
        expect: Option<Vec<String>>,
        #[serde(default)]
        stderr_contains: Vec<String>,
    },
    CheckBoth {
        args: Vec<String>,
        #[serde(default)]
        stdin: Option<String>,
        text: Vec<String>,
        structured: Vec<String>,
    },
    JsonStatus {
        #[serde(default)]
        expect: Vec<String>,
        #[serde(default = "default_true")]
        passed: bool,
        #[serde(default)]
        error_count: usize,
    },
    AssertFile {
        path: String,
        content: String,
    },
    KillWorker {
        #[serde(default = "default_signal")]
        signal: String,
        #[serde(default = "default_log_pattern")]
        log_pattern: String,
        #[serde(default = "default_pid_pattern")]
        pid_pattern: String,
    },
    ServerLog {
        contains: Vec<String>,
    },
    /// Stop, drop the saved state, and require the cold answer to match.
    ColdEquivalent,
}

fn default_true() -> bool {
    true
}

fn default_signal() -> String {
    "TERM".to_string()
}

fn default_log_pattern() -> String {
    "Logs will go to (.*)".to_string()
}

fn default_pid_pattern() -> String {
    "Just started typechecker server with pid: ([0-9]+)".to_string()
}

impl Step {
    /// Paths this step creates, edits or removes in the working repo.
    pub fn mutated_paths(&self) -> Vec<&str> {
        match self {
            Step::Write { path, .. } | Step::Remove { path } => vec![path.as_str()],
            Step::Rename { from, to } => vec![from.as_str(), to.as_str()],
            Step::Copy { to, .. } => vec![to.as_str()],
            _ => Vec::new(),
        }
    }

    /// Steps that talk to the server (and so may load the saved state).
    pub fn is_client_command(&self) -> bool {
        matches!(
            self,
            Step::StartServer
                | Step::Check { .. }
                | Step::CheckBoth { .. }
                | Step::JsonStatus { .. }
                | Step::KillWorker { .. }
                | Step::ServerLog { .. }
                | Step::ColdEquivalent
        )
    }

    fn label(&self) -> String {
        match self {
            Step::Write { path, .. } => format!("write {}", path),
            Step::Remove { path } => format!("remove {}", path),
            Step::Rename { from, to } => format!("rename {} -> {}", from, to),
            Step::Copy { from, to } => format!("copy {} -> {}", from, to),
            Step::Declare { paths } => format!("declare [{}]", paths.join(", ")),
            Step::StartServer => "start server".to_string(),
            Step::Check { args, .. } if args.is_empty() => "check".to_string(),
            Step::Check { args, .. } => format!("check {}", args.join(" ")),
            Step::CheckBoth { args, .. } => format!("check both {}", args.join(" ")),
            Step::JsonStatus { .. } => "json status".to_string(),
            Step::AssertFile { path, .. } => format!("assert file {}", path),
            Step::KillWorker { signal, .. } => format!("kill worker with SIG{}", signal),
            Step::ServerLog { .. } => "server log".to_string(),
            Step::ColdEquivalent => "cold equivalence".to_string(),
        }
    }
}

impl Scenario {
    /// Static checks, including the change-set contract: everything mutated
    /// before the first client command must be declared, and the declaration
    /// must precede that command.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| HarnessError::InvalidScenario(format!("{}: {}", self.name, msg));
        if self.name.trim().is_empty() {
            return Err(HarnessError::InvalidScenario("scenario with empty name".into()).into());
        }

        let mut mutated: BTreeSet<&str> = BTreeSet::new();
        let mut declared: Option<BTreeSet<&str>> = None;
        let mut command_seen = false;

        for (idx, step) in self.steps.iter().enumerate() {
            for path in step.mutated_paths() {
                corpus::validate_relative(path)
                    .map_err(|e| invalid(format!("step {}: {}", idx + 1, e)))?;
                if !command_seen {
                    mutated.insert(path);
                }
            }
            match step {
                Step::AssertFile { path, .. } => {
                    corpus::validate_relative(path)
                        .map_err(|e| invalid(format!("step {}: {}", idx + 1, e)))?;
                }
                Step::Declare { paths } => {
                    if command_seen {
                        return Err(invalid(format!(
                            "step {}: change set declared after the server already loaded state",
                            idx + 1
                        ))
                        .into());
                    }
                    declared = Some(paths.iter().map(String::as_str).collect());
                }
                Step::KillWorker {
                    log_pattern,
                    pid_pattern,
                    ..
                } => {
                    for pattern in [log_pattern, pid_pattern] {
                        let re = Regex::new(pattern)
                            .map_err(|e| invalid(format!("step {}: bad pattern: {}", idx + 1, e)))?;
                        if re.captures_len() < 2 {
                            return Err(invalid(format!(
                                "step {}: pattern {:?} needs a capture group",
                                idx + 1,
                                pattern
                            ))
                            .into());
                        }
                    }
                }
                _ => {}
            }

            if step.is_client_command() && !command_seen {
                command_seen = true;
                let Some(declared) = &declared else {
                    return Err(invalid(format!(
                        "step {} ({}) runs before any change set was declared",
                        idx + 1,
                        step.label()
                    ))
                    .into());
                };
                let missing: Vec<&str> = mutated.difference(declared).copied().collect();
                if !missing.is_empty() {
                    return Err(invalid(format!(
                        "mutated but not declared: {}",
                        missing.join(", ")
                    ))
                    .into());
                }
            }
        }
        Ok(())
    }
}

impl Suite {
    pub fn parse(text: &str, origin: &str) -> Result<Self> {
        toml::from_str(text).with_context(|| format!("Failed to parse scenario suite {}", origin))
    }

    pub fn builtin() -> Result<Self> {
        Self::parse(BUILTIN, "<builtin>")
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read scenario file {}", path.display()))?;
        Self::parse(&text, &path.display().to_string())
    }

    /// Append `other`'s scenarios. Both suites must agree on the corpus,
    /// since every scenario's expectations are written against it.
    pub fn merge(mut self, other: Suite) -> Result<Self> {
        if let Some(theirs) = other.corpus {
            if self.corpus.as_ref().is_some_and(|mine| *mine != theirs) {
                return Err(HarnessError::InvalidScenario(
                    "scenario file defines a corpus different from the built-in one".into(),
                )
                .into());
            }
            self.corpus = Some(theirs);
        }
        self.scenarios.extend(other.scenarios);
        Ok(self)
    }

    /// Keep scenarios whose name contains any of `filters` (all if empty).
    pub fn filter(mut self, filters: &[String]) -> Self {
        if !filters.is_empty() {
            self.scenarios
                .retain(|s| filters.iter().any(|f| s.name.contains(f.as_str())));
        }
        self
    }

    pub fn corpus(&self) -> Result<&Corpus> {
        self.corpus
            .as_ref()
            .filter(|c| !c.is_empty())
            .context("scenario suite has no corpus")
    }

    pub fn validate(&self) -> Result<()> {
        self.corpus()?.validate()?;
        let mut seen = HashSet::new();
        for scenario in &self.scenarios {
            if !seen.insert(scenario.name.as_str()) {
                bail!(HarnessError::InvalidScenario(format!(
                    "duplicate scenario name: {}",
                    scenario.name
                )));
            }
            scenario.validate()?;
        }
        Ok(())
    }
}

/// Read-only group state shared by every scenario.
pub struct GroupContext<'a> {
    pub tools: &'a Toolchain,
    pub strategy: &'a dyn SavedStateStrategy,
    pub artifact: &'a ArtifactRef,
    pub corpus: &'a Corpus,
    pub backoff: Backoff,
    pub stop_grace: Duration,
}

/// Run one scenario in its own fixture. Returns every failure observed: the
/// first step failure (later steps are skipped) and any teardown failure.
pub fn execute(ctx: &GroupContext<'_>, scenario: &Scenario, fixture: &TestFixture) -> Vec<anyhow::Error> {
    let mut failures = Vec::new();
    if let Err(e) = scenario.validate() {
        failures.push(e);
        return failures;
    }

    let repo = fixture.repo();
    let env = fixture.env();
    let mut server = ServerController::new(ctx.tools, repo, env, ctx.stop_grace);
    let verifier = Verifier::new(ctx.tools, repo, env);
    let mut exec = Execution {
        ctx,
        repo,
        verifier: &verifier,
        last_stderr: String::new(),
    };

    let result = ctx
        .corpus
        .reset(repo)
        .and_then(|_| ctx.strategy.install_loaded_state(repo, ctx.artifact))
        .context("Failed to materialize working repo")
        .and_then(|_| {
            for (idx, step) in scenario.steps.iter().enumerate() {
                log::debug(&format!("[{}] step {}: {}", scenario.name, idx + 1, step.label()));
                exec.apply(step, &mut server)
                    .with_context(|| format!("step {} ({})", idx + 1, step.label()))?;
            }
            Ok(())
        });
    if let Err(e) = result {
        failures.push(e);
    }

    if server.state() == ServerState::Running {
        if let Err(e) = server.stop() {
            failures.push(e.context("teardown"));
        }
    }
    failures
}

struct Execution<'a> {
    ctx: &'a GroupContext<'a>,
    repo: &'a Path,
    verifier: &'a Verifier<'a>,
    last_stderr: String,
}

impl Execution<'_> {
    fn apply(&mut self, step: &Step, server: &mut ServerController<'_>) -> Result<()> {
        if step.is_client_command() && !matches!(step, Step::StartServer) {
            server.note_client_activity();
        }
        match step {
            Step::Write { path, content } => {
                let target = self.repo.join(path);
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)
                        .with_context(|| format!("Failed to create {}", parent.display()))?;
                }
                fs::write(&target, content)
                    .with_context(|| format!("Failed to write {}", target.display()))
            }
            Step::Remove { path } => {
                let target = self.repo.join(path);
                fs::remove_file(&target).with_context(|| format!("Failed to remove {}", target.display()))
            }
            Step::Rename { from, to } => {
                let (src, dst) = (self.repo.join(from), self.repo.join(to));
                fs::rename(&src, &dst)
                    .with_context(|| format!("Failed to rename {} to {}", src.display(), dst.display()))
            }
            Step::Copy { from, to } => {
                let (src, dst) = (self.repo.join(from), self.repo.join(to));
                fs::copy(&src, &dst)
                    .map(|_| ())
                    .with_context(|| format!("Failed to copy {} to {}", src.display(), dst.display()))
            }
            Step::Declare { paths } => {
                self.ctx
                    .strategy
                    .declare_changed_files(self.repo, self.ctx.artifact, &ChangeSet::new(paths.iter().cloned()))
            }
            Step::StartServer => server.start(),
            Step::Check {
                args,
                stdin,
                expect,
                stderr_contains,
            } => {
                let result = match expect {
                    Some(lines) => self.verifier.check(args, stdin.as_deref(), lines)?,
                    None => self.verifier.invoke(args, stdin.as_deref())?,
                };
                self.last_stderr = result.stderr;
                require_contains("client stderr", &self.last_stderr, stderr_contains)
            }
            Step::CheckBoth {
                args,
                stdin,
                text,
                structured,
            } => self.verifier.check_both(args, stdin.as_deref(), text, structured),
            Step::JsonStatus {
                expect,
                passed,
                error_count,
            } => self.json_status(expect, *passed, *error_count),
            Step::AssertFile { path, content } => {
                let target = self.repo.join(path);
                let actual = fs::read_to_string(&target)
                    .with_context(|| format!("Failed to read {}", target.display()))?;
                verify::compare_lines(
                    &format!("content of {}", path),
                    &split_keep_blank(content),
                    &split_keep_blank(&actual),
                )
            }
            Step::KillWorker {
                signal,
                log_pattern,
                pid_pattern,
            } => self.kill_worker(signal, log_pattern, pid_pattern),
            Step::ServerLog { contains } => {
                let logs = server.logs(&self.ctx.backoff)?;
                require_contains("server log", &logs, contains)
            }
            Step::ColdEquivalent => self.cold_equivalent(server),
        }
    }

    fn json_status(&mut self, expect: &[String], passed: bool, error_count: usize) -> Result<()> {
        let result = self.verifier.check(&["--json".to_string()], None, expect)?;
        self.last_stderr = result.stderr;
        let record = diagnostics::parse_status_record(&self.last_stderr)?;
        if record.passed != passed || record.errors.len() != error_count {
            return Err(HarnessError::from(Mismatch::new(
                "--json status record",
                vec![format!("passed={} errors={}", passed, error_count)],
                vec![format!("passed={} errors={}", record.passed, record.errors.len())],
            ))
            .into());
        }
        Ok(())
    }

    /// The monitor names its log in the launch output; the log names the
    /// worker pid. Signal the worker and wait until it is gone.
    fn kill_worker(&mut self, signal: &str, log_pattern: &str, pid_pattern: &str) -> Result<()> {
        let log_re = Regex::new(log_pattern).context("bad log pattern")?;
        let pid_re = Regex::new(pid_pattern).context("bad pid pattern")?;
        let log_path = log_re
            .captures(&self.last_stderr)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().trim().to_string())
            .with_context(|| format!("no match for {:?} in the last client stderr", log_pattern))?;

        let pid = wait::wait_until(&format!("worker pid in {}", log_path), &self.ctx.backoff, || {
            let text = match fs::read_to_string(&log_path) {
                Ok(t) => t,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(e).with_context(|| format!("Failed to read {}", log_path)),
            };
            Ok(pid_re
                .captures(&text)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().to_string()))
        })?;
        log::debug(&format!("worker pid {} from {}", pid, log_path));

        let kill = Path::new("kill");
        let env = self.verifier.env();
        let sent = self
            .ctx
            .tools
            .run_tool(kill, vec![format!("-{}", signal), pid.clone()], env)?;
        if !sent.success() {
            bail!("kill -{} {} failed ({})", signal, pid, sent.status_label());
        }
        wait::wait_until(&format!("worker {} to exit", pid), &self.ctx.backoff, || {
            Ok(self.worker_gone(&pid)?.then_some(()))
        })
    }

    /// An unreaped worker still answers `kill -0`, so /proc is consulted
    /// first where it exists and a zombie counts as gone.
    fn worker_gone(&self, pid: &str) -> Result<bool> {
        match proc_state(pid) {
            Some(state) => Ok(matches!(state, 'Z' | 'X')),
            None if Path::new("/proc/self/stat").exists() => Ok(true),
            None => {
                let probe = self.ctx.tools.run_tool(
                    Path::new("kill"),
                    vec!["-0".to_string(), pid.to_string()],
                    self.verifier.env(),
                )?;
                Ok(!probe.success())
            }
        }
    }

    fn cold_equivalent(&mut self, server: &mut ServerController<'_>) -> Result<()> {
        let warm = self.status_diagnostics().context("warm status")?;
        server.stop().context("stopping warm server")?;
        self.ctx.strategy.install_cold(self.repo)?;
        server.note_client_activity();
        let cold = self.status_diagnostics().context("cold status")?;
        verify::compare_lines(
            "saved-state diagnostics vs cold start",
            &render_diagnostics(&cold),
            &render_diagnostics(&warm),
        )
    }

    fn status_diagnostics(&mut self) -> Result<Vec<Diagnostic>> {
        let result = self.verifier.invoke(&[], None)?;
        self.last_stderr = result.stderr;
        let mut diags = diagnostics::parse_status(&result.stdout)?;
        diags.sort();
        Ok(diags)
    }
}

fn render_diagnostics(diags: &[Diagnostic]) -> Vec<String> {
    let mut out = Vec::new();
    for d in diags {
        out.push(d.summary());
        for r in &d.related {
            out.push(format!("  {}: {}", r.location, r.message));
        }
    }
    out
}

/// Process state letter from /proc/<pid>/stat, if the entry exists.
fn proc_state(pid: &str) -> Option<char> {
    let stat = fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    // comm may contain spaces and parentheses; the state follows the last ')'.
    stat.rsplit_once(')')?.1.trim_start().chars().next()
}

fn require_contains(what: &str, haystack: &str, needles: &[String]) -> Result<()> {
    let missing: Vec<&String> = needles.iter().filter(|n| !haystack.contains(n.as_str())).collect();
    if missing.is_empty() {
        return Ok(());
    }
    bail!(
        "{} is missing {}\n--- {} ---\n{}",
        what,
        missing
            .iter()
            .map(|m| format!("{:?}", m))
            .collect::<Vec<_>>()
            .join(", "),
        what,
        haystack.trim_end()
    )
}

fn split_keep_blank(s: &str) -> Vec<String> {
    s.split('\n').map(str::to_string).collect()
}
