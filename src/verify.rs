use anyhow::{bail, Result};
use std::path::{Path, MAIN_SEPARATOR};

use crate::client::Toolchain;
use crate::consistency;
use crate::env::EnvDescriptor;
use crate::error::{HarnessError, Mismatch};
use crate::process::InvocationResult;

const ROOT_PLACEHOLDER: &str = "{root}";

/// Resolves `{root}` to the working repo's absolute path with a trailing
/// separator, so `{root}foo.php` names a file in the repo.
#[derive(Debug, Clone)]
pub struct Template {
    root: String,
}

impl Template {
    pub fn new(repo: &Path) -> Self {
        let mut root = repo.to_string_lossy().into_owned();
        if !root.ends_with(MAIN_SEPARATOR) {
            root.push(MAIN_SEPARATOR);
        }
        Self { root }
    }

    pub fn render(&self, s: &str) -> String {
        s.replace(ROOT_PLACEHOLDER, &self.root)
    }

    pub fn render_all(&self, items: &[String]) -> Vec<String> {
        items.iter().map(|s| self.render(s)).collect()
    }
}

/// Runs client commands against one repo and compares with expectations.
pub struct Verifier<'a> {
    tools: &'a Toolchain,
    repo: &'a Path,
    env: &'a EnvDescriptor,
    template: Template,
}

impl<'a> Verifier<'a> {
    pub fn new(tools: &'a Toolchain, repo: &'a Path, env: &'a EnvDescriptor) -> Self {
        Self {
            tools,
            repo,
            env,
            template: Template::new(repo),
        }
    }

    pub fn env(&self) -> &'a EnvDescriptor {
        self.env
    }

    /// One client call with templated options. A hung call is a failure;
    /// any exit code is otherwise returned as data.
    pub fn invoke(&self, options: &[String], stdin: Option<&str>) -> Result<InvocationResult> {
        let options = self.template.render_all(options);
        let stdin = stdin.map(|s| self.template.render(s));
        let result = self
            .tools
            .check(self.repo, &options, stdin.as_deref(), self.env)?;
        if result.timed_out {
            bail!("client timed out running {}", options.join(" "));
        }
        Ok(result)
    }

    /// Run once and require stdout to equal `expected` line for line.
    pub fn check(&self, options: &[String], stdin: Option<&str>, expected: &[String]) -> Result<InvocationResult> {
        let result = self.invoke(options, stdin)?;
        compare_lines(
            &describe(options),
            &self.template.render_all(expected),
            &result.stdout_lines(),
        )?;
        Ok(result)
    }

    /// Structured form first, then text. Some commands mutate files only in
    /// the text form, so the non-mutating query must run before it.
    pub fn check_both(
        &self,
        options: &[String],
        stdin: Option<&str>,
        expected_text: &[String],
        expected_structured: &[String],
    ) -> Result<()> {
        let mut json_options = options.to_vec();
        json_options.push("--json".to_string());
        let structured = self.invoke(&json_options, stdin)?;
        compare_structured(
            &describe(&json_options),
            &self.template.render_all(expected_structured),
            &structured.stdout_lines(),
        )?;

        let text = self.check(options, stdin, expected_text)?;
        consistency::check(options, &text.stdout_lines(), &structured.stdout_lines())
    }
}

fn describe(options: &[String]) -> String {
    if options.is_empty() {
        "check".to_string()
    } else {
        format!("check {}", options.join(" "))
    }
}

pub fn compare_lines(context: &str, expected: &[String], actual: &[String]) -> Result<()> {
    if expected != actual {
        return Err(HarnessError::from(Mismatch::new(context, expected.to_vec(), actual.to_vec())).into());
    }
    Ok(())
}

/// JSON lines compare structurally (key order is irrelevant); anything that
/// is not JSON on both sides falls back to exact line comparison.
pub fn compare_structured(context: &str, expected: &[String], actual: &[String]) -> Result<()> {
    match (parse_json_lines(expected), parse_json_lines(actual)) {
        (Some(e), Some(a)) if e == a => Ok(()),
        (Some(_), Some(_)) => {
            Err(HarnessError::from(Mismatch::new(context, expected.to_vec(), actual.to_vec())).into())
        }
        _ => compare_lines(context, expected, actual),
    }
}

fn parse_json_lines(lines: &[String]) -> Option<Vec<serde_json::Value>> {
    if lines.is_empty() {
        return None;
    }
    lines
        .iter()
        .map(|l| serde_json::from_str(l).ok())
        .collect()
}
