use anyhow::{Context, Result};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::client::Toolchain;
use crate::env::EnvDescriptor;
use crate::error::HarnessError;
use crate::log;
use crate::wait::{self, Backoff};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    NotStarted,
    Running,
    Stopped,
}

/// Owns the server bound to one working repo for the length of one test.
pub struct ServerController<'a> {
    tools: &'a Toolchain,
    repo: PathBuf,
    env: &'a EnvDescriptor,
    state: ServerState,
    child: Option<Child>,
    captured: Arc<Mutex<String>>,
    reader: Option<JoinHandle<()>>,
    stop_grace: Duration,
}

impl<'a> ServerController<'a> {
    pub fn new(tools: &'a Toolchain, repo: &Path, env: &'a EnvDescriptor, stop_grace: Duration) -> Self {
        Self {
            tools,
            repo: repo.to_path_buf(),
            env,
            state: ServerState::NotStarted,
            child: None,
            captured: Arc::new(Mutex::new(String::new())),
            reader: None,
            stop_grace,
        }
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    /// Launch the server in the background with its stderr captured.
    pub fn start(&mut self) -> Result<()> {
        if self.child.is_some() {
            anyhow::bail!("server for {} already started", self.repo.display());
        }
        let args = vec![self.repo.to_string_lossy().into_owned()];
        log::command(&self.tools.server.display().to_string(), &args);
        let mut child = Command::new(&self.tools.server)
            .args(&args)
            .env_clear()
            .envs(self.env.iter())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to start {}", self.tools.server.display()))?;

        if let Some(mut stderr) = child.stderr.take() {
            let sink = Arc::clone(&self.captured);
            self.reader = Some(thread::spawn(move || {
                let mut buf = [0u8; 4096];
                while let Ok(n) = stderr.read(&mut buf) {
                    if n == 0 {
                        break;
                    }
                    if let Ok(mut s) = sink.lock() {
                        s.push_str(&String::from_utf8_lossy(&buf[..n]));
                    }
                }
            }));
        }
        self.child = Some(child);
        self.state = ServerState::Running;
        Ok(())
    }

    /// The client starts a server on demand, including after a stop; record
    /// that one may be running.
    pub fn note_client_activity(&mut self) {
        self.state = ServerState::Running;
    }

    /// Server stderr captured so far (only for servers started by `start`).
    pub fn diagnostics(&self) -> String {
        self.captured.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Path reported by the client's log-name query.
    pub fn log_path(&self) -> Result<PathBuf> {
        let out = self.tools.logname(&self.repo, self.env)?;
        let path = out.stdout.trim();
        if !out.success() || path.is_empty() {
            anyhow::bail!("log-name query failed ({}): {}", out.status_label(), out.stderr.trim());
        }
        Ok(PathBuf::from(path))
    }

    /// Server log contents once the file has stopped changing.
    pub fn logs(&self, backoff: &Backoff) -> Result<String> {
        let path = self.log_path()?;
        wait::read_when_stable(&path, backoff)
    }

    /// Issue the client stop command and require exit 0. On failure the
    /// captured server diagnostics (or the server log) are attached.
    pub fn stop(&mut self) -> Result<()> {
        let out = self.tools.stop(&self.repo, self.env)?;
        if !out.success() {
            let diagnostics = self.collect_diagnostics_for_failure(&out.stderr);
            self.kill_owned_child();
            self.state = ServerState::Stopped;
            return Err(HarnessError::StopFailed {
                repo: self.repo.clone(),
                status: out.status_label(),
                diagnostics,
            }
            .into());
        }

        if let Some(mut child) = self.child.take() {
            let deadline = Instant::now() + self.stop_grace;
            loop {
                match child.try_wait() {
                    Ok(Some(status)) => {
                        log::debug(&format!("server exited: {}", status));
                        break;
                    }
                    Ok(None) if Instant::now() < deadline => thread::sleep(Duration::from_millis(20)),
                    _ => {
                        log::warn(&format!(
                            "server for {} still alive {}ms after stop; killing",
                            self.repo.display(),
                            self.stop_grace.as_millis()
                        ));
                        let _ = child.kill();
                        let _ = child.wait();
                        break;
                    }
                }
            }
        }
        self.join_reader();
        self.state = ServerState::Stopped;
        Ok(())
    }

    fn collect_diagnostics_for_failure(&mut self, client_stderr: &str) -> String {
        let mut out = String::new();
        if !client_stderr.trim().is_empty() {
            out.push_str("client: ");
            out.push_str(client_stderr.trim_end());
            out.push('\n');
        }
        let captured = self.diagnostics();
        if !captured.is_empty() {
            out.push_str(&captured);
        } else if let Ok(path) = self.log_path() {
            // Best effort only; the stop failure is the error being reported.
            if let Ok(text) = std::fs::read_to_string(&path) {
                out.push_str(&format!("log {}:\n{}", path.display(), tail(&text, 40)));
            }
        }
        if out.is_empty() {
            out.push_str("(no diagnostics captured)");
        }
        out
    }

    fn kill_owned_child(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
        self.join_reader();
    }

    fn join_reader(&mut self) {
        if let Some(handle) = self.reader.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ServerController<'_> {
    fn drop(&mut self) {
        // A server spawned here must never outlive its test.
        if self.child.is_some() {
            log::warn(&format!("server for {} was not stopped; killing", self.repo.display()));
            self.kill_owned_child();
        }
    }
}

fn tail(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}
