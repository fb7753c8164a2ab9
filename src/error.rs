use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Failure categories the runner needs to tell apart via `downcast_ref`.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("saved state build failed ({status}):\n{stderr}")]
    SaveFailed { status: String, stderr: String },

    #[error("save command exited cleanly but produced no artifact at {0}")]
    ArtifactMissing(PathBuf),

    #[error("saved state artifact {path} changed while tests were reading it")]
    ArtifactModified { path: PathBuf },

    #[error("stopping server for {repo} failed ({status})\n--- server diagnostics ---\n{diagnostics}")]
    StopFailed {
        repo: PathBuf,
        status: String,
        diagnostics: String,
    },

    #[error(transparent)]
    Mismatch(#[from] Mismatch),

    #[error("invalid scenario: {0}")]
    InvalidScenario(String),

    #[error("timed out after {elapsed_ms}ms waiting for {what}")]
    WaitTimeout { what: String, elapsed_ms: u128 },
}

/// Expected vs actual output, kept as lines so the failure can be diffed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mismatch {
    pub context: String,
    pub expected: Vec<String>,
    pub actual: Vec<String>,
}

impl Mismatch {
    pub fn new(context: impl Into<String>, expected: Vec<String>, actual: Vec<String>) -> Self {
        Self {
            context: context.into(),
            expected,
            actual,
        }
    }
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "output mismatch: {}", self.context)?;
        let width = self.expected.len().max(self.actual.len());
        for i in 0..width {
            match (self.expected.get(i), self.actual.get(i)) {
                (Some(e), Some(a)) if e == a => writeln!(f, "  {}", e)?,
                (e, a) => {
                    if let Some(e) = e {
                        writeln!(f, "- {}", e)?;
                    }
                    if let Some(a) = a {
                        writeln!(f, "+ {}", a)?;
                    }
                }
            }
        }
        Ok(())
    }
}

impl std::error::Error for Mismatch {}
