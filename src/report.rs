use anyhow::Result;
use chrono::{DateTime, Utc};
use colored::Colorize;
use serde::Serialize;

use crate::config::StrategyKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ReportFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioStatus {
    Passed,
    Failed,
    /// The group aborted before this scenario could run.
    NotRun,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScenarioOutcome {
    pub name: String,
    pub status: ScenarioStatus,
    pub failures: Vec<String>,
    pub duration_ms: u64,
}

impl ScenarioOutcome {
    pub fn from_failures(name: &str, failures: Vec<anyhow::Error>, duration_ms: u64) -> Self {
        let status = if failures.is_empty() {
            ScenarioStatus::Passed
        } else {
            ScenarioStatus::Failed
        };
        Self {
            name: name.to_string(),
            status,
            failures: failures.iter().map(|e| format!("{:#}", e)).collect(),
            duration_ms,
        }
    }

    pub fn not_run(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: ScenarioStatus::NotRun,
            failures: Vec::new(),
            duration_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub strategy: StrategyKind,
    /// xxh3 of the saved state, hex; absent when the build failed.
    pub artifact_fingerprint: Option<String>,
    /// Group-level failure (saved-state build, artifact modified, teardown).
    pub group_errors: Vec<String>,
    pub outcomes: Vec<ScenarioOutcome>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub passed: usize,
    pub failed: usize,
    pub not_run: usize,
}

impl RunReport {
    pub fn new(strategy: StrategyKind) -> Self {
        Self {
            started_at: Utc::now(),
            strategy,
            artifact_fingerprint: None,
            group_errors: Vec::new(),
            outcomes: Vec::new(),
        }
    }

    pub fn summary(&self) -> Summary {
        let mut s = Summary::default();
        for o in &self.outcomes {
            match o.status {
                ScenarioStatus::Passed => s.passed += 1,
                ScenarioStatus::Failed => s.failed += 1,
                ScenarioStatus::NotRun => s.not_run += 1,
            }
        }
        s
    }

    pub fn success(&self) -> bool {
        let s = self.summary();
        self.group_errors.is_empty() && s.failed == 0 && s.not_run == 0
    }

    pub fn print(&self, format: ReportFormat) -> Result<()> {
        match format {
            ReportFormat::Text => print!("{}", self.render_text()),
            ReportFormat::Json => println!("{}", self.render_json()?),
        }
        Ok(())
    }

    pub fn render_json(&self) -> Result<String> {
        #[derive(Serialize)]
        struct Export<'a> {
            #[serde(flatten)]
            report: &'a RunReport,
            summary: Summary,
            success: bool,
        }
        Ok(serde_json::to_string_pretty(&Export {
            report: self,
            summary: self.summary(),
            success: self.success(),
        })?)
    }

    pub fn render_text(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("{}\n", "hh-harness run".bold()));
        out.push_str("════════════════════════════════════════\n");
        out.push_str(&format!(
            "Started:     {}\n",
            self.started_at.format("%Y-%m-%d %H:%M:%S UTC")
        ));
        out.push_str(&format!("Strategy:    {}\n", self.strategy.label()));
        if let Some(fp) = &self.artifact_fingerprint {
            out.push_str(&format!("Saved state: {}\n", fp));
        }
        out.push('\n');

        for o in &self.outcomes {
            let tag = match o.status {
                ScenarioStatus::Passed => "PASS".green().bold(),
                ScenarioStatus::Failed => "FAIL".red().bold(),
                ScenarioStatus::NotRun => "SKIP".yellow().bold(),
            };
            out.push_str(&format!("{} {:<40} {:>6}ms\n", tag, o.name, o.duration_ms));
            for f in &o.failures {
                for line in f.lines() {
                    out.push_str(&format!("     {}\n", line));
                }
            }
        }

        if !self.group_errors.is_empty() {
            out.push_str("\nGroup errors:\n");
            out.push_str("────────────────────────────────────────\n");
            for e in &self.group_errors {
                for line in e.lines() {
                    out.push_str(&format!("  {}\n", line.red()));
                }
            }
        }

        let s = self.summary();
        out.push_str(&format!(
            "\n{} passed, {} failed, {} not run\n",
            s.passed, s.failed, s.not_run
        ));
        out
    }
}
