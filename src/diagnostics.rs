use anyhow::{bail, Context, Result};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use std::fmt;

lazy_static! {
    // <path>:<line>:<col_start>,<col_end>: <message> (<Category>[<code>])
    static ref PRIMARY: Regex = Regex::new(
        r"^(?P<path>[^\s:][^:]*):(?P<line>\d+):(?P<c1>\d+),(?P<c2>\d+): (?P<msg>.*) \((?P<cat>[A-Za-z]+)\[(?P<code>\d+)\]\)$"
    )
    .expect("invalid PRIMARY regex");
    // indented continuation: <path>:<line>:<c1>,<c2>: <message>
    static ref RELATED: Regex = Regex::new(
        r"^\s+(?P<path>[^:]+):(?P<line>\d+):(?P<c1>\d+),(?P<c2>\d+): (?P<msg>.*)$"
    )
    .expect("invalid RELATED regex");
}

pub const NO_ERRORS: &str = "No errors!";

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Location {
    pub path: String,
    pub line: u32,
    pub col_start: u32,
    pub col_end: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Related {
    pub location: Location,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Diagnostic {
    pub location: Location,
    pub message: String,
    pub category: String,
    pub code: u32,
    pub related: Vec<Related>,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{},{}", self.path, self.line, self.col_start, self.col_end)
    }
}

impl Diagnostic {
    /// The primary line in the client's own text format.
    pub fn summary(&self) -> String {
        format!(
            "{}: {} ({}[{}])",
            self.location, self.message, self.category, self.code
        )
    }
}

/// Parse the text form of a status check. `No errors!` yields an empty list;
/// anything that is neither a diagnostic nor a continuation is an error.
pub fn parse_status(output: &str) -> Result<Vec<Diagnostic>> {
    let mut out: Vec<Diagnostic> = Vec::new();
    for (idx, line) in output.lines().enumerate() {
        if line.trim().is_empty() || line.trim() == NO_ERRORS {
            continue;
        }
        if let Some(caps) = PRIMARY.captures(line) {
            out.push(Diagnostic {
                location: location(&caps)?,
                message: caps["msg"].to_string(),
                category: caps["cat"].to_string(),
                code: caps["code"].parse().context("diagnostic code")?,
                related: Vec::new(),
            });
            continue;
        }
        if let Some(caps) = RELATED.captures(line) {
            let Some(last) = out.last_mut() else {
                bail!("line {}: continuation before any diagnostic: {}", idx + 1, line);
            };
            last.related.push(Related {
                location: location(&caps)?,
                message: caps["msg"].to_string(),
            });
            continue;
        }
        bail!("line {}: not a diagnostic: {}", idx + 1, line);
    }
    Ok(out)
}

fn location(caps: &regex::Captures<'_>) -> Result<Location> {
    Ok(Location {
        path: caps["path"].to_string(),
        line: caps["line"].parse().context("line number")?,
        col_start: caps["c1"].parse().context("start column")?,
        col_end: caps["c2"].parse().context("end column")?,
    })
}

/// Final stderr line of `check --json`.
#[derive(Debug, Clone, Deserialize)]
pub struct StatusRecord {
    pub errors: Vec<serde_json::Value>,
    pub passed: bool,
    pub version: serde_json::Value,
}

pub fn parse_status_record(stderr: &str) -> Result<StatusRecord> {
    let last = stderr
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .context("no JSON status record on stderr")?;
    let record: StatusRecord = serde_json::from_str(last)
        .with_context(|| format!("Failed to parse status record: {}", last))?;
    if record.version.is_null() {
        bail!("status record has no server version: {}", last);
    }
    Ok(record)
}
