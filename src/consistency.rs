//! Structured and text output of the same command must describe the same
//! names, locations and types. Each supported command is reduced to a set of
//! comparable keys from both forms.

use anyhow::{bail, Context, Result};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeSet;

use crate::error::Mismatch;

lazy_static! {
    static ref REF_LINE: Regex =
        Regex::new(r#"^File "(?P<file>.*)", line (?P<line>\d+), characters (?P<c1>\d+)-(?P<c2>\d+): (?P<rest>.*)$"#)
            .expect("invalid REF_LINE regex");
    static ref TOTAL_LINE: Regex =
        Regex::new(r"^(?P<n>\d+) total results$").expect("invalid TOTAL_LINE regex");
    static ref REWROTE_LINE: Regex =
        Regex::new(r"^Rewrote (?P<n>\d+) files?\.$").expect("invalid REWROTE_LINE regex");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    FindRefs,
    Search,
    AutoComplete,
    TypeAtPos,
    Refactor,
    /// Both forms are plain lines and must be identical.
    Verbatim,
}

impl CommandKind {
    /// `None` for commands without a known dual form (e.g. plain status).
    pub fn detect(options: &[String]) -> Option<Self> {
        options.iter().find_map(|o| match o.as_str() {
            "--find-refs" | "--find-class-refs" => Some(Self::FindRefs),
            "--search" => Some(Self::Search),
            "--auto-complete" => Some(Self::AutoComplete),
            "--type-at-pos" => Some(Self::TypeAtPos),
            "--refactor" => Some(Self::Refactor),
            "--list-files" | "--identify-function" => Some(Self::Verbatim),
            _ => None,
        })
    }
}

#[derive(Debug, Deserialize)]
struct RefRecord {
    name: String,
    filename: String,
    line: u32,
    char_start: u32,
    char_end: u32,
}

#[derive(Debug, Deserialize)]
struct SearchRecord {
    name: String,
    filename: String,
    desc: String,
    line: u32,
    char_start: u32,
    char_end: u32,
}

#[derive(Debug, Deserialize)]
struct CompletionRecord {
    name: String,
    #[serde(rename = "type")]
    ty: String,
}

#[derive(Debug, Deserialize)]
struct TypeRecord {
    #[serde(rename = "type")]
    ty: String,
}

#[derive(Debug, Deserialize)]
struct RefactorRecord {
    filename: String,
}

/// Compare actual structured and text results of one command.
pub fn check(options: &[String], text: &[String], structured: &[String]) -> Result<()> {
    let Some(kind) = CommandKind::detect(options) else {
        return Ok(());
    };
    let (from_structured, from_text) = match kind {
        CommandKind::Verbatim => (set(structured.iter().cloned()), set(text.iter().cloned())),
        CommandKind::FindRefs => (
            parse_json::<Vec<RefRecord>>(structured)?
                .into_iter()
                .map(|r| loc_key(&r.filename, r.line, r.char_start, r.char_end, &r.name))
                .collect(),
            ref_keys(text)?,
        ),
        CommandKind::Search => (
            parse_json::<Vec<SearchRecord>>(structured)?
                .into_iter()
                .map(|r| {
                    let label = format!("{}, {}", r.name, r.desc);
                    loc_key(&r.filename, r.line, r.char_start, r.char_end, &label)
                })
                .collect(),
            ref_keys(text)?,
        ),
        CommandKind::AutoComplete => (
            parse_json::<Vec<CompletionRecord>>(structured)?
                .into_iter()
                .map(|r| format!("{} {}", r.name, r.ty))
                .collect(),
            set(text.iter().cloned()),
        ),
        CommandKind::TypeAtPos => (
            set([parse_json::<TypeRecord>(structured)?.ty]),
            set(text.iter().cloned()),
        ),
        CommandKind::Refactor => {
            let files = parse_json::<Vec<RefactorRecord>>(structured)?;
            let unique: BTreeSet<String> = files.into_iter().map(|r| r.filename).collect();
            (
                set([format!("{} files", unique.len())]),
                set([format!("{} files", rewrote_count(text)?)]),
            )
        }
    };

    if from_structured != from_text {
        return Err(Mismatch::new(
            format!("structured and text forms disagree for {}", options.join(" ")),
            from_structured.into_iter().collect(),
            from_text.into_iter().collect(),
        )
        .into());
    }
    Ok(())
}

fn set<I: IntoIterator<Item = String>>(items: I) -> BTreeSet<String> {
    items.into_iter().collect()
}

fn loc_key(file: &str, line: u32, c1: u32, c2: u32, label: &str) -> String {
    format!("{}:{}:{}-{}: {}", file, line, c1, c2, label)
}

fn parse_json<T: serde::de::DeserializeOwned>(lines: &[String]) -> Result<T> {
    let joined = lines.join("\n");
    serde_json::from_str(&joined)
        .with_context(|| format!("structured output is not the expected JSON: {}", joined))
}

/// `File "...", line L, characters a-b: <rest>` lines plus an optional
/// trailing `N total results` that must agree with the line count.
fn ref_keys(text: &[String]) -> Result<BTreeSet<String>> {
    let mut keys = BTreeSet::new();
    let mut listed = 0usize;
    for line in text {
        if let Some(caps) = REF_LINE.captures(line) {
            listed += 1;
            keys.insert(loc_key(
                &caps["file"],
                caps["line"].parse()?,
                caps["c1"].parse()?,
                caps["c2"].parse()?,
                &caps["rest"],
            ));
        } else if let Some(caps) = TOTAL_LINE.captures(line) {
            let total: usize = caps["n"].parse()?;
            if total != listed {
                bail!("text form lists {} results but reports {} total", listed, total);
            }
        } else {
            bail!("unrecognized line in text output: {}", line);
        }
    }
    Ok(keys)
}

fn rewrote_count(text: &[String]) -> Result<usize> {
    text.iter()
        .find_map(|l| REWROTE_LINE.captures(l))
        .map(|caps| caps["n"].parse::<usize>())
        .transpose()?
        .context("text form has no 'Rewrote N files.' line")
}
