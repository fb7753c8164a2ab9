use colored::Colorize;
use std::io::Write;
use std::sync::atomic::{AtomicU8, Ordering};

const PREFIX: &str = "[hh-harness]";

static VERBOSITY: AtomicU8 = AtomicU8::new(0);

pub fn set_verbosity(level: u8) {
    VERBOSITY.store(level, Ordering::Relaxed);
}

pub fn verbosity() -> u8 {
    VERBOSITY.load(Ordering::Relaxed)
}

pub fn log(msg: &str) {
    eprintln!("{} {}", PREFIX.cyan(), msg);
}

pub fn warn(msg: &str) {
    eprintln!("{} {} {}", PREFIX.cyan(), "WARN:".yellow().bold(), msg);
}

/// Only printed with `-v` or higher.
pub fn debug(msg: &str) {
    if verbosity() > 0 {
        eprintln!("{} {}", PREFIX.dimmed(), msg.dimmed());
    }
}

/// Echo a command line before it runs.
pub fn command(program: &str, args: &[String]) {
    let mut line = String::from(program);
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    eprintln!("{} {} {}", PREFIX.cyan(), "$".bold(), line);
}

/// Forward a child's stderr verbatim. Locks stderr so parallel scenarios do
/// not interleave within one block.
pub fn forward_stderr(text: &str) {
    if text.is_empty() {
        return;
    }
    let stderr = std::io::stderr();
    let mut handle = stderr.lock();
    let _ = handle.write_all(text.as_bytes());
    if !text.ends_with('\n') {
        let _ = handle.write_all(b"\n");
    }
    let _ = handle.flush();
}
