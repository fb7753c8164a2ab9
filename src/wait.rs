use anyhow::{Context, Result};
use std::path::Path;
use std::time::{Duration, Instant};

use crate::error::HarnessError;

/// Exponential backoff bounded by a total deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max_delay: Duration,
    pub deadline: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(50),
            max_delay: Duration::from_secs(1),
            deadline: Duration::from_secs(10),
        }
    }
}

impl Backoff {
    fn next_delay(&self, current: Duration) -> Duration {
        (current * 2).min(self.max_delay)
    }
}

/// Poll `probe` until it yields `Some`, sleeping with backoff between attempts.
/// Errors from `probe` abort immediately; running past the deadline yields
/// `HarnessError::WaitTimeout`.
pub fn wait_until<T, F>(what: &str, backoff: &Backoff, mut probe: F) -> Result<T>
where
    F: FnMut() -> Result<Option<T>>,
{
    let start = Instant::now();
    let mut delay = backoff.initial;
    loop {
        if let Some(value) = probe()? {
            return Ok(value);
        }
        let elapsed = start.elapsed();
        if elapsed >= backoff.deadline {
            return Err(HarnessError::WaitTimeout {
                what: what.to_string(),
                elapsed_ms: elapsed.as_millis(),
            }
            .into());
        }
        let remaining = backoff.deadline - elapsed;
        std::thread::sleep(delay.min(remaining));
        delay = backoff.next_delay(delay);
    }
}

/// Read `path` once it exists, is non-empty, and two successive reads agree.
pub fn read_when_stable(path: &Path, backoff: &Backoff) -> Result<String> {
    let mut previous: Option<String> = None;
    wait_until(
        &format!("{} to be written", path.display()),
        backoff,
        || {
            let current = match std::fs::read_to_string(path) {
                Ok(s) => s,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
                Err(e) => {
                    return Err(e).with_context(|| format!("Failed to read {}", path.display()))
                }
            };
            if current.is_empty() {
                return Ok(None);
            }
            if previous.as_deref() == Some(current.as_str()) {
                return Ok(Some(current));
            }
            previous = Some(current);
            Ok(None)
        },
    )
}
