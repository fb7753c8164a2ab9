use anyhow::{Context, Result};
use std::io::{Read, Write};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::env::EnvDescriptor;
use crate::log;

/// Outcome of one subprocess. A non-zero exit is a normal result, not an error.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvocationResult {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process was killed by a signal or by the timeout.
    pub code: Option<i32>,
    pub signal: Option<i32>,
    pub timed_out: bool,
}

impl InvocationResult {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn stdout_lines(&self) -> Vec<String> {
        self.stdout.lines().map(str::to_string).collect()
    }

    pub fn status_label(&self) -> String {
        if self.timed_out {
            "timed out".to_string()
        } else if let Some(code) = self.code {
            format!("exit {}", code)
        } else if let Some(sig) = self.signal {
            format!("killed by signal {}", sig)
        } else {
            "unknown exit".to_string()
        }
    }
}

/// One client/server call: arguments, optional stdin, environment.
#[derive(Debug, Clone)]
pub struct Invocation<'a> {
    pub program: &'a Path,
    pub args: Vec<String>,
    pub stdin: Option<&'a str>,
    pub env: &'a EnvDescriptor,
    pub timeout: Option<Duration>,
}

impl<'a> Invocation<'a> {
    pub fn new(program: &'a Path, args: Vec<String>, env: &'a EnvDescriptor) -> Self {
        Self {
            program,
            args,
            stdin: None,
            env,
            timeout: None,
        }
    }

    pub fn stdin(mut self, input: Option<&'a str>) -> Self {
        self.stdin = input;
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn run(&self) -> Result<InvocationResult> {
        run(self)
    }
}

/// After a timeout kill, how long the readers get to see end-of-file before
/// whatever they collected so far is returned.
const READ_GRACE: Duration = Duration::from_millis(500);

/// Spawn, feed stdin (or close it at once), collect both streams, and wait.
/// Only a failure to spawn or to collect output is an `Err`.
///
/// With a timeout the child leads its own process group, and the bound covers
/// the whole call: descendants that keep stdout/stderr open past the deadline
/// are killed along with the child.
pub fn run(inv: &Invocation<'_>) -> Result<InvocationResult> {
    let program = inv.program.display().to_string();
    log::command(&program, &inv.args);

    let mut command = Command::new(inv.program);
    command
        .args(&inv.args)
        .env_clear()
        .envs(inv.env.iter())
        .stdin(if inv.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        if inv.timeout.is_some() {
            command.process_group(0);
        }
    }
    let start = Instant::now();
    let mut child = spawn_retrying_busy(&mut command)
        .with_context(|| format!("Failed to spawn {}", program))?;

    if let Some(input) = inv.stdin {
        let pipe = child.stdin.take();
        let data = input.to_string();
        // Detached: it finishes when the pipe is drained or closed.
        thread::spawn(move || {
            if let Some(mut pipe) = pipe {
                // EPIPE here just means the child stopped reading.
                let _ = pipe.write_all(data.as_bytes());
            }
        });
    }
    let stdout_reader = child.stdout.take().map(Reader::spawn);
    let stderr_reader = child.stderr.take().map(Reader::spawn);

    let (status, mut timed_out) = wait_with_timeout(&mut child, inv.timeout)
        .with_context(|| format!("Failed while waiting for {}", program))?;

    let readers = [stdout_reader.as_ref(), stderr_reader.as_ref()];
    let deadline = inv.timeout.map(|t| start + t);
    let bounded = deadline.is_some();
    if let Some(deadline) = deadline {
        if !readers_done_by(&readers, deadline.max(Instant::now())) {
            kill_group(&child);
            timed_out = true;
            if !readers_done_by(&readers, Instant::now() + READ_GRACE) {
                log::warn(&format!(
                    "output of {} still held open after kill; keeping what was read",
                    program
                ));
            }
        }
    }
    let stdout = finish(stdout_reader, bounded, "stdout", &program)?;
    let stderr = finish(stderr_reader, bounded, "stderr", &program)?;

    log::forward_stderr(&stderr);
    if timed_out {
        log::warn(&format!(
            "{} exceeded {}s and was killed",
            program,
            inv.timeout.map(|t| t.as_secs()).unwrap_or_default()
        ));
    }

    Ok(InvocationResult {
        stdout,
        stderr,
        code: if timed_out { None } else { status.code() },
        signal: exit_signal(&status),
        timed_out,
    })
}

/// ETXTBSY: a script written moments ago may still be open for writing in a
/// forked sibling. Retry a few times before giving up.
fn spawn_retrying_busy(command: &mut Command) -> std::io::Result<Child> {
    const ETXTBSY: i32 = 26;
    let mut attempt = 0;
    loop {
        match command.spawn() {
            Err(e) if e.raw_os_error() == Some(ETXTBSY) && attempt < 5 => {
                attempt += 1;
                thread::sleep(Duration::from_millis(20 * attempt));
            }
            other => return other,
        }
    }
}

/// Pipe drained on its own thread into a shared buffer, so a reader stuck
/// behind a lingering descendant can be abandoned without losing output.
struct Reader {
    buf: Arc<Mutex<Vec<u8>>>,
    handle: JoinHandle<std::io::Result<()>>,
}

impl Reader {
    fn spawn<R: Read + Send + 'static>(mut pipe: R) -> Self {
        let buf = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&buf);
        let handle = thread::spawn(move || {
            let mut chunk = [0u8; 8192];
            loop {
                let n = pipe.read(&mut chunk)?;
                if n == 0 {
                    return Ok(());
                }
                sink.lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .extend_from_slice(&chunk[..n]);
            }
        });
        Self { buf, handle }
    }

    fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    fn contents(&self) -> String {
        let buf = self.buf.lock().unwrap_or_else(|e| e.into_inner());
        String::from_utf8_lossy(&buf).into_owned()
    }
}

fn readers_done_by(readers: &[Option<&Reader>], deadline: Instant) -> bool {
    loop {
        if readers.iter().flatten().all(|r| r.is_finished()) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(10));
    }
}

/// Join the reader. When `bounded`, an unfinished reader is left behind and
/// its partial output returned.
fn finish(reader: Option<Reader>, bounded: bool, stream: &str, program: &str) -> Result<String> {
    let Some(reader) = reader else {
        return Ok(String::new());
    };
    if bounded && !reader.is_finished() {
        return Ok(reader.contents());
    }
    let contents = Arc::clone(&reader.buf);
    reader
        .handle
        .join()
        .map_err(|_| anyhow::anyhow!("{} reader thread panicked for {}", stream, program))?
        .with_context(|| format!("Failed to read {} of {}", stream, program))?;
    let buf = contents.lock().unwrap_or_else(|e| e.into_inner());
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

fn wait_with_timeout(child: &mut Child, timeout: Option<Duration>) -> std::io::Result<(ExitStatus, bool)> {
    let Some(timeout) = timeout else {
        return Ok((child.wait()?, false));
    };
    let start = Instant::now();
    let mut delay = Duration::from_millis(5);
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok((status, false));
        }
        if start.elapsed() >= timeout {
            kill_group(child);
            let _ = child.kill();
            return Ok((child.wait()?, true));
        }
        thread::sleep(delay);
        delay = (delay * 2).min(Duration::from_millis(100));
    }
}

/// SIGKILL the child's process group. The group outlives a reaped leader as
/// long as any descendant is still in it.
#[cfg(unix)]
fn kill_group(child: &Child) {
    // Safety: killpg only sends a signal; the pgid is the child's pid because
    // it was spawned with process_group(0).
    unsafe {
        libc::killpg(child.id() as libc::pid_t, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_group(_child: &Child) {}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}
