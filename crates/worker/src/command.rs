//! Host commands under a deadline.
//!
//! Every external command the runtime layer launches (package installs,
//! import probes, archive extraction, one-shot worker calls) goes through
//! [`run_with_timeout`]. A command that overruns its deadline is terminated
//! and reported as [`CommandError::TimedOut`], never as an ordinary failure.

use std::io::Read;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, warn};
use thiserror::Error;

/// Time a process gets to exit after SIGTERM before it is killed outright.
pub const DEFAULT_GRACE: Duration = Duration::from_millis(1500);

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// How long output readers may keep draining after the child has exited.
const STREAM_DRAIN: Duration = Duration::from_millis(500);

/// Captured result of a command that ran to completion.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    pub fn code(&self) -> Option<i32> {
        self.status.code()
    }

    /// Last non-empty line of stderr, falling back to stdout.
    pub fn last_error_line(&self) -> String {
        last_line(&self.stderr)
            .or_else(|| last_line(&self.stdout))
            .unwrap_or_default()
    }
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("Failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} timed out after {}s", timeout.as_secs())]
    TimedOut { program: String, timeout: Duration },
    #[error("Failed waiting for {program}: {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

impl CommandError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, CommandError::TimedOut { .. })
    }
}

/// Display name of the program a command will launch.
pub fn program_name(command: &Command) -> String {
    command.get_program().to_string_lossy().into_owned()
}

/// Run `command` to completion, capturing stdout and stderr.
///
/// Stdin is closed. When `timeout` elapses the child is terminated with
/// [`terminate`] and `CommandError::TimedOut` is returned.
pub fn run_with_timeout(
    command: &mut Command,
    timeout: Duration,
) -> Result<CommandOutput, CommandError> {
    let program = program_name(command);
    debug!("Running {:?} (timeout {}s)", command, timeout.as_secs());

    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| CommandError::Spawn {
            program: program.clone(),
            source,
        })?;

    let stdout = child.stdout.take().map(StreamCollector::start);
    let stderr = child.stderr.take().map(StreamCollector::start);

    let deadline = Instant::now() + timeout;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {
                if Instant::now() >= deadline {
                    warn!("{} exceeded {}s, terminating", program, timeout.as_secs());
                    terminate(&mut child, DEFAULT_GRACE);
                    // Reader threads are left to finish on their own; a
                    // grandchild may still hold the pipes open.
                    return Err(CommandError::TimedOut { program, timeout });
                }
                thread::sleep(POLL_INTERVAL);
            }
            Err(source) => {
                terminate(&mut child, DEFAULT_GRACE);
                return Err(CommandError::Wait { program, source });
            }
        }
    };

    // Pipes may stay open in a background grandchild
    let drain_until = Instant::now() + STREAM_DRAIN;
    let output = CommandOutput {
        status,
        stdout: finish_stream(stdout, drain_until),
        stderr: finish_stream(stderr, drain_until),
    };
    debug!("{} exited with {:?}", program, output.code());
    Ok(output)
}

/// Stop a child process: SIGTERM first, SIGKILL once `grace` has passed.
///
/// Always reaps the child. A child that already exited is left alone.
pub fn terminate(child: &mut Child, grace: Duration) {
    if let Ok(Some(_)) = child.try_wait() {
        return;
    }

    #[cfg(unix)]
    {
        let pid = child.id() as libc::pid_t;
        // SAFETY: plain signal delivery to a pid we spawned and have not reaped.
        unsafe {
            libc::kill(pid, libc::SIGTERM);
        }
        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            match child.try_wait() {
                Ok(Some(_)) => return,
                Ok(None) => thread::sleep(POLL_INTERVAL),
                Err(_) => break,
            }
        }
        debug!("pid {} ignored SIGTERM, escalating", pid);
    }
    #[cfg(not(unix))]
    let _ = grace;

    let _ = child.kill();
    let _ = child.wait();
}

/// Reads one output pipe on its own thread into a shared buffer.
struct StreamCollector {
    buffer: Arc<Mutex<Vec<u8>>>,
    handle: JoinHandle<()>,
}

impl StreamCollector {
    fn start<R: Read + Send + 'static>(mut stream: R) -> Self {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&buffer);
        let handle = thread::spawn(move || {
            let mut chunk = [0u8; 4096];
            loop {
                match stream.read(&mut chunk) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => sink.lock().unwrap().extend_from_slice(&chunk[..n]),
                }
            }
        });
        Self { buffer, handle }
    }

    /// Wait for EOF until `until`, then return whatever was read.
    ///
    /// A reader still blocked at `until` is detached.
    fn finish(self, until: Instant) -> String {
        while !self.handle.is_finished() && Instant::now() < until {
            thread::sleep(POLL_INTERVAL);
        }
        if self.handle.is_finished() {
            let _ = self.handle.join();
        } else {
            debug!("Output pipe still open after exit, keeping partial output");
        }
        let bytes = self.buffer.lock().unwrap();
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

fn finish_stream(collector: Option<StreamCollector>, until: Instant) -> String {
    collector.map(|c| c.finish(until)).unwrap_or_default()
}

fn last_line(text: &str) -> Option<String> {
    text.lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
}
