use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::command::{program_name, terminate};
use crate::protocol::{LineBuffer, Request, Response};
use crate::WorkerError;

const STDERR_TAIL_LINES: usize = 20;
const READ_CHUNK: usize = 8 * 1024;

/// The exact inputs a worker process was started with.
///
/// A running worker is only reused for requests carrying an identical
/// identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkerIdentity {
    pub executable: PathBuf,
    pub script: PathBuf,
    pub model: PathBuf,
    pub tokenizer: Option<PathBuf>,
}

impl WorkerIdentity {
    pub fn new(
        executable: impl Into<PathBuf>,
        script: impl Into<PathBuf>,
        model: impl Into<PathBuf>,
        tokenizer: Option<PathBuf>,
    ) -> Self {
        Self {
            executable: executable.into(),
            script: script.into(),
            model: model.into(),
            tokenizer,
        }
    }

    fn base_command(&self) -> Command {
        let mut command = Command::new(&self.executable);
        command.arg(&self.script);
        command
    }

    fn push_model_args(&self, command: &mut Command) {
        command.arg("--model").arg(&self.model);
        if let Some(tokenizer) = &self.tokenizer {
            command.arg("--tokenizer").arg(tokenizer);
        }
    }

    /// `<exe> <script> --serve --model <path> [--tokenizer <path>]`
    pub fn serve_command(&self) -> Command {
        let mut command = self.base_command();
        command.arg("--serve");
        self.push_model_args(&mut command);
        command
    }

    /// `<exe> <script> --model <path> [--tokenizer <path>] --audio <path>`
    pub fn one_shot_command(&self, audio: &Path) -> Command {
        let mut command = self.base_command();
        self.push_model_args(&mut command);
        command.arg("--audio").arg(audio);
        command
    }

    /// `<exe> <script> --check --model <path> [--tokenizer <path>]`
    pub fn check_command(&self) -> Command {
        let mut command = self.base_command();
        command.arg("--check");
        self.push_model_args(&mut command);
        command
    }
}

/// A live `--serve` worker and the pipes used to talk to it.
pub(crate) struct WorkerProcess {
    identity: WorkerIdentity,
    child: Child,
    stdin: ChildStdin,
    chunks: Receiver<Vec<u8>>,
    buffer: LineBuffer,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
    poll_interval: Duration,
    grace: Duration,
}

impl WorkerProcess {
    pub(crate) fn spawn(
        identity: &WorkerIdentity,
        poll_interval: Duration,
        grace: Duration,
    ) -> Result<Self, WorkerError> {
        let mut command = identity.serve_command();
        let program = program_name(&command);
        let mut child = command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| WorkerError::Spawn { program, source })?;

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            terminate(&mut child, grace);
            return Err(WorkerError::Spawn {
                program: program_name(&identity.serve_command()),
                source: std::io::Error::other("worker pipes unavailable"),
            });
        };

        let (tx, chunks) = mpsc::channel();
        thread::spawn(move || pump_stdout(stdout, tx));

        let stderr_tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
        let tail = stderr_tail.clone();
        thread::spawn(move || pump_stderr(stderr, tail));

        info!(
            "Started worker pid {} for model {:?}",
            child.id(),
            identity.model
        );

        Ok(Self {
            identity: identity.clone(),
            child,
            stdin,
            chunks,
            buffer: LineBuffer::new(),
            stderr_tail,
            poll_interval,
            grace,
        })
    }

    pub(crate) fn identity(&self) -> &WorkerIdentity {
        &self.identity
    }

    pub(crate) fn pid(&self) -> u32 {
        self.child.id()
    }

    pub(crate) fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Send one request and wait for its correlated response.
    pub(crate) fn request(
        &mut self,
        request: &Request,
        timeout: Duration,
    ) -> Result<Response, WorkerError> {
        let line = request
            .encode()
            .map_err(|e| WorkerError::MalformedResponse(format!("encode failed: {e}")))?;

        if let Err(e) = self.stdin.write_all(&line).and_then(|_| self.stdin.flush()) {
            debug!("Write to worker {} failed: {}", self.pid(), e);
            return Err(self.exited_error());
        }

        let line = self.read_line(request, timeout)?;
        let response = Response::decode(&line).map_err(|e| {
            WorkerError::MalformedResponse(format!("{e}: {}", truncate(&line, 200)))
        })?;

        if response.id != request.id {
            return Err(WorkerError::IdMismatch {
                expected: request.id.clone(),
                actual: response.id,
            });
        }
        Ok(response)
    }

    fn read_line(&mut self, request: &Request, timeout: Duration) -> Result<String, WorkerError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(line) = self.buffer.next_line() {
                return Ok(line);
            }

            match self.chunks.recv_timeout(self.poll_interval) {
                Ok(bytes) => self.buffer.push(&bytes),
                Err(RecvTimeoutError::Timeout) => {
                    if !self.is_alive() {
                        return Err(self.exited_error());
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    // stdout closed; give the process a moment to report status
                    let _ = self.wait_for_exit(self.poll_interval * 5);
                    return Err(self.exited_error());
                }
            }

            if Instant::now() >= deadline {
                return Err(WorkerError::Timeout {
                    op: request.op,
                    timeout,
                });
            }
        }
    }

    /// Ask the worker to exit; terminate it if it does not comply in time.
    pub(crate) fn shutdown(&mut self, timeout: Duration) {
        if !self.is_alive() {
            return;
        }
        let pid = self.pid();
        match self.request(&Request::shutdown(), timeout) {
            Ok(_) => debug!("Worker {} acknowledged shutdown", pid),
            Err(e) => debug!("Worker {} shutdown request failed: {}", pid, e),
        }
        if !self.wait_for_exit(timeout) {
            warn!("Worker {} still running after shutdown, terminating", pid);
        }
        terminate(&mut self.child, self.grace);
        info!("Worker {} stopped", pid);
    }

    fn wait_for_exit(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if !self.is_alive() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(self.poll_interval);
        }
    }

    fn exited_error(&mut self) -> WorkerError {
        let code = self.child.try_wait().ok().flatten().and_then(|s| s.code());
        let stderr = self
            .stderr_tail
            .lock()
            .unwrap()
            .iter()
            .cloned()
            .collect::<Vec<_>>()
            .join("\n");
        WorkerError::Exited { code, stderr }
    }
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        terminate(&mut self.child, self.grace);
    }
}

fn pump_stdout(mut stdout: impl Read, tx: mpsc::Sender<Vec<u8>>) {
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        match stdout.read(&mut chunk) {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if tx.send(chunk[..n].to_vec()).is_err() {
                    break;
                }
            }
        }
    }
}

fn pump_stderr(stderr: impl Read, tail: Arc<Mutex<VecDeque<String>>>) {
    for line in BufReader::new(stderr).lines().map_while(Result::ok) {
        debug!("[worker] {}", line);
        let mut tail = tail.lock().unwrap();
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_commands_follow_invocation_contract() {
        let identity = WorkerIdentity::new(
            "/rt/bin/python",
            "/app/infer.py",
            "/models/m.onnx",
            Some(PathBuf::from("/models/vocab.txt")),
        );

        let args = |command: Command| -> Vec<String> {
            command
                .get_args()
                .map(|a| a.to_string_lossy().into_owned())
                .collect()
        };

        assert_eq!(
            args(identity.serve_command()),
            vec![
                "/app/infer.py",
                "--serve",
                "--model",
                "/models/m.onnx",
                "--tokenizer",
                "/models/vocab.txt"
            ]
        );
        assert_eq!(
            args(identity.check_command()),
            vec![
                "/app/infer.py",
                "--check",
                "--model",
                "/models/m.onnx",
                "--tokenizer",
                "/models/vocab.txt"
            ]
        );

        let no_tokenizer = WorkerIdentity {
            tokenizer: None,
            ..identity
        };
        assert_eq!(
            args(no_tokenizer.one_shot_command(Path::new("/tmp/a.wav"))),
            vec!["/app/infer.py", "--model", "/models/m.onnx", "--audio", "/tmp/a.wav"]
        );
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("hi", 10), "hi");
    }
}
