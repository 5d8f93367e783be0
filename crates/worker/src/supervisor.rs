use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use log::{debug, info, warn};

use crate::command::{run_with_timeout, DEFAULT_GRACE};
use crate::error_kind::WorkerFailure;
use crate::process::{WorkerIdentity, WorkerProcess};
use crate::protocol::{Request, Response};
use crate::WorkerError;

/// Timeouts for talking to the worker.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Budget for the warmup `ping` after a fresh spawn.
    pub warmup_timeout: Duration,
    /// Budget for a single `transcribe` request.
    pub request_timeout: Duration,
    /// How long a worker gets to honour `shutdown` before it is signalled.
    pub shutdown_timeout: Duration,
    /// Budget for one-shot `--audio` and `--check` invocations.
    pub one_shot_timeout: Duration,
    /// Sleep between polls of the output pipe.
    pub poll_interval: Duration,
    /// SIGTERM to SIGKILL escalation window.
    pub grace: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            warmup_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(120),
            shutdown_timeout: Duration::from_secs(2),
            one_shot_timeout: Duration::from_secs(180),
            poll_interval: Duration::from_millis(15),
            grace: DEFAULT_GRACE,
        }
    }
}

/// Owns the single long-lived inference worker.
///
/// Every request holds one lock from "find or spawn worker" through "read
/// full response", so concurrent callers never interleave on the pipes.
/// Identities whose persistent channel proved unusable stay on one-shot
/// invocations until `invalidate()`.
pub struct WorkerSupervisor {
    config: SupervisorConfig,
    worker: Mutex<Option<WorkerProcess>>,
    one_shot_only: Mutex<HashSet<WorkerIdentity>>,
    spawned: AtomicUsize,
}

impl WorkerSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            config,
            worker: Mutex::new(None),
            one_shot_only: Mutex::new(HashSet::new()),
            spawned: AtomicUsize::new(0),
        }
    }

    /// Transcribe `audio` with a worker started for `identity`.
    ///
    /// Protocol failures (exit, timeout, garbled output) get exactly one
    /// retry against a freshly spawned worker. If the persistent channel
    /// cannot be brought up at all, one-shot invocations are used instead
    /// for that identity until [`WorkerSupervisor::invalidate`].
    /// Failures the worker reports itself are returned as-is.
    pub fn transcribe(&self, identity: &WorkerIdentity, audio: &Path) -> Result<String, WorkerError> {
        let mut slot = self.worker.lock().unwrap();

        if self.one_shot_only.lock().unwrap().contains(identity) {
            drop(slot);
            return self.run_one_shot(identity, audio);
        }

        let first = match self.transcribe_persistent(&mut slot, identity, audio) {
            Ok(text) => return Ok(text),
            Err(e) if e.is_protocol() => e,
            Err(e) => return Err(e),
        };

        warn!("Worker call failed ({}), retrying with a fresh worker", first);
        self.teardown(&mut slot);

        match self.transcribe_persistent(&mut slot, identity, audio) {
            Ok(text) => Ok(text),
            Err(second) if second.is_unusable_channel() => {
                warn!(
                    "Persistent worker unusable ({}), falling back to one-shot invocation",
                    second
                );
                self.teardown(&mut slot);
                self.one_shot_only.lock().unwrap().insert(identity.clone());
                drop(slot);
                self.run_one_shot(identity, audio)
            }
            Err(second) => {
                if second.is_protocol() {
                    self.teardown(&mut slot);
                }
                Err(second)
            }
        }
    }

    /// Make sure a worker for `identity` is running and answers `ping`.
    pub fn warmup(&self, identity: &WorkerIdentity) -> Result<(), WorkerError> {
        let mut slot = self.worker.lock().unwrap();
        if self.one_shot_only.lock().unwrap().contains(identity) {
            debug!("Skipping warmup for one-shot worker {:?}", identity.model);
            return Ok(());
        }
        self.ensure_worker(&mut slot, identity).map(|_| ())
    }

    /// Validate runtime, dependencies and model with a one-shot `--check`.
    pub fn check(&self, identity: &WorkerIdentity) -> Result<(), WorkerError> {
        let output = run_with_timeout(&mut identity.check_command(), self.config.one_shot_timeout)?;
        if output.success() {
            debug!("Worker check passed for {:?}", identity.model);
            Ok(())
        } else {
            Err(WorkerError::Failed(WorkerFailure::new(
                None,
                output.last_error_line(),
            )))
        }
    }

    /// Tear down any live worker and forget one-shot fallbacks, so the next
    /// call starts from scratch.
    pub fn invalidate(&self) {
        let mut slot = self.worker.lock().unwrap();
        if slot.is_some() {
            info!("Invalidating inference worker");
        }
        self.teardown(&mut slot);
        self.one_shot_only.lock().unwrap().clear();
    }

    /// Number of worker processes spawned over the supervisor's lifetime.
    pub fn spawn_count(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }

    /// Pid of the live worker, if any.
    pub fn worker_pid(&self) -> Option<u32> {
        self.worker.lock().unwrap().as_ref().map(|w| w.pid())
    }

    fn transcribe_persistent(
        &self,
        slot: &mut Option<WorkerProcess>,
        identity: &WorkerIdentity,
        audio: &Path,
    ) -> Result<String, WorkerError> {
        let worker = self.ensure_worker(slot, identity)?;
        let response = worker.request(&Request::transcribe(audio), self.config.request_timeout)?;
        into_text(response)
    }

    fn ensure_worker<'a>(
        &self,
        slot: &'a mut Option<WorkerProcess>,
        identity: &WorkerIdentity,
    ) -> Result<&'a mut WorkerProcess, WorkerError> {
        let reusable = match slot.as_mut() {
            Some(worker) if worker.identity() != identity => {
                info!("Worker identity changed, restarting worker");
                false
            }
            Some(worker) => {
                if worker.is_alive() {
                    true
                } else {
                    warn!("Worker {} exited unexpectedly, restarting", worker.pid());
                    false
                }
            }
            None => false,
        };

        if !reusable {
            self.teardown(slot);
            *slot = Some(self.spawn_warm(identity)?);
        }

        slot.as_mut().ok_or(WorkerError::Exited {
            code: None,
            stderr: String::new(),
        })
    }

    fn spawn_warm(&self, identity: &WorkerIdentity) -> Result<WorkerProcess, WorkerError> {
        let mut worker =
            WorkerProcess::spawn(identity, self.config.poll_interval, self.config.grace)?;
        self.spawned.fetch_add(1, Ordering::SeqCst);

        match worker.request(&Request::ping(), self.config.warmup_timeout) {
            Ok(response) if response.ok => {
                debug!("Worker {} answered warmup ping", worker.pid());
                Ok(worker)
            }
            Ok(response) => Err(WorkerError::Failed(failure_from(&response))),
            Err(e) => Err(WorkerError::WarmupFailed(Box::new(e))),
        }
    }

    fn teardown(&self, slot: &mut Option<WorkerProcess>) {
        if let Some(mut worker) = slot.take() {
            worker.shutdown(self.config.shutdown_timeout);
        }
    }

    fn run_one_shot(&self, identity: &WorkerIdentity, audio: &Path) -> Result<String, WorkerError> {
        let output = run_with_timeout(
            &mut identity.one_shot_command(audio),
            self.config.one_shot_timeout,
        )?;
        if output.success() {
            Ok(output.stdout.trim().to_string())
        } else {
            Err(WorkerError::Failed(WorkerFailure::new(
                None,
                output.last_error_line(),
            )))
        }
    }
}

impl Default for WorkerSupervisor {
    fn default() -> Self {
        Self::new(SupervisorConfig::default())
    }
}

fn into_text(response: Response) -> Result<String, WorkerError> {
    if response.ok {
        Ok(response.text.unwrap_or_default().trim().to_string())
    } else {
        Err(WorkerError::Failed(failure_from(&response)))
    }
}

fn failure_from(response: &Response) -> WorkerFailure {
    let message = response
        .error
        .clone()
        .unwrap_or_else(|| "worker reported failure without details".to_string());
    WorkerFailure::new(response.kind.as_deref(), message)
}
