//! Automatic setup of the local provider, with backoff retries.
//!
//! One actor task owns all retry state. Callers talk to it through a
//! [`CoordinatorHandle`]; the fetcher and the bootstrapper feed it through
//! their broadcast channels. Retry timers only post a message back to the
//! actor, which re-checks that the retry still applies before acting.

use std::future::Future;
use std::sync::Arc;

use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::retry::RetryPolicy;
use crate::config::Config;
use crate::models::{ArtifactFetcher, FetchEvent, FetchFailureCategory, ModelVariant, ResolvedSource};
use crate::runtime::{RuntimeBootstrapStatus, RuntimeBootstrapper, RuntimePhase};
use crate::telemetry::{RetryLevel, Telemetry};

/// The model side of provisioning.
pub trait ModelProvisioner: Send + Sync + 'static {
    fn subscribe(&self) -> broadcast::Receiver<FetchEvent>;

    /// Variant and source currently selected.
    fn current(&self) -> Option<(ModelVariant, ResolvedSource)>;

    /// Select the recommended source for the selected variant and return it.
    fn pin_recommended(&self) -> Option<(ModelVariant, ResolvedSource)>;

    /// Start a fetch in the background. With `reset` any in-flight transfer
    /// and its resumable state are discarded first.
    fn request_fetch(&self, variant: ModelVariant, source: ResolvedSource, reset: bool);
}

/// The runtime side of provisioning.
pub trait RuntimeProvisioner: Send + Sync + 'static {
    fn subscribe(&self) -> broadcast::Receiver<RuntimeBootstrapStatus>;

    /// Start a bootstrap in the background.
    fn request_bootstrap(&self, force_repair: bool);
}

impl ModelProvisioner for ArtifactFetcher {
    fn subscribe(&self) -> broadcast::Receiver<FetchEvent> {
        ArtifactFetcher::subscribe(self)
    }

    fn current(&self) -> Option<(ModelVariant, ResolvedSource)> {
        let variant = self.selected_variant();
        let source = self.current_source(&variant)?;
        Some((variant, source))
    }

    fn pin_recommended(&self) -> Option<(ModelVariant, ResolvedSource)> {
        let variant = self.selected_variant();
        let source = self.pin_recommended_source(&variant)?;
        Some((variant, source))
    }

    fn request_fetch(&self, variant: ModelVariant, source: ResolvedSource, reset: bool) {
        if !reset {
            if !self.spawn_fetch(variant, source) {
                debug!("Fetch already running");
            }
            return;
        }
        let fetcher = self.clone();
        tokio::spawn(async move {
            fetcher.reset(&variant.id).await;
            fetcher.spawn_fetch(variant, source);
        });
    }
}

impl RuntimeProvisioner for RuntimeBootstrapper {
    fn subscribe(&self) -> broadcast::Receiver<RuntimeBootstrapStatus> {
        RuntimeBootstrapper::subscribe(self)
    }

    fn request_bootstrap(&self, force_repair: bool) {
        let bootstrapper = self.clone();
        tokio::task::spawn_blocking(move || {
            // Outcome is observed through the status channel
            let _ = bootstrapper.ensure_ready(force_repair);
        });
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Concern {
    Download,
    Bootstrap,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConcernSnapshot {
    /// Retries scheduled in the current failure streak
    pub attempts: u32,
    pub retry_pending: bool,
    pub exhausted: bool,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CoordinatorSnapshot {
    pub download: ConcernSnapshot,
    pub bootstrap: ConcernSnapshot,
}

#[derive(Debug)]
enum Message {
    EnsureSetup {
        force_model_retry: bool,
        force_runtime_repair: bool,
        reason: String,
    },
    RetryFired {
        concern: Concern,
        generation: u64,
    },
    Snapshot(oneshot::Sender<CoordinatorSnapshot>),
    Shutdown,
}

/// Cloneable entry point to the coordinator actor.
#[derive(Debug, Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::UnboundedSender<Message>,
}

impl CoordinatorHandle {
    /// Provision the local model and runtime if the local provider is active.
    pub fn ensure_automatic_setup(
        &self,
        force_model_retry: bool,
        force_runtime_repair: bool,
        reason: &str,
    ) {
        let message = Message::EnsureSetup {
            force_model_retry,
            force_runtime_repair,
            reason: reason.to_string(),
        };
        if self.tx.send(message).is_err() {
            warn!("Provisioning coordinator is not running ({})", reason);
        }
    }

    pub async fn snapshot(&self) -> Option<CoordinatorSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(Message::Snapshot(reply)).ok()?;
        rx.await.ok()
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(Message::Shutdown);
    }
}

pub struct CoordinatorDeps {
    pub config: Config,
    pub telemetry: Telemetry,
    pub models: Arc<dyn ModelProvisioner>,
    pub runtime: Arc<dyn RuntimeProvisioner>,
    pub download_policy: RetryPolicy,
    pub bootstrap_policy: RetryPolicy,
}

impl CoordinatorDeps {
    pub fn new(
        config: Config,
        telemetry: Telemetry,
        models: Arc<dyn ModelProvisioner>,
        runtime: Arc<dyn RuntimeProvisioner>,
    ) -> Self {
        Self {
            config,
            telemetry,
            models,
            runtime,
            download_policy: RetryPolicy::DOWNLOAD,
            bootstrap_policy: RetryPolicy::BOOTSTRAP,
        }
    }
}

#[derive(Default)]
struct RetryState {
    attempts: u32,
    /// Bumped whenever a pending timer must be disregarded
    generation: u64,
    pending: Option<JoinHandle<()>>,
    exhausted: bool,
    last_error: Option<String>,
}

impl RetryState {
    fn reset(&mut self) {
        self.cancel_pending();
        self.attempts = 0;
        self.exhausted = false;
        self.last_error = None;
    }

    fn cancel_pending(&mut self) {
        self.generation += 1;
        if let Some(task) = self.pending.take() {
            task.abort();
        }
    }

    fn snapshot(&self) -> ConcernSnapshot {
        ConcernSnapshot {
            attempts: self.attempts,
            retry_pending: self.pending.is_some(),
            exhausted: self.exhausted,
            last_error: self.last_error.clone(),
        }
    }
}

pub struct ProvisioningCoordinator {
    deps: CoordinatorDeps,
    tx: mpsc::WeakUnboundedSender<Message>,
    download: RetryState,
    bootstrap: RetryState,
}

impl ProvisioningCoordinator {
    /// Start the actor on the current tokio runtime.
    pub fn spawn(deps: CoordinatorDeps) -> (CoordinatorHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let fetch_events = deps.models.subscribe();
        let runtime_events = deps.runtime.subscribe();
        let coordinator = Self {
            deps,
            tx: tx.downgrade(),
            download: RetryState::default(),
            bootstrap: RetryState::default(),
        };
        let task = tokio::spawn(coordinator.run(rx, fetch_events, runtime_events));
        (CoordinatorHandle { tx }, task)
    }

    async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<Message>,
        fetch_events: broadcast::Receiver<FetchEvent>,
        runtime_events: broadcast::Receiver<RuntimeBootstrapStatus>,
    ) {
        let mut fetch_events = Some(fetch_events);
        let mut runtime_events = Some(runtime_events);

        loop {
            tokio::select! {
                message = rx.recv() => match message {
                    Some(Message::Shutdown) | None => break,
                    Some(message) => self.handle(message),
                },
                event = recv_or_pending(&mut fetch_events) => match event {
                    Ok(event) => self.on_fetch_event(event),
                    Err(RecvError::Lagged(missed)) => warn!("Missed {} fetch events", missed),
                    Err(RecvError::Closed) => fetch_events = None,
                },
                status = recv_or_pending(&mut runtime_events) => match status {
                    Ok(status) => self.on_runtime_status(status),
                    Err(RecvError::Lagged(missed)) => warn!("Missed {} runtime events", missed),
                    Err(RecvError::Closed) => runtime_events = None,
                },
            }
        }

        self.download.cancel_pending();
        self.bootstrap.cancel_pending();
        debug!("Provisioning coordinator stopped");
    }

    fn handle(&mut self, message: Message) {
        match message {
            Message::EnsureSetup {
                force_model_retry,
                force_runtime_repair,
                reason,
            } => self.ensure_automatic_setup(force_model_retry, force_runtime_repair, &reason),
            Message::RetryFired {
                concern,
                generation,
            } => self.on_retry_fired(concern, generation),
            Message::Snapshot(reply) => {
                let _ = reply.send(CoordinatorSnapshot {
                    download: self.download.snapshot(),
                    bootstrap: self.bootstrap.snapshot(),
                });
            }
            Message::Shutdown => {}
        }
    }

    fn ensure_automatic_setup(
        &mut self,
        force_model_retry: bool,
        force_runtime_repair: bool,
        reason: &str,
    ) {
        if !self.deps.config.local_provider_selected() {
            debug!("Local provider not active, skipping setup ({})", reason);
            return;
        }
        info!(
            "Automatic setup ({}): model retry={}, runtime repair={}",
            reason, force_model_retry, force_runtime_repair
        );

        if force_model_retry {
            self.download.reset();
        }
        if force_runtime_repair {
            self.bootstrap.reset();
        }

        match self.deps.models.pin_recommended() {
            Some((variant, source)) => {
                self.deps
                    .models
                    .request_fetch(variant, source, force_model_retry)
            }
            None => warn!("No model source available for automatic setup"),
        }
        self.deps.runtime.request_bootstrap(force_runtime_repair);
    }

    fn on_fetch_event(&mut self, event: FetchEvent) {
        match event {
            FetchEvent::Complete { variant_id } => {
                if self.download.attempts > 0 {
                    info!("Model '{}' ready after {} retries", variant_id, self.download.attempts);
                }
                self.download.reset();
            }
            FetchEvent::Failed {
                category: FetchFailureCategory::Cancelled | FetchFailureCategory::Busy,
                ..
            } => {}
            FetchEvent::Failed {
                variant_id,
                error,
                category,
            } => {
                self.deps
                    .telemetry
                    .record_download_failure(&category.to_string());
                warn!("Download of '{}' failed ({}): {}", variant_id, category, error);
                self.download.last_error = Some(error);
                // A broken source stays broken; wait for a forced setup call.
                if category != FetchFailureCategory::SourceConfig {
                    self.schedule(Concern::Download);
                }
            }
            _ => {}
        }
    }

    fn on_runtime_status(&mut self, status: RuntimeBootstrapStatus) {
        match status.phase {
            RuntimePhase::Ready => self.bootstrap.reset(),
            RuntimePhase::Failed => {
                let category = status.failure_category.as_deref().unwrap_or("unknown");
                self.deps.telemetry.record_bootstrap_failure(category);
                self.bootstrap.last_error = Some(status.detail);
                self.schedule(Concern::Bootstrap);
            }
            RuntimePhase::Idle | RuntimePhase::Bootstrapping => {}
        }
    }

    fn schedule(&mut self, concern: Concern) {
        let (policy, state) = match concern {
            Concern::Download => (self.deps.download_policy, &mut self.download),
            Concern::Bootstrap => (self.deps.bootstrap_policy, &mut self.bootstrap),
        };

        if state.pending.is_some() {
            debug!("{} retry already pending", concern);
            return;
        }
        if !policy.allows(state.attempts) {
            if !state.exhausted {
                warn!(
                    "Giving up on automatic {} retries after {} attempts",
                    concern, state.attempts
                );
                state.exhausted = true;
            }
            return;
        }

        let delay = policy.delay_for(state.attempts);
        state.attempts += 1;
        state.generation += 1;
        let generation = state.generation;
        info!(
            "Scheduling {} retry {}/{} in {}s",
            concern,
            state.attempts,
            policy.max_attempts,
            delay.as_secs()
        );

        let tx = self.tx.clone();
        state.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(Message::RetryFired {
                    concern,
                    generation,
                });
            }
        }));

        match concern {
            Concern::Download => self.deps.telemetry.record_download_retry(RetryLevel::Scheduled),
            Concern::Bootstrap => self.deps.telemetry.record_bootstrap_retry(),
        }
    }

    fn on_retry_fired(&mut self, concern: Concern, generation: u64) {
        let state = match concern {
            Concern::Download => &mut self.download,
            Concern::Bootstrap => &mut self.bootstrap,
        };
        if state.generation != generation || state.pending.is_none() {
            debug!("Ignoring stale {} retry", concern);
            return;
        }
        state.pending = None;

        if !self.deps.config.local_provider_selected() {
            info!("Local provider no longer active, dropping {} retry", concern);
            return;
        }

        match concern {
            Concern::Download => match self.deps.models.current() {
                Some((variant, source)) => {
                    info!("Retrying download of '{}'", variant.id);
                    self.deps.models.request_fetch(variant, source, false);
                }
                None => warn!("No model source to retry"),
            },
            Concern::Bootstrap => {
                info!("Retrying runtime bootstrap");
                self.deps.runtime.request_bootstrap(false);
            }
        }
    }
}

fn recv_or_pending<T: Clone>(
    rx: &mut Option<broadcast::Receiver<T>>,
) -> impl Future<Output = Result<T, RecvError>> + '_ {
    async move {
        match rx {
            Some(rx) => rx.recv().await,
            None => std::future::pending().await,
        }
    }
}
