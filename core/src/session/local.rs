//! Local dictation sessions backed by the supervised inference worker.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use log::{debug, info, warn};
use visperflow_worker::{WorkerIdentity, WorkerSupervisor};

use super::audio::{self, TempAudioFile, MIN_DURATION_MS};
use super::errors::SessionError;
use super::state_manager::{SessionEvent, SessionState, SessionStateManager};
use crate::config::Config;
use crate::models::{check_readiness, ArtifactFetcher};
use crate::provisioning::CoordinatorHandle;
use crate::runtime::{RuntimeBootstrapper, RuntimeUnavailable};

/// On-disk paths of a model whose artifacts are all in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedModel {
    pub variant_id: String,
    pub model_path: PathBuf,
    pub tokenizer_path: Option<PathBuf>,
}

pub trait ModelLocator: Send + Sync + 'static {
    /// The selected model if ready, otherwise why not.
    fn locate_ready_model(&self) -> Result<ResolvedModel, String>;
}

pub trait RuntimeLocator: Send + Sync + 'static {
    fn resolve_executable(&self) -> Result<PathBuf, RuntimeUnavailable>;
}

pub trait SetupTrigger: Send + Sync + 'static {
    fn request_setup(&self, force_model_retry: bool, force_runtime_repair: bool, reason: &str);
}

impl ModelLocator for ArtifactFetcher {
    fn locate_ready_model(&self) -> Result<ResolvedModel, String> {
        let variant = self.selected_variant();
        let source = self
            .current_source(&variant)
            .ok_or_else(|| format!("no source configured for '{}'", variant.id))?;
        if self.is_downloading(&variant.id) {
            return Err(format!("'{}' is downloading", variant.id));
        }

        let layout = self.layout(&variant, &source);
        let verdict = check_readiness(&variant, &source, &layout);
        if !verdict.is_ready() {
            return Err(verdict.to_string());
        }
        Ok(ResolvedModel {
            variant_id: variant.id,
            tokenizer_path: layout.resolve_tokenizer(),
            model_path: layout.primary,
        })
    }
}

impl RuntimeLocator for RuntimeBootstrapper {
    fn resolve_executable(&self) -> Result<PathBuf, RuntimeUnavailable> {
        RuntimeBootstrapper::resolve_executable(self)
    }
}

impl SetupTrigger for CoordinatorHandle {
    fn request_setup(&self, force_model_retry: bool, force_runtime_repair: bool, reason: &str) {
        self.ensure_automatic_setup(force_model_retry, force_runtime_repair, reason);
    }
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Inference script handed to the runtime interpreter
    pub worker_script: PathBuf,
    /// Where temporary WAV files are written
    pub temp_dir: PathBuf,
    /// Validate with a persistent-worker ping instead of a one-shot `--check`
    pub validate_with_warmup: bool,
}

/// Collaborators a session depends on.
pub struct SessionDeps {
    pub config: Config,
    pub models: Arc<dyn ModelLocator>,
    pub runtime: Arc<dyn RuntimeLocator>,
    pub setup: Arc<dyn SetupTrigger>,
    pub supervisor: Arc<WorkerSupervisor>,
}

/// One dictation session at a time against the local model.
///
/// `begin_session` fails fast while the model or runtime is still being
/// provisioned, so callers never block on a multi-minute setup.
#[derive(Clone)]
pub struct LocalInferenceSession {
    inner: Arc<Inner>,
}

struct Inner {
    deps: SessionDeps,
    settings: SessionSettings,
    state: SessionStateManager,
    samples: Mutex<Vec<f32>>,
    identity: Mutex<Option<WorkerIdentity>>,
    /// Model paths that passed validation
    validated: Mutex<HashSet<PathBuf>>,
}

impl LocalInferenceSession {
    pub fn new(deps: SessionDeps, settings: SessionSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                deps,
                settings,
                state: SessionStateManager::new(),
                samples: Mutex::new(Vec::new()),
                identity: Mutex::new(None),
                validated: Mutex::new(HashSet::new()),
            }),
        }
    }

    pub fn state(&self) -> SessionState {
        self.inner.state.current()
    }

    /// Open a session: resolve and validate model and runtime.
    pub async fn begin_session(&self) -> Result<(), SessionError> {
        if !self.inner.deps.config.local_provider_selected() {
            return Err(SessionError::ProviderInactive);
        }
        self.inner
            .state
            .transition(SessionEvent::Begin)
            .map_err(SessionError::Busy)?;

        let inner = self.inner.clone();
        let prepared = tokio::task::spawn_blocking(move || inner.prepare())
            .await
            .unwrap_or_else(|e| Err(SessionError::Task(e.to_string())));

        match prepared {
            Ok(identity) => {
                *self.inner.identity.lock().unwrap() = Some(identity);
                self.inner.samples.lock().unwrap().clear();
                self.advance(SessionEvent::Validated);
                debug!("Local session active");
                Ok(())
            }
            Err(e) => {
                self.settle_failure(&e);
                Err(e)
            }
        }
    }

    /// Append captured mono 16kHz samples.
    pub fn feed_audio(&self, samples: &[f32]) -> Result<(), SessionError> {
        let state = self.inner.state.current();
        if state != SessionState::Active {
            return Err(SessionError::NotActive(state));
        }
        self.inner.samples.lock().unwrap().extend_from_slice(samples);
        Ok(())
    }

    /// Close the session and transcribe what was captured.
    pub async fn end_session(&self) -> Result<String, SessionError> {
        let state = self.inner.state.current();
        if state != SessionState::Active {
            return Err(SessionError::NotActive(state));
        }
        let samples = std::mem::take(&mut *self.inner.samples.lock().unwrap());

        if samples.is_empty() {
            self.advance(SessionEvent::Cancel);
            return Err(SessionError::NoAudio);
        }
        let duration_ms = audio::duration_ms(samples.len());
        if duration_ms < MIN_DURATION_MS {
            self.advance(SessionEvent::Cancel);
            return Err(SessionError::TooShort { duration_ms });
        }

        self.inner
            .state
            .transition(SessionEvent::End)
            .map_err(|rejection| SessionError::NotActive(rejection.current_state))?;

        let Some(identity) = self.inner.identity.lock().unwrap().clone() else {
            let err = SessionError::Task("session has no worker identity".to_string());
            self.settle_failure(&err);
            return Err(err);
        };

        info!("Transcribing {}ms of audio locally", duration_ms);
        let inner = self.inner.clone();
        let result = tokio::task::spawn_blocking(move || inner.infer(&identity, &samples))
            .await
            .unwrap_or_else(|e| Err(SessionError::Task(e.to_string())));

        match result {
            Ok(text) => {
                self.advance(SessionEvent::Finished);
                Ok(text)
            }
            Err(e) => {
                self.settle_failure(&e);
                Err(e)
            }
        }
    }

    /// Abandon the current session without inference.
    pub fn cancel(&self) -> Result<(), SessionError> {
        self.inner.samples.lock().unwrap().clear();
        self.inner
            .state
            .transition(SessionEvent::Cancel)
            .map(|_| ())
            .map_err(|rejection| SessionError::NotActive(rejection.current_state))
    }

    /// Clear the error state after the caller has surfaced it.
    pub fn acknowledge(&self) {
        if let Err(e) = self.inner.state.transition(SessionEvent::Acknowledge) {
            debug!("{}", e);
        }
    }

    fn advance(&self, event: SessionEvent) {
        if let Err(e) = self.inner.state.transition(event) {
            warn!("{}", e);
        }
    }

    /// Setup-in-progress conditions go back to idle, everything else to error.
    fn settle_failure(&self, err: &SessionError) {
        let recoverable = matches!(
            err,
            SessionError::ModelSetupInProgress(_)
                | SessionError::RuntimeSetupInProgress
                | SessionError::RuntimeUnavailable(_)
        );
        if recoverable && self.inner.state.current() == SessionState::Validating {
            self.advance(SessionEvent::Cancel);
        } else {
            warn!("Local session failed: {}", err);
            self.advance(SessionEvent::Fail);
        }
    }
}

impl Inner {
    fn prepare(&self) -> Result<WorkerIdentity, SessionError> {
        let model = match self.deps.models.locate_ready_model() {
            Ok(model) => model,
            Err(reason) => {
                info!("Model not ready ({}), requesting setup", reason);
                self.deps.setup.request_setup(false, false, "model not ready");
                return Err(SessionError::ModelSetupInProgress(reason));
            }
        };

        let executable = match self.deps.runtime.resolve_executable() {
            Ok(executable) => executable,
            Err(RuntimeUnavailable::InProgress) => return Err(SessionError::RuntimeSetupInProgress),
            Err(RuntimeUnavailable::Missing(reason)) => {
                warn!("Runtime unavailable ({}), requesting repair", reason);
                self.deps
                    .setup
                    .request_setup(false, true, "runtime unavailable");
                return Err(SessionError::RuntimeUnavailable(reason));
            }
        };

        let identity = WorkerIdentity::new(
            executable,
            &self.settings.worker_script,
            &model.model_path,
            model.tokenizer_path.clone(),
        );

        if self.validated.lock().unwrap().contains(&model.model_path) {
            return Ok(identity);
        }

        info!("Validating model '{}'", model.variant_id);
        let supervisor = &self.deps.supervisor;
        let validation = if self.settings.validate_with_warmup {
            supervisor.warmup(&identity)
        } else {
            supervisor.check(&identity)
        };
        match validation {
            Ok(()) => {
                self.validated.lock().unwrap().insert(model.model_path);
                Ok(identity)
            }
            Err(e) => {
                let err = SessionError::ValidationFailed(e);
                if err.is_drift() {
                    self.handle_drift(&err);
                }
                Err(err)
            }
        }
    }

    fn infer(&self, identity: &WorkerIdentity, samples: &[f32]) -> Result<String, SessionError> {
        let file = TempAudioFile::create(&self.settings.temp_dir, samples)?;
        let result = self
            .deps
            .supervisor
            .transcribe(identity, file.path())
            .map(|text| text.trim().to_string())
            .map_err(SessionError::from_worker);

        if let Err(err) = &result {
            if err.is_drift() {
                self.handle_drift(err);
            }
        }
        result
    }

    /// Forget everything validated so the next session starts clean.
    fn handle_drift(&self, err: &SessionError) {
        warn!("Runtime drift detected: {}", err);
        self.deps.supervisor.invalidate();
        self.validated.lock().unwrap().clear();
        self.deps
            .setup
            .request_setup(false, true, "runtime drift detected");
    }
}
