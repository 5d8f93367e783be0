use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;

use super::catalog::{default_variant, find_variant, get_model_catalog, ModelVariant};
use super::events::FetchEvent;
use super::sources::{RemoteArtifact, ResolvedSource, SourceCatalog};
use super::status::{
    check_readiness, partial_bytes, partial_path, ArtifactLayout, ModelStatus, Readiness,
};
use super::transfer::{self, ResumeToken, TransportKind};
use super::verify::{validate_file, Expectation};
use super::ModelInfo;
use crate::config::Config;
use crate::paths::AppPaths;
use crate::telemetry::{RetryLevel, Telemetry};

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("Download failed: {detail}")]
    Transport { kind: TransportKind, detail: String },
    #[error("Download failed with status {status}: {url}")]
    HttpStatus { status: u16, url: String },
    #[error("{file} is too small ({actual} bytes, expected at least {minimum})")]
    TooSmall {
        file: String,
        actual: u64,
        minimum: u64,
    },
    #[error("{file} size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        file: String,
        expected: u64,
        actual: u64,
    },
    #[error("Checksum mismatch for {file}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        file: String,
        expected: String,
        actual: String,
    },
    #[error("Model incomplete after download: {0}")]
    MissingArtifact(String),
    #[error("Source '{source_id}' cannot be used: {reason}")]
    SourceConfig { source_id: String, reason: String },
    #[error("Model '{0}' not found in catalog")]
    UnknownVariant(String),
    #[error("Model '{0}' is already being downloaded")]
    AlreadyDownloading(String),
    #[error("No active download for model '{0}'")]
    NotDownloading(String),
    #[error("Download cancelled")]
    Cancelled,
    #[error("Failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("Filesystem error: {0}")]
    Io(#[from] std::io::Error),
}

/// Stable failure category, used as a telemetry key and in events.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FetchFailureCategory {
    Transport,
    NotFound,
    Http,
    Integrity,
    SourceConfig,
    Cancelled,
    Busy,
    Filesystem,
}

impl FetchError {
    pub(crate) fn transport(err: &reqwest::Error) -> Self {
        FetchError::Transport {
            kind: TransportKind::classify(err),
            detail: err.to_string(),
        }
    }

    pub fn category(&self) -> FetchFailureCategory {
        match self {
            FetchError::Transport { .. } | FetchError::Client(_) => FetchFailureCategory::Transport,
            FetchError::HttpStatus { status: 404, .. } => FetchFailureCategory::NotFound,
            FetchError::HttpStatus { .. } => FetchFailureCategory::Http,
            FetchError::TooSmall { .. }
            | FetchError::SizeMismatch { .. }
            | FetchError::ChecksumMismatch { .. }
            | FetchError::MissingArtifact(_) => FetchFailureCategory::Integrity,
            FetchError::SourceConfig { .. } | FetchError::UnknownVariant(_) => {
                FetchFailureCategory::SourceConfig
            }
            FetchError::AlreadyDownloading(_) | FetchError::NotDownloading(_) => {
                FetchFailureCategory::Busy
            }
            FetchError::Cancelled => FetchFailureCategory::Cancelled,
            FetchError::Io(_) => FetchFailureCategory::Filesystem,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, FetchError::HttpStatus { status: 404, .. })
    }

    /// Worth another attempt inside the same fetch.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::Transport { kind, .. } if kind.is_retryable())
    }
}

/// Tunables for the fetcher.
#[derive(Debug, Clone)]
pub struct FetchSettings {
    /// Extra attempts for the primary artifact after a retryable failure
    pub transport_retries: u32,
    /// Extra attempts for each secondary artifact
    pub auxiliary_retries: u32,
    /// Pause before a transport-level retry
    pub retry_delay: Duration,
    pub connect_timeout: Duration,
    /// Minimum spacing of progress events
    pub progress_interval: Duration,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            transport_retries: 2,
            auxiliary_retries: 2,
            retry_delay: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(30),
            progress_interval: Duration::from_millis(100),
        }
    }
}

/// What a finished fetch went through.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchReport {
    pub variant_id: String,
    pub source_id: String,
    pub attempted_source_ids: BTreeSet<String>,
    pub transport_retries: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ResumeKey {
    variant_id: String,
    source_id: String,
    url: String,
}

/// Shared-map entry for an in-flight fetch.
struct ActiveTransfer {
    generation: u64,
    cancel: CancellationToken,
    /// Cancelled once the fetch has unregistered
    done: CancellationToken,
    task: Option<AbortHandle>,
}

#[derive(Default)]
struct FetcherState {
    active: HashMap<String, ActiveTransfer>,
    resume_tokens: HashMap<ResumeKey, ResumeToken>,
    next_generation: u64,
}

/// Per-fetch bookkeeping, owned by the running fetch.
struct DownloadContext {
    variant: ModelVariant,
    source: ResolvedSource,
    cancel: CancellationToken,
    retry_count: u32,
    attempted_source_ids: BTreeSet<String>,
    completed_bytes: u64,
    last_progress: f64,
}

impl DownloadContext {
    fn new(variant: ModelVariant, source: ResolvedSource, cancel: CancellationToken) -> Self {
        let mut attempted_source_ids = BTreeSet::new();
        attempted_source_ids.insert(source.source_id.clone());
        Self {
            variant,
            source,
            cancel,
            retry_count: 0,
            attempted_source_ids,
            completed_bytes: 0,
            last_progress: 0.0,
        }
    }

    fn switch_source(&mut self, source: ResolvedSource) {
        self.attempted_source_ids.insert(source.source_id.clone());
        self.source = source;
        self.completed_bytes = 0;
    }

    fn report(&self) -> FetchReport {
        FetchReport {
            variant_id: self.variant.id.clone(),
            source_id: self.source.source_id.clone(),
            attempted_source_ids: self.attempted_source_ids.clone(),
            transport_retries: self.retry_count,
        }
    }
}

struct ProgressReporter<'a> {
    events: &'a broadcast::Sender<FetchEvent>,
    variant_id: &'a str,
    base: u64,
    total: u64,
    interval: Duration,
    last_emit: Option<Instant>,
    fraction: f64,
}

impl ProgressReporter<'_> {
    fn report(&mut self, written: u64) {
        self.fraction = ((self.base + written) as f64 / self.total.max(1) as f64).clamp(0.0, 1.0);

        // Throttled to avoid flooding subscribers
        if self.last_emit.is_some_and(|at| at.elapsed() < self.interval) {
            return;
        }
        self.last_emit = Some(Instant::now());
        let _ = self.events.send(FetchEvent::Progress {
            variant_id: self.variant_id.to_string(),
            fraction: self.fraction,
        });
    }
}

struct Inner {
    paths: AppPaths,
    sources: SourceCatalog,
    settings: FetchSettings,
    client: reqwest::Client,
    config: Config,
    telemetry: Telemetry,
    state: Mutex<FetcherState>,
    events: broadcast::Sender<FetchEvent>,
}

/// Downloads, validates, and places model artifacts.
///
/// At most one fetch runs per variant. Resume tokens survive failed and
/// cancelled attempts for the lifetime of the fetcher.
#[derive(Clone)]
pub struct ArtifactFetcher {
    inner: Arc<Inner>,
}

impl ArtifactFetcher {
    pub fn new(
        paths: AppPaths,
        sources: SourceCatalog,
        settings: FetchSettings,
        config: Config,
        telemetry: Telemetry,
    ) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .connect_timeout(settings.connect_timeout)
            .build()
            .map_err(FetchError::Client)?;
        let (events, _) = broadcast::channel(256);

        info!("Models directory: {:?}", paths.models_dir());

        Ok(Self {
            inner: Arc::new(Inner {
                paths,
                sources,
                settings,
                client,
                config,
                telemetry,
                state: Mutex::new(FetcherState::default()),
                events,
            }),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FetchEvent> {
        self.inner.events.subscribe()
    }

    pub fn sources(&self) -> &SourceCatalog {
        &self.inner.sources
    }

    /// Variant selected in config, or the catalog default.
    pub fn selected_variant(&self) -> ModelVariant {
        self.inner
            .config
            .local_model()
            .selected_model
            .and_then(|id| find_variant(&id))
            .unwrap_or_else(default_variant)
    }

    /// Source persisted for the variant, or the recommended one.
    pub fn current_source(&self, variant: &ModelVariant) -> Option<ResolvedSource> {
        let source_id = self.inner.config.local_model().source_id;
        self.inner.sources.resolve(variant, source_id.as_deref())
    }

    /// Persist the recommended source as the selection and return it.
    pub fn pin_recommended_source(&self, variant: &ModelVariant) -> Option<ResolvedSource> {
        let source = self.inner.sources.recommended(variant)?;
        let current = self.inner.config.local_model().source_id;
        if current.as_deref() != Some(source.source_id.as_str()) {
            info!(
                "Pinning model source to '{}' (was {:?})",
                source.source_id, current
            );
            self.persist_source(&source.source_id);
        }
        Some(source)
    }

    pub fn layout(&self, variant: &ModelVariant, source: &ResolvedSource) -> ArtifactLayout {
        ArtifactLayout::new(&self.inner.paths, variant, source)
    }

    /// Filesystem-only readiness check.
    pub fn is_ready(&self, variant: &ModelVariant, source: &ResolvedSource) -> bool {
        check_readiness(variant, source, &self.layout(variant, source)).is_ready()
    }

    pub fn is_downloading(&self, variant_id: &str) -> bool {
        self.inner.state.lock().unwrap().active.contains_key(variant_id)
    }

    pub fn model_status(&self, variant: &ModelVariant, source: &ResolvedSource) -> ModelStatus {
        let layout = self.layout(variant, source);
        ModelStatus {
            is_ready: check_readiness(variant, source, &layout).is_ready(),
            is_downloading: self.is_downloading(&variant.id),
            downloaded_bytes: partial_bytes(&layout),
        }
    }

    /// Get all models with their current status.
    pub fn list_models(&self) -> Vec<ModelInfo> {
        get_model_catalog()
            .iter()
            .filter_map(|variant| {
                let source = self.current_source(variant)?;
                let status = self.model_status(variant, &source);
                Some(ModelInfo::from_catalog_and_status(variant, &source, &status))
            })
            .collect()
    }

    /// Fetch every artifact of `variant` and wait for the outcome.
    pub async fn fetch(
        &self,
        variant: &ModelVariant,
        source: ResolvedSource,
    ) -> Result<FetchReport, FetchError> {
        let (_, cancel, done) = self.register(&variant.id)?;
        self.run_registered(variant.clone(), source, cancel, done)
            .await
    }

    /// Start a background fetch. Returns false if one is already running.
    pub fn spawn_fetch(&self, variant: ModelVariant, source: ResolvedSource) -> bool {
        let (generation, cancel, done) = match self.register(&variant.id) {
            Ok(registered) => registered,
            Err(e) => {
                debug!("{}", e);
                return false;
            }
        };

        let variant_id = variant.id.clone();
        let this = self.clone();
        let handle = tokio::spawn(async move {
            let _ = this.run_registered(variant, source, cancel, done).await;
        });

        let mut state = self.inner.state.lock().unwrap();
        if let Some(active) = state.active.get_mut(&variant_id) {
            if active.generation == generation {
                active.task = Some(handle.abort_handle());
            }
        }
        true
    }

    /// Cancel an ongoing download.
    pub fn cancel(&self, variant_id: &str) -> Result<(), FetchError> {
        let state = self.inner.state.lock().unwrap();
        match state.active.get(variant_id) {
            Some(active) => {
                active.cancel.cancel();
                info!("Cancellation requested for model '{}'", variant_id);
                Ok(())
            }
            None => Err(FetchError::NotDownloading(variant_id.to_string())),
        }
    }

    /// Stop any fetch for the variant and forget its resumable state.
    pub async fn reset(&self, variant_id: &str) {
        let running = {
            let state = self.inner.state.lock().unwrap();
            state
                .active
                .get(variant_id)
                .map(|a| (a.cancel.clone(), a.done.clone()))
        };
        if let Some((cancel, done)) = running {
            info!("Resetting in-flight download of '{}'", variant_id);
            cancel.cancel();
            done.cancelled().await;
        }

        self.drop_resume_tokens(variant_id);
        if let Some(variant) = find_variant(variant_id) {
            remove_partials(&self.inner.paths.model_path(&variant)).await;
        }
    }

    /// Delete a downloaded model.
    pub async fn delete_model(&self, variant_id: &str) -> Result<(), FetchError> {
        let variant =
            find_variant(variant_id).ok_or_else(|| FetchError::UnknownVariant(variant_id.into()))?;
        if self.is_downloading(variant_id) {
            return Err(FetchError::AlreadyDownloading(variant_id.to_string()));
        }

        self.drop_resume_tokens(variant_id);
        let primary = self.inner.paths.model_path(&variant);
        match primary.parent() {
            Some(dir) if dir != self.inner.paths.models_dir() && dir.exists() => {
                tokio::fs::remove_dir_all(dir).await?;
                info!("Deleted model directory: {:?}", dir);
            }
            _ => {
                if let Some(source) = self.current_source(&variant) {
                    discard_files(&self.layout(&variant, &source)).await;
                }
                warn!("Model '{}' had no dedicated directory", variant_id);
            }
        }
        Ok(())
    }

    /// Abort every background fetch.
    pub fn shutdown(&self) {
        let state = self.inner.state.lock().unwrap();
        for (variant_id, active) in &state.active {
            debug!("Stopping download of '{}'", variant_id);
            active.cancel.cancel();
            if let Some(task) = &active.task {
                task.abort();
            }
        }
    }

    fn register(
        &self,
        variant_id: &str,
    ) -> Result<(u64, CancellationToken, CancellationToken), FetchError> {
        let mut state = self.inner.state.lock().unwrap();
        if state.active.contains_key(variant_id) {
            return Err(FetchError::AlreadyDownloading(variant_id.to_string()));
        }

        state.next_generation += 1;
        let generation = state.next_generation;
        let cancel = CancellationToken::new();
        let done = CancellationToken::new();
        state.active.insert(
            variant_id.to_string(),
            ActiveTransfer {
                generation,
                cancel: cancel.clone(),
                done: done.clone(),
                task: None,
            },
        );
        Ok((generation, cancel, done))
    }

    fn unregister(&self, variant_id: &str) {
        self.inner.state.lock().unwrap().active.remove(variant_id);
    }

    async fn run_registered(
        &self,
        variant: ModelVariant,
        source: ResolvedSource,
        cancel: CancellationToken,
        done: CancellationToken,
    ) -> Result<FetchReport, FetchError> {
        let variant_id = variant.id.clone();
        let mut ctx = DownloadContext::new(variant, source, cancel);

        info!(
            "Starting download of model '{}' from '{}'",
            variant_id, ctx.source.source_id
        );
        self.emit(FetchEvent::Started {
            variant_id: variant_id.clone(),
            source_id: ctx.source.source_id.clone(),
        });

        let result = match self.run_fetch(&mut ctx).await {
            Err(_) if ctx.cancel.is_cancelled() => Err(FetchError::Cancelled),
            other => other,
        };

        // Unregister first so a subscriber reacting to the terminal event can start over
        self.unregister(&variant_id);
        done.cancel();

        match &result {
            Ok(()) => {
                info!("Download complete: {}", variant_id);
                self.emit(FetchEvent::Complete {
                    variant_id: variant_id.clone(),
                });
            }
            Err(FetchError::Cancelled) => {
                info!(
                    "Download of '{}' cancelled at {:.0}%",
                    variant_id,
                    ctx.last_progress * 100.0
                );
                self.emit(FetchEvent::Cancelled {
                    variant_id: variant_id.clone(),
                });
            }
            Err(e) => {
                error!("Download of '{}' failed: {}", variant_id, e);
                self.emit(FetchEvent::Failed {
                    variant_id: variant_id.clone(),
                    error: e.to_string(),
                    category: e.category(),
                });
            }
        }

        result.map(|()| ctx.report())
    }

    async fn run_fetch(&self, ctx: &mut DownloadContext) -> Result<(), FetchError> {
        if let Some(reason) = &ctx.source.validation_error {
            return Err(FetchError::SourceConfig {
                source_id: ctx.source.source_id.clone(),
                reason: reason.clone(),
            });
        }
        if self.is_ready(&ctx.variant, &ctx.source) {
            info!("Model '{}' already downloaded", ctx.variant.id);
            return Ok(());
        }

        loop {
            match self.fetch_primary(ctx).await {
                Ok(()) => break,
                // Only the first source may hand over, which bounds the walk
                Err(e) if e.is_not_found() && ctx.attempted_source_ids.len() == 1 => {
                    let next = self
                        .inner
                        .sources
                        .next_candidate(&ctx.variant, &ctx.attempted_source_ids);
                    let Some(next) = next else {
                        return Err(e);
                    };
                    warn!(
                        "Model not found on '{}', switching to '{}'",
                        ctx.source.source_id, next.source_id
                    );
                    self.persist_source(&next.source_id);
                    self.emit(FetchEvent::SourceSwitched {
                        variant_id: ctx.variant.id.clone(),
                        from: ctx.source.source_id.clone(),
                        to: next.source_id.clone(),
                    });
                    ctx.switch_source(next);
                }
                Err(e) => return Err(e),
            }
        }

        let layout = self.layout(&ctx.variant, &ctx.source);
        for (artifact, dest) in secondary_artifacts(&ctx.source, &layout) {
            if ctx.cancel.is_cancelled() {
                return Err(FetchError::Cancelled);
            }
            self.fetch_secondary(ctx, &layout, &artifact, &dest).await?;
        }

        self.emit(FetchEvent::Progress {
            variant_id: ctx.variant.id.clone(),
            fraction: 1.0,
        });
        self.emit(FetchEvent::Verifying {
            variant_id: ctx.variant.id.clone(),
        });

        match check_readiness(&ctx.variant, &ctx.source, &layout) {
            Readiness::Ready => Ok(()),
            verdict => {
                discard_files(&layout).await;
                self.drop_resume_tokens(&ctx.variant.id);
                Err(FetchError::MissingArtifact(verdict.to_string()))
            }
        }
    }

    async fn fetch_primary(&self, ctx: &mut DownloadContext) -> Result<(), FetchError> {
        let layout = self.layout(&ctx.variant, &ctx.source);
        let artifact = ctx.source.model.clone();
        let expect = Expectation {
            min_size: ctx.variant.min_valid_size,
            exact_size: artifact.expected_size,
            sha256: artifact.sha256.as_deref(),
        };

        if let Some(parent) = layout.primary.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        if self.already_placed(ctx, &layout.primary, expect).await {
            return Ok(());
        }

        self.transfer_with_retries(
            ctx,
            &artifact,
            &layout.primary,
            self.inner.settings.transport_retries,
        )
        .await?;
        self.place(ctx, &layout, &layout.primary, expect).await
    }

    async fn fetch_secondary(
        &self,
        ctx: &mut DownloadContext,
        layout: &ArtifactLayout,
        artifact: &RemoteArtifact,
        dest: &Path,
    ) -> Result<(), FetchError> {
        let expect = Expectation {
            min_size: 1,
            exact_size: artifact.expected_size,
            sha256: artifact.sha256.as_deref(),
        };
        if self.already_placed(ctx, dest, expect).await {
            return Ok(());
        }

        self.transfer_with_retries(ctx, artifact, dest, self.inner.settings.auxiliary_retries)
            .await?;
        self.place(ctx, layout, dest, expect).await
    }

    async fn already_placed(
        &self,
        ctx: &mut DownloadContext,
        dest: &Path,
        expect: Expectation<'_>,
    ) -> bool {
        let Ok(meta) = tokio::fs::metadata(dest).await else {
            return false;
        };
        match validate_file(dest, &file_label(dest), expect).await {
            Ok(()) => {
                debug!("{:?} already in place, skipping", dest);
                ctx.completed_bytes += meta.len();
                true
            }
            Err(e) => {
                warn!("Replacing invalid {:?}: {}", dest, e);
                false
            }
        }
    }

    /// Validate the `.partial` file, then rename it over the destination.
    async fn place(
        &self,
        ctx: &mut DownloadContext,
        layout: &ArtifactLayout,
        dest: &Path,
        expect: Expectation<'_>,
    ) -> Result<(), FetchError> {
        let partial = partial_path(dest);
        let label = file_label(dest);

        if let Err(e) = validate_file(&partial, &label, expect).await {
            error!("Validation failed for {}: {}", label, e);
            discard_files(layout).await;
            self.drop_resume_tokens(&ctx.variant.id);
            return Err(e);
        }

        let size = tokio::fs::metadata(&partial).await?.len();
        tokio::fs::rename(&partial, dest).await?;
        ctx.completed_bytes += size;
        debug!("Placed {:?} ({} bytes)", dest, size);
        Ok(())
    }

    async fn transfer_with_retries(
        &self,
        ctx: &mut DownloadContext,
        artifact: &RemoteArtifact,
        dest: &Path,
        budget: u32,
    ) -> Result<(), FetchError> {
        let partial = partial_path(dest);
        let label = file_label(dest);
        let key = ResumeKey {
            variant_id: ctx.variant.id.clone(),
            source_id: ctx.source.source_id.clone(),
            url: artifact.url.clone(),
        };
        let mut attempt = 0;

        loop {
            let token = self.take_resume_token(&key);
            let mut reporter = ProgressReporter {
                events: &self.inner.events,
                variant_id: &ctx.variant.id,
                base: ctx.completed_bytes,
                total: ctx.variant.expected_size,
                interval: self.inner.settings.progress_interval,
                last_emit: None,
                fraction: ctx.last_progress,
            };

            debug!("Downloading {} into {:?}", artifact.url, partial);
            let result = transfer::download(
                &self.inner.client,
                &artifact.url,
                &partial,
                token,
                &ctx.cancel,
                |written, _| reporter.report(written),
            )
            .await;
            ctx.last_progress = reporter.fraction;

            let failure = match result {
                Ok(_) => return Ok(()),
                Err(failure) => failure,
            };
            if let Some(token) = failure.resume {
                self.store_resume_token(key.clone(), token);
            }

            // Checked before reporting so a cancel never surfaces as a failure
            if ctx.cancel.is_cancelled() || matches!(failure.error, FetchError::Cancelled) {
                return Err(FetchError::Cancelled);
            }
            if !failure.error.is_retryable() || attempt >= budget {
                return Err(failure.error);
            }

            attempt += 1;
            ctx.retry_count += 1;
            self.inner
                .telemetry
                .record_download_retry(RetryLevel::Transport);
            warn!(
                "Transfer of {} failed ({}), retry {}/{}",
                label, failure.error, attempt, budget
            );

            tokio::select! {
                _ = ctx.cancel.cancelled() => return Err(FetchError::Cancelled),
                _ = tokio::time::sleep(self.inner.settings.retry_delay) => {}
            }
        }
    }

    fn take_resume_token(&self, key: &ResumeKey) -> Option<ResumeToken> {
        self.inner.state.lock().unwrap().resume_tokens.remove(key)
    }

    fn store_resume_token(&self, key: ResumeKey, token: ResumeToken) {
        debug!("Keeping resume point at {} bytes for {}", token.offset, key.url);
        self.inner
            .state
            .lock()
            .unwrap()
            .resume_tokens
            .insert(key, token);
    }

    fn drop_resume_tokens(&self, variant_id: &str) {
        self.inner
            .state
            .lock()
            .unwrap()
            .resume_tokens
            .retain(|key, _| key.variant_id != variant_id);
    }

    fn persist_source(&self, source_id: &str) {
        if let Err(e) = self
            .inner
            .config
            .update_local_model(|local| local.source_id = Some(source_id.to_string()))
        {
            warn!("Failed to persist source selection: {}", e);
        }
    }

    fn emit(&self, event: FetchEvent) {
        // No subscribers is fine
        let _ = self.inner.events.send(event);
    }
}

fn secondary_artifacts(
    source: &ResolvedSource,
    layout: &ArtifactLayout,
) -> Vec<(RemoteArtifact, PathBuf)> {
    let mut artifacts = Vec::new();
    if let (Some(artifact), Some(dest)) = (&source.sidecar, &layout.sidecar) {
        artifacts.push((artifact.clone(), dest.clone()));
    }
    if let (Some(artifact), Some(dest)) = (&source.tokenizer, &layout.tokenizer) {
        artifacts.push((artifact.clone(), dest.clone()));
    }
    artifacts.extend(
        source
            .auxiliary
            .iter()
            .cloned()
            .zip(layout.auxiliary.iter().cloned()),
    );
    artifacts
}

fn file_label(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Remove every artifact of a layout together with its `.partial` sibling.
async fn discard_files(layout: &ArtifactLayout) {
    for path in layout.all() {
        for candidate in [path.to_path_buf(), partial_path(path)] {
            match tokio::fs::remove_file(&candidate).await {
                Ok(()) => debug!("Removed {:?}", candidate),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove {:?}: {}", candidate, e),
            }
        }
    }
    warn!("Discarded artifacts under {:?}", layout.primary.parent());
}

async fn remove_partials(primary: &Path) {
    let Some(dir) = primary.parent() else {
        return;
    };
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "partial") {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                warn!("Failed to remove {:?}: {}", path, e);
            }
        }
    }
}
