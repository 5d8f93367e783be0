use std::sync::Arc;

use log::{debug, info};
use tokio::task::JoinHandle;
use visperflow_worker::{SupervisorConfig, WorkerSupervisor};

use crate::config::Config;
use crate::error::Error;
use crate::models::{ArtifactFetcher, FetchSettings, SourceCatalog};
use crate::paths::AppPaths;
use crate::provisioning::{CoordinatorDeps, CoordinatorHandle, ProvisioningCoordinator};
use crate::runtime::{BootstrapConfig, RuntimeBootstrapper};
use crate::session::{LocalInferenceSession, SessionDeps, SessionSettings};
use crate::telemetry::Telemetry;

/// Every long-lived service, constructed once and shared by handle.
pub struct Services {
    pub paths: AppPaths,
    pub config: Config,
    pub telemetry: Telemetry,
    pub fetcher: ArtifactFetcher,
    pub bootstrapper: RuntimeBootstrapper,
    pub supervisor: Arc<WorkerSupervisor>,
    pub coordinator: CoordinatorHandle,
    pub session: LocalInferenceSession,
    coordinator_task: JoinHandle<()>,
}

impl Services {
    /// Build and wire all services. Must run inside a tokio runtime.
    pub fn start(paths: AppPaths) -> Result<Self, Error> {
        info!("Visperflow v{}", env!("CARGO_PKG_VERSION"));
        paths.ensure_dirs()?;

        let config = Config::open(paths.config_file());
        let telemetry = Telemetry::new(config.clone());
        let local = config.local_model();

        let fetcher = ArtifactFetcher::new(
            paths.clone(),
            SourceCatalog::builtin(),
            FetchSettings::default(),
            config.clone(),
            telemetry.clone(),
        )?;

        let bootstrap_config = BootstrapConfig {
            python_override: local.python_override.clone(),
            ..BootstrapConfig::default()
        }
        .with_override_from_env();
        let bootstrapper = RuntimeBootstrapper::new(paths.clone(), bootstrap_config);
        debug!("Runtime root: {:?}", bootstrapper.runtime_root());

        let supervisor = Arc::new(WorkerSupervisor::new(SupervisorConfig::default()));

        let (coordinator, coordinator_task) = ProvisioningCoordinator::spawn(CoordinatorDeps::new(
            config.clone(),
            telemetry.clone(),
            Arc::new(fetcher.clone()),
            Arc::new(bootstrapper.clone()),
        ));

        let worker_script = local
            .worker_script
            .unwrap_or_else(|| paths.default_worker_script());
        let session = LocalInferenceSession::new(
            SessionDeps {
                config: config.clone(),
                models: Arc::new(fetcher.clone()),
                runtime: Arc::new(bootstrapper.clone()),
                setup: Arc::new(coordinator.clone()),
                supervisor: supervisor.clone(),
            },
            SessionSettings {
                worker_script,
                temp_dir: std::env::temp_dir().join("visperflow"),
                validate_with_warmup: true,
            },
        );

        Ok(Self {
            paths,
            config,
            telemetry,
            fetcher,
            bootstrapper,
            supervisor,
            coordinator,
            session,
            coordinator_task,
        })
    }

    /// Stop the coordinator, abort downloads and shut the worker down.
    pub async fn shutdown(self) {
        self.coordinator.shutdown();
        let _ = self.coordinator_task.await;
        self.fetcher.shutdown();

        let supervisor = self.supervisor.clone();
        let _ = tokio::task::spawn_blocking(move || supervisor.invalidate()).await;
        info!("Services stopped");
    }
}
