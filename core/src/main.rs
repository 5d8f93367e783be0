use std::error::Error;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::{Duration, Instant};

use clap::Parser;
use log::{error, info, warn};
use visperflow_lib::config::Provider;
use visperflow_lib::models::FetchEvent;
use visperflow_lib::runtime::RuntimePhase;
use visperflow_lib::session::{audio, ModelLocator};
use visperflow_lib::{AppPaths, Services};

const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Operator entry point for the local transcription stack.
#[derive(Parser, Debug)]
#[command(
    name = "visperflow-setup",
    about = "Provision the local transcription model and runtime",
    version
)]
struct Cli {
    /// Application support directory (defaults to the platform data dir)
    #[arg(long)]
    root: Option<PathBuf>,
    /// Make the local model the active provider first
    #[arg(long)]
    local: bool,
    /// Discard partial downloads and fetch the model again
    #[arg(long)]
    retry_model: bool,
    /// Rebuild the Python runtime from scratch
    #[arg(long)]
    repair: bool,
    /// Give up waiting for setup after this many seconds
    #[arg(long, default_value_t = 1800)]
    wait_secs: u64,
    /// Transcribe a 16kHz mono WAV file once setup is done
    #[arg(long, value_name = "WAV")]
    transcribe: Option<PathBuf>,
    /// Print provisioning telemetry and exit
    #[arg(long)]
    telemetry: bool,
    /// List catalog models with their status and exit
    #[arg(long)]
    list: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    visperflow_lib::log::init();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    let paths = match &cli.root {
        Some(root) => AppPaths::new(root.clone()),
        None => AppPaths::from_system()?,
    };
    let services = Services::start(paths)?;

    let result = if cli.telemetry {
        print_json(&services.telemetry.snapshot())
    } else if cli.list {
        print_json(&services.fetcher.list_models())
    } else {
        provision(&services, &cli).await
    };

    services.shutdown().await;
    result
}

async fn provision(services: &Services, cli: &Cli) -> Result<(), Box<dyn Error>> {
    if cli.local {
        services.config.set_active_provider(Provider::Local)?;
    }
    if !services.config.local_provider_selected() {
        return Err("local provider is not active (pass --local to select it)".into());
    }

    services
        .coordinator
        .ensure_automatic_setup(cli.retry_model, cli.repair, "visperflow-setup");
    wait_for_setup(services, Duration::from_secs(cli.wait_secs)).await?;

    if let Some(wav) = &cli.transcribe {
        transcribe(services, wav).await?;
    }
    Ok(())
}

async fn wait_for_setup(services: &Services, timeout: Duration) -> Result<(), Box<dyn Error>> {
    let deadline = Instant::now() + timeout;
    let mut events = services.fetcher.subscribe();
    let mut last_logged = -1i64;

    loop {
        while let Ok(event) = events.try_recv() {
            match event {
                FetchEvent::Progress { fraction, .. } => {
                    let percent = (fraction * 100.0) as i64;
                    if percent / 10 != last_logged / 10 {
                        info!("Model download {}%", percent);
                        last_logged = percent;
                    }
                }
                FetchEvent::SourceSwitched { from, to, .. } => {
                    info!("Switched download source from '{}' to '{}'", from, to)
                }
                FetchEvent::Failed { error, .. } => warn!("Download attempt failed: {}", error),
                _ => {}
            }
        }

        let model_ready = services.fetcher.locate_ready_model().is_ok();
        let runtime = services.bootstrapper.status();
        if model_ready && runtime.phase == RuntimePhase::Ready {
            info!(
                "Local setup complete (runtime {:?})",
                runtime.executable.unwrap_or_default()
            );
            return Ok(());
        }

        if let Some(snapshot) = services.coordinator.snapshot().await {
            if snapshot.download.exhausted {
                return Err(format!(
                    "model download gave up: {}",
                    snapshot.download.last_error.unwrap_or_default()
                )
                .into());
            }
            if snapshot.bootstrap.exhausted {
                return Err(format!(
                    "runtime setup gave up: {}",
                    snapshot.bootstrap.last_error.unwrap_or_default()
                )
                .into());
            }
        }

        if Instant::now() >= deadline {
            return Err(format!(
                "setup not finished after {}s (model ready: {}, runtime: {})",
                timeout.as_secs(),
                model_ready,
                runtime.phase
            )
            .into());
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

async fn transcribe(services: &Services, wav: &Path) -> Result<(), Box<dyn Error>> {
    let samples = audio::read_wav(wav)?;
    let session = &services.session;

    let result = async {
        session.begin_session().await?;
        session.feed_audio(&samples)?;
        session.end_session().await
    }
    .await;

    match result {
        Ok(text) => {
            println!("{}", text);
            Ok(())
        }
        Err(e) => {
            warn!("{}", e.user_message());
            session.acknowledge();
            Err(e.into())
        }
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), Box<dyn Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
