//! Local inference sessions over a real supervised worker process.
//!
//! Model and runtime resolution are scripted; the worker is a shell script
//! whose behaviour is picked by the contents of the model file.
#![cfg(unix)]

use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::TempDir;
use visperflow_lib::config::{Config, Provider};
use visperflow_lib::runtime::RuntimeUnavailable;
use visperflow_lib::session::{
    LocalInferenceSession, ModelLocator, ResolvedModel, RuntimeLocator, SessionDeps,
    SessionError, SessionSettings, SessionState, SetupTrigger,
};
use visperflow_worker::{SupervisorConfig, WorkerSupervisor};

const FAKE_WORKER: &str = r#"#!/bin/sh
serve=0; check=0; model=""
while [ $# -gt 0 ]; do
  case "$1" in
    --serve) serve=1 ;;
    --check) check=1 ;;
    --model) shift; model="$1" ;;
    --tokenizer) shift ;;
    --audio) shift ;;
  esac
  shift
done
mode=$(cat "$model" 2>/dev/null)
echo "spawn serve=$serve check=$check" >> "$model.events"

if [ "$check" = 1 ]; then
  if [ "$mode" = "dependency" ]; then
    echo "DEPENDENCY_MISSING: Python package 'numpy' is required" >&2
    exit 2
  fi
  echo ok
  exit 0
fi

while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed -n 's/.*"id":"\([^"]*\)".*/\1/p')
  case "$line" in
    *'"op":"shutdown"'*)
      printf '{"id":"%s","ok":true}\n' "$id"
      exit 0 ;;
    *'"op":"ping"'*)
      printf '{"id":"%s","ok":true,"text":"pong"}\n' "$id" ;;
    *'"op":"transcribe"'*)
      if [ "$mode" = "dependency" ]; then
        printf '{"id":"%s","ok":false,"error":"DEPENDENCY_MISSING: numpy"}\n' "$id"
        continue
      fi
      printf '{"id":"%s","ok":true,"text":"  hello world  "}\n' "$id" ;;
  esac
done
"#;

struct ScriptedModels(Mutex<Result<ResolvedModel, String>>);

impl ModelLocator for ScriptedModels {
    fn locate_ready_model(&self) -> Result<ResolvedModel, String> {
        self.0.lock().unwrap().clone()
    }
}

struct ScriptedRuntime(Mutex<Result<PathBuf, RuntimeUnavailable>>);

impl RuntimeLocator for ScriptedRuntime {
    fn resolve_executable(&self) -> Result<PathBuf, RuntimeUnavailable> {
        self.0.lock().unwrap().clone()
    }
}

#[derive(Default)]
struct RecordingSetup(Mutex<Vec<(bool, bool, String)>>);

impl SetupTrigger for RecordingSetup {
    fn request_setup(&self, force_model_retry: bool, force_runtime_repair: bool, reason: &str) {
        self.0
            .lock()
            .unwrap()
            .push((force_model_retry, force_runtime_repair, reason.to_string()));
    }
}

impl RecordingSetup {
    fn calls(&self) -> Vec<(bool, bool, String)> {
        self.0.lock().unwrap().clone()
    }
}

struct Harness {
    dir: TempDir,
    config: Config,
    models: Arc<ScriptedModels>,
    runtime: Arc<ScriptedRuntime>,
    setup: Arc<RecordingSetup>,
    supervisor: Arc<WorkerSupervisor>,
    session: LocalInferenceSession,
}

impl Harness {
    fn new(mode: &str, validate_with_warmup: bool) -> Self {
        let dir = TempDir::new().expect("tempdir");
        let script = dir.path().join("fake_worker.sh");
        fs::write(&script, FAKE_WORKER).expect("worker script");
        let model_path = dir.path().join("model.onnx");
        fs::write(&model_path, mode).expect("model file");

        let config = Config::open(dir.path().join("config.json"));
        config.set_active_provider(Provider::Local).expect("provider");

        let models = Arc::new(ScriptedModels(Mutex::new(Ok(ResolvedModel {
            variant_id: "tiny-ctc".into(),
            model_path,
            tokenizer_path: None,
        }))));
        let runtime = Arc::new(ScriptedRuntime(Mutex::new(Ok(PathBuf::from("/bin/sh")))));
        let setup = Arc::new(RecordingSetup::default());
        let supervisor = Arc::new(WorkerSupervisor::new(SupervisorConfig {
            warmup_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(1),
            one_shot_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(10),
            grace: Duration::from_millis(300),
        }));

        let session = LocalInferenceSession::new(
            SessionDeps {
                config: config.clone(),
                models: models.clone(),
                runtime: runtime.clone(),
                setup: setup.clone(),
                supervisor: supervisor.clone(),
            },
            SessionSettings {
                worker_script: script,
                temp_dir: dir.path().join("audio"),
                validate_with_warmup,
            },
        );

        Self {
            dir,
            config,
            models,
            runtime,
            setup,
            supervisor,
            session,
        }
    }

    fn leftover_audio(&self) -> usize {
        fs::read_dir(self.dir.path().join("audio"))
            .map(|entries| entries.count())
            .unwrap_or(0)
    }
}

fn one_second() -> Vec<f32> {
    (0..16_000).map(|i| ((i as f32) / 40.0).sin() * 0.3).collect()
}

#[tokio::test]
async fn dictation_round_trip_reuses_the_worker() {
    let h = Harness::new("ok", true);

    h.session.begin_session().await.expect("begin");
    assert_eq!(h.session.state(), SessionState::Active);
    h.session.feed_audio(&one_second()).expect("feed");
    let text = h.session.end_session().await.expect("transcribe");

    assert_eq!(text, "hello world");
    assert_eq!(h.session.state(), SessionState::Idle);
    assert_eq!(h.supervisor.spawn_count(), 1);
    assert_eq!(h.leftover_audio(), 0);

    h.session.begin_session().await.expect("second begin");
    h.session.feed_audio(&one_second()[..8_000]).expect("feed");
    assert_eq!(h.session.end_session().await.expect("second"), "hello world");
    assert_eq!(h.supervisor.spawn_count(), 1);
    assert!(h.setup.calls().is_empty());
}

#[tokio::test]
async fn one_shot_check_validates_the_model() {
    let h = Harness::new("ok", false);

    h.session.begin_session().await.expect("begin");
    h.session.feed_audio(&one_second()).expect("feed");
    assert_eq!(h.session.end_session().await.expect("text"), "hello world");
}

#[tokio::test]
async fn inactive_provider_is_rejected() {
    let h = Harness::new("ok", true);
    h.config
        .set_active_provider(Provider::OpenAI)
        .expect("provider");

    let err = h.session.begin_session().await.unwrap_err();

    assert!(matches!(err, SessionError::ProviderInactive));
    assert_eq!(h.session.state(), SessionState::Idle);
    assert_eq!(h.supervisor.spawn_count(), 0);
}

#[tokio::test]
async fn missing_model_requests_setup_and_stays_idle() {
    let h = Harness::new("ok", true);
    *h.models.0.lock().unwrap() = Err("model.onnx is missing".into());

    let err = h.session.begin_session().await.unwrap_err();

    assert!(matches!(err, SessionError::ModelSetupInProgress(_)), "{}", err);
    assert_eq!(h.session.state(), SessionState::Idle);
    assert_eq!(
        h.setup.calls(),
        vec![(false, false, "model not ready".to_string())]
    );
}

#[tokio::test]
async fn runtime_being_built_fails_fast() {
    let h = Harness::new("ok", true);
    *h.runtime.0.lock().unwrap() = Err(RuntimeUnavailable::InProgress);

    let err = h.session.begin_session().await.unwrap_err();

    assert!(matches!(err, SessionError::RuntimeSetupInProgress));
    assert_eq!(h.session.state(), SessionState::Idle);
    assert!(h.setup.calls().is_empty());
}

#[tokio::test]
async fn missing_runtime_requests_repair() {
    let h = Harness::new("ok", true);
    *h.runtime.0.lock().unwrap() = Err(RuntimeUnavailable::Missing("not set up".into()));

    let err = h.session.begin_session().await.unwrap_err();

    assert!(matches!(err, SessionError::RuntimeUnavailable(_)));
    assert_eq!(h.session.state(), SessionState::Idle);
    assert_eq!(
        h.setup.calls(),
        vec![(false, true, "runtime unavailable".to_string())]
    );
}

#[tokio::test]
async fn short_or_empty_recordings_are_discarded() {
    let h = Harness::new("ok", true);

    h.session.begin_session().await.expect("begin");
    let err = h.session.end_session().await.unwrap_err();
    assert!(matches!(err, SessionError::NoAudio));
    assert_eq!(h.session.state(), SessionState::Idle);

    h.session.begin_session().await.expect("begin");
    h.session.feed_audio(&one_second()[..4_000]).expect("feed");
    let err = h.session.end_session().await.unwrap_err();
    assert!(matches!(err, SessionError::TooShort { duration_ms: 250 }), "{}", err);
    assert_eq!(h.session.state(), SessionState::Idle);
}

#[tokio::test]
async fn calls_out_of_order_are_rejected() {
    let h = Harness::new("ok", true);

    assert!(matches!(
        h.session.feed_audio(&one_second()),
        Err(SessionError::NotActive(SessionState::Idle))
    ));
    assert!(matches!(
        h.session.end_session().await,
        Err(SessionError::NotActive(SessionState::Idle))
    ));

    h.session.begin_session().await.expect("begin");
    assert!(matches!(
        h.session.begin_session().await,
        Err(SessionError::Busy(_))
    ));
    assert_eq!(h.session.state(), SessionState::Active);

    h.session.feed_audio(&one_second()).expect("feed");
    h.session.cancel().expect("cancel");
    assert_eq!(h.session.state(), SessionState::Idle);
    assert!(matches!(
        h.session.end_session().await,
        Err(SessionError::NotActive(SessionState::Idle))
    ));
}

#[tokio::test]
async fn dependency_drift_during_inference_triggers_repair() {
    let h = Harness::new("dependency", true);

    h.session.begin_session().await.expect("warmup only pings");
    h.session.feed_audio(&one_second()).expect("feed");
    let err = h.session.end_session().await.unwrap_err();

    assert!(err.is_drift(), "{}", err);
    assert!(matches!(err, SessionError::Drift(_)));
    assert_eq!(h.session.state(), SessionState::Error);
    assert_eq!(h.supervisor.worker_pid(), None);
    assert_eq!(
        h.setup.calls(),
        vec![(false, true, "runtime drift detected".to_string())]
    );

    // Error needs an explicit acknowledge before the next session
    assert!(matches!(
        h.session.begin_session().await,
        Err(SessionError::Busy(_))
    ));
    h.session.acknowledge();
    assert_eq!(h.session.state(), SessionState::Idle);
}

#[tokio::test]
async fn failed_check_puts_session_in_error() {
    let h = Harness::new("dependency", false);

    let err = h.session.begin_session().await.unwrap_err();

    assert!(matches!(err, SessionError::ValidationFailed(_)), "{}", err);
    assert!(err.is_drift());
    assert_eq!(h.session.state(), SessionState::Error);
    assert_eq!(
        h.setup.calls(),
        vec![(false, true, "runtime drift detected".to_string())]
    );
}
