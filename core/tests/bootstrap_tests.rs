//! Runtime bootstrapper against a fake interpreter.
//!
//! The fake `python3.11` is a shell script that understands `--version`,
//! `-m venv`, `-m pip install` and `-c`. Its behaviour is switched by
//! marker files in a state directory and every invocation is logged there.
#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tempfile::TempDir;
use visperflow_lib::runtime::{
    default_dependencies, BootstrapConfig, BootstrapError, BootstrapFailureCategory,
    CommandTimeouts, RuntimeBootstrapper, RuntimePhase, RuntimeUnavailable,
};
use visperflow_lib::AppPaths;

const FAKE_PYTHON: &str = r#"#!/bin/sh
STATE='@STATE@'
echo "$0 $*" >> "$STATE/log"
case "$1" in
  --version)
    if [ -f "$STATE/version" ]; then v=$(cat "$STATE/version"); else v=3.11.9; fi
    echo "Python $v"
    exit 0 ;;
  -c)
    [ -f "$STATE/probe-hang" ] && sleep 5
    if [ -f "$STATE/installed" ]; then echo ok; exit 0; fi
    echo "DEPENDENCY_MISSING: numpy (No module named 'numpy')" >&2
    exit 3 ;;
  -m)
    case "$2" in
      venv)
        if [ -f "$STATE/no-venv" ]; then
          echo "Error: No module named venv" >&2
          exit 1
        fi
        for last; do :; done
        mkdir -p "$last/bin"
        cp "$0" "$last/bin/python"
        chmod 755 "$last/bin/python"
        exit 0 ;;
      pip)
        case "$*" in
          *onnx-asr*)
            if [ -f "$STATE/optional-fail" ]; then
              echo "ERROR: No matching distribution found for onnx-asr" >&2
              exit 1
            fi ;;
        esac
        if [ -f "$STATE/pip-fail" ]; then
          echo "ERROR: No matching distribution found for numpy" >&2
          exit 1
        fi
        touch "$STATE/installed"
        exit 0 ;;
    esac ;;
esac
echo "unexpected arguments: $*" >&2
exit 64
"#;

struct Fixture {
    _dir: TempDir,
    state: PathBuf,
    python: PathBuf,
    paths: AppPaths,
}

impl Fixture {
    fn new() -> Self {
        let dir = TempDir::new().expect("tempdir");
        let state = dir.path().join("state");
        let host = dir.path().join("host");
        fs::create_dir_all(&state).expect("state dir");
        fs::create_dir_all(&host).expect("host dir");

        let python = host.join("python3.11");
        let script = FAKE_PYTHON.replace("@STATE@", &state.to_string_lossy());
        fs::write(&python, script).expect("write fake python");
        fs::set_permissions(&python, fs::Permissions::from_mode(0o755)).expect("chmod");

        let paths = AppPaths::new(dir.path().join("support"));
        paths.ensure_dirs().expect("support dirs");
        Self {
            _dir: dir,
            state,
            python,
            paths,
        }
    }

    fn mark(&self, name: &str, contents: &str) {
        fs::write(self.state.join(name), contents).expect("write marker");
    }

    fn config(&self) -> BootstrapConfig {
        let quick = Duration::from_secs(10);
        BootstrapConfig {
            provider: "parakeet".into(),
            python_override: None,
            candidates: vec![self.python.clone()],
            min_version: (3, 9),
            max_version: (3, 12),
            dependencies: default_dependencies(),
            portable: None,
            timeouts: CommandTimeouts {
                version_probe: quick,
                create_env: quick,
                install: quick,
                import_probe: quick,
                download: quick,
                extract: quick,
            },
        }
    }

    fn bootstrapper(&self, config: BootstrapConfig) -> RuntimeBootstrapper {
        RuntimeBootstrapper::new(self.paths.clone(), config)
    }

    fn log(&self) -> Vec<String> {
        fs::read_to_string(self.state.join("log"))
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    fn count(&self, needle: &str) -> usize {
        self.log().iter().filter(|line| line.contains(needle)).count()
    }
}

fn contains_file(dir: &Path, name: &str) -> bool {
    dir.join(name).exists()
}

#[test]
fn builds_virtual_environment_and_reports_ready() {
    let fx = Fixture::new();
    let bootstrapper = fx.bootstrapper(fx.config());
    let mut rx = bootstrapper.subscribe();

    let executable = bootstrapper.ensure_ready(false).expect("bootstrap");

    assert_eq!(executable, fx.paths.venv_python("parakeet"));
    let status = bootstrapper.status();
    assert_eq!(status.phase, RuntimePhase::Ready);
    assert_eq!(status.executable.as_ref(), Some(&executable));
    assert_eq!(status.failure_category, None);

    assert_eq!(fx.count("-m venv --clear"), 1);
    assert_eq!(
        fx.count("-m pip install --disable-pip-version-check --no-input --upgrade numpy onnxruntime sentencepiece"),
        1
    );
    assert_eq!(fx.count("onnx-asr"), 1);

    let mut phases = Vec::new();
    let mut details = Vec::new();
    while let Ok(status) = rx.try_recv() {
        phases.push(status.phase);
        details.push(status.detail);
    }
    assert_eq!(phases.first(), Some(&RuntimePhase::Bootstrapping));
    assert_eq!(phases.last(), Some(&RuntimePhase::Ready));
    assert!(details.iter().any(|d| d == "Creating virtual environment"));
    assert!(details.iter().any(|d| d == "Verifying dependency imports"));
}

#[test]
fn falls_back_to_package_shim_without_venv() {
    let fx = Fixture::new();
    fx.mark("no-venv", "");
    let bootstrapper = fx.bootstrapper(fx.config());

    let executable = bootstrapper.ensure_ready(false).expect("bootstrap");

    let shim = fx.paths.shim_path("parakeet");
    assert_eq!(executable, shim);
    let script = fs::read_to_string(&shim).expect("shim");
    assert!(script.starts_with("#!/bin/sh\n"));
    assert!(script.contains("PYTHONPATH="));
    assert!(script.contains(&*fx.python.to_string_lossy()));
    assert!(fs::metadata(&shim).unwrap().permissions().mode() & 0o111 != 0);

    assert!(fx.paths.packages_dir("parakeet").is_dir());
    assert!(!fx.paths.venv_dir("parakeet").exists());
    assert!(fx.count("--target") >= 1);
    assert_eq!(bootstrapper.status().phase, RuntimePhase::Ready);
}

#[test]
fn existing_runtime_is_adopted_without_rebuilding() {
    let fx = Fixture::new();
    fx.bootstrapper(fx.config())
        .ensure_ready(false)
        .expect("first bootstrap");
    assert_eq!(fx.count("-m venv"), 1);

    // A fresh process finds the runtime on disk
    let bootstrapper = fx.bootstrapper(fx.config());
    assert_eq!(bootstrapper.status().phase, RuntimePhase::Idle);
    let executable = bootstrapper.resolve_executable().expect("adopted");

    assert_eq!(executable, fx.paths.venv_python("parakeet"));
    assert_eq!(bootstrapper.status().phase, RuntimePhase::Ready);
    assert_eq!(
        bootstrapper.ensure_ready(false).expect("still ready"),
        executable
    );
    assert_eq!(fx.count("-m venv"), 1);
    assert_eq!(fx.count("-m pip"), 2);
}

#[test]
fn forced_repair_rebuilds_from_scratch() {
    let fx = Fixture::new();
    let bootstrapper = fx.bootstrapper(fx.config());
    bootstrapper.ensure_ready(false).expect("bootstrap");

    let venv = fx.paths.venv_dir("parakeet");
    let packages = fx.paths.packages_dir("parakeet");
    fs::write(venv.join("stale"), "x").expect("stale venv file");
    fs::create_dir_all(&packages).expect("packages dir");
    fs::write(packages.join("stale"), "x").expect("stale package file");

    let mut rx = bootstrapper.subscribe();
    let executable = bootstrapper.ensure_ready(true).expect("repair");

    assert_eq!(executable, fx.paths.venv_python("parakeet"));
    assert!(!contains_file(&venv, "stale"));
    assert!(!packages.exists());
    assert_eq!(fx.count("-m venv"), 2);

    let first = rx.try_recv().expect("status change");
    assert_eq!(first.phase, RuntimePhase::Bootstrapping);
    assert_eq!(first.detail, "Repairing runtime");
}

#[test]
fn ready_runtime_failing_its_probe_is_rebuilt() {
    let fx = Fixture::new();
    let bootstrapper = fx.bootstrapper(fx.config());
    bootstrapper.ensure_ready(false).expect("bootstrap");

    // Dependencies vanish from under a ready runtime
    fs::remove_file(fx.state.join("installed")).expect("remove marker");

    let executable = bootstrapper.ensure_ready(false).expect("rebuild");
    assert_eq!(executable, fx.paths.venv_python("parakeet"));
    assert_eq!(fx.count("-m venv"), 2);
    assert_eq!(bootstrapper.status().phase, RuntimePhase::Ready);
}

#[test]
fn missing_interpreter_without_portable_release_fails() {
    let fx = Fixture::new();
    let mut config = fx.config();
    config.candidates = vec![fx.state.join("nowhere").join("python3")];
    let bootstrapper = fx.bootstrapper(config);

    let err = bootstrapper.ensure_ready(false).unwrap_err();

    assert!(matches!(err, BootstrapError::NoInterpreter { .. }), "{}", err);
    assert_eq!(err.category(), BootstrapFailureCategory::MissingInterpreter);
    let status = bootstrapper.status();
    assert_eq!(status.phase, RuntimePhase::Failed);
    assert_eq!(status.failure_category.as_deref(), Some("missing_interpreter"));
    assert!(matches!(
        bootstrapper.resolve_executable(),
        Err(RuntimeUnavailable::Missing(_))
    ));
}

#[test]
fn interpreter_outside_version_window_is_ignored() {
    let fx = Fixture::new();
    fx.mark("version", "3.13.1");
    let bootstrapper = fx.bootstrapper(fx.config());

    let err = bootstrapper.ensure_ready(false).unwrap_err();

    assert_eq!(err.category(), BootstrapFailureCategory::MissingInterpreter);
    assert_eq!(fx.count("-m venv"), 0);
}

#[test]
fn hung_import_probe_is_a_timeout() {
    let fx = Fixture::new();
    fx.mark("probe-hang", "");
    let mut config = fx.config();
    config.timeouts.import_probe = Duration::from_millis(300);
    let bootstrapper = fx.bootstrapper(config);

    let err = bootstrapper.ensure_ready(false).unwrap_err();

    assert_eq!(err.category(), BootstrapFailureCategory::CommandTimeout);
    assert_eq!(
        bootstrapper.status().failure_category.as_deref(),
        Some("command_timeout")
    );
}

#[test]
fn required_install_failure_is_reported() {
    let fx = Fixture::new();
    fx.mark("pip-fail", "");
    let bootstrapper = fx.bootstrapper(fx.config());

    let err = bootstrapper.ensure_ready(false).unwrap_err();

    assert_eq!(err.category(), BootstrapFailureCategory::InstallFailure);
    assert!(err.to_string().contains("numpy"), "{}", err);
}

#[test]
fn optional_install_failure_is_tolerated() {
    let fx = Fixture::new();
    fx.mark("optional-fail", "");
    let bootstrapper = fx.bootstrapper(fx.config());

    let executable = bootstrapper.ensure_ready(false).expect("bootstrap");

    assert_eq!(executable, fx.paths.venv_python("parakeet"));
    assert_eq!(fx.count("onnx-asr"), 1);
}

#[test]
fn working_override_skips_the_build() {
    let fx = Fixture::new();
    fx.mark("installed", "");
    let mut config = fx.config();
    config.python_override = Some(fx.python.clone());
    config.candidates = Vec::new();

    let bootstrapper = fx.bootstrapper(config.clone());
    assert_eq!(bootstrapper.resolve_executable(), Ok(fx.python.clone()));

    let bootstrapper = fx.bootstrapper(config);
    assert_eq!(bootstrapper.ensure_ready(false).expect("ready"), fx.python);
    assert_eq!(fx.count("-m venv"), 0);
    assert_eq!(fx.count("-m pip"), 0);
}

#[test]
fn unresolved_runtime_stays_idle() {
    let fx = Fixture::new();
    let bootstrapper = fx.bootstrapper(fx.config());

    assert!(matches!(
        bootstrapper.resolve_executable(),
        Err(RuntimeUnavailable::Missing(_))
    ));
    assert_eq!(bootstrapper.status().phase, RuntimePhase::Idle);
    assert_eq!(fx.count("-m"), 0);
}
