//! Provisioning the private Python environment the inference worker runs in.
//!
//! The preferred layout is a virtual environment under
//! `runtime/<provider>/venv`. Interpreters that cannot create one (some
//! distribution builds ship without `ensurepip`) get a package directory
//! plus a small shell shim that puts it on `PYTHONPATH`. Either way the
//! result only counts once the import probe passes.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, warn};
use thiserror::Error;
use tokio::sync::broadcast;
use visperflow_worker::{run_with_timeout, CommandError, CommandOutput};

use super::interpreter::{default_candidates, discover, install_portable, PortableRelease};
use super::status::{BootstrapStep, RuntimeBootstrapStatus, RuntimePhase, StatusCell};
use crate::paths::AppPaths;

const PYTHON_OVERRIDE_ENV: &str = "VISPERFLOW_PYTHON";

/// Exit code of the import probe when a required module is missing.
const PROBE_MISSING_EXIT: i32 = 3;

/// A Python package the worker needs, and the module that proves it is importable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    pub package: String,
    pub module: String,
    /// Optional packages are installed best-effort and never probed
    pub required: bool,
}

impl Dependency {
    pub fn required(package: &str, module: &str) -> Self {
        Self {
            package: package.to_string(),
            module: module.to_string(),
            required: true,
        }
    }

    pub fn optional(package: &str, module: &str) -> Self {
        Self {
            required: false,
            ..Self::required(package, module)
        }
    }
}

pub fn default_dependencies() -> Vec<Dependency> {
    vec![
        Dependency::required("numpy", "numpy"),
        Dependency::required("onnxruntime", "onnxruntime"),
        Dependency::required("sentencepiece", "sentencepiece"),
        Dependency::optional("onnx-asr", "onnx_asr"),
    ]
}

/// Deadlines for every host command the bootstrapper runs.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandTimeouts {
    pub version_probe: Duration,
    pub create_env: Duration,
    pub install: Duration,
    pub import_probe: Duration,
    pub download: Duration,
    pub extract: Duration,
}

impl Default for CommandTimeouts {
    fn default() -> Self {
        Self {
            version_probe: Duration::from_secs(10),
            create_env: Duration::from_secs(180),
            install: Duration::from_secs(1200),
            import_probe: Duration::from_secs(90),
            download: Duration::from_secs(600),
            extract: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BootstrapConfig {
    /// Runtime directory name under `runtime/`
    pub provider: String,
    /// Interpreter tried before anything is built
    pub python_override: Option<PathBuf>,
    pub candidates: Vec<PathBuf>,
    pub min_version: (u32, u32),
    pub max_version: (u32, u32),
    pub dependencies: Vec<Dependency>,
    /// Fallback when no installed interpreter qualifies
    pub portable: Option<PortableRelease>,
    pub timeouts: CommandTimeouts,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            provider: "parakeet".to_string(),
            python_override: None,
            candidates: default_candidates(),
            min_version: (3, 9),
            max_version: (3, 12),
            dependencies: default_dependencies(),
            portable: Some(PortableRelease::default()),
            timeouts: CommandTimeouts::default(),
        }
    }
}

impl BootstrapConfig {
    /// `VISPERFLOW_PYTHON` takes precedence over a configured override.
    pub fn with_override_from_env(mut self) -> Self {
        if let Some(value) = std::env::var_os(PYTHON_OVERRIDE_ENV).filter(|v| !v.is_empty()) {
            self.python_override = Some(PathBuf::from(value));
        }
        self
    }

    fn required_modules(&self) -> Vec<&str> {
        self.dependencies
            .iter()
            .filter(|d| d.required)
            .map(|d| d.module.as_str())
            .collect()
    }
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(
        "No Python {}.{} to {}.{} interpreter found",
        min.0, min.1, max.0, max.1
    )]
    NoInterpreter { min: (u32, u32), max: (u32, u32) },

    #[error("Could not install portable Python: {0}")]
    InterpreterDownload(String),

    #[error("{step} timed out after {}s", timeout.as_secs())]
    Timeout { step: String, timeout: Duration },

    #[error("Could not create Python environment: {0}")]
    EnvironmentCreation(String),

    #[error("Dependency installation failed: {0}")]
    Install(String),

    #[error("Runtime dependencies are not importable: {0}")]
    ImportProbe(String),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("Runtime filesystem error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum BootstrapFailureCategory {
    MissingInterpreter,
    InterpreterDownload,
    CommandTimeout,
    EnvironmentCreation,
    InstallFailure,
    ImportFailure,
    CommandFailure,
    Filesystem,
}

impl BootstrapError {
    pub fn category(&self) -> BootstrapFailureCategory {
        use BootstrapFailureCategory as C;
        match self {
            BootstrapError::NoInterpreter { .. } => C::MissingInterpreter,
            BootstrapError::InterpreterDownload(_) => C::InterpreterDownload,
            BootstrapError::Timeout { .. } => C::CommandTimeout,
            BootstrapError::EnvironmentCreation(_) => C::EnvironmentCreation,
            BootstrapError::Install(_) => C::InstallFailure,
            BootstrapError::ImportProbe(_) => C::ImportFailure,
            BootstrapError::Command(e) if e.is_timeout() => C::CommandTimeout,
            BootstrapError::Command(_) => C::CommandFailure,
            BootstrapError::Io(_) => C::Filesystem,
        }
    }
}

/// Why no executable can be handed out right now.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuntimeUnavailable {
    #[error("Runtime setup is in progress")]
    InProgress,
    #[error("Runtime is not available: {0}")]
    Missing(String),
}

/// Run one bootstrap command. A non-zero exit becomes `on_fail`, an
/// overrun becomes [`BootstrapError::Timeout`].
pub(crate) fn run_step(
    command: &mut Command,
    step: &str,
    timeout: Duration,
    on_fail: impl FnOnce(String) -> BootstrapError,
) -> Result<CommandOutput, BootstrapError> {
    debug!("{}: {:?}", step, command);
    match run_with_timeout(command, timeout) {
        Ok(output) if output.success() => Ok(output),
        Ok(output) => Err(on_fail(format!(
            "{} exited with {:?}: {}",
            step,
            output.code(),
            output.last_error_line()
        ))),
        Err(e) if e.is_timeout() => Err(BootstrapError::Timeout {
            step: step.to_string(),
            timeout,
        }),
        Err(e) => Err(BootstrapError::Command(e)),
    }
}

/// Builds, verifies and repairs the worker's Python runtime.
///
/// All methods except [`resolve_executable`](Self::resolve_executable) and
/// the status accessors block on host commands; async callers go through
/// `spawn_blocking`.
#[derive(Clone)]
pub struct RuntimeBootstrapper {
    inner: Arc<Inner>,
}

struct Inner {
    paths: AppPaths,
    config: BootstrapConfig,
    status: StatusCell,
    /// Held for the whole of a bootstrap so concurrent calls queue up
    gate: Mutex<()>,
}

impl RuntimeBootstrapper {
    pub fn new(paths: AppPaths, config: BootstrapConfig) -> Self {
        let status = StatusCell::new(paths.runtime_dir(&config.provider));
        Self {
            inner: Arc::new(Inner {
                paths,
                config,
                status,
                gate: Mutex::new(()),
            }),
        }
    }

    pub fn status(&self) -> RuntimeBootstrapStatus {
        self.inner.status.get()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RuntimeBootstrapStatus> {
        self.inner.status.subscribe()
    }

    pub fn runtime_root(&self) -> PathBuf {
        self.inner.paths.runtime_dir(&self.inner.config.provider)
    }

    pub fn config(&self) -> &BootstrapConfig {
        &self.inner.config
    }

    /// Make sure a working runtime exists and return its interpreter.
    ///
    /// An already-ready runtime is re-probed and returned as is. With
    /// `force_repair` any existing environment is removed and rebuilt.
    pub fn ensure_ready(&self, force_repair: bool) -> Result<PathBuf, BootstrapError> {
        let _gate = self.inner.gate.lock().unwrap();

        let mut force_repair = force_repair;
        let current = self.inner.status.get();
        if !force_repair && current.phase == RuntimePhase::Ready {
            if let Some(executable) = current.executable {
                match self.import_probe(&executable) {
                    Ok(()) => return Ok(executable),
                    Err(e) => {
                        warn!("Ready runtime failed its import probe, rebuilding: {}", e);
                        force_repair = true;
                    }
                }
            }
        }

        let detail = if force_repair {
            "Repairing runtime"
        } else {
            "Preparing runtime"
        };
        self.inner
            .status
            .publish(RuntimePhase::Bootstrapping, detail, None, None);

        match self.bootstrap(force_repair) {
            Ok(executable) => {
                info!("Runtime ready: {:?}", executable);
                self.inner.status.publish(
                    RuntimePhase::Ready,
                    "Runtime ready",
                    Some(executable.clone()),
                    None,
                );
                Ok(executable)
            }
            Err(e) => {
                warn!("Runtime bootstrap failed: {}", e);
                self.inner.status.publish(
                    RuntimePhase::Failed,
                    e.to_string(),
                    None,
                    Some(e.category().to_string()),
                );
                Err(e)
            }
        }
    }

    /// Interpreter to run the worker with, without building anything.
    ///
    /// On first use a runtime left by a previous run is probed and adopted.
    /// While a bootstrap holds the gate this returns `InProgress` at once.
    pub fn resolve_executable(&self) -> Result<PathBuf, RuntimeUnavailable> {
        let status = self.inner.status.get();
        match status.phase {
            RuntimePhase::Ready => status.executable.ok_or_else(|| {
                RuntimeUnavailable::Missing("runtime has no executable".to_string())
            }),
            RuntimePhase::Bootstrapping => Err(RuntimeUnavailable::InProgress),
            RuntimePhase::Failed => Err(RuntimeUnavailable::Missing(status.detail)),
            RuntimePhase::Idle => {
                let Ok(_gate) = self.inner.gate.try_lock() else {
                    return Err(RuntimeUnavailable::InProgress);
                };
                let status = self.inner.status.get();
                match status.phase {
                    RuntimePhase::Idle => {}
                    RuntimePhase::Ready => {
                        return status.executable.ok_or_else(|| {
                            RuntimeUnavailable::Missing("runtime has no executable".to_string())
                        })
                    }
                    RuntimePhase::Failed => {
                        return Err(RuntimeUnavailable::Missing(status.detail))
                    }
                    RuntimePhase::Bootstrapping => return Err(RuntimeUnavailable::InProgress),
                }

                match self.existing_runtime(true) {
                    Some(executable) => {
                        self.inner.status.publish(
                            RuntimePhase::Bootstrapping,
                            "Adopting existing runtime",
                            None,
                            None,
                        );
                        self.inner.status.publish(
                            RuntimePhase::Ready,
                            "Runtime ready",
                            Some(executable.clone()),
                            None,
                        );
                        Ok(executable)
                    }
                    None => Err(RuntimeUnavailable::Missing(
                        "Local runtime has not been set up".to_string(),
                    )),
                }
            }
        }
    }

    fn step(&self, step: BootstrapStep) {
        self.inner
            .status
            .publish(RuntimePhase::Bootstrapping, step.to_string(), None, None);
    }

    fn bootstrap(&self, force_repair: bool) -> Result<PathBuf, BootstrapError> {
        let config = &self.inner.config;
        let paths = &self.inner.paths;
        let provider = config.provider.as_str();

        if let Some(python) = &config.python_override {
            self.step(BootstrapStep::VerifyingImports);
            match self.import_probe(python) {
                Ok(()) => {
                    info!("Using Python override {:?}", python);
                    return Ok(python.clone());
                }
                Err(e) => warn!("Python override {:?} rejected: {}", python, e),
            }
        }

        self.step(BootstrapStep::PreparingDirectories);
        let root = paths.runtime_dir(provider);
        if force_repair {
            for dir in [
                paths.venv_dir(provider),
                paths.packages_dir(provider),
                root.join("bin"),
            ] {
                if dir.exists() {
                    info!("Removing {:?}", dir);
                    fs::remove_dir_all(&dir)?;
                }
            }
        }
        fs::create_dir_all(&root)?;

        if !force_repair {
            if let Some(executable) = self.existing_runtime(false) {
                return Ok(executable);
            }
        }

        self.step(BootstrapStep::SelectingInterpreter);
        let mut bases: Vec<PathBuf> = discover(
            &config.candidates,
            config.min_version,
            config.max_version,
            config.timeouts.version_probe,
        )
        .into_iter()
        .map(|interpreter| interpreter.path)
        .collect();

        if bases.is_empty() {
            let Some(release) = &config.portable else {
                return Err(BootstrapError::NoInterpreter {
                    min: config.min_version,
                    max: config.max_version,
                });
            };
            self.step(BootstrapStep::DownloadingInterpreter);
            bases.push(install_portable(
                release,
                &paths.toolchain_dir(),
                &config.timeouts,
            )?);
        }

        let mut last_error = None;
        for base in &bases {
            match self.build_with(base) {
                Ok(executable) => return Ok(executable),
                Err(e) => {
                    warn!("Runtime build with {:?} failed: {}", base, e);
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or(BootstrapError::NoInterpreter {
            min: config.min_version,
            max: config.max_version,
        }))
    }

    /// A previously built venv or shim that still passes the probe.
    fn existing_runtime(&self, include_override: bool) -> Option<PathBuf> {
        let provider = self.inner.config.provider.as_str();
        let paths = &self.inner.paths;

        let override_path = self
            .inner
            .config
            .python_override
            .clone()
            .filter(|_| include_override);
        let built = [paths.venv_python(provider), paths.shim_path(provider)]
            .into_iter()
            .filter(|p| p.is_file());

        for executable in override_path.into_iter().chain(built) {
            match self.import_probe(&executable) {
                Ok(()) => {
                    debug!("Reusing runtime at {:?}", executable);
                    return Some(executable);
                }
                Err(e) => debug!("Existing runtime {:?} unusable: {}", executable, e),
            }
        }
        None
    }

    fn build_with(&self, base: &Path) -> Result<PathBuf, BootstrapError> {
        match self.build_venv(base) {
            Ok(executable) => Ok(executable),
            Err(BootstrapError::EnvironmentCreation(reason)) => {
                warn!(
                    "Virtual environment unavailable with {:?} ({}), using package shim",
                    base, reason
                );
                let _ = fs::remove_dir_all(self.inner.paths.venv_dir(&self.inner.config.provider));
                self.build_shim(base)
            }
            Err(e) => Err(e),
        }
    }

    fn build_venv(&self, base: &Path) -> Result<PathBuf, BootstrapError> {
        let provider = self.inner.config.provider.as_str();
        let timeouts = &self.inner.config.timeouts;
        let venv = self.inner.paths.venv_dir(provider);

        self.step(BootstrapStep::CreatingEnvironment);
        run_step(
            Command::new(base).args(["-m", "venv", "--clear"]).arg(&venv),
            "Virtual environment creation",
            timeouts.create_env,
            BootstrapError::EnvironmentCreation,
        )?;

        let python = self.inner.paths.venv_python(provider);
        if !python.is_file() {
            return Err(BootstrapError::EnvironmentCreation(format!(
                "{:?} missing after venv creation",
                python
            )));
        }

        self.step(BootstrapStep::InstallingDependencies);
        self.install(&python, None)?;
        self.step(BootstrapStep::VerifyingImports);
        self.import_probe(&python)?;
        Ok(python)
    }

    fn build_shim(&self, base: &Path) -> Result<PathBuf, BootstrapError> {
        let provider = self.inner.config.provider.as_str();
        let packages = self.inner.paths.packages_dir(provider);
        fs::create_dir_all(&packages)?;

        self.step(BootstrapStep::InstallingDependencies);
        self.install(base, Some(&packages))?;

        let shim = self.inner.paths.shim_path(provider);
        write_shim(&shim, base, &packages)?;

        self.step(BootstrapStep::VerifyingImports);
        self.import_probe(&shim)?;
        Ok(shim)
    }

    fn install(&self, python: &Path, target: Option<&Path>) -> Result<(), BootstrapError> {
        let timeout = self.inner.config.timeouts.install;
        let (required, optional): (Vec<&Dependency>, Vec<&Dependency>) = self
            .inner
            .config
            .dependencies
            .iter()
            .partition(|d| d.required);

        if !required.is_empty() {
            let mut command = pip_install(python, target);
            command.args(required.iter().map(|d| d.package.as_str()));
            run_step(
                &mut command,
                "Dependency install",
                timeout,
                BootstrapError::Install,
            )?;
        }

        for dependency in optional {
            let mut command = pip_install(python, target);
            command.arg(&dependency.package);
            if let Err(e) = run_step(
                &mut command,
                "Optional dependency install",
                timeout,
                BootstrapError::Install,
            ) {
                warn!("Optional package {} not installed: {}", dependency.package, e);
            }
        }
        Ok(())
    }

    fn import_probe(&self, python: &Path) -> Result<(), BootstrapError> {
        let script = import_probe_script(&self.inner.config.required_modules());
        run_step(
            Command::new(python).arg("-c").arg(script),
            "Import probe",
            self.inner.config.timeouts.import_probe,
            BootstrapError::ImportProbe,
        )
        .map(|_| ())
    }
}

fn pip_install(python: &Path, target: Option<&Path>) -> Command {
    let mut command = Command::new(python);
    command.args([
        "-m",
        "pip",
        "install",
        "--disable-pip-version-check",
        "--no-input",
        "--upgrade",
    ]);
    if let Some(target) = target {
        command.arg("--target").arg(target);
    }
    command
}

fn import_probe_script(modules: &[&str]) -> String {
    let names = serde_json::to_string(modules).unwrap_or_else(|_| "[]".to_string());
    format!(
        "import importlib, sys\n\
         missing = []\n\
         for name in {names}:\n    \
             try:\n        \
                 importlib.import_module(name)\n    \
             except Exception as exc:\n        \
                 missing.append(name + ' (' + str(exc) + ')')\n\
         if missing:\n    \
             print('DEPENDENCY_MISSING: ' + ', '.join(missing), file=sys.stderr)\n    \
             sys.exit({PROBE_MISSING_EXIT})\n\
         print('ok')\n"
    )
}

fn shell_quote(path: &Path) -> String {
    format!("'{}'", path.to_string_lossy().replace('\'', r"'\''"))
}

fn write_shim(shim: &Path, base: &Path, packages: &Path) -> io::Result<()> {
    if let Some(dir) = shim.parent() {
        fs::create_dir_all(dir)?;
    }
    let script = format!(
        "#!/bin/sh\n\
         PYTHONPATH={packages}${{PYTHONPATH:+:$PYTHONPATH}}\n\
         export PYTHONPATH\n\
         exec {base} \"$@\"\n",
        packages = shell_quote(packages),
        base = shell_quote(base),
    );
    fs::write(shim, script)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(shim, fs::Permissions::from_mode(0o755))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_categories() {
        let test_cases = vec![
            (
                BootstrapError::NoInterpreter {
                    min: (3, 9),
                    max: (3, 12),
                },
                "missing_interpreter",
            ),
            (
                BootstrapError::Timeout {
                    step: "Import probe".to_string(),
                    timeout: Duration::from_secs(1),
                },
                "command_timeout",
            ),
            (
                BootstrapError::EnvironmentCreation("no ensurepip".to_string()),
                "environment_creation",
            ),
            (BootstrapError::Install("pip".to_string()), "install_failure"),
            (
                BootstrapError::ImportProbe("numpy".to_string()),
                "import_failure",
            ),
            (
                BootstrapError::Io(io::Error::from(io::ErrorKind::PermissionDenied)),
                "filesystem",
            ),
        ];

        for (error, expected) in test_cases {
            assert_eq!(error.category().to_string(), expected, "{error}");
        }
    }

    #[test]
    fn probe_script_lists_required_modules_only() {
        let config = BootstrapConfig::default();
        let script = import_probe_script(&config.required_modules());

        assert!(script.contains(r#"["numpy","onnxruntime","sentencepiece"]"#));
        assert!(!script.contains("onnx_asr"));
        assert!(script.contains("sys.exit(3)"));
    }

    #[test]
    fn shim_quotes_paths() {
        assert_eq!(
            shell_quote(Path::new("/Users/o'neil/py")),
            r"'/Users/o'\''neil/py'"
        );
    }

    #[test]
    fn pip_targets_package_dir_for_shim() {
        let command = pip_install(Path::new("/usr/bin/python3"), Some(Path::new("/pkgs")));
        let args: Vec<_> = command
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(&args[..3], ["-m", "pip", "install"]);
        assert!(args.ends_with(&["--target".to_string(), "/pkgs".to_string()]));
    }

    #[test]
    fn env_override_wins() {
        std::env::set_var(PYTHON_OVERRIDE_ENV, "/opt/custom/python3");
        let config = BootstrapConfig {
            python_override: Some(PathBuf::from("/from/config")),
            ..BootstrapConfig::default()
        }
        .with_override_from_env();
        std::env::remove_var(PYTHON_OVERRIDE_ENV);

        assert_eq!(
            config.python_override,
            Some(PathBuf::from("/opt/custom/python3"))
        );
    }
}
