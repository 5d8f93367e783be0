//! Finding a usable Python, or fetching a portable one.

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use log::{debug, info, warn};
use visperflow_worker::run_with_timeout;

use super::bootstrap::{BootstrapError, CommandTimeouts};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PythonVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl PythonVersion {
    /// Parse `python --version` output such as `Python 3.11.4` or `Python 3.13.0rc2`.
    pub fn parse(output: &str) -> Option<Self> {
        let version = output.trim().strip_prefix("Python ")?;
        let mut parts = version.split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next()?.parse().ok()?;
        let patch = parts
            .next()
            .map(|p| {
                p.chars()
                    .take_while(char::is_ascii_digit)
                    .collect::<String>()
            })
            .and_then(|p| p.parse().ok())
            .unwrap_or(0);
        Some(Self {
            major,
            minor,
            patch,
        })
    }

    /// Inclusive on both ends, compared on (major, minor).
    pub fn within(self, min: (u32, u32), max: (u32, u32)) -> bool {
        let version = (self.major, self.minor);
        version >= min && version <= max
    }
}

impl fmt::Display for PythonVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Interpreter {
    pub path: PathBuf,
    pub version: PythonVersion,
}

/// Common install locations, then bare names resolved through `PATH`.
pub fn default_candidates() -> Vec<PathBuf> {
    [
        "/opt/homebrew/bin/python3.12",
        "/opt/homebrew/bin/python3.11",
        "/opt/homebrew/bin/python3.10",
        "/usr/local/bin/python3.12",
        "/usr/local/bin/python3.11",
        "/usr/local/bin/python3.10",
        "/usr/local/bin/python3",
        "/usr/bin/python3",
        "python3.12",
        "python3.11",
        "python3",
    ]
    .into_iter()
    .map(PathBuf::from)
    .collect()
}

pub fn probe_version(path: &Path, timeout: Duration) -> Option<PythonVersion> {
    let output = match run_with_timeout(Command::new(path).arg("--version"), timeout) {
        Ok(output) if output.success() => output,
        Ok(output) => {
            debug!("{:?} --version exited with {:?}", path, output.code());
            return None;
        }
        Err(e) => {
            debug!("{:?} not usable: {}", path, e);
            return None;
        }
    };
    // Old interpreters print the version on stderr
    PythonVersion::parse(&output.stdout).or_else(|| PythonVersion::parse(&output.stderr))
}

/// Probe candidates in order, keeping those inside the version window.
pub fn discover(
    candidates: &[PathBuf],
    min: (u32, u32),
    max: (u32, u32),
    timeout: Duration,
) -> Vec<Interpreter> {
    let mut seen = HashSet::new();
    let mut found = Vec::new();

    for candidate in candidates {
        if candidate.is_absolute() && !candidate.is_file() {
            continue;
        }
        let identity = fs::canonicalize(candidate).unwrap_or_else(|_| candidate.clone());
        if !seen.insert(identity) {
            continue;
        }

        match probe_version(candidate, timeout) {
            Some(version) if version.within(min, max) => {
                debug!("Found Python {} at {:?}", version, candidate);
                found.push(Interpreter {
                    path: candidate.clone(),
                    version,
                });
            }
            Some(version) => {
                debug!(
                    "Skipping Python {} at {:?} (supported {}.{} to {}.{})",
                    version, candidate, min.0, min.1, max.0, max.1
                );
            }
            None => {}
        }
    }

    found
}

/// A self-contained CPython build published as a release asset.
#[derive(Debug, Clone, PartialEq)]
pub struct PortableRelease {
    pub base_url: String,
    pub tag: String,
    pub python_version: String,
}

impl Default for PortableRelease {
    fn default() -> Self {
        Self {
            base_url: "https://github.com/indygreg/python-build-standalone/releases/download"
                .to_string(),
            tag: "20241016".to_string(),
            python_version: "3.11.10".to_string(),
        }
    }
}

impl PortableRelease {
    pub fn archive_name(&self) -> Option<String> {
        host_triple().map(|triple| {
            format!(
                "cpython-{}+{}-{}-install_only.tar.gz",
                self.python_version, self.tag, triple
            )
        })
    }

    pub fn url(&self) -> Option<String> {
        self.archive_name()
            .map(|name| format!("{}/{}/{}", self.base_url, self.tag, name))
    }
}

fn host_triple() -> Option<&'static str> {
    match (std::env::consts::OS, std::env::consts::ARCH) {
        ("macos", "aarch64") => Some("aarch64-apple-darwin"),
        ("macos", "x86_64") => Some("x86_64-apple-darwin"),
        ("linux", "x86_64") => Some("x86_64-unknown-linux-gnu"),
        ("linux", "aarch64") => Some("aarch64-unknown-linux-gnu"),
        _ => None,
    }
}

/// Interpreter inside an extracted portable archive.
pub fn portable_python(toolchain_dir: &Path) -> PathBuf {
    toolchain_dir.join("python").join("bin").join("python3")
}

/// Download and unpack the portable interpreter, reusing a cached copy.
pub fn install_portable(
    release: &PortableRelease,
    toolchain_dir: &Path,
    timeouts: &CommandTimeouts,
) -> Result<PathBuf, BootstrapError> {
    let python = portable_python(toolchain_dir);
    if python.is_file() {
        debug!("Using cached portable Python at {:?}", python);
        return Ok(python);
    }

    let (url, name) = match (release.url(), release.archive_name()) {
        (Some(url), Some(name)) => (url, name),
        _ => {
            return Err(BootstrapError::InterpreterDownload(format!(
                "no portable build for {}-{}",
                std::env::consts::OS,
                std::env::consts::ARCH
            )))
        }
    };

    fs::create_dir_all(toolchain_dir)?;
    let archive = toolchain_dir.join(name);
    info!("Downloading portable Python from {}", url);

    let download = || -> Result<(), reqwest::Error> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeouts.download)
            .build()?;
        let mut response = client.get(&url).send()?.error_for_status()?;
        let mut file = match fs::File::create(&archive) {
            Ok(file) => file,
            Err(e) => {
                warn!("Cannot create {:?}: {}", archive, e);
                return Ok(());
            }
        };
        response.copy_to(&mut file)?;
        Ok(())
    };
    if let Err(e) = download() {
        let _ = fs::remove_file(&archive);
        return Err(if e.is_timeout() {
            BootstrapError::Timeout {
                step: "Portable Python download".to_string(),
                timeout: timeouts.download,
            }
        } else {
            BootstrapError::InterpreterDownload(e.to_string())
        });
    }
    if !archive.is_file() {
        return Err(BootstrapError::InterpreterDownload(format!(
            "archive {:?} could not be written",
            archive
        )));
    }

    let extracted = super::bootstrap::run_step(
        Command::new("tar")
            .arg("-xzf")
            .arg(&archive)
            .arg("-C")
            .arg(toolchain_dir),
        "Portable Python extraction",
        timeouts.extract,
        BootstrapError::InterpreterDownload,
    );
    let _ = fs::remove_file(&archive);
    extracted?;

    if !python.is_file() {
        return Err(BootstrapError::InterpreterDownload(format!(
            "{:?} missing after extraction",
            python
        )));
    }
    info!("Portable Python installed at {:?}", python);
    Ok(python)
}
