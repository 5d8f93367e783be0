mod bootstrap;
mod interpreter;
mod status;

pub use bootstrap::{
    default_dependencies, BootstrapConfig, BootstrapError, BootstrapFailureCategory,
    CommandTimeouts, Dependency, RuntimeBootstrapper, RuntimeUnavailable,
};
pub use interpreter::{
    default_candidates, discover, portable_python, probe_version, Interpreter, PortableRelease,
    PythonVersion,
};
pub use status::{BootstrapStep, RuntimeBootstrapStatus, RuntimePhase};
