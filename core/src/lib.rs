//! Local model provisioning and inference for Visperflow.
//!
//! [`setup::Services`] builds the whole stack: the artifact fetcher, the
//! runtime bootstrapper, the worker supervisor, the provisioning
//! coordinator, and the dictation session on top of them.

pub mod config;
pub mod error;
pub mod log;
pub mod models;
pub mod paths;
pub mod provisioning;
pub mod runtime;
pub mod session;
pub mod setup;
pub mod telemetry;

pub use error::Error;
pub use paths::AppPaths;
pub use setup::Services;
