use derive_more::{Display, From};

use crate::config::ConfigError;
use crate::models::FetchError;
use crate::runtime::BootstrapError;
use crate::session::SessionError;
use visperflow_worker::WorkerError;

#[derive(Debug, From, Display)]
pub enum Error {
    #[from]
    Config(ConfigError),

    #[from]
    Fetch(FetchError),

    #[from]
    Bootstrap(BootstrapError),

    #[from]
    Worker(WorkerError),

    #[from]
    Session(SessionError),

    #[from]
    Io(std::io::Error),

    #[from]
    Audio(hound::Error),
}

impl std::error::Error for Error {}
