pub mod audio;
mod errors;
mod local;
pub mod state_manager;

pub use errors::SessionError;
pub use local::{
    LocalInferenceSession, ModelLocator, ResolvedModel, RuntimeLocator, SessionDeps,
    SessionSettings, SetupTrigger,
};
pub use state_manager::{SessionEvent, SessionState, SessionStateManager};
