mod coordinator;
mod retry;

pub use coordinator::{
    Concern, ConcernSnapshot, CoordinatorDeps, CoordinatorHandle, CoordinatorSnapshot,
    ModelProvisioner, ProvisioningCoordinator, RuntimeProvisioner,
};
pub use retry::RetryPolicy;
