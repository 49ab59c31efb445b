//! Domain model (IDs, run state, status machine, errors, decisions, artifacts).

pub mod artifact;
pub mod decision;
pub mod errors;
pub mod ids;
pub mod record;
pub mod retry;
pub mod state;

pub use artifact::{
    CleanupReport, ManagedResource, PhaseRecord, PhaseStatus, ResourceOutcome, ResourceStatus,
    TrainingReport,
};
pub use decision::{Decision, ErrorClassifier};
pub use errors::{ErrorClass, RunError};
pub use ids::{InstanceId, RunId};
pub use record::RunState;
pub use retry::RetryPolicy;
pub use state::RunStatus;
