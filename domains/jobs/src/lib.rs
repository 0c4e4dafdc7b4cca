//! Jobs domain: shootouts, jobs, admission, workers, progress hub

pub mod admission;
pub mod api;
pub mod credentials;
pub mod domain;
pub mod hub;
pub mod repository;
pub mod service;
pub mod supervisor;
pub mod worker;

// Re-export domain types at the crate root for convenience
pub use domain::entities::*;
pub use domain::state::{JobEvent, JobState, JobStateMachine, StateError};

// Re-export the core collaborators
pub use credentials::{AuthError, CredentialService};
pub use hub::{ProgressEvent, ProgressHub, Subscription};
pub use repository::{CasOutcome, JobFilter, JobPatch, JobStore, MemoryStore, Page, PgStore};
pub use service::CoreService;
pub use supervisor::{Supervisor, SupervisorConfig};
pub use worker::{Worker, WorkerConfig};

// Re-export API types
pub use api::routes;
pub use api::JobsState;
