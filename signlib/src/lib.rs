mod actors;
pub mod artifact;
pub mod config;
pub mod delivery;
pub mod error;
mod events;
pub mod invoker;
pub mod types;
pub mod workspace;

// re-export the job coord handle as if it is the job coordinator itself.
pub use actors::coordinator::JobCoordinatorHandle as JobCoordinator;
pub use config::Config;
pub use error::{JobError, Result};
pub use events::{JobOutcome, JobState, JobStatus};
