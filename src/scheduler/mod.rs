//! Account scheduling.
//!
//! - `eligibility`: which accounts may start a new session
//! - `launcher`: process and task isolation for workers
//! - `orchestrator`: the capacity-driven scheduling loop

pub mod eligibility;
pub mod launcher;
pub mod orchestrator;

pub use eligibility::{Eligibility, eligible_accounts};
pub use launcher::{
    Assignment, ProcessLauncher, TaskLauncher, WorkerHandle, WorkerLauncher,
};
pub use orchestrator::{Orchestrator, Tick};
