//! Worker sessions.
//!
//! - `state`: worker state machine and exit reasons
//! - `message`: message template pool
//! - `session`: the per-account session (login → target → resource → action loop)

pub mod message;
pub mod session;
pub mod state;

pub use message::MessagePool;
pub use session::{WorkerBinding, WorkerDeps, WorkerSession, run_worker};
pub use state::{ExitReason, WorkerState};
