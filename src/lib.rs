//! rota: rotates a roster of accounts across capacity-limited resources.
//!
//! An orchestrator fills each resource up to its capacity with workers, one
//! account per worker. Each worker signs in through an external session
//! driver, performs a bounded number of paced actions, and releases the
//! account. A single accounting service hands out the global sequence number
//! and the cooperative exit signal.

pub mod config;
pub mod counter;
pub mod driver;
pub mod error;
pub mod logging;
pub mod scheduler;
pub mod store;
pub mod worker;
