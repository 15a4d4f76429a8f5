//! Durable account and application state.

pub mod record;
pub mod state;

pub use record::{AccountKey, AccountRecord, ApplicationRecord, Lease};
pub use state::StateStore;
