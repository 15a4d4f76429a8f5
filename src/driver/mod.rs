//! Session driver capability.
//!
//! Everything site-specific (opening a session, logging in, finding targets,
//! submitting an action) lives behind [`SessionDriver`]. Workers only see
//! this trait.

pub mod command;

use async_trait::async_trait;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::error::DriverError;

pub use command::{CommandDriver, CommandDriverFactory};

/// Opaque driver-side reference to a selectable target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetHandle(pub String);

/// A target offered by an authenticated session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub label: String,
    pub handle: TargetHandle,
}

/// One remote interactive session.
#[async_trait]
pub trait SessionDriver: Send {
    /// Start the session.
    async fn open(&mut self) -> Result<(), DriverError>;

    async fn authenticate(&mut self, identity: &str, secret: &SecretString)
    -> Result<(), DriverError>;

    /// Targets the authenticated identity may act as.
    async fn list_targets(&mut self) -> Result<Vec<Target>, DriverError>;

    async fn select_target(&mut self, handle: &TargetHandle) -> Result<(), DriverError>;

    async fn navigate(&mut self, resource_id: &str) -> Result<(), DriverError>;

    /// Submit one action. An `Err` means the session is no longer usable.
    async fn submit_action(&mut self, text: &str) -> Result<(), DriverError>;

    async fn refresh(&mut self) -> Result<(), DriverError>;

    /// Tear the session down.
    async fn close(&mut self) -> Result<(), DriverError> {
        Ok(())
    }
}

/// Creates a fresh driver for each worker.
#[async_trait]
pub trait DriverFactory: Send + Sync {
    async fn create(&self) -> Result<Box<dyn SessionDriver>, DriverError>;
}
