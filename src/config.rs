//! Configuration types.
//!
//! Loaded from a JSON document (default `data/config.json`) and then adjusted
//! from the environment. Every tunable has a default, so a config file only
//! needs credentials, resources and messages.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Deserializer};

use crate::error::ConfigError;
use crate::store::AccountKey;

/// Default location of the configuration document.
pub const DEFAULT_CONFIG_PATH: &str = "data/config.json";

/// Pause actually taken between actions: the nominal cooldown inflated by 31/30.
pub fn inflated_cooldown(nominal: Duration) -> Duration {
    nominal * 31 / 30
}

/// Root configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RotaConfig {
    /// Directory holding account records, the application record and logs.
    pub data_dir: PathBuf,
    /// How workers are isolated from the scheduler.
    pub isolation: Isolation,
    /// Resources in scheduling order.
    pub resources: Vec<ResourceConfig>,
    pub credentials: Vec<CredentialConfig>,
    /// Message templates. `{seq}` and `{session}` are substituted per action.
    pub messages: Vec<String>,
    pub worker: WorkerConfig,
    pub scheduler: SchedulerConfig,
    pub driver: DriverConfig,
}

impl Default for RotaConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            isolation: Isolation::Process,
            resources: Vec::new(),
            credentials: Vec::new(),
            messages: Vec::new(),
            worker: WorkerConfig::default(),
            scheduler: SchedulerConfig::default(),
            driver: DriverConfig::default(),
        }
    }
}

/// Worker isolation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Isolation {
    /// One OS process per worker (re-executes this binary).
    Process,
    /// One tokio task per worker inside the scheduler process.
    Task,
}

impl FromStr for Isolation {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "process" => Ok(Self::Process),
            "task" => Ok(Self::Task),
            other => Err(ConfigError::InvalidValue {
                key: "isolation".into(),
                message: format!("expected 'process' or 'task', got '{other}'"),
            }),
        }
    }
}

/// A target resource and its concurrency cap.
#[derive(Debug, Clone, Deserialize)]
pub struct ResourceConfig {
    pub id: String,
    pub capacity: usize,
    /// Per-action cooldown for this resource; falls back to `worker.action_cooldown_secs`.
    #[serde(default)]
    pub action_cooldown_secs: Option<f64>,
}

/// One login identity and the target aliases it exposes.
#[derive(Debug, Deserialize)]
pub struct CredentialConfig {
    pub identity: String,
    #[serde(deserialize_with = "deserialize_secret")]
    pub secret: SecretString,
    pub aliases: Vec<String>,
}

impl Clone for CredentialConfig {
    fn clone(&self) -> Self {
        use secrecy::ExposeSecret;
        Self {
            identity: self.identity.clone(),
            secret: SecretString::from(self.secret.expose_secret().to_owned()),
            aliases: self.aliases.clone(),
        }
    }
}

fn deserialize_secret<'de, D>(deserializer: D) -> Result<SecretString, D::Error>
where
    D: Deserializer<'de>,
{
    String::deserialize(deserializer).map(SecretString::from)
}

/// Per-worker tunables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Actions per session before finishing.
    pub max_actions: u32,
    /// Refresh the session every N global sequence numbers.
    pub refresh_interval: u64,
    /// Pause after login, target switch, resource open and refresh.
    pub settle_delay_secs: f64,
    /// Nominal pause between actions.
    pub action_cooldown_secs: f64,
    /// How long an `active` flag stays valid without renewal.
    pub lease_ttl_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_actions: 760,
            refresh_interval: 100,
            settle_delay_secs: 2.0,
            action_cooldown_secs: 6.0,
            lease_ttl_secs: 600,
        }
    }
}

impl WorkerConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_secs_f64(self.settle_delay_secs)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }
}

/// Scheduling loop tunables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Minimum time since an account's last session before it is reused.
    pub account_cooldown_secs: f64,
    /// Poll interval while every resource is at capacity.
    pub idle_poll_ms: u64,
    /// Back-off when no account is eligible.
    pub no_accounts_backoff_secs: f64,
    /// Pause after each spawn.
    pub spawn_pacing_secs: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            account_cooldown_secs: 86_400.0,
            idle_poll_ms: 500,
            no_accounts_backoff_secs: 20.0,
            spawn_pacing_secs: 10.0,
        }
    }
}

impl SchedulerConfig {
    pub fn account_cooldown(&self) -> Duration {
        Duration::from_secs_f64(self.account_cooldown_secs)
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }

    pub fn no_accounts_backoff(&self) -> Duration {
        Duration::from_secs_f64(self.no_accounts_backoff_secs)
    }

    pub fn spawn_pacing(&self) -> Duration {
        Duration::from_secs_f64(self.spawn_pacing_secs)
    }
}

/// External session driver program.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    pub command: Option<String>,
    pub args: Vec<String>,
}

/// A concrete (credential, alias) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountSpec {
    pub key: AccountKey,
    pub credential_id: String,
    pub alias: String,
}

impl AccountSpec {
    pub fn new(credential_id: impl Into<String>, alias: impl Into<String>) -> Self {
        let credential_id = credential_id.into();
        let alias = alias.into();
        Self {
            key: AccountKey::derive(&credential_id, &alias),
            credential_id,
            alias,
        }
    }

    /// Human-readable `credential/alias` label.
    pub fn label(&self) -> String {
        format!("{}/{}", self.credential_id, self.alias)
    }
}

impl RotaConfig {
    /// Load, apply environment overrides and validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let raw = std::fs::read_to_string(path)?;
        let mut config: Self =
            serde_json::from_str(&raw).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `ROTA_*` environment overrides.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(dir) = std::env::var("ROTA_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Ok(mode) = std::env::var("ROTA_ISOLATION") {
            self.isolation = mode.parse()?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(key: &str, message: impl Into<String>) -> ConfigError {
            ConfigError::InvalidValue {
                key: key.to_string(),
                message: message.into(),
            }
        }

        if self.resources.is_empty() {
            return Err(invalid("resources", "at least one resource is required"));
        }
        if self.resources.iter().all(|r| r.capacity == 0) {
            return Err(invalid("resources", "every resource has zero capacity"));
        }
        for (i, resource) in self.resources.iter().enumerate() {
            if self.resources[..i].iter().any(|r| r.id == resource.id) {
                return Err(invalid("resources", format!("duplicate id '{}'", resource.id)));
            }
            if let Some(secs) = resource.action_cooldown_secs {
                if !secs.is_finite() || secs < 0.0 {
                    return Err(invalid("resources.action_cooldown_secs", "must be >= 0"));
                }
            }
        }
        if self.messages.is_empty() {
            return Err(invalid("messages", "at least one message template is required"));
        }
        if self.worker.max_actions == 0 {
            return Err(invalid("worker.max_actions", "must be > 0"));
        }
        if self.worker.refresh_interval == 0 {
            return Err(invalid("worker.refresh_interval", "must be > 0"));
        }
        for (key, secs) in [
            ("worker.settle_delay_secs", self.worker.settle_delay_secs),
            ("worker.action_cooldown_secs", self.worker.action_cooldown_secs),
            ("scheduler.account_cooldown_secs", self.scheduler.account_cooldown_secs),
            ("scheduler.no_accounts_backoff_secs", self.scheduler.no_accounts_backoff_secs),
            ("scheduler.spawn_pacing_secs", self.scheduler.spawn_pacing_secs),
        ] {
            if !secs.is_finite() || secs < 0.0 {
                return Err(invalid(key, "must be a non-negative number of seconds"));
            }
        }
        // The lease is renewed once per action, so it must outlive the longest
        // gap between renewals: one paced cooldown plus a refresh settle.
        let lease_ttl = self.worker.lease_ttl();
        for resource in &self.resources {
            let gap = inflated_cooldown(self.action_cooldown_for(&resource.id))
                + self.worker.settle_delay();
            if lease_ttl <= gap {
                return Err(invalid(
                    "worker.lease_ttl_secs",
                    format!(
                        "{}s does not outlast the {:.1}s between renewals on '{}'",
                        self.worker.lease_ttl_secs,
                        gap.as_secs_f64(),
                        resource.id
                    ),
                ));
            }
        }
        if self.isolation == Isolation::Process && self.driver.command.is_none() {
            return Err(invalid(
                "driver.command",
                "required when isolation is 'process'",
            ));
        }
        Ok(())
    }

    /// Every configured (credential, alias) pair, in configuration order.
    pub fn accounts(&self) -> Vec<AccountSpec> {
        self.credentials
            .iter()
            .flat_map(|c| c.aliases.iter().map(|a| AccountSpec::new(&c.identity, a)))
            .collect()
    }

    /// Find an account by its key.
    pub fn find_account(&self, key: &str) -> Result<AccountSpec, ConfigError> {
        self.accounts()
            .into_iter()
            .find(|a| a.key.as_str() == key)
            .ok_or_else(|| ConfigError::UnknownAccount(key.to_string()))
    }

    pub fn credential(&self, identity: &str) -> Option<&CredentialConfig> {
        self.credentials.iter().find(|c| c.identity == identity)
    }

    pub fn resource(&self, id: &str) -> Result<&ResourceConfig, ConfigError> {
        self.resources
            .iter()
            .find(|r| r.id == id)
            .ok_or_else(|| ConfigError::UnknownResource(id.to_string()))
    }

    /// Per-action cooldown for a resource.
    pub fn action_cooldown_for(&self, resource_id: &str) -> Duration {
        let secs = self
            .resources
            .iter()
            .find(|r| r.id == resource_id)
            .and_then(|r| r.action_cooldown_secs)
            .unwrap_or(self.worker.action_cooldown_secs);
        Duration::from_secs_f64(secs)
    }

    /// Unix socket the accounting service listens on.
    pub fn socket_path(&self) -> PathBuf {
        self.data_dir.join("rota.sock")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }
}
