//! Shared harness: a scripted in-memory session driver and config helpers.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use secrecy::SecretString;

use rota::config::RotaConfig;
use rota::counter::ExitFlag;
use rota::driver::{DriverFactory, SessionDriver, Target, TargetHandle};
use rota::error::DriverError;

/// Everything a driver was asked to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Open,
    Authenticate(String),
    Select(String),
    Navigate(String),
    Submit(String),
    Refresh,
    Close,
}

#[derive(Debug, Default)]
pub struct Log {
    pub events: Vec<Event>,
    /// Sessions currently on each resource (navigate → close).
    pub live: HashMap<String, usize>,
    /// Highest value `live` reached per resource.
    pub peak: HashMap<String, usize>,
    pub submits: usize,
}

impl Log {
    pub fn submitted(&self) -> Vec<String> {
        self.events
            .iter()
            .filter_map(|e| match e {
                Event::Submit(text) => Some(text.clone()),
                _ => None,
            })
            .collect()
    }
}

/// How scripted drivers behave.
#[derive(Clone, Default)]
pub struct Script {
    /// Target labels offered after login.
    pub targets: Vec<String>,
    pub fail_login: bool,
    /// Fail the Nth submit (1-based, counted across drivers).
    pub fail_submit_at: Option<usize>,
    /// Set this flag right after the Nth submit.
    pub exit_after_submits: Option<(usize, ExitFlag)>,
}

pub struct ScriptedFactory {
    pub script: Script,
    pub log: Arc<Mutex<Log>>,
}

impl ScriptedFactory {
    pub fn new(script: Script) -> Self {
        Self {
            script,
            log: Arc::new(Mutex::new(Log::default())),
        }
    }
}

#[async_trait]
impl DriverFactory for ScriptedFactory {
    async fn create(&self) -> Result<Box<dyn SessionDriver>, DriverError> {
        Ok(Box::new(ScriptedDriver {
            script: self.script.clone(),
            log: Arc::clone(&self.log),
            resource: None,
        }))
    }
}

pub struct ScriptedDriver {
    script: Script,
    log: Arc<Mutex<Log>>,
    resource: Option<String>,
}

impl ScriptedDriver {
    fn record(&self, event: Event) {
        self.log.lock().unwrap().events.push(event);
    }
}

#[async_trait]
impl SessionDriver for ScriptedDriver {
    async fn open(&mut self) -> Result<(), DriverError> {
        self.record(Event::Open);
        Ok(())
    }

    async fn authenticate(
        &mut self,
        identity: &str,
        _secret: &SecretString,
    ) -> Result<(), DriverError> {
        self.record(Event::Authenticate(identity.to_string()));
        if self.script.fail_login {
            return Err(DriverError::failed("authenticate", "bad credentials"));
        }
        Ok(())
    }

    async fn list_targets(&mut self) -> Result<Vec<Target>, DriverError> {
        Ok(self
            .script
            .targets
            .iter()
            .enumerate()
            .map(|(i, label)| Target {
                label: label.clone(),
                handle: TargetHandle(format!("handle-{i}")),
            })
            .collect())
    }

    async fn select_target(&mut self, handle: &TargetHandle) -> Result<(), DriverError> {
        self.record(Event::Select(handle.0.clone()));
        Ok(())
    }

    async fn navigate(&mut self, resource_id: &str) -> Result<(), DriverError> {
        let mut log = self.log.lock().unwrap();
        log.events.push(Event::Navigate(resource_id.to_string()));
        let live = log.live.entry(resource_id.to_string()).or_default();
        *live += 1;
        let now = *live;
        let peak = log.peak.entry(resource_id.to_string()).or_default();
        *peak = (*peak).max(now);
        self.resource = Some(resource_id.to_string());
        Ok(())
    }

    async fn submit_action(&mut self, text: &str) -> Result<(), DriverError> {
        let mut log = self.log.lock().unwrap();
        log.submits += 1;
        let n = log.submits;
        if self.script.fail_submit_at == Some(n) {
            return Err(DriverError::failed("submit_action", "input vanished"));
        }
        log.events.push(Event::Submit(text.to_string()));
        if let Some((after, flag)) = &self.script.exit_after_submits {
            if n == *after {
                flag.set();
            }
        }
        Ok(())
    }

    async fn refresh(&mut self) -> Result<(), DriverError> {
        self.record(Event::Refresh);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), DriverError> {
        let mut log = self.log.lock().unwrap();
        log.events.push(Event::Close);
        if let Some(resource) = self.resource.take() {
            if let Some(live) = log.live.get_mut(&resource) {
                *live -= 1;
            }
        }
        Ok(())
    }
}

/// A task-isolated config with zero delays, two single-slot resources and
/// three accounts on one credential.
pub fn test_config(data_dir: &Path) -> RotaConfig {
    let mut config: RotaConfig = serde_json::from_value(serde_json::json!({
        "isolation": "task",
        "resources": [
            {"id": "stream-a", "capacity": 1},
            {"id": "stream-b", "capacity": 1}
        ],
        "credentials": [
            {"identity": "one@example.com", "secret": "hunter2", "aliases": ["main", "alt", "spare"]}
        ],
        "messages": ["#{seq} ({session})"],
        "worker": {
            "max_actions": 3,
            "refresh_interval": 100,
            "settle_delay_secs": 0.0,
            "action_cooldown_secs": 0.0
        },
        "scheduler": {
            "idle_poll_ms": 5,
            "no_accounts_backoff_secs": 0.01,
            "spawn_pacing_secs": 0.0
        }
    }))
    .unwrap();
    config.data_dir = data_dir.to_path_buf();
    config.validate().unwrap();
    config
}

/// Sequence number out of a `#{seq} ({session})` rendering.
pub fn seq_of(text: &str) -> u64 {
    text.trim_start_matches('#')
        .split_whitespace()
        .next()
        .and_then(|n| n.parse().ok())
        .unwrap()
}
