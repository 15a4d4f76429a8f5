//! The scheduling loop.
//!
//! Each iteration fills at most one worker slot: the first resource (in
//! configuration order) with spare capacity gets one randomly chosen eligible
//! account. Capacity is counted from launched handles, not from account
//! records, so a slot stays taken until its worker is seen to exit. An account
//! with a live handle is never offered again, whatever its record says: the
//! record is only claimed once the worker has signed in, and its lease may
//! lapse while the worker is stuck in a slow driver call.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::seq::SliceRandom;
use tracing::{debug, error, info, warn};

use crate::config::{AccountSpec, ResourceConfig, RotaConfig, SchedulerConfig};
use crate::counter::ExitFlag;
use crate::scheduler::eligibility::eligible_accounts;
use crate::scheduler::launcher::{Assignment, WorkerHandle, WorkerLauncher};
use crate::store::StateStore;

/// Outcome of one scheduling decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tick {
    /// Every resource is at capacity.
    Saturated,
    /// A resource has room but no account is eligible.
    NoEligibleAccounts { resource_id: String },
    Launched(Assignment),
    /// The launcher refused; the slot stays free.
    LaunchFailed(Assignment),
}

/// A launched worker and the account it drives.
struct Tracked {
    account: AccountSpec,
    handle: Box<dyn WorkerHandle>,
}

pub struct Orchestrator {
    resources: Vec<ResourceConfig>,
    accounts: Vec<AccountSpec>,
    settings: SchedulerConfig,
    store: StateStore,
    launcher: Arc<dyn WorkerLauncher>,
    exit: ExitFlag,
    live: HashMap<String, Vec<Tracked>>,
}

impl Orchestrator {
    pub fn new(
        config: &RotaConfig,
        store: StateStore,
        launcher: Arc<dyn WorkerLauncher>,
        exit: ExitFlag,
    ) -> Self {
        Self {
            resources: config.resources.clone(),
            accounts: config.accounts(),
            settings: config.scheduler.clone(),
            store,
            launcher,
            exit,
            live: HashMap::new(),
        }
    }

    /// Workers launched for `resource_id` that have not been seen to exit.
    pub fn live_workers(&self, resource_id: &str) -> usize {
        self.live.get(resource_id).map_or(0, Vec::len)
    }

    /// Whether a launched worker for `account` has not been seen to exit.
    pub fn is_running(&self, account: &AccountSpec) -> bool {
        self.live
            .values()
            .flatten()
            .any(|t| t.account.key == account.key)
    }

    /// Drop handles whose worker has exited.
    fn prune(&mut self) {
        for tracked in self.live.values_mut() {
            tracked.retain_mut(|t| {
                let alive = t.handle.is_alive();
                if !alive {
                    debug!(worker = %t.handle.name(), "Released worker slot");
                }
                alive
            });
        }
    }

    fn free_resource(&self) -> Option<&ResourceConfig> {
        self.resources
            .iter()
            .find(|r| self.live_workers(&r.id) < r.capacity)
    }

    /// Make one scheduling decision.
    pub async fn tick(&mut self) -> Tick {
        self.prune();

        let Some(resource_id) = self.free_resource().map(|r| r.id.clone()) else {
            return Tick::Saturated;
        };

        let mut eligible = eligible_accounts(
            &self.store,
            &self.accounts,
            Utc::now(),
            self.settings.account_cooldown(),
        )
        .await;
        eligible.retain(|account| {
            let running = self.is_running(account);
            if running {
                debug!(account = %account.label(), "Skipped: worker still running");
            }
            !running
        });

        let Some(account) = eligible.choose(&mut rand::thread_rng()).cloned() else {
            warn!(
                resource = %resource_id,
                backoff_secs = self.settings.no_accounts_backoff().as_secs_f64(),
                "No eligible accounts, backing off"
            );
            return Tick::NoEligibleAccounts { resource_id };
        };

        let assignment = Assignment {
            account,
            resource_id,
        };
        match self.launcher.launch(assignment.clone()) {
            Ok(handle) => {
                info!(
                    worker = %assignment.name(),
                    eligible = eligible.len(),
                    "Launched worker"
                );
                self.live
                    .entry(assignment.resource_id.clone())
                    .or_default()
                    .push(Tracked {
                        account: assignment.account.clone(),
                        handle,
                    });
                Tick::Launched(assignment)
            }
            Err(e) => {
                error!(worker = %assignment.name(), error = %e, "Failed to launch worker");
                Tick::LaunchFailed(assignment)
            }
        }
    }

    fn pause_after(&self, tick: &Tick) -> Duration {
        match tick {
            Tick::Saturated => self.settings.idle_poll(),
            Tick::NoEligibleAccounts { .. } => self.settings.no_accounts_backoff(),
            Tick::Launched(_) | Tick::LaunchFailed(_) => self.settings.spawn_pacing(),
        }
    }

    /// Schedule until the exit flag is set. Running workers are not awaited;
    /// they observe the same flag and wind down on their own.
    pub async fn run(&mut self) {
        info!(
            resources = self.resources.len(),
            accounts = self.accounts.len(),
            "Orchestrator started"
        );

        loop {
            if self.exit.is_set() {
                break;
            }
            let tick = self.tick().await;
            let pause = self.pause_after(&tick);
            if self.exit.sleep_or_exit(pause).await {
                break;
            }
        }

        // Make sure workers see the request even if it came from elsewhere.
        self.exit.set();
        self.prune();
        let still_running: usize = self.live.values().map(Vec::len).sum();
        info!(still_running, "Orchestrator stopped");
    }
}
