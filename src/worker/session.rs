//! One worker's session: login, target switch, resource open, then a bounded
//! action loop ending in an [`ExitReason`].
//!
//! The account record is only ever written by the session that owns it, so
//! reads and writes here need no locking.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use secrecy::SecretString;
use tracing::{Instrument, debug, error, info, warn};
use uuid::Uuid;

use crate::config::{AccountSpec, RotaConfig, WorkerConfig, inflated_cooldown};
use crate::counter::{ExitSignal, SharedCounter};
use crate::driver::{DriverFactory, SessionDriver};
use crate::error::{ConfigError, DriverError, WorkerError};
use crate::store::{AccountRecord, Lease, StateStore};
use crate::worker::message::MessagePool;
use crate::worker::state::{ExitReason, WorkerState};

/// What a worker is bound to.
pub struct WorkerBinding {
    pub account: AccountSpec,
    pub secret: SecretString,
    pub resource_id: String,
    pub messages: MessagePool,
    /// Nominal pause between actions, before inflation.
    pub action_cooldown: Duration,
    pub settings: WorkerConfig,
}

impl WorkerBinding {
    /// Resolve the secret, messages and timings for `account` on `resource_id`.
    pub fn from_config(
        config: &RotaConfig,
        account: AccountSpec,
        resource_id: &str,
    ) -> Result<Self, ConfigError> {
        config.resource(resource_id)?;
        let credential = config
            .credential(&account.credential_id)
            .ok_or_else(|| ConfigError::UnknownAccount(account.label()))?;
        let messages =
            MessagePool::new(config.messages.clone()).ok_or_else(|| ConfigError::InvalidValue {
                key: "messages".into(),
                message: "at least one message template is required".into(),
            })?;

        Ok(Self {
            secret: credential.clone().secret,
            resource_id: resource_id.to_string(),
            messages,
            action_cooldown: config.action_cooldown_for(resource_id),
            settings: config.worker.clone(),
            account,
        })
    }
}

/// Shared collaborators.
#[derive(Clone)]
pub struct WorkerDeps {
    pub store: StateStore,
    pub counter: Arc<dyn SharedCounter>,
    pub exit: Arc<dyn ExitSignal>,
    pub drivers: Arc<dyn DriverFactory>,
}

/// A worker session for one (account, resource) pair.
pub struct WorkerSession {
    binding: WorkerBinding,
    deps: WorkerDeps,
    driver: Option<Box<dyn SessionDriver>>,
    state: WorkerState,
    record: AccountRecord,
    session_count: u32,
    lease_holder: Uuid,
}

impl WorkerSession {
    /// Bind the session and load the account record. Leaves the session in
    /// `LoggingIn`.
    pub async fn prepare(binding: WorkerBinding, deps: WorkerDeps) -> Result<Self, WorkerError> {
        let mut record = deps.store.load(&binding.account.key).await?;
        record.credential_id = Some(binding.account.credential_id.clone());
        record.target_alias = Some(binding.account.alias.clone());

        let mut session = Self {
            binding,
            deps,
            driver: None,
            state: WorkerState::Idle,
            record,
            session_count: 0,
            lease_holder: Uuid::new_v4(),
        };
        session.transition(WorkerState::LoggingIn)?;
        Ok(session)
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn record(&self) -> &AccountRecord {
        &self.record
    }

    /// Actions completed in this session.
    pub fn session_count(&self) -> u32 {
        self.session_count
    }

    fn label(&self) -> String {
        self.binding.account.label()
    }

    fn transition(&mut self, to: WorkerState) -> Result<(), WorkerError> {
        if !self.state.can_transition_to(to) {
            return Err(WorkerError::InvalidTransition {
                from: self.state.to_string(),
                to: to.to_string(),
            });
        }
        debug!(from = %self.state, to = %to, "Worker transition");
        self.state = to;
        Ok(())
    }

    fn driver(&mut self) -> Result<&mut dyn SessionDriver, WorkerError> {
        match self.driver.as_deref_mut() {
            Some(driver) => Ok(driver),
            None => Err(DriverError::Exited.into()),
        }
    }

    // Field-level borrows only: the session itself is not `Sync`, so no
    // `&self` may be held across an await.
    async fn save(&mut self) -> Result<(), WorkerError> {
        let Self {
            deps,
            binding,
            record,
            ..
        } = self;
        deps.store.save(&binding.account.key, record).await?;
        Ok(())
    }

    fn renew_lease(&mut self) {
        self.record.lease = Some(Lease::new(
            self.lease_holder,
            self.binding.settings.lease_ttl(),
            Utc::now(),
        ));
    }

    /// `LoggingIn → SwitchingTarget`.
    pub async fn login(&mut self) -> Result<(), WorkerError> {
        info!(identity = %self.binding.account.credential_id, "Signing in");
        let created = self.deps.drivers.create().await?;
        let driver = self.driver.insert(created);
        driver.open().await?;
        driver
            .authenticate(&self.binding.account.credential_id, &self.binding.secret)
            .await?;
        tokio::time::sleep(self.binding.settings.settle_delay()).await;

        self.transition(WorkerState::SwitchingTarget)
    }

    /// `SwitchingTarget → OpeningResource`.
    pub async fn switch_target(&mut self) -> Result<(), WorkerError> {
        let alias = self.binding.account.alias.clone();
        info!(alias = %alias, "Switching target");

        let targets = self.driver()?.list_targets().await?;
        debug!(
            available = %targets.iter().map(|t| t.label.as_str()).collect::<Vec<_>>().join(", "),
            "Targets offered"
        );

        let Some(target) = targets.iter().find(|t| t.label == alias) else {
            return Err(WorkerError::TargetNotFound {
                alias,
                available: targets
                    .iter()
                    .map(|t| t.label.as_str())
                    .collect::<Vec<_>>()
                    .join(", "),
            });
        };

        let handle = target.handle.clone();
        self.driver()?.select_target(&handle).await?;
        tokio::time::sleep(self.binding.settings.settle_delay()).await;

        self.transition(WorkerState::OpeningResource)
    }

    /// `OpeningResource → Voting`. Claims the account.
    pub async fn open_resource(&mut self) -> Result<(), WorkerError> {
        let resource_id = self.binding.resource_id.clone();
        info!(resource = %resource_id, "Opening resource");

        self.driver()?.navigate(&resource_id).await?;
        tokio::time::sleep(self.binding.settings.settle_delay()).await;

        self.record.active = true;
        self.renew_lease();
        self.save().await?;

        self.transition(WorkerState::Voting)
    }

    /// The bounded action loop. Returns `Finished` or `Forced`; failures are
    /// returned as errors for the caller to classify.
    pub async fn action_loop(&mut self) -> Result<ExitReason, WorkerError> {
        info!(max_actions = self.binding.settings.max_actions, "Starting action loop");
        let pause = inflated_cooldown(self.binding.action_cooldown);

        loop {
            if self.deps.exit.exit_requested().await {
                info!(session_count = self.session_count, "Exit requested, stopping");
                return Ok(ExitReason::Forced);
            }

            // Counted before submission; a failed submit still leaves the
            // persisted count incremented.
            self.session_count += 1;
            self.record.vote_count += 1;
            self.renew_lease();
            self.save().await?;

            let seq = match self.deps.counter.increment().await {
                Ok(seq) => seq,
                Err(e) => {
                    // Losing the accounting service during shutdown is a stop,
                    // not a failure.
                    if self.deps.exit.exit_requested().await {
                        info!(
                            error = %e,
                            session_count = self.session_count,
                            "Counter gone after exit request, stopping"
                        );
                        return Ok(ExitReason::Forced);
                    }
                    return Err(e.into());
                }
            };
            self.act(seq).await?;

            if self.session_count >= self.binding.settings.max_actions {
                info!(session_count = self.session_count, "Action cap reached");
                return Ok(ExitReason::Finished);
            }

            tokio::time::sleep(pause).await;
        }
    }

    /// Perform the action numbered `seq`.
    async fn act(&mut self, seq: u64) -> Result<(), WorkerError> {
        let text = self
            .binding
            .messages
            .render(seq, self.session_count, &mut rand::thread_rng());

        self.driver()?.submit_action(&text).await?;
        debug!(
            seq,
            account_count = self.record.vote_count,
            session_count = self.session_count,
            "Action submitted"
        );

        let interval = self.binding.settings.refresh_interval;
        if interval > 0 && seq % interval == 0 {
            debug!(seq, "Refreshing session");
            self.driver()?.refresh().await?;
            tokio::time::sleep(self.binding.settings.settle_delay()).await;
        }
        Ok(())
    }

    /// Enter the terminal state: release the account, stamp the session end
    /// and close the driver. Runs on every exit path.
    pub async fn finish(&mut self, reason: ExitReason) -> ExitReason {
        if let Some(previous) = self.state.exit_reason() {
            warn!(previous = %previous, "Session already finished");
            return previous;
        }
        self.state = WorkerState::Terminated(reason);

        self.record.active = false;
        self.record.last_action_at = Some(Utc::now());
        self.record.lease = None;
        if let Err(e) = self.save().await {
            error!(error = %e, "Failed to persist final account record");
        }

        if let Some(mut driver) = self.driver.take() {
            if let Err(e) = driver.close().await {
                warn!(error = %e, "Driver close failed");
            }
        }

        reason
    }

    async fn drive(&mut self) -> Result<ExitReason, WorkerError> {
        self.login().await?;
        self.switch_target().await?;
        self.open_resource().await?;
        self.action_loop().await
    }

    /// Run the session to completion.
    pub async fn run(mut self) -> ExitReason {
        let span = tracing::info_span!(
            "worker",
            account = %self.label(),
            resource = %self.binding.resource_id
        );

        async move {
            let reason = match self.drive().await {
                Ok(reason) => reason,
                Err(e) => {
                    let reason = e.exit_reason();
                    if reason == ExitReason::DriverError
                        && self.state == WorkerState::Voting
                        && self.session_count > 0
                    {
                        // The failed attempt does not count for the session.
                        self.session_count -= 1;
                    }
                    error!(
                        error = %e,
                        state = %self.state,
                        session_count = self.session_count,
                        reason = %reason,
                        "Worker failed"
                    );
                    reason
                }
            };

            let reason = self.finish(reason).await;
            info!(
                reason = %reason,
                session_count = self.session_count,
                vote_count = self.record.vote_count,
                "Worker ended"
            );
            reason
        }
        .instrument(span)
        .await
    }
}

/// Prepare and run a worker. A session that cannot even be prepared ends as
/// `Unknown` without touching the account record.
pub async fn run_worker(binding: WorkerBinding, deps: WorkerDeps) -> ExitReason {
    let label = binding.account.label();
    match WorkerSession::prepare(binding, deps).await {
        Ok(session) => session.run().await,
        Err(e) => {
            error!(account = %label, error = %e, "Worker could not be prepared");
            ExitReason::Unknown
        }
    }
}
