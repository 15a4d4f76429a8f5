//! Account eligibility.
//!
//! An account may be handed to a new worker when it is not owned by a live
//! worker and its last session ended at least one cooldown window ago.
//! Ownership is an `active` flag backed by a lease; an `active` record whose
//! lease has lapsed belongs to a worker that died and is reclaimed.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::config::AccountSpec;
use crate::store::{AccountRecord, StateStore};

/// Why an account is or is not eligible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eligibility {
    Eligible,
    /// Marked active, but the owner's lease expired.
    Reclaimable,
    Active,
    CoolingDown,
}

impl Eligibility {
    pub fn is_eligible(&self) -> bool {
        matches!(self, Self::Eligible | Self::Reclaimable)
    }
}

/// Classify one record.
pub fn classify(record: &AccountRecord, now: DateTime<Utc>, window: Duration) -> Eligibility {
    if record.active && !record.lease_expired(now) {
        return Eligibility::Active;
    }
    if record.is_cooling_down(now, window) {
        return Eligibility::CoolingDown;
    }
    if record.active {
        Eligibility::Reclaimable
    } else {
        Eligibility::Eligible
    }
}

/// Load every account's record and keep the eligible ones.
///
/// A record that cannot be read makes only that account ineligible.
pub async fn eligible_accounts(
    store: &StateStore,
    accounts: &[AccountSpec],
    now: DateTime<Utc>,
    window: Duration,
) -> Vec<AccountSpec> {
    let mut eligible = Vec::new();

    for account in accounts {
        let record = match store.load(&account.key).await {
            Ok(record) => record,
            Err(e) => {
                warn!(account = %account.label(), error = %e, "Skipping unreadable account record");
                continue;
            }
        };

        match classify(&record, now, window) {
            Eligibility::Eligible => eligible.push(account.clone()),
            Eligibility::Reclaimable => {
                warn!(
                    account = %account.label(),
                    pid = record.lease.as_ref().map(|l| l.pid),
                    "Reclaiming account whose worker lease expired"
                );
                eligible.push(account.clone());
            }
            Eligibility::Active => {
                debug!(account = %account.label(), "Skipped: active");
            }
            Eligibility::CoolingDown => {
                let since = record
                    .last_action_at
                    .map(|t| now.signed_duration_since(t).num_seconds())
                    .unwrap_or_default();
                debug!(account = %account.label(), since_secs = since, "Skipped: cooling down");
            }
        }
    }

    debug!(
        accounts = %eligible.iter().map(|a| a.label()).collect::<Vec<_>>().join(", "),
        "Fetched eligible accounts"
    );
    eligible
}
