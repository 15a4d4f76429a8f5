//! Persisted record types.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

fn sha256_hex(input: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input);
    format!("{:x}", hasher.finalize())
}

/// Stable, non-reversible key for one (credential, alias) pair.
///
/// The record file is named by `as_str()` and grouped under a directory named
/// by `credential_hash()`, so plaintext identities never reach the filesystem.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AccountKey {
    credential_hash: String,
    key: String,
}

impl AccountKey {
    pub fn derive(credential_id: &str, alias: &str) -> Self {
        let mut joined = Vec::with_capacity(credential_id.len() + alias.len() + 1);
        joined.extend_from_slice(credential_id.as_bytes());
        joined.push(0);
        joined.extend_from_slice(alias.as_bytes());
        Self {
            credential_hash: sha256_hex(credential_id.as_bytes()),
            key: sha256_hex(&joined),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.key
    }

    pub fn credential_hash(&self) -> &str {
        &self.credential_hash
    }
}

impl fmt::Display for AccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

/// Ownership claim on an account, renewed by the owning worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub holder: Uuid,
    pub pid: u32,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn new(holder: Uuid, ttl: Duration, now: DateTime<Utc>) -> Self {
        Self {
            holder,
            pid: std::process::id(),
            expires_at: now
                + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(365)),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Durable state of one account.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountRecord {
    pub credential_id: Option<String>,
    pub target_alias: Option<String>,
    /// Lifetime action count. Never decreases.
    pub vote_count: u64,
    /// True while a worker owns this account.
    pub active: bool,
    /// End of the most recent session, successful or not.
    pub last_action_at: Option<DateTime<Utc>>,
    pub lease: Option<Lease>,
}

impl AccountRecord {
    /// True if the last session ended less than `window` before `now`.
    pub fn is_cooling_down(&self, now: DateTime<Utc>, window: Duration) -> bool {
        match self.last_action_at {
            None => false,
            Some(last) => {
                let window = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::MAX);
                now.signed_duration_since(last) < window
            }
        }
    }

    /// True if the record claims an owner whose lease has lapsed.
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.active && self.lease.as_ref().is_some_and(|l| l.is_expired(now))
    }
}

/// The single application-wide record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationRecord {
    pub total_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn account_key_is_deterministic_and_fixed_length() {
        let a = AccountKey::derive("one@example.com", "main");
        let b = AccountKey::derive("one@example.com", "main");
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
        assert_eq!(a.credential_hash().len(), 64);
        assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn account_key_separates_fields() {
        // "ab" + "c" must not collide with "a" + "bc".
        assert_ne!(AccountKey::derive("ab", "c"), AccountKey::derive("a", "bc"));
        let main = AccountKey::derive("one@example.com", "main");
        let alt = AccountKey::derive("one@example.com", "alt");
        assert_ne!(main, alt);
        assert_eq!(main.credential_hash(), alt.credential_hash());
    }

    #[test]
    fn never_used_account_is_not_cooling_down() {
        let record = AccountRecord::default();
        assert!(!record.is_cooling_down(Utc::now(), Duration::from_secs(86_400)));
    }

    #[test]
    fn cooldown_window_boundaries() {
        let now = Utc::now();
        let day = Duration::from_secs(86_400);
        let recent = AccountRecord {
            last_action_at: Some(now - chrono::Duration::hours(23)),
            ..Default::default()
        };
        let old = AccountRecord {
            last_action_at: Some(now - chrono::Duration::hours(25)),
            ..Default::default()
        };
        assert!(recent.is_cooling_down(now, day));
        assert!(!old.is_cooling_down(now, day));
    }

    #[test]
    fn lease_expiry_only_matters_while_active() {
        let now = Utc::now();
        let stale = Lease {
            holder: Uuid::new_v4(),
            pid: 1,
            expires_at: now - chrono::Duration::seconds(1),
        };
        let mut record = AccountRecord {
            active: true,
            lease: Some(stale),
            ..Default::default()
        };
        assert!(record.lease_expired(now));
        record.active = false;
        assert!(!record.lease_expired(now));
    }

    #[test]
    fn record_json_uses_snake_case_fields() {
        let record = AccountRecord {
            vote_count: 3,
            ..Default::default()
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["vote_count"], 3);
        assert_eq!(json["active"], false);
        assert!(json["last_action_at"].is_null());
    }
}
