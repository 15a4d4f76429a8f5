//! Global action accounting and the cooperative exit signal.
//!
//! The scheduler process owns the one authoritative counter
//! ([`LocalCounter`]). Workers in other processes reach it through
//! [`CounterClient`] over a Unix socket served by [`CounterService`], so
//! increments are serialized in a single place. Persistence of the running
//! total is done by one aggregator task fed by the counter's change channel.

pub mod client;
pub mod protocol;
pub mod service;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify, watch};
use tokio::task::JoinHandle;

use crate::error::CounterError;
use crate::store::{ApplicationRecord, StateStore};

pub use client::CounterClient;
pub use service::{CounterService, ServiceHandle};

/// A monotonically increasing counter shared by every worker.
#[async_trait]
pub trait SharedCounter: Send + Sync {
    /// Add one and return the new total.
    async fn increment(&self) -> Result<u64, CounterError>;

    /// Current total, without mutation.
    async fn value(&self) -> Result<u64, CounterError>;
}

/// Cooperative cancellation, polled at the top of each loop iteration.
#[async_trait]
pub trait ExitSignal: Send + Sync {
    async fn exit_requested(&self) -> bool;
}

/// The authoritative in-process counter.
pub struct LocalCounter {
    value: Mutex<u64>,
    changes: watch::Sender<u64>,
}

impl LocalCounter {
    pub fn new(initial: u64) -> Self {
        let (changes, _rx) = watch::channel(initial);
        Self {
            value: Mutex::new(initial),
            changes,
        }
    }

    /// Subscribe to value changes. Receivers always observe the latest value;
    /// intermediate values may be coalesced.
    pub fn on_change(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }
}

#[async_trait]
impl SharedCounter for LocalCounter {
    async fn increment(&self) -> Result<u64, CounterError> {
        let mut value = self.value.lock().await;
        *value += 1;
        let new_value = *value;
        // Published under the lock so subscribers never see the total go backwards.
        self.changes.send_replace(new_value);
        Ok(new_value)
    }

    async fn value(&self) -> Result<u64, CounterError> {
        Ok(*self.value.lock().await)
    }
}

/// Spawn the task that persists the running total.
///
/// Writes the latest value after every change and flushes once more when the
/// counter is dropped.
pub fn spawn_persistence(store: StateStore, mut changes: watch::Receiver<u64>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut persisted = *changes.borrow_and_update();

        while changes.changed().await.is_ok() {
            let value = *changes.borrow_and_update();
            persist_total(&store, value).await;
            persisted = value;
        }

        let last = *changes.borrow();
        if last != persisted {
            persist_total(&store, last).await;
        }
        tracing::debug!(total = last, "Counter persistence stopped");
    })
}

async fn persist_total(store: &StateStore, total_count: u64) {
    if let Err(e) = store
        .save_application(&ApplicationRecord { total_count })
        .await
    {
        tracing::warn!(error = %e, total = total_count, "Failed to persist application total");
    }
}

#[derive(Default)]
struct ExitInner {
    set: AtomicBool,
    notify: Notify,
}

/// Process-local exit flag.
#[derive(Clone, Default)]
pub struct ExitFlag {
    inner: Arc<ExitInner>,
}

impl ExitFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.inner.set.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_set(&self) -> bool {
        self.inner.set.load(Ordering::SeqCst)
    }

    /// Sleep for `duration`, waking early if the flag is set.
    /// Returns whether the flag is set on wake.
    pub async fn sleep_or_exit(&self, duration: Duration) -> bool {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if self.is_set() {
            return true;
        }

        tokio::select! {
            _ = tokio::time::sleep(duration) => self.is_set(),
            _ = notified => true,
        }
    }
}

impl std::fmt::Debug for ExitFlag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExitFlag").field("set", &self.is_set()).finish()
    }
}

#[async_trait]
impl ExitSignal for ExitFlag {
    async fn exit_requested(&self) -> bool {
        self.is_set()
    }
}

/// Install SIGINT/SIGTERM handlers that set `flag`.
pub fn install_shutdown_handler(flag: ExitFlag) -> std::io::Result<JoinHandle<()>> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    Ok(tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, requesting exit");
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, requesting exit");
            }
        }
        flag.set();
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn increments_are_unique_under_contention() {
        let counter = Arc::new(LocalCounter::new(10));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let counter = Arc::clone(&counter);
            handles.push(tokio::spawn(async move {
                let mut seen = Vec::new();
                for _ in 0..25 {
                    seen.push(counter.increment().await.unwrap());
                }
                seen
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            let seen = handle.await.unwrap();
            assert!(seen.windows(2).all(|w| w[0] < w[1]));
            all.extend(seen);
        }
        all.sort_unstable();
        assert_eq!(all, (11..=210).collect::<Vec<u64>>());
        assert_eq!(counter.value().await.unwrap(), 210);
    }

    #[tokio::test]
    async fn on_change_sees_latest_value() {
        let counter = LocalCounter::new(0);
        let mut rx = counter.on_change();
        counter.increment().await.unwrap();
        counter.increment().await.unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), 2);
    }

    #[tokio::test]
    async fn persistence_flushes_final_total() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path()).await.unwrap();
        let counter = LocalCounter::new(5);
        let task = spawn_persistence(store.clone(), counter.on_change());

        for _ in 0..3 {
            counter.increment().await.unwrap();
        }
        drop(counter);
        task.await.unwrap();

        assert_eq!(store.load_application().await.unwrap().total_count, 8);
    }

    #[tokio::test]
    async fn exit_flag_wakes_sleepers() {
        let flag = ExitFlag::new();
        let sleeper = {
            let flag = flag.clone();
            tokio::spawn(async move { flag.sleep_or_exit(Duration::from_secs(30)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        flag.set();
        let woke = tokio::time::timeout(Duration::from_secs(2), sleeper)
            .await
            .expect("sleeper should wake early")
            .unwrap();
        assert!(woke);
        assert!(flag.exit_requested().await);
    }

    #[tokio::test]
    async fn unset_flag_sleeps_full_duration() {
        let flag = ExitFlag::new();
        assert!(!flag.sleep_or_exit(Duration::from_millis(5)).await);
    }
}
