//! Orchestrator driving real worker tasks against a scripted driver.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use rota::config::{AccountSpec, RotaConfig};
use rota::counter::{ExitFlag, LocalCounter};
use rota::scheduler::{Orchestrator, TaskLauncher, Tick};
use rota::store::{AccountRecord, StateStore};
use rota::worker::WorkerDeps;

use common::{Script, ScriptedFactory, test_config};

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

fn every_alias() -> Script {
    Script {
        targets: vec!["main".into(), "alt".into(), "spare".into()],
        ..Default::default()
    }
}

async fn orchestrator(
    config: &RotaConfig,
    store: &StateStore,
    factory: Arc<ScriptedFactory>,
    exit: &ExitFlag,
) -> Orchestrator {
    let deps = WorkerDeps {
        store: store.clone(),
        counter: Arc::new(LocalCounter::new(0)),
        exit: Arc::new(exit.clone()),
        drivers: factory,
    };
    let launcher = Arc::new(TaskLauncher::new(Arc::new(config.clone()), deps));
    Orchestrator::new(config, store.clone(), launcher, exit.clone())
}

#[tokio::test]
async fn never_exceeds_capacity_per_resource() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.worker.max_actions = 4;
    config.worker.action_cooldown_secs = 0.01;
    let store = StateStore::open(dir.path()).await.unwrap();
    let factory = Arc::new(ScriptedFactory::new(every_alias()));
    let exit = ExitFlag::new();

    let mut orch = orchestrator(&config, &store, factory.clone(), &exit).await;

    // Run until all three accounts have had a session.
    let accounts = config.accounts();
    let watcher = {
        let store = store.clone();
        let exit = exit.clone();
        let accounts = accounts.clone();
        tokio::spawn(async move {
            loop {
                let mut done = 0;
                for account in &accounts {
                    let record = store.load(&account.key).await.unwrap();
                    if record.last_action_at.is_some() && !record.active {
                        done += 1;
                    }
                }
                if done == accounts.len() {
                    exit.set();
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
    };

    tokio::time::timeout(TEST_TIMEOUT, orch.run()).await.unwrap();
    watcher.await.unwrap();

    let log = factory.log.lock().unwrap();
    assert!(log.peak.values().all(|&peak| peak <= 1), "peaks {:?}", log.peak);
    assert_eq!(log.submitted().len(), 12);
    drop(log);

    for account in &accounts {
        let record = store.load(&account.key).await.unwrap();
        assert_eq!(record.vote_count, 4, "{}", account.label());
        assert!(!record.active);
    }
}

#[tokio::test]
async fn active_accounts_are_never_selected() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let store = StateStore::open(dir.path()).await.unwrap();
    let factory = Arc::new(ScriptedFactory::new(every_alias()));
    let exit = ExitFlag::new();

    let held = AccountSpec::new("one@example.com", "main");
    store
        .save(
            &held.key,
            &AccountRecord {
                active: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let mut orch = orchestrator(&config, &store, factory, &exit).await;
    for _ in 0..20 {
        match orch.tick().await {
            Tick::Launched(assignment) => assert_ne!(assignment.account, held),
            Tick::LaunchFailed(assignment) => panic!("launch failed for {}", assignment.name()),
            Tick::Saturated | Tick::NoEligibleAccounts { .. } => {}
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    exit.set();

    let record = store.load(&held.key).await.unwrap();
    assert!(record.active);
    assert_eq!(record.vote_count, 0);
}

#[tokio::test]
async fn expired_lease_is_reclaimed() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.credentials[0].aliases = vec!["main".into()];
    let store = StateStore::open(dir.path()).await.unwrap();
    let factory = Arc::new(ScriptedFactory::new(every_alias()));
    let exit = ExitFlag::new();

    let crashed = AccountSpec::new("one@example.com", "main");
    store
        .save(
            &crashed.key,
            &AccountRecord {
                active: true,
                lease: Some(rota::store::Lease {
                    holder: uuid::Uuid::new_v4(),
                    pid: 1,
                    expires_at: Utc::now() - chrono::Duration::minutes(1),
                }),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let mut orch = orchestrator(&config, &store, factory, &exit).await;
    match orch.tick().await {
        Tick::Launched(assignment) => assert_eq!(assignment.account, crashed),
        other => panic!("expected a launch, got {other:?}"),
    }
    exit.set();
}

#[tokio::test]
async fn cooling_down_accounts_are_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let store = StateStore::open(dir.path()).await.unwrap();
    let factory = Arc::new(ScriptedFactory::new(every_alias()));
    let exit = ExitFlag::new();

    for account in config.accounts() {
        store
            .save(
                &account.key,
                &AccountRecord {
                    last_action_at: Some(Utc::now() - chrono::Duration::hours(1)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
    }

    let mut orch = orchestrator(&config, &store, factory, &exit).await;
    assert_eq!(
        orch.tick().await,
        Tick::NoEligibleAccounts {
            resource_id: "stream-a".into()
        }
    );
    assert_eq!(orch.live_workers("stream-a"), 0);
}

#[tokio::test]
async fn live_worker_keeps_account_after_lease_lapses() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.credentials[0].aliases = vec!["main".into()];
    // Set after validation: a lease shorter than the pause between actions.
    config.worker.lease_ttl_secs = 1;
    config.worker.action_cooldown_secs = 1.5;
    config.worker.max_actions = 2;
    let store = StateStore::open(dir.path()).await.unwrap();
    let factory = Arc::new(ScriptedFactory::new(every_alias()));
    let exit = ExitFlag::new();
    let account = AccountSpec::new("one@example.com", "main");

    let mut orch = orchestrator(&config, &store, factory.clone(), &exit).await;
    match orch.tick().await {
        Tick::Launched(assignment) => assert_eq!(assignment.resource_id, "stream-a"),
        other => panic!("expected a launch, got {other:?}"),
    }

    // The worker is mid-cooldown with a lapsed lease.
    tokio::time::sleep(Duration::from_millis(1300)).await;
    let record = store.load(&account.key).await.unwrap();
    assert!(record.active);
    assert!(record.lease_expired(Utc::now()));
    assert!(orch.is_running(&account));

    assert_eq!(
        orch.tick().await,
        Tick::NoEligibleAccounts {
            resource_id: "stream-b".into()
        }
    );
    exit.set();

    let log = factory.log.lock().unwrap();
    assert!(log.peak.values().all(|&peak| peak <= 1), "peaks {:?}", log.peak);
    assert_eq!(log.peak.get("stream-b"), None);
}

#[tokio::test]
async fn account_signing_in_is_not_selected_twice() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.credentials[0].aliases = vec!["main".into()];
    config.worker.settle_delay_secs = 0.3;
    let store = StateStore::open(dir.path()).await.unwrap();
    let factory = Arc::new(ScriptedFactory::new(every_alias()));
    let exit = ExitFlag::new();

    let mut orch = orchestrator(&config, &store, factory, &exit).await;
    let first = orch.tick().await;
    assert!(matches!(&first, Tick::Launched(a) if a.resource_id == "stream-a"));

    // Still inside the post-login settle, so the record is not yet active.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!store.load(&first_account().key).await.unwrap().active);
    assert_eq!(
        orch.tick().await,
        Tick::NoEligibleAccounts {
            resource_id: "stream-b".into()
        }
    );
    exit.set();
}

fn first_account() -> AccountSpec {
    AccountSpec::new("one@example.com", "main")
}
