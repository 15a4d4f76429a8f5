use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};

use rota::config::{DEFAULT_CONFIG_PATH, Isolation, RotaConfig};
use rota::counter::{
    self, CounterClient, CounterService, ExitFlag, LocalCounter, SharedCounter,
};
use rota::driver::{CommandDriverFactory, DriverFactory};
use rota::scheduler::{Orchestrator, ProcessLauncher, TaskLauncher, WorkerLauncher};
use rota::store::{ApplicationRecord, StateStore};
use rota::worker::{ExitReason, WorkerBinding, WorkerDeps, run_worker};

const PERSISTENCE_GRACE: Duration = Duration::from_secs(2);

#[derive(Parser)]
#[command(name = "rota", version, about = "Rotate accounts across capacity-limited resources")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler until SIGINT/SIGTERM
    Run {
        #[arg(long, env = "ROTA_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },
    /// Run a single worker session (started by `run`)
    #[command(hide = true)]
    Worker {
        #[arg(long)]
        config: PathBuf,
        /// Account key
        #[arg(long)]
        account: String,
        #[arg(long)]
        resource: String,
        /// Accounting service socket
        #[arg(long)]
        socket: PathBuf,
    },
    /// Print every account's record
    Status {
        #[arg(long, env = "ROTA_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run { config } => run(&config).await,
        Command::Worker {
            config,
            account,
            resource,
            socket,
        } => {
            let reason = worker(&config, &account, &resource, &socket).await?;
            // Finished and Forced are clean exits.
            if matches!(reason, ExitReason::DriverError | ExitReason::Unknown) {
                std::process::exit(1);
            }
            Ok(())
        }
        Command::Status { config } => status(&config).await,
    }
}

fn load_config(path: &Path) -> Result<RotaConfig> {
    RotaConfig::load(path).with_context(|| format!("loading {}", path.display()))
}

async fn run(config_path: &Path) -> Result<()> {
    let config = Arc::new(load_config(config_path)?);
    let log_dir = config.log_dir();
    let _log_guard = rota::logging::init(Some(&log_dir), "rota");

    eprintln!("rota v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Data: {}", config.data_dir.display());
    eprintln!("   Isolation: {:?}", config.isolation);
    eprintln!(
        "   Resources: {}",
        config
            .resources
            .iter()
            .map(|r| format!("{}x{}", r.id, r.capacity))
            .collect::<Vec<_>>()
            .join(", ")
    );
    eprintln!("   Accounts: {}\n", config.accounts().len());

    let store = StateStore::open(&config.data_dir)
        .await
        .context("opening state store")?;

    let application = store
        .load_application()
        .await
        .context("loading application record")?;
    let local = Arc::new(LocalCounter::new(application.total_count));
    let persistence = counter::spawn_persistence(store.clone(), local.on_change());
    info!(total = application.total_count, "Counter restored");

    let exit = ExitFlag::new();
    let _signals = counter::install_shutdown_handler(exit.clone())
        .context("installing signal handlers")?;

    let service = CounterService::bind(config.socket_path(), Arc::clone(&local), exit.clone())
        .context("binding accounting socket")?
        .spawn();

    let launcher: Arc<dyn WorkerLauncher> = match config.isolation {
        Isolation::Process => {
            let config_path = std::fs::canonicalize(config_path)
                .with_context(|| format!("resolving {}", config_path.display()))?;
            Arc::new(ProcessLauncher::new(config_path, service.path().to_path_buf())?)
        }
        Isolation::Task => {
            let drivers = driver_factory(&config)?;
            let deps = WorkerDeps {
                store: store.clone(),
                counter: local.clone(),
                exit: Arc::new(exit.clone()),
                drivers,
            };
            Arc::new(TaskLauncher::new(Arc::clone(&config), deps))
        }
    };

    let mut orchestrator = Orchestrator::new(&config, store.clone(), launcher, exit);
    orchestrator.run().await;

    service.shutdown();
    drop(orchestrator);

    // Task workers still hold the counter while they wind down, which keeps
    // the persistence task alive; flush directly if it does not finish.
    let total = local.value().await?;
    drop(local);
    if tokio::time::timeout(PERSISTENCE_GRACE, persistence).await.is_err() {
        store
            .save_application(&ApplicationRecord { total_count: total })
            .await
            .context("persisting application record")?;
    }
    info!(total, "Shut down");
    Ok(())
}

fn driver_factory(config: &RotaConfig) -> Result<Arc<dyn DriverFactory>> {
    let factory = CommandDriverFactory::from_config(&config.driver)
        .context("driver.command is not configured")?;
    Ok(Arc::new(factory))
}

async fn worker(
    config_path: &Path,
    account_key: &str,
    resource_id: &str,
    socket: &Path,
) -> Result<ExitReason> {
    let config = load_config(config_path)?;
    let account = config.find_account(account_key)?;
    let _log_guard = rota::logging::init(Some(&config.log_dir()), "worker");

    let local_exit = ExitFlag::new();
    let _signals = counter::install_shutdown_handler(local_exit.clone())
        .context("installing signal handlers")?;
    let client = Arc::new(
        CounterClient::connect(socket, local_exit)
            .await
            .context("connecting to accounting service")?,
    );

    let store = StateStore::open(&config.data_dir)
        .await
        .context("opening state store")?;
    let binding = WorkerBinding::from_config(&config, account, resource_id)?;
    let deps = WorkerDeps {
        store,
        counter: client.clone(),
        exit: client,
        drivers: driver_factory(&config)?,
    };

    let reason = run_worker(binding, deps).await;
    if matches!(reason, ExitReason::DriverError | ExitReason::Unknown) {
        error!(reason = %reason, "Worker exited abnormally");
    }
    Ok(reason)
}

async fn status(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let store = StateStore::open(&config.data_dir)
        .await
        .context("opening state store")?;
    let now = chrono::Utc::now();

    println!(
        "{:<40} {:>6} {:>8} {:<25} {}",
        "ACCOUNT", "ACTIVE", "VOTES", "LAST ACTION", "LEASE"
    );
    for account in config.accounts() {
        let record = store.load(&account.key).await?;
        let last = record
            .last_action_at
            .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
            .unwrap_or_else(|| "never".into());
        let lease = match &record.lease {
            Some(lease) if lease.is_expired(now) => format!("expired (pid {})", lease.pid),
            Some(lease) => format!("until {} (pid {})", lease.expires_at.format("%H:%M:%S"), lease.pid),
            None => "-".into(),
        };
        println!(
            "{:<40} {:>6} {:>8} {:<25} {}",
            account.label(),
            if record.active { "yes" } else { "no" },
            record.vote_count,
            last,
            lease
        );
    }

    let application = store.load_application().await?;
    println!("\nTotal actions: {}", application.total_count);
    Ok(())
}
