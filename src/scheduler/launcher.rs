//! Worker launchers.
//!
//! The orchestrator only needs to start a worker and later ask whether it is
//! still running. [`ProcessLauncher`] re-executes this binary as a `worker`
//! subprocess; [`TaskLauncher`] runs the session as a tokio task in the
//! scheduler process.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{AccountSpec, RotaConfig};
use crate::error::LaunchError;
use crate::worker::{ExitReason, WorkerBinding, WorkerDeps, run_worker};

/// An account bound to a resource, ready to launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub account: AccountSpec,
    pub resource_id: String,
}

impl Assignment {
    pub fn name(&self) -> String {
        format!("{}@{}", self.account.label(), self.resource_id)
    }
}

/// A running worker as seen by the orchestrator.
pub trait WorkerHandle: Send {
    fn name(&self) -> &str;

    /// Poll without blocking. Returns `false` once the worker has exited.
    fn is_alive(&mut self) -> bool;
}

/// Starts workers.
pub trait WorkerLauncher: Send + Sync {
    fn launch(&self, assignment: Assignment) -> Result<Box<dyn WorkerHandle>, LaunchError>;
}

// ── Process isolation ───────────────────────────────────────────────

/// Launches each worker as `rota worker ...` in its own process.
pub struct ProcessLauncher {
    program: PathBuf,
    config_path: PathBuf,
    socket_path: PathBuf,
}

impl ProcessLauncher {
    /// Launch workers by re-executing the running binary.
    pub fn new(config_path: PathBuf, socket_path: PathBuf) -> Result<Self, LaunchError> {
        let program = std::env::current_exe().map_err(LaunchError::Executable)?;
        Ok(Self::with_program(program, config_path, socket_path))
    }

    pub fn with_program(program: PathBuf, config_path: PathBuf, socket_path: PathBuf) -> Self {
        Self {
            program,
            config_path,
            socket_path,
        }
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn launch(&self, assignment: Assignment) -> Result<Box<dyn WorkerHandle>, LaunchError> {
        let name = assignment.name();
        let mut cmd = Command::new(&self.program);
        cmd.arg("worker")
            .arg("--config")
            .arg(&self.config_path)
            .arg("--account")
            .arg(assignment.account.key.as_str())
            .arg("--resource")
            .arg(&assignment.resource_id)
            .arg("--socket")
            .arg(&self.socket_path)
            .stdin(Stdio::null())
            // Workers observe the exit flag and finish on their own.
            .kill_on_drop(false);

        let child = cmd.spawn().map_err(|source| LaunchError::Spawn {
            name: name.clone(),
            source,
        })?;
        info!(worker = %name, pid = child.id(), "Worker process started");

        Ok(Box::new(ProcessHandle { name, child }))
    }
}

struct ProcessHandle {
    name: String,
    child: Child,
}

impl WorkerHandle for ProcessHandle {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_alive(&mut self) -> bool {
        match self.child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                info!(worker = %self.name, %status, "Worker process exited");
                false
            }
            Err(e) => {
                warn!(worker = %self.name, error = %e, "Lost track of worker process");
                false
            }
        }
    }
}

// ── Task isolation ──────────────────────────────────────────────────

/// Launches each worker as a tokio task sharing the scheduler's collaborators.
pub struct TaskLauncher {
    config: Arc<RotaConfig>,
    deps: WorkerDeps,
}

impl TaskLauncher {
    pub fn new(config: Arc<RotaConfig>, deps: WorkerDeps) -> Self {
        Self { config, deps }
    }
}

impl WorkerLauncher for TaskLauncher {
    fn launch(&self, assignment: Assignment) -> Result<Box<dyn WorkerHandle>, LaunchError> {
        let name = assignment.name();
        let binding =
            WorkerBinding::from_config(&self.config, assignment.account, &assignment.resource_id)?;
        let handle = tokio::spawn(run_worker(binding, self.deps.clone()));
        info!(worker = %name, "Worker task started");

        Ok(Box::new(TaskHandle { name, handle }))
    }
}

struct TaskHandle {
    name: String,
    handle: JoinHandle<ExitReason>,
}

impl WorkerHandle for TaskHandle {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_alive(&mut self) -> bool {
        !self.handle.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn assignment() -> Assignment {
        Assignment {
            account: AccountSpec::new("one@example.com", "main"),
            resource_id: "stream-a".into(),
        }
    }

    #[test]
    fn assignment_name_joins_label_and_resource() {
        assert_eq!(assignment().name(), "one@example.com/main@stream-a");
    }

    #[tokio::test]
    async fn process_handle_reports_exit() {
        // `true` ignores the worker arguments and exits at once.
        let launcher = ProcessLauncher::with_program(
            PathBuf::from("true"),
            PathBuf::from("config.json"),
            PathBuf::from("rota.sock"),
        );
        let mut handle = launcher.launch(assignment()).unwrap();
        assert_eq!(handle.name(), "one@example.com/main@stream-a");

        let mut alive = true;
        for _ in 0..100 {
            alive = handle.is_alive();
            if !alive {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!alive);
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let launcher = ProcessLauncher::with_program(
            PathBuf::from("/nonexistent/rota-worker"),
            PathBuf::from("config.json"),
            PathBuf::from("rota.sock"),
        );
        let err = launcher.launch(assignment()).err().unwrap();
        assert!(matches!(err, LaunchError::Spawn { .. }));
    }
}
