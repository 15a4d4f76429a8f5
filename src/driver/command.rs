//! Driver bridge to an external program.
//!
//! The program receives one JSON request per line on stdin and answers each
//! with one JSON line on stdout:
//!
//! ```text
//! -> {"op":"authenticate","identity":"...","secret":"..."}
//! <- {"ok":true}
//! -> {"op":"list_targets"}
//! <- {"ok":true,"targets":[{"label":"main","handle":"h-1"}]}
//! -> {"op":"submit_action","text":"..."}
//! <- {"ok":false,"error":"input field missing"}
//! ```
//!
//! Its stderr is inherited so driver diagnostics land next to worker logs.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use super::{DriverFactory, SessionDriver, Target, TargetHandle};
use crate::config::DriverConfig;
use crate::error::DriverError;

/// How long `close` waits for the program to exit before killing it.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

#[derive(Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum DriverRequest<'a> {
    Open,
    Authenticate { identity: &'a str, secret: &'a str },
    ListTargets,
    SelectTarget { handle: &'a TargetHandle },
    Navigate { resource_id: &'a str },
    SubmitAction { text: &'a str },
    Refresh,
    Close,
}

impl DriverRequest<'_> {
    fn op(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Authenticate { .. } => "authenticate",
            Self::ListTargets => "list_targets",
            Self::SelectTarget { .. } => "select_target",
            Self::Navigate { .. } => "navigate",
            Self::SubmitAction { .. } => "submit_action",
            Self::Refresh => "refresh",
            Self::Close => "close",
        }
    }
}

#[derive(Debug, Deserialize)]
struct DriverReply {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    targets: Vec<Target>,
}

/// A [`SessionDriver`] backed by a child process.
pub struct CommandDriver {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Lines<BufReader<ChildStdout>>,
}

impl CommandDriver {
    pub fn spawn(command: &str, args: &[String]) -> Result<Self, DriverError> {
        let mut child = Command::new(command)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| DriverError::Spawn(format!("{command}: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| DriverError::Spawn("driver stdin not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DriverError::Spawn("driver stdout not captured".into()))?;

        Ok(Self {
            child,
            stdin: Some(stdin),
            stdout: BufReader::new(stdout).lines(),
        })
    }

    async fn call(&mut self, request: DriverRequest<'_>) -> Result<DriverReply, DriverError> {
        let op = request.op();
        let mut line = serde_json::to_string(&request).map_err(|e| DriverError::BadReply {
            op: op.to_string(),
            reason: e.to_string(),
        })?;
        line.push('\n');
        let stdin = self.stdin.as_mut().ok_or(DriverError::Exited)?;
        stdin.write_all(line.as_bytes()).await?;
        stdin.flush().await?;

        let raw = self.stdout.next_line().await?.ok_or(DriverError::Exited)?;
        let reply: DriverReply = serde_json::from_str(&raw).map_err(|e| DriverError::BadReply {
            op: op.to_string(),
            reason: e.to_string(),
        })?;

        if reply.ok {
            Ok(reply)
        } else {
            Err(DriverError::failed(
                op,
                reply.error.unwrap_or_else(|| "unspecified failure".into()),
            ))
        }
    }
}

#[async_trait]
impl SessionDriver for CommandDriver {
    async fn open(&mut self) -> Result<(), DriverError> {
        self.call(DriverRequest::Open).await.map(|_| ())
    }

    async fn authenticate(
        &mut self,
        identity: &str,
        secret: &SecretString,
    ) -> Result<(), DriverError> {
        self.call(DriverRequest::Authenticate {
            identity,
            secret: secret.expose_secret(),
        })
        .await
        .map(|_| ())
    }

    async fn list_targets(&mut self) -> Result<Vec<Target>, DriverError> {
        Ok(self.call(DriverRequest::ListTargets).await?.targets)
    }

    async fn select_target(&mut self, handle: &TargetHandle) -> Result<(), DriverError> {
        self.call(DriverRequest::SelectTarget { handle }).await.map(|_| ())
    }

    async fn navigate(&mut self, resource_id: &str) -> Result<(), DriverError> {
        self.call(DriverRequest::Navigate { resource_id })
            .await
            .map(|_| ())
    }

    async fn submit_action(&mut self, text: &str) -> Result<(), DriverError> {
        self.call(DriverRequest::SubmitAction { text }).await.map(|_| ())
    }

    async fn refresh(&mut self) -> Result<(), DriverError> {
        self.call(DriverRequest::Refresh).await.map(|_| ())
    }

    async fn close(&mut self) -> Result<(), DriverError> {
        let farewell = self.call(DriverRequest::Close).await;
        // EOF on stdin tells the program to finish.
        self.stdin = None;
        match tokio::time::timeout(CLOSE_GRACE, self.child.wait()).await {
            Ok(status) => {
                tracing::debug!(status = ?status, "Driver exited");
            }
            Err(_) => {
                tracing::warn!("Driver did not exit after close, killing it");
                self.child.kill().await?;
            }
        }
        // A driver that exits straight away instead of replying is fine.
        match farewell {
            Ok(_) | Err(DriverError::Exited) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Spawns one [`CommandDriver`] per worker.
#[derive(Debug, Clone)]
pub struct CommandDriverFactory {
    command: String,
    args: Vec<String>,
}

impl CommandDriverFactory {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }

    pub fn from_config(config: &DriverConfig) -> Option<Self> {
        config
            .command
            .as_ref()
            .map(|command| Self::new(command.clone(), config.args.clone()))
    }
}

#[async_trait]
impl DriverFactory for CommandDriverFactory {
    async fn create(&self) -> Result<Box<dyn SessionDriver>, DriverError> {
        Ok(Box::new(CommandDriver::spawn(&self.command, &self.args)?))
    }
}
