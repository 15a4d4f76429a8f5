//! Accounting service: serves the scheduler's counter and exit flag to
//! worker processes over a Unix socket.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use super::protocol::{Reply, Request, encode_line};
use super::{ExitFlag, LocalCounter, SharedCounter};
use crate::error::CounterError;

/// Bound, not yet serving, accounting service.
pub struct CounterService {
    listener: UnixListener,
    path: PathBuf,
    counter: Arc<LocalCounter>,
    exit: ExitFlag,
}

/// Handle to a running service. Shutting down removes the socket file.
pub struct ServiceHandle {
    task: JoinHandle<()>,
    path: PathBuf,
}

impl CounterService {
    /// Bind the socket at `path`, replacing a stale socket file if present.
    pub fn bind(
        path: impl Into<PathBuf>,
        counter: Arc<LocalCounter>,
        exit: ExitFlag,
    ) -> Result<Self, CounterError> {
        let path = path.into();
        if path.exists() {
            debug!(path = %path.display(), "Removing stale accounting socket");
            std::fs::remove_file(&path)?;
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let listener = UnixListener::bind(&path).map_err(|e| CounterError::Unreachable {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            listener,
            path,
            counter,
            exit,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Start accepting connections.
    pub fn spawn(self) -> ServiceHandle {
        let Self {
            listener,
            path,
            counter,
            exit,
        } = self;

        info!(path = %path.display(), "Accounting service listening");

        let task = tokio::spawn(async move {
            // Owned here so aborting the service also drops every connection.
            let mut connections = JoinSet::new();
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _addr)) => {
                            let counter = Arc::clone(&counter);
                            let exit = exit.clone();
                            connections.spawn(async move {
                                if let Err(e) = serve_connection(stream, counter, exit).await {
                                    debug!(error = %e, "Accounting connection ended with error");
                                }
                            });
                        }
                        Err(e) => {
                            warn!(error = %e, "Accounting service accept failed");
                            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                        }
                    },
                    Some(_) = connections.join_next(), if !connections.is_empty() => {}
                }
            }
        });

        ServiceHandle { task, path }
    }
}

impl ServiceHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stop accepting connections and remove the socket file.
    pub fn shutdown(self) {
        self.task.abort();
        if let Err(e) = std::fs::remove_file(&self.path) {
            debug!(error = %e, "Could not remove accounting socket");
        }
    }
}

async fn serve_connection(
    stream: UnixStream,
    counter: Arc<LocalCounter>,
    exit: ExitFlag,
) -> Result<(), CounterError> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    while let Some(line) = lines.next_line().await? {
        let reply = match serde_json::from_str::<Request>(&line) {
            Ok(Request::Increment) => Reply::Count {
                value: counter.increment().await?,
            },
            Ok(Request::Value) => Reply::Count {
                value: counter.value().await?,
            },
            Ok(Request::ExitStatus) => Reply::Exit {
                set: exit.is_set(),
            },
            Err(e) => Reply::Error {
                message: format!("bad request: {e}"),
            },
        };
        let out = encode_line(&reply).map_err(|e| CounterError::Protocol(e.to_string()))?;
        write_half.write_all(out.as_bytes()).await?;
    }
    Ok(())
}
