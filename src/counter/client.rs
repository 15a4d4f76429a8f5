//! Worker-side connection to the accounting service.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;

use super::protocol::{Reply, Request, encode_line};
use super::{ExitFlag, ExitSignal, SharedCounter};
use crate::error::CounterError;

struct Connection {
    reader: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

/// Counter and exit signal backed by the scheduler's accounting service.
///
/// `local_exit` lets this process stop on its own signals even when the
/// scheduler has not asked it to.
pub struct CounterClient {
    path: PathBuf,
    connection: Mutex<Option<Connection>>,
    local_exit: ExitFlag,
}

impl CounterClient {
    pub async fn connect(path: &Path, local_exit: ExitFlag) -> Result<Self, CounterError> {
        let stream = UnixStream::connect(path)
            .await
            .map_err(|e| CounterError::Unreachable {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        let (read_half, writer) = stream.into_split();
        Ok(Self {
            path: path.to_path_buf(),
            connection: Mutex::new(Some(Connection {
                reader: BufReader::new(read_half).lines(),
                writer,
            })),
            local_exit,
        })
    }

    async fn call(&self, request: Request) -> Result<Reply, CounterError> {
        let mut guard = self.connection.lock().await;
        let connection = guard.as_mut().ok_or(CounterError::Disconnected)?;

        let result = exchange(connection, request).await;
        if result.is_err() {
            // A broken stream never recovers; fail fast from now on.
            *guard = None;
        }
        result
    }

    async fn count(&self, request: Request) -> Result<u64, CounterError> {
        match self.call(request).await? {
            Reply::Count { value } => Ok(value),
            Reply::Error { message } => Err(CounterError::Protocol(message)),
            other => Err(CounterError::Protocol(format!("expected count, got {other:?}"))),
        }
    }
}

async fn exchange(connection: &mut Connection, request: Request) -> Result<Reply, CounterError> {
    let line = encode_line(&request).map_err(|e| CounterError::Protocol(e.to_string()))?;
    connection.writer.write_all(line.as_bytes()).await?;

    let reply = connection
        .reader
        .next_line()
        .await?
        .ok_or(CounterError::Disconnected)?;
    serde_json::from_str(&reply).map_err(|e| CounterError::Protocol(e.to_string()))
}

#[async_trait]
impl SharedCounter for CounterClient {
    async fn increment(&self) -> Result<u64, CounterError> {
        self.count(Request::Increment).await
    }

    async fn value(&self) -> Result<u64, CounterError> {
        self.count(Request::Value).await
    }
}

#[async_trait]
impl ExitSignal for CounterClient {
    async fn exit_requested(&self) -> bool {
        if self.local_exit.is_set() {
            return true;
        }
        match self.call(Request::ExitStatus).await {
            Ok(Reply::Exit { set }) => set,
            Ok(other) => {
                tracing::warn!(reply = ?other, "Unexpected exit-status reply");
                false
            }
            Err(e) => {
                // Without the scheduler there is nobody to account to.
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Accounting service lost, treating as exit request"
                );
                true
            }
        }
    }
}
