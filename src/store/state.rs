//! File-backed state store.
//!
//! Layout under the data directory:
//! - `data.json`: the application record
//! - `<credential-hash>/<account-key>.json`: one record per account
//!
//! Every save is a whole-document replace: the JSON is written to a sibling
//! temporary file which is then renamed over the target, so readers see
//! either the previous or the new record, never a torn one.

use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::fs;

use crate::error::StoreError;
use crate::store::record::{AccountKey, AccountRecord, ApplicationRecord};

/// File name of the application record.
const APPLICATION_FILE: &str = "data.json";

/// Durable per-account and application records on disk.
#[derive(Debug, Clone)]
pub struct StateStore {
    base_path: PathBuf,
}

impl StateStore {
    /// Open a store rooted at `base_path`, creating the directory if needed.
    pub async fn open(base_path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let base_path = base_path.into();
        fs::create_dir_all(&base_path)
            .await
            .map_err(|source| StoreError::Io {
                path: base_path.clone(),
                source,
            })?;
        Ok(Self { base_path })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn account_path(&self, key: &AccountKey) -> PathBuf {
        self.base_path
            .join(key.credential_hash())
            .join(format!("{}.json", key.as_str()))
    }

    fn application_path(&self) -> PathBuf {
        self.base_path.join(APPLICATION_FILE)
    }

    /// Load an account record, or the default preset if none exists.
    pub async fn load(&self, key: &AccountKey) -> Result<AccountRecord, StoreError> {
        read_or_default(&self.account_path(key)).await
    }

    /// Persist an account record.
    pub async fn save(&self, key: &AccountKey, record: &AccountRecord) -> Result<(), StoreError> {
        write_atomic(&self.account_path(key), record).await
    }

    pub async fn load_application(&self) -> Result<ApplicationRecord, StoreError> {
        read_or_default(&self.application_path()).await
    }

    pub async fn save_application(&self, record: &ApplicationRecord) -> Result<(), StoreError> {
        write_atomic(&self.application_path(), record).await
    }
}

async fn read_or_default<T>(path: &Path) -> Result<T, StoreError>
where
    T: DeserializeOwned + Default,
{
    let raw = match fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(T::default()),
        Err(source) => {
            return Err(StoreError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    serde_json::from_str(&raw).map_err(|e| StoreError::Corrupt {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

async fn write_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let io_err = |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await.map_err(io_err)?;
    }

    let body = serde_json::to_string_pretty(value)?;
    let mut tmp = path.as_os_str().to_owned();
    // Unique per call: tasks in one process may write the same file at once.
    tmp.push(format!(".tmp-{}-{}", std::process::id(), uuid::Uuid::new_v4()));
    let tmp = PathBuf::from(tmp);

    fs::write(&tmp, body).await.map_err(io_err)?;
    if let Err(source) = fs::rename(&tmp, path).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(io_err(source));
    }
    Ok(())
}
