//! Durable snapshot of live object metadata

use crate::error::{Result, StoreError};
use crate::types::ObjectRecord;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::PathBuf;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

const LEDGER_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct LedgerFile {
    version: u32,
    objects: Vec<ObjectRecord>,
}

/// Metadata ledger stored as a single JSON file that is replaced atomically
/// on every write.
pub struct Ledger {
    path: PathBuf,
}

impl Ledger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Load every persisted record. A missing file is an empty ledger.
    pub async fn load_all(&self) -> Result<Vec<ObjectRecord>> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!(path = ?self.path, "No ledger found, starting empty");
                return Ok(Vec::new());
            }
            Err(e) => {
                return Err(StoreError::Persistence(format!(
                    "failed to read ledger {}: {}",
                    self.path.display(),
                    e
                )))
            }
        };

        let file: LedgerFile = serde_json::from_slice(&bytes).map_err(|e| {
            StoreError::CorruptLedger(format!("{}: {}", self.path.display(), e))
        })?;

        if file.version != LEDGER_VERSION {
            return Err(StoreError::CorruptLedger(format!(
                "{}: unsupported version {}",
                self.path.display(),
                file.version
            )));
        }

        info!(path = ?self.path, objects = file.objects.len(), "Ledger loaded");
        Ok(file.objects)
    }

    /// Replace the persisted set with `records`.
    ///
    /// Writes a sibling temp file, syncs it and renames it over the ledger, so
    /// readers only ever observe the previous or the new complete file.
    pub async fn persist(&self, records: &[ObjectRecord]) -> Result<()> {
        self.write_atomic(records)
            .await
            .map_err(|e| StoreError::Persistence(format!("{}: {}", self.path.display(), e)))
    }

    async fn write_atomic(&self, records: &[ObjectRecord]) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let payload = serde_json::to_vec_pretty(&LedgerFile {
            version: LEDGER_VERSION,
            objects: records.to_vec(),
        })?;

        let tmp_path = self.path.with_extension("tmp");
        let mut tmp_file = fs::File::create(&tmp_path).await?;
        tmp_file.write_all(&payload).await?;
        tmp_file.sync_all().await?;
        fs::rename(&tmp_path, &self.path).await?;

        debug!(path = ?self.path, objects = records.len(), "Ledger persisted");
        Ok(())
    }
}
