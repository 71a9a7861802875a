//! Transfer ledger: one record per accepted upload.

use std::io::Write;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Metadata recorded when an upload session opens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRecord {
    pub id: Uuid,
    pub filename: String,
    pub stored_path: PathBuf,
    pub size: u64,
    pub fragment_count: u32,
    pub uploader: String,
    /// Seconds since the Unix epoch.
    pub recorded_at: u64,
}

impl TransferRecord {
    pub fn new(
        filename: impl Into<String>,
        stored_path: impl Into<PathBuf>,
        size: u64,
        fragment_count: u32,
        uploader: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            filename: filename.into(),
            stored_path: stored_path.into(),
            size,
            fragment_count,
            uploader: uploader.into(),
            recorded_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
        }
    }
}

/// Best-effort sink for transfer metadata. Callers log failures and carry on.
pub trait TransferLedger: Send + Sync {
    fn record(&self, record: &TransferRecord) -> Result<(), LedgerError>;
}

/// Appends records as JSON lines.
pub struct JsonLinesLedger {
    path: PathBuf,
    append: Mutex<()>,
}

impl JsonLinesLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            append: Mutex::new(()),
        }
    }

    /// Read every record back. Used by tooling and tests.
    pub fn read_all(&self) -> Result<Vec<TransferRecord>, LedgerError> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        text.lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).map_err(LedgerError::from))
            .collect()
    }
}

impl TransferLedger for JsonLinesLedger {
    fn record(&self, record: &TransferRecord) -> Result<(), LedgerError> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        let _guard = self.append.lock().unwrap_or_else(PoisonError::into_inner);
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("ledger I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("ledger encoding: {0}")]
    Json(#[from] serde_json::Error),
}
