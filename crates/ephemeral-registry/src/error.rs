//! Error types for the ephemeral registry

use crate::types::ObjectId;
use std::fmt;

#[derive(Debug)]
pub enum StoreError {
    /// Rejected input; nothing was mutated
    Validation(String),
    /// Content store I/O failure
    Storage(Box<std::io::Error>),
    /// Ledger write failed and the in-memory state was left unchanged
    Persistence(String),
    /// Ledger write failed after an irreversible in-memory change. The
    /// removal itself went through; `removed` lists what was taken out.
    DurabilityGap {
        removed: Vec<ObjectId>,
        reason: String,
    },
    /// Ledger file exists but cannot be decoded
    CorruptLedger(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Validation(msg) => write!(f, "Validation error: {}", msg),
            StoreError::Storage(err) => write!(f, "Storage error: {}", err),
            StoreError::Persistence(msg) => write!(f, "Persistence error: {}", msg),
            StoreError::DurabilityGap { reason, .. } => write!(f, "Durability gap: {}", reason),
            StoreError::CorruptLedger(msg) => write!(f, "Corrupt ledger: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Storage(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Storage(Box::new(err))
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
