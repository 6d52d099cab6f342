//! Expiring object registry
//!
//! Tracks metadata for objects held in a content store for a bounded
//! lifetime, persists it through an atomically rewritten ledger, evicts
//! objects when their time-to-live elapses, and broadcasts every change of
//! the live set to connected observers.

mod broadcast;
mod content;
mod error;
mod ledger;
mod registry;
mod scheduler;
mod types;

pub use broadcast::{Broadcaster, DEFAULT_EVENT_BUFFER};
pub use content::{ContentReader, ContentStore, FsContentStore};
pub use error::{Result, StoreError};
pub use ledger::Ledger;
pub use registry::{Registry, RetryPolicy};
pub use scheduler::{EvictionScheduler, DEFAULT_TICK};
pub use types::{
    sanitize_display_name, ObjectId, ObjectRecord, RegistryEvent, RegistryStats, MAX_TTL,
};

// Re-exported for callers that manage scheduler shutdown
pub use tokio_util::sync::CancellationToken;
