//! Core domain model shared across the fax gateway: job and artifact records,
//! the canonical status vocabulary, the error taxonomy, and the SQLite-backed
//! job store whose uniqueness constraints double as the idempotency ledger.

pub mod error;
pub mod job;
pub mod render;
pub mod sanitize;
pub mod storage;
pub mod store;

pub use error::{FaxError, ProviderError, ProviderErrorKind};
pub use job::{InboundArtifact, JobStatus, OutboundJob};
pub use render::{PassthroughRenderer, Renderer};
pub use sanitize::{mask_phone, sanitize_error};
pub use storage::{ArtifactStore, LocalArtifactStore};
pub use store::JobStore;

/// Generates a fresh record id in the same shape for jobs and artifacts.
pub fn new_record_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}
