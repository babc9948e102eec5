//! Persistence boundaries: the relational record store and the image
//! object store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::ledger::{AttendanceMark, AttendanceRecord};
use crate::types::{EmbeddingRecord, Identity, IdentityProfile, Reference, Usn};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("record store unavailable: {0}")]
    Unavailable(String),
    #[error("record store query failed: {0}")]
    Query(String),
    #[error("corrupt row in {table}: {detail}")]
    Corrupt { table: &'static str, detail: String },
}

/// Relational store for identities, gallery embeddings and attendance.
///
/// Upserts insert when absent and update only the fields they name; they
/// never null out a stored value the caller did not supply.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Create or update a profile keyed on `usn` in one atomic statement.
    async fn upsert_identity(
        &self,
        profile: &IdentityProfile,
        now: DateTime<Utc>,
    ) -> Result<Identity, StoreError>;

    async fn find_identity(&self, usn: &Usn) -> Result<Option<Identity>, StoreError>;

    /// Every embedding owned by `usn`.
    async fn gallery(&self, usn: &Usn) -> Result<Vec<EmbeddingRecord>, StoreError>;

    /// Every embedding across all identities, for matching.
    async fn references(&self) -> Result<Vec<Reference>, StoreError>;

    /// Insert `record` and, in the same transaction, delete every record
    /// in `evict`.
    async fn commit_embedding(
        &self,
        record: &EmbeddingRecord,
        evict: &[Uuid],
    ) -> Result<(), StoreError>;

    /// Returns false when no such record existed.
    async fn delete_embedding(&self, id: Uuid) -> Result<bool, StoreError>;

    async fn embeddings_below(&self, sharpness: f64) -> Result<Vec<EmbeddingRecord>, StoreError>;

    /// Rewrite the identity's image list from its surviving embeddings and
    /// return it. A missing identity is not an error.
    async fn refresh_image_urls(&self, usn: &Usn) -> Result<Vec<String>, StoreError>;

    async fn attendance(
        &self,
        usn: &Usn,
        session_id: &str,
    ) -> Result<Option<AttendanceRecord>, StoreError>;

    /// Atomic upsert on (usn, session_id). A timestamp that is already set
    /// is kept; the stored row is returned.
    async fn upsert_attendance(&self, mark: &AttendanceMark)
        -> Result<AttendanceRecord, StoreError>;
}

#[derive(Error, Debug)]
pub enum ObjectStoreError {
    #[error("invalid object path: {0}")]
    InvalidPath(String),
    #[error("object store I/O on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Blob storage for face crops.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `bytes` under `path`, returning its public URL.
    async fn put(&self, path: &str, bytes: Vec<u8>) -> Result<String, ObjectStoreError>;

    async fn delete(&self, path: &str) -> Result<(), ObjectStoreError>;
}

/// Generate a fresh object path for one of `usn`'s face crops.
pub fn crop_path(usn: &Usn) -> String {
    format!("students/{usn}/{usn}_{}.jpg", Uuid::new_v4())
}
