//! attend-core — Face attendance engine.
//!
//! Decides which face captures are usable, keeps a bounded gallery of
//! reference embeddings per identity, matches probes against every gallery,
//! and records check-in/check-out exactly once per session.
//!
//! Inference, persistence and transport are collaborators reached through
//! the traits in [`extractor`] and [`store`].

pub mod extractor;
pub mod gallery;
pub mod ledger;
pub mod matcher;
pub mod pipeline;
pub mod policy;
pub mod quality;
pub mod store;
pub mod types;

pub use extractor::{ExtractError, FaceEmbedding, FaceExtractor};
pub use gallery::{
    GalleryCandidate, GalleryError, IdentityGallery, InsertOutcome, SweepFailure, SweepReport,
};
pub use ledger::{
    AttendanceLedger, AttendanceMark, AttendanceRecord, Direction, LedgerState, MarkOutcome,
    SessionContext, SessionMark,
};
pub use matcher::{CosineMatcher, IdentityMatcher, Match, MatchError, Matcher};
pub use pipeline::{
    AttendanceStatus, GalleryRefresh, Pipeline, PipelineError, RecognizeOutcome, RegisterReport,
    UploadedImage, Warning, WarningKind,
};
pub use policy::Policy;
pub use quality::QualityGate;
pub use store::{ObjectStore, ObjectStoreError, RecordStore, StoreError};
pub use types::{
    BoundingBox, Embedding, EmbeddingRecord, EmbeddingSource, Identity, IdentityProfile, ImageRef,
    InvalidUsn, Reference, Usn,
};
