//! attend-store — Persistence for attend.
//!
//! [`SqliteStore`] keeps identities, gallery embeddings and attendance in
//! one SQLite file. [`FsObjectStore`] keeps face crops on local disk.

pub mod fs;
pub mod sqlite;

pub use fs::FsObjectStore;
pub use sqlite::SqliteStore;
