//! SQLite-backed [`RecordStore`].
//!
//! The connection lives on tokio-rusqlite's worker thread; every method is
//! one `call` so multi-statement writes run in a single transaction.

use std::path::Path;

use async_trait::async_trait;
use attend_core::ledger::{AttendanceMark, AttendanceRecord, Direction};
use attend_core::{
    Embedding, EmbeddingRecord, EmbeddingSource, Identity, IdentityProfile, ImageRef, RecordStore,
    Reference, StoreError, Usn,
};
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rusqlite::{params, OptionalExtension};
use tokio_rusqlite::Connection;
use uuid::Uuid;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS identities (
    id             TEXT PRIMARY KEY,
    usn            TEXT NOT NULL UNIQUE,
    name           TEXT NOT NULL,
    class_name     TEXT,
    phone          TEXT,
    guardian_email TEXT,
    guardian_phone TEXT,
    subjects       TEXT NOT NULL DEFAULT '[]',
    image_urls     TEXT NOT NULL DEFAULT '[]',
    created_at     TEXT NOT NULL,
    updated_at     TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS face_embeddings (
    id         TEXT PRIMARY KEY,
    usn        TEXT NOT NULL,
    embedding  BLOB NOT NULL,
    model      TEXT NOT NULL,
    image_path TEXT,
    image_url  TEXT,
    sharpness  REAL NOT NULL,
    source     TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_face_embeddings_usn ON face_embeddings(usn);

CREATE TABLE IF NOT EXISTS attendance (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    usn        TEXT NOT NULL,
    session_id TEXT NOT NULL,
    class_name TEXT NOT NULL,
    subject    TEXT NOT NULL,
    teacher_id TEXT NOT NULL,
    date       TEXT NOT NULL,
    check_in   TEXT,
    check_out  TEXT,
    method     TEXT NOT NULL,
    is_absent  INTEGER NOT NULL DEFAULT 0,
    CONSTRAINT uq_attendance_usn_session UNIQUE (usn, session_id)
);
";

const EMBEDDING_COLUMNS: &str =
    "id, usn, embedding, model, image_path, image_url, sharpness, source, created_at";

const IDENTITY_COLUMNS: &str = "id, usn, name, class_name, phone, guardian_email, guardian_phone, \
     subjects, image_urls, created_at, updated_at";

const ATTENDANCE_COLUMNS: &str =
    "usn, session_id, class_name, subject, teacher_id, date, check_in, check_out, method, is_absent";

/// Raw `face_embeddings` row, decoded outside the connection thread.
struct EmbeddingRow {
    id: String,
    usn: String,
    embedding: Vec<u8>,
    model: String,
    image_path: Option<String>,
    image_url: Option<String>,
    sharpness: f64,
    source: String,
    created_at: String,
}

impl EmbeddingRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            usn: row.get(1)?,
            embedding: row.get(2)?,
            model: row.get(3)?,
            image_path: row.get(4)?,
            image_url: row.get(5)?,
            sharpness: row.get(6)?,
            source: row.get(7)?,
            created_at: row.get(8)?,
        })
    }

    fn decode(self) -> Result<EmbeddingRecord, StoreError> {
        let image = match (self.image_path, self.image_url) {
            (Some(path), Some(url)) => Some(ImageRef { path, url }),
            _ => None,
        };
        Ok(EmbeddingRecord {
            id: parse_uuid("face_embeddings", &self.id)?,
            usn: parse_usn("face_embeddings", &self.usn)?,
            embedding: Embedding::new(decode_vector(&self.embedding)?, self.model),
            image,
            sharpness: self.sharpness,
            source: self
                .source
                .parse::<EmbeddingSource>()
                .map_err(|detail| corrupt("face_embeddings", detail))?,
            created_at: parse_time("face_embeddings", &self.created_at)?,
        })
    }
}

struct IdentityRow {
    id: String,
    usn: String,
    name: String,
    class_name: Option<String>,
    phone: Option<String>,
    guardian_email: Option<String>,
    guardian_phone: Option<String>,
    subjects: String,
    image_urls: String,
    created_at: String,
    updated_at: String,
}

impl IdentityRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            usn: row.get(1)?,
            name: row.get(2)?,
            class_name: row.get(3)?,
            phone: row.get(4)?,
            guardian_email: row.get(5)?,
            guardian_phone: row.get(6)?,
            subjects: row.get(7)?,
            image_urls: row.get(8)?,
            created_at: row.get(9)?,
            updated_at: row.get(10)?,
        })
    }

    fn decode(self) -> Result<Identity, StoreError> {
        Ok(Identity {
            id: parse_uuid("identities", &self.id)?,
            usn: parse_usn("identities", &self.usn)?,
            name: self.name,
            class_name: self.class_name,
            phone: self.phone,
            guardian_email: self.guardian_email,
            guardian_phone: self.guardian_phone,
            subjects: parse_json_list("identities", &self.subjects)?,
            image_urls: parse_json_list("identities", &self.image_urls)?,
            created_at: parse_time("identities", &self.created_at)?,
            updated_at: parse_time("identities", &self.updated_at)?,
        })
    }
}

struct AttendanceRow {
    usn: String,
    session_id: String,
    class_name: String,
    subject: String,
    teacher_id: String,
    date: String,
    check_in: Option<String>,
    check_out: Option<String>,
    method: String,
    is_absent: bool,
}

impl AttendanceRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            usn: row.get(0)?,
            session_id: row.get(1)?,
            class_name: row.get(2)?,
            subject: row.get(3)?,
            teacher_id: row.get(4)?,
            date: row.get(5)?,
            check_in: row.get(6)?,
            check_out: row.get(7)?,
            method: row.get(8)?,
            is_absent: row.get(9)?,
        })
    }

    fn decode(self) -> Result<AttendanceRecord, StoreError> {
        let optional_time = |value: Option<String>| {
            value
                .map(|v| parse_time("attendance", &v))
                .transpose()
        };
        Ok(AttendanceRecord {
            usn: parse_usn("attendance", &self.usn)?,
            session_id: self.session_id,
            class_name: self.class_name,
            subject: self.subject,
            teacher_id: self.teacher_id,
            date: NaiveDate::parse_from_str(&self.date, "%Y-%m-%d")
                .map_err(|e| corrupt("attendance", format!("date {:?}: {e}", self.date)))?,
            check_in: optional_time(self.check_in)?,
            check_out: optional_time(self.check_out)?,
            method: self.method,
            is_absent: self.is_absent,
        })
    }
}

/// SQLite record store for identities, embeddings and attendance.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path` and apply the schema.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                StoreError::Unavailable(format!("create {}: {e}", parent.display()))
            })?;
        }

        let conn = Connection::open(&path).await.map_err(db_error)?;
        conn.call(|conn| {
            conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
            Ok(())
        })
        .await
        .map_err(db_error)?;

        let store = Self { conn };
        store.migrate().await?;
        tracing::info!(path = %path.display(), "record store opened");
        Ok(store)
    }

    /// Private in-memory database, for tests and dry runs.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().await.map_err(db_error)?;
        let store = Self { conn };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        self.conn
            .call(|conn| {
                conn.execute_batch(SCHEMA)?;
                Ok(())
            })
            .await
            .map_err(db_error)
    }

    /// Number of stored embeddings across all identities.
    pub async fn embedding_count(&self) -> Result<usize, StoreError> {
        self.conn
            .call(|conn| {
                let count: i64 =
                    conn.query_row("SELECT COUNT(*) FROM face_embeddings", [], |row| row.get(0))?;
                Ok(count as usize)
            })
            .await
            .map_err(db_error)
    }
}

#[async_trait]
impl RecordStore for SqliteStore {
    async fn upsert_identity(
        &self,
        profile: &IdentityProfile,
        now: DateTime<Utc>,
    ) -> Result<Identity, StoreError> {
        let id = Uuid::new_v4().to_string();
        let usn = profile.usn.to_string();
        let name = profile.name.clone();
        let class_name = profile.class_name.clone();
        let phone = profile.phone.clone();
        let guardian_email = profile.guardian_email.clone();
        let guardian_phone = profile.guardian_phone.clone();
        let subjects = profile
            .subjects
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| StoreError::Query(format!("encode subjects: {e}")))?;
        let now = format_time(now);

        let row = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO identities
                         (id, usn, name, class_name, phone, guardian_email, guardian_phone,
                          subjects, image_urls, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, COALESCE(?8, '[]'), '[]', ?9, ?9)
                     ON CONFLICT(usn) DO UPDATE SET
                         name           = excluded.name,
                         class_name     = COALESCE(excluded.class_name, identities.class_name),
                         phone          = COALESCE(excluded.phone, identities.phone),
                         guardian_email = COALESCE(excluded.guardian_email, identities.guardian_email),
                         guardian_phone = COALESCE(excluded.guardian_phone, identities.guardian_phone),
                         subjects       = COALESCE(?8, identities.subjects),
                         updated_at     = excluded.updated_at",
                    params![
                        id,
                        usn,
                        name,
                        class_name,
                        phone,
                        guardian_email,
                        guardian_phone,
                        subjects,
                        now
                    ],
                )?;
                let row = conn.query_row(
                    &format!("SELECT {IDENTITY_COLUMNS} FROM identities WHERE usn = ?1"),
                    params![usn],
                    IdentityRow::from_row,
                )?;
                Ok(row)
            })
            .await
            .map_err(db_error)?;

        row.decode()
    }

    async fn find_identity(&self, usn: &Usn) -> Result<Option<Identity>, StoreError> {
        let usn = usn.to_string();
        let row = self
            .conn
            .call(move |conn| {
                let row = conn
                    .query_row(
                        &format!("SELECT {IDENTITY_COLUMNS} FROM identities WHERE usn = ?1"),
                        params![usn],
                        IdentityRow::from_row,
                    )
                    .optional()?;
                Ok(row)
            })
            .await
            .map_err(db_error)?;

        row.map(IdentityRow::decode).transpose()
    }

    async fn gallery(&self, usn: &Usn) -> Result<Vec<EmbeddingRecord>, StoreError> {
        let usn = usn.to_string();
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {EMBEDDING_COLUMNS} FROM face_embeddings
                     WHERE usn = ?1 ORDER BY created_at, rowid"
                ))?;
                let rows = stmt
                    .query_map(params![usn], EmbeddingRow::from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
            .map_err(db_error)?;

        rows.into_iter().map(EmbeddingRow::decode).collect()
    }

    async fn references(&self) -> Result<Vec<Reference>, StoreError> {
        let rows = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, usn, embedding, model FROM face_embeddings ORDER BY rowid",
                )?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, Vec<u8>>(2)?,
                            row.get::<_, String>(3)?,
                        ))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
            .map_err(db_error)?;

        rows.into_iter()
            .map(|(id, usn, blob, model)| {
                Ok(Reference {
                    id: parse_uuid("face_embeddings", &id)?,
                    usn: parse_usn("face_embeddings", &usn)?,
                    embedding: Embedding::new(decode_vector(&blob)?, model),
                })
            })
            .collect()
    }

    async fn commit_embedding(
        &self,
        record: &EmbeddingRecord,
        evict: &[Uuid],
    ) -> Result<(), StoreError> {
        let id = record.id.to_string();
        let usn = record.usn.to_string();
        let blob = encode_vector(&record.embedding.values);
        let model = record.embedding.model.clone();
        let (image_path, image_url) = match &record.image {
            Some(image) => (Some(image.path.clone()), Some(image.url.clone())),
            None => (None, None),
        };
        let sharpness = record.sharpness;
        let source = record.source.as_str();
        let created_at = format_time(record.created_at);
        let evict: Vec<String> = evict.iter().map(Uuid::to_string).collect();

        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    &format!(
                        "INSERT INTO face_embeddings ({EMBEDDING_COLUMNS})
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
                    ),
                    params![id, usn, blob, model, image_path, image_url, sharpness, source, created_at],
                )?;
                for evict in &evict {
                    tx.execute("DELETE FROM face_embeddings WHERE id = ?1", params![evict])?;
                }
                tx.commit()?;
                Ok(())
            })
            .await
            .map_err(db_error)
    }

    async fn delete_embedding(&self, id: Uuid) -> Result<bool, StoreError> {
        let id = id.to_string();
        self.conn
            .call(move |conn| {
                let n = conn.execute("DELETE FROM face_embeddings WHERE id = ?1", params![id])?;
                Ok(n > 0)
            })
            .await
            .map_err(db_error)
    }

    async fn embeddings_below(&self, sharpness: f64) -> Result<Vec<EmbeddingRecord>, StoreError> {
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {EMBEDDING_COLUMNS} FROM face_embeddings
                     WHERE sharpness < ?1 ORDER BY usn, created_at"
                ))?;
                let rows = stmt
                    .query_map(params![sharpness], EmbeddingRow::from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
            .map_err(db_error)?;

        rows.into_iter().map(EmbeddingRow::decode).collect()
    }

    async fn refresh_image_urls(&self, usn: &Usn) -> Result<Vec<String>, StoreError> {
        let usn = usn.to_string();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let urls = {
                    let mut stmt = tx.prepare(
                        "SELECT image_url FROM face_embeddings
                         WHERE usn = ?1 AND image_url IS NOT NULL
                         ORDER BY created_at, rowid",
                    )?;
                    let urls = stmt
                        .query_map(params![usn], |row| row.get::<_, String>(0))?
                        .collect::<Result<Vec<_>, _>>()?;
                    urls
                };
                let encoded = serde_json::to_string(&urls)
                    .map_err(|e| tokio_rusqlite::Error::Other(Box::new(e)))?;
                tx.execute(
                    "UPDATE identities SET image_urls = ?1 WHERE usn = ?2",
                    params![encoded, usn],
                )?;
                tx.commit()?;
                Ok(urls)
            })
            .await
            .map_err(db_error)
    }

    async fn attendance(
        &self,
        usn: &Usn,
        session_id: &str,
    ) -> Result<Option<AttendanceRecord>, StoreError> {
        let usn = usn.to_string();
        let session_id = session_id.to_string();
        let row = self
            .conn
            .call(move |conn| {
                let row = conn
                    .query_row(
                        &format!(
                            "SELECT {ATTENDANCE_COLUMNS} FROM attendance
                             WHERE usn = ?1 AND session_id = ?2"
                        ),
                        params![usn, session_id],
                        AttendanceRow::from_row,
                    )
                    .optional()?;
                Ok(row)
            })
            .await
            .map_err(db_error)?;

        row.map(AttendanceRow::decode).transpose()
    }

    async fn upsert_attendance(
        &self,
        mark: &AttendanceMark,
    ) -> Result<AttendanceRecord, StoreError> {
        let at = format_time(mark.at);
        let (check_in, check_out) = match mark.direction {
            Direction::CheckIn => (Some(at), None),
            Direction::CheckOut => (None, Some(at)),
        };
        let usn = mark.usn.to_string();
        let session_id = mark.session_id.clone();
        let class_name = mark.class_name.clone();
        let subject = mark.subject.clone();
        let teacher_id = mark.teacher_id.clone();
        let date = mark.date.format("%Y-%m-%d").to_string();
        let method = mark.method;

        let row = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO attendance
                         (usn, session_id, class_name, subject, teacher_id, date,
                          check_in, check_out, method, is_absent)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0)
                     ON CONFLICT(usn, session_id) DO UPDATE SET
                         check_in  = COALESCE(attendance.check_in, excluded.check_in),
                         check_out = COALESCE(attendance.check_out, excluded.check_out)",
                    params![
                        usn, session_id, class_name, subject, teacher_id, date, check_in,
                        check_out, method
                    ],
                )?;
                let row = conn.query_row(
                    &format!(
                        "SELECT {ATTENDANCE_COLUMNS} FROM attendance
                         WHERE usn = ?1 AND session_id = ?2"
                    ),
                    params![usn, session_id],
                    AttendanceRow::from_row,
                )?;
                Ok(row)
            })
            .await
            .map_err(db_error)?;

        row.decode()
    }
}

fn db_error(err: tokio_rusqlite::Error) -> StoreError {
    match err {
        tokio_rusqlite::Error::ConnectionClosed => {
            StoreError::Unavailable("database connection closed".to_string())
        }
        tokio_rusqlite::Error::Rusqlite(rusqlite::Error::SqliteFailure(code, msg))
            if matches!(
                code.code,
                rusqlite::ErrorCode::CannotOpen
                    | rusqlite::ErrorCode::DatabaseBusy
                    | rusqlite::ErrorCode::DatabaseLocked
                    | rusqlite::ErrorCode::ReadOnly
            ) =>
        {
            StoreError::Unavailable(msg.unwrap_or_else(|| code.to_string()))
        }
        other => StoreError::Query(other.to_string()),
    }
}

fn corrupt(table: &'static str, detail: impl Into<String>) -> StoreError {
    StoreError::Corrupt {
        table,
        detail: detail.into(),
    }
}

fn parse_uuid(table: &'static str, raw: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(raw).map_err(|e| corrupt(table, format!("id {raw:?}: {e}")))
}

fn parse_usn(table: &'static str, raw: &str) -> Result<Usn, StoreError> {
    Usn::parse(raw).map_err(|e| corrupt(table, format!("usn {raw:?}: {e}")))
}

fn parse_time(table: &'static str, raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| corrupt(table, format!("timestamp {raw:?}: {e}")))
}

fn parse_json_list(table: &'static str, raw: &str) -> Result<Vec<String>, StoreError> {
    serde_json::from_str(raw).map_err(|e| corrupt(table, format!("list {raw:?}: {e}")))
}

/// RFC 3339 with microseconds, the precision the ledger compares at.
fn format_time(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Little-endian f32 BLOB.
fn encode_vector(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode_vector(blob: &[u8]) -> Result<Vec<f32>, StoreError> {
    if blob.len() % 4 != 0 {
        return Err(corrupt(
            "face_embeddings",
            format!("embedding blob of {} bytes is not a whole number of f32", blob.len()),
        ));
    }
    Ok(blob
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}
