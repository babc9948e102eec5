use std::sync::Arc;

use assert_matches::assert_matches;
use async_trait::async_trait;
use attend_core::ledger::{AttendanceMark, AttendanceRecord};
use attend_core::{
    Embedding, EmbeddingRecord, EmbeddingSource, GalleryCandidate, GalleryError, Identity,
    IdentityGallery, IdentityProfile, ImageRef, InsertOutcome, ObjectStore, ObjectStoreError,
    Policy, RecordStore, Reference, StoreError, Usn,
};
use attend_store::{FsObjectStore, SqliteStore};
use chrono::{DateTime, Utc};
use tempfile::TempDir;
use uuid::Uuid;

const DIM: usize = 4;

struct Fixture {
    store: Arc<SqliteStore>,
    objects: Arc<FsObjectStore>,
    gallery: Arc<IdentityGallery>,
    dir: TempDir,
}

fn policy() -> Policy {
    Policy {
        embedding_dim: DIM,
        ..Policy::default()
    }
}

async fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(SqliteStore::open_in_memory().await.unwrap());
    let objects = Arc::new(FsObjectStore::new(dir.path(), "http://test/images"));
    let gallery = Arc::new(IdentityGallery::new(store.clone(), objects.clone(), &policy()));
    Fixture {
        store,
        objects,
        gallery,
        dir,
    }
}

fn usn(raw: &str) -> Usn {
    Usn::parse(raw).unwrap()
}

fn candidate(sharpness: f64) -> GalleryCandidate {
    GalleryCandidate {
        embedding: Embedding::new(vec![0.5; DIM], "test"),
        crop_jpeg: vec![0xFF, 0xD8, 0xFF, 0xD9],
        sharpness,
        source: EmbeddingSource::Register,
    }
}

fn files_under(dir: &std::path::Path) -> usize {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .flatten()
                .map(|e| {
                    if e.path().is_dir() {
                        files_under(&e.path())
                    } else {
                        1
                    }
                })
                .sum()
        })
        .unwrap_or(0)
}

#[tokio::test]
async fn test_insert_below_capacity_adds_and_uploads() {
    let f = fixture().await;
    let outcome = f.gallery.insert(&usn("U1"), candidate(150.0)).await.unwrap();

    let record = assert_matches!(outcome, InsertOutcome::Added { record } => record);
    let image = record.image.clone().unwrap();
    assert!(image.path.starts_with("students/U1/U1_"));
    assert_eq!(image.url, f.objects.url_for(&image.path));
    assert!(f.dir.path().join(&image.path).exists());
    assert_eq!(f.gallery.list(&usn("U1")).await.unwrap(), vec![record]);
}

#[tokio::test]
async fn test_too_blurry_persists_nothing() {
    let f = fixture().await;
    let outcome = f.gallery.insert(&usn("U1"), candidate(40.0)).await.unwrap();

    assert_matches!(outcome, InsertOutcome::TooBlurry { sharpness, threshold } => {
        assert_eq!(sharpness, 40.0);
        assert_eq!(threshold, 100.0);
    });
    assert!(f.gallery.list(&usn("U1")).await.unwrap().is_empty());
    assert_eq!(files_under(f.dir.path()), 0);
}

#[tokio::test]
async fn test_threshold_boundary_is_accepted() {
    let f = fixture().await;
    let outcome = f.gallery.insert(&usn("U1"), candidate(100.0)).await.unwrap();
    assert_matches!(outcome, InsertOutcome::Added { .. });
}

#[tokio::test]
async fn test_dimension_mismatch_is_rejected() {
    let f = fixture().await;
    let mut wrong = candidate(300.0);
    wrong.embedding = Embedding::new(vec![1.0; DIM + 1], "test");

    let err = f.gallery.insert(&usn("U1"), wrong).await.unwrap_err();
    assert_matches!(err, GalleryError::DimensionMismatch { expected: 4, actual: 5 });
    assert_eq!(files_under(f.dir.path()), 0);
}

#[tokio::test]
async fn test_full_gallery_evicts_weakest_only_when_sharper() {
    let f = fixture().await;
    let u1 = usn("U1");
    for s in [300.0, 150.0, 500.0, 220.0, 410.0] {
        f.gallery.insert(&u1, candidate(s)).await.unwrap();
    }

    let outcome = f.gallery.insert(&u1, candidate(150.0)).await.unwrap();
    assert_matches!(outcome, InsertOutcome::Discarded { floor, .. } => assert_eq!(floor, 150.0));
    assert_eq!(files_under(f.dir.path()), 5);

    let outcome = f.gallery.insert(&u1, candidate(180.0)).await.unwrap();
    let (record, mut evicted) =
        assert_matches!(outcome, InsertOutcome::Replaced { record, evicted } => (record, evicted));
    assert_eq!(evicted.len(), 1);
    let evicted = evicted.remove(0);
    assert_eq!(evicted.sharpness, 150.0);
    assert!(!f.dir.path().join(&evicted.image.unwrap().path).exists());
    assert!(f.dir.path().join(&record.image.unwrap().path).exists());

    let mut sharpness: Vec<f64> = f
        .gallery
        .list(&u1)
        .await
        .unwrap()
        .iter()
        .map(|r| r.sharpness)
        .collect();
    sharpness.sort_by(f64::total_cmp);
    assert_eq!(sharpness, vec![180.0, 220.0, 300.0, 410.0, 500.0]);
    assert_eq!(files_under(f.dir.path()), 5);
}

#[tokio::test]
async fn test_image_list_tracks_surviving_images() {
    let f = fixture().await;
    let u1 = usn("U1");
    let profile = IdentityProfile {
        usn: u1.clone(),
        name: "Asha".into(),
        class_name: None,
        phone: None,
        guardian_email: None,
        guardian_phone: None,
        subjects: None,
    };
    f.store.upsert_identity(&profile, Utc::now()).await.unwrap();

    for s in [120.0, 130.0, 140.0, 150.0, 160.0, 900.0] {
        f.gallery.insert(&u1, candidate(s)).await.unwrap();
    }

    let identity = f.store.find_identity(&u1).await.unwrap().unwrap();
    let mut expected: Vec<String> = f
        .gallery
        .list(&u1)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|r| r.image.map(|i| i.url))
        .collect();
    let mut actual = identity.image_urls;
    expected.sort();
    actual.sort();
    assert_eq!(actual, expected);
    assert_eq!(actual.len(), 5);
}

#[tokio::test]
async fn test_concurrent_inserts_respect_capacity() {
    let f = fixture().await;
    let u1 = usn("U1");

    let tasks: Vec<_> = (0..20)
        .map(|i| {
            let gallery = Arc::clone(&f.gallery);
            let u1 = u1.clone();
            tokio::spawn(async move { gallery.insert(&u1, candidate(100.0 + i as f64 * 10.0)).await })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let gallery = f.gallery.list(&u1).await.unwrap();
    assert_eq!(gallery.len(), 5);
    assert_eq!(files_under(f.dir.path()), 5);
    let floor = gallery.iter().map(|r| r.sharpness).fold(f64::INFINITY, f64::min);
    assert_eq!(floor, 250.0);
}

/// Store a record directly, bypassing the gate and the capacity check, the
/// way rows written by older releases look.
async fn write_legacy(f: &Fixture, usn: &Usn, sharpness: f64) -> EmbeddingRecord {
    let path = format!("students/{usn}/{usn}_{}.jpg", Uuid::new_v4());
    let url = f.objects.put(&path, vec![1]).await.unwrap();
    let record = EmbeddingRecord {
        id: Uuid::new_v4(),
        usn: usn.clone(),
        embedding: Embedding::new(vec![0.1; DIM], "test"),
        image: Some(ImageRef { path, url }),
        sharpness,
        source: EmbeddingSource::Register,
        created_at: Utc::now(),
    };
    f.store.commit_embedding(&record, &[]).await.unwrap();
    record
}

async fn sorted_sharpness(f: &Fixture, usn: &Usn) -> Vec<f64> {
    let mut sharpness: Vec<f64> = f
        .gallery
        .list(usn)
        .await
        .unwrap()
        .iter()
        .map(|r| r.sharpness)
        .collect();
    sharpness.sort_by(f64::total_cmp);
    sharpness
}

#[tokio::test]
async fn test_sweep_removes_legacy_blurry_records() {
    let f = fixture().await;
    let u1 = usn("U1");
    f.gallery.insert(&u1, candidate(250.0)).await.unwrap();

    // Legacy rows written before the threshold existed.
    for sharpness in [12.0, 99.9] {
        write_legacy(&f, &u1, sharpness).await;
    }
    assert_eq!(files_under(f.dir.path()), 3);

    let report = f.gallery.sweep_below_threshold().await.unwrap();
    assert_eq!(report.threshold, 100.0);
    assert_eq!(report.removed, 2);
    assert_eq!(report.images_deleted, 2);
    assert!(report.failures.is_empty());

    let left = f.gallery.list(&u1).await.unwrap();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].sharpness, 250.0);
    assert_eq!(files_under(f.dir.path()), 1);

    // Nothing left to do.
    let again = f.gallery.sweep_below_threshold().await.unwrap();
    assert_eq!(again.removed, 0);
    assert_eq!(again.trimmed, 0);
}

#[tokio::test]
async fn test_sweep_trims_overfull_gallery_to_capacity() {
    let f = fixture().await;
    let u1 = usn("U1");
    let u2 = usn("U2");
    for s in [203.0, 200.0, 206.0, 201.0, 205.0, 202.0, 204.0] {
        write_legacy(&f, &u1, s).await;
    }
    for s in [300.0, 310.0] {
        write_legacy(&f, &u2, s).await;
    }

    let report = f.gallery.sweep_below_threshold().await.unwrap();
    assert_eq!(report.removed, 0);
    assert_eq!(report.trimmed, 2);
    assert_eq!(report.images_deleted, 2);
    assert!(report.failures.is_empty());

    assert_eq!(
        sorted_sharpness(&f, &u1).await,
        vec![202.0, 203.0, 204.0, 205.0, 206.0]
    );
    assert_eq!(sorted_sharpness(&f, &u2).await, vec![300.0, 310.0]);
    assert_eq!(files_under(f.dir.path()), 7);

    // A sharp insert afterwards replaces one record and stays at capacity.
    let outcome = f.gallery.insert(&u1, candidate(900.0)).await.unwrap();
    assert_matches!(outcome, InsertOutcome::Replaced { evicted, .. } => assert_eq!(evicted.len(), 1));
    assert_eq!(f.gallery.list(&u1).await.unwrap().len(), 5);
}

#[tokio::test]
async fn test_insert_into_overfull_gallery_returns_to_capacity() {
    let f = fixture().await;
    let u1 = usn("U1");
    let mut legacy = Vec::new();
    for s in [203.0, 200.0, 206.0, 201.0, 205.0, 202.0, 204.0] {
        legacy.push(write_legacy(&f, &u1, s).await);
    }

    let outcome = f.gallery.insert(&u1, candidate(900.0)).await.unwrap();
    let evicted = assert_matches!(outcome, InsertOutcome::Replaced { evicted, .. } => evicted);
    let evicted_sharpness: Vec<f64> = evicted.iter().map(|r| r.sharpness).collect();
    assert_eq!(evicted_sharpness, vec![200.0, 201.0, 202.0]);
    for record in &evicted {
        assert!(!f.dir.path().join(&record.image.as_ref().unwrap().path).exists());
    }

    assert_eq!(
        sorted_sharpness(&f, &u1).await,
        vec![203.0, 204.0, 205.0, 206.0, 900.0]
    );
    assert_eq!(files_under(f.dir.path()), 5);
}

#[tokio::test]
async fn test_overfull_gallery_rejects_candidate_not_beating_every_victim() {
    let f = fixture().await;
    let u1 = usn("U1");
    for s in [203.0, 200.0, 206.0, 201.0, 205.0, 202.0, 204.0] {
        write_legacy(&f, &u1, s).await;
    }

    let outcome = f.gallery.insert(&u1, candidate(201.5)).await.unwrap();
    assert_matches!(outcome, InsertOutcome::Discarded { floor, .. } => assert_eq!(floor, 202.0));
    assert_eq!(f.gallery.list(&u1).await.unwrap().len(), 7);
}

/// Delegates to SQLite but refuses every embedding insert.
struct RejectingStore(SqliteStore);

#[async_trait]
impl RecordStore for RejectingStore {
    async fn upsert_identity(
        &self,
        profile: &IdentityProfile,
        now: DateTime<Utc>,
    ) -> Result<Identity, StoreError> {
        self.0.upsert_identity(profile, now).await
    }

    async fn find_identity(&self, usn: &Usn) -> Result<Option<Identity>, StoreError> {
        self.0.find_identity(usn).await
    }

    async fn gallery(&self, usn: &Usn) -> Result<Vec<EmbeddingRecord>, StoreError> {
        self.0.gallery(usn).await
    }

    async fn references(&self) -> Result<Vec<Reference>, StoreError> {
        self.0.references().await
    }

    async fn commit_embedding(
        &self,
        _record: &EmbeddingRecord,
        _evict: &[Uuid],
    ) -> Result<(), StoreError> {
        Err(StoreError::Query("disk full".into()))
    }

    async fn delete_embedding(&self, id: Uuid) -> Result<bool, StoreError> {
        self.0.delete_embedding(id).await
    }

    async fn embeddings_below(&self, sharpness: f64) -> Result<Vec<EmbeddingRecord>, StoreError> {
        self.0.embeddings_below(sharpness).await
    }

    async fn refresh_image_urls(&self, usn: &Usn) -> Result<Vec<String>, StoreError> {
        self.0.refresh_image_urls(usn).await
    }

    async fn attendance(
        &self,
        usn: &Usn,
        session_id: &str,
    ) -> Result<Option<AttendanceRecord>, StoreError> {
        self.0.attendance(usn, session_id).await
    }

    async fn upsert_attendance(&self, mark: &AttendanceMark) -> Result<AttendanceRecord, StoreError> {
        self.0.upsert_attendance(mark).await
    }
}

#[tokio::test]
async fn test_persistence_failure_keeps_uploaded_url() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(RejectingStore(SqliteStore::open_in_memory().await.unwrap()));
    let objects = Arc::new(FsObjectStore::new(dir.path(), "http://test/images"));
    let gallery = IdentityGallery::new(store, objects, &policy());

    let err = gallery.insert(&usn("U1"), candidate(300.0)).await.unwrap_err();
    let url = assert_matches!(err, GalleryError::Persistence { image_url: Some(url), .. } => url);
    assert!(url.starts_with("http://test/images/students/U1/U1_"));
    assert_eq!(files_under(dir.path()), 1);
}

/// Filesystem store whose every upload fails.
struct FailingObjects(FsObjectStore);

#[async_trait]
impl ObjectStore for FailingObjects {
    async fn put(&self, path: &str, _bytes: Vec<u8>) -> Result<String, ObjectStoreError> {
        Err(ObjectStoreError::Io {
            path: path.to_string(),
            source: std::io::Error::other("bucket unreachable"),
        })
    }

    async fn delete(&self, path: &str) -> Result<(), ObjectStoreError> {
        self.0.delete(path).await
    }
}

#[tokio::test]
async fn test_upload_failure_writes_no_record() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(SqliteStore::open_in_memory().await.unwrap());
    let objects = Arc::new(FailingObjects(FsObjectStore::new(dir.path(), "http://test/images")));
    let gallery = IdentityGallery::new(store.clone(), objects, &policy());

    let err = gallery.insert(&usn("U1"), candidate(300.0)).await.unwrap_err();
    assert_matches!(err, GalleryError::Upload(ObjectStoreError::Io { .. }));
    assert_eq!(store.embedding_count().await.unwrap(), 0);
    assert!(gallery.list(&usn("U1")).await.unwrap().is_empty());
    assert_eq!(files_under(dir.path()), 0);
}
