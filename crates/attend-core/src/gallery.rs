//! Bounded per-identity gallery of reference embeddings.
//!
//! Every write passes the quality gate. A full gallery only accepts a
//! candidate strictly sharper than its current least-sharp record, which
//! is then evicted, so the gallery's minimum sharpness never decreases. A
//! gallery found over capacity sheds enough of its weakest records on the
//! next insert to end at capacity, and the cleanup sweep trims it too.
//!
//! Mutations for one identity are serialized in-process by
//! [`IdentityLocks`]; the capacity decision and the write happen under the
//! same lock.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

use crate::policy::Policy;
use crate::quality::QualityGate;
use crate::store::{crop_path, ObjectStore, ObjectStoreError, RecordStore, StoreError};
use crate::types::{Embedding, EmbeddingRecord, EmbeddingSource, ImageRef, Usn};

/// Outcome of the capacity check for one candidate.
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    /// Room left; add without eviction.
    Append,
    /// Full; evict the records at `victims` (indices into the gallery,
    /// weakest first). More than one only when the gallery is over capacity.
    Evict { victims: Vec<usize> },
    /// Full and the candidate is not sharper than `floor`.
    Reject { floor: f64 },
}

/// Decide whether a candidate of `sharpness` enters a gallery whose records
/// have the given sharpness values.
///
/// A gallery holding `n >= capacity` records must drop its `n - capacity + 1`
/// weakest to take the candidate, and does so only when the candidate is
/// strictly sharper than every one of them. Among records sharing a value
/// the earlier one goes first; store order is not guaranteed.
pub fn admit(gallery: &[f64], sharpness: f64, capacity: usize) -> Admission {
    if gallery.len() < capacity {
        return Admission::Append;
    }

    let mut order: Vec<usize> = (0..gallery.len()).collect();
    order.sort_by(|&a, &b| gallery[a].total_cmp(&gallery[b]));
    order.truncate(gallery.len() + 1 - capacity);

    match order.last() {
        Some(&bar) if sharpness > gallery[bar] => Admission::Evict { victims: order },
        Some(&bar) => Admission::Reject { floor: gallery[bar] },
        None => Admission::Reject {
            floor: f64::INFINITY,
        },
    }
}

/// A quality-scored face waiting to enter a gallery.
#[derive(Debug, Clone)]
pub struct GalleryCandidate {
    pub embedding: Embedding,
    /// JPEG bytes of the scored crop.
    pub crop_jpeg: Vec<u8>,
    pub sharpness: f64,
    pub source: EmbeddingSource,
}

#[derive(Debug, Clone)]
pub enum InsertOutcome {
    Added {
        record: EmbeddingRecord,
    },
    /// `evicted` is weakest first and holds more than one record only
    /// when the gallery was over capacity.
    Replaced {
        record: EmbeddingRecord,
        evicted: Vec<EmbeddingRecord>,
    },
    /// Gallery full and the candidate was not sharper than its weakest
    /// record. Expected steady state, nothing was written.
    Discarded {
        sharpness: f64,
        floor: f64,
    },
    /// Rejected by the quality gate, nothing was written.
    TooBlurry {
        sharpness: f64,
        threshold: f64,
    },
}

impl InsertOutcome {
    /// The newly stored record, if any.
    pub fn record(&self) -> Option<&EmbeddingRecord> {
        match self {
            Self::Added { record } | Self::Replaced { record, .. } => Some(record),
            _ => None,
        }
    }
}

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("embedding has {actual} dimensions, model expects {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("image upload failed: {0}")]
    Upload(#[source] ObjectStoreError),
    /// The record store rejected the write. If the crop was already
    /// uploaded its URL is kept here so it is not lost.
    #[error("embedding record was not saved: {source}")]
    Persistence {
        image_url: Option<String>,
        #[source]
        source: StoreError,
    },
}

/// One record the cleanup sweep could not fully remove.
#[derive(Debug, Clone, Serialize)]
pub struct SweepFailure {
    pub record_id: Uuid,
    pub usn: Usn,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SweepReport {
    pub threshold: f64,
    /// Records below the threshold that were deleted.
    pub removed: usize,
    /// Records deleted because their gallery held more than `capacity`.
    pub trimmed: usize,
    pub images_deleted: usize,
    pub failures: Vec<SweepFailure>,
}

/// Per-identity async mutexes.
///
/// Slots nobody holds are pruned on the next acquisition.
#[derive(Default)]
pub struct IdentityLocks {
    slots: Mutex<HashMap<Usn, Arc<tokio::sync::Mutex<()>>>>,
}

impl IdentityLocks {
    pub async fn lock(&self, usn: &Usn) -> OwnedMutexGuard<()> {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            slots.retain(|_, slot| Arc::strong_count(slot) > 1);
            Arc::clone(slots.entry(usn.clone()).or_default())
        };
        slot.lock_owned().await
    }
}

pub struct IdentityGallery {
    records: Arc<dyn RecordStore>,
    objects: Arc<dyn ObjectStore>,
    gate: QualityGate,
    capacity: usize,
    embedding_dim: usize,
    locks: IdentityLocks,
}

impl IdentityGallery {
    pub fn new(records: Arc<dyn RecordStore>, objects: Arc<dyn ObjectStore>, policy: &Policy) -> Self {
        Self {
            records,
            objects,
            gate: QualityGate::new(policy.sharpness_threshold),
            capacity: policy.max_gallery_size,
            embedding_dim: policy.embedding_dim,
            locks: IdentityLocks::default(),
        }
    }

    pub fn gate(&self) -> &QualityGate {
        &self.gate
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub async fn list(&self, usn: &Usn) -> Result<Vec<EmbeddingRecord>, StoreError> {
        self.records.gallery(usn).await
    }

    /// Offer a candidate to `usn`'s gallery.
    pub async fn insert(
        &self,
        usn: &Usn,
        candidate: GalleryCandidate,
    ) -> Result<InsertOutcome, GalleryError> {
        if !self.gate.accepts(candidate.sharpness) {
            tracing::info!(
                usn = %usn,
                sharpness = candidate.sharpness,
                threshold = self.gate.threshold(),
                "candidate too blurry"
            );
            return Ok(InsertOutcome::TooBlurry {
                sharpness: candidate.sharpness,
                threshold: self.gate.threshold(),
            });
        }

        let actual = candidate.embedding.dim();
        if actual != self.embedding_dim {
            return Err(GalleryError::DimensionMismatch {
                expected: self.embedding_dim,
                actual,
            });
        }

        let _guard = self.locks.lock(usn).await;

        let current = self
            .records
            .gallery(usn)
            .await
            .map_err(|source| GalleryError::Persistence {
                image_url: None,
                source,
            })?;
        let sharpness: Vec<f64> = current.iter().map(|r| r.sharpness).collect();

        let evicted: Vec<EmbeddingRecord> =
            match admit(&sharpness, candidate.sharpness, self.capacity) {
                Admission::Append => Vec::new(),
                Admission::Evict { victims } => {
                    victims.iter().map(|&i| current[i].clone()).collect()
                }
                Admission::Reject { floor } => {
                    tracing::info!(
                        usn = %usn,
                        sharpness = candidate.sharpness,
                        floor,
                        "gallery full, candidate not sharper than weakest record"
                    );
                    return Ok(InsertOutcome::Discarded {
                        sharpness: candidate.sharpness,
                        floor,
                    });
                }
            };

        let path = crop_path(usn);
        let url = self
            .objects
            .put(&path, candidate.crop_jpeg)
            .await
            .map_err(GalleryError::Upload)?;

        let record = EmbeddingRecord {
            id: Uuid::new_v4(),
            usn: usn.clone(),
            embedding: candidate.embedding,
            image: Some(ImageRef {
                path,
                url: url.clone(),
            }),
            sharpness: candidate.sharpness,
            source: candidate.source,
            created_at: Utc::now(),
        };

        let evict_ids: Vec<Uuid> = evicted.iter().map(|r| r.id).collect();
        if let Err(source) = self.records.commit_embedding(&record, &evict_ids).await
        {
            tracing::error!(usn = %usn, image_url = %url, error = %source, "embedding insert failed");
            return Err(GalleryError::Persistence {
                image_url: Some(url),
                source,
            });
        }

        for old in &evicted {
            self.delete_image(old).await;
        }
        self.refresh_image_urls(usn).await;

        tracing::info!(
            usn = %usn,
            record = %record.id,
            sharpness = record.sharpness,
            source = record.source.as_str(),
            evicted = evicted.len(),
            "gallery updated"
        );

        Ok(if evicted.is_empty() {
            InsertOutcome::Added { record }
        } else {
            InsertOutcome::Replaced { record, evicted }
        })
    }

    /// Delete every record below the gate threshold, with its image, then
    /// trim any gallery still over capacity down to its sharpest records.
    ///
    /// Per-record failures are collected; the sweep always runs to the end.
    pub async fn sweep_below_threshold(&self) -> Result<SweepReport, StoreError> {
        let threshold = self.gate.threshold();
        let stale = self.records.embeddings_below(threshold).await?;
        tracing::info!(threshold, candidates = stale.len(), "cleanup sweep started");

        let mut report = SweepReport {
            threshold,
            removed: 0,
            trimmed: 0,
            images_deleted: 0,
            failures: Vec::new(),
        };
        let mut touched = BTreeSet::new();

        for record in stale {
            let _guard = self.locks.lock(&record.usn).await;
            if self.remove_record(&record, &mut report).await {
                report.removed += 1;
                touched.insert(record.usn.clone());
            }
        }

        for usn in self.over_capacity().await? {
            let _guard = self.locks.lock(&usn).await;
            let mut gallery = self.records.gallery(&usn).await?;
            if gallery.len() <= self.capacity {
                continue;
            }
            gallery.sort_by(|a, b| b.sharpness.total_cmp(&a.sharpness));
            tracing::info!(
                usn = %usn,
                size = gallery.len(),
                capacity = self.capacity,
                "trimming gallery over capacity"
            );
            for record in gallery.split_off(self.capacity) {
                if self.remove_record(&record, &mut report).await {
                    report.trimmed += 1;
                    touched.insert(usn.clone());
                }
            }
        }

        for usn in touched {
            if let Err(e) = self.records.refresh_image_urls(&usn).await {
                tracing::warn!(usn = %usn, error = %e, "image list refresh failed after sweep");
            }
        }

        tracing::info!(
            removed = report.removed,
            trimmed = report.trimmed,
            images_deleted = report.images_deleted,
            failures = report.failures.len(),
            "cleanup sweep finished"
        );
        Ok(report)
    }

    /// Delete one record and its image. Returns whether the record was
    /// deleted by this call; failures go to `report`.
    async fn remove_record(&self, record: &EmbeddingRecord, report: &mut SweepReport) -> bool {
        match self.records.delete_embedding(record.id).await {
            Ok(true) => {}
            Ok(false) => return false,
            Err(e) => {
                report.failures.push(SweepFailure {
                    record_id: record.id,
                    usn: record.usn.clone(),
                    detail: format!("record delete failed: {e}"),
                });
                return false;
            }
        }

        if let Some(image) = &record.image {
            match self.objects.delete(&image.path).await {
                Ok(()) => report.images_deleted += 1,
                Err(e) => report.failures.push(SweepFailure {
                    record_id: record.id,
                    usn: record.usn.clone(),
                    detail: format!("image delete failed: {e}"),
                }),
            }
        }
        true
    }

    /// Identities whose gallery holds more than `capacity` records.
    async fn over_capacity(&self) -> Result<Vec<Usn>, StoreError> {
        let mut counts: HashMap<Usn, usize> = HashMap::new();
        for reference in self.records.references().await? {
            *counts.entry(reference.usn).or_default() += 1;
        }
        let mut over: Vec<Usn> = counts
            .into_iter()
            .filter(|(_, n)| *n > self.capacity)
            .map(|(usn, _)| usn)
            .collect();
        over.sort();
        Ok(over)
    }

    async fn delete_image(&self, record: &EmbeddingRecord) {
        let Some(image) = &record.image else {
            return;
        };
        if let Err(e) = self.objects.delete(&image.path).await {
            tracing::warn!(path = %image.path, error = %e, "evicted image could not be deleted");
        }
    }

    async fn refresh_image_urls(&self, usn: &Usn) {
        if let Err(e) = self.records.refresh_image_urls(usn).await {
            tracing::warn!(usn = %usn, error = %e, "image list refresh failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admit_appends_below_capacity() {
        assert_eq!(admit(&[], 150.0, 5), Admission::Append);
        assert_eq!(admit(&[900.0, 120.0], 101.0, 5), Admission::Append);
    }

    #[test]
    fn test_admit_evicts_weakest_when_sharper() {
        let gallery = [300.0, 150.0, 500.0, 220.0, 410.0];
        assert_eq!(admit(&gallery, 151.0, 5), Admission::Evict { victims: vec![1] });
    }

    #[test]
    fn test_admit_rejects_equal_to_floor() {
        let gallery = [300.0, 150.0, 500.0, 220.0, 410.0];
        assert_eq!(admit(&gallery, 150.0, 5), Admission::Reject { floor: 150.0 });
        assert_eq!(admit(&gallery, 120.0, 5), Admission::Reject { floor: 150.0 });
    }

    #[test]
    fn test_admit_tie_picks_one_of_the_minimums() {
        let gallery = [200.0, 120.0, 300.0, 120.0, 250.0];
        match admit(&gallery, 130.0, 5) {
            Admission::Evict { victims } => {
                assert_eq!(victims.len(), 1);
                assert_eq!(gallery[victims[0]], 120.0);
            }
            other => panic!("expected eviction, got {other:?}"),
        }
    }

    #[test]
    fn test_admit_keeps_capacity_and_raises_floor() {
        // Deterministic pseudo-random stream of accepted sharpness values.
        let mut gallery: Vec<f64> = Vec::new();
        let mut seed = 0x2545_f491_u64;
        for _ in 0..500 {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            let sharpness = 100.0 + (seed % 10_000) as f64 / 10.0;

            let floor_before = gallery.iter().copied().fold(f64::INFINITY, f64::min);
            let was_full = gallery.len() >= 5;
            match admit(&gallery, sharpness, 5) {
                Admission::Append => gallery.push(sharpness),
                Admission::Evict { victims } => {
                    assert_eq!(victims.len(), 1);
                    gallery.swap_remove(victims[0]);
                    gallery.push(sharpness);
                }
                Admission::Reject { .. } => {}
            }
            let floor_after = gallery.iter().copied().fold(f64::INFINITY, f64::min);

            assert!(gallery.len() <= 5);
            if was_full {
                assert!(floor_after >= floor_before);
            }
        }
        assert_eq!(gallery.len(), 5);
    }

    #[test]
    fn test_admit_shrinks_overfull_gallery_to_capacity() {
        let gallery = [203.0, 200.0, 206.0, 201.0, 205.0, 202.0, 204.0];
        assert_eq!(
            admit(&gallery, 900.0, 5),
            Admission::Evict {
                victims: vec![1, 3, 5]
            }
        );
    }

    #[test]
    fn test_admit_overfull_must_beat_every_victim() {
        let gallery = [203.0, 200.0, 206.0, 201.0, 205.0, 202.0, 204.0];
        // Beats the weakest but not the third weakest.
        assert_eq!(admit(&gallery, 201.5, 5), Admission::Reject { floor: 202.0 });
    }

    #[test]
    fn test_admit_zero_capacity_rejects() {
        assert_eq!(
            admit(&[], 500.0, 0),
            Admission::Reject {
                floor: f64::INFINITY
            }
        );
    }

    #[tokio::test]
    async fn test_identity_locks_serialize_same_usn() {
        let locks = Arc::new(IdentityLocks::default());
        let usn = Usn::parse("U1").unwrap();

        let guard = locks.lock(&usn).await;
        let contender = {
            let locks = Arc::clone(&locks);
            let usn = usn.clone();
            tokio::spawn(async move {
                let _g = locks.lock(&usn).await;
            })
        };
        tokio::task::yield_now().await;
        assert!(!contender.is_finished());

        // A different identity is not blocked.
        let other = Usn::parse("U2").unwrap();
        drop(locks.lock(&other).await);

        drop(guard);
        contender.await.unwrap();
    }
}
