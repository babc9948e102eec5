//! 1-nearest-neighbour identity matching over every enrolled embedding.
//!
//! Each call is a full linear scan of the reference set; no index is kept.
//! That is fine for a classroom-sized population and is the first thing
//! to revisit if the identity count grows by orders of magnitude.

use std::sync::Arc;

use thiserror::Error;
use uuid::Uuid;

use crate::store::{RecordStore, StoreError};
use crate::types::{Embedding, Reference, Usn};

/// Nearest reference to a probe.
#[derive(Debug, Clone, PartialEq)]
pub struct Match {
    pub usn: Usn,
    /// Reference embedding that produced the distance.
    pub record_id: Uuid,
    /// Cosine distance in [0, 2]. Lower = more similar.
    pub distance: f32,
}

impl Match {
    /// A match is confirmed when it is no farther than `threshold`.
    pub fn is_confirmed(&self, threshold: f32) -> bool {
        self.distance <= threshold
    }
}

/// Strategy for finding the nearest reference to a probe embedding.
pub trait Matcher: Send + Sync {
    fn nearest(&self, probe: &Embedding, gallery: &[Reference]) -> Option<Match>;
}

/// Cosine-distance matcher.
///
/// Always visits every reference. On exact distance ties the first
/// reference in store order wins; callers must not rely on that order.
pub struct CosineMatcher;

impl Matcher for CosineMatcher {
    fn nearest(&self, probe: &Embedding, gallery: &[Reference]) -> Option<Match> {
        let mut best: Option<(&Reference, f32)> = None;

        for reference in gallery {
            if reference.embedding.dim() != probe.dim() {
                tracing::warn!(
                    record = %reference.id,
                    usn = %reference.usn,
                    expected = probe.dim(),
                    actual = reference.embedding.dim(),
                    "skipping reference with mismatched dimensionality"
                );
                continue;
            }

            let distance = probe.cosine_distance(&reference.embedding);
            if distance.is_nan() {
                continue;
            }
            if best.map_or(true, |(_, d)| distance < d) {
                best = Some((reference, distance));
            }
        }

        best.map(|(reference, distance)| Match {
            usn: reference.usn.clone(),
            record_id: reference.id,
            distance,
        })
    }
}

#[derive(Error, Debug)]
pub enum MatchError {
    #[error("no reference embeddings to compare against")]
    NoGallery,
    /// References exist but none shares the embedding's dimensionality, so
    /// the loaded model does not fit the stored gallery.
    #[error("face embedding has {actual} dimensions, stored references have {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Loads the reference set and finds the nearest identity.
///
/// Acceptance against the distance threshold is left to the caller.
pub struct IdentityMatcher {
    records: Arc<dyn RecordStore>,
    strategy: Box<dyn Matcher>,
}

impl IdentityMatcher {
    pub fn new(records: Arc<dyn RecordStore>) -> Self {
        Self::with_strategy(records, Box::new(CosineMatcher))
    }

    pub fn with_strategy(records: Arc<dyn RecordStore>, strategy: Box<dyn Matcher>) -> Self {
        Self { records, strategy }
    }

    pub async fn best_match(&self, probe: &Embedding) -> Result<Match, MatchError> {
        let references = self.records.references().await?;
        let Some(first) = references.first() else {
            return Err(MatchError::NoGallery);
        };
        if references.iter().all(|r| r.embedding.dim() != probe.dim()) {
            tracing::error!(
                expected = first.embedding.dim(),
                actual = probe.dim(),
                references = references.len(),
                "embedding dimensionality matches no stored reference"
            );
            return Err(MatchError::DimensionMismatch {
                expected: first.embedding.dim(),
                actual: probe.dim(),
            });
        }

        let found = self
            .strategy
            .nearest(probe, &references)
            .ok_or(MatchError::NoGallery)?;

        tracing::debug!(
            usn = %found.usn,
            distance = found.distance,
            references = references.len(),
            "nearest reference"
        );
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference(usn: &str, values: &[f32]) -> Reference {
        Reference {
            id: Uuid::new_v4(),
            usn: Usn::parse(usn).unwrap(),
            embedding: Embedding::new(values.to_vec(), "test"),
        }
    }

    fn probe(values: &[f32]) -> Embedding {
        Embedding::new(values.to_vec(), "test")
    }

    #[test]
    fn test_nearest_scans_whole_gallery() {
        // Best match is the last entry.
        let gallery = vec![
            reference("decoy1", &[0.0, 1.0, 0.0]),
            reference("decoy2", &[0.0, 0.0, 1.0]),
            reference("target", &[1.0, 0.0, 0.0]),
        ];
        let found = CosineMatcher.nearest(&probe(&[1.0, 0.0, 0.0]), &gallery).unwrap();
        assert_eq!(found.usn.as_str(), "target");
        assert_eq!(found.record_id, gallery[2].id);
        assert!(found.distance.abs() < 1e-6);
    }

    #[test]
    fn test_nearest_is_global_minimum_across_identities() {
        let gallery = vec![
            reference("A", &[1.0, 0.2]),
            reference("B", &[1.0, 0.05]),
            reference("A", &[0.0, 1.0]),
            reference("C", &[-1.0, 0.0]),
        ];
        let p = probe(&[1.0, 0.0]);
        let found = CosineMatcher.nearest(&p, &gallery).unwrap();
        let min = gallery
            .iter()
            .map(|r| p.cosine_distance(&r.embedding))
            .fold(f32::INFINITY, f32::min);
        assert_eq!(found.usn.as_str(), "B");
        assert_eq!(found.distance, min);
    }

    #[test]
    fn test_nearest_skips_mismatched_dimensions() {
        let gallery = vec![reference("short", &[1.0]), reference("ok", &[0.6, 0.8])];
        let found = CosineMatcher.nearest(&probe(&[1.0, 0.0]), &gallery).unwrap();
        assert_eq!(found.usn.as_str(), "ok");
    }

    #[test]
    fn test_nearest_empty_gallery() {
        assert!(CosineMatcher.nearest(&probe(&[1.0, 0.0]), &[]).is_none());
    }

    #[test]
    fn test_confirmation_threshold_is_inclusive() {
        let m = Match {
            usn: Usn::parse("U1").unwrap(),
            record_id: Uuid::new_v4(),
            distance: 0.5,
        };
        assert!(m.is_confirmed(0.5));
        assert!(!Match { distance: 0.7, ..m.clone() }.is_confirmed(0.5));
    }
}
