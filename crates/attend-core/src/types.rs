use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

const USN_MAX_LEN: usize = 64;

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

/// Face embedding vector tagged with the model that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model tag (e.g., "w600k_r50"). Galleries never mix models.
    pub model: String,
}

impl Embedding {
    pub fn new(values: Vec<f32>, model: impl Into<String>) -> Self {
        Self {
            values,
            model: model.into(),
        }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Cosine similarity in [-1, 1]. Higher = more similar.
    ///
    /// A zero vector has similarity 0.0 with everything.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 {
            dot / denom
        } else {
            0.0
        }
    }

    /// Cosine distance `1 - similarity`, clamped to [0, 2].
    pub fn cosine_distance(&self, other: &Embedding) -> f32 {
        (1.0 - self.similarity(other)).clamp(0.0, 2.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidUsn {
    #[error("usn is empty")]
    Empty,
    #[error("usn is longer than {USN_MAX_LEN} characters")]
    TooLong,
    #[error("usn contains {0:?}; only ASCII letters, digits, '-', '_' and '.' are allowed")]
    BadChar(char),
    #[error("usn must not be a relative path component")]
    Reserved,
}

/// Unique identity key. Also used as an object-store path segment, so the
/// character set is restricted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Usn(String);

impl Usn {
    pub fn parse(raw: &str) -> Result<Self, InvalidUsn> {
        let usn = raw.trim();
        if usn.is_empty() {
            return Err(InvalidUsn::Empty);
        }
        if usn.len() > USN_MAX_LEN {
            return Err(InvalidUsn::TooLong);
        }
        if usn == "." || usn == ".." {
            return Err(InvalidUsn::Reserved);
        }
        if let Some(c) = usn
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
        {
            return Err(InvalidUsn::BadChar(c));
        }
        Ok(Self(usn.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Usn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Usn {
    type Err = InvalidUsn;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Usn {
    type Error = InvalidUsn;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Usn> for String {
    fn from(usn: Usn) -> Self {
        usn.0
    }
}

/// Which flow produced a gallery embedding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EmbeddingSource {
    Register,
    CheckIn,
}

impl EmbeddingSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Register => "register",
            Self::CheckIn => "check-in",
        }
    }
}

impl FromStr for EmbeddingSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "register" => Ok(Self::Register),
            "check-in" => Ok(Self::CheckIn),
            other => Err(format!("unknown embedding source: {other}")),
        }
    }
}

/// Location of a stored face crop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    /// Object-store key, `students/<usn>/<name>`.
    pub path: String,
    /// Public URL returned by the object store.
    pub url: String,
}

/// One reference embedding in an identity's gallery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    pub id: Uuid,
    pub usn: Usn,
    pub embedding: Embedding,
    pub image: Option<ImageRef>,
    /// Laplacian variance of the stored crop.
    pub sharpness: f64,
    pub source: EmbeddingSource,
    pub created_at: DateTime<Utc>,
}

/// The subset of an [`EmbeddingRecord`] the matcher needs.
#[derive(Debug, Clone, PartialEq)]
pub struct Reference {
    pub id: Uuid,
    pub usn: Usn,
    pub embedding: Embedding,
}

/// Profile fields supplied at registration.
///
/// `None` fields leave any stored value untouched on update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityProfile {
    pub usn: Usn,
    pub name: String,
    pub class_name: Option<String>,
    pub phone: Option<String>,
    pub guardian_email: Option<String>,
    pub guardian_phone: Option<String>,
    pub subjects: Option<Vec<String>>,
}

/// A stored identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub id: Uuid,
    pub usn: Usn,
    pub name: String,
    pub class_name: Option<String>,
    pub phone: Option<String>,
    pub guardian_email: Option<String>,
    pub guardian_phone: Option<String>,
    pub subjects: Vec<String>,
    /// URLs of the surviving gallery images.
    pub image_urls: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
