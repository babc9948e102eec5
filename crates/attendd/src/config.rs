use std::path::{Path, PathBuf};
use std::str::FromStr;

use attend_core::policy::{
    Policy, DEFAULT_CROP_SIZE, DEFAULT_DISTANCE_THRESHOLD, DEFAULT_EMBEDDING_DIM,
    DEFAULT_SHARPNESS_THRESHOLD, MAX_GALLERY_SIZE,
};
use serde::Deserialize;
use thiserror::Error;

/// Config file read when `ATTEND_CONFIG` is unset. Optional.
pub const DEFAULT_CONFIG_FILE: &str = "attend.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("{key}={value:?} is not a valid value")]
    InvalidValue { key: &'static str, value: String },
}

/// Daemon configuration.
///
/// Built from defaults, then an optional TOML file, then `ATTEND_*`
/// environment variables.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// SQLite database file.
    pub db_path: PathBuf,
    /// Root directory of stored face crops.
    pub image_dir: PathBuf,
    /// URL prefix under which `image_dir` is served.
    pub public_base_url: String,
    /// Directory containing the SCRFD and ArcFace ONNX files.
    pub model_dir: PathBuf,
    /// Minimum Laplacian variance. Shared by registration, check-in refresh
    /// and cleanup.
    pub sharpness_threshold: f64,
    /// Maximum cosine distance for a confirmed match.
    pub distance_threshold: f32,
    pub max_gallery_size: usize,
    pub embedding_dim: usize,
    pub crop_size: u32,
    pub max_upload_bytes: usize,
    pub request_timeout_secs: u64,
    pub cors_origins: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            db_path: PathBuf::from("data/attend.db"),
            image_dir: PathBuf::from("data/images"),
            public_base_url: "http://localhost:8000/images".to_string(),
            model_dir: PathBuf::from("models"),
            sharpness_threshold: DEFAULT_SHARPNESS_THRESHOLD,
            distance_threshold: DEFAULT_DISTANCE_THRESHOLD,
            max_gallery_size: MAX_GALLERY_SIZE,
            embedding_dim: DEFAULT_EMBEDDING_DIM,
            crop_size: DEFAULT_CROP_SIZE,
            max_upload_bytes: 20 * 1024 * 1024,
            request_timeout_secs: 60,
            cors_origins: vec![
                "http://localhost:3000".to_string(),
                "http://localhost:3001".to_string(),
                "https://localhost:3001".to_string(),
            ],
        }
    }
}

impl Config {
    /// Load from `ATTEND_CONFIG` (or `attend.toml` if present) and the
    /// process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let explicit = std::env::var("ATTEND_CONFIG").ok().map(PathBuf::from);
        let mut config = match &explicit {
            Some(path) => Self::from_file(path)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(toml::from_str(&raw)?)
    }

    /// Apply `ATTEND_*` overrides read through `lookup`. Empty values are
    /// ignored.
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("ATTEND_HOST") {
            self.host = v;
        }
        if let Some(v) = get("ATTEND_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Some(v) = get("ATTEND_IMAGE_DIR") {
            self.image_dir = PathBuf::from(v);
        }
        if let Some(v) = get("ATTEND_PUBLIC_BASE_URL") {
            self.public_base_url = v;
        }
        if let Some(v) = get("ATTEND_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some(v) = get("ATTEND_CORS_ORIGINS") {
            self.cors_origins = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }

        parse_into(&get, "ATTEND_PORT", &mut self.port)?;
        parse_into(&get, "ATTEND_SHARPNESS_THRESHOLD", &mut self.sharpness_threshold)?;
        parse_into(&get, "ATTEND_DISTANCE_THRESHOLD", &mut self.distance_threshold)?;
        parse_into(&get, "ATTEND_MAX_GALLERY_SIZE", &mut self.max_gallery_size)?;
        parse_into(&get, "ATTEND_EMBEDDING_DIM", &mut self.embedding_dim)?;
        parse_into(&get, "ATTEND_CROP_SIZE", &mut self.crop_size)?;
        parse_into(&get, "ATTEND_MAX_UPLOAD_BYTES", &mut self.max_upload_bytes)?;
        parse_into(&get, "ATTEND_REQUEST_TIMEOUT_SECS", &mut self.request_timeout_secs)?;
        Ok(())
    }

    pub fn policy(&self) -> Policy {
        Policy {
            sharpness_threshold: self.sharpness_threshold,
            distance_threshold: self.distance_threshold,
            max_gallery_size: self.max_gallery_size,
            embedding_dim: self.embedding_dim,
            crop_size: self.crop_size,
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_into<T: FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    slot: &mut T,
) -> Result<(), ConfigError> {
    if let Some(value) = get(key) {
        *slot = value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { key, value })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_match_policy() {
        let config = Config::default();
        assert_eq!(config.policy(), Policy::default());
        assert_eq!(config.bind_addr(), "0.0.0.0:8000");
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("attend.toml");
        std::fs::write(&path, "port = 9100\nsharpness_threshold = 150.0\n").unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.port, 9100);
        assert_eq!(config.sharpness_threshold, 150.0);
        assert_eq!(config.max_gallery_size, 5);
    }

    #[test]
    fn test_invalid_toml_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "port = \"many\"").unwrap();
        assert!(matches!(Config::from_file(&path), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config
            .apply_overrides(lookup(&[
                ("ATTEND_PORT", "9000"),
                ("ATTEND_DISTANCE_THRESHOLD", "0.45"),
                ("ATTEND_CORS_ORIGINS", "http://a, http://b,"),
                ("ATTEND_HOST", ""),
            ]))
            .unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.distance_threshold, 0.45);
        assert_eq!(config.cors_origins, vec!["http://a", "http://b"]);
        assert_eq!(config.host, "0.0.0.0");
    }

    #[test]
    fn test_bad_env_value_is_rejected() {
        let mut config = Config::default();
        let err = config
            .apply_overrides(lookup(&[("ATTEND_MAX_GALLERY_SIZE", "five")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue { key: "ATTEND_MAX_GALLERY_SIZE", .. }
        ));
    }
}
