use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::shared::constants::{
    CONFIG_DIR_NAME, CONFIG_FILE_NAME, DEFAULT_FPS, DEFAULT_IDENTITY_HISTORY_LENGTH,
    DEFAULT_IDENTITY_MATCH_DISTANCE, DEFAULT_IDENTITY_MAX_AGE, DEFAULT_OVERLAP_MERGE_THRESHOLD,
    DEFAULT_POSITION_BUFFER_SIZE, DEFAULT_PROGRESS_LOG_INTERVAL, DEFAULT_VELOCITY_THRESHOLD,
};
use crate::shared::geometry::Polygon;
use crate::shared::perspective::{GeometryError, PerspectiveConfig, PerspectiveTransform};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to write config {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{name} must be {expected}, got {value}")]
    OutOfRange {
        name: &'static str,
        expected: &'static str,
        value: String,
    },
    #[error("{0} needs at least three vertices")]
    Polygon(&'static str),
    #[error("invalid perspective: {0}")]
    Perspective(#[from] GeometryError),
}

/// Tunables for one compliance engine run.
///
/// Every field has a default so partial JSON files are accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub velocity_threshold: f64,
    pub position_buffer_size: usize,
    pub overlap_merge_threshold: f64,
    pub identity_match_distance: f64,
    pub identity_history_length: usize,
    pub identity_max_age: usize,
    /// Region in which stopping is judged (image coordinates).
    pub stop_polygon: Polygon,
    /// Region in which objects are tracked at all. Empty means the whole frame.
    pub detection_polygon: Polygon,
    pub perspective: Option<PerspectiveConfig>,
    pub fps: f64,
    pub progress_log_interval: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            velocity_threshold: DEFAULT_VELOCITY_THRESHOLD,
            position_buffer_size: DEFAULT_POSITION_BUFFER_SIZE,
            overlap_merge_threshold: DEFAULT_OVERLAP_MERGE_THRESHOLD,
            identity_match_distance: DEFAULT_IDENTITY_MATCH_DISTANCE,
            identity_history_length: DEFAULT_IDENTITY_HISTORY_LENGTH,
            identity_max_age: DEFAULT_IDENTITY_MAX_AGE,
            stop_polygon: Polygon::default(),
            detection_polygon: Polygon::default(),
            perspective: None,
            fps: DEFAULT_FPS,
            progress_log_interval: DEFAULT_PROGRESS_LOG_INTERVAL,
        }
    }
}

impl EngineConfig {
    pub fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
    }

    /// Loads the user config, falling back to defaults when absent or unreadable.
    pub fn load() -> Self {
        match Self::config_path() {
            Some(path) if path.exists() => Self::from_file(&path).unwrap_or_else(|e| {
                log::warn!("Ignoring config: {e}");
                Self::default()
            }),
            _ => Self::default(),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let json = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&json).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let write_err = |source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(write_err)?;
        }
        let json = serde_json::to_string_pretty(self).map_err(|e| ConfigError::Write {
            path: path.to_path_buf(),
            source: std::io::Error::other(e),
        })?;
        fs::write(path, json).map_err(write_err)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.velocity_threshold.is_finite() && self.velocity_threshold >= 0.0) {
            return Err(out_of_range(
                "velocity_threshold",
                "a non-negative number",
                self.velocity_threshold,
            ));
        }
        if self.position_buffer_size < 2 {
            return Err(out_of_range(
                "position_buffer_size",
                "at least 2",
                self.position_buffer_size,
            ));
        }
        if !(0.0..=1.0).contains(&self.overlap_merge_threshold) {
            return Err(out_of_range(
                "overlap_merge_threshold",
                "between 0.0 and 1.0",
                self.overlap_merge_threshold,
            ));
        }
        if !(self.identity_match_distance.is_finite() && self.identity_match_distance >= 0.0) {
            return Err(out_of_range(
                "identity_match_distance",
                "a non-negative number",
                self.identity_match_distance,
            ));
        }
        if self.identity_history_length == 0 {
            return Err(out_of_range("identity_history_length", "at least 1", 0));
        }
        if !(self.fps.is_finite() && self.fps > 0.0) {
            return Err(out_of_range("fps", "positive", self.fps));
        }
        if self.stop_polygon.vertices().len() < 3 {
            return Err(ConfigError::Polygon("stop_polygon"));
        }
        if !self.detection_polygon.is_empty() && self.detection_polygon.vertices().len() < 3 {
            return Err(ConfigError::Polygon("detection_polygon"));
        }
        PerspectiveTransform::from_config(self.perspective.as_ref())?;
        Ok(())
    }
}

fn out_of_range(name: &'static str, expected: &'static str, value: impl ToString) -> ConfigError {
    ConfigError::OutOfRange {
        name,
        expected,
        value: value.to_string(),
    }
}
