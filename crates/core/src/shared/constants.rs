/// Weighted mean displacement (rectified units per frame) below which a
/// vehicle in the stop zone counts as stopped.
pub const DEFAULT_VELOCITY_THRESHOLD: f64 = 1.0;

/// Samples needed before velocity is evaluated.
pub const DEFAULT_POSITION_BUFFER_SIZE: usize = 10;

pub const DEFAULT_OVERLAP_MERGE_THRESHOLD: f64 = 0.5;

pub const DEFAULT_IDENTITY_MATCH_DISTANCE: f64 = 50.0;

pub const DEFAULT_IDENTITY_HISTORY_LENGTH: usize = 10;

/// Max frames a stable id can go unseen before it expires (~1 second at 30 fps).
pub const DEFAULT_IDENTITY_MAX_AGE: usize = 30;

/// Frame rate assumed when a source carries no timestamps.
pub const DEFAULT_FPS: f64 = 30.0;

pub const DEFAULT_PROGRESS_LOG_INTERVAL: usize = 100;

pub const CONFIG_DIR_NAME: &str = "stopline";
pub const CONFIG_FILE_NAME: &str = "config.json";
