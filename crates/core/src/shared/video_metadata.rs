use std::path::PathBuf;

/// What a frame source knows about its stream once opened.
#[derive(Clone, Debug, PartialEq)]
pub struct SourceMetadata {
    /// Frame count, or 0 when the source cannot tell in advance.
    pub total_frames: usize,
    pub fps: f64,
    pub source_path: Option<PathBuf>,
}

impl SourceMetadata {
    pub fn new(total_frames: usize, fps: f64) -> Self {
        Self {
            total_frames,
            fps,
            source_path: None,
        }
    }

    pub fn with_source_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.source_path = Some(path.into());
        self
    }
}
