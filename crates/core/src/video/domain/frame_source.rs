use thiserror::Error;

use crate::shared::frame::Frame;
use crate::shared::video_metadata::SourceMetadata;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SourceError {
    /// The stream cannot be read at all.
    #[error("failed to open source: {0}")]
    Open(String),
    /// One frame is unusable; the stream continues after it.
    #[error("frame {index} unreadable: {message}")]
    Frame { index: usize, message: String },
    /// A resource ran out. The frame was not consumed and may be retried
    /// after `recover()`.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
}

impl SourceError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SourceError::Frame { .. })
    }
}

/// In-order producer of per-frame detection batches.
///
/// Sources are finite and single-pass: once `next_frame` returns `None`
/// the stream is exhausted.
pub trait FrameSource: Send {
    fn open(&mut self) -> Result<SourceMetadata, SourceError>;

    fn next_frame(&mut self) -> Option<Result<Frame, SourceError>>;

    /// Releases caches or buffers after `ResourceExhausted`.
    fn recover(&mut self) {}

    fn close(&mut self);
}
