use std::time::Duration;

use crate::shared::detection::Detection;

/// One decoded video frame, reduced to what the compliance engine consumes:
/// its position in the stream and the upstream tracker's detections.
///
/// Pixel data never reaches the core; the detector runs upstream.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    index: usize,
    timestamp: Duration,
    detections: Vec<Detection>,
}

impl Frame {
    pub fn new(index: usize, timestamp: Duration, detections: Vec<Detection>) -> Self {
        Self {
            index,
            timestamp,
            detections,
        }
    }

    /// Builds a frame whose timestamp is derived from its index at `fps`.
    /// Saturates at `Duration::MAX` for rates too small to represent.
    pub fn at_rate(index: usize, fps: f64, detections: Vec<Detection>) -> Self {
        let timestamp = if fps > 0.0 {
            Duration::try_from_secs_f64(index as f64 / fps).unwrap_or(Duration::MAX)
        } else {
            Duration::ZERO
        };
        Self::new(index, timestamp, detections)
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Offset from the start of the video.
    pub fn timestamp(&self) -> Duration {
        self.timestamp
    }

    pub fn detections(&self) -> &[Detection] {
        &self.detections
    }

    pub fn into_detections(self) -> Vec<Detection> {
        self.detections
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_construction_and_accessors() {
        let frame = Frame::new(7, Duration::from_millis(250), vec![]);
        assert_eq!(frame.index(), 7);
        assert_eq!(frame.timestamp(), Duration::from_millis(250));
        assert!(frame.detections().is_empty());
    }

    #[test]
    fn test_at_rate_derives_timestamp() {
        let frame = Frame::at_rate(45, 30.0, vec![]);
        assert_relative_eq!(frame.timestamp().as_secs_f64(), 1.5);
    }

    #[test]
    fn test_at_rate_zero_fps_is_time_zero() {
        let frame = Frame::at_rate(10, 0.0, vec![]);
        assert_eq!(frame.timestamp(), Duration::ZERO);
    }

    #[test]
    fn test_at_rate_saturates_instead_of_panicking() {
        let frame = Frame::at_rate(usize::MAX, 1e-300, vec![]);
        assert_eq!(frame.timestamp(), Duration::MAX);
    }
}
