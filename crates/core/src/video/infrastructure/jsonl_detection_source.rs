use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::shared::detection::Detection;
use crate::shared::frame::Frame;
use crate::shared::video_metadata::SourceMetadata;
use crate::video::domain::frame_source::{FrameSource, SourceError};

/// One line of tracker output.
#[derive(Debug, Deserialize)]
struct FrameLine {
    #[serde(default)]
    frame: Option<usize>,
    #[serde(default)]
    timestamp_ms: Option<f64>,
    #[serde(default)]
    detections: Vec<Detection>,
}

/// Replays a JSON-lines file of per-frame detections.
///
/// Each non-blank line is `{"frame": n, "timestamp_ms": t, "detections": [..]}`.
/// `frame` defaults to the line's position and `timestamp_ms` to
/// `frame / fps`. A malformed line is reported as a transient frame error.
pub struct JsonlDetectionSource {
    path: PathBuf,
    fps: f64,
    lines: Option<Lines<BufReader<File>>>,
    position: usize,
}

impl JsonlDetectionSource {
    pub fn new(path: impl Into<PathBuf>, fps: f64) -> Self {
        Self {
            path: path.into(),
            fps,
            lines: None,
            position: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn parse(&self, index: usize, line: &str) -> Result<Frame, SourceError> {
        let parsed: FrameLine = serde_json::from_str(line).map_err(|e| SourceError::Frame {
            index,
            message: e.to_string(),
        })?;
        let index = parsed.frame.unwrap_or(index);
        let seconds = match parsed.timestamp_ms {
            Some(ms) if ms.is_finite() && ms >= 0.0 => ms / 1000.0,
            _ if self.fps > 0.0 => index as f64 / self.fps,
            _ => 0.0,
        };
        let timestamp = Duration::try_from_secs_f64(seconds).map_err(|e| SourceError::Frame {
            index,
            message: format!("timestamp of {seconds}s out of range: {e}"),
        })?;
        Ok(Frame::new(index, timestamp, parsed.detections))
    }
}

fn open_lines(path: &Path) -> Result<Lines<BufReader<File>>, SourceError> {
    let file = File::open(path)
        .map_err(|e| SourceError::Open(format!("{}: {e}", path.display())))?;
    Ok(BufReader::new(file).lines())
}

impl FrameSource for JsonlDetectionSource {
    fn open(&mut self) -> Result<SourceMetadata, SourceError> {
        let total_frames = open_lines(&self.path)?
            .map_while(Result::ok)
            .filter(|l| !l.trim().is_empty())
            .count();
        self.lines = Some(open_lines(&self.path)?);
        self.position = 0;
        log::info!(
            "Opened {} ({total_frames} frames)",
            self.path.display()
        );
        Ok(SourceMetadata::new(total_frames, self.fps).with_source_path(&self.path))
    }

    fn next_frame(&mut self) -> Option<Result<Frame, SourceError>> {
        loop {
            let line = match self.lines.as_mut()?.next()? {
                Ok(line) => line,
                Err(e) => {
                    // The underlying reader is unusable after an I/O error.
                    self.lines = None;
                    return Some(Err(SourceError::Open(e.to_string())));
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            let index = self.position;
            self.position += 1;
            return Some(self.parse(index, &line));
        }
    }

    fn close(&mut self) {
        self.lines = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_lines(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    fn drain(source: &mut JsonlDetectionSource) -> Vec<Result<Frame, SourceError>> {
        std::iter::from_fn(|| source.next_frame()).collect()
    }

    #[test]
    fn test_reads_frames_in_order() {
        let file = write_lines(concat!(
            r#"{"frame":0,"timestamp_ms":0,"detections":[{"bbox":[0,0,10,10],"class_id":2,"confidence":0.9,"tracker_id":1}]}"#,
            "\n",
            r#"{"frame":1,"timestamp_ms":40,"detections":[]}"#,
            "\n",
        ));
        let mut source = JsonlDetectionSource::new(file.path(), 25.0);
        let meta = source.open().unwrap();
        assert_eq!(meta.total_frames, 2);
        assert_eq!(meta.fps, 25.0);

        let frames: Vec<Frame> = drain(&mut source).into_iter().map(Result::unwrap).collect();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].detections().len(), 1);
        assert_eq!(frames[1].index(), 1);
        assert_eq!(frames[1].timestamp(), Duration::from_millis(40));
    }

    #[test]
    fn test_missing_fields_fall_back_to_position_and_fps() {
        let file = write_lines("{\"detections\":[]}\n\n{}\n");
        let mut source = JsonlDetectionSource::new(file.path(), 10.0);
        assert_eq!(source.open().unwrap().total_frames, 2);

        let frames: Vec<Frame> = drain(&mut source).into_iter().map(Result::unwrap).collect();
        assert_eq!(frames[1].index(), 1);
        assert_eq!(frames[1].timestamp(), Duration::from_millis(100));
    }

    #[test]
    fn test_malformed_line_is_transient() {
        let file = write_lines("{}\nnot json\n{}\n");
        let mut source = JsonlDetectionSource::new(file.path(), 30.0);
        source.open().unwrap();

        let results = drain(&mut source);
        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok());
        let err = results[1].as_ref().unwrap_err();
        assert!(err.is_transient());
        assert!(matches!(err, SourceError::Frame { index: 1, .. }));
        assert!(results[2].is_ok());
    }

    #[test]
    fn test_out_of_range_timestamp_is_transient() {
        let file = write_lines("{\"timestamp_ms\":1e30}\n{\"timestamp_ms\":80}\n");
        let mut source = JsonlDetectionSource::new(file.path(), 30.0);
        source.open().unwrap();

        let results = drain(&mut source);
        assert_eq!(results.len(), 2);
        let err = results[0].as_ref().unwrap_err();
        assert!(err.is_transient());
        assert!(matches!(err, SourceError::Frame { index: 0, .. }));
        assert_eq!(
            results[1].as_ref().unwrap().timestamp(),
            Duration::from_millis(80)
        );
    }

    #[test]
    fn test_missing_file_fails_to_open() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = JsonlDetectionSource::new(dir.path().join("absent.jsonl"), 30.0);
        assert!(matches!(source.open(), Err(SourceError::Open(_))));
    }

    #[test]
    fn test_next_frame_before_open_is_none() {
        let mut source = JsonlDetectionSource::new("unused.jsonl", 30.0);
        assert!(source.next_frame().is_none());
    }

    #[test]
    fn test_close_ends_stream() {
        let file = write_lines("{}\n{}\n");
        let mut source = JsonlDetectionSource::new(file.path(), 30.0);
        source.open().unwrap();
        source.close();
        assert!(source.next_frame().is_none());
    }
}
