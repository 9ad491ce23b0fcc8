use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::compliance::domain::records::LedgerSnapshot;
use crate::persistence::domain::persistence_sink::{PersistenceSink, SinkError};
use crate::pipeline::frame_processor::FrameProcessor;
use crate::pipeline::pipeline_logger::{NullPipelineLogger, PipelineLogger};
use crate::shared::engine_config::{ConfigError, EngineConfig};
use crate::shared::frame::Frame;
use crate::video::domain::frame_source::{FrameSource, SourceError};

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error("persistence failed: {0}")]
    Sink(#[from] SinkError),
    #[error("pipeline already executed")]
    AlreadyExecuted,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Cancelled,
}

#[derive(Debug)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub snapshot: LedgerSnapshot,
    pub frames_processed: usize,
    pub frames_skipped: usize,
}

/// A failed run still carries whatever was processed before the error.
#[derive(Debug)]
pub struct RunFailure {
    pub error: PipelineError,
    pub snapshot: LedgerSnapshot,
}

type ProgressFn = Box<dyn Fn(usize, usize) -> bool + Send>;
type SnapshotFn = Box<dyn Fn(&LedgerSnapshot) + Send>;

/// Runs the compliance engine over one video's frames.
///
/// Frames are read strictly in order. Cancellation is checked before every
/// frame, changes are streamed to the sink as they happen, and the full
/// snapshot is written once more at the end regardless of how the run ended.
/// Single use: `execute` consumes the source.
pub struct ProcessVideoUseCase {
    source: Option<Box<dyn FrameSource>>,
    sink: Arc<dyn PersistenceSink>,
    config: EngineConfig,
    video_id: String,
    recorded_at: DateTime<Utc>,
    logger: Box<dyn PipelineLogger>,
    on_progress: Option<ProgressFn>,
    on_snapshot: Option<SnapshotFn>,
    cancelled: Arc<AtomicBool>,
}

impl ProcessVideoUseCase {
    pub fn new(
        source: Box<dyn FrameSource>,
        sink: Arc<dyn PersistenceSink>,
        config: EngineConfig,
        video_id: impl Into<String>,
        recorded_at: DateTime<Utc>,
    ) -> Self {
        Self {
            source: Some(source),
            sink,
            config,
            video_id: video_id.into(),
            recorded_at,
            logger: Box::new(NullPipelineLogger),
            on_progress: None,
            on_snapshot: None,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_logger(mut self, logger: Box<dyn PipelineLogger>) -> Self {
        self.logger = logger;
        self
    }

    /// `on_progress(processed, total)`; returning false cancels the run.
    pub fn with_progress(mut self, on_progress: ProgressFn) -> Self {
        self.on_progress = Some(on_progress);
        self
    }

    /// Called with the full ledger snapshot after every frame that changed it.
    pub fn with_snapshot_listener(mut self, on_snapshot: SnapshotFn) -> Self {
        self.on_snapshot = Some(on_snapshot);
        self
    }

    pub fn with_cancellation(mut self, cancelled: Arc<AtomicBool>) -> Self {
        self.cancelled = cancelled;
        self
    }

    pub fn execute(&mut self) -> Result<RunReport, RunFailure> {
        let fail = |error: PipelineError| RunFailure {
            error,
            snapshot: LedgerSnapshot::default(),
        };
        let mut source = self
            .source
            .take()
            .ok_or_else(|| fail(PipelineError::AlreadyExecuted))?;
        let mut processor =
            FrameProcessor::new(&self.config, self.recorded_at).map_err(|e| fail(e.into()))?;

        let result = source
            .open()
            .map_err(PipelineError::from)
            .and_then(|metadata| {
                self.logger.info(&format!("{} frames", metadata.total_frames));
                self.run_frames(source.as_mut(), &mut processor, metadata.total_frames)
            });
        source.close();

        let snapshot = processor.ledger().snapshot();
        let final_save = self.save(&snapshot);
        self.logger.summary();

        match (result, final_save) {
            (Ok(stats), Ok(())) => Ok(RunReport {
                outcome: stats.outcome,
                snapshot,
                frames_processed: stats.processed,
                frames_skipped: stats.skipped,
            }),
            (Err(error), _) | (Ok(_), Err(error)) => Err(RunFailure { error, snapshot }),
        }
    }

    fn run_frames(
        &mut self,
        source: &mut dyn FrameSource,
        processor: &mut FrameProcessor,
        total: usize,
    ) -> Result<LoopStats, PipelineError> {
        let mut stats = LoopStats {
            outcome: RunOutcome::Completed,
            processed: 0,
            skipped: 0,
        };

        loop {
            if self.cancelled.load(Ordering::Relaxed) {
                self.logger.info("cancelled");
                stats.outcome = RunOutcome::Cancelled;
                break;
            }

            match read_frame(source)? {
                None => break,
                Some(Ok(frame)) => {
                    processor.process(frame, self.logger.as_mut());
                    stats.processed += 1;
                }
                Some(Err(e)) => {
                    log::warn!("{}: skipping frame: {e}", self.video_id);
                    stats.skipped += 1;
                }
            }

            let consumed = stats.processed + stats.skipped;
            self.logger.progress(consumed, total);

            if processor.ledger().has_changes() {
                let changes = processor.ledger_mut().take_changes();
                self.save_partial(&changes)?;
                if let Some(cb) = &self.on_snapshot {
                    cb(&processor.ledger().snapshot());
                }
            }

            if let Some(cb) = &self.on_progress {
                if !cb(consumed, total) {
                    self.cancelled.store(true, Ordering::Relaxed);
                }
            }
        }
        Ok(stats)
    }

    /// Streams a change set. Only permanent sink failures stop the run.
    fn save_partial(&self, changes: &LedgerSnapshot) -> Result<(), PipelineError> {
        match self.save(changes) {
            Err(PipelineError::Sink(e)) if !e.is_permanent() => {
                log::warn!("{}: partial save failed: {e}", self.video_id);
                Ok(())
            }
            other => other,
        }
    }

    fn save(&self, snapshot: &LedgerSnapshot) -> Result<(), PipelineError> {
        self.sink.upsert_tracks(&self.video_id, &snapshot.tracks)?;
        self.sink
            .upsert_counts(&self.video_id, &snapshot.vehicle_counts)?;
        Ok(())
    }
}

struct LoopStats {
    outcome: RunOutcome,
    processed: usize,
    skipped: usize,
}

/// Reads the next frame, giving a resource-exhausted source one recovery
/// attempt. Transient errors are returned for the caller to skip; anything
/// else ends the run.
fn read_frame(
    source: &mut dyn FrameSource,
) -> Result<Option<Result<Frame, SourceError>>, PipelineError> {
    match source.next_frame() {
        Some(Err(original @ SourceError::ResourceExhausted(_))) => {
            log::warn!("{original}; recovering and retrying once");
            source.recover();
            match source.next_frame() {
                Some(Err(SourceError::ResourceExhausted(_))) => Err(original.into()),
                other => check_fatal(other),
            }
        }
        other => check_fatal(other),
    }
}

fn check_fatal(
    next: Option<Result<Frame, SourceError>>,
) -> Result<Option<Result<Frame, SourceError>>, PipelineError> {
    match next {
        Some(Err(e)) if !e.is_transient() => Err(e.into()),
        other => Ok(other),
    }
}
