use std::collections::BTreeMap;
use std::time::Instant;

/// Cross-cutting observer for one pipeline run.
///
/// The frame loop reports progress, per-stage timings and counters here;
/// callers choose whether that ends up in the `log` facade or nowhere.
pub trait PipelineLogger: Send {
    fn progress(&mut self, current: usize, total: usize);

    /// Time spent in a named stage for one frame.
    fn timing(&mut self, stage: &str, duration_ms: f64);

    /// A per-frame counter such as detections or live tracks.
    fn metric(&mut self, name: &str, value: f64);

    fn info(&mut self, message: &str);

    fn summary(&self) {}
}

/// Discards everything. Used by tests and embedders with their own reporting.
pub struct NullPipelineLogger;

impl PipelineLogger for NullPipelineLogger {
    fn progress(&mut self, _current: usize, _total: usize) {}
    fn timing(&mut self, _stage: &str, _duration_ms: f64) {}
    fn metric(&mut self, _name: &str, _value: f64) {}
    fn info(&mut self, _message: &str) {}
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
struct Stat {
    samples: usize,
    total: f64,
    max: f64,
}

impl Stat {
    fn record(&mut self, value: f64) {
        self.samples += 1;
        self.total += value;
        self.max = self.max.max(value);
    }

    fn mean(&self) -> f64 {
        if self.samples == 0 {
            0.0
        } else {
            self.total / self.samples as f64
        }
    }
}

/// Writes through the `log` facade.
///
/// Progress is logged every `interval` frames and on the last frame. Stage
/// timings and counters are aggregated and reported by `summary`.
pub struct LogPipelineLogger {
    label: String,
    interval: usize,
    started: Instant,
    frames: usize,
    timings: BTreeMap<String, Stat>,
    metrics: BTreeMap<String, Stat>,
}

impl LogPipelineLogger {
    pub fn new(label: impl Into<String>, interval: usize) -> Self {
        Self {
            label: label.into(),
            interval: interval.max(1),
            started: Instant::now(),
            frames: 0,
            timings: BTreeMap::new(),
            metrics: BTreeMap::new(),
        }
    }

    pub fn summary_string(&self) -> Option<String> {
        if self.frames == 0 && self.timings.is_empty() {
            return None;
        }
        let elapsed = self.started.elapsed().as_secs_f64();
        let mut lines = vec![format!(
            "{}: {} frames in {elapsed:.2}s",
            self.label, self.frames
        )];
        for (stage, stat) in &self.timings {
            lines.push(format!(
                "  {stage:10} avg {:6.2}ms  max {:7.2}ms  total {:8.1}ms",
                stat.mean(),
                stat.max,
                stat.total
            ));
        }
        for (name, stat) in &self.metrics {
            lines.push(format!("  {name:10} avg {:.1}  max {:.0}", stat.mean(), stat.max));
        }
        if self.frames > 0 && elapsed > 0.0 {
            lines.push(format!("  throughput {:.1} frames/s", self.frames as f64 / elapsed));
        }
        Some(lines.join("\n"))
    }

    pub fn frames(&self) -> usize {
        self.frames
    }

    fn should_report(&self, current: usize, total: usize) -> bool {
        current % self.interval == 0 || (total > 0 && current == total)
    }
}

impl PipelineLogger for LogPipelineLogger {
    fn progress(&mut self, current: usize, total: usize) {
        self.frames = current;
        if !self.should_report(current, total) {
            return;
        }
        if total > 0 {
            let pct = current as f64 / total as f64 * 100.0;
            log::info!("{}: {current}/{total} frames ({pct:.1}%)", self.label);
        } else {
            log::info!("{}: {current} frames", self.label);
        }
    }

    fn timing(&mut self, stage: &str, duration_ms: f64) {
        self.timings
            .entry(stage.to_string())
            .or_default()
            .record(duration_ms);
    }

    fn metric(&mut self, name: &str, value: f64) {
        self.metrics.entry(name.to_string()).or_default().record(value);
    }

    fn info(&mut self, message: &str) {
        log::info!("{}: {message}", self.label);
    }

    fn summary(&self) {
        if let Some(text) = self.summary_string() {
            log::info!("\n{text}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rstest::rstest;

    #[test]
    fn test_null_logger_accepts_everything() {
        let mut logger = NullPipelineLogger;
        logger.progress(1, 10);
        logger.timing("merge", 1.0);
        logger.metric("tracks", 3.0);
        logger.info("hello");
        logger.summary();
    }

    #[test]
    fn test_timing_aggregates() {
        let mut logger = LogPipelineLogger::new("job", 10);
        logger.timing("merge", 2.0);
        logger.timing("merge", 4.0);
        let stat = logger.timings["merge"];
        assert_eq!(stat.samples, 2);
        assert_relative_eq!(stat.mean(), 3.0);
        assert_relative_eq!(stat.max, 4.0);
    }

    #[test]
    fn test_summary_lists_stages_and_metrics() {
        let mut logger = LogPipelineLogger::new("cam1.jsonl", 10);
        logger.progress(5, 5);
        logger.timing("stabilize", 0.5);
        logger.metric("tracks", 2.0);
        let text = logger.summary_string().unwrap();
        assert!(text.starts_with("cam1.jsonl: 5 frames"));
        assert!(text.contains("stabilize"));
        assert!(text.contains("tracks"));
    }

    #[test]
    fn test_empty_summary_is_none() {
        assert!(LogPipelineLogger::new("job", 10).summary_string().is_none());
    }

    #[rstest]
    #[case::on_interval(20, 100, true)]
    #[case::between(21, 100, false)]
    #[case::last_frame(97, 97, true)]
    #[case::unknown_total(7, 0, false)]
    fn test_progress_throttle(#[case] current: usize, #[case] total: usize, #[case] expected: bool) {
        let logger = LogPipelineLogger::new("job", 10);
        assert_eq!(logger.should_report(current, total), expected);
    }

    #[test]
    fn test_zero_interval_clamped() {
        let mut logger = LogPipelineLogger::new("job", 0);
        logger.progress(3, 10);
        assert_eq!(logger.frames(), 3);
        assert!(logger.should_report(3, 10));
    }
}
