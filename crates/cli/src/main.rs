use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use clap::Parser;

use stopline_core::persistence::domain::persistence_sink::{NullSink, PersistenceSink};
use stopline_core::persistence::infrastructure::buffered_sink::BufferedSink;
use stopline_core::persistence::infrastructure::json_file_sink::JsonFileSink;
use stopline_core::pipeline::job::{JobDescriptor, JobEvent, JobId, JobState, JobStatus};
use stopline_core::pipeline::job_orchestrator::JobOrchestrator;
use stopline_core::shared::engine_config::EngineConfig;
use stopline_core::shared::geometry::{Point, Polygon};
use stopline_core::video::infrastructure::jsonl_detection_source::JsonlDetectionSource;

/// Stop-sign compliance analysis for tracked vehicle detections.
///
/// Each input is a JSON-lines file with one `{"frame", "timestamp_ms",
/// "detections"}` object per video frame.
#[derive(Parser)]
#[command(name = "stopline")]
struct Cli {
    /// Detection files to process, in order.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// Engine config JSON (default: platform config dir, then built-in defaults).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory receiving per-video tracks.json and counts.json.
    #[arg(long, default_value = "stopline-output")]
    output_dir: PathBuf,

    /// Where writes that failed are buffered until they can be retried.
    #[arg(long)]
    fallback_dir: Option<PathBuf>,

    /// Wall-clock start of the recordings (RFC 3339). Defaults to now.
    #[arg(long)]
    recorded_at: Option<DateTime<Utc>>,

    /// Stop zone as "x,y;x,y;x,y..." in image coordinates.
    #[arg(long)]
    stop_polygon: Option<String>,

    /// Frame rate used for lines without a timestamp.
    #[arg(long)]
    fps: Option<f64>,

    /// Weighted displacement per frame below which a vehicle has stopped.
    #[arg(long)]
    velocity_threshold: Option<f64>,

    /// Positions sampled before stopping is judged.
    #[arg(long)]
    buffer_size: Option<usize>,

    /// Process without writing results.
    #[arg(long)]
    dry_run: bool,
}

fn main() {
    env_logger::init();

    match run() {
        Ok(true) => {}
        Ok(false) => process::exit(1),
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(1);
        }
    }
}

/// Returns whether every job completed.
fn run() -> Result<bool, Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    validate(&cli)?;

    let config = build_config(&cli)?;
    config.validate()?;
    log::debug!("Engine config: {config:?}");
    let sink = build_sink(&cli);
    let recorded_at = cli.recorded_at.unwrap_or_else(Utc::now);

    let orchestrator = JobOrchestrator::new(config.clone(), sink);
    let events = orchestrator.subscribe();

    let mut names: HashMap<JobId, String> = HashMap::new();
    for (input, video_id) in cli.inputs.iter().zip(video_ids(&cli.inputs)) {
        let descriptor = JobDescriptor {
            file_name: display_name(input),
            video_id,
            recorded_at,
            source: Box::new(JsonlDetectionSource::new(input, config.fps)),
        };
        let name = descriptor.file_name.clone();
        names.insert(orchestrator.enqueue(descriptor)?, name);
    }

    let mut remaining = names.len();
    while remaining > 0 {
        match events.recv()? {
            JobEvent::Started { job_id } => {
                eprintln!("Processing {}", names[&job_id]);
            }
            JobEvent::Progress { progress, .. } => {
                eprint!(
                    "\r  frame {}/{} ({:.0}%)",
                    progress.processed,
                    progress.total,
                    progress.fraction() * 100.0
                );
            }
            JobEvent::Finished { job_id, state } => {
                eprintln!("\n  {} {state}", names[&job_id]);
                remaining -= 1;
            }
        }
    }

    let mut ok = true;
    let mut report = Vec::new();
    for job in orchestrator.jobs() {
        let summary = match orchestrator.get_status(job.job_id) {
            Some(JobStatus::Completed { result }) => {
                let mut counts: BTreeMap<String, u64> = BTreeMap::new();
                for c in &result.vehicle_counts {
                    *counts.entry(c.vehicle_type.to_string()).or_insert(0) += c.count;
                }
                let compliant = result.tracks.iter().filter(|t| t.compliance).count();
                serde_json::json!({
                    "file": job.file_name,
                    "state": JobState::Completed,
                    "vehicle_counts": counts,
                    "tracks": result.tracks.len(),
                    "compliant": compliant,
                })
            }
            Some(JobStatus::Failed { error }) => {
                ok = false;
                serde_json::json!({ "file": job.file_name, "state": JobState::Failed, "error": error })
            }
            _ => {
                ok = false;
                serde_json::json!({ "file": job.file_name, "state": job.state })
            }
        };
        report.push(summary);
    }
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(ok)
}

fn build_config(cli: &Cli) -> Result<EngineConfig, Box<dyn std::error::Error>> {
    let mut config = match &cli.config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::load(),
    };
    if let Some(polygon) = &cli.stop_polygon {
        config.stop_polygon = parse_polygon(polygon)?;
    }
    if let Some(fps) = cli.fps {
        config.fps = fps;
    }
    if let Some(threshold) = cli.velocity_threshold {
        config.velocity_threshold = threshold;
    }
    if let Some(size) = cli.buffer_size {
        config.position_buffer_size = size;
    }
    Ok(config)
}

fn build_sink(cli: &Cli) -> Arc<dyn PersistenceSink> {
    if cli.dry_run {
        return Arc::new(NullSink);
    }
    let files = JsonFileSink::new(&cli.output_dir);
    Arc::new(BufferedSink::new(Box::new(files), cli.fallback_dir.clone()))
}

fn validate(cli: &Cli) -> Result<(), Box<dyn std::error::Error>> {
    for input in &cli.inputs {
        if !input.is_file() {
            return Err(format!("Input file not found: {}", input.display()).into());
        }
    }
    if let Some(config) = &cli.config {
        if !config.is_file() {
            return Err(format!("Config file not found: {}", config.display()).into());
        }
    }
    Ok(())
}

fn parse_polygon(text: &str) -> Result<Polygon, String> {
    let vertices = text
        .split(';')
        .filter(|pair| !pair.trim().is_empty())
        .map(|pair| {
            let coords: Vec<&str> = pair.split(',').map(str::trim).collect();
            match coords.as_slice() {
                [x, y] => {
                    let x = x.parse::<f64>().map_err(|e| format!("bad x in '{pair}': {e}"))?;
                    let y = y.parse::<f64>().map_err(|e| format!("bad y in '{pair}': {e}"))?;
                    Ok(Point::new(x, y))
                }
                _ => Err(format!("Expected 'x,y', got '{pair}'")),
            }
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Polygon::new(vertices))
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn video_id(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "video".to_string())
}

/// One id per input, derived from the file stem. Repeated stems get a
/// `-2`, `-3`, ... suffix so their outputs do not overwrite each other.
fn video_ids(inputs: &[PathBuf]) -> Vec<String> {
    let mut taken: HashSet<String> = HashSet::new();
    inputs
        .iter()
        .map(|input| {
            let stem = video_id(input);
            let mut id = stem.clone();
            let mut n = 2;
            while !taken.insert(id.clone()) {
                id = format!("{stem}-{n}");
                n += 1;
            }
            if id != stem {
                log::warn!("{} shares its name with another input; using id {id}", input.display());
            }
            id
        })
        .collect()
}
