use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::Utc;
use crossbeam_channel::{Receiver, Sender};
use thiserror::Error;

use crate::compliance::domain::records::LedgerSnapshot;
use crate::persistence::domain::persistence_sink::PersistenceSink;
use crate::pipeline::job::{
    JobDescriptor, JobEvent, JobId, JobInfo, JobRecord, JobState, JobStatus, Progress,
};
use crate::pipeline::pipeline_logger::LogPipelineLogger;
use crate::pipeline::process_video_use_case::{ProcessVideoUseCase, RunOutcome};
use crate::shared::engine_config::EngineConfig;
use crate::shared::sync::lock;

/// Upper bound on how long an idle worker sleeps before rechecking shutdown.
const IDLE_WAIT: Duration = Duration::from_millis(100);

#[derive(Error, Debug, PartialEq, Eq)]
pub enum OrchestratorError {
    #[error("unknown job {0}")]
    UnknownJob(JobId),
    #[error("job {0} has not finished")]
    NotFinished(JobId),
    #[error("orchestrator is shutting down")]
    ShuttingDown,
}

struct QueuedJob {
    job_id: JobId,
    descriptor: JobDescriptor,
}

/// State shared between callers and the worker thread.
///
/// `jobs` and `queue` are never locked at the same time.
struct Shared {
    jobs: Mutex<HashMap<JobId, JobRecord>>,
    queue: Mutex<VecDeque<QueuedJob>>,
    wake: Condvar,
    shutdown: AtomicBool,
    next_id: AtomicU64,
    subscribers: Mutex<Vec<Sender<JobEvent>>>,
    sink: Arc<dyn PersistenceSink>,
    config: EngineConfig,
}

impl Shared {
    fn emit(&self, event: JobEvent) {
        lock(&self.subscribers).retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn update<R>(&self, job_id: JobId, f: impl FnOnce(&mut JobRecord) -> R) -> Option<R> {
        lock(&self.jobs).get_mut(&job_id).map(f)
    }
}

/// FIFO job queue with a single background worker.
///
/// Each job gets a fresh engine and ledger. The worker starts on the first
/// enqueue and processes one job at a time; callers observe progress
/// through `get_status`, `snapshot` or `subscribe`.
pub struct JobOrchestrator {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl JobOrchestrator {
    pub fn new(config: EngineConfig, sink: Arc<dyn PersistenceSink>) -> Self {
        Self {
            shared: Arc::new(Shared {
                jobs: Mutex::new(HashMap::new()),
                queue: Mutex::new(VecDeque::new()),
                wake: Condvar::new(),
                shutdown: AtomicBool::new(false),
                next_id: AtomicU64::new(1),
                subscribers: Mutex::new(Vec::new()),
                sink,
                config,
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn enqueue(&self, descriptor: JobDescriptor) -> Result<JobId, OrchestratorError> {
        if self.shared.shutdown.load(Ordering::Relaxed) {
            return Err(OrchestratorError::ShuttingDown);
        }
        let job_id = JobId(self.shared.next_id.fetch_add(1, Ordering::Relaxed));
        log::info!("Queued {job_id} ({})", descriptor.file_name);

        lock(&self.shared.jobs).insert(job_id, JobRecord::new(job_id, &descriptor));
        lock(&self.shared.queue).push_back(QueuedJob { job_id, descriptor });
        self.shared.wake.notify_one();

        self.ensure_worker();
        Ok(job_id)
    }

    pub fn get_status(&self, job_id: JobId) -> Option<JobStatus> {
        let status = {
            let jobs = lock(&self.shared.jobs);
            let record = jobs.get(&job_id)?;
            match record.info.state {
                JobState::Queued => None,
                JobState::Processing => Some(JobStatus::Processing {
                    progress: record.info.progress,
                }),
                JobState::Completed => Some(JobStatus::Completed {
                    result: record.snapshot.clone(),
                }),
                JobState::Failed => Some(JobStatus::Failed {
                    error: record.info.error.clone().unwrap_or_default(),
                }),
                JobState::Cancelled => Some(JobStatus::Cancelled),
            }
        };
        if status.is_some() {
            return status;
        }

        // Popped by the worker but not yet marked processing: next in line.
        let position = lock(&self.shared.queue)
            .iter()
            .position(|q| q.job_id == job_id)
            .unwrap_or(0);
        Some(JobStatus::Queued { position })
    }

    pub fn job(&self, job_id: JobId) -> Option<JobInfo> {
        lock(&self.shared.jobs).get(&job_id).map(|r| r.info.clone())
    }

    /// All known jobs, oldest first.
    pub fn jobs(&self) -> Vec<JobInfo> {
        let mut infos: Vec<JobInfo> = lock(&self.shared.jobs)
            .values()
            .map(|r| r.info.clone())
            .collect();
        infos.sort_by_key(|i| i.job_id);
        infos
    }

    /// Latest ledger snapshot for a running or finished job.
    pub fn snapshot(&self, job_id: JobId) -> Option<LedgerSnapshot> {
        lock(&self.shared.jobs)
            .get(&job_id)
            .map(|r| r.snapshot.clone())
    }

    /// Requests cancellation and returns immediately.
    ///
    /// A queued job is dropped from the queue and marked cancelled at once;
    /// a running job stops before its next frame.
    pub fn cancel(&self, job_id: JobId) -> Result<(), OrchestratorError> {
        let state = self
            .shared
            .update(job_id, |r| {
                r.cancel.store(true, Ordering::Relaxed);
                r.info.state
            })
            .ok_or(OrchestratorError::UnknownJob(job_id))?;
        if state != JobState::Queued {
            return Ok(());
        }

        let removed = {
            let mut queue = lock(&self.shared.queue);
            let index = queue.iter().position(|q| q.job_id == job_id);
            index.and_then(|i| queue.remove(i))
        };
        if removed.is_some() {
            self.shared
                .update(job_id, |r| r.finish(JobState::Cancelled, None));
            log::info!("Cancelled queued {job_id}");
            self.shared.emit(JobEvent::Finished {
                job_id,
                state: JobState::Cancelled,
            });
        }
        Ok(())
    }

    /// Removes one finished job from the table.
    pub fn remove(&self, job_id: JobId) -> Result<(), OrchestratorError> {
        let mut jobs = lock(&self.shared.jobs);
        let state = jobs
            .get(&job_id)
            .map(|r| r.info.state)
            .ok_or(OrchestratorError::UnknownJob(job_id))?;
        if !state.is_terminal() {
            return Err(OrchestratorError::NotFinished(job_id));
        }
        jobs.remove(&job_id);
        Ok(())
    }

    /// Drops finished jobs older than `max_age`. Returns how many were removed.
    pub fn cleanup(&self, max_age: chrono::Duration) -> usize {
        let cutoff = Utc::now() - max_age;
        let mut jobs = lock(&self.shared.jobs);
        let before = jobs.len();
        jobs.retain(|_, r| {
            !(r.info.state.is_terminal() && r.info.finished_at.is_some_and(|t| t <= cutoff))
        });
        let removed = before - jobs.len();
        if removed > 0 {
            log::info!("Cleaned up {removed} finished jobs");
        }
        removed
    }

    pub fn subscribe(&self) -> Receiver<JobEvent> {
        let (tx, rx) = crossbeam_channel::unbounded();
        lock(&self.shared.subscribers).push(tx);
        rx
    }

    /// Starts a worker if none is running, e.g. after `shutdown`.
    pub fn restart_worker(&self) {
        self.shared.shutdown.store(false, Ordering::Relaxed);
        self.ensure_worker();
    }

    pub fn is_worker_running(&self) -> bool {
        lock(&self.worker)
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Stops the worker after its current frame. The running job ends as
    /// cancelled; queued jobs stay queued.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Relaxed);
        for record in lock(&self.shared.jobs).values() {
            if record.info.state == JobState::Processing {
                record.cancel.store(true, Ordering::Relaxed);
            }
        }
        self.shared.wake.notify_all();

        if let Some(handle) = lock(&self.worker).take() {
            if handle.join().is_err() {
                log::error!("Worker thread panicked");
            }
        }
    }

    fn ensure_worker(&self) {
        let mut worker = lock(&self.worker);
        if worker.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let shared = self.shared.clone();
        *worker = Some(thread::spawn(move || worker_loop(&shared)));
    }
}

impl Drop for JobOrchestrator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: &Arc<Shared>) {
    log::debug!("Worker started");
    while let Some(job) = next_job(shared) {
        run_job(shared, job);
    }
    log::debug!("Worker stopped");
}

fn next_job(shared: &Shared) -> Option<QueuedJob> {
    let mut queue = lock(&shared.queue);
    loop {
        if shared.shutdown.load(Ordering::Relaxed) {
            return None;
        }
        if let Some(job) = queue.pop_front() {
            return Some(job);
        }
        let (guard, _) = shared
            .wake
            .wait_timeout(queue, IDLE_WAIT)
            .unwrap_or_else(PoisonError::into_inner);
        queue = guard;
    }
}

fn run_job(shared: &Arc<Shared>, job: QueuedJob) {
    let QueuedJob { job_id, descriptor } = job;

    // Checked under the job lock so a concurrent `shutdown` either sees this
    // job as processing or has already raised the flag read here.
    let Some(cancel) = shared.update(job_id, |r| {
        r.info.state = JobState::Processing;
        r.info.started_at = Some(Utc::now());
        if shared.shutdown.load(Ordering::Relaxed) {
            r.cancel.store(true, Ordering::Relaxed);
        }
        r.cancel.clone()
    }) else {
        log::warn!("{job_id} vanished before it started");
        return;
    };
    log::info!("Processing {job_id} ({})", descriptor.file_name);
    shared.emit(JobEvent::Started { job_id });

    let progress_shared = shared.clone();
    let last_percent = AtomicUsize::new(usize::MAX);
    let on_progress = Box::new(move |processed: usize, total: usize| {
        let progress = Progress { processed, total };
        progress_shared.update(job_id, |r| r.info.progress = progress);
        let percent = (progress.fraction() * 100.0) as usize;
        if last_percent.swap(percent, Ordering::Relaxed) != percent {
            progress_shared.emit(JobEvent::Progress { job_id, progress });
        }
        true
    });
    let snapshot_shared = shared.clone();
    let on_snapshot = Box::new(move |snapshot: &LedgerSnapshot| {
        snapshot_shared.update(job_id, |r| r.snapshot = snapshot.clone());
    });

    let video_id = descriptor.video_id.clone();
    let mut use_case = ProcessVideoUseCase::new(
        descriptor.source,
        shared.sink.clone(),
        shared.config.clone(),
        descriptor.video_id,
        descriptor.recorded_at,
    )
    .with_logger(Box::new(LogPipelineLogger::new(
        job_id.to_string(),
        shared.config.progress_log_interval,
    )))
    .with_progress(on_progress)
    .with_snapshot_listener(on_snapshot)
    .with_cancellation(cancel);

    let result = panic::catch_unwind(AssertUnwindSafe(|| use_case.execute()));

    let (state, snapshot, error) = match result {
        Ok(Ok(report)) => {
            let state = match report.outcome {
                RunOutcome::Completed => JobState::Completed,
                RunOutcome::Cancelled => JobState::Cancelled,
            };
            (state, Some(report.snapshot), None)
        }
        Ok(Err(failure)) => (
            JobState::Failed,
            Some(failure.snapshot),
            Some(failure.error.to_string()),
        ),
        Err(_) => {
            salvage_snapshot(shared, job_id, &video_id);
            (JobState::Failed, None, Some("worker panicked".to_string()))
        }
    };

    match &error {
        Some(e) => log::error!("{job_id} failed: {e}"),
        None => log::info!("{job_id} {state}"),
    }
    shared.update(job_id, |r| {
        if let Some(snapshot) = snapshot {
            r.snapshot = snapshot;
        }
        r.finish(state, error);
    });
    shared.emit(JobEvent::Finished { job_id, state });
}

/// Persists the last snapshot a panicked job published, so frames processed
/// before the panic are not lost.
fn salvage_snapshot(shared: &Shared, job_id: JobId, video_id: &str) {
    let Some(snapshot) = shared.update(job_id, |r| r.snapshot.clone()) else {
        return;
    };
    if snapshot.is_empty() {
        return;
    }
    let result = shared
        .sink
        .upsert_tracks(video_id, &snapshot.tracks)
        .and_then(|()| shared.sink.upsert_counts(video_id, &snapshot.vehicle_counts));
    match result {
        Ok(()) => log::info!(
            "{job_id}: saved {} tracks after panic",
            snapshot.tracks.len()
        ),
        Err(e) => log::error!("{job_id}: final save after panic failed: {e}"),
    }
}
