//! Video job queue and per-camera worker threads.
//!
//! Every camera gets its own worker thread and priority queue. Scans are
//! serialized through one shared lock, so at most one video is being analyzed
//! at any time no matter how many cameras are configured.

use crate::config::{CameraConfig, PresenceSource};
use crate::extractors::{CodeDecoder, ExtractorError, MotionPresence, PresenceDetector, SidecarReadings};
use crate::frame_scanner::{FrameScanner, ScanError, ScanStats, ScanTarget};
use crate::video_source::{FrameSource, GstVideoSource, VideoError};
use chrono::{DateTime, FixedOffset, Utc};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// How long an idle worker sleeps before re-checking the running flag.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// A video waiting to be scanned.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoJob {
    pub path: PathBuf,
    pub camera: String,
    /// Lower values are served first.
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    /// Wall-clock start of the recording, when known.
    pub recorded_at: Option<DateTime<FixedOffset>>,
}

impl VideoJob {
    pub fn new(path: impl Into<PathBuf>, camera: impl Into<String>, priority: i32) -> Self {
        Self {
            path: path.into(),
            camera: camera.into(),
            priority,
            created_at: Utc::now(),
            recorded_at: None,
        }
    }

    pub fn with_recorded_at(mut self, recorded_at: DateTime<FixedOffset>) -> Self {
        self.recorded_at = Some(recorded_at);
        self
    }
}

struct QueuedJob {
    seq: u64,
    job: VideoJob,
}

impl QueuedJob {
    fn key(&self) -> (i32, DateTime<Utc>, u64) {
        (self.job.priority, self.job.created_at, self.seq)
    }
}

impl PartialEq for QueuedJob {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for QueuedJob {}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedJob {
    // BinaryHeap pops the greatest element; the smallest key must win.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other.key().cmp(&self.key())
    }
}

#[derive(Default)]
struct QueueState {
    heap: BinaryHeap<QueuedJob>,
    next_seq: u64,
    closed: bool,
}

/// Blocking priority queue of video jobs.
#[derive(Default)]
pub struct JobQueue {
    state: Mutex<QueueState>,
    available: Condvar,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a job. Returns `false` once the queue is closed.
    pub fn push(&self, job: VideoJob) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.heap.push(QueuedJob { seq, job });
        drop(state);
        self.available.notify_one();
        true
    }

    /// Take the next job, waiting up to `timeout` for one to arrive.
    pub fn pop(&self, timeout: Duration) -> Option<VideoJob> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if let Some(queued) = state.heap.pop() {
                return Some(queued.job);
            }
            if state.closed {
                return None;
            }
            if self.available.wait_until(&mut state, deadline).timed_out() {
                return state.heap.pop().map(|queued| queued.job);
            }
        }
    }

    /// Refuse new jobs. Queued jobs can still be taken.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.available.notify_all();
    }

    /// Closed and empty: nothing will ever be returned again.
    pub fn is_drained(&self) -> bool {
        let state = self.state.lock();
        state.closed && state.heap.is_empty()
    }

    pub fn len(&self) -> usize {
        self.state.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Extractor pair used for one video.
pub type Extractors = (Box<dyn CodeDecoder>, Box<dyn PresenceDetector>);

/// Builds the decoding pipeline for a job.
pub trait PipelineFactory: Send + Sync {
    fn open_source(&self, job: &VideoJob) -> Result<Box<dyn FrameSource>, VideoError>;

    fn build_extractors(&self, job: &VideoJob, camera: &CameraConfig) -> Result<Extractors, ExtractorError>;
}

/// GStreamer decoding with extractors chosen from the camera configuration.
#[derive(Debug, Clone)]
pub struct GstPipelineFactory {
    sampling_fps: f64,
}

impl GstPipelineFactory {
    pub fn new(sampling_fps: f64) -> Self {
        Self { sampling_fps }
    }
}

impl PipelineFactory for GstPipelineFactory {
    fn open_source(&self, job: &VideoJob) -> Result<Box<dyn FrameSource>, VideoError> {
        Ok(Box::new(GstVideoSource::open(&job.path, self.sampling_fps)?))
    }

    fn build_extractors(&self, job: &VideoJob, camera: &CameraConfig) -> Result<Extractors, ExtractorError> {
        let readings = match &camera.readings_dir {
            Some(dir) => SidecarReadings::for_video(dir, &job.path)?,
            None => SidecarReadings::empty(),
        };
        let presence: Box<dyn PresenceDetector> = match camera.presence {
            PresenceSource::Sidecar => Box::new(readings.clone()),
            PresenceSource::Motion => Box::new(MotionPresence::new(camera.presence_motion_threshold)),
        };
        Ok((Box::new(readings), presence))
    }
}

/// How a job ended.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed(ScanStats),
    Errored(String),
}

#[derive(Debug, Clone)]
pub struct JobReport {
    pub job: VideoJob,
    pub outcome: JobOutcome,
}

struct Worker {
    queue: Arc<JobQueue>,
    handle: JoinHandle<()>,
}

/// State shared by all worker threads.
struct Shared {
    scanner: Arc<FrameScanner>,
    factory: Arc<dyn PipelineFactory>,
    running: Arc<AtomicBool>,
    scan_lock: Mutex<()>,
    reports: Sender<JobReport>,
}

/// One worker thread per camera.
pub struct WorkerPool {
    workers: HashMap<String, Worker>,
    reports: Receiver<JobReport>,
}

impl WorkerPool {
    /// Start a worker for every camera. Workers stop taking new jobs once
    /// `running` is cleared.
    pub fn spawn(
        scanner: Arc<FrameScanner>,
        cameras: &[CameraConfig],
        factory: Arc<dyn PipelineFactory>,
        running: Arc<AtomicBool>,
    ) -> std::io::Result<Self> {
        let (tx, rx) = unbounded();
        let shared = Arc::new(Shared {
            scanner,
            factory,
            running,
            scan_lock: Mutex::new(()),
            reports: tx,
        });

        let mut workers = HashMap::new();
        for camera in cameras {
            let queue = Arc::new(JobQueue::new());
            let handle = std::thread::Builder::new().name(format!("scan-{}", camera.name)).spawn({
                let camera = camera.clone();
                let queue = queue.clone();
                let shared = shared.clone();
                move || run_worker(camera, queue, shared)
            })?;
            workers.insert(camera.name.clone(), Worker { queue, handle });
        }

        info!(workers = workers.len(), "Worker pool started");
        Ok(Self { workers, reports: rx })
    }

    /// Queue a video on its camera's worker.
    pub fn submit(&self, job: VideoJob) -> Result<(), ScanError> {
        let worker = self
            .workers
            .get(&job.camera)
            .ok_or_else(|| ScanError::UnknownCamera(job.camera.clone()))?;
        let camera = job.camera.clone();
        debug!(camera = %camera, video = %job.path.display(), priority = job.priority, "Job queued");
        if !worker.queue.push(job) {
            return Err(ScanError::QueueClosed(camera));
        }
        Ok(())
    }

    /// Stop accepting jobs. Workers exit once their queues are drained.
    pub fn close(&self) {
        for worker in self.workers.values() {
            worker.queue.close();
        }
    }

    pub fn is_finished(&self) -> bool {
        self.workers.values().all(|w| w.handle.is_finished())
    }

    /// Wait for the workers and collect the reports of every job they ran.
    ///
    /// With a deadline, workers still busy when it passes are left running and
    /// their number is returned alongside the reports.
    pub fn join(self, deadline: Option<Instant>) -> (Vec<JobReport>, usize) {
        let mut stragglers = 0;
        for (camera, worker) in self.workers {
            if let Some(deadline) = deadline {
                while !worker.handle.is_finished() && Instant::now() < deadline {
                    std::thread::sleep(Duration::from_millis(50));
                }
                if !worker.handle.is_finished() {
                    warn!(camera = %camera, "Worker still busy after grace period");
                    stragglers += 1;
                    continue;
                }
            }
            if worker.handle.join().is_err() {
                error!(camera = %camera, "Worker thread panicked");
            }
        }
        (self.reports.try_iter().collect(), stragglers)
    }
}

fn run_worker(camera: CameraConfig, queue: Arc<JobQueue>, shared: Arc<Shared>) {
    debug!(camera = %camera.name, "Worker started");

    while shared.running.load(Ordering::SeqCst) {
        let Some(job) = queue.pop(POLL_INTERVAL) else {
            if queue.is_drained() {
                break;
            }
            continue;
        };

        let outcome = {
            let _scan = shared.scan_lock.lock();
            if !shared.running.load(Ordering::SeqCst) {
                warn!(camera = %camera.name, video = %job.path.display(), "Shutting down, job not started");
                break;
            }
            match scan_job(&job, &camera, &shared) {
                Ok(stats) => JobOutcome::Completed(stats),
                Err(e) => {
                    error!(
                        camera = %camera.name,
                        video = %job.path.display(),
                        error = %e,
                        "Video scan failed"
                    );
                    JobOutcome::Errored(e.to_string())
                }
            }
        };

        if shared.reports.send(JobReport { job, outcome }).is_err() {
            debug!("Report receiver dropped");
        }
    }

    let left = queue.len();
    if left > 0 {
        warn!(camera = %camera.name, jobs = left, "Worker stopped with jobs still queued");
    }
    debug!(camera = %camera.name, "Worker stopped");
}

fn scan_job(job: &VideoJob, camera: &CameraConfig, shared: &Shared) -> Result<ScanStats, ScanError> {
    let mut source = shared.factory.open_source(job)?;
    let (mut decoder, mut presence) = shared.factory.build_extractors(job, camera)?;
    let target = ScanTarget {
        video: &job.path,
        camera,
        recorded_at: job.recorded_at,
    };
    shared
        .scanner
        .scan(&target, source.as_mut(), decoder.as_mut(), presence.as_mut())
}
