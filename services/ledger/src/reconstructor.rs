//! Event reconstruction from segment logs.
//!
//! A batch run takes the exclusive datastore lock, reads every sealed and
//! unprocessed segment log, and replays them in window order. Each log is
//! ingested in its own transaction together with the flip of its processed
//! flag, so a log is either fully applied or not applied at all.

use crate::config::{ConfigValidationError, ReconstructConfig};
use crate::events::{add_unique, CodeDetection, EventRepository, EventStatus, PackingEvent};
use crate::segment_log::{BoundingBox, LogLine, SegmentHeader, SegmentLog, SegmentLogError, StationState};
use crate::store::{Datastore, LogRepository, StoreError};
use chrono::FixedOffset;
use rusqlite::Connection;
use serde::Serialize;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, instrument, trace, warn};

/// Errors that abort a reconstruction call.
#[derive(Debug, Error)]
pub enum ReconstructError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Log(#[from] SegmentLogError),

    #[error("Log discovery failed: {0}")]
    Discovery(String),
}

impl From<rusqlite::Error> for ReconstructError {
    fn from(e: rusqlite::Error) -> Self {
        ReconstructError::Store(StoreError::Sqlite(e))
    }
}

/// Settings a reconstruction run depends on, passed in explicitly.
#[derive(Debug, Clone)]
pub struct ReconstructContext {
    /// Minimum duration of a real packing event, in seconds.
    pub min_packing_time: f64,
    /// Offset applied to segment headers written without one.
    pub timezone: FixedOffset,
}

impl ReconstructContext {
    pub fn new(min_packing_time: f64, timezone: FixedOffset) -> Self {
        Self {
            min_packing_time,
            timezone,
        }
    }

    pub fn from_config(config: &ReconstructConfig) -> Result<Self, ConfigValidationError> {
        Ok(Self::new(config.min_packing_time_secs, config.timezone_offset()?))
    }
}

/// Outcome counters of a batch run.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub logs_processed: usize,
    pub logs_failed: usize,
    pub events_closed: usize,
    pub events_opened: usize,
    pub events_split: usize,
    pub events_retry: usize,
    pub events_deleted: usize,
    pub orphans_deleted: usize,
    pub detections_inserted: usize,
    /// Splits whose parts were stretched past the window's end.
    pub parts_overrun: usize,
}

impl BatchReport {
    fn absorb(&mut self, other: &BatchReport) {
        self.logs_processed += other.logs_processed;
        self.logs_failed += other.logs_failed;
        self.events_closed += other.events_closed;
        self.events_opened += other.events_opened;
        self.events_split += other.events_split;
        self.events_retry += other.events_retry;
        self.events_deleted += other.events_deleted;
        self.orphans_deleted += other.orphans_deleted;
        self.detections_inserted += other.detections_inserted;
        self.parts_overrun += other.parts_overrun;
    }
}

/// Replays segment logs into packing events.
pub struct Reconstructor {
    store: Arc<Datastore>,
    ctx: ReconstructContext,
}

impl Reconstructor {
    pub fn new(store: Arc<Datastore>, ctx: ReconstructContext) -> Self {
        Self { store, ctx }
    }

    pub fn context(&self) -> &ReconstructContext {
        &self.ctx
    }

    /// Ingest every pending segment log under one exclusive lock.
    #[instrument(skip(self))]
    pub fn run_batch(&self) -> Result<BatchReport, ReconstructError> {
        self.store.with_write(|conn| {
            let mut report = BatchReport::default();
            let pending = LogRepository::new(conn).pending()?;

            if pending.is_empty() {
                debug!("No pending segment logs");
                return Ok(report);
            }

            let mut logs = Vec::with_capacity(pending.len());
            for entry in pending {
                match SegmentLog::read(Path::new(&entry.log_file), self.ctx.timezone) {
                    Ok(log) => logs.push((entry.log_file, log)),
                    Err(e) => {
                        warn!(log_file = %entry.log_file, error = %e, "Skipping unreadable segment log");
                        LogRepository::new(conn).mark_failed(&entry.log_file, &e.to_string())?;
                        report.logs_failed += 1;
                    }
                }
            }

            logs.sort_by(|(a_file, a), (b_file, b)| {
                (a.header.start_time, a.header.start, a_file).cmp(&(
                    b.header.start_time,
                    b.header.start,
                    b_file,
                ))
            });

            for (log_file, log) in logs {
                let tx = conn.transaction()?;
                match ingest(&tx, &self.ctx, &log_file, &log) {
                    Ok(log_report) => {
                        LogRepository::new(&tx).mark_processed(&log_file)?;
                        tx.commit()?;
                        info!(
                            log_file = %log_file,
                            camera = %log.header.camera_name,
                            closed = log_report.events_closed,
                            opened = log_report.events_opened,
                            retry = log_report.events_retry,
                            deleted = log_report.events_deleted,
                            "Segment log ingested"
                        );
                        report.absorb(&log_report);
                        report.logs_processed += 1;
                    }
                    Err(e) => {
                        drop(tx);
                        error!(log_file = %log_file, error = %e, "Segment log ingestion failed, rolled back");
                        LogRepository::new(conn).mark_failed(&log_file, &e.to_string())?;
                        report.logs_failed += 1;
                    }
                }
            }

            info!(
                processed = report.logs_processed,
                failed = report.logs_failed,
                events_closed = report.events_closed,
                events_retry = report.events_retry,
                events_deleted = report.events_deleted,
                "Reconstruction batch complete"
            );

            Ok(report)
        })
    }

    /// Register segment logs found under `log_dir` that the datastore does
    /// not know yet. Returns how many were added.
    pub fn discover(&self, log_dir: &Path) -> Result<usize, ReconstructError> {
        let pattern = log_dir.join("**").join("*.log");
        let entries = glob::glob(&pattern.to_string_lossy())
            .map_err(|e| ReconstructError::Discovery(e.to_string()))?;

        let mut candidates: Vec<PathBuf> = Vec::new();
        for entry in entries {
            match entry {
                Ok(path) => candidates.push(path),
                Err(e) => warn!(error = %e, "Unreadable path during log discovery"),
            }
        }

        let timezone = self.ctx.timezone;
        self.store.with_write(|conn| {
            let logs = LogRepository::new(conn);
            let mut registered = 0;
            for path in &candidates {
                let id = log_identifier(path);
                if logs.get(&id)?.is_some() {
                    continue;
                }
                let camera = read_camera_name(path, timezone).unwrap_or_else(|| "unknown".to_string());
                if logs.register(&id, &camera, true)? {
                    debug!(log_file = %id, camera = %camera, "Discovered segment log");
                    registered += 1;
                }
            }
            info!(registered = registered, dir = %log_dir.display(), "Log discovery complete");
            Ok(registered)
        })
    }
}

/// Stable identifier for a log file: the canonical directory plus file name.
pub fn log_identifier(path: &Path) -> String {
    let canonical = match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => {
            let parent = if parent.as_os_str().is_empty() {
                Path::new(".")
            } else {
                parent
            };
            std::fs::canonicalize(parent)
                .map(|dir| dir.join(name))
                .unwrap_or_else(|_| path.to_path_buf())
        }
        _ => path.to_path_buf(),
    };
    canonical.to_string_lossy().into_owned()
}

fn read_camera_name(path: &Path, timezone: FixedOffset) -> Option<String> {
    let file = std::fs::File::open(path).ok()?;
    let mut first = String::new();
    BufReader::new(file).read_line(&mut first).ok()?;
    SegmentHeader::parse(&first, timezone).ok().map(|h| h.camera_name)
}

/// Replay one parsed log against the datastore.
fn ingest(
    conn: &Connection,
    ctx: &ReconstructContext,
    log_file: &str,
    log: &SegmentLog,
) -> Result<BatchReport, ReconstructError> {
    let repo = EventRepository::new(conn);
    let mut carried = Vec::new();
    let window = match repo.pending_for_camera(&log.header.camera_name)? {
        Some(event) => {
            carried = take_staged(&repo, &event)?;
            debug!(
                event_id = event.id,
                camera = %event.camera_name,
                ts = event.ts,
                staged = carried.len(),
                "Continuing pending event"
            );
            Window::Continuing(event)
        }
        None => Window::Idle,
    };

    let mut replay = Replay {
        ctx,
        repo,
        log_file,
        log,
        window,
        carried,
        prev: None,
        report: BatchReport::default(),
    };

    for line in log.state_lines() {
        replay.apply(line)?;
    }
    replay.finish()
}

/// Audit line placed on the wall clock.
#[derive(Debug, Clone)]
struct Evidence {
    at_ms: i64,
    success: bool,
    code: Option<String>,
    bbox: BoundingBox,
}

impl Evidence {
    fn from_line(line: &LogLine, header: &SegmentHeader) -> Option<Self> {
        match line {
            LogLine::Detection {
                second,
                success,
                code,
                bbox,
                ..
            } => Some(Self {
                at_ms: header.absolute_ms(*second as f64),
                success: *success,
                code: code.clone(),
                bbox: *bbox,
            }),
            _ => None,
        }
    }

    /// Whether this line is evidence for an event with the given codes.
    fn matches(&self, codes: &[String]) -> bool {
        match (self.success, &self.code) {
            (true, Some(code)) => codes.iter().any(|c| c == code),
            (true, None) => false,
            (false, _) => true,
        }
    }

    /// Seconds on the event's own video clock.
    fn second_on(&self, event: &PackingEvent) -> f64 {
        event.ts + (self.at_ms - event.packing_time_start) as f64 / 1000.0
    }
}

/// Load and remove the detections staged on a pending event.
///
/// A pending event holds every audit line seen since it opened, because its
/// final codes and parts are only known once it closes.
fn take_staged(repo: &EventRepository<'_>, event: &PackingEvent) -> Result<Vec<Evidence>, StoreError> {
    let staged = repo
        .detections_for_event(event.id)?
        .into_iter()
        .map(|d| Evidence {
            at_ms: event.packing_time_start + ((d.ts - event.ts) * 1000.0).round() as i64,
            success: d.success,
            code: (!d.code.is_empty()).then_some(d.code),
            bbox: d.bbox,
        })
        .collect();
    repo.clear_detections(event.id)?;
    Ok(staged)
}

/// Open packing window seen in the current log.
#[derive(Debug)]
struct OpenWindow {
    ts: i64,
    ts_inferred: bool,
    codes: Vec<String>,
}

#[derive(Debug)]
enum Window {
    Idle,
    /// A pending event from the datastore is being extended.
    Continuing(PackingEvent),
    Open(OpenWindow),
}

struct Replay<'a> {
    ctx: &'a ReconstructContext,
    repo: EventRepository<'a>,
    log_file: &'a str,
    log: &'a SegmentLog,
    window: Window,
    /// Evidence staged on the continued pending event by earlier logs.
    carried: Vec<Evidence>,
    prev: Option<StationState>,
    report: BatchReport,
}

impl<'a> Replay<'a> {
    fn apply(&mut self, line: &LogLine) -> Result<(), ReconstructError> {
        match line {
            LogLine::Ready { second, code } => {
                self.on_ready(*second, code.as_deref())?;
                self.prev = Some(StationState::Ready);
            }
            LogLine::Packing {
                second,
                code,
                inferred,
            } => {
                self.on_packing(*second, code.as_deref(), *inferred)?;
                self.prev = Some(StationState::Packing);
            }
            LogLine::Detection { .. } | LogLine::NoReading { .. } => {}
        }
        Ok(())
    }

    fn on_ready(&mut self, second: i64, code: Option<&str>) -> Result<(), ReconstructError> {
        match std::mem::replace(&mut self.window, Window::Idle) {
            Window::Continuing(mut event) => {
                if let Some(code) = code {
                    event.add_code(code);
                }
                let header = &self.log.header;
                event.te = Some(second as f64);
                event.packing_time_end = Some(header.absolute_ms(second as f64));
                self.finalize(event)
            }
            Window::Open(mut open) => {
                if let Some(code) = code {
                    add_unique(&mut open.codes, code);
                }
                let event = self.event_from_window(open, Some(second));
                self.finalize(event)
            }
            Window::Idle => {
                if code.is_some() {
                    debug!(
                        camera = %self.log.header.camera_name,
                        second = second,
                        "End marker without an open window"
                    );
                }
                Ok(())
            }
        }
    }

    fn on_packing(&mut self, second: i64, code: Option<&str>, inferred: bool) -> Result<(), ReconstructError> {
        match &mut self.window {
            Window::Continuing(event) => match code {
                Some(code) => {
                    event.add_code(code);
                }
                None if event.tracking_codes.is_empty()
                    && event.video_file != self.log.header.video_file =>
                {
                    warn!(
                        event_id = event.id,
                        camera = %event.camera_name,
                        video = %event.video_file,
                        "Deleting orphaned pending event"
                    );
                    self.repo.delete(event.id)?;
                    self.report.orphans_deleted += 1;
                    self.carried.clear();
                    self.window = Window::Idle;
                }
                None => {}
            },
            Window::Open(open) => {
                if let Some(code) = code {
                    add_unique(&mut open.codes, code);
                }
            }
            Window::Idle => {
                if self.prev == Some(StationState::Ready) {
                    self.window = Window::Open(OpenWindow {
                        ts: second,
                        ts_inferred: inferred,
                        codes: code.map(|c| vec![c.to_string()]).unwrap_or_default(),
                    });
                } else {
                    trace!(second = second, "Packing marker without preceding Ready");
                }
            }
        }
        Ok(())
    }

    fn event_from_window(&self, open: OpenWindow, te: Option<i64>) -> PackingEvent {
        let header = &self.log.header;
        PackingEvent {
            id: 0,
            camera_name: header.camera_name.clone(),
            ts: open.ts as f64,
            te: te.map(|s| s as f64),
            duration: None,
            tracking_codes: open.codes,
            video_file: header.video_file.clone(),
            packing_time_start: header.absolute_ms(open.ts as f64),
            packing_time_end: te.map(|s| header.absolute_ms(s as f64)),
            timezone: header.timezone(),
            retry_needed: false,
            retry_count: 0,
            status: if te.is_some() {
                EventStatus::Valid
            } else {
                EventStatus::Pending
            },
            ts_inferred: open.ts_inferred,
            log_file: self.log_file.to_string(),
        }
    }

    /// Split a closed event by code, persist the parts and classify each.
    fn finalize(&mut self, mut event: PackingEvent) -> Result<(), ReconstructError> {
        event.status = EventStatus::Valid;
        let evidence = self.evidence_since(event.packing_time_start);
        self.carried.clear();

        let parts = split_by_codes(&event, self.ctx.min_packing_time, &self.log.header);
        if parts.len() > 1 {
            debug!(
                camera = %event.camera_name,
                codes = parts.len(),
                "Splitting packing window by tracking code"
            );
            self.report.events_split += 1;
        }

        let end_ms = event.packing_time_end.unwrap_or(event.packing_time_start);
        if let Some(last_end) = parts.last().and_then(|p| p.packing_time_end) {
            if last_end > end_ms {
                warn!(
                    camera = %event.camera_name,
                    codes = parts.len(),
                    overrun_ms = last_end - end_ms,
                    "Split parts run past the end of the packing window"
                );
                self.report.parts_overrun += 1;
            }
        }

        for mut part in parts {
            if part.id == 0 {
                part.id = self.repo.insert(&part)?;
            } else {
                self.repo.update(&part)?;
            }
            self.report.events_closed += 1;
            self.check_anomalies(part, &evidence)?;
        }
        Ok(())
    }

    /// Carried evidence plus this log's audit lines from `from_ms` on.
    fn evidence_since(&self, from_ms: i64) -> Vec<Evidence> {
        let header = &self.log.header;
        self.carried
            .iter()
            .cloned()
            .chain(self.log.detections().filter_map(|line| Evidence::from_line(line, header)))
            .filter(|e| e.at_ms >= from_ms)
            .collect()
    }

    /// Stage evidence on a pending event until it closes.
    fn stage(&self, event: &PackingEvent) -> Result<(), ReconstructError> {
        for evidence in self.evidence_since(event.packing_time_start) {
            self.repo.insert_detection(&CodeDetection {
                id: 0,
                event_id: event.id,
                ts: evidence.second_on(event),
                code: evidence.code.clone().unwrap_or_default(),
                bbox: evidence.bbox,
                success: evidence.success,
            })?;
        }
        Ok(())
    }

    /// Attach audit evidence and classify events without any decoded code.
    ///
    /// Evidence is matched on the wall clock, so lines from any video or log
    /// the event spans land on the part they belong to.
    fn check_anomalies(&mut self, mut event: PackingEvent, evidence: &[Evidence]) -> Result<(), ReconstructError> {
        let start_ms = event.packing_time_start;
        let end_ms = event.packing_time_end.unwrap_or(start_ms);

        let mut successes = 0usize;
        for line in evidence {
            if line.at_ms < start_ms || line.at_ms > end_ms || !line.matches(&event.tracking_codes) {
                continue;
            }
            if line.success {
                successes += 1;
            }

            let at = line.second_on(&event);
            let inserted = self.repo.insert_detection(&CodeDetection {
                id: 0,
                event_id: event.id,
                ts: at,
                code: line.code.clone().unwrap_or_default(),
                bbox: line.bbox,
                success: line.success,
            })?;
            if inserted {
                self.report.detections_inserted += 1;
            } else {
                debug!(event_id = event.id, ts = at, "Duplicate detection skipped");
            }
        }

        if successes > 0 || !event.tracking_codes.is_empty() {
            return Ok(());
        }

        let duration = event.duration.unwrap_or(0.0);
        if duration >= self.ctx.min_packing_time {
            event.retry_needed = true;
            event.status = EventStatus::EmptyNeedRetry;
            self.repo.update(&event)?;
            self.report.events_retry += 1;
            info!(
                event_id = event.id,
                camera = %event.camera_name,
                duration = duration,
                "Event without tracking code flagged for retry"
            );
        } else {
            self.repo.delete(event.id)?;
            self.report.events_deleted += 1;
            debug!(
                camera = %event.camera_name,
                ts = event.ts,
                duration = duration,
                "Short event without tracking code deleted as noise"
            );
        }
        Ok(())
    }

    /// Persist whatever is still open when the log ends.
    fn finish(mut self) -> Result<BatchReport, ReconstructError> {
        match std::mem::replace(&mut self.window, Window::Idle) {
            Window::Open(open) => {
                let mut event = self.event_from_window(open, None);
                event.id = self.repo.insert(&event)?;
                self.stage(&event)?;
                self.report.events_opened += 1;
                debug!(event_id = event.id, camera = %event.camera_name, ts = event.ts, "Stored pending event");
            }
            Window::Continuing(event) => {
                self.repo.update(&event)?;
                self.stage(&event)?;
            }
            Window::Idle => {}
        }
        Ok(self.report)
    }
}

/// Divide a closed event into one consecutive part per tracking code.
///
/// Parts share the window equally but never drop below `min_packing_time`.
/// The first part keeps the event's id, so a continued pending row is
/// updated rather than duplicated.
fn split_by_codes(event: &PackingEvent, min_packing_time: f64, header: &SegmentHeader) -> Vec<PackingEvent> {
    let start_ms = event.packing_time_start;
    let end_ms = event.packing_time_end.unwrap_or(start_ms);
    let total_ms = end_ms - start_ms;

    if event.tracking_codes.len() <= 1 {
        let mut whole = event.clone();
        whole.duration = Some(total_ms as f64 / 1000.0);
        return vec![whole];
    }

    let count = event.tracking_codes.len() as i64;
    let part_ms = (total_ms / count).max((min_packing_time * 1000.0).round() as i64);
    let video_start_ms = header.video_start_ms();

    // Map a wall-clock instant back to (seconds, video) on whichever side of
    // the closing video's start it falls.
    let locate = |ms: i64| -> (f64, String) {
        if ms >= video_start_ms {
            (header.relative_second(ms), header.video_file.clone())
        } else {
            (
                event.ts + (ms - start_ms) as f64 / 1000.0,
                event.video_file.clone(),
            )
        }
    };

    event
        .tracking_codes
        .iter()
        .enumerate()
        .map(|(i, code)| {
            let part_start = start_ms + i as i64 * part_ms;
            let part_end = if i as i64 == count - 1 {
                (part_start + part_ms).max(end_ms)
            } else {
                part_start + part_ms
            };

            let mut part = event.clone();
            if i > 0 {
                part.id = 0;
                part.ts_inferred = false;
                part.retry_count = 0;
            }
            let (ts, video_file) = locate(part_start);
            part.ts = ts;
            part.video_file = video_file;
            part.te = Some(locate(part_end).0);
            part.tracking_codes = vec![code.clone()];
            part.packing_time_start = part_start;
            part.packing_time_end = Some(part_end);
            part.duration = Some((part_end - part_start) as f64 / 1000.0);
            part
        })
        .collect()
}
