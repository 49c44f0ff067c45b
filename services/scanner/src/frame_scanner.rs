//! Frame scanning: one video in, segment logs out.
//!
//! Frames are decoded in order and every Nth one is analyzed. Each analyzed
//! frame gets motion, presence and code signals; the [`PackingTracker`] turns
//! those into Ready/Packing markers, and every code reading is also written as
//! an audit line. Output is split into segment logs aligned to fixed
//! wall-clock windows. Each log is registered unsealed when opened and sealed
//! once the writer has flushed it.

use crate::config::{CameraConfig, LogLayout, ScanSettings};
use crate::extractors::{
    CodeDecoder, CodeReading, ExtractorError, FrameContext, MotionEstimator, PresenceDetector, RoiImage,
};
use crate::segment_writer::{SegmentWriter, WriterError};
use crate::tracker::{FrameSignals, PackingTracker, TrackerSettings};
use crate::video_source::{FrameSource, VideoError};
use chrono::{DateTime, Duration as ChronoDuration, FixedOffset, TimeZone, Utc};
use packtrace_ledger::{log_identifier, Datastore, LogLine, LogRepository, SegmentHeader, StationState, StoreError};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, instrument, trace, warn};

/// Errors that abort the scan of one video.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error(transparent)]
    Video(#[from] VideoError),

    #[error(transparent)]
    Extractor(#[from] ExtractorError),

    #[error(transparent)]
    Writer(#[from] WriterError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Cannot determine start time of {path}: {source}")]
    VideoTime {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Unknown camera: {0}")]
    UnknownCamera(String),

    #[error("Job queue for camera {0} is closed")]
    QueueClosed(String),
}

/// Running statistics for one scanned video.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ScanStats {
    pub frames_decoded: u64,
    pub frames_analyzed: u64,
    pub frames_skipped_roi: u64,
    pub extractor_errors: u64,
    pub detections_logged: u64,
    /// Frames logged with no code reading at all.
    pub frames_audited: u64,
    pub markers_emitted: u64,
    pub segments_written: u64,
    pub elapsed: Duration,
}

/// One video to scan.
#[derive(Debug, Clone)]
pub struct ScanTarget<'a> {
    pub video: &'a Path,
    pub camera: &'a CameraConfig,
    /// Wall-clock start of the recording; the file modification time is used
    /// when absent.
    pub recorded_at: Option<DateTime<FixedOffset>>,
}

struct OpenSegment {
    path: PathBuf,
    log_id: String,
    window: i64,
}

/// Drives decoding, extraction and marker detection for one video at a time.
pub struct FrameScanner {
    settings: ScanSettings,
    store: Arc<Datastore>,
    writer: Arc<SegmentWriter>,
}

impl FrameScanner {
    pub fn new(settings: ScanSettings, store: Arc<Datastore>, writer: Arc<SegmentWriter>) -> Self {
        Self {
            settings,
            store,
            writer,
        }
    }

    pub fn settings(&self) -> &ScanSettings {
        &self.settings
    }

    /// Scan a whole video into segment logs.
    #[instrument(skip_all, fields(camera = %target.camera.name, video = %target.video.display()))]
    pub fn scan(
        &self,
        target: &ScanTarget<'_>,
        source: &mut dyn FrameSource,
        decoder: &mut dyn CodeDecoder,
        presence: &mut dyn PresenceDetector,
    ) -> Result<ScanStats, ScanError> {
        let started = Instant::now();
        let camera = target.camera;
        let video_start = video_start(target, self.settings.timezone)?;

        info!(
            camera = %camera.name,
            video = %target.video.display(),
            video_start = %video_start,
            fps = source.fps(),
            frame_interval = self.settings.frame_interval,
            "Scanning video"
        );

        let mut tracker = PackingTracker::new(TrackerSettings {
            min_packing_time: self.settings.min_packing_time,
            motion_threshold: self.settings.motion_threshold,
            min_stable_duration: self.settings.min_stable_duration,
        });
        let mut motion = MotionEstimator::new();
        let mut stats = ScanStats::default();
        let mut segment: Option<OpenSegment> = None;
        let mut last_second: Option<f64> = None;

        let result = (|| -> Result<(), ScanError> {
            while let Some(frame) = source.next_frame()? {
                stats.frames_decoded += 1;
                if frame.index % self.settings.frame_interval != 0 {
                    continue;
                }
                let second = frame.second.max(0.0);

                let window = self.window_of(&video_start, second);
                if segment.as_ref().map(|s| s.window) != Some(window) {
                    if let Some(done) = segment.take() {
                        self.seal_segment(done, &mut stats)?;
                    }
                    let (opened, header) = self.open_segment(target, &video_start, window)?;
                    tracker.set_window_start(header.start as f64);
                    segment = Some(opened);
                }
                let Some(current) = segment.as_ref() else {
                    continue;
                };

                let Some(packing) = RoiImage::crop(&frame, &camera.packing_roi) else {
                    if stats.frames_skipped_roi == 0 {
                        warn!(
                            camera = %camera.name,
                            width = frame.width,
                            height = frame.height,
                            "Packing area is empty for this frame size, skipping frames"
                        );
                    }
                    stats.frames_skipped_roi += 1;
                    continue;
                };
                let trigger = camera.trigger_roi.as_ref().and_then(|roi| RoiImage::crop(&frame, roi));
                stats.frames_analyzed += 1;

                let motion_value = motion.estimate(&packing);
                let packing_ctx = FrameContext {
                    index: frame.index,
                    second,
                    image: &packing,
                };
                let hand = match presence.detect(&packing_ctx) {
                    Ok(p) => p.visible,
                    Err(e) => {
                        stats.extractor_errors += 1;
                        warn!(frame = frame.index, error = %e, "Presence detection failed");
                        false
                    }
                };

                let code_ctx = FrameContext {
                    image: trigger.as_ref().unwrap_or(&packing),
                    ..packing_ctx
                };
                let readings = match decoder.decode(&code_ctx) {
                    Ok(r) => r,
                    Err(e) => {
                        stats.extractor_errors += 1;
                        warn!(frame = frame.index, error = %e, "Code decoding failed");
                        Vec::new()
                    }
                };
                let readings: Vec<CodeReading> = readings
                    .into_iter()
                    .filter(|r| !matches!(r, CodeReading::Decoded { text, .. } if *text == self.settings.idle_code))
                    .collect();
                let code = readings.iter().find_map(|r| match r {
                    CodeReading::Decoded { text, .. } => Some(text.clone()),
                    CodeReading::Boundary { .. } => None,
                });

                trace!(
                    second = second,
                    motion = motion_value,
                    hand = hand,
                    code = ?code,
                    "Frame analyzed"
                );

                let markers = tracker.push(FrameSignals {
                    second,
                    motion: motion_value,
                    hand,
                    code,
                });
                for marker in &markers {
                    self.writer.append(&current.path, marker)?;
                }
                stats.markers_emitted += markers.len() as u64;

                let state = if tracker.is_busy() {
                    StationState::Packing
                } else {
                    StationState::Ready
                };
                let at = second.floor() as i64;
                if readings.is_empty() && self.settings.audit_empty_frames {
                    self.writer
                        .append(&current.path, &LogLine::NoReading { second: at, state })?;
                    stats.frames_audited += 1;
                }
                for reading in readings {
                    let line = match reading {
                        CodeReading::Decoded { text, bbox } => LogLine::Detection {
                            second: at,
                            state,
                            success: true,
                            code: Some(text),
                            bbox,
                        },
                        CodeReading::Boundary { bbox } => LogLine::Detection {
                            second: at,
                            state,
                            success: false,
                            code: None,
                            bbox,
                        },
                    };
                    self.writer.append(&current.path, &line)?;
                    stats.detections_logged += 1;
                }

                last_second = Some(second);
            }

            if let (Some(last), Some(current)) = (last_second, segment.as_ref()) {
                let markers = tracker.finish(last);
                for marker in &markers {
                    self.writer.append(&current.path, marker)?;
                }
                stats.markers_emitted += markers.len() as u64;
            }
            Ok(())
        })();

        // Seal what was written even when decoding failed part way.
        if let Some(done) = segment.take() {
            self.seal_segment(done, &mut stats)?;
        }
        result?;

        stats.elapsed = started.elapsed();
        info!(
            camera = %camera.name,
            video = %target.video.display(),
            frames_decoded = stats.frames_decoded,
            frames_analyzed = stats.frames_analyzed,
            frames_skipped_roi = stats.frames_skipped_roi,
            extractor_errors = stats.extractor_errors,
            detections = stats.detections_logged,
            frames_audited = stats.frames_audited,
            markers = stats.markers_emitted,
            segments = stats.segments_written,
            elapsed_ms = stats.elapsed.as_millis() as u64,
            "Video scanned"
        );

        Ok(stats)
    }

    /// Index of the wall-clock window a video second falls into.
    fn window_of(&self, video_start: &DateTime<FixedOffset>, second: f64) -> i64 {
        let wall = video_start.timestamp() + second.floor() as i64;
        wall.div_euclid(self.settings.segment_secs)
    }

    fn open_segment(
        &self,
        target: &ScanTarget<'_>,
        video_start: &DateTime<FixedOffset>,
        window: i64,
    ) -> Result<(OpenSegment, SegmentHeader), ScanError> {
        let window_start = window * self.settings.segment_secs;
        let video_epoch = video_start.timestamp();
        let start = (window_start - video_epoch).max(0);
        let end = window_start + self.settings.segment_secs - video_epoch;

        let header = SegmentHeader {
            start,
            end,
            start_time: *video_start + ChronoDuration::seconds(start),
            camera_name: target.camera.name.clone(),
            video_file: target.video.to_string_lossy().into_owned(),
        };
        let path = segment_path(&self.settings, &target.camera.name, &header.start_time);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| WriterError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let log_id = log_identifier(&path);

        let registered = self.store.with_write(|conn| {
            LogRepository::new(conn).register(&log_id, &target.camera.name, false)
        })?;
        if !registered {
            warn!(
                log_file = %log_id,
                "Segment log already registered, its new contents will not be replayed"
            );
        }

        self.writer.open(&path, header.clone())?;
        debug!(
            log_file = %log_id,
            start = header.start,
            end = header.end,
            "Segment log opened"
        );

        Ok((OpenSegment { path, log_id, window }, header))
    }

    fn seal_segment(&self, segment: OpenSegment, stats: &mut ScanStats) -> Result<(), ScanError> {
        self.writer.seal(&segment.path)?;
        self.store
            .with_write(|conn| LogRepository::new(conn).mark_sealed(&segment.log_id))?;
        stats.segments_written += 1;
        debug!(log_file = %segment.log_id, "Segment log sealed");
        Ok(())
    }
}

/// `<log_dir>/<camera>/<camera>_<stamp>.log` or `<log_dir>/custom/<camera>_<stamp>.log`.
pub fn segment_path(settings: &ScanSettings, camera: &str, start_time: &DateTime<FixedOffset>) -> PathBuf {
    let dir = match settings.layout {
        LogLayout::PerCamera => settings.log_dir.join(camera),
        LogLayout::Flat => settings.log_dir.join("custom"),
    };
    dir.join(format!("{}_{}.log", camera, start_time.format("%Y%m%d_%H%M%S")))
}

/// Wall-clock start of a video, truncated to whole seconds.
fn video_start(target: &ScanTarget<'_>, timezone: FixedOffset) -> Result<DateTime<FixedOffset>, ScanError> {
    let start = match target.recorded_at {
        Some(at) => at,
        None => {
            let modified = std::fs::metadata(target.video)
                .and_then(|m| m.modified())
                .map_err(|source| ScanError::VideoTime {
                    path: target.video.to_path_buf(),
                    source,
                })?;
            DateTime::<Utc>::from(modified).with_timezone(&timezone)
        }
    };
    timezone
        .timestamp_opt(start.timestamp(), 0)
        .single()
        .ok_or_else(|| ScanError::VideoTime {
            path: target.video.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, "timestamp out of range"),
        })
}
