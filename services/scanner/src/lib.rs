//! Packtrace Frame Scanner
//!
//! Reads recorded packing-station videos frame by frame and writes segment
//! logs: Ready/Packing markers around every item a worker packs, plus an audit
//! line for each optical code seen. The logs are replayed into packing events
//! by `packtrace-ledger`.
//!
//! ## Architecture
//!
//! ```text
//! JobQueue ─▶ Worker (per camera) ─▶ FrameScanner ─▶ SegmentWriter ─▶ {camera}/*.log
//!                                      │  ▲
//!                      GstVideoSource ─┘  └─ CodeDecoder / PresenceDetector
//!                                             PackingTracker
//! ```
//!
//! Only one video is scanned at a time. Segment log writes are handed to a
//! single background thread through a bounded channel.

pub mod config;
pub mod extractors;
pub mod frame_scanner;
pub mod queue;
pub mod segment_writer;
pub mod tracker;
pub mod video_source;

pub use config::{CameraConfig, LogLayout, PresenceSource, ScanConfig, ScanSettings, ScannerConfig};
pub use extractors::{
    CodeDecoder, CodeReading, ExtractorError, FrameContext, MotionEstimator, MotionPresence, Presence,
    PresenceDetector, Roi, RoiImage, SidecarReadings,
};
pub use frame_scanner::{segment_path, FrameScanner, ScanError, ScanStats, ScanTarget};
pub use queue::{
    Extractors, GstPipelineFactory, JobOutcome, JobQueue, JobReport, PipelineFactory, VideoJob, WorkerPool,
};
pub use segment_writer::{SegmentWriter, WriterError};
pub use tracker::{FrameSignals, PackingTracker, TrackerSettings};
pub use video_source::{FrameSource, GrayFrame, GstVideoSource, VideoError};
