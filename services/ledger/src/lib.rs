//! Packtrace Ledger
//!
//! Turns the segment logs written by the frame scanner into packing events: one
//! row per shipped item, with wall-clock start and end, duration, the tracking
//! code(s) handled and the per-frame evidence behind them.
//!
//! ## Features
//!
//! - **Segment log format**: Typed parsing and writing of the line-oriented log
//!   shared with the scanner
//! - **Exactly-once replay**: Each sealed log is ingested in one transaction
//!   together with its processed flag
//! - **Cross-video continuation**: A packing period left open at the end of one
//!   video is closed by the first end marker of a later one
//! - **Anomaly handling**: Windows carrying several codes are split, short
//!   windows without a code are dropped as noise and long ones are flagged for
//!   a re-scan
//!
//! ## Architecture
//!
//! ```text
//! Frame Scanner              Segment logs               SQLite
//! ┌──────────────┐           ┌──────────────┐          ┌──────────────┐
//! │ Segment      │──────────▶│ {camera}/    │          │ events       │
//! │ Writer       │           │   *.log      │          │ detections   │
//! └──────────────┘           └──────────────┘          │ processed_   │
//!        │                          │                  │   logs       │
//!        │ register / seal          ▼                  └──────────────┘
//!        │                   ┌──────────────┐                 ▲
//!        └──────────────────▶│ Reconstructor│─────────────────┘
//!                            └──────────────┘
//! ```

pub mod config;
pub mod events;
pub mod reconstructor;
pub mod segment_log;
pub mod store;

pub use config::{ConfigValidationError, DatabaseConfig, LedgerConfig, ReconstructConfig};
pub use events::{CodeDetection, EventRepository, EventStatus, PackingEvent};
pub use reconstructor::{log_identifier, BatchReport, ReconstructContext, ReconstructError, Reconstructor};
pub use segment_log::{BoundingBox, LogLine, SegmentHeader, SegmentLog, SegmentLogError, StationState};
pub use store::{Datastore, LogRepository, ProcessedLog, StoreError};
