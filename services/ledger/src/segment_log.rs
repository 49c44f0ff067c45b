//! Segment log format shared by the frame scanner and the event reconstructor.
//!
//! A segment log covers one camera over one wall-clock window. The first line
//! is a header, every following line is either a station state marker or a
//! per-frame detection audit entry:
//!
//! ```text
//! # Start: 0, End: 300, Start_Time: 2026-10-19 08:00:00+09:00, Camera_Name: cam-01, Video_File: /data/cam-01/0800.mp4
//! -1,On
//! 0,Off
//! 4,Off,ABC123,bbox:[120,40,88,88]
//! 9,Off
//! 10,On,ABC123
//! ```
//!
//! `On` is the Ready (idle) state, `Off` is Packing. Lines are parsed into the
//! typed [`LogLine`] enum at the boundary so nothing downstream deals with raw
//! text.

use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

/// Format used for `Start_Time` when writing headers.
pub const START_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%:z";

const NAIVE_START_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const INFERRED_TOKEN: &str = "inferred:true";
const BBOX_PREFIX: &str = "bbox:[";
const BOUNDARY_PREFIX: &str = "boundary:[";
const NO_READING_TOKEN: &str = "reading:none";

/// Errors raised while reading or parsing a segment log.
#[derive(Debug, Error)]
pub enum SegmentLogError {
    #[error("Failed to read segment log {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Segment log has no header line")]
    MissingHeader,

    #[error("Invalid segment header: {0}")]
    InvalidHeader(String),

    #[error("Invalid segment line: {0}")]
    InvalidLine(String),
}

/// Station state carried by a log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StationState {
    /// Idle, written as `On`.
    Ready,
    /// Worker handling an item, written as `Off`.
    Packing,
}

impl StationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            StationState::Ready => "On",
            StationState::Packing => "Off",
        }
    }

    fn parse(token: &str) -> Result<Self, SegmentLogError> {
        match token.trim() {
            "On" => Ok(StationState::Ready),
            "Off" => Ok(StationState::Packing),
            other => Err(SegmentLogError::InvalidLine(format!(
                "unknown state '{}'",
                other
            ))),
        }
    }
}

/// Axis-aligned box in full-frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
}

impl BoundingBox {
    pub fn new(x: i32, y: i32, w: i32, h: i32) -> Self {
        Self { x, y, w, h }
    }

    pub fn to_array(&self) -> [i32; 4] {
        [self.x, self.y, self.w, self.h]
    }

    fn parse(inner: &str) -> Result<Self, SegmentLogError> {
        let values = inner
            .split(',')
            .map(|v| {
                v.trim()
                    .parse::<f64>()
                    .map(|f| f.round() as i32)
                    .map_err(|_| SegmentLogError::InvalidLine(format!("bad geometry '{}'", inner)))
            })
            .collect::<Result<Vec<_>, _>>()?;

        match values.as_slice() {
            [x, y, w, h] => Ok(Self::new(*x, *y, *w, *h)),
            _ => Err(SegmentLogError::InvalidLine(format!(
                "geometry needs 4 values, got '{}'",
                inner
            ))),
        }
    }
}

impl fmt::Display for BoundingBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{},{},{},{}]", self.x, self.y, self.w, self.h)
    }
}

/// One body line of a segment log.
#[derive(Debug, Clone, PartialEq)]
pub enum LogLine {
    /// Station idle. Carries the tracking code when it closes a packing period.
    Ready { second: i64, code: Option<String> },
    /// Station busy. `inferred` marks a start that was guessed, not observed.
    Packing {
        second: i64,
        code: Option<String>,
        inferred: bool,
    },
    /// Per-frame audit entry: a decoded code, or a code region that was seen
    /// but could not be read (`success == false`).
    Detection {
        second: i64,
        state: StationState,
        success: bool,
        code: Option<String>,
        bbox: BoundingBox,
    },
    /// Per-frame audit entry for a frame analyzed without any code reading.
    NoReading { second: i64, state: StationState },
}

impl LogLine {
    pub fn ready(second: i64, code: Option<String>) -> Self {
        LogLine::Ready { second, code }
    }

    pub fn packing(second: i64) -> Self {
        LogLine::Packing {
            second,
            code: None,
            inferred: false,
        }
    }

    pub fn second(&self) -> i64 {
        match self {
            LogLine::Ready { second, .. }
            | LogLine::Packing { second, .. }
            | LogLine::Detection { second, .. }
            | LogLine::NoReading { second, .. } => *second,
        }
    }

    pub fn is_detection(&self) -> bool {
        matches!(self, LogLine::Detection { .. })
    }

    /// Audit lines never change the station state.
    pub fn is_audit(&self) -> bool {
        matches!(self, LogLine::Detection { .. } | LogLine::NoReading { .. })
    }

    /// Parse a single body line.
    pub fn parse(line: &str) -> Result<Self, SegmentLogError> {
        let line = line.trim();
        let mut head = line.splitn(3, ',');

        let second = head
            .next()
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| SegmentLogError::InvalidLine(line.to_string()))?
            .trim()
            .parse::<i64>()
            .map_err(|_| SegmentLogError::InvalidLine(format!("bad second in '{}'", line)))?;

        let state = StationState::parse(
            head.next()
                .ok_or_else(|| SegmentLogError::InvalidLine(format!("missing state in '{}'", line)))?,
        )?;

        let rest = head.next().unwrap_or("").trim();

        // Geometry is always the last field and contains commas of its own.
        let (tokens, geometry) = match find_geometry(rest) {
            Some(idx) => (rest[..idx].trim_end_matches(',').trim(), Some(&rest[idx..])),
            None => (rest, None),
        };

        let mut code = None;
        let mut inferred = false;
        let mut no_reading = false;
        for token in tokens.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            if token == INFERRED_TOKEN {
                inferred = true;
            } else if token == NO_READING_TOKEN {
                no_reading = true;
            } else if code.is_none() {
                code = Some(token.to_string());
            }
        }

        if let Some(geometry) = geometry {
            let (success, inner) = if let Some(g) = geometry.strip_prefix(BBOX_PREFIX) {
                (true, g)
            } else if let Some(g) = geometry.strip_prefix(BOUNDARY_PREFIX) {
                (false, g)
            } else {
                return Err(SegmentLogError::InvalidLine(line.to_string()));
            };
            let inner = inner
                .strip_suffix(']')
                .ok_or_else(|| SegmentLogError::InvalidLine(format!("unterminated geometry in '{}'", line)))?;
            let bbox = BoundingBox::parse(inner)?;

            if success && code.is_none() {
                return Err(SegmentLogError::InvalidLine(format!(
                    "decoded detection without code in '{}'",
                    line
                )));
            }

            return Ok(LogLine::Detection {
                second,
                state,
                success,
                code: if success { code } else { None },
                bbox,
            });
        }

        if no_reading {
            return Ok(LogLine::NoReading { second, state });
        }

        Ok(match state {
            StationState::Ready => LogLine::Ready { second, code },
            StationState::Packing => LogLine::Packing {
                second,
                code,
                inferred,
            },
        })
    }
}

impl fmt::Display for LogLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLine::Ready { second, code } => {
                write!(f, "{},{}", second, StationState::Ready.as_str())?;
                if let Some(code) = code {
                    write!(f, ",{}", sanitize_code(code))?;
                }
                Ok(())
            }
            LogLine::Packing {
                second,
                code,
                inferred,
            } => {
                write!(f, "{},{}", second, StationState::Packing.as_str())?;
                if let Some(code) = code {
                    write!(f, ",{}", sanitize_code(code))?;
                }
                if *inferred {
                    write!(f, ",{}", INFERRED_TOKEN)?;
                }
                Ok(())
            }
            LogLine::Detection {
                second,
                state,
                success,
                code,
                bbox,
            } => {
                write!(f, "{},{}", second, state.as_str())?;
                match (success, code) {
                    (true, Some(code)) => write!(f, ",{},bbox:{}", sanitize_code(code), bbox),
                    _ => write!(f, ",boundary:{}", bbox),
                }
            }
            LogLine::NoReading { second, state } => {
                write!(f, "{},{},{}", second, state.as_str(), NO_READING_TOKEN)
            }
        }
    }
}

fn find_geometry(rest: &str) -> Option<usize> {
    [BBOX_PREFIX, BOUNDARY_PREFIX]
        .iter()
        .filter_map(|p| rest.find(p))
        .min()
}

/// Codes are written verbatim apart from the field separator and line breaks.
pub fn sanitize_code(code: &str) -> String {
    code.trim()
        .chars()
        .map(|c| if c == ',' || c == '\n' || c == '\r' { '_' } else { c })
        .collect()
}

/// Header of a segment log.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentHeader {
    /// Window start, seconds relative to the video.
    pub start: i64,
    /// Window end, seconds relative to the video.
    pub end: i64,
    /// Wall-clock time of `start`.
    pub start_time: DateTime<FixedOffset>,
    pub camera_name: String,
    pub video_file: String,
}

impl SegmentHeader {
    /// Parse a header line. Timestamps without an offset are read in
    /// `default_tz`.
    pub fn parse(line: &str, default_tz: FixedOffset) -> Result<Self, SegmentLogError> {
        let body = line
            .trim()
            .strip_prefix('#')
            .ok_or_else(|| SegmentLogError::InvalidHeader(format!("not a header: '{}'", line)))?
            .trim();

        let body = body
            .strip_prefix("Start:")
            .ok_or_else(|| SegmentLogError::InvalidHeader("missing Start".to_string()))?;
        let (start, body) = split_field(body, ", End:")?;
        let (end, body) = split_field(body, ", Start_Time:")?;
        let (start_time, body) = split_field(body, ", Camera_Name:")?;
        let (camera_name, video_file) = split_field(body, ", Video_File:")?;

        let start = parse_int(start, "Start")?;
        let end = parse_int(end, "End")?;
        if end < start {
            return Err(SegmentLogError::InvalidHeader(format!(
                "window end {} before start {}",
                end, start
            )));
        }

        let camera_name = camera_name.trim().to_string();
        if camera_name.is_empty() {
            return Err(SegmentLogError::InvalidHeader("empty Camera_Name".to_string()));
        }

        Ok(Self {
            start,
            end,
            start_time: parse_start_time(start_time.trim(), default_tz)?,
            camera_name,
            video_file: video_file.trim().to_string(),
        })
    }

    /// Wall-clock UTC milliseconds of a second relative to the video.
    pub fn absolute_ms(&self, second: f64) -> i64 {
        self.start_time.timestamp_millis() + ((second - self.start as f64) * 1000.0).round() as i64
    }

    /// Inverse of [`absolute_ms`](Self::absolute_ms).
    pub fn relative_second(&self, ms: i64) -> f64 {
        self.start as f64 + (ms - self.start_time.timestamp_millis()) as f64 / 1000.0
    }

    /// Wall-clock UTC milliseconds at which the video itself started.
    pub fn video_start_ms(&self) -> i64 {
        self.absolute_ms(0.0)
    }

    /// UTC offset of the header timestamp, e.g. `+09:00`.
    pub fn timezone(&self) -> String {
        self.start_time.offset().to_string()
    }
}

impl fmt::Display for SegmentHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "# Start: {}, End: {}, Start_Time: {}, Camera_Name: {}, Video_File: {}",
            self.start,
            self.end,
            self.start_time.format(START_TIME_FORMAT),
            self.camera_name,
            self.video_file
        )
    }
}

fn split_field<'a>(body: &'a str, next_label: &str) -> Result<(&'a str, &'a str), SegmentLogError> {
    body.split_once(next_label)
        .ok_or_else(|| SegmentLogError::InvalidHeader(format!("missing '{}'", next_label.trim_start_matches(", "))))
}

fn parse_int(value: &str, field: &str) -> Result<i64, SegmentLogError> {
    value
        .trim()
        .parse::<i64>()
        .map_err(|_| SegmentLogError::InvalidHeader(format!("{} is not an integer: '{}'", field, value.trim())))
}

fn parse_start_time(value: &str, default_tz: FixedOffset) -> Result<DateTime<FixedOffset>, SegmentLogError> {
    if let Ok(dt) = DateTime::parse_from_str(value, START_TIME_FORMAT) {
        return Ok(dt);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Ok(dt);
    }
    let naive = NaiveDateTime::parse_from_str(value, NAIVE_START_TIME_FORMAT)
        .map_err(|_| SegmentLogError::InvalidHeader(format!("bad Start_Time '{}'", value)))?;
    default_tz
        .from_local_datetime(&naive)
        .single()
        .ok_or_else(|| SegmentLogError::InvalidHeader(format!("ambiguous Start_Time '{}'", value)))
}

/// A fully parsed segment log.
#[derive(Debug, Clone)]
pub struct SegmentLog {
    pub header: SegmentHeader,
    pub lines: Vec<LogLine>,
    /// Body lines that could not be parsed and were skipped.
    pub malformed: usize,
}

impl SegmentLog {
    /// Read and parse a segment log file.
    pub fn read(path: &Path, default_tz: FixedOffset) -> Result<Self, SegmentLogError> {
        let text = std::fs::read_to_string(path).map_err(|source| SegmentLogError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let log = Self::parse(&text, default_tz)?;
        if log.malformed > 0 {
            warn!(
                path = %path.display(),
                malformed = log.malformed,
                "Skipped malformed segment log lines"
            );
        }
        Ok(log)
    }

    /// Parse segment log text. A missing or corrupt header fails the whole
    /// log; malformed body lines are counted and skipped.
    pub fn parse(text: &str, default_tz: FixedOffset) -> Result<Self, SegmentLogError> {
        let mut lines = text.lines().filter(|l| !l.trim().is_empty());

        let header_line = lines.next().ok_or(SegmentLogError::MissingHeader)?;
        let header = SegmentHeader::parse(header_line, default_tz)?;

        let mut parsed = Vec::new();
        let mut malformed = 0;
        for line in lines {
            if line.trim_start().starts_with('#') {
                continue;
            }
            match LogLine::parse(line) {
                Ok(l) => parsed.push(l),
                Err(_) => malformed += 1,
            }
        }

        Ok(Self {
            header,
            lines: parsed,
            malformed,
        })
    }

    /// Ready/Packing markers in file order.
    pub fn state_lines(&self) -> impl Iterator<Item = &LogLine> {
        self.lines.iter().filter(|l| !l.is_audit())
    }

    /// Detection audit entries in file order.
    pub fn detections(&self) -> impl Iterator<Item = &LogLine> {
        self.lines.iter().filter(|l| l.is_detection())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tz() -> FixedOffset {
        FixedOffset::east_opt(9 * 3600).unwrap()
    }

    const HEADER: &str = "# Start: 0, End: 300, Start_Time: 2026-10-19 08:00:00+09:00, Camera_Name: cam-01, Video_File: /data/cam-01/a, b.mp4";

    #[test]
    fn test_header_round_trip() {
        let header = SegmentHeader::parse(HEADER, tz()).unwrap();
        assert_eq!(header.start, 0);
        assert_eq!(header.end, 300);
        assert_eq!(header.camera_name, "cam-01");
        assert_eq!(header.video_file, "/data/cam-01/a, b.mp4");
        assert_eq!(header.timezone(), "+09:00");
        assert_eq!(header.to_string(), HEADER);
    }

    #[test]
    fn test_header_naive_time_uses_default_timezone() {
        let header = SegmentHeader::parse(
            "# Start: 300, End: 600, Start_Time: 2026-10-19 08:05:00, Camera_Name: cam-01, Video_File: v.mp4",
            tz(),
        )
        .unwrap();
        assert_eq!(header.timezone(), "+09:00");
        // Second 300 is the window start, so video start is five minutes earlier.
        assert_eq!(header.absolute_ms(300.0) - header.video_start_ms(), 300_000);
        assert_eq!(header.relative_second(header.absolute_ms(412.5)), 412.5);
    }

    #[test]
    fn test_corrupt_header() {
        assert!(matches!(
            SegmentHeader::parse("# Start: x, End: 300", tz()),
            Err(SegmentLogError::InvalidHeader(_))
        ));
        assert!(matches!(
            SegmentLog::parse("", tz()),
            Err(SegmentLogError::MissingHeader)
        ));
        assert!(matches!(
            SegmentLog::parse("0,On\n1,Off\n", tz()),
            Err(SegmentLogError::InvalidHeader(_))
        ));
    }

    #[test]
    fn test_state_lines() {
        assert_eq!(LogLine::parse("-1,On").unwrap(), LogLine::ready(-1, None));
        assert_eq!(
            LogLine::parse("10,On,ABC123").unwrap(),
            LogLine::ready(10, Some("ABC123".to_string()))
        );
        assert_eq!(
            LogLine::parse("4,Off,inferred:true").unwrap(),
            LogLine::Packing {
                second: 4,
                code: None,
                inferred: true
            }
        );
    }

    #[test]
    fn test_detection_lines() {
        assert_eq!(
            LogLine::parse("7,Off,ABC123,bbox:[10,20,30,40]").unwrap(),
            LogLine::Detection {
                second: 7,
                state: StationState::Packing,
                success: true,
                code: Some("ABC123".to_string()),
                bbox: BoundingBox::new(10, 20, 30, 40),
            }
        );
        assert_eq!(
            LogLine::parse("8,On,boundary:[1,2,3.4,4.6]").unwrap(),
            LogLine::Detection {
                second: 8,
                state: StationState::Ready,
                success: false,
                code: None,
                bbox: BoundingBox::new(1, 2, 3, 5),
            }
        );
        assert!(LogLine::parse("8,On,bbox:[1,2,3,4]").is_err());
        assert!(LogLine::parse("8,Maybe").is_err());
    }

    #[test]
    fn test_frame_without_reading_is_audit_only() {
        let line = LogLine::parse("12,Off,reading:none").unwrap();
        assert_eq!(
            line,
            LogLine::NoReading {
                second: 12,
                state: StationState::Packing
            }
        );
        assert_eq!(line.to_string(), "12,Off,reading:none");

        let log = SegmentLog::parse(
            "# Start: 0, End: 300, Start_Time: 2026-10-19 08:00:00+09:00, Camera_Name: cam-01, Video_File: a.mp4\n\
             -1,On\n0,Off\n1,Off,reading:none\n2,Off,ABC,bbox:[1,1,2,2]\n3,On,ABC\n",
            tz(),
        )
        .unwrap();
        assert_eq!(log.state_lines().count(), 3);
        assert_eq!(log.detections().count(), 1);
    }

    #[test]
    fn test_display_matches_parse() {
        let lines = [
            LogLine::ready(-1, None),
            LogLine::Packing {
                second: 0,
                code: None,
                inferred: true,
            },
            LogLine::ready(10, Some("ABC123".to_string())),
            LogLine::Detection {
                second: 3,
                state: StationState::Packing,
                success: false,
                code: None,
                bbox: BoundingBox::new(5, 6, 7, 8),
            },
        ];
        for line in lines {
            assert_eq!(LogLine::parse(&line.to_string()).unwrap(), line);
        }
        assert_eq!(
            LogLine::ready(1, Some("A,B".to_string())).to_string(),
            "1,On,A_B"
        );
    }

    #[test]
    fn test_malformed_body_lines_are_counted() {
        let text = format!("{}\n-1,On\ngarbage\n0,Off\n\n# note\n9,Off\n10,On,ABC123\n", HEADER);
        let log = SegmentLog::parse(&text, tz()).unwrap();
        assert_eq!(log.malformed, 1);
        assert_eq!(log.state_lines().count(), 4);
        assert_eq!(log.detections().count(), 0);
    }
}
