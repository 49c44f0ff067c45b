//! Per-frame signal extractors.
//!
//! Code decoding and hand detection come from pre-trained models outside this
//! crate, so they sit behind the [`CodeDecoder`] and [`PresenceDetector`]
//! traits. [`SidecarReadings`] replays the output of such a model from a
//! JSON-lines file. Motion is computed here.

use crate::video_source::GrayFrame;
use packtrace_ledger::BoundingBox;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors raised by extractors.
#[derive(Debug, Error)]
pub enum ExtractorError {
    #[error("Failed to read detector readings {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Detector failed: {0}")]
    Detector(String),
}

/// Rectangle in full-frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roi {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Roi {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Intersect with a frame of the given size. `None` when nothing is left.
    pub fn clamp(&self, frame_width: u32, frame_height: u32) -> Option<Roi> {
        if self.x >= frame_width || self.y >= frame_height {
            return None;
        }
        let width = self.width.min(frame_width - self.x);
        let height = self.height.min(frame_height - self.y);
        let clamped = Roi::new(self.x, self.y, width, height);
        (!clamped.is_empty()).then_some(clamped)
    }

    /// Whether the center of `bbox` falls inside this region.
    pub fn contains_center(&self, bbox: &BoundingBox) -> bool {
        let cx = bbox.x as i64 + bbox.w as i64 / 2;
        let cy = bbox.y as i64 + bbox.h as i64 / 2;
        cx >= self.x as i64
            && cy >= self.y as i64
            && cx < self.x as i64 + self.width as i64
            && cy < self.y as i64 + self.height as i64
    }
}

/// Grayscale crop of one region of a frame.
#[derive(Debug, Clone, PartialEq)]
pub struct RoiImage {
    /// Region after clamping to the frame.
    pub roi: Roi,
    pub pixels: Vec<u8>,
}

impl RoiImage {
    /// Crop `roi` out of `frame`. `None` for an empty or out-of-frame region.
    pub fn crop(frame: &GrayFrame, roi: &Roi) -> Option<RoiImage> {
        let roi = roi.clamp(frame.width, frame.height)?;
        let stride = frame.width as usize;
        let mut pixels = Vec::with_capacity(roi.width as usize * roi.height as usize);
        for row in roi.y..roi.y + roi.height {
            let start = row as usize * stride + roi.x as usize;
            let end = start + roi.width as usize;
            pixels.extend_from_slice(frame.data.get(start..end)?);
        }
        Some(RoiImage { roi, pixels })
    }
}

/// The frame an extractor is asked about.
#[derive(Debug, Clone, Copy)]
pub struct FrameContext<'a> {
    pub index: u64,
    pub second: f64,
    pub image: &'a RoiImage,
}

/// One optical-code reading.
#[derive(Debug, Clone, PartialEq)]
pub enum CodeReading {
    Decoded { text: String, bbox: BoundingBox },
    /// A code region was located but could not be read.
    Boundary { bbox: BoundingBox },
}

/// Hand presence on one frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Presence {
    pub visible: bool,
    pub landmarks: Vec<(f32, f32)>,
}

pub trait CodeDecoder: Send {
    fn decode(&mut self, frame: &FrameContext<'_>) -> Result<Vec<CodeReading>, ExtractorError>;
}

pub trait PresenceDetector: Send {
    fn detect(&mut self, frame: &FrameContext<'_>) -> Result<Presence, ExtractorError>;
}

/// Mean absolute difference between consecutive crops, normalized to `[0, 1]`.
#[derive(Debug, Default)]
pub struct MotionEstimator {
    previous: Option<RoiImage>,
}

impl MotionEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Motion relative to the previous crop. The first crop, or one whose
    /// region changed size, counts as full motion.
    pub fn estimate(&mut self, image: &RoiImage) -> f64 {
        let motion = match &self.previous {
            Some(prev) if prev.roi == image.roi && !image.pixels.is_empty() => {
                let total: u64 = prev
                    .pixels
                    .iter()
                    .zip(&image.pixels)
                    .map(|(a, b)| a.abs_diff(*b) as u64)
                    .sum();
                total as f64 / (image.pixels.len() as f64 * 255.0)
            }
            _ => 1.0,
        };
        self.previous = Some(image.clone());
        motion
    }
}

/// Presence fallback for stations without a hand model: motion inside the
/// packing area above a threshold counts as a hand.
#[derive(Debug)]
pub struct MotionPresence {
    estimator: MotionEstimator,
    threshold: f64,
}

impl MotionPresence {
    pub fn new(threshold: f64) -> Self {
        Self {
            estimator: MotionEstimator::new(),
            threshold,
        }
    }
}

impl PresenceDetector for MotionPresence {
    fn detect(&mut self, frame: &FrameContext<'_>) -> Result<Presence, ExtractorError> {
        let motion = self.estimator.estimate(frame.image);
        Ok(Presence {
            visible: motion > self.threshold,
            landmarks: Vec::new(),
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
struct SidecarCode {
    text: String,
    bbox: [i32; 4],
}

#[derive(Debug, Clone, Deserialize)]
struct SidecarLine {
    frame: u64,
    #[serde(default)]
    codes: Vec<SidecarCode>,
    #[serde(default)]
    boundaries: Vec<[i32; 4]>,
    #[serde(default)]
    hand: bool,
    #[serde(default)]
    landmarks: Vec<[f32; 2]>,
}

/// Detector output replayed from a JSON-lines file, one line per frame:
///
/// ```text
/// {"frame":120,"codes":[{"text":"PKG1","bbox":[10,10,40,40]}],"boundaries":[[5,5,20,20]],"hand":true,"landmarks":[[12.0,30.5]]}
/// ```
///
/// Frames without a line have no readings. Cloning shares the parsed data.
#[derive(Debug, Clone, Default)]
pub struct SidecarReadings {
    frames: Arc<HashMap<u64, SidecarLine>>,
}

impl SidecarReadings {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Load a readings file. Malformed lines are skipped.
    pub fn load(path: &Path) -> Result<Self, ExtractorError> {
        let file = std::fs::File::open(path).map_err(|source| ExtractorError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let mut frames = HashMap::new();
        let mut malformed = 0usize;
        for line in BufReader::new(file).lines() {
            let line = line.map_err(|source| ExtractorError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<SidecarLine>(&line) {
                Ok(entry) => {
                    frames.insert(entry.frame, entry);
                }
                Err(e) => {
                    malformed += 1;
                    debug!(error = %e, "Skipping malformed readings line");
                }
            }
        }

        if malformed > 0 {
            warn!(path = %path.display(), malformed = malformed, "Skipped malformed readings lines");
        }
        info!(path = %path.display(), frames = frames.len(), "Loaded detector readings");

        Ok(Self {
            frames: Arc::new(frames),
        })
    }

    /// Readings for `video` from `<dir>/<video stem>.jsonl`; empty when the
    /// file does not exist.
    pub fn for_video(dir: &Path, video: &Path) -> Result<Self, ExtractorError> {
        let stem = video.file_stem().unwrap_or_default().to_string_lossy();
        let path = dir.join(format!("{}.jsonl", stem));
        if !path.is_file() {
            warn!(
                path = %path.display(),
                video = %video.display(),
                "No detector readings for video"
            );
            return Ok(Self::empty());
        }
        Self::load(&path)
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

fn bbox_from(values: &[i32; 4]) -> BoundingBox {
    BoundingBox::new(values[0], values[1], values[2], values[3])
}

impl CodeDecoder for SidecarReadings {
    fn decode(&mut self, frame: &FrameContext<'_>) -> Result<Vec<CodeReading>, ExtractorError> {
        let Some(entry) = self.frames.get(&frame.index) else {
            return Ok(Vec::new());
        };
        let region = frame.image.roi;

        let decoded = entry.codes.iter().filter_map(|c| {
            let bbox = bbox_from(&c.bbox);
            let text = c.text.trim();
            (!text.is_empty() && region.contains_center(&bbox)).then(|| CodeReading::Decoded {
                text: text.to_string(),
                bbox,
            })
        });
        let boundaries = entry
            .boundaries
            .iter()
            .map(bbox_from)
            .filter(|bbox| region.contains_center(bbox))
            .map(|bbox| CodeReading::Boundary { bbox });

        Ok(decoded.chain(boundaries).collect())
    }
}

impl PresenceDetector for SidecarReadings {
    fn detect(&mut self, frame: &FrameContext<'_>) -> Result<Presence, ExtractorError> {
        Ok(self
            .frames
            .get(&frame.index)
            .map(|entry| Presence {
                visible: entry.hand,
                landmarks: entry.landmarks.iter().map(|[x, y]| (*x, *y)).collect(),
            })
            .unwrap_or_default())
    }
}
