//! Sequential decoding of recorded videos into grayscale frames.
//!
//! The GStreamer pipeline decodes whatever container and codec the file
//! holds, converts to 8-bit gray and hands frames over through an appsink
//! that is pulled synchronously, one frame at a time.

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors that can occur while decoding a video.
#[derive(Debug, Error)]
pub enum VideoError {
    #[error("GStreamer initialization failed: {0}")]
    GstreamerInit(String),

    #[error("Video file not found: {0}")]
    NotFound(PathBuf),

    #[error("Pipeline creation failed: {0}")]
    PipelineCreation(String),

    #[error("Pipeline element not found: {0}")]
    ElementNotFound(String),

    #[error("Pipeline state change failed: {0}")]
    StateChangeFailed(String),

    #[error("Decoding failed: {0}")]
    Decode(String),

    #[error("Frame extraction failed: {0}")]
    FrameExtraction(String),
}

/// A decoded 8-bit grayscale frame, rows tightly packed.
#[derive(Debug, Clone, PartialEq)]
pub struct GrayFrame {
    /// Zero-based decode order.
    pub index: u64,
    /// Seconds since the start of the video.
    pub second: f64,
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

/// Anything that yields frames in decode order.
pub trait FrameSource {
    /// Frames per second of the source.
    fn fps(&self) -> f64;

    /// Next frame, or `None` at the end of the video.
    fn next_frame(&mut self) -> Result<Option<GrayFrame>, VideoError>;
}

/// File decoder backed by a GStreamer pipeline.
pub struct GstVideoSource {
    path: PathBuf,
    pipeline: gst::Pipeline,
    appsink: gst_app::AppSink,
    fps: f64,
    next_index: u64,
    /// First frame, pulled during `open` to learn the stream format.
    pending: Option<GrayFrame>,
    finished: bool,
}

impl GstVideoSource {
    /// Open a video file. `fallback_fps` is used when the container does not
    /// report a frame rate.
    pub fn open(path: &Path, fallback_fps: f64) -> Result<Self, VideoError> {
        if !path.is_file() {
            return Err(VideoError::NotFound(path.to_path_buf()));
        }
        gst::init().map_err(|e| VideoError::GstreamerInit(e.to_string()))?;

        let pipeline_str = build_pipeline_string(path);
        debug!(pipeline = %pipeline_str, "Creating GStreamer pipeline");

        let pipeline = gst::parse::launch(&pipeline_str)
            .map_err(|e| VideoError::PipelineCreation(e.to_string()))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| VideoError::PipelineCreation("Failed to cast to Pipeline".to_string()))?;

        let appsink = pipeline
            .by_name("sink")
            .ok_or_else(|| VideoError::ElementNotFound("appsink".to_string()))?
            .downcast::<gst_app::AppSink>()
            .map_err(|_| VideoError::ElementNotFound("Could not cast to AppSink".to_string()))?;

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| VideoError::StateChangeFailed(e.to_string()))?;

        let mut source = Self {
            path: path.to_path_buf(),
            pipeline,
            appsink,
            fps: fallback_fps,
            next_index: 0,
            pending: None,
            finished: false,
        };

        match source.pull()? {
            Some((frame, fps)) => {
                if let Some(fps) = fps {
                    source.fps = fps;
                } else {
                    warn!(
                        video = %path.display(),
                        fallback_fps = fallback_fps,
                        "Container reports no frame rate, using fallback"
                    );
                }
                info!(
                    video = %path.display(),
                    width = frame.width,
                    height = frame.height,
                    fps = source.fps,
                    "Opened video"
                );
                source.pending = Some(frame);
            }
            None => {
                warn!(video = %path.display(), "Video has no frames");
                source.finished = true;
            }
        }

        Ok(source)
    }

    /// Pull one sample and convert it. Returns the container frame rate
    /// alongside the frame when the caps carry one.
    fn pull(&mut self) -> Result<Option<(GrayFrame, Option<f64>)>, VideoError> {
        let sample = match self.appsink.pull_sample() {
            Ok(sample) => sample,
            Err(_) => {
                self.check_bus()?;
                return Ok(None);
            }
        };

        let buffer = sample
            .buffer()
            .ok_or_else(|| VideoError::FrameExtraction("Sample without buffer".to_string()))?;
        let caps = sample
            .caps()
            .ok_or_else(|| VideoError::FrameExtraction("Sample without caps".to_string()))?;
        let info = gst_video::VideoInfo::from_caps(caps)
            .map_err(|e| VideoError::FrameExtraction(e.to_string()))?;

        let fps = {
            let rate = info.fps();
            (rate.numer() > 0 && rate.denom() > 0).then(|| rate.numer() as f64 / rate.denom() as f64)
        };

        let width = info.width();
        let height = info.height();
        let stride = info.stride()[0] as usize;
        let map = buffer
            .map_readable()
            .map_err(|e| VideoError::FrameExtraction(e.to_string()))?;
        let data = pack_rows(map.as_slice(), width as usize, height as usize, stride)?;

        let index = self.next_index;
        self.next_index += 1;
        let second = match buffer.pts() {
            Some(pts) => pts.nseconds() as f64 / 1e9,
            None => index as f64 / fps.unwrap_or(self.fps),
        };

        Ok(Some((
            GrayFrame {
                index,
                second,
                width,
                height,
                data,
            },
            fps,
        )))
    }

    /// Turn a pending pipeline error into a `VideoError`.
    fn check_bus(&self) -> Result<(), VideoError> {
        let Some(bus) = self.pipeline.bus() else {
            return Ok(());
        };
        if let Some(msg) = bus.pop_filtered(&[gst::MessageType::Error]) {
            if let gst::MessageView::Error(err) = msg.view() {
                return Err(VideoError::Decode(format!(
                    "{}: {}",
                    self.path.display(),
                    err.error()
                )));
            }
        }
        Ok(())
    }
}

impl FrameSource for GstVideoSource {
    fn fps(&self) -> f64 {
        self.fps
    }

    fn next_frame(&mut self) -> Result<Option<GrayFrame>, VideoError> {
        if let Some(frame) = self.pending.take() {
            return Ok(Some(frame));
        }
        if self.finished {
            return Ok(None);
        }
        match self.pull()? {
            Some((frame, _)) => Ok(Some(frame)),
            None => {
                self.finished = true;
                debug!(video = %self.path.display(), frames = self.next_index, "End of video");
                Ok(None)
            }
        }
    }
}

impl Drop for GstVideoSource {
    fn drop(&mut self) {
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}

fn build_pipeline_string(path: &Path) -> String {
    let location = path.to_string_lossy().replace('\\', "\\\\").replace('"', "\\\"");
    format!(
        "filesrc location=\"{location}\" ! decodebin ! videoconvert \
         ! video/x-raw,format=GRAY8 \
         ! appsink name=sink sync=false max-buffers=16",
        location = location
    )
}

/// Copy `height` rows of `width` bytes out of a buffer with row padding.
fn pack_rows(src: &[u8], width: usize, height: usize, stride: usize) -> Result<Vec<u8>, VideoError> {
    if stride == width && src.len() >= width * height {
        return Ok(src[..width * height].to_vec());
    }
    if stride < width || src.len() < stride * (height.saturating_sub(1)) + width {
        return Err(VideoError::FrameExtraction(format!(
            "buffer of {} bytes too small for {}x{} (stride {})",
            src.len(),
            width,
            height,
            stride
        )));
    }
    let mut data = Vec::with_capacity(width * height);
    for row in 0..height {
        let start = row * stride;
        data.extend_from_slice(&src[start..start + width]);
    }
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_string_quotes_location() {
        let pipeline = build_pipeline_string(Path::new("/data/cam 01/\"odd\".mp4"));
        assert!(pipeline.starts_with("filesrc location=\"/data/cam 01/\\\"odd\\\".mp4\""));
        assert!(pipeline.contains("format=GRAY8"));
        assert!(pipeline.contains("appsink name=sink"));
    }

    #[test]
    fn test_pack_rows_strips_padding() {
        let src = [1, 2, 3, 0, 4, 5, 6, 0];
        assert_eq!(pack_rows(&src, 3, 2, 4).unwrap(), vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_pack_rows_tight_buffer() {
        let src = [9u8; 6];
        assert_eq!(pack_rows(&src, 3, 2, 3).unwrap(), vec![9u8; 6]);
    }

    #[test]
    fn test_pack_rows_rejects_short_buffer() {
        assert!(pack_rows(&[0u8; 5], 3, 2, 4).is_err());
    }

    #[test]
    fn test_open_missing_file() {
        let result = GstVideoSource::open(Path::new("/nonexistent/video.mp4"), 30.0);
        assert!(matches!(result, Err(VideoError::NotFound(_))));
    }
}
