//! Background writer for segment log files.
//!
//! All file I/O for segment logs happens on one thread fed by a bounded
//! channel, so frame analysis never waits on the disk beyond channel
//! backpressure. Commands are applied in the order they were sent, which
//! keeps every file strictly append-ordered.

use crossbeam_channel::{bounded, Receiver, Sender};
use packtrace_ledger::{LogLine, SegmentHeader};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Errors raised by the segment writer.
#[derive(Debug, Error)]
pub enum WriterError {
    #[error("Failed to write segment log {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Segment log {0} is not open")]
    NotOpen(PathBuf),

    #[error("Segment writer has shut down")]
    Closed,

    #[error("Failed to start segment writer thread: {0}")]
    Spawn(std::io::Error),
}

enum WriterCommand {
    Open {
        path: PathBuf,
        header: SegmentHeader,
    },
    Append {
        path: PathBuf,
        line: String,
    },
    /// Flush and close; the result is sent back on `ack`.
    Seal {
        path: PathBuf,
        ack: Sender<Result<(), WriterError>>,
    },
    Shutdown,
}

/// Handle to the writer thread. Cheap to share between scanner workers.
pub struct SegmentWriter {
    tx: Sender<WriterCommand>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl SegmentWriter {
    /// Start the writer thread with a queue of `capacity` commands.
    pub fn spawn(capacity: usize) -> Result<Self, WriterError> {
        let (tx, rx) = bounded(capacity.max(1));
        let handle = std::thread::Builder::new()
            .name("segment-writer".to_string())
            .spawn(move || run(rx))
            .map_err(WriterError::Spawn)?;

        Ok(Self {
            tx,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Create (or truncate) a log file and write its header.
    pub fn open(&self, path: &Path, header: SegmentHeader) -> Result<(), WriterError> {
        self.send(WriterCommand::Open {
            path: path.to_path_buf(),
            header,
        })
    }

    /// Append one line to an open log file.
    pub fn append(&self, path: &Path, line: &LogLine) -> Result<(), WriterError> {
        self.send(WriterCommand::Append {
            path: path.to_path_buf(),
            line: line.to_string(),
        })
    }

    /// Flush and close a log file, waiting until every earlier command for it
    /// has been applied.
    pub fn seal(&self, path: &Path) -> Result<(), WriterError> {
        let (ack_tx, ack_rx) = bounded(1);
        self.send(WriterCommand::Seal {
            path: path.to_path_buf(),
            ack: ack_tx,
        })?;
        ack_rx.recv().map_err(|_| WriterError::Closed)?
    }

    /// Drain the queue and stop the thread. Files still open are flushed.
    pub fn shutdown(&self) -> Result<(), WriterError> {
        let Some(handle) = self.handle.lock().take() else {
            return Ok(());
        };
        self.send(WriterCommand::Shutdown)?;
        if handle.join().is_err() {
            error!("Segment writer thread panicked");
        }
        Ok(())
    }

    fn send(&self, command: WriterCommand) -> Result<(), WriterError> {
        self.tx.send(command).map_err(|_| WriterError::Closed)
    }
}

impl Drop for SegmentWriter {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!(error = %e, "Segment writer did not shut down cleanly");
        }
    }
}

fn run(rx: Receiver<WriterCommand>) {
    let mut files: HashMap<PathBuf, BufWriter<File>> = HashMap::new();
    debug!("Segment writer started");

    for command in rx.iter() {
        match command {
            WriterCommand::Open { path, header } => match create(&path, &header) {
                Ok(file) => {
                    debug!(path = %path.display(), "Segment log opened");
                    if files.insert(path.clone(), file).is_some() {
                        warn!(path = %path.display(), "Segment log reopened before it was sealed");
                    }
                }
                Err(e) => error!(error = %e, "Failed to open segment log"),
            },
            WriterCommand::Append { path, line } => match files.get_mut(&path) {
                Some(file) => {
                    if let Err(source) = writeln!(file, "{}", line) {
                        error!(path = %path.display(), error = %source, "Failed to append to segment log");
                    }
                }
                None => warn!(path = %path.display(), "Dropping line for a segment log that is not open"),
            },
            WriterCommand::Seal { path, ack } => {
                let result = match files.remove(&path) {
                    Some(file) => close(&path, file),
                    None => Err(WriterError::NotOpen(path.clone())),
                };
                if let Err(e) = &result {
                    error!(error = %e, "Failed to seal segment log");
                }
                let _ = ack.send(result);
            }
            WriterCommand::Shutdown => break,
        }
    }

    for (path, file) in files.drain() {
        warn!(path = %path.display(), "Flushing segment log that was never sealed");
        if let Err(e) = close(&path, file) {
            error!(error = %e, "Failed to flush segment log");
        }
    }
    info!("Segment writer stopped");
}

fn create(path: &Path, header: &SegmentHeader) -> Result<BufWriter<File>, WriterError> {
    let io_err = |source| WriterError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }
    let mut file = BufWriter::new(File::create(path).map_err(io_err)?);
    writeln!(file, "{}", header).map_err(io_err)?;
    Ok(file)
}

fn close(path: &Path, mut file: BufWriter<File>) -> Result<(), WriterError> {
    let io_err = |source| WriterError::Io {
        path: path.to_path_buf(),
        source,
    };
    file.flush().map_err(io_err)?;
    file.get_ref().sync_all().map_err(io_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, TimeZone};
    use packtrace_ledger::SegmentLog;

    fn header() -> SegmentHeader {
        let tz = FixedOffset::east_opt(0).unwrap();
        SegmentHeader {
            start: 0,
            end: 300,
            start_time: tz.with_ymd_and_hms(2026, 10, 19, 8, 0, 0).unwrap(),
            camera_name: "cam-01".to_string(),
            video_file: "/v/a.mp4".to_string(),
        }
    }

    #[test]
    fn test_lines_written_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cam-01").join("cam-01_20261019_080000.log");
        let writer = SegmentWriter::spawn(4).unwrap();

        writer.open(&path, header()).unwrap();
        let lines: Vec<_> = (0..50).map(|s| LogLine::packing(s)).collect();
        for line in &lines {
            writer.append(&path, line).unwrap();
        }
        writer.seal(&path).unwrap();

        let log = SegmentLog::read(&path, FixedOffset::east_opt(0).unwrap()).unwrap();
        assert_eq!(log.header, header());
        assert_eq!(log.lines, lines);
        writer.shutdown().unwrap();
    }

    #[test]
    fn test_seal_unknown_file() {
        let writer = SegmentWriter::spawn(4).unwrap();
        let result = writer.seal(Path::new("/tmp/never-opened.log"));
        assert!(matches!(result, Err(WriterError::NotOpen(_))));
    }

    #[test]
    fn test_shutdown_flushes_open_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("open.log");
        let writer = SegmentWriter::spawn(4).unwrap();
        writer.open(&path, header()).unwrap();
        writer.append(&path, &LogLine::ready(1, None)).unwrap();
        writer.shutdown().unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.ends_with("1,On\n"));
        assert!(matches!(
            writer.append(&path, &LogLine::ready(2, None)),
            Err(WriterError::Closed)
        ));
    }
}
