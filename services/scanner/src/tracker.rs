//! Ready/Packing marker detection from per-frame signals.
//!
//! The tracker is a pure state machine: the scanner feeds it one
//! [`FrameSignals`] per analyzed frame and writes whatever [`LogLine`]s come
//! back. A packing period ends where a run of frames showing the same
//! tracking code ends (the Te candidate). Its start (Ts) is the first frame
//! with a visible hand after the station last settled, or a guess of
//! `Te - min_packing_time - 1` when no hand was seen.

use packtrace_ledger::LogLine;
use tracing::{debug, trace};

/// Thresholds the tracker works with.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackerSettings {
    /// Minimum seconds between two closed markers.
    pub min_packing_time: f64,
    /// Motion below this counts as calm.
    pub motion_threshold: f64,
    /// Calm for at least this long is a stable segment.
    pub min_stable_duration: f64,
}

/// What the extractors saw on one analyzed frame.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameSignals {
    /// Seconds since the start of the video.
    pub second: f64,
    /// Normalized motion in `[0, 1]`.
    pub motion: f64,
    pub hand: bool,
    /// First non-idle code decoded on this frame.
    pub code: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Span {
    start: f64,
    end: f64,
}

#[derive(Debug, Clone)]
struct CodeRun {
    code: String,
    last: f64,
}

/// Stable-period and presence search over a stream of frame signals.
#[derive(Debug)]
pub struct PackingTracker {
    settings: TrackerSettings,
    calm_since: Option<f64>,
    /// Stable segment still growing on the latest frames.
    current_stable: Option<Span>,
    /// Finished stable segments after the last closed marker, oldest first.
    stable: Vec<Span>,
    /// Hand frames after the last closed marker.
    hands: Vec<f64>,
    run: Option<CodeRun>,
    last_closed: Option<f64>,
    window_start: f64,
    last_hand: bool,
}

impl PackingTracker {
    pub fn new(settings: TrackerSettings) -> Self {
        Self {
            settings,
            calm_since: None,
            current_stable: None,
            stable: Vec::new(),
            hands: Vec::new(),
            run: None,
            last_closed: None,
            window_start: 0.0,
            last_hand: false,
        }
    }

    /// Start of the segment window currently being written. Inferred starts
    /// never reach back before it.
    pub fn set_window_start(&mut self, second: f64) {
        self.window_start = second;
    }

    /// Whether the station looks busy on the latest frame.
    pub fn is_busy(&self) -> bool {
        self.run.is_some() || self.last_hand
    }

    /// Feed one analyzed frame and collect the markers it completes.
    pub fn push(&mut self, signals: FrameSignals) -> Vec<LogLine> {
        let second = signals.second;
        self.track_motion(second, signals.motion);

        self.last_hand = signals.hand;
        if signals.hand {
            self.hands.push(second);
        }

        let continues = matches!(
            (&self.run, &signals.code),
            (Some(run), Some(code)) if &run.code == code
        );
        if continues {
            if let Some(run) = self.run.as_mut() {
                run.last = second;
            }
            return Vec::new();
        }

        let mut lines = Vec::new();
        if let Some(ended) = self.run.take() {
            lines = self.close_candidate(ended.last, &ended.code);
        }
        self.run = signals.code.map(|code| CodeRun { code, last: second });
        lines
    }

    /// Flush at the end of the video. Closes a code run still in progress
    /// and, if the station is still busy, opens a period with no end marker.
    pub fn finish(&mut self, last_second: f64) -> Vec<LogLine> {
        let mut lines = Vec::new();
        if let Some(ended) = self.run.take() {
            lines = self.close_candidate(ended.last, &ended.code);
        }

        let settled = self
            .calm_since
            .map_or(false, |since| last_second - since >= self.settings.min_stable_duration);
        if settled {
            return lines;
        }

        let from = self.search_floor(self.stable_before(f64::INFINITY));
        let Some(ts) = self.first_hand(from, f64::INFINITY) else {
            return lines;
        };

        let ts_sec = ts.floor() as i64;
        let last_sec = last_second.floor() as i64;
        debug!(ts = ts_sec, last = last_sec, "Station busy at end of video");
        lines.push(LogLine::ready(ts_sec - 1, None));
        lines.push(LogLine::packing(ts_sec));
        if last_sec > ts_sec {
            lines.push(LogLine::packing(last_sec));
        }
        lines
    }

    fn track_motion(&mut self, second: f64, motion: f64) {
        if motion < self.settings.motion_threshold {
            let since = *self.calm_since.get_or_insert(second);
            if second - since >= self.settings.min_stable_duration {
                self.current_stable = Some(Span { start: since, end: second });
            }
        } else {
            self.calm_since = None;
            if let Some(span) = self.current_stable.take() {
                self.stable.push(span);
            }
        }
    }

    /// Most recent stable segment that ended before `te`.
    fn stable_before(&self, te: f64) -> Option<Span> {
        self.current_stable
            .iter()
            .chain(self.stable.iter().rev())
            .copied()
            .find(|s| s.end < te)
    }

    /// Lower bound for the presence search: the end of the chosen stable
    /// segment, or the previous end marker if that is later.
    fn search_floor(&self, stable: Option<Span>) -> f64 {
        let stable_end = stable.map(|s| s.end);
        match (stable_end, self.last_closed) {
            (Some(end), Some(closed)) => end.max(closed),
            (Some(end), None) => end,
            (None, Some(closed)) => closed,
            (None, None) => f64::NEG_INFINITY,
        }
    }

    fn first_hand(&self, from: f64, before: f64) -> Option<f64> {
        self.hands.iter().copied().find(|&h| {
            h >= from && h < before && self.last_closed.map_or(true, |closed| h > closed)
        })
    }

    fn close_candidate(&mut self, te: f64, code: &str) -> Vec<LogLine> {
        let settings = self.settings;
        if let Some(closed) = self.last_closed {
            if te - closed < settings.min_packing_time {
                trace!(te = te, code = %code, "End candidate too close to previous marker");
                return Vec::new();
            }
        }

        let te_sec = te.floor() as i64;
        let stable = self.stable_before(te);
        let mut lines = Vec::new();

        if self.last_closed.is_none() && stable.is_none() {
            debug!(te = te_sec, code = %code, "First end marker without a stable segment");
            lines.push(LogLine::ready(te_sec, Some(code.to_string())));
            self.mark_closed(te);
            return lines;
        }

        let found = self.first_hand(self.search_floor(stable), te);
        let (ts, inferred) = match found {
            Some(ts) => (ts, false),
            None => {
                let guess = te - settings.min_packing_time - 1.0;
                let fits = guess >= self.window_start && self.last_closed.map_or(true, |c| guess > c);
                if fits {
                    (guess, true)
                } else {
                    debug!(te = te_sec, code = %code, "No start found, emitting end marker only");
                    lines.push(LogLine::ready(te_sec, Some(code.to_string())));
                    self.mark_closed(te);
                    return lines;
                }
            }
        };

        let ts_sec = ts.floor() as i64;
        if te_sec - ts_sec < 1 {
            lines.push(LogLine::ready(te_sec, Some(code.to_string())));
            self.mark_closed(te);
            return lines;
        }

        debug!(
            ts = ts_sec,
            te = te_sec,
            code = %code,
            inferred = inferred,
            "Packing period detected"
        );
        lines.push(LogLine::ready(ts_sec - 1, None));
        lines.push(LogLine::Packing {
            second: ts_sec,
            code: None,
            inferred,
        });
        if te_sec - 1 > ts_sec {
            lines.push(LogLine::packing(te_sec - 1));
        }
        lines.push(LogLine::ready(te_sec, Some(code.to_string())));
        self.mark_closed(te);
        lines
    }

    fn mark_closed(&mut self, te: f64) {
        self.last_closed = Some(te);
        self.hands.retain(|&h| h > te);
        self.stable.retain(|s| s.end > te);
    }
}
