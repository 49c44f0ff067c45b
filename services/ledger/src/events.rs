//! Packing event and code detection records.

use crate::segment_log::BoundingBox;
use crate::store::{now_ms, StoreError};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle status of a packing event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    /// End marker not seen yet (`te` is null).
    Pending,
    Valid,
    /// Closed without any decoded code but long enough to be real work.
    EmptyNeedRetry,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Pending => "pending",
            EventStatus::Valid => "valid",
            EventStatus::EmptyNeedRetry => "empty_need_retry",
        }
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(EventStatus::Pending),
            "valid" => Ok(EventStatus::Valid),
            "empty_need_retry" => Ok(EventStatus::EmptyNeedRetry),
            other => Err(StoreError::InvalidValue(format!("unknown event status '{}'", other))),
        }
    }
}

/// A worker handling one shipped item at one station.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackingEvent {
    /// Row id, 0 until inserted.
    pub id: i64,
    pub camera_name: String,
    /// Start, seconds relative to `video_file`.
    pub ts: f64,
    /// End, seconds relative to the video the end marker came from.
    pub te: Option<f64>,
    pub duration: Option<f64>,
    pub tracking_codes: Vec<String>,
    pub video_file: String,
    /// UTC milliseconds.
    pub packing_time_start: i64,
    /// UTC milliseconds.
    pub packing_time_end: Option<i64>,
    pub timezone: String,
    pub retry_needed: bool,
    pub retry_count: i64,
    pub status: EventStatus,
    pub ts_inferred: bool,
    pub log_file: String,
}

impl PackingEvent {
    pub fn is_pending(&self) -> bool {
        self.te.is_none()
    }

    /// Add a code unless the event already carries it.
    pub fn add_code(&mut self, code: &str) -> bool {
        add_unique(&mut self.tracking_codes, code)
    }
}

/// Push `code` if it is new. Returns whether it was added.
pub fn add_unique(codes: &mut Vec<String>, code: &str) -> bool {
    let code = code.trim();
    if code.is_empty() || codes.iter().any(|c| c == code) {
        return false;
    }
    codes.push(code.to_string());
    true
}

/// Per-frame evidence attached to a finalized event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeDetection {
    pub id: i64,
    pub event_id: i64,
    /// Seconds relative to the video.
    pub ts: f64,
    /// Empty for boundary-only detections.
    pub code: String,
    pub bbox: BoundingBox,
    /// Decoded, as opposed to located but unreadable.
    pub success: bool,
}

const EVENT_COLUMNS: &str = "id, camera_name, ts, te, duration, tracking_codes, video_file, \
     packing_time_start, packing_time_end, timezone, retry_needed, retry_count, status, \
     ts_inferred, log_file";

/// Access to `events` and `code_detections`.
pub struct EventRepository<'c> {
    conn: &'c Connection,
}

impl<'c> EventRepository<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    /// Insert an event and return its id.
    pub fn insert(&self, event: &PackingEvent) -> Result<i64, StoreError> {
        let now = now_ms();
        self.conn.execute(
            r#"
            INSERT INTO events (
                camera_name, ts, te, duration, tracking_codes, video_file,
                packing_time_start, packing_time_end, timezone, retry_needed,
                retry_count, status, ts_inferred, log_file, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?15)
            "#,
            params![
                event.camera_name,
                event.ts,
                event.te,
                event.duration,
                serde_json::to_string(&event.tracking_codes)?,
                event.video_file,
                event.packing_time_start,
                event.packing_time_end,
                event.timezone,
                event.retry_needed,
                event.retry_count,
                event.status.as_str(),
                event.ts_inferred,
                event.log_file,
                now,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Overwrite every mutable column of an existing event.
    pub fn update(&self, event: &PackingEvent) -> Result<(), StoreError> {
        let changed = self.conn.execute(
            r#"
            UPDATE events SET
                ts = ?2, te = ?3, duration = ?4, tracking_codes = ?5, video_file = ?6,
                packing_time_start = ?7, packing_time_end = ?8, timezone = ?9,
                retry_needed = ?10, retry_count = ?11, status = ?12, ts_inferred = ?13,
                updated_at = ?14
            WHERE id = ?1
            "#,
            params![
                event.id,
                event.ts,
                event.te,
                event.duration,
                serde_json::to_string(&event.tracking_codes)?,
                event.video_file,
                event.packing_time_start,
                event.packing_time_end,
                event.timezone,
                event.retry_needed,
                event.retry_count,
                event.status.as_str(),
                event.ts_inferred,
                now_ms(),
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::InvalidValue(format!("event {} does not exist", event.id)));
        }
        Ok(())
    }

    /// Delete an event together with its detections.
    pub fn delete(&self, id: i64) -> Result<(), StoreError> {
        self.conn
            .execute("DELETE FROM code_detections WHERE event_id = ?1", params![id])?;
        self.conn.execute("DELETE FROM events WHERE id = ?1", params![id])?;
        Ok(())
    }

    pub fn get(&self, id: i64) -> Result<Option<PackingEvent>, StoreError> {
        let sql = format!("SELECT {} FROM events WHERE id = ?1", EVENT_COLUMNS);
        let event = self
            .conn
            .query_row(&sql, params![id], event_from_row)
            .optional()?;
        Ok(event)
    }

    /// The open event of a camera, if any.
    pub fn pending_for_camera(&self, camera_name: &str) -> Result<Option<PackingEvent>, StoreError> {
        let sql = format!(
            "SELECT {} FROM events WHERE camera_name = ?1 AND te IS NULL",
            EVENT_COLUMNS
        );
        let event = self
            .conn
            .query_row(&sql, params![camera_name], event_from_row)
            .optional()?;
        Ok(event)
    }

    /// Events of a camera in chronological order.
    pub fn list_for_camera(&self, camera_name: &str) -> Result<Vec<PackingEvent>, StoreError> {
        let sql = format!(
            "SELECT {} FROM events WHERE camera_name = ?1 ORDER BY packing_time_start, id",
            EVENT_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let events = stmt
            .query_map(params![camera_name], event_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(events)
    }

    /// Events flagged for a re-scan, oldest first.
    pub fn needing_retry(&self, camera_name: Option<&str>) -> Result<Vec<PackingEvent>, StoreError> {
        let sql = format!(
            "SELECT {} FROM events WHERE retry_needed = 1 AND (?1 IS NULL OR camera_name = ?1) \
             ORDER BY packing_time_start, id",
            EVENT_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let events = stmt
            .query_map(params![camera_name], event_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(events)
    }

    /// Count one more re-scan attempt for an event.
    pub fn record_retry_attempt(&self, id: i64) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE events SET retry_count = retry_count + 1, updated_at = ?2 WHERE id = ?1",
            params![id, now_ms()],
        )?;
        Ok(())
    }

    /// Insert a detection row. Returns false when an identical row already
    /// exists.
    pub fn insert_detection(&self, detection: &CodeDetection) -> Result<bool, StoreError> {
        let inserted = self.conn.execute(
            r#"
            INSERT OR IGNORE INTO code_detections (event_id, ts, code, bbox, success)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                detection.event_id,
                detection.ts,
                detection.code,
                serde_json::to_string(&detection.bbox.to_array())?,
                detection.success,
            ],
        )?;
        Ok(inserted > 0)
    }

    pub fn detections_for_event(&self, event_id: i64) -> Result<Vec<CodeDetection>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, event_id, ts, code, bbox, success FROM code_detections \
             WHERE event_id = ?1 ORDER BY ts, id",
        )?;
        let detections = stmt
            .query_map(params![event_id], |row| {
                let bbox: String = row.get(4)?;
                let [x, y, w, h]: [i32; 4] = serde_json::from_str(&bbox).map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
                })?;
                Ok(CodeDetection {
                    id: row.get(0)?,
                    event_id: row.get(1)?,
                    ts: row.get(2)?,
                    code: row.get(3)?,
                    bbox: BoundingBox::new(x, y, w, h),
                    success: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(detections)
    }

    /// Remove every detection of an event, keeping the event row.
    pub fn clear_detections(&self, event_id: i64) -> Result<usize, StoreError> {
        let removed = self
            .conn
            .execute("DELETE FROM code_detections WHERE event_id = ?1", params![event_id])?;
        Ok(removed)
    }

    pub fn count_events(&self) -> Result<i64, StoreError> {
        let count = self
            .conn
            .query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?;
        Ok(count)
    }

    pub fn count_detections(&self) -> Result<i64, StoreError> {
        let count = self
            .conn
            .query_row("SELECT COUNT(*) FROM code_detections", [], |row| row.get(0))?;
        Ok(count)
    }
}

fn event_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PackingEvent> {
    let codes: String = row.get(5)?;
    let tracking_codes: Vec<String> = serde_json::from_str(&codes).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let status: String = row.get(12)?;
    let status = status.parse::<EventStatus>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(12, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(PackingEvent {
        id: row.get(0)?,
        camera_name: row.get(1)?,
        ts: row.get(2)?,
        te: row.get(3)?,
        duration: row.get(4)?,
        tracking_codes,
        video_file: row.get(6)?,
        packing_time_start: row.get(7)?,
        packing_time_end: row.get(8)?,
        timezone: row.get(9)?,
        retry_needed: row.get(10)?,
        retry_count: row.get(11)?,
        status,
        ts_inferred: row.get(13)?,
        log_file: row.get(14)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Datastore;

    fn sample_event(camera: &str, ts: f64, te: Option<f64>) -> PackingEvent {
        PackingEvent {
            id: 0,
            camera_name: camera.to_string(),
            ts,
            te,
            duration: te.map(|te| te - ts),
            tracking_codes: vec![],
            video_file: "v.mp4".to_string(),
            packing_time_start: 1_000 + (ts * 1000.0) as i64,
            packing_time_end: te.map(|te| 1_000 + (te * 1000.0) as i64),
            timezone: "+00:00".to_string(),
            retry_needed: false,
            retry_count: 0,
            status: if te.is_some() {
                EventStatus::Valid
            } else {
                EventStatus::Pending
            },
            ts_inferred: false,
            log_file: "a.log".to_string(),
        }
    }

    #[test]
    fn test_insert_update_and_read_back() {
        let store = Datastore::open_in_memory().unwrap();
        store
            .with_write(|conn| {
                let repo = EventRepository::new(conn);
                let mut event = sample_event("cam-01", 0.0, None);
                event.add_code("ABC");
                event.id = repo.insert(&event)?;

                let pending = repo.pending_for_camera("cam-01")?.unwrap();
                assert_eq!(pending, event);

                event.te = Some(10.0);
                event.duration = Some(10.0);
                event.status = EventStatus::Valid;
                assert!(!event.add_code("ABC"));
                repo.update(&event)?;

                assert!(repo.pending_for_camera("cam-01")?.is_none());
                assert_eq!(repo.get(event.id)?.unwrap().te, Some(10.0));
                Ok::<_, StoreError>(())
            })
            .unwrap();
    }

    #[test]
    fn test_single_pending_event_per_camera() {
        let store = Datastore::open_in_memory().unwrap();
        let result = store.with_write(|conn| {
            let repo = EventRepository::new(conn);
            repo.insert(&sample_event("cam-01", 0.0, None))?;
            repo.insert(&sample_event("cam-02", 0.0, None))?;
            repo.insert(&sample_event("cam-01", 30.0, None))
        });
        assert!(matches!(result, Err(StoreError::Sqlite(_))));
    }

    #[test]
    fn test_duplicate_detection_is_skipped() {
        let store = Datastore::open_in_memory().unwrap();
        store
            .with_write(|conn| {
                let repo = EventRepository::new(conn);
                let id = repo.insert(&sample_event("cam-01", 0.0, Some(10.0)))?;
                let detection = CodeDetection {
                    id: 0,
                    event_id: id,
                    ts: 4.0,
                    code: "ABC".to_string(),
                    bbox: BoundingBox::new(1, 2, 3, 4),
                    success: true,
                };
                assert!(repo.insert_detection(&detection)?);
                assert!(!repo.insert_detection(&detection)?);
                assert_eq!(repo.detections_for_event(id)?.len(), 1);

                assert_eq!(repo.clear_detections(id)?, 1);
                assert!(repo.get(id)?.is_some());
                assert!(repo.insert_detection(&detection)?);

                repo.delete(id)?;
                assert_eq!(repo.count_detections()?, 0);
                Ok::<_, StoreError>(())
            })
            .unwrap();
    }

    #[test]
    fn test_retry_bookkeeping() {
        let store = Datastore::open_in_memory().unwrap();
        store
            .with_write(|conn| {
                let repo = EventRepository::new(conn);
                let mut event = sample_event("cam-01", 0.0, Some(12.0));
                event.retry_needed = true;
                event.status = EventStatus::EmptyNeedRetry;
                let id = repo.insert(&event)?;
                repo.insert(&sample_event("cam-02", 0.0, Some(8.0)))?;

                assert_eq!(repo.needing_retry(None)?.len(), 1);
                assert!(repo.needing_retry(Some("cam-02"))?.is_empty());

                repo.record_retry_attempt(id)?;
                assert_eq!(repo.get(id)?.unwrap().retry_count, 1);
                Ok::<_, StoreError>(())
            })
            .unwrap();
    }
}
