//! End-to-end replay of segment log files into the datastore.

use chrono::FixedOffset;
use packtrace_ledger::{
    log_identifier, Datastore, EventRepository, EventStatus, LogRepository, PackingEvent,
    ReconstructContext, Reconstructor, StoreError,
};
use std::sync::Arc;
use tempfile::TempDir;

struct Harness {
    dir: TempDir,
    store: Arc<Datastore>,
    reconstructor: Reconstructor,
}

impl Harness {
    fn new() -> Self {
        let store = Arc::new(Datastore::open_in_memory().unwrap());
        let ctx = ReconstructContext::new(5.0, FixedOffset::east_opt(9 * 3600).unwrap());
        Self {
            dir: TempDir::new().unwrap(),
            reconstructor: Reconstructor::new(store.clone(), ctx),
            store,
        }
    }

    /// Write a sealed log and register it.
    fn add_log(&self, name: &str, header: &str, body: &[&str]) -> String {
        let path = self.dir.path().join(name);
        let mut text = String::from(header);
        text.push('\n');
        for line in body {
            text.push_str(line);
            text.push('\n');
        }
        std::fs::write(&path, text).unwrap();

        let id = log_identifier(&path);
        self.store
            .with_write(|conn| LogRepository::new(conn).register(&id, "cam-01", true))
            .unwrap();
        id
    }

    fn events(&self) -> Vec<PackingEvent> {
        self.store
            .with_read(|conn| EventRepository::new(conn).list_for_camera("cam-01"))
            .unwrap()
    }

    /// (ts, code) of every detection attached to an event.
    fn detections(&self, event_id: i64) -> Vec<(f64, String)> {
        self.store
            .with_read(|conn| EventRepository::new(conn).detections_for_event(event_id))
            .unwrap()
            .into_iter()
            .map(|d| (d.ts, d.code))
            .collect()
    }
}

fn header(start_time: &str, video: &str) -> String {
    window_header(0, 300, start_time, video)
}

fn window_header(start: i64, end: i64, start_time: &str, video: &str) -> String {
    format!(
        "# Start: {}, End: {}, Start_Time: {}, Camera_Name: cam-01, Video_File: {}",
        start, end, start_time, video
    )
}

#[test]
fn test_single_event_round_trip() {
    let h = Harness::new();
    h.add_log(
        "a.log",
        &header("2026-10-19 08:00:00+09:00", "/v/a.mp4"),
        &["-1,On", "0,Off", "4,Off,ABC123,bbox:[10,20,30,40]", "9,Off", "10,On,ABC123"],
    );

    let report = h.reconstructor.run_batch().unwrap();
    assert_eq!(report.logs_processed, 1);
    assert_eq!(report.events_closed, 1);

    let events = h.events();
    assert_eq!(events.len(), 1);
    let event = &events[0];
    assert_eq!(event.ts, 0.0);
    assert_eq!(event.te, Some(10.0));
    assert_eq!(event.duration, Some(10.0));
    assert_eq!(event.tracking_codes, vec!["ABC123".to_string()]);
    assert_eq!(event.status, EventStatus::Valid);
    assert_eq!(event.timezone, "+09:00");
    assert!(!event.retry_needed);

    let detections = h
        .store
        .with_read(|conn| EventRepository::new(conn).detections_for_event(event.id))
        .unwrap();
    assert_eq!(detections.len(), 1);
    assert_eq!(detections[0].ts, 4.0);
    assert!(detections[0].success);
}

#[test]
fn test_pending_event_continues_into_next_log() {
    let h = Harness::new();
    h.add_log(
        "a.log",
        &header("2026-10-19 08:00:00+09:00", "/v/a.mp4"),
        &["-1,On", "0,Off", "20,Off"],
    );

    let first = h.reconstructor.run_batch().unwrap();
    assert_eq!(first.events_opened, 1);
    let pending = h.events();
    assert_eq!(pending.len(), 1);
    assert!(pending[0].is_pending());
    assert_eq!(pending[0].status, EventStatus::Pending);

    // Next video starts 30 s after the first one.
    h.add_log(
        "b.log",
        &header("2026-10-19 08:00:30+09:00", "/v/b.mp4"),
        &["5,On,XYZ"],
    );
    h.reconstructor.run_batch().unwrap();

    let events = h.events();
    assert_eq!(events.len(), 1);
    let event = &events[0];
    assert_eq!(event.id, pending[0].id);
    assert_eq!(event.ts, 0.0);
    assert_eq!(event.te, Some(5.0));
    assert_eq!(event.video_file, "/v/a.mp4");
    assert_eq!(event.tracking_codes, vec!["XYZ".to_string()]);
    assert_eq!(event.duration, Some(35.0));
}

#[test]
fn test_packing_marker_code_joins_pending_event() {
    let h = Harness::new();
    h.add_log(
        "a.log",
        &header("2026-10-19 08:00:00+09:00", "/v/a.mp4"),
        &["-1,On", "0,Off"],
    );
    h.add_log(
        "b.log",
        &header("2026-10-19 08:00:30+09:00", "/v/b.mp4"),
        &["3,Off,ABC", "8,On"],
    );

    let report = h.reconstructor.run_batch().unwrap();
    assert_eq!(report.logs_processed, 2);
    assert_eq!(report.orphans_deleted, 0);

    let events = h.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].tracking_codes, vec!["ABC".to_string()]);
    assert_eq!(events[0].te, Some(8.0));
    assert_eq!(events[0].duration, Some(38.0));
    assert_eq!(events[0].status, EventStatus::Valid);
}

#[test]
fn test_continued_event_split_reuses_pending_row() {
    let h = Harness::new();
    h.add_log(
        "a.log",
        &header("2026-10-19 08:00:00+09:00", "/v/a.mp4"),
        &["-1,On", "0,Off"],
    );
    h.reconstructor.run_batch().unwrap();
    let pending_id = h.events()[0].id;

    h.add_log(
        "b.log",
        &header("2026-10-19 08:00:30+09:00", "/v/b.mp4"),
        &["2,Off,X", "5,On,Y"],
    );
    let report = h.reconstructor.run_batch().unwrap();
    assert_eq!(report.events_opened, 0);
    assert_eq!(report.events_split, 1);
    assert_eq!(report.events_closed, 2);

    let events = h.events();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].id, pending_id);
    assert_eq!(events[0].tracking_codes, vec!["X".to_string()]);
    assert_eq!((events[0].ts, events[0].te), (0.0, Some(17.5)));
    assert_ne!(events[1].id, pending_id);
    assert_eq!(events[1].tracking_codes, vec!["Y".to_string()]);
    assert_eq!(events[1].ts, 17.5);
    assert_eq!(events[1].te, Some(5.0));
    assert!(events.iter().all(|e| e.duration == Some(17.5)));

    let count = h
        .store
        .with_read(|conn| EventRepository::new(conn).count_events())
        .unwrap();
    assert_eq!(count, 2);
}

#[test]
fn test_detections_follow_wall_clock_across_videos() {
    let h = Harness::new();
    h.add_log(
        "a.log",
        &header("2026-10-19 08:00:00+09:00", "/v/a.mp4"),
        &["-1,On", "0,Off"],
    );
    // Second 2 of b.mp4 is 32 s into the window, inside the Y part.
    h.add_log(
        "b.log",
        &header("2026-10-19 08:00:30+09:00", "/v/b.mp4"),
        &[
            "2,Off,X",
            "2,Off,X,bbox:[1,1,4,4]",
            "4,Off,Y,bbox:[1,1,4,4]",
            "5,On,Y",
        ],
    );

    let report = h.reconstructor.run_batch().unwrap();
    assert_eq!(report.detections_inserted, 1);

    let events = h.events();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].tracking_codes, vec!["X".to_string()]);
    assert!(h.detections(events[0].id).is_empty());
    assert_eq!(h.detections(events[1].id), vec![(34.0, "Y".to_string())]);
}

#[test]
fn test_detections_before_rollover_are_kept() {
    let h = Harness::new();
    h.add_log(
        "a.log",
        &window_header(0, 10, "2026-10-19 08:00:00+09:00", "/v/a.mp4"),
        &["-1,On", "0,Off", "3,Off,PKG,bbox:[1,1,4,4]", "6,Off,boundary:[2,2,3,3]"],
    );
    h.add_log(
        "b.log",
        &window_header(10, 310, "2026-10-19 08:00:10+09:00", "/v/a.mp4"),
        &["12,Off,PKG,bbox:[1,1,4,4]", "14,On,PKG"],
    );

    let report = h.reconstructor.run_batch().unwrap();
    assert_eq!(report.logs_processed, 2);

    let events = h.events();
    assert_eq!(events.len(), 1);
    assert_eq!((events[0].ts, events[0].te), (0.0, Some(14.0)));
    assert_eq!(
        h.detections(events[0].id),
        vec![
            (3.0, "PKG".to_string()),
            (6.0, String::new()),
            (12.0, "PKG".to_string()),
        ]
    );
}

#[test]
fn test_inferred_start_is_flagged_on_event() {
    let h = Harness::new();
    h.add_log(
        "a.log",
        &header("2026-10-19 08:00:00+09:00", "/v/a.mp4"),
        &["-1,On", "0,Off,inferred:true", "9,Off", "10,On,ABC"],
    );

    h.reconstructor.run_batch().unwrap();
    let events = h.events();
    assert_eq!(events.len(), 1);
    assert!(events[0].ts_inferred);
    assert_eq!(events[0].ts, 0.0);
}

#[test]
fn test_clamped_split_reports_overrun() {
    let h = Harness::new();
    h.add_log(
        "a.log",
        &header("2026-10-19 08:00:00+09:00", "/v/a.mp4"),
        &["-1,On", "0,Off", "2,Off,A", "5,On,B"],
    );

    let report = h.reconstructor.run_batch().unwrap();
    assert_eq!(report.events_split, 1);
    assert_eq!(report.parts_overrun, 1);

    let spans: Vec<_> = h.events().iter().map(|e| (e.ts, e.te.unwrap())).collect();
    assert_eq!(spans, vec![(0.0, 5.0), (5.0, 10.0)]);
}

#[test]
fn test_window_with_three_codes_is_split() {
    let h = Harness::new();
    h.add_log(
        "a.log",
        &header("2026-10-19 08:00:00+09:00", "/v/a.mp4"),
        &["-1,On", "0,Off", "5,Off,A", "15,Off,B", "29,Off", "30,On,C"],
    );

    let report = h.reconstructor.run_batch().unwrap();
    assert_eq!(report.events_split, 1);
    assert_eq!(report.events_closed, 3);
    assert_eq!(report.parts_overrun, 0);

    let events = h.events();
    let spans: Vec<_> = events.iter().map(|e| (e.ts, e.te.unwrap())).collect();
    assert_eq!(spans, vec![(0.0, 10.0), (10.0, 20.0), (20.0, 30.0)]);
    let codes: Vec<_> = events.iter().map(|e| e.tracking_codes.clone()).collect();
    assert_eq!(
        codes,
        vec![vec!["A".to_string()], vec!["B".to_string()], vec!["C".to_string()]]
    );
    assert!(events.iter().all(|e| e.duration == Some(10.0)));
}

#[test]
fn test_short_window_without_code_is_noise() {
    let h = Harness::new();
    h.add_log(
        "a.log",
        &header("2026-10-19 08:00:00+09:00", "/v/a.mp4"),
        &["-1,On", "0,Off", "1,Off,boundary:[1,2,3,4]", "2,On"],
    );

    let report = h.reconstructor.run_batch().unwrap();
    assert_eq!(report.events_deleted, 1);
    assert!(h.events().is_empty());
    let detections = h
        .store
        .with_read(|conn| EventRepository::new(conn).count_detections())
        .unwrap();
    assert_eq!(detections, 0);
}

#[test]
fn test_long_window_without_code_needs_retry() {
    let h = Harness::new();
    h.add_log(
        "a.log",
        &header("2026-10-19 08:00:00+09:00", "/v/a.mp4"),
        &["-1,On", "0,Off", "3,Off,boundary:[5,5,20,20]", "9,Off", "10,On"],
    );

    let report = h.reconstructor.run_batch().unwrap();
    assert_eq!(report.events_retry, 1);

    let events = h.events();
    assert_eq!(events.len(), 1);
    assert!(events[0].retry_needed);
    assert_eq!(events[0].status, EventStatus::EmptyNeedRetry);

    let queue = h
        .store
        .with_read(|conn| EventRepository::new(conn).needing_retry(Some("cam-01")))
        .unwrap();
    assert_eq!(queue.len(), 1);

    let detections = h
        .store
        .with_read(|conn| EventRepository::new(conn).detections_for_event(events[0].id))
        .unwrap();
    assert_eq!(detections.len(), 1);
    assert!(!detections[0].success);
}

#[test]
fn test_second_batch_is_a_no_op() {
    let h = Harness::new();
    h.add_log(
        "a.log",
        &header("2026-10-19 08:00:00+09:00", "/v/a.mp4"),
        &["-1,On", "0,Off", "9,Off", "10,On,ABC123", "20,On", "21,Off", "39,Off", "40,On,DEF456"],
    );

    let first = h.reconstructor.run_batch().unwrap();
    assert_eq!(first.logs_processed, 1);
    let before = h.events();

    let second = h.reconstructor.run_batch().unwrap();
    assert_eq!(second.logs_processed, 0);
    assert_eq!(h.events(), before);
}

#[test]
fn test_events_are_ordered_and_disjoint() {
    let h = Harness::new();
    h.add_log(
        "b.log",
        &header("2026-10-19 08:05:00+09:00", "/v/b.mp4"),
        &["9,On", "10,Off", "29,Off", "30,On,C3"],
    );
    h.add_log(
        "a.log",
        &header("2026-10-19 08:00:00+09:00", "/v/a.mp4"),
        &["-1,On", "0,Off", "9,Off", "10,On,C1", "20,On", "21,Off", "39,Off", "40,On,C2"],
    );

    h.reconstructor.run_batch().unwrap();
    let events = h.events();
    assert_eq!(events.len(), 3);

    for pair in events.windows(2) {
        let end = pair[0].packing_time_end.unwrap();
        assert!(pair[0].packing_time_start < end);
        assert!(end <= pair[1].packing_time_start);
    }
    let codes: Vec<_> = events.iter().map(|e| e.tracking_codes[0].as_str()).collect();
    assert_eq!(codes, vec!["C1", "C2", "C3"]);
}

#[test]
fn test_orphaned_pending_event_is_deleted() {
    let h = Harness::new();
    h.add_log(
        "a.log",
        &header("2026-10-19 08:00:00+09:00", "/v/a.mp4"),
        &["-1,On", "0,Off"],
    );
    h.reconstructor.run_batch().unwrap();
    assert_eq!(h.events().len(), 1);

    h.add_log(
        "b.log",
        &header("2026-10-19 08:10:00+09:00", "/v/b.mp4"),
        &["3,Off"],
    );
    let report = h.reconstructor.run_batch().unwrap();
    assert_eq!(report.orphans_deleted, 1);
    assert!(h.events().is_empty());
}

#[test]
fn test_corrupt_log_is_marked_failed_and_skipped() {
    let h = Harness::new();
    let bad = h.add_log("bad.log", "garbage", &["0,Off"]);
    h.add_log(
        "a.log",
        &header("2026-10-19 08:00:00+09:00", "/v/a.mp4"),
        &["-1,On", "0,Off", "9,Off", "10,On,ABC123"],
    );

    let report = h.reconstructor.run_batch().unwrap();
    assert_eq!(report.logs_failed, 1);
    assert_eq!(report.logs_processed, 1);
    assert_eq!(h.events().len(), 1);

    let entry = h
        .store
        .with_read(|conn| LogRepository::new(conn).get(&bad))
        .unwrap()
        .unwrap();
    assert!(!entry.processed);
    assert!(entry.failed_reason.is_some());

    let again = h.reconstructor.run_batch().unwrap();
    assert_eq!(again.logs_failed, 0);
}

#[test]
fn test_unsealed_log_is_not_ingested() {
    let h = Harness::new();
    let path = h.dir.path().join("open.log");
    std::fs::write(
        &path,
        format!("{}\n-1,On\n0,Off\n", header("2026-10-19 08:00:00+09:00", "/v/a.mp4")),
    )
    .unwrap();
    let id = log_identifier(&path);
    h.store
        .with_write(|conn| LogRepository::new(conn).register(&id, "cam-01", false))
        .unwrap();

    assert_eq!(h.reconstructor.run_batch().unwrap().logs_processed, 0);

    h.store
        .with_write(|conn| LogRepository::new(conn).mark_sealed(&id))
        .unwrap();
    assert_eq!(h.reconstructor.run_batch().unwrap().logs_processed, 1);
}

#[test]
fn test_discover_registers_unknown_logs_once() {
    let h = Harness::new();
    let cam_dir = h.dir.path().join("cam-01");
    std::fs::create_dir_all(&cam_dir).unwrap();
    std::fs::write(
        cam_dir.join("cam-01_20261019_080000.log"),
        format!("{}\n-1,On\n0,Off\n9,Off\n10,On,ABC\n", header("2026-10-19 08:00:00+09:00", "/v/a.mp4")),
    )
    .unwrap();

    assert_eq!(h.reconstructor.discover(h.dir.path()).unwrap(), 1);
    assert_eq!(h.reconstructor.discover(h.dir.path()).unwrap(), 0);
    assert_eq!(h.reconstructor.run_batch().unwrap().logs_processed, 1);
}

#[test]
fn test_batch_fails_when_lock_is_held() {
    let store = Arc::new(
        Datastore::open_in_memory()
            .unwrap()
            .with_lock_timing(std::time::Duration::from_millis(5), std::time::Duration::from_millis(30)),
    );
    let reconstructor = Reconstructor::new(
        store.clone(),
        ReconstructContext::new(5.0, FixedOffset::east_opt(0).unwrap()),
    );

    let result = store.with_read(|_conn| {
        Ok::<_, StoreError>(reconstructor.run_batch())
    });
    assert!(result.unwrap().is_err());
}
