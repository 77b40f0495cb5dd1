//! Single-writer SQLite persistence.
//!
//! One dedicated thread owns the only database handle. Everything
//! else talks to it through a bounded channel; a full queue drops the
//! newest sample rather than stalling the live stream. Writes are
//! batched into transactions committed on a timer or on batch size,
//! whichever comes first.

use std::collections::HashMap;
use std::path::Path;
use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use tracing::{debug, error, info, warn};

use crate::geo::haversine_m;
use crate::metrics::Metrics;

const SCHEMA: &str = "\
CREATE TABLE IF NOT EXISTS aircraft (
    icao TEXT PRIMARY KEY,
    callsign TEXT,
    first_seen REAL,
    last_seen REAL
);
CREATE TABLE IF NOT EXISTS flight_session (
    id TEXT PRIMARY KEY,
    aircraft_icao TEXT,
    start_time REAL,
    end_time REAL,
    FOREIGN KEY (aircraft_icao) REFERENCES aircraft(icao)
);
CREATE INDEX IF NOT EXISTS idx_flight_session_aircraft ON flight_session(aircraft_icao);
CREATE TABLE IF NOT EXISTS path (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT,
    icao TEXT,
    ts REAL,
    ts_iso TEXT,
    lat REAL,
    lon REAL,
    alt REAL,
    velocity REAL,
    track REAL,
    vertical_rate REAL,
    type TEXT,
    FOREIGN KEY (session_id) REFERENCES flight_session(id),
    FOREIGN KEY (icao) REFERENCES aircraft(icao)
);
CREATE INDEX IF NOT EXISTS idx_path_icao_ts ON path(icao, ts);
";

/// Flush the pending batch after this many operations.
pub const BATCH_MAX_OPS: usize = 64;

const WRITE_RETRIES: u32 = 2;

/// Movement thresholds below which a sample is a duplicate of the
/// previous row.
const MIN_MOVE_M: f64 = 1.0;
const MIN_ALT_DELTA_FT: f64 = 10.0;

/// Write-side tuning derived from config.
#[derive(Debug, Clone, Copy)]
pub struct StoreTuning {
    pub save_interval: Duration,
    pub session_gap: Duration,
    /// Commit cadence for pending batches.
    pub batch_interval: Duration,
    /// Delay between retries of a failed batch.
    pub retry_backoff: Duration,
}

impl Default for StoreTuning {
    fn default() -> Self {
        Self {
            save_interval: Duration::from_secs(5),
            session_gap: Duration::from_secs(120),
            batch_interval: Duration::from_millis(250),
            retry_backoff: Duration::from_millis(100),
        }
    }
}

/// One path-sample candidate.
#[derive(Debug, Clone, PartialEq)]
pub struct PathSample {
    pub icao: String,
    pub callsign: Option<String>,
    pub ts: f64,
    pub lat: f64,
    pub lon: f64,
    pub alt_ft: Option<f64>,
    pub ground_speed: Option<f64>,
    pub track_deg: Option<f64>,
    pub vertical_rate_fpm: Option<f64>,
    pub kind: Option<String>,
}

#[derive(Debug)]
pub enum StoreCommand {
    Sample(Box<PathSample>),
    CloseSession { icao: String, end_time: f64 },
    Shutdown,
}

/// Cloneable sender side of the worker queue.
#[derive(Clone)]
pub struct StoreHandle {
    tx: SyncSender<StoreCommand>,
    metrics: Arc<Metrics>,
}

impl StoreHandle {
    /// Non-blocking enqueue. A full queue drops the sample; the live
    /// stream must never wait on persistence.
    pub fn enqueue_sample(&self, sample: PathSample) {
        match self.tx.try_send(StoreCommand::Sample(Box::new(sample))) {
            Ok(()) => self.metrics.samples_enqueued.inc(),
            Err(TrySendError::Full(_)) => self.metrics.samples_dropped.inc(),
            Err(TrySendError::Disconnected(_)) => {
                debug!("store worker gone, sample discarded");
            }
        }
    }

    /// Session-close event from the assembler side.
    pub fn close_session(&self, icao: String, end_time: f64) {
        if self
            .tx
            .try_send(StoreCommand::CloseSession { icao, end_time })
            .is_err()
        {
            warn!("store queue unavailable, session close dropped");
        }
    }

    /// Asks the worker to flush and exit. Safe to call once; the
    /// paired thread handle should be joined afterwards.
    pub fn shutdown(&self) {
        let _ = self.tx.send(StoreCommand::Shutdown);
    }
}

#[derive(Debug, Clone)]
struct OpenSession {
    id: String,
    last_seen: f64,
}

#[derive(Debug, Clone, Copy)]
struct LastPath {
    ts: f64,
    lat: f64,
    lon: f64,
    alt_ft: Option<f64>,
}

/// In-memory writer state. Cloned before each transaction so a
/// discarded batch cannot leave phantom sessions or dedupe entries
/// behind.
#[derive(Debug, Clone, Default)]
struct WriterState {
    open_sessions: HashMap<String, OpenSession>,
    last_path: HashMap<String, LastPath>,
}

#[derive(Debug, Default)]
struct Deltas {
    upserts: u64,
    sessions_opened: u64,
    sessions_closed: u64,
    paths: u64,
}

/// Opens the database, applies the schema, and starts the writer
/// thread. Open failures are fatal to the caller.
pub fn spawn(
    db_path: &Path,
    tuning: StoreTuning,
    queue_capacity: usize,
    metrics: Arc<Metrics>,
) -> Result<(StoreHandle, thread::JoinHandle<()>)> {
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
    }

    let conn = Connection::open(db_path)
        .with_context(|| format!("opening database {}", db_path.display()))?;
    conn.pragma_update(None, "journal_mode", "WAL")
        .context("enabling WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")
        .context("configuring synchronous mode")?;
    conn.execute_batch(SCHEMA).context("applying schema")?;

    let (tx, rx) = sync_channel(queue_capacity);
    let handle = StoreHandle {
        tx,
        metrics: Arc::clone(&metrics),
    };

    let join = thread::Builder::new()
        .name("store-writer".to_string())
        .spawn(move || run(conn, rx, tuning, metrics))
        .context("spawning store writer thread")?;

    info!(db = %db_path.display(), "store worker started");

    Ok((handle, join))
}

fn run(conn: Connection, rx: Receiver<StoreCommand>, tuning: StoreTuning, metrics: Arc<Metrics>) {
    let mut state = WriterState::default();
    let mut batch: Vec<StoreCommand> = Vec::with_capacity(BATCH_MAX_OPS);
    let mut deadline = Instant::now() + tuning.batch_interval;

    loop {
        let timeout = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(timeout) {
            Ok(StoreCommand::Shutdown) => break,
            Ok(cmd) => {
                batch.push(cmd);
                if batch.len() >= BATCH_MAX_OPS {
                    flush(&conn, &tuning, &mut state, &mut batch, &metrics);
                    deadline = Instant::now() + tuning.batch_interval;
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if !batch.is_empty() {
                    flush(&conn, &tuning, &mut state, &mut batch, &metrics);
                }
                deadline = Instant::now() + tuning.batch_interval;
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    // Drain whatever arrived before the shutdown command.
    while let Ok(cmd) = rx.try_recv() {
        match cmd {
            StoreCommand::Shutdown => {}
            cmd => batch.push(cmd),
        }
    }
    flush(&conn, &tuning, &mut state, &mut batch, &metrics);

    // The checkpoint pragma returns a result row.
    if let Err(e) = conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(())) {
        warn!(error = %e, "final checkpoint failed");
    }

    info!("store worker stopped");
}

/// Commits the batch in one transaction, retrying transient failures.
/// After the retry budget the batch is logged and discarded; the
/// worker never aborts.
fn flush(
    conn: &Connection,
    tuning: &StoreTuning,
    state: &mut WriterState,
    batch: &mut Vec<StoreCommand>,
    metrics: &Metrics,
) {
    if batch.is_empty() {
        return;
    }

    let mut attempt = 0u32;
    loop {
        match try_apply(conn, tuning, state.clone(), batch) {
            Ok((next_state, deltas)) => {
                *state = next_state;
                metrics.batches_committed.inc();
                metrics.aircraft_upserts.add(deltas.upserts);
                metrics.sessions_opened.add(deltas.sessions_opened);
                metrics.sessions_closed.add(deltas.sessions_closed);
                metrics.paths_inserted.add(deltas.paths);
                batch.clear();
                return;
            }
            Err(e) => {
                // A failed transaction may still be open.
                let _ = conn.execute_batch("ROLLBACK");
                if attempt >= WRITE_RETRIES {
                    error!(error = %e, ops = batch.len(), "write batch discarded");
                    metrics.batches_discarded.inc();
                    batch.clear();
                    return;
                }
                attempt += 1;
                metrics.write_retries.inc();
                warn!(error = %e, attempt, "write batch failed, retrying");
                thread::sleep(tuning.retry_backoff);
            }
        }
    }
}

fn try_apply(
    conn: &Connection,
    tuning: &StoreTuning,
    mut state: WriterState,
    batch: &[StoreCommand],
) -> rusqlite::Result<(WriterState, Deltas)> {
    let mut deltas = Deltas::default();

    conn.execute_batch("BEGIN IMMEDIATE")?;
    for cmd in batch {
        apply_one(conn, tuning, &mut state, &mut deltas, cmd)?;
    }
    conn.execute_batch("COMMIT")?;

    Ok((state, deltas))
}

fn apply_one(
    conn: &Connection,
    tuning: &StoreTuning,
    state: &mut WriterState,
    deltas: &mut Deltas,
    cmd: &StoreCommand,
) -> rusqlite::Result<()> {
    match cmd {
        StoreCommand::Sample(sample) => {
            if !sample.ts.is_finite() || sample.ts < 0.0 {
                error!(icao = %sample.icao, ts = sample.ts, "dropping sample with invalid timestamp");
                return Ok(());
            }

            conn.execute(
                "INSERT INTO aircraft (icao, callsign, first_seen, last_seen)
                 VALUES (?1, ?2, ?3, ?3)
                 ON CONFLICT(icao) DO UPDATE SET
                     last_seen = MAX(last_seen, excluded.last_seen),
                     callsign = COALESCE(excluded.callsign, callsign)",
                params![sample.icao, sample.callsign, sample.ts],
            )?;
            deltas.upserts += 1;

            let session_gap = tuning.session_gap.as_secs_f64();
            let needs_new = match state.open_sessions.get_mut(&sample.icao) {
                Some(sess) if sample.ts - sess.last_seen > session_gap => {
                    conn.execute(
                        "UPDATE flight_session SET end_time = ?1 WHERE id = ?2",
                        params![sess.last_seen, sess.id],
                    )?;
                    deltas.sessions_closed += 1;
                    info!(
                        icao = %sample.icao,
                        session = %sess.id,
                        idle = sample.ts - sess.last_seen,
                        "session closed after gap",
                    );
                    true
                }
                Some(sess) => {
                    sess.last_seen = sess.last_seen.max(sample.ts);
                    false
                }
                None => true,
            };

            if needs_new {
                let id = uuid::Uuid::new_v4().to_string();
                conn.execute(
                    "INSERT INTO flight_session (id, aircraft_icao, start_time) VALUES (?1, ?2, ?3)",
                    params![id, sample.icao, sample.ts],
                )?;
                deltas.sessions_opened += 1;
                state.open_sessions.insert(
                    sample.icao.clone(),
                    OpenSession {
                        id,
                        last_seen: sample.ts,
                    },
                );
            }

            let worth_keeping = match state.last_path.get(&sample.icao) {
                None => true,
                Some(prev) => {
                    let moved =
                        haversine_m(prev.lat, prev.lon, sample.lat, sample.lon) > MIN_MOVE_M;
                    let climbed = match (prev.alt_ft, sample.alt_ft) {
                        (Some(a), Some(b)) => (a - b).abs() > MIN_ALT_DELTA_FT,
                        (None, None) => false,
                        _ => true,
                    };
                    let aged = sample.ts - prev.ts >= tuning.save_interval.as_secs_f64();
                    moved || climbed || aged
                }
            };

            if worth_keeping {
                let session_id = state
                    .open_sessions
                    .get(&sample.icao)
                    .map(|s| s.id.clone())
                    .unwrap_or_default();
                conn.execute(
                    "INSERT INTO path (session_id, icao, ts, ts_iso, lat, lon, alt,
                                       velocity, track, vertical_rate, type)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                    params![
                        session_id,
                        sample.icao,
                        sample.ts,
                        iso8601(sample.ts),
                        sample.lat,
                        sample.lon,
                        sample.alt_ft,
                        sample.ground_speed,
                        sample.track_deg,
                        sample.vertical_rate_fpm,
                        sample.kind,
                    ],
                )?;
                state.last_path.insert(
                    sample.icao.clone(),
                    LastPath {
                        ts: sample.ts,
                        lat: sample.lat,
                        lon: sample.lon,
                        alt_ft: sample.alt_ft,
                    },
                );
                deltas.paths += 1;
            }
        }

        StoreCommand::CloseSession { icao, end_time } => {
            if let Some(sess) = state.open_sessions.remove(icao) {
                // Never close a session before its last recorded
                // sample; publish timestamps can run ahead of the
                // assembler's last_seen.
                let end = end_time.max(sess.last_seen);
                conn.execute(
                    "UPDATE flight_session SET end_time = ?1 WHERE id = ?2",
                    params![end, sess.id],
                )?;
                deltas.sessions_closed += 1;
                info!(icao = %icao, session = %sess.id, "session closed by eviction");
            }
        }

        StoreCommand::Shutdown => {}
    }

    Ok(())
}

fn iso8601(ts: f64) -> String {
    if !ts.is_finite() {
        return String::new();
    }
    let secs = ts.trunc() as i64;
    let nanos = (ts.fract() * 1e9) as u32;
    chrono::DateTime::from_timestamp(secs, nanos)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(icao: &str, ts: f64, lat: f64, lon: f64) -> PathSample {
        PathSample {
            icao: icao.to_string(),
            callsign: Some("TEST123".to_string()),
            ts,
            lat,
            lon,
            alt_ft: Some(38_000.0),
            ground_speed: Some(450.0),
            track_deg: Some(90.0),
            vertical_rate_fpm: Some(0.0),
            kind: Some("airborne".to_string()),
        }
    }

    fn spawn_test_worker(
        path: &Path,
        capacity: usize,
    ) -> (StoreHandle, thread::JoinHandle<()>, Arc<Metrics>) {
        spawn_tuned_worker(path, capacity, StoreTuning::default())
    }

    fn spawn_tuned_worker(
        path: &Path,
        capacity: usize,
        tuning: StoreTuning,
    ) -> (StoreHandle, thread::JoinHandle<()>, Arc<Metrics>) {
        let metrics = Metrics::new("store-test", 120.0);
        let (handle, join) =
            spawn(path, tuning, capacity, Arc::clone(&metrics)).expect("spawn worker");
        (handle, join, metrics)
    }

    fn count(conn: &Connection, sql: &str) -> i64 {
        conn.query_row(sql, [], |r| r.get(0)).unwrap()
    }

    #[test]
    fn test_upsert_session_and_path() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("t.db");
        let (handle, join, metrics) = spawn_test_worker(&db, 64);

        handle.enqueue_sample(sample("abc123", 1000.0, 52.0, 4.0));
        handle.enqueue_sample(sample("abc123", 1001.0, 52.1, 4.0));
        handle.shutdown();
        join.join().unwrap();

        let conn = Connection::open(&db).unwrap();
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM aircraft"), 1);
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM flight_session"), 1);
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM path"), 2);
        assert_eq!(metrics.paths_inserted.get(), 2);

        let (callsign, first_seen, last_seen): (String, f64, f64) = conn
            .query_row(
                "SELECT callsign, first_seen, last_seen FROM aircraft WHERE icao = 'abc123'",
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .unwrap();
        assert_eq!(callsign, "TEST123");
        assert_eq!(first_seen, 1000.0);
        assert_eq!(last_seen, 1001.0);
    }

    #[test]
    fn test_duplicate_sample_is_deduplicated() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("t.db");
        let (handle, join, _metrics) = spawn_test_worker(&db, 64);

        let s = sample("abc123", 1000.0, 52.0, 4.0);
        handle.enqueue_sample(s.clone());
        handle.enqueue_sample(s.clone());
        // Same position, same altitude, within the save interval.
        handle.enqueue_sample(PathSample { ts: 1001.0, ..s });
        handle.shutdown();
        join.join().unwrap();

        let conn = Connection::open(&db).unwrap();
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM path"), 1);
        // last_seen still advanced monotonically.
        let last_seen: f64 = conn
            .query_row("SELECT last_seen FROM aircraft WHERE icao = 'abc123'", [], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(last_seen, 1001.0);
    }

    #[test]
    fn test_save_interval_forces_row_without_movement() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("t.db");
        let (handle, join, _metrics) = spawn_test_worker(&db, 64);

        let s = sample("abc123", 1000.0, 52.0, 4.0);
        handle.enqueue_sample(s.clone());
        handle.enqueue_sample(PathSample { ts: 1006.0, ..s });
        handle.shutdown();
        join.join().unwrap();

        let conn = Connection::open(&db).unwrap();
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM path"), 2);
    }

    #[test]
    fn test_session_gap_opens_second_session() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("t.db");
        let (handle, join, metrics) = spawn_test_worker(&db, 64);

        handle.enqueue_sample(sample("abc123", 1000.0, 52.0, 4.0));
        // 130 s later: past the 120 s gap.
        handle.enqueue_sample(sample("abc123", 1130.0, 52.5, 4.0));
        handle.shutdown();
        join.join().unwrap();

        let conn = Connection::open(&db).unwrap();
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM flight_session"), 2);
        assert_eq!(metrics.sessions_opened.get(), 2);
        assert_eq!(metrics.sessions_closed.get(), 1);

        let closed_end: f64 = conn
            .query_row(
                "SELECT end_time FROM flight_session WHERE end_time IS NOT NULL",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(closed_end, 1000.0);

        // Every path row falls inside its session's interval.
        let orphans = count(
            &conn,
            "SELECT COUNT(*) FROM path p
             LEFT JOIN flight_session s ON p.session_id = s.id
             WHERE s.id IS NULL
                OR p.ts < s.start_time
                OR (s.end_time IS NOT NULL AND p.ts > s.end_time)",
        );
        assert_eq!(orphans, 0);
    }

    #[test]
    fn test_close_session_event() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("t.db");
        let (handle, join, _metrics) = spawn_test_worker(&db, 64);

        handle.enqueue_sample(sample("abc123", 1000.0, 52.0, 4.0));
        handle.close_session("abc123".to_string(), 1010.0);
        handle.shutdown();
        join.join().unwrap();

        let conn = Connection::open(&db).unwrap();
        let end: f64 = conn
            .query_row("SELECT end_time FROM flight_session", [], |r| r.get(0))
            .unwrap();
        assert_eq!(end, 1010.0);
    }

    #[test]
    fn test_invalid_timestamp_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("t.db");
        let (handle, join, _metrics) = spawn_test_worker(&db, 64);

        handle.enqueue_sample(sample("abc123", -5.0, 52.0, 4.0));
        handle.enqueue_sample(sample("abc123", f64::NAN, 52.0, 4.0));
        handle.shutdown();
        join.join().unwrap();

        let conn = Connection::open(&db).unwrap();
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM aircraft"), 0);
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM path"), 0);
    }

    #[test]
    fn test_backpressure_drops_are_counted() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("t.db");
        // Tiny queue, large burst.
        let (handle, join, metrics) = spawn_test_worker(&db, 8);

        for i in 0..1000 {
            handle.enqueue_sample(sample("abc123", 1000.0 + i as f64, 52.0, 4.0));
        }
        handle.shutdown();
        join.join().unwrap();

        let enqueued = metrics.samples_enqueued.get();
        let dropped = metrics.samples_dropped.get();
        assert_eq!(enqueued + dropped, 1000);
        assert!(dropped > 0, "a burst into a capacity-8 queue must drop");

        let conn = Connection::open(&db).unwrap();
        let rows = count(&conn, "SELECT COUNT(*) FROM path");
        assert!(rows >= 1);
        assert!(rows as u64 <= enqueued);
    }

    #[test]
    fn test_busy_database_is_retried() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("t.db");

        let tuning = StoreTuning {
            batch_interval: Duration::from_millis(20),
            ..StoreTuning::default()
        };
        let (handle, join, metrics) = spawn_tuned_worker(&db, 64, tuning);

        // Grab the write lock before the sample arrives so the first
        // commit attempt is guaranteed to hit SQLITE_BUSY.
        let blocker = Connection::open(&db).unwrap();
        blocker.execute_batch("BEGIN IMMEDIATE").unwrap();
        let release = thread::spawn(move || {
            thread::sleep(Duration::from_millis(150));
            blocker.execute_batch("COMMIT").unwrap();
        });

        handle.enqueue_sample(sample("abc123", 1000.0, 52.0, 4.0));
        release.join().unwrap();
        // Leave room for the retry that lands after the lock clears.
        thread::sleep(Duration::from_millis(300));

        handle.shutdown();
        join.join().unwrap();

        let conn = Connection::open(&db).unwrap();
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM path"), 1);
        assert!(metrics.write_retries.get() >= 1);
        assert_eq!(metrics.batches_discarded.get(), 0);
    }

    #[test]
    fn test_iso8601_format() {
        let iso = iso8601(1_700_000_000.5);
        assert!(iso.starts_with("2023-11-14T22:13:20.5"), "iso = {iso}");
        assert_eq!(iso8601(f64::NAN), "");
    }
}
