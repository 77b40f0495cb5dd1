//! Passive in-process metrics.
//!
//! A single `Metrics` facade is shared by every component of a
//! process; components bump counters through it and never block on
//! it. A background task samples CPU/RSS and kernel TCP counters on a
//! fixed cadence and streams CSV rows; shutdown writes JSON snapshots
//! per kind.

pub mod assembly;
pub mod export;
pub mod netstat;
pub mod process;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use self::assembly::AssemblyCollector;
use self::export::{write_json_snapshot, CsvAppender};
use self::netstat::TcpCounters;
use self::process::{ProcSample, ProcSampler};

const SAMPLE_INTERVAL: Duration = Duration::from_secs(5);

/// Relaxed monotone counter.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// The facade handed to every component. All members are cheap and
/// contention-free on the hot path.
pub struct Metrics {
    component: &'static str,

    // Ingest side.
    pub frames_received: Counter,
    pub decode_failures: Counter,
    pub cpr_failures: Counter,
    pub aircraft_created: Counter,
    pub aircraft_expired: Counter,

    // Publisher.
    pub frames_published: Counter,
    pub publish_frame_drops: Counter,
    pub subscribers_joined: Counter,
    pub subscribers_dropped: Counter,

    // Subscriber.
    pub frames_consumed: Counter,
    pub frame_parse_failures: Counter,
    pub samples_enqueued: Counter,
    pub samples_dropped: Counter,

    // Store worker.
    pub aircraft_upserts: Counter,
    pub sessions_opened: Counter,
    pub sessions_closed: Counter,
    pub paths_inserted: Counter,
    pub batches_committed: Counter,
    pub batches_discarded: Counter,
    pub write_retries: Counter,

    pub assembly: AssemblyCollector,

    latest: Mutex<(ProcSample, TcpCounters)>,
}

impl Metrics {
    pub fn new(component: &'static str, assembly_timeout_seconds: f64) -> Arc<Self> {
        Arc::new(Self {
            component,
            frames_received: Counter::default(),
            decode_failures: Counter::default(),
            cpr_failures: Counter::default(),
            aircraft_created: Counter::default(),
            aircraft_expired: Counter::default(),
            frames_published: Counter::default(),
            publish_frame_drops: Counter::default(),
            subscribers_joined: Counter::default(),
            subscribers_dropped: Counter::default(),
            frames_consumed: Counter::default(),
            frame_parse_failures: Counter::default(),
            samples_enqueued: Counter::default(),
            samples_dropped: Counter::default(),
            aircraft_upserts: Counter::default(),
            sessions_opened: Counter::default(),
            sessions_closed: Counter::default(),
            paths_inserted: Counter::default(),
            batches_committed: Counter::default(),
            batches_discarded: Counter::default(),
            write_retries: Counter::default(),
            assembly: AssemblyCollector::new(assembly_timeout_seconds),
            latest: Mutex::new((ProcSample::default(), TcpCounters::default())),
        })
    }

    pub fn component(&self) -> &'static str {
        self.component
    }

    /// Flat counter listing used by the JSON export and the health
    /// endpoint.
    pub fn counters(&self) -> Vec<(&'static str, u64)> {
        vec![
            ("frames_received", self.frames_received.get()),
            ("decode_failures", self.decode_failures.get()),
            ("cpr_failures", self.cpr_failures.get()),
            ("aircraft_created", self.aircraft_created.get()),
            ("aircraft_expired", self.aircraft_expired.get()),
            ("frames_published", self.frames_published.get()),
            ("publish_frame_drops", self.publish_frame_drops.get()),
            ("subscribers_joined", self.subscribers_joined.get()),
            ("subscribers_dropped", self.subscribers_dropped.get()),
            ("frames_consumed", self.frames_consumed.get()),
            ("frame_parse_failures", self.frame_parse_failures.get()),
            ("samples_enqueued", self.samples_enqueued.get()),
            ("samples_dropped", self.samples_dropped.get()),
            ("aircraft_upserts", self.aircraft_upserts.get()),
            ("sessions_opened", self.sessions_opened.get()),
            ("sessions_closed", self.sessions_closed.get()),
            ("paths_inserted", self.paths_inserted.get()),
            ("batches_committed", self.batches_committed.get()),
            ("batches_discarded", self.batches_discarded.get()),
            ("write_retries", self.write_retries.get()),
            ("incomplete_assembly", self.assembly.incomplete_count()),
            ("completed_assembly", self.assembly.completed_count()),
        ]
    }

    /// Spawns the 5 s resource sampler streaming CSV rows under `dir`.
    pub fn spawn_sampler(
        self: &Arc<Self>,
        dir: PathBuf,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let metrics = Arc::clone(self);

        tokio::spawn(async move {
            let mut sampler = ProcSampler::new();
            let mut ticker = tokio::time::interval(SAMPLE_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            let mut proc_csv = CsvAppender::create(
                &dir,
                metrics.component,
                "process",
                &["ts", "cpu_percent", "rss_mb"],
            )
            .map_err(|e| warn!(error = %e, "process CSV disabled"))
            .ok();
            let mut tcp_csv = CsvAppender::create(
                &dir,
                metrics.component,
                "tcp",
                &["ts", "retransmits", "out_of_order", "listen_drops"],
            )
            .map_err(|e| warn!(error = %e, "tcp CSV disabled"))
            .ok();

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let now = crate::feed::epoch_now();
                        let proc = sampler.sample();
                        let tcp = netstat::read();
                        *metrics.latest.lock() = (proc, tcp);

                        if let Some(csv) = proc_csv.as_mut() {
                            if let Err(e) = csv.append(&[
                                format!("{now:.3}"),
                                format!("{:.2}", proc.cpu_percent),
                                format!("{:.2}", proc.rss_mb),
                            ]) {
                                debug!(error = %e, "process CSV append failed");
                            }
                        }
                        if let Some(csv) = tcp_csv.as_mut() {
                            if let Err(e) = csv.append(&[
                                format!("{now:.3}"),
                                tcp.retransmits.to_string(),
                                tcp.out_of_order.to_string(),
                                tcp.listen_drops.to_string(),
                            ]) {
                                debug!(error = %e, "tcp CSV append failed");
                            }
                        }
                    }
                }
            }
        })
    }

    /// Writes the shutdown JSON artifacts: one file per kind.
    pub fn export_shutdown(&self, dir: &Path) -> Result<()> {
        let counters: serde_json::Map<String, serde_json::Value> = self
            .counters()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.into()))
            .collect();
        write_json_snapshot(dir, self.component, "counters", &counters.into())?;

        write_json_snapshot(
            dir,
            self.component,
            "assembly",
            &serde_json::to_value(self.assembly.snapshot())?,
        )?;

        let (proc, tcp) = *self.latest.lock();
        write_json_snapshot(dir, self.component, "process", &serde_json::to_value(proc)?)?;
        write_json_snapshot(dir, self.component, "tcp", &serde_json::to_value(tcp)?)?;

        Ok(())
    }
}
