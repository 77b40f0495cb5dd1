//! Process orchestration.
//!
//! Two agents mirror the two deployable halves of the pipeline: the
//! publisher (feed → decoder → assembler → fan-out) and the recorder
//! (subscriber → store worker). Each wires channels, spawns
//! supervised tasks under one cancellation token, and tears down with
//! a bounded grace period.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, trace, warn};

use crate::assembler::{AircraftTable, Assembler, AssemblerHandle};
use crate::config::Config;
use crate::decode::Decoder;
use crate::feed::FrameSource;
use crate::health;
use crate::metrics::Metrics;
use crate::publish::Publisher;
use crate::store::{self, StoreHandle, StoreTuning};
use crate::subscribe::Subscriber;
use crate::supervisor::spawn_supervised;

/// Hard ceiling on graceful teardown before tasks are abandoned.
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Ingest + assembly + fan-out.
pub struct PublisherAgent {
    cfg: Config,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl PublisherAgent {
    pub fn new(cfg: Config) -> Self {
        let metrics = Metrics::new("publisher", cfg.assembly_timeout.as_secs_f64());
        Self {
            cfg,
            metrics,
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
        }
    }

    /// Root token; cancelled internally when a component exhausts its
    /// fault budget.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn start(&mut self) -> Result<()> {
        if let Some(task) = health::serve(
            self.cfg.health_port,
            Arc::clone(&self.metrics),
            self.cancel.child_token(),
        )
        .await?
        {
            self.tasks.push(task);
        }

        self.tasks.push(
            self.metrics
                .spawn_sampler(self.cfg.metrics_dir.clone(), self.cancel.child_token()),
        );

        // The assembler task owns the aircraft table; everything else
        // goes through its handle.
        let table = AircraftTable::new(
            self.cfg.receiver,
            self.cfg.expiry,
            self.cfg.assembly_timeout,
            Arc::clone(&self.metrics),
        );
        let (assembler, handle) = Assembler::new(table, None);
        self.tasks
            .push(tokio::spawn(assembler.run(self.cancel.child_token())));

        // Ingest loop: frame source → decoder → assembler.
        {
            let host = self.cfg.dump1090_host.clone();
            let port = self.cfg.dump1090_raw_port;
            let receiver = self.cfg.receiver;
            let assembler = handle.clone();
            let metrics = Arc::clone(&self.metrics);
            let child = self.cancel.child_token();
            self.tasks.push(spawn_supervised(
                "ingest",
                self.cancel.child_token(),
                self.cancel.clone(),
                move || {
                    run_ingest(
                        host.clone(),
                        port,
                        receiver,
                        assembler.clone(),
                        Arc::clone(&metrics),
                        child.clone(),
                    )
                },
            ));
        }

        // Fan-out: the bind itself is a fatal init failure.
        let listener = TcpListener::bind(("0.0.0.0", self.cfg.ws_port))
            .await
            .with_context(|| format!("binding publisher on port {}", self.cfg.ws_port))?;
        let listener = Arc::new(listener);
        info!(port = self.cfg.ws_port, "publisher listening");

        {
            let interval = self.cfg.publish_interval;
            let receiver = self.cfg.receiver;
            let metrics = Arc::clone(&self.metrics);
            let child = self.cancel.child_token();
            self.tasks.push(spawn_supervised(
                "publisher",
                self.cancel.child_token(),
                self.cancel.clone(),
                move || {
                    Publisher::new(
                        handle.clone(),
                        Arc::clone(&listener),
                        interval,
                        receiver,
                        Arc::clone(&metrics),
                    )
                    .run(child.clone())
                },
            ));
        }

        info!("publisher agent started");
        Ok(())
    }

    pub async fn stop(&mut self) -> Result<()> {
        self.cancel.cancel();
        join_with_timeout(std::mem::take(&mut self.tasks)).await;

        if let Err(e) = self.metrics.export_shutdown(&self.cfg.metrics_dir) {
            warn!(error = %e, "metrics export failed");
        }

        info!("publisher agent stopped");
        Ok(())
    }
}

/// Subscriber + single-writer persistence.
pub struct RecorderAgent {
    cfg: Config,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
    tasks: Vec<tokio::task::JoinHandle<()>>,
    store: Option<(StoreHandle, std::thread::JoinHandle<()>)>,
}

impl RecorderAgent {
    pub fn new(cfg: Config) -> Self {
        let metrics = Metrics::new("recorder", cfg.assembly_timeout.as_secs_f64());
        Self {
            cfg,
            metrics,
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
            store: None,
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn start(&mut self) -> Result<()> {
        if let Some(task) = health::serve(
            self.cfg.health_port,
            Arc::clone(&self.metrics),
            self.cancel.child_token(),
        )
        .await?
        {
            self.tasks.push(task);
        }

        self.tasks.push(
            self.metrics
                .spawn_sampler(self.cfg.metrics_dir.clone(), self.cancel.child_token()),
        );

        // An unopenable database is a fatal init failure.
        let tuning = StoreTuning {
            save_interval: self.cfg.save_interval,
            session_gap: self.cfg.session_gap,
            ..StoreTuning::default()
        };
        let (store_handle, store_join) = store::spawn(
            &self.cfg.db_path,
            tuning,
            self.cfg.persist_queue_capacity,
            Arc::clone(&self.metrics),
        )?;

        {
            let uri = self.cfg.ws_uri.clone();
            let store = store_handle.clone();
            let metrics = Arc::clone(&self.metrics);
            let child = self.cancel.child_token();
            self.tasks.push(spawn_supervised(
                "subscriber",
                self.cancel.child_token(),
                self.cancel.clone(),
                move || {
                    Subscriber::new(uri.clone(), store.clone(), Arc::clone(&metrics))
                        .run(child.clone())
                },
            ));
        }

        self.store = Some((store_handle, store_join));

        info!("recorder agent started");
        Ok(())
    }

    pub async fn stop(&mut self) -> Result<()> {
        self.cancel.cancel();
        join_with_timeout(std::mem::take(&mut self.tasks)).await;

        // Stop the writer last so the final samples are flushed.
        if let Some((handle, join)) = self.store.take() {
            handle.shutdown();
            tokio::task::spawn_blocking(move || {
                if join.join().is_err() {
                    warn!("store worker panicked during shutdown");
                }
            })
            .await
            .ok();
        }

        if let Err(e) = self.metrics.export_shutdown(&self.cfg.metrics_dir) {
            warn!(error = %e, "metrics export failed");
        }

        info!("recorder agent stopped");
        Ok(())
    }
}

async fn run_ingest(
    host: String,
    port: u16,
    receiver: Option<crate::config::ReceiverPosition>,
    assembler: AssemblerHandle,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
) -> Result<()> {
    let mut source = FrameSource::new(host, port);
    // The decoder's CPR pairing state lives on this task alone.
    let mut decoder = Decoder::new(receiver);

    while let Some((hex, rx_time)) = source.next_frame(&cancel).await {
        metrics.frames_received.inc();
        match decoder.decode(&hex, rx_time) {
            Ok(msg) => assembler.update(msg).await?,
            Err(e) => {
                metrics.decode_failures.inc();
                trace!(frame = %hex, error = %e, "frame dropped");
            }
        }
    }

    Ok(())
}

/// Waits for spawned tasks inside the grace window; whatever is still
/// running afterwards is abandoned (the process is about to exit).
async fn join_with_timeout(tasks: Vec<tokio::task::JoinHandle<()>>) {
    let all = futures::future::join_all(tasks);
    if tokio::time::timeout(STOP_TIMEOUT, all).await.is_err() {
        warn!("graceful shutdown window elapsed, abandoning remaining tasks");
    }
}
