//! Aircraft assembler.
//!
//! Owns the keyed table of per-aircraft track state. All mutation
//! happens on the assembler task; the rest of the process talks to it
//! through a message interface and gets value copies back. Position
//! resolution (CPR pairing, receiver-reference fallback) happens in
//! the decoder; the table merges whatever the decoder produced and
//! accounts for the fixes that never resolved.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{anyhow, Result};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::ReceiverPosition;
use crate::decode::{CprParity, DecodedMessage, Icao, VelocityKind};
use crate::feed::epoch_now;
use crate::metrics::Metrics;
use crate::store::StoreHandle;

/// Cadence of the expiry scan.
pub const EXPIRY_SCAN_INTERVAL: Duration = Duration::from_secs(5);

/// Depth of the update queue feeding the assembler task.
const UPDATE_QUEUE_DEPTH: usize = 4096;

/// Mutable per-aircraft state, owned by the table.
#[derive(Debug, Clone)]
pub struct AircraftState {
    pub icao: Icao,
    pub callsign: Option<String>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub alt_ft: Option<f64>,
    pub ground_speed: Option<f64>,
    pub track_deg: Option<f64>,
    pub vertical_rate_fpm: Option<f64>,
    pub velocity_kind: Option<VelocityKind>,
    pub first_seen: f64,
    pub last_seen: f64,
    pub assembly_complete_at: Option<f64>,

    /// Parity of the last position message that did not resolve.
    pending_cpr: Option<CprParity>,
    incomplete_counted: bool,
}

impl AircraftState {
    fn new(icao: Icao, rx_time: f64) -> Self {
        Self {
            icao,
            callsign: None,
            lat: None,
            lon: None,
            alt_ft: None,
            ground_speed: None,
            track_deg: None,
            vertical_rate_fpm: None,
            velocity_kind: None,
            first_seen: rx_time,
            last_seen: rx_time,
            assembly_complete_at: None,
            pending_cpr: None,
            incomplete_counted: false,
        }
    }

    fn is_complete(&self) -> bool {
        self.callsign.is_some()
            && self.lat.is_some()
            && self.lon.is_some()
            && self.alt_ft.is_some()
            && self.ground_speed.is_some()
            && self.track_deg.is_some()
            && self.vertical_rate_fpm.is_some()
    }
}

/// Value copy of one positioned aircraft, as handed to the publisher.
#[derive(Debug, Clone)]
pub struct TrackSnapshot {
    pub icao: Icao,
    pub callsign: Option<String>,
    pub lat: f64,
    pub lon: f64,
    pub alt_ft: Option<f64>,
    pub ground_speed: Option<f64>,
    pub track_deg: Option<f64>,
    pub vertical_rate_fpm: Option<f64>,
    pub velocity_kind: Option<VelocityKind>,
    pub last_seen: f64,
}

/// The table itself. Kept separate from the task wrapper so merge and
/// expiry logic is directly testable with synthetic clocks.
pub struct AircraftTable {
    entries: HashMap<Icao, AircraftState>,
    receiver: Option<ReceiverPosition>,
    expiry: f64,
    assembly_timeout: f64,
    metrics: std::sync::Arc<Metrics>,
}

impl AircraftTable {
    pub fn new(
        receiver: Option<ReceiverPosition>,
        expiry: Duration,
        assembly_timeout: Duration,
        metrics: std::sync::Arc<Metrics>,
    ) -> Self {
        Self {
            entries: HashMap::new(),
            receiver,
            expiry: expiry.as_secs_f64(),
            assembly_timeout: assembly_timeout.as_secs_f64(),
            metrics,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, icao: Icao) -> Option<&AircraftState> {
        self.entries.get(&icao)
    }

    /// Merges one decoded message into the table.
    pub fn apply(&mut self, msg: DecodedMessage) {
        let rx_time = msg.rx_time();
        if !rx_time.is_finite() || rx_time < 0.0 {
            error!(icao = %msg.icao(), rx_time, "dropping message with invalid timestamp");
            return;
        }

        let icao = msg.icao();
        if !self.entries.contains_key(&icao) {
            debug!(icao = %icao, "new aircraft");
            self.metrics.aircraft_created.inc();
        }
        let entry = self
            .entries
            .entry(icao)
            .or_insert_with(|| AircraftState::new(icao, rx_time));
        entry.last_seen = entry.last_seen.max(rx_time);

        match msg {
            DecodedMessage::Identification { callsign, .. } => {
                entry.callsign = Some(callsign);
            }
            DecodedMessage::AirbornePosition {
                parity,
                latitude,
                longitude,
                altitude_ft,
                ..
            } => {
                if let Some(alt) = altitude_ft {
                    entry.alt_ft = Some(alt);
                }
                Self::merge_position(
                    entry,
                    parity,
                    latitude.zip(longitude),
                    self.receiver.is_some(),
                    &self.metrics,
                );
            }
            DecodedMessage::SurfacePosition {
                parity,
                latitude,
                longitude,
                ground_speed,
                track_deg,
                ..
            } => {
                entry.alt_ft = Some(0.0);
                if let Some(gs) = ground_speed {
                    entry.ground_speed = Some(gs);
                    entry.vertical_rate_fpm = Some(0.0);
                    entry.velocity_kind = Some(VelocityKind::Surface);
                }
                if let Some(trk) = track_deg {
                    entry.track_deg = Some(trk);
                }
                Self::merge_position(
                    entry,
                    parity,
                    latitude.zip(longitude),
                    self.receiver.is_some(),
                    &self.metrics,
                );
            }
            DecodedMessage::Velocity {
                ground_speed,
                track_deg,
                vertical_rate_fpm,
                kind,
                ..
            } => {
                entry.ground_speed = Some(ground_speed);
                entry.track_deg = Some(track_deg);
                if let Some(vr) = vertical_rate_fpm {
                    entry.vertical_rate_fpm = Some(vr);
                }
                entry.velocity_kind = Some(kind);
            }
            DecodedMessage::Other { .. } => {}
        }

        if entry.assembly_complete_at.is_none() && entry.is_complete() {
            entry.assembly_complete_at = Some(entry.last_seen);
            let latency_ms = (entry.last_seen - entry.first_seen) * 1_000.0;
            self.metrics.assembly.record_complete(latency_ms);
            debug!(icao = %icao, latency_ms, "assembly complete");
        }
    }

    /// Merges a decoder-resolved position. An unresolved message is a
    /// deferral the first time; a second unresolved fix of the same
    /// parity means the replaced one can never produce a position and
    /// is counted as a CPR failure. The previous position is kept
    /// either way.
    fn merge_position(
        entry: &mut AircraftState,
        parity: CprParity,
        position: Option<(f64, f64)>,
        has_receiver: bool,
        metrics: &Metrics,
    ) {
        match position {
            Some((lat, lon)) => {
                if lat.abs() > 90.0 || lon.abs() > 180.0 || !lat.is_finite() || !lon.is_finite() {
                    metrics.cpr_failures.inc();
                    error!(icao = %entry.icao, lat, lon, "implausible position dropped");
                    return;
                }
                entry.lat = Some(lat);
                entry.lon = Some(lon);
                entry.pending_cpr = None;
            }
            None => {
                // With a receiver reference the library resolves
                // single messages, so an unresolved fix is already a
                // failure path there; without one, only a same-parity
                // replacement is.
                if entry.pending_cpr == Some(parity) && !has_receiver {
                    metrics.cpr_failures.inc();
                    debug!(icao = %entry.icao, "unpaired CPR fix replaced");
                }
                entry.pending_cpr = Some(parity);
            }
        }
    }

    /// Value copy of all eligible rows: positioned and seen recently.
    pub fn snapshot(&self, now: f64) -> Vec<TrackSnapshot> {
        self.entries
            .values()
            .filter_map(|e| {
                let (lat, lon) = (e.lat?, e.lon?);
                if now - e.last_seen > self.expiry {
                    return None;
                }
                Some(TrackSnapshot {
                    icao: e.icao,
                    callsign: e.callsign.clone(),
                    lat,
                    lon,
                    alt_ft: e.alt_ft,
                    ground_speed: e.ground_speed,
                    track_deg: e.track_deg,
                    vertical_rate_fpm: e.vertical_rate_fpm,
                    velocity_kind: e.velocity_kind,
                    last_seen: e.last_seen,
                })
            })
            .collect()
    }

    /// Expiry scan: counts assembly timeouts and evicts idle entries.
    /// Returns the evicted aircraft with their session end times.
    pub fn sweep(&mut self, now: f64) -> Vec<(Icao, f64)> {
        for entry in self.entries.values_mut() {
            if !entry.incomplete_counted
                && entry.assembly_complete_at.is_none()
                && now - entry.first_seen > self.assembly_timeout
            {
                entry.incomplete_counted = true;
                self.metrics.assembly.record_incomplete();
                debug!(icao = %entry.icao, "assembly timed out incomplete");
            }
        }

        let expiry = self.expiry;
        let expired: Vec<Icao> = self
            .entries
            .values()
            .filter(|e| now - e.last_seen > expiry)
            .map(|e| e.icao)
            .collect();

        expired
            .into_iter()
            .filter_map(|icao| {
                let entry = self.entries.remove(&icao)?;
                self.metrics.aircraft_expired.inc();
                info!(
                    icao = %icao,
                    idle = now - entry.last_seen,
                    "aircraft expired",
                );
                Some((icao, entry.last_seen))
            })
            .collect()
    }
}

enum AssemblerCommand {
    Update(Box<DecodedMessage>),
    Snapshot(oneshot::Sender<Vec<TrackSnapshot>>),
}

/// Cheap cloneable handle to the assembler task.
#[derive(Clone)]
pub struct AssemblerHandle {
    tx: mpsc::Sender<AssemblerCommand>,
}

impl AssemblerHandle {
    pub async fn update(&self, msg: DecodedMessage) -> Result<()> {
        self.tx
            .send(AssemblerCommand::Update(Box::new(msg)))
            .await
            .map_err(|_| anyhow!("assembler task stopped"))
    }

    pub async fn snapshot(&self) -> Result<Vec<TrackSnapshot>> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(AssemblerCommand::Snapshot(tx))
            .await
            .map_err(|_| anyhow!("assembler task stopped"))?;
        rx.await.map_err(|_| anyhow!("assembler task stopped"))
    }
}

/// Task wrapper around the table.
pub struct Assembler {
    table: AircraftTable,
    rx: mpsc::Receiver<AssemblerCommand>,
    /// Session-close events go here when a store worker is wired into
    /// the same process; in the split deployment this is `None` and
    /// the recorder derives session closes from the sample gap.
    store: Option<StoreHandle>,
}

impl Assembler {
    pub fn new(table: AircraftTable, store: Option<StoreHandle>) -> (Self, AssemblerHandle) {
        let (tx, rx) = mpsc::channel(UPDATE_QUEUE_DEPTH);
        (Self { table, rx, store }, AssemblerHandle { tx })
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(EXPIRY_SCAN_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,

                cmd = self.rx.recv() => match cmd {
                    Some(AssemblerCommand::Update(msg)) => self.table.apply(*msg),
                    Some(AssemblerCommand::Snapshot(reply)) => {
                        let _ = reply.send(self.table.snapshot(epoch_now()));
                    }
                    None => return,
                },

                _ = ticker.tick() => {
                    for (icao, end_time) in self.table.sweep(epoch_now()) {
                        if let Some(store) = &self.store {
                            store.close_session(icao.to_string(), end_time);
                        }
                    }
                }
            }
        }
    }
}
