//! WebSocket fan-out publisher.
//!
//! On every tick the publisher snapshots the aircraft table,
//! serializes one JSON frame, and offers it to each subscriber
//! through a capacity-1 buffer. A subscriber that cannot keep up
//! loses frames; one that stays full for several consecutive ticks,
//! or whose connection fails on write, is disconnected. Ticks missed
//! under scheduling lag are skipped, never queued.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::assembler::{AssemblerHandle, TrackSnapshot};
use crate::config::ReceiverPosition;
use crate::feed::epoch_now;
use crate::geo::{haversine_nm, NM_TO_KM};
use crate::metrics::Metrics;

/// Per-subscriber send buffer: exactly one frame, no queueing.
const SUBSCRIBER_BUFFER: usize = 1;

/// A subscriber whose buffer is full this many ticks in a row is
/// considered dead weight and disconnected.
const MAX_CONSECUTIVE_DROPS: u32 = 5;

/// One aircraft row on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishedAircraft {
    pub icao: String,
    pub callsign: Option<String>,
    pub lat: f64,
    pub lon: f64,
    pub alt_ft: Option<f64>,
    pub ground_speed: Option<f64>,
    pub track_deg: Option<f64>,
    pub vertical_rate_fpm: Option<f64>,
    pub last_seen: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub velocity_kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance_nm: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance_km: Option<f64>,
}

/// One broadcast frame: the full positioned-aircraft snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishedFrame {
    pub ts: f64,
    pub aircraft: Vec<PublishedAircraft>,
}

impl PublishedFrame {
    pub fn from_snapshot(
        rows: Vec<TrackSnapshot>,
        ts: f64,
        receiver: Option<ReceiverPosition>,
    ) -> Self {
        let aircraft = rows
            .into_iter()
            .map(|row| {
                let distance_nm =
                    receiver.map(|r| haversine_nm(row.lat, row.lon, r.lat, r.lon));
                PublishedAircraft {
                    icao: row.icao.to_string(),
                    callsign: row.callsign,
                    lat: row.lat,
                    lon: row.lon,
                    alt_ft: row.alt_ft,
                    ground_speed: row.ground_speed,
                    track_deg: row.track_deg,
                    vertical_rate_fpm: row.vertical_rate_fpm,
                    last_seen: row.last_seen,
                    velocity_kind: row.velocity_kind.map(|k| k.as_str().to_string()),
                    distance_nm,
                    distance_km: distance_nm.map(|nm| nm * NM_TO_KM),
                }
            })
            .collect();

        Self { ts, aircraft }
    }
}

struct Subscriber {
    tx: mpsc::Sender<String>,
    consecutive_drops: u32,
}

/// The fan-out task. Owns the subscriber set; connections are handed
/// to per-subscriber writer tasks that own the socket.
pub struct Publisher {
    assembler: AssemblerHandle,
    listener: Arc<TcpListener>,
    interval: Duration,
    receiver: Option<ReceiverPosition>,
    metrics: Arc<Metrics>,
}

impl Publisher {
    pub fn new(
        assembler: AssemblerHandle,
        listener: Arc<TcpListener>,
        interval: Duration,
        receiver: Option<ReceiverPosition>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            assembler,
            listener,
            interval,
            receiver,
            metrics,
        }
    }

    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let mut subscribers: HashMap<u64, Subscriber> = HashMap::new();
        let mut next_id = 0u64;

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),

                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let id = next_id;
                        next_id += 1;

                        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
                        subscribers.insert(id, Subscriber { tx, consecutive_drops: 0 });
                        self.metrics.subscribers_joined.inc();
                        info!(subscriber = id, %peer, "subscriber connected");

                        tokio::spawn(subscriber_writer(id, stream, peer, rx));
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                },

                _ = ticker.tick() => {
                    let rows = match self.assembler.snapshot().await {
                        Ok(rows) => rows,
                        Err(e) => {
                            warn!(error = %e, "snapshot unavailable, skipping tick");
                            continue;
                        }
                    };

                    let frame = PublishedFrame::from_snapshot(rows, epoch_now(), self.receiver);
                    let payload = match serde_json::to_string(&frame) {
                        Ok(p) => p,
                        Err(e) => {
                            error!(error = %e, "frame serialization failed");
                            continue;
                        }
                    };
                    self.metrics.frames_published.inc();

                    let mut dead = Vec::new();
                    for (id, sub) in subscribers.iter_mut() {
                        match sub.tx.try_send(payload.clone()) {
                            Ok(()) => sub.consecutive_drops = 0,
                            Err(TrySendError::Full(_)) => {
                                sub.consecutive_drops += 1;
                                self.metrics.publish_frame_drops.inc();
                                if sub.consecutive_drops >= MAX_CONSECUTIVE_DROPS {
                                    debug!(subscriber = id, "subscriber too slow");
                                    dead.push(*id);
                                }
                            }
                            Err(TrySendError::Closed(_)) => dead.push(*id),
                        }
                    }

                    for id in dead {
                        subscribers.remove(&id);
                        self.metrics.subscribers_dropped.inc();
                        info!(subscriber = id, "subscriber removed");
                    }
                }
            }
        }
    }
}

/// Owns one subscriber connection: performs the WebSocket handshake,
/// forwards frames from its buffer, and exits on any write error.
async fn subscriber_writer(
    id: u64,
    stream: TcpStream,
    peer: SocketAddr,
    mut rx: mpsc::Receiver<String>,
) {
    let ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!(subscriber = id, %peer, error = %e, "handshake failed");
            return;
        }
    };
    let (mut sink, mut reader) = ws.split();

    loop {
        tokio::select! {
            frame = rx.recv() => match frame {
                Some(text) => {
                    if let Err(e) = sink.send(Message::text(text)).await {
                        debug!(subscriber = id, %peer, error = %e, "write failed");
                        break;
                    }
                }
                None => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            },

            incoming = reader.next() => match incoming {
                Some(Ok(msg)) if msg.is_close() => break,
                Some(Ok(_)) => {} // inbound payloads are ignored
                Some(Err(_)) | None => break,
            },
        }
    }

    debug!(subscriber = id, %peer, "subscriber connection closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::{Icao, VelocityKind};

    fn snapshot_row() -> TrackSnapshot {
        TrackSnapshot {
            icao: Icao::new(0xabc123),
            callsign: Some("UAL123".to_string()),
            lat: 52.2572,
            lon: 3.9194,
            alt_ft: Some(38_000.0),
            ground_speed: Some(450.0),
            track_deg: Some(90.0),
            vertical_rate_fpm: Some(0.0),
            velocity_kind: Some(VelocityKind::Airborne),
            last_seen: 99.0,
        }
    }

    #[test]
    fn test_frame_json_roundtrip() {
        let frame = PublishedFrame::from_snapshot(vec![snapshot_row()], 100.0, None);
        let json = serde_json::to_string(&frame).unwrap();
        let parsed: PublishedFrame = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, frame);
        assert_eq!(parsed.aircraft[0].icao, "abc123");
        assert_eq!(parsed.aircraft[0].velocity_kind.as_deref(), Some("airborne"));
    }

    #[test]
    fn test_distance_annotation_with_receiver() {
        let receiver = ReceiverPosition { lat: 52.0, lon: 4.0 };
        let frame = PublishedFrame::from_snapshot(vec![snapshot_row()], 100.0, Some(receiver));
        let row = &frame.aircraft[0];
        let nm = row.distance_nm.unwrap();
        assert!(nm > 0.0 && nm < 30.0, "nm = {nm}");
        assert!((row.distance_km.unwrap() - nm * NM_TO_KM).abs() < 1e-9);
    }

    #[test]
    fn test_no_distance_without_receiver() {
        let frame = PublishedFrame::from_snapshot(vec![snapshot_row()], 100.0, None);
        let json = serde_json::to_string(&frame).unwrap();
        assert!(!json.contains("distance_nm"));
    }
}
