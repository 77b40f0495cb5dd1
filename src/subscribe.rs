//! Durable subscriber.
//!
//! Consumes the published WebSocket stream, turns each aircraft entry
//! into a path-sample candidate, and offers it to the store worker's
//! bounded queue. Reconnects with the shared backoff policy; a missed
//! frame is simply missed, the next tick carries the full snapshot.

use std::sync::Arc;

use anyhow::Result;
use futures::StreamExt;
use tokio_tungstenite::connect_async;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::feed::Backoff;
use crate::metrics::Metrics;
use crate::publish::PublishedFrame;
use crate::store::{PathSample, StoreHandle};

pub struct Subscriber {
    uri: String,
    store: StoreHandle,
    metrics: Arc<Metrics>,
}

impl Subscriber {
    pub fn new(uri: String, store: StoreHandle, metrics: Arc<Metrics>) -> Self {
        Self {
            uri,
            store,
            metrics,
        }
    }

    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let mut backoff = Backoff::default();

        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }

            let connected = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                c = connect_async(self.uri.as_str()) => c,
            };

            match connected {
                Ok((ws, _)) => {
                    info!(uri = %self.uri, "connected to publisher");
                    backoff.reset();

                    let (_, mut reader) = ws.split();
                    loop {
                        let incoming = tokio::select! {
                            _ = cancel.cancelled() => return Ok(()),
                            m = reader.next() => m,
                        };

                        match incoming {
                            Some(Ok(msg)) if msg.is_text() => match msg.to_text() {
                                Ok(text) => self.handle_frame(text),
                                Err(_) => self.metrics.frame_parse_failures.inc(),
                            },
                            Some(Ok(msg)) if msg.is_close() => {
                                warn!(uri = %self.uri, "publisher closed the stream");
                                break;
                            }
                            Some(Ok(_)) => {} // binary/ping/pong are ignored
                            Some(Err(e)) => {
                                warn!(uri = %self.uri, error = %e, "stream error");
                                break;
                            }
                            None => break,
                        }
                    }
                }
                Err(e) => {
                    warn!(uri = %self.uri, error = %e, "connect failed");
                }
            }

            let delay = backoff.next_delay();
            debug!(retry_in = ?delay, "reconnecting to publisher");
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn handle_frame(&self, text: &str) {
        match serde_json::from_str::<PublishedFrame>(text) {
            Ok(frame) => {
                self.metrics.frames_consumed.inc();
                debug!(aircraft = frame.aircraft.len(), "frame received");

                for ac in frame.aircraft {
                    self.store.enqueue_sample(PathSample {
                        icao: ac.icao,
                        callsign: ac.callsign,
                        ts: frame.ts,
                        lat: ac.lat,
                        lon: ac.lon,
                        alt_ft: ac.alt_ft,
                        ground_speed: ac.ground_speed,
                        track_deg: ac.track_deg,
                        vertical_rate_fpm: ac.vertical_rate_fpm,
                        kind: ac.velocity_kind,
                    });
                }
            }
            Err(e) => {
                self.metrics.frame_parse_failures.inc();
                warn!(error = %e, "frame parse failed");
            }
        }
    }
}
