//! Publisher/subscriber behavior over real localhost sockets: tick
//! ordering, slow/dead subscriber handling, and the full round trip
//! into SQLite.

use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use skytrail::assembler::{AircraftTable, Assembler, AssemblerHandle};
use skytrail::decode::{CprParity, DecodedMessage, Icao, VelocityKind};
use skytrail::feed::epoch_now;
use skytrail::metrics::Metrics;
use skytrail::publish::{PublishedFrame, Publisher};
use skytrail::store::{self, StoreTuning};
use skytrail::subscribe::Subscriber;
use tokio::net::TcpListener;
use tokio_tungstenite::connect_async;
use tokio_util::sync::CancellationToken;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

async fn start_pipeline(
    tick: Duration,
) -> (AssemblerHandle, u16, CancellationToken, Arc<Metrics>) {
    let metrics = Metrics::new("publisher", 120.0);
    let table = AircraftTable::new(
        None,
        Duration::from_secs(120),
        Duration::from_secs(120),
        Arc::clone(&metrics),
    );
    let (assembler, handle) = Assembler::new(table, None);

    let cancel = CancellationToken::new();
    tokio::spawn(assembler.run(cancel.clone()));

    let listener = Arc::new(TcpListener::bind("127.0.0.1:0").await.unwrap());
    let port = listener.local_addr().unwrap().port();
    let publisher = Publisher::new(
        handle.clone(),
        listener,
        tick,
        None,
        Arc::clone(&metrics),
    );
    tokio::spawn(publisher.run(cancel.clone()));

    (handle, port, cancel, metrics)
}

/// One positioned aircraft (the published reference CPR pair) and one
/// that only ever identified itself.
async fn seed_aircraft(handle: &AssemblerHandle) {
    let now = epoch_now();
    let icao = Icao::new(0xabc123);

    handle
        .update(DecodedMessage::Identification {
            icao,
            callsign: "UAL123".to_string(),
            rx_time: now,
        })
        .await
        .unwrap();
    handle
        .update(DecodedMessage::AirbornePosition {
            icao,
            parity: CprParity::Odd,
            cell_lat: 74_158,
            cell_lon: 50_194,
            latitude: None,
            longitude: None,
            altitude_ft: Some(38_000.0),
            rx_time: now + 0.1,
        })
        .await
        .unwrap();
    handle
        .update(DecodedMessage::AirbornePosition {
            icao,
            parity: CprParity::Even,
            cell_lat: 93_000,
            cell_lon: 51_372,
            latitude: Some(52.257_202),
            longitude: Some(3.919_372),
            altitude_ft: Some(38_000.0),
            rx_time: now + 0.2,
        })
        .await
        .unwrap();
    handle
        .update(DecodedMessage::Velocity {
            icao,
            ground_speed: 450.0,
            track_deg: 90.0,
            vertical_rate_fpm: Some(0.0),
            kind: VelocityKind::Airborne,
            rx_time: now + 0.3,
        })
        .await
        .unwrap();

    handle
        .update(DecodedMessage::Identification {
            icao: Icao::new(0x999999),
            callsign: "NOPOS1".to_string(),
            rx_time: now,
        })
        .await
        .unwrap();

    // The command queue is FIFO, so a snapshot reply here means every
    // update above has been applied.
    let snap = handle.snapshot().await.unwrap();
    assert_eq!(snap.len(), 1, "exactly one aircraft has a position");
}

async fn next_frame(
    read: &mut (impl Stream<Item = Result<tokio_tungstenite::tungstenite::Message, tokio_tungstenite::tungstenite::Error>>
          + Unpin),
) -> PublishedFrame {
    loop {
        let msg = tokio::time::timeout(RECV_TIMEOUT, read.next())
            .await
            .expect("frame within timeout")
            .expect("stream open")
            .expect("read ok");
        if msg.is_text() {
            return serde_json::from_str(msg.to_text().unwrap()).unwrap();
        }
    }
}

#[tokio::test]
async fn frames_arrive_in_tick_order_with_positioned_aircraft_only() {
    let (handle, port, cancel, _metrics) = start_pipeline(Duration::from_millis(50)).await;
    seed_aircraft(&handle).await;

    let (ws, _) = connect_async(format!("ws://127.0.0.1:{port}"))
        .await
        .unwrap();
    let (_, mut read) = ws.split();

    let mut last_ts = 0.0;
    for _ in 0..5 {
        let frame = next_frame(&mut read).await;
        assert!(frame.ts >= last_ts, "frames must arrive in tick order");
        last_ts = frame.ts;

        // Only the positioned aircraft is on the wire.
        assert_eq!(frame.aircraft.len(), 1);
        let ac = &frame.aircraft[0];
        assert_eq!(ac.icao, "abc123");
        assert_eq!(ac.callsign.as_deref(), Some("UAL123"));
        assert!((ac.lat - 52.25720).abs() < 1e-4);
        assert!((ac.lon - 3.91937).abs() < 1e-4);
    }

    cancel.cancel();
}

#[tokio::test]
async fn dead_subscriber_is_removed_and_stream_continues() {
    let (handle, port, cancel, metrics) = start_pipeline(Duration::from_millis(50)).await;
    seed_aircraft(&handle).await;

    // A subscriber that handshakes and immediately goes away.
    let (dead, _) = connect_async(format!("ws://127.0.0.1:{port}"))
        .await
        .unwrap();
    drop(dead);

    let (ws, _) = connect_async(format!("ws://127.0.0.1:{port}"))
        .await
        .unwrap();
    let (_, mut read) = ws.split();

    for _ in 0..5 {
        next_frame(&mut read).await;
    }

    // The dead connection gets noticed and removed while the healthy
    // stream keeps flowing.
    tokio::time::timeout(RECV_TIMEOUT, async {
        while metrics.subscribers_dropped.get() < 1 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("dead subscriber should be removed");

    next_frame(&mut read).await;
    assert!(metrics.frames_published.get() >= 6);

    cancel.cancel();
}

#[tokio::test]
async fn full_round_trip_persists_reference_positions() {
    let (handle, port, cancel, _pub_metrics) = start_pipeline(Duration::from_millis(50)).await;
    seed_aircraft(&handle).await;

    let rec_metrics = Metrics::new("recorder", 120.0);
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("roundtrip.db");
    let (store_handle, store_join) = store::spawn(
        &db,
        StoreTuning::default(),
        256,
        Arc::clone(&rec_metrics),
    )
    .unwrap();

    let subscriber = Subscriber::new(
        format!("ws://127.0.0.1:{port}"),
        store_handle.clone(),
        Arc::clone(&rec_metrics),
    );
    let sub_task = tokio::spawn(subscriber.run(cancel.clone()));

    tokio::time::timeout(RECV_TIMEOUT, async {
        while rec_metrics.samples_enqueued.get() < 1 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("samples should reach the store queue");

    cancel.cancel();
    sub_task.await.unwrap().unwrap();

    store_handle.shutdown();
    tokio::task::spawn_blocking(move || store_join.join().unwrap())
        .await
        .unwrap();

    let conn = rusqlite::Connection::open(&db).unwrap();

    let callsign: String = conn
        .query_row(
            "SELECT callsign FROM aircraft WHERE icao = 'abc123'",
            [],
            |r| r.get(0),
        )
        .unwrap();
    assert_eq!(callsign, "UAL123");

    let open_sessions: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM flight_session WHERE end_time IS NULL",
            [],
            |r| r.get(0),
        )
        .unwrap();
    assert_eq!(open_sessions, 1);

    let (lat, lon): (f64, f64) = conn
        .query_row("SELECT lat, lon FROM path LIMIT 1", [], |r| {
            Ok((r.get(0)?, r.get(1)?))
        })
        .unwrap();
    assert!((lat - 52.257_202).abs() < 1e-5, "lat = {lat}");
    assert!((lon - 3.919_372).abs() < 1e-5, "lon = {lon}");
}
