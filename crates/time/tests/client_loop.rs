//! Client Exchange Loop Integration Test
//!
//! Runs a [`ClockSyncClient`] against an in-process [`SyncReference`]
//! wired through channels, plus an unresponsive reference for the
//! timeout path.

use metronome_time::exchange::answer_ping;
use metronome_time::wire::{decode_ping, encode_pong};
use metronome_time::{
    ClientConfig, ClientOptions, ClockSyncClient, Connectivity, ExchangeConfig, Frame,
    MonotonicClock, OffsetClock, ReferenceOptions, Report, SyncError, SyncReference, SyncStatus,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const REFERENCE_OFFSET: f64 = 0.25;

fn fast_exchange() -> ExchangeConfig {
    ExchangeConfig {
        training_interval_ms: 5,
        sync_interval_ms: 20,
        pong_timeout_ms: 500,
        max_consecutive_timeouts: 3,
    }
}

/// Spawn a reference that answers every frame the client sends.
fn spawn_reference(
    mut outbound: mpsc::UnboundedReceiver<Frame>,
    inbound: mpsc::UnboundedSender<Frame>,
) -> JoinHandle<()> {
    let clock = Arc::new(OffsetClock::new(MonotonicClock::shared(), REFERENCE_OFFSET));
    let reference = SyncReference::new(ReferenceOptions::new(clock)).unwrap();
    let (unused_tx, _unused_rx) = mpsc::unbounded_channel::<Frame>();
    reference.on_peer_connected("peer", Arc::new(unused_tx)).unwrap();

    tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            if let Ok(Some(reply)) = reference.handle_frame("peer", &frame) {
                if inbound.send(reply).is_err() {
                    break;
                }
            }
        }
    })
}

#[tokio::test]
async fn client_synchronizes_against_reference() {
    let config = ClientConfig {
        exchange: fast_exchange(),
        ..ClientConfig::default()
    };
    let client = ClockSyncClient::new(
        ClientOptions::new(MonotonicClock::shared()).with_config(config),
    )
    .unwrap();

    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    let reference = spawn_reference(out_rx, in_tx);

    client.start(Arc::new(out_tx), in_rx).await.unwrap();
    assert!(client.status().is_initialized());
    let (idle_tx, _idle_rx) = mpsc::unbounded_channel::<Frame>();
    let (_idle_in_tx, idle_in_rx) = mpsc::unbounded_channel::<Frame>();
    assert!(matches!(
        client.start(Arc::new(idle_tx), idle_in_rx).await,
        Err(SyncError::AlreadyRunning)
    ));

    let synced = tokio::time::timeout(Duration::from_secs(10), async {
        while client.status() != SyncStatus::Sync {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(synced.is_ok(), "client never reached sync: {:?}", client);

    let report = client.get_report();
    assert!((report.offset - REFERENCE_OFFSET).abs() < 0.01, "offset {}", report.offset);
    assert!(report.confidence >= 0.75);
    assert_eq!(report.connectivity, Connectivity::Healthy);

    let local = report.timestamp;
    let sync_time = client.get_reference_time(Some(local));
    assert!((sync_time - local - REFERENCE_OFFSET).abs() < 0.01);
    assert!((client.get_local_time(Some(sync_time)) - local).abs() < 1e-9);

    client.stop().await;
    assert!(!client.is_running());
    assert_eq!(client.get_report().status, SyncStatus::Sync, "stop keeps the last report");
    reference.abort();
}

#[tokio::test]
async fn report_callbacks_see_every_update() {
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel::<Report>();
    let options = ClientOptions::new(MonotonicClock::shared())
        .with_config(ClientConfig {
            exchange: fast_exchange(),
            ..ClientConfig::default()
        })
        .with_on_report(move |report| {
            let _ = seen_tx.send(*report);
        });
    let client = ClockSyncClient::new(options).unwrap();

    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    let reference = spawn_reference(out_rx, in_tx);
    client.start(Arc::new(out_tx), in_rx).await.unwrap();

    let first = seen_rx.recv().await.unwrap();
    assert_eq!(first.status, SyncStatus::Training);
    assert_eq!(first.accepted, 1);

    client.stop().await;
    reference.abort();
}

#[tokio::test(start_paused = true)]
async fn unanswered_pings_degrade_connectivity() {
    let (degraded_tx, mut degraded_rx) = mpsc::unbounded_channel::<Report>();
    let client = Arc::new(
        ClockSyncClient::new(
            ClientOptions::new(MonotonicClock::shared()).with_config(ClientConfig {
                exchange: fast_exchange(),
                ..ClientConfig::default()
            }),
        )
        .unwrap(),
    );
    let _subscription = client.on_report(move |report| {
        if report.connectivity == Connectivity::Degraded {
            let _ = degraded_tx.send(*report);
        }
    });

    // pings go nowhere and nothing ever comes back
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Frame>();
    let (_in_tx, in_rx) = mpsc::unbounded_channel::<Frame>();
    let starter = {
        let client = client.clone();
        tokio::spawn(async move { client.start(Arc::new(out_tx), in_rx).await })
    };

    let report = tokio::time::timeout(Duration::from_secs(60), degraded_rx.recv())
        .await
        .expect("connectivity never degraded")
        .unwrap();
    assert_eq!(report.status, SyncStatus::Uninitialized);
    assert_eq!(client.get_report().connectivity, Connectivity::Degraded);

    // the loop keeps pinging while degraded
    while out_rx.try_recv().is_ok() {}
    let next = tokio::time::timeout(Duration::from_secs(10), out_rx.recv())
        .await
        .expect("no ping after degrading")
        .unwrap();
    assert_eq!(next.channel, "sync:ping");
    assert!(client.is_running());

    client.stop().await;
    assert!(matches!(starter.await.unwrap(), Err(SyncError::Stopped)));
}

#[tokio::test(start_paused = true)]
async fn stray_and_duplicate_pongs_produce_no_report() {
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel::<Report>();
    let client = Arc::new(
        ClockSyncClient::new(
            ClientOptions::new(MonotonicClock::shared())
                .with_config(ClientConfig {
                    exchange: fast_exchange(),
                    ..ClientConfig::default()
                })
                .with_on_report(move |report| {
                    let _ = seen_tx.send(*report);
                }),
        )
        .unwrap(),
    );

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Frame>();
    let (in_tx, in_rx) = mpsc::unbounded_channel::<Frame>();
    let starter = {
        let client = client.clone();
        tokio::spawn(async move { client.start(Arc::new(out_tx), in_rx).await })
    };

    let ping_frame = out_rx.recv().await.unwrap();
    let ping = decode_ping(&ping_frame.body).unwrap();
    let reference_clock = OffsetClock::new(MonotonicClock::shared(), REFERENCE_OFFSET);
    let genuine = answer_ping(&reference_clock, &ping_frame.body).unwrap();
    let stray = encode_pong(ping.id.wrapping_add(1_000), ping.t0, 1.0, 1.0).unwrap();
    let forged = encode_pong(ping.id, ping.t0 - 1.0, 1.0, 1.0).unwrap();

    for body in [stray, forged, genuine.clone(), genuine] {
        in_tx.send(Frame::new("sync:pong", body)).unwrap();
    }
    starter.await.unwrap().unwrap();

    // let the loop drain every queued frame
    tokio::time::sleep(Duration::from_millis(1)).await;

    let first = seen_rx.recv().await.unwrap();
    assert_eq!(first.accepted, 1);
    assert!(seen_rx.try_recv().is_err(), "only the genuine pong may report");
    let report = client.get_report();
    assert_eq!((report.accepted, report.rejected), (1, 0));

    client.stop().await;
}
