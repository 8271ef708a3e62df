//! Reference Session Integration Test
//!
//! Drives per-peer sessions by hand with a manual reference clock and
//! simulated peer clocks, covering convergence, peer isolation, stale
//! correlation ids and reconnects.

use metronome_time::exchange::answer_ping;
use metronome_time::wire::{decode_ping, encode_pong};
use metronome_time::{
    ManualClock, OffsetClock, PeerSyncSession, ReferenceConfig, ReferenceOptions,
    SharedTimeSource, SyncReference, SyncStatus, TimeSource,
};
use std::sync::Arc;

const ONE_WAY: f64 = 0.005;

fn reference_with_clock() -> (SyncReference, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(100.0));
    let config = ReferenceConfig {
        probe_peers: true,
        ..ReferenceConfig::default()
    };
    let reference =
        SyncReference::new(ReferenceOptions::new(clock.clone()).with_config(config)).unwrap();
    (reference, clock)
}

/// One probe round trip with symmetric one-way latency.
fn round_trip(
    session: &PeerSyncSession,
    reference_clock: &ManualClock,
    peer_clock: &dyn TimeSource,
) -> Option<metronome_time::Report> {
    let ping = session.begin_probe().unwrap();
    reference_clock.advance(ONE_WAY);
    let pong = answer_ping(peer_clock, &ping.body).unwrap();
    reference_clock.advance(ONE_WAY);
    session.handle_pong(&pong).unwrap()
}

fn peer_clock(reference: &Arc<ManualClock>, offset: f64) -> OffsetClock {
    let base: SharedTimeSource = reference.clone();
    OffsetClock::new(base, offset)
}

#[test]
fn session_converges_on_constant_offset() {
    let (reference, clock) = reference_with_clock();
    let session = reference.registry().add_peer("peer-a").unwrap();
    let peer = peer_clock(&clock, 0.2);

    let mut last = None;
    for _ in 0..10 {
        last = round_trip(&session, &clock, &peer);
        clock.advance(0.25);
    }

    let report = last.expect("every sample should be accepted");
    assert_eq!(report.status, SyncStatus::Sync);
    assert!((report.offset - 0.2).abs() < 1e-6, "offset {}", report.offset);
    assert!((report.round_trip - 2.0 * ONE_WAY).abs() < 1e-6);
    assert!(report.drift.abs() < 1e-6);
    assert!(report.confidence >= 0.75);
    assert_eq!(report.accepted, 10);

    let at = clock.now();
    assert!((session.peer_time(Some(at)) - peer.now()).abs() < 1e-6);
    assert!((session.reference_time(peer.now()) - at).abs() < 1e-6);
}

#[test]
fn peers_are_isolated() {
    let (reference, clock) = reference_with_clock();
    let fast = reference.registry().add_peer("fast").unwrap();
    let slow = reference.registry().add_peer("slow").unwrap();
    let fast_clock = peer_clock(&clock, 0.5);
    let slow_clock = peer_clock(&clock, -0.3);

    for _ in 0..10 {
        round_trip(&fast, &clock, &fast_clock);
        round_trip(&slow, &clock, &slow_clock);
        clock.advance(0.25);
    }

    assert!((fast.report().offset - 0.5).abs() < 1e-6);
    assert!((slow.report().offset + 0.3).abs() < 1e-6);
    assert_eq!(fast.report().accepted, 10);
    assert_eq!(slow.report().accepted, 10);
}

#[test]
fn pong_with_unknown_id_changes_nothing() {
    let (reference, clock) = reference_with_clock();
    let session = reference.registry().add_peer("peer-a").unwrap();

    let ping = session.begin_probe().unwrap();
    let probe = decode_ping(&ping.body).unwrap();
    let forged = encode_pong(probe.id.wrapping_add(7), probe.t0, 1.0, 1.0).unwrap();

    assert!(session.handle_pong(&forged).unwrap().is_none());
    assert_eq!(session.status(), SyncStatus::Uninitialized);
    assert_eq!(session.outstanding_probes(), 1);

    // the genuine pong still completes
    let peer = peer_clock(&clock, 0.0);
    let pong = answer_ping(&peer, &ping.body).unwrap();
    assert!(session.handle_pong(&pong).unwrap().is_some());
    assert_eq!(session.status(), SyncStatus::Training);
}

#[test]
fn duplicate_pong_is_ignored() {
    let (reference, clock) = reference_with_clock();
    let session = reference.registry().add_peer("peer-a").unwrap();
    let peer = peer_clock(&clock, 0.1);

    let ping = session.begin_probe().unwrap();
    let pong = answer_ping(&peer, &ping.body).unwrap();
    assert!(session.handle_pong(&pong).unwrap().is_some());
    assert!(session.handle_pong(&pong).unwrap().is_none());
    assert_eq!(session.report().accepted, 1);
}

#[test]
fn reconnect_forgets_previous_model() {
    let (reference, clock) = reference_with_clock();
    let session = reference.registry().add_peer("peer-a").unwrap();
    let peer = peer_clock(&clock, 0.2);
    for _ in 0..10 {
        round_trip(&session, &clock, &peer);
        clock.advance(0.25);
    }
    assert_eq!(session.status(), SyncStatus::Sync);

    // a probe in flight across the disconnect must not reach the new session
    let stale_ping = session.begin_probe().unwrap();
    let stale_pong = answer_ping(&peer, &stale_ping.body).unwrap();

    assert!(reference.on_peer_disconnected("peer-a"));
    assert!(!reference.registry().contains("peer-a"));
    assert!(session.is_closed());
    assert!(session.handle_pong(&stale_pong).unwrap().is_none());

    let fresh = reference.registry().add_peer("peer-a").unwrap();
    assert_eq!(fresh.status(), SyncStatus::Uninitialized);
    assert!(fresh.handle_pong(&stale_pong).unwrap().is_none());
    assert_eq!(fresh.report(), metronome_time::Report::uninitialized());
}

#[test]
fn closed_session_refuses_pings() {
    let (reference, _clock) = reference_with_clock();
    let session = reference.registry().add_peer("peer-a").unwrap();
    reference.stop();
    assert!(reference.registry().is_empty());
    let ping = metronome_time::wire::encode_ping(1, 0.0).unwrap();
    assert!(session.handle_ping(&ping).is_err());
}
