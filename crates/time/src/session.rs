//! Reference-side per-peer sessions.
//!
//! The reference is a passive timestamp source: each [`PeerSyncSession`]
//! answers its peer's pings. When probing is enabled the session also
//! measures the peer, and its estimator then models the peer's clock
//! relative to the reference (`offset = peer - reference`).
//!
//! Sessions share no mutable state. The [`SessionRegistry`] lock is only
//! held to insert, erase or look up a session handle.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::config::{ExchangeConfig, ReferenceConfig};
use crate::correlation::CorrelationTable;
use crate::error::{Result, SyncError};
use crate::estimator::{ClockModel, RoundTripEstimator};
use crate::exchange::{answer_ping, next_interval, RoundTrips, TimeoutTracker};
use crate::report::{Report, ReportHub, Subscription, SyncStatus};
use crate::time_source::SharedTimeSource;
use crate::transport::{Frame, MessageSink};
use crate::wire::{decode_pong, encode_ping, ChannelNames};

/// Identity of a connected peer as assigned by the host.
pub type PeerId = String;

/// State the reference keeps for one connected peer.
pub struct PeerSyncSession {
    peer_id: PeerId,
    channels: ChannelNames,
    exchange: ExchangeConfig,
    time_source: SharedTimeSource,
    estimator: Mutex<RoundTripEstimator>,
    pending: Mutex<CorrelationTable>,
    timeouts: Mutex<TimeoutTracker>,
    last_activity: Mutex<f64>,
    reports: ReportHub,
    closed: AtomicBool,
    prober: Mutex<Option<JoinHandle<()>>>,
}

impl PeerSyncSession {
    fn new(peer_id: PeerId, config: &ReferenceConfig, time_source: SharedTimeSource) -> Result<Self> {
        let estimator = RoundTripEstimator::new(config.estimator.clone(), time_source.clone())?;
        let created = time_source.now();
        Ok(Self {
            peer_id,
            channels: ChannelNames::new(&config.namespace),
            exchange: config.exchange.clone(),
            time_source,
            estimator: Mutex::new(estimator),
            pending: Mutex::new(CorrelationTable::new()),
            timeouts: Mutex::new(TimeoutTracker::new(config.exchange.max_consecutive_timeouts)),
            last_activity: Mutex::new(created),
            reports: ReportHub::new(),
            closed: AtomicBool::new(false),
            prober: Mutex::new(None),
        })
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn channels(&self) -> &ChannelNames {
        &self.channels
    }

    /// Answer a ping from the peer with a pong on the session's pong channel.
    pub fn handle_ping(&self, body: &[u8]) -> Result<Frame> {
        self.ensure_open()?;
        let pong = answer_ping(self.time_source.as_ref(), body)?;
        self.touch();
        Ok(Frame::new(self.channels.pong(), pong))
    }

    /// Start a reference-initiated round trip; the returned ping goes to the peer.
    pub fn begin_probe(&self) -> Result<Frame> {
        self.ensure_open()?;
        let t0 = self.time_source.now();
        let deadline = Instant::now() + self.exchange.pong_timeout();
        let id = self.pending.lock().issue(t0, deadline);
        let body = encode_ping(id, t0)?;
        Ok(Frame::new(self.channels.ping(), body))
    }

    /// Complete a probe with the peer's pong.
    ///
    /// Returns the report published for it, if any. Unknown or retired ids
    /// and pongs after removal yield `Ok(None)` and leave the model untouched.
    /// A rejected sample publishes only when it restores connectivity.
    pub fn handle_pong(&self, body: &[u8]) -> Result<Option<Report>> {
        let t3 = self.time_source.now();
        let pong = decode_pong(body)?;
        if self.is_closed() {
            debug!("dropping pong {} for closed session {}", pong.id, self.peer_id);
            return Ok(None);
        }
        self.touch();

        let report = {
            let mut pending = self.pending.lock();
            let mut timeouts = self.timeouts.lock();
            self.round_trips(&mut pending, &mut timeouts)
                .complete(&pong, t3)
        };
        if let Some(report) = report {
            self.reports.publish(report);
        }
        Ok(report)
    }

    /// Retire probes whose pong is overdue. Returns how many were retired.
    pub fn expire_probes(&self, now: Instant) -> usize {
        let (expired, degraded) = {
            let mut pending = self.pending.lock();
            let mut timeouts = self.timeouts.lock();
            self.round_trips(&mut pending, &mut timeouts).expire(now)
        };
        if let Some(report) = degraded {
            self.reports.publish(report);
        }
        expired
    }

    /// Drop the peer model if it went stale; publishes the reset report.
    pub fn check_staleness(&self) -> Option<Report> {
        let now = self.time_source.now();
        let report = self.estimator.lock().check_staleness(now)?;
        self.reports.publish(report);
        Some(report)
    }

    /// Peer clock reading for a reference time (or now). Identity until probed.
    pub fn peer_time(&self, reference_time: Option<f64>) -> f64 {
        self.estimator.lock().to_reference_time(reference_time)
    }

    /// Reference time for a peer clock reading.
    pub fn reference_time(&self, peer_time: f64) -> f64 {
        self.estimator.lock().to_local_time(Some(peer_time))
    }

    pub fn on_report<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Report) + Send + Sync + 'static,
    {
        self.reports.subscribe(callback)
    }

    /// Last emitted report, or the uninitialized sentinel.
    pub fn report(&self) -> Report {
        self.reports.last().unwrap_or_default()
    }

    pub fn model(&self) -> ClockModel {
        self.estimator.lock().model()
    }

    pub fn status(&self) -> SyncStatus {
        self.estimator.lock().status()
    }

    /// Reference time of the last message from the peer.
    pub fn last_activity(&self) -> f64 {
        *self.last_activity.lock()
    }

    pub fn outstanding_probes(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Run the periodic probe loop until the session is closed.
    pub fn spawn_prober(self: &Arc<Self>, sink: Arc<dyn MessageSink>) {
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(probe_loop(weak, sink));
        if let Some(previous) = self.prober.lock().replace(handle) {
            previous.abort();
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.pending.lock().clear();
        if let Some(prober) = self.prober.lock().take() {
            prober.abort();
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(SyncError::SessionClosed(self.peer_id.clone()));
        }
        Ok(())
    }

    fn round_trips<'a>(
        &'a self,
        pending: &'a mut CorrelationTable,
        timeouts: &'a mut TimeoutTracker,
    ) -> RoundTrips<'a> {
        RoundTrips {
            peer: &self.peer_id,
            pending,
            timeouts,
            estimator: &self.estimator,
        }
    }

    fn touch(&self) {
        *self.last_activity.lock() = self.time_source.now();
    }
}

impl fmt::Debug for PeerSyncSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerSyncSession")
            .field("peer_id", &self.peer_id)
            .field("model", &self.model())
            .field("outstanding_probes", &self.outstanding_probes())
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn probe_loop(session: Weak<PeerSyncSession>, sink: Arc<dyn MessageSink>) {
    loop {
        let interval = {
            let Some(session) = session.upgrade() else {
                break;
            };
            if session.is_closed() {
                break;
            }
            session.expire_probes(Instant::now());
            session.check_staleness();
            match session.begin_probe() {
                Ok(frame) => {
                    if let Err(err) = sink.send(frame).await {
                        warn!("failed to probe peer {}: {}", session.peer_id, err);
                    }
                }
                Err(err) => {
                    debug!("probe loop for {} stopping: {}", session.peer_id, err);
                    break;
                }
            }
            next_interval(session.status(), &session.exchange)
        };
        sleep(interval).await;
    }
}

/// Maps peer identity to its session.
pub struct SessionRegistry {
    config: ReferenceConfig,
    time_source: SharedTimeSource,
    sessions: RwLock<HashMap<PeerId, Arc<PeerSyncSession>>>,
}

impl SessionRegistry {
    pub fn new(config: ReferenceConfig, time_source: SharedTimeSource) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            time_source,
            sessions: RwLock::new(HashMap::new()),
        })
    }

    /// Create a fresh, uninitialized session. Reconnects must remove the old one first.
    pub fn add_peer(&self, peer_id: impl Into<PeerId>) -> Result<Arc<PeerSyncSession>> {
        let peer_id = peer_id.into();
        let mut sessions = self.sessions.write();
        if sessions.contains_key(&peer_id) {
            return Err(SyncError::PeerAlreadyRegistered(peer_id));
        }
        let session = Arc::new(PeerSyncSession::new(
            peer_id.clone(),
            &self.config,
            self.time_source.clone(),
        )?);
        sessions.insert(peer_id.clone(), session.clone());
        info!("clock sync session opened for {}", peer_id);
        Ok(session)
    }

    /// Detach and close a session; its outstanding correlation ids become invalid.
    pub fn remove_peer(&self, peer_id: &str) -> Option<Arc<PeerSyncSession>> {
        let session = self.sessions.write().remove(peer_id)?;
        session.close();
        info!("clock sync session closed for {}", peer_id);
        Some(session)
    }

    pub fn get(&self, peer_id: &str) -> Option<Arc<PeerSyncSession>> {
        self.sessions.read().get(peer_id).cloned()
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.sessions.read().contains_key(peer_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.sessions.read().keys().cloned().collect()
    }

    /// Close every session.
    pub fn clear(&self) {
        let drained: Vec<_> = self.sessions.write().drain().collect();
        for (_, session) in drained {
            session.close();
        }
    }

    pub fn config(&self) -> &ReferenceConfig {
        &self.config
    }
}

impl fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("namespace", &self.config.namespace)
            .field("sessions", &self.len())
            .finish()
    }
}
