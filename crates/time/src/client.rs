//! Peer-side clock synchronization client.
//!
//! One client per peer process. [`ClockSyncClient::start`] spawns a single
//! task that pings the reference, matches pongs by correlation id and feeds
//! the resulting round trips to the estimator. The handle stays usable from
//! any thread to map times and read reports.

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::correlation::CorrelationTable;
use crate::error::{Result, SyncError};
use crate::estimator::RoundTripEstimator;
use crate::exchange::{answer_ping, next_interval, RoundTrips, TimeoutTracker};
use crate::report::{Report, ReportHub, Subscription, SyncStatus};
use crate::time_source::{validate_time_source, SharedTimeSource};
use crate::transport::{Frame, MessageSink};
use crate::wire::{decode_pong, encode_ping, ChannelKind, ChannelNames};

/// Callback invoked with every report.
pub type ReportCallback = Arc<dyn Fn(&Report) + Send + Sync>;

/// Construction options for [`ClockSyncClient`].
#[derive(Clone, Default)]
pub struct ClientOptions {
    pub config: ClientConfig,
    /// Mandatory; construction fails without it
    pub time_source: Option<SharedTimeSource>,
    /// Registered before the first report can be emitted
    pub on_report: Option<ReportCallback>,
}

impl ClientOptions {
    pub fn new(time_source: SharedTimeSource) -> Self {
        Self {
            time_source: Some(time_source),
            ..Self::default()
        }
    }

    pub fn with_config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_on_report<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Report) + Send + Sync + 'static,
    {
        self.on_report = Some(Arc::new(callback));
        self
    }
}

struct Shared {
    config: ClientConfig,
    channels: ChannelNames,
    time_source: SharedTimeSource,
    estimator: Mutex<RoundTripEstimator>,
    reports: ReportHub,
}

struct Running {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Keeps this peer's clock mapped onto the reference clock.
pub struct ClockSyncClient {
    shared: Arc<Shared>,
    running: Mutex<Option<Running>>,
}

impl ClockSyncClient {
    pub fn new(options: ClientOptions) -> Result<Self> {
        let time_source = validate_time_source(options.time_source)?;
        options.config.validate()?;
        let estimator =
            RoundTripEstimator::new(options.config.estimator.clone(), time_source.clone())?;
        let reports = ReportHub::new();
        if let Some(callback) = options.on_report {
            let _initial = reports.subscribe(move |report| callback(report));
        }
        Ok(Self {
            shared: Arc::new(Shared {
                channels: ChannelNames::new(&options.config.namespace),
                config: options.config,
                time_source,
                estimator: Mutex::new(estimator),
                reports,
            }),
            running: Mutex::new(None),
        })
    }

    /// Start exchanging with the reference.
    ///
    /// Outbound frames go to `sink`; the host forwards every frame received
    /// from the reference into `inbound`. Resolves once the model first
    /// reaches `Training`.
    pub async fn start(
        &self,
        sink: Arc<dyn MessageSink>,
        inbound: mpsc::UnboundedReceiver<Frame>,
    ) -> Result<()> {
        let (status_tx, mut status_rx) = watch::channel(SyncStatus::Uninitialized);
        {
            let mut running = self.running.lock();
            if running.as_ref().is_some_and(|r| !r.task.is_finished()) {
                return Err(SyncError::AlreadyRunning);
            }
            self.shared.estimator.lock().reset();

            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let exchange = ExchangeLoop {
                timeouts: TimeoutTracker::new(self.shared.config.exchange.max_consecutive_timeouts),
                shared: self.shared.clone(),
                sink,
                inbound,
                shutdown: shutdown_rx,
                status: status_tx,
                pending: CorrelationTable::new(),
            };
            let task = tokio::spawn(exchange.run());
            *running = Some(Running {
                shutdown: shutdown_tx,
                task,
            });
        }
        info!("clock sync client started on {}", self.shared.channels.ping());

        status_rx
            .wait_for(|status| status.is_initialized())
            .await
            .map_err(|_| SyncError::Stopped)?;
        Ok(())
    }

    /// Halt the loop. Outstanding pings are discarded; the last report is kept.
    pub async fn stop(&self) {
        let running = self.running.lock().take();
        if let Some(running) = running {
            let _ = running.shutdown.send(true);
            if let Err(err) = running.task.await {
                warn!("clock sync loop ended abnormally: {}", err);
            }
            info!("clock sync client stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .is_some_and(|running| !running.task.is_finished())
    }

    /// Reference ("sync") time of a local time, or of now.
    pub fn get_reference_time(&self, local_time: Option<f64>) -> f64 {
        self.shared.estimator.lock().to_reference_time(local_time)
    }

    /// Local time of a reference time, or the local time of now.
    pub fn get_local_time(&self, reference_time: Option<f64>) -> f64 {
        self.shared.estimator.lock().to_local_time(reference_time)
    }

    pub fn on_report<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Report) + Send + Sync + 'static,
    {
        self.shared.reports.subscribe(callback)
    }

    /// Last report, or the uninitialized sentinel before the first one.
    pub fn get_report(&self) -> Report {
        self.shared.reports.last().unwrap_or_default()
    }

    pub fn status(&self) -> SyncStatus {
        self.shared.estimator.lock().status()
    }

    pub fn channels(&self) -> &ChannelNames {
        &self.shared.channels
    }
}

impl fmt::Debug for ClockSyncClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClockSyncClient")
            .field("namespace", &self.shared.config.namespace)
            .field("running", &self.is_running())
            .field("report", &self.get_report())
            .finish()
    }
}

struct ExchangeLoop {
    shared: Arc<Shared>,
    sink: Arc<dyn MessageSink>,
    inbound: mpsc::UnboundedReceiver<Frame>,
    shutdown: watch::Receiver<bool>,
    status: watch::Sender<SyncStatus>,
    pending: CorrelationTable,
    timeouts: TimeoutTracker,
}

impl ExchangeLoop {
    async fn run(mut self) {
        let mut next_ping = Instant::now();
        loop {
            // one round trip at a time: while a ping is out, wake for its deadline
            let wake = self.pending.next_deadline().unwrap_or(next_ping);
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
                frame = self.inbound.recv() => match frame {
                    Some(frame) => self.dispatch(frame).await,
                    None => {
                        warn!("inbound channel closed, stopping clock sync loop");
                        break;
                    }
                },
                _ = sleep_until(wake) => {
                    let now = Instant::now();
                    self.expire(now);
                    if self.pending.is_empty() && now >= next_ping {
                        self.check_staleness();
                        self.send_ping().await;
                        let status = self.shared.estimator.lock().status();
                        next_ping = now + next_interval(status, &self.shared.config.exchange);
                    }
                }
            }
        }
        self.pending.clear();
        debug!("clock sync loop exited");
    }

    async fn dispatch(&mut self, frame: Frame) {
        match self.shared.channels.classify(&frame.channel) {
            Some(ChannelKind::Pong) => self.handle_pong(&frame.body),
            Some(ChannelKind::Ping) => {
                // reference-side probing: answer with our own clock
                match answer_ping(self.shared.time_source.as_ref(), &frame.body) {
                    Ok(body) => {
                        let pong = Frame::new(self.shared.channels.pong(), body);
                        if let Err(err) = self.sink.send(pong).await {
                            warn!("failed to answer reference probe: {}", err);
                        }
                    }
                    Err(err) => debug!("dropping malformed probe: {}", err),
                }
            }
            None => debug!("ignoring frame on foreign channel {}", frame.channel),
        }
    }

    fn handle_pong(&mut self, body: &[u8]) {
        let t3 = self.shared.time_source.now();
        let pong = match decode_pong(body) {
            Ok(pong) => pong,
            Err(err) => {
                debug!("dropping malformed pong: {}", err);
                return;
            }
        };
        let report = self.round_trips().complete(&pong, t3);
        if let Some(report) = report {
            self.publish(report);
        }
    }

    fn expire(&mut self, now: Instant) {
        let (_, degraded) = self.round_trips().expire(now);
        if let Some(report) = degraded {
            self.publish(report);
        }
    }

    fn round_trips(&mut self) -> RoundTrips<'_> {
        RoundTrips {
            peer: &self.shared.config.namespace,
            pending: &mut self.pending,
            timeouts: &mut self.timeouts,
            estimator: &self.shared.estimator,
        }
    }

    fn check_staleness(&mut self) {
        let now = self.shared.time_source.now();
        let report = self.shared.estimator.lock().check_staleness(now);
        if let Some(report) = report {
            self.publish(report);
        }
    }

    async fn send_ping(&mut self) {
        let t0 = self.shared.time_source.now();
        let deadline = Instant::now() + self.shared.config.exchange.pong_timeout();
        let id = self.pending.issue(t0, deadline);
        let body = match encode_ping(id, t0) {
            Ok(body) => body,
            Err(err) => {
                warn!("failed to encode ping: {}", err);
                self.pending.complete(id);
                return;
            }
        };
        // a failed send is left to time out like a lost message
        if let Err(err) = self.sink.send(Frame::new(self.shared.channels.ping(), body)).await {
            warn!("failed to send ping {}: {}", id, err);
        }
    }

    fn publish(&self, report: Report) {
        self.status.send_replace(report.status);
        self.shared.reports.publish(report);
    }
}
