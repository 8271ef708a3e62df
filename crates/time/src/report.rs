//! Report snapshots and the observer registry that fans them out.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Convergence phase of an estimator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// No sample accepted since creation or the last reset
    Uninitialized,
    /// Converging; mapping usable but not yet trustworthy
    Training,
    /// Confidence and sample count crossed their thresholds
    Sync,
}

impl SyncStatus {
    /// `true` once at least one sample shaped the model.
    pub fn is_initialized(self) -> bool {
        !matches!(self, SyncStatus::Uninitialized)
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            SyncStatus::Uninitialized => "uninitialized",
            SyncStatus::Training => "training",
            SyncStatus::Sync => "sync",
        };
        f.write_str(value)
    }
}

/// Health of the ping/pong exchange itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Connectivity {
    Healthy,
    /// Too many consecutive pongs went missing
    Degraded,
}

/// Immutable snapshot of a clock model, emitted on every update.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub status: SyncStatus,
    /// Seconds to add to local time at the anchor instant
    pub offset: f64,
    /// Seconds of offset change per local second
    pub drift: f64,
    pub confidence: f64,
    /// Local time at which the snapshot was taken
    pub timestamp: f64,
    /// Delay of the round trip anchoring the model
    pub round_trip: f64,
    /// Samples accepted since the last reset
    pub accepted: u64,
    /// Samples rejected since the last reset
    pub rejected: u64,
    pub connectivity: Connectivity,
}

impl Report {
    /// Sentinel returned before any model update.
    pub fn uninitialized() -> Self {
        Self {
            status: SyncStatus::Uninitialized,
            offset: 0.0,
            drift: 0.0,
            confidence: 0.0,
            timestamp: 0.0,
            round_trip: 0.0,
            accepted: 0,
            rejected: 0,
            connectivity: Connectivity::Healthy,
        }
    }
}

impl Default for Report {
    fn default() -> Self {
        Self::uninitialized()
    }
}

type Callback = Arc<dyn Fn(&Report) + Send + Sync>;

struct HubInner {
    next_id: AtomicU64,
    subscribers: Mutex<Vec<(u64, Callback)>>,
    last: Mutex<Option<Report>>,
}

/// Observer registry for reports.
///
/// Callbacks run synchronously on the publishing task, in registration
/// order. The registry keeps the last published report.
#[derive(Clone)]
pub struct ReportHub {
    inner: Arc<HubInner>,
}

impl ReportHub {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(HubInner {
                next_id: AtomicU64::new(0),
                subscribers: Mutex::new(Vec::new()),
                last: Mutex::new(None),
            }),
        }
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Report) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.subscribers.lock().push((id, Arc::new(callback)));
        Subscription {
            id,
            hub: Arc::downgrade(&self.inner),
        }
    }

    pub fn publish(&self, report: Report) {
        *self.inner.last.lock() = Some(report);
        // Snapshot so callbacks may subscribe or unsubscribe re-entrantly.
        let callbacks: Vec<Callback> = self
            .inner
            .subscribers
            .lock()
            .iter()
            .map(|(_, callback)| callback.clone())
            .collect();
        for callback in callbacks {
            callback(&report);
        }
    }

    /// Last published report, if any.
    pub fn last(&self) -> Option<Report> {
        *self.inner.last.lock()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().len()
    }
}

impl Default for ReportHub {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ReportHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReportHub")
            .field("subscribers", &self.subscriber_count())
            .field("last", &self.last())
            .finish()
    }
}

/// Handle returned by `on_report`. Dropping it keeps the callback registered.
#[derive(Debug)]
#[must_use = "keep the subscription to be able to unsubscribe"]
pub struct Subscription {
    id: u64,
    hub: Weak<HubInner>,
}

impl Subscription {
    /// Remove the callback. Returns `false` if it was already gone.
    pub fn unsubscribe(self) -> bool {
        let Some(hub) = self.hub.upgrade() else {
            return false;
        };
        let mut subscribers = hub.subscribers.lock();
        let before = subscribers.len();
        subscribers.retain(|(id, _)| *id != self.id);
        subscribers.len() != before
    }
}
