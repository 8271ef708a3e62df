//! Reference-side facade driven by the host's lifecycle hooks.

use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::ReferenceConfig;
use crate::error::{Result, SyncError};
use crate::report::Report;
use crate::session::{PeerSyncSession, SessionRegistry};
use crate::time_source::{validate_time_source, SharedTimeSource};
use crate::transport::{Frame, MessageSink};
use crate::wire::{ChannelKind, ChannelNames};

/// Construction options for [`SyncReference`].
#[derive(Clone, Default)]
pub struct ReferenceOptions {
    pub config: ReferenceConfig,
    /// Mandatory; construction fails without it
    pub time_source: Option<SharedTimeSource>,
}

impl ReferenceOptions {
    pub fn new(time_source: SharedTimeSource) -> Self {
        Self {
            config: ReferenceConfig::default(),
            time_source: Some(time_source),
        }
    }

    pub fn with_config(mut self, config: ReferenceConfig) -> Self {
        self.config = config;
        self
    }
}

/// The trusted timestamp source every peer synchronizes to.
pub struct SyncReference {
    channels: ChannelNames,
    time_source: SharedTimeSource,
    registry: SessionRegistry,
}

impl SyncReference {
    pub fn new(options: ReferenceOptions) -> Result<Self> {
        let time_source = validate_time_source(options.time_source)?;
        let channels = ChannelNames::new(&options.config.namespace);
        let registry = SessionRegistry::new(options.config, time_source.clone())?;
        info!(
            "clock sync reference ready on {} / {}",
            channels.ping(),
            channels.pong()
        );
        Ok(Self {
            channels,
            time_source,
            registry,
        })
    }

    /// Open a session for a newly connected peer.
    ///
    /// With probing enabled, the session immediately starts measuring the peer
    /// through `sink`.
    pub fn on_peer_connected(
        &self,
        peer_id: &str,
        sink: Arc<dyn MessageSink>,
    ) -> Result<Arc<PeerSyncSession>> {
        let session = self.registry.add_peer(peer_id)?;
        if self.registry.config().probe_peers {
            session.spawn_prober(sink);
        }
        Ok(session)
    }

    /// Tear down the peer's session. Returns `false` if it was unknown.
    pub fn on_peer_disconnected(&self, peer_id: &str) -> bool {
        self.registry.remove_peer(peer_id).is_some()
    }

    /// Route one inbound frame from `peer_id`.
    ///
    /// Pings yield the pong to send back. Pongs complete probes. Frames of
    /// other channels are ignored.
    pub fn handle_frame(&self, peer_id: &str, frame: &Frame) -> Result<Option<Frame>> {
        let Some(kind) = self.channels.classify(&frame.channel) else {
            debug!("ignoring frame on foreign channel {}", frame.channel);
            return Ok(None);
        };
        let session = self
            .registry
            .get(peer_id)
            .ok_or_else(|| SyncError::UnknownPeer(peer_id.to_string()))?;
        match kind {
            ChannelKind::Ping => session.handle_ping(&frame.body).map(Some),
            ChannelKind::Pong => {
                session.handle_pong(&frame.body)?;
                Ok(None)
            }
        }
    }

    /// Reference time of a sync time (or now). The reference is the sync clock,
    /// so this is the identity.
    pub fn get_local_time(&self, sync_time: Option<f64>) -> f64 {
        sync_time.unwrap_or_else(|| self.time_source.now())
    }

    /// Sync time of a reference time (or now); identical to `get_local_time`.
    pub fn get_reference_time(&self, local_time: Option<f64>) -> f64 {
        local_time.unwrap_or_else(|| self.time_source.now())
    }

    /// Last report of the reference's model of `peer_id` (probing mode).
    pub fn peer_report(&self, peer_id: &str) -> Option<Report> {
        self.registry.get(peer_id).map(|session| session.report())
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn channels(&self) -> &ChannelNames {
        &self.channels
    }

    /// Close every session.
    pub fn stop(&self) {
        self.registry.clear();
        info!("clock sync reference stopped");
    }
}

impl fmt::Debug for SyncReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncReference")
            .field("channels", &self.channels)
            .field("registry", &self.registry)
            .finish()
    }
}
