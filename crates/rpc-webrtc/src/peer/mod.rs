//! Seam between the dial logic and the negotiation engine.
//!
//! The exchanges only ever talk to [`PeerEndpoint`] and [`DataChannel`], so
//! they can be driven by the `webrtc` crate ([`rtc`]) or by a scripted engine
//! in tests.

pub mod rtc;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::config::WebRtcConfig;
use crate::error::DialError;
use crate::session::OnceGuard;

pub type OnOpenFn = Box<dyn FnOnce() + Send + Sync>;
pub type OnErrorFn = Box<dyn Fn(String) + Send + Sync>;
pub type OnMessageFn = Box<dyn Fn(Bytes) + Send + Sync>;

/// Creates negotiation endpoints.
#[async_trait]
pub trait PeerEngine: Send + Sync {
    async fn new_peer_connection(
        &self,
        config: &WebRtcConfig,
    ) -> Result<Arc<dyn PeerEndpoint>, DialError>;
}

/// One local negotiation endpoint.
#[async_trait]
pub trait PeerEndpoint: Send + Sync {
    /// Creates an ordered data channel negotiated out of band with the fixed
    /// stream id `id`.
    async fn create_data_channel(
        &self,
        label: &str,
        id: u16,
    ) -> Result<Arc<dyn DataChannel>, DialError>;

    async fn create_offer(&self) -> Result<RTCSessionDescription, DialError>;

    async fn create_answer(&self) -> Result<RTCSessionDescription, DialError>;

    async fn set_local_description(
        &self,
        description: RTCSessionDescription,
    ) -> Result<(), DialError>;

    async fn set_remote_description(
        &self,
        description: RTCSessionDescription,
    ) -> Result<(), DialError>;

    /// The current local description, including every candidate gathered so far.
    async fn local_description(&self) -> Option<RTCSessionDescription>;

    async fn add_ice_candidate(&self, candidate: RTCIceCandidateInit) -> Result<(), DialError>;

    async fn stats(&self) -> ConnectionStats;

    /// Feed of locally gathered candidates; `None` marks the end of gathering.
    /// Subscribing replaces any earlier feed.
    fn local_candidates(&self) -> mpsc::UnboundedReceiver<Option<RTCIceCandidateInit>>;

    /// Resolves once gathering completes. Must be obtained before the local
    /// description is set.
    async fn gathering_complete(&self) -> mpsc::Receiver<()>;

    async fn close(&self) -> Result<(), DialError>;
}

#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> String;

    fn id(&self) -> u16;

    /// Fires once when the channel opens, or right away if it already has.
    fn on_open(&self, handler: OnOpenFn);

    /// Replaces the current error handler.
    fn on_error(&self, handler: OnErrorFn);

    fn on_message(&self, handler: OnMessageFn);

    async fn send(&self, data: Bytes) -> Result<usize, DialError>;

    async fn close(&self) -> Result<(), DialError>;
}

/// Kind of a non-host remote candidate, i.e. how the peer is reached through
/// NAT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RemoteCandidateKind {
    Relay,
    PeerReflexive,
    ServerReflexive,
}

impl RemoteCandidateKind {
    /// Maps an ICE candidate type as printed in SDP. Host candidates have no
    /// kind.
    pub fn from_ice_type(ice_type: &str) -> Option<Self> {
        match ice_type {
            "relay" => Some(Self::Relay),
            "prflx" => Some(Self::PeerReflexive),
            "srflx" => Some(Self::ServerReflexive),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Relay => "relay",
            Self::PeerReflexive => "peer-reflexive",
            Self::ServerReflexive => "server-reflexive",
        }
    }
}

impl fmt::Display for RemoteCandidateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection identifier plus the remote address in use per candidate kind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    pub id: String,
    pub remote_candidates: BTreeMap<RemoteCandidateKind, String>,
}

impl ConnectionStats {
    /// Records a remote candidate from the engine's report. Host and unknown
    /// candidate types are skipped; a later address of the same kind wins.
    pub fn record_remote(&mut self, ice_type: &str, ip: impl Into<String>) {
        if let Some(kind) = RemoteCandidateKind::from_ice_type(ice_type) {
            self.remote_candidates.insert(kind, ip.into());
        }
    }
}

/// Owning handle to an endpoint. Closing is idempotent, so every exit path can
/// release it and the engine still sees exactly one close.
pub struct PeerConnection {
    endpoint: Arc<dyn PeerEndpoint>,
    closed: OnceGuard,
}

impl PeerConnection {
    pub fn new(endpoint: Arc<dyn PeerEndpoint>) -> Self {
        Self {
            endpoint,
            closed: OnceGuard::new(),
        }
    }

    pub fn endpoint(&self) -> &dyn PeerEndpoint {
        self.endpoint.as_ref()
    }

    pub async fn close(&self) -> Result<(), DialError> {
        if !self.closed.try_claim() {
            return Ok(());
        }
        self.endpoint.close().await
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_claimed()
    }
}

impl fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerConnection")
            .field("closed", &self.is_closed())
            .finish()
    }
}
