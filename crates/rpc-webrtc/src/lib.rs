//! Peer-to-peer RPC channels negotiated through a signaling service.
//!
//! A dial connects to the signaling service, creates a local endpoint with a
//! single pre-negotiated data channel, and exchanges descriptions and
//! candidates with the remote peer until that channel opens. See
//! [`WebRtcDialer`] for the client side and [`answer::WebRtcSignalingAnswerer`]
//! for the serving side.

pub mod answer;
pub mod candidate;
pub mod channel;
pub mod config;
pub mod dial;
pub mod error;
pub mod exchange;
pub mod factory;
pub mod peer;
pub mod proto;
pub mod sdp;
pub mod session;
pub mod signaling;

pub use answer::{WebRtcSignalingAnswerer, answer_call};
pub use channel::WebRtcChannel;
pub use config::{DialWebRtcOptions, IceServer, WebRtcConfig, default_ice_servers};
pub use dial::{DialTarget, WebRtcDialer, dial_webrtc};
pub use error::{DialError, SignalingError};
pub use session::{NegotiationMode, Role};
