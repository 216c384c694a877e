use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;

use crate::proto::AdvisedWebRtcConfig;

/// Bound on connecting to the signaling service and fetching its advised
/// configuration.
pub const DEFAULT_SIGNALING_TIMEOUT: Duration = Duration::from_secs(20);

const DEFAULT_STUN_URL: &str = "stun:global.stun.twilio.com:3478?transport=udp";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub credential: String,
}

impl IceServer {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            ..Default::default()
        }
    }

    pub fn with_credentials(
        url: impl Into<String>,
        username: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            urls: vec![url.into()],
            username: username.into(),
            credential: credential.into(),
        }
    }
}

/// The public servers used when the caller supplies no configuration. There is
/// no guarantee these stay usable; production callers should bring their own.
pub fn default_ice_servers() -> Vec<IceServer> {
    vec![IceServer::new(DEFAULT_STUN_URL)]
}

/// Negotiation configuration for one peer connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebRtcConfig {
    #[serde(default)]
    pub ice_servers: Vec<IceServer>,
}

impl WebRtcConfig {
    pub fn new(ice_servers: Vec<IceServer>) -> Self {
        Self { ice_servers }
    }

    pub fn with_default_ice_servers() -> Self {
        Self::new(default_ice_servers())
    }

    /// Returns a copy with the service-advised servers appended.
    pub fn extend(&self, advised: &AdvisedWebRtcConfig) -> WebRtcConfig {
        let mut extended = self.clone();
        extended
            .ice_servers
            .extend(advised.additional_ice_servers.iter().cloned());
        extended
    }

    pub fn to_rtc_configuration(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: self
                .ice_servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: server.urls.clone(),
                    username: server.username.clone(),
                    credential: server.credential.clone(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
    }
}

/// Caller-side settings for a WebRTC dial attempt.
#[derive(Debug, Clone)]
pub struct DialWebRtcOptions {
    /// Talk to the signaling service without TLS.
    pub insecure: bool,
    /// Signaling service to contact instead of the dial target itself.
    pub signaling_server: Option<String>,
    /// Exchange one complete description instead of trickling candidates.
    /// Slower, but needs no candidate updates on the signaling stream.
    pub disable_trickle_ice: bool,
    /// Replaces the dialer's default configuration when set. Service-advised
    /// servers are still appended.
    pub config: Option<WebRtcConfig>,
    pub signaling_timeout: Duration,
}

impl Default for DialWebRtcOptions {
    fn default() -> Self {
        Self {
            insecure: false,
            signaling_server: None,
            disable_trickle_ice: false,
            config: None,
            signaling_timeout: DEFAULT_SIGNALING_TIMEOUT,
        }
    }
}

impl DialWebRtcOptions {
    /// Defaults overridden by `RPC_WEBRTC_*` environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let insecure = env::var("RPC_WEBRTC_INSECURE")
            .map(|value| parse_flag(&value))
            .unwrap_or(defaults.insecure);
        let signaling_server = env::var("RPC_WEBRTC_SIGNALING_SERVER")
            .ok()
            .filter(|value| !value.trim().is_empty());
        let disable_trickle_ice = env::var("RPC_WEBRTC_DISABLE_TRICKLE_ICE")
            .map(|value| parse_flag(&value))
            .unwrap_or(defaults.disable_trickle_ice);
        let signaling_timeout = env::var("RPC_WEBRTC_SIGNALING_TIMEOUT_MS")
            .ok()
            .and_then(|value| value.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.signaling_timeout);

        Self {
            insecure,
            signaling_server,
            disable_trickle_ice,
            config: None,
            signaling_timeout,
        }
    }

    pub fn insecure(mut self, insecure: bool) -> Self {
        self.insecure = insecure;
        self
    }

    pub fn signaling_server(mut self, address: impl Into<String>) -> Self {
        self.signaling_server = Some(address.into());
        self
    }

    pub fn disable_trickle_ice(mut self, disable: bool) -> Self {
        self.disable_trickle_ice = disable;
        self
    }

    pub fn config(mut self, config: WebRtcConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn signaling_timeout(mut self, timeout: Duration) -> Self {
        self.signaling_timeout = timeout;
        self
    }
}

fn parse_flag(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}
