use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use crate::channel::WebRtcChannel;
use crate::config::{DialWebRtcOptions, WebRtcConfig};
use crate::error::DialError;
use crate::exchange::run_offer;
use crate::factory::new_peer_connection_for_client;
use crate::peer::PeerEngine;
use crate::peer::rtc::RtcEngine;
use crate::session::NegotiationMode;
use crate::signaling::{ConnectOptions, SignalingClient, SignalingConnector, WsSignalingConnector};

/// Where to send signaling traffic and which peer behind it to reach.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialTarget {
    pub signaling_address: String,
    pub host: Option<String>,
}

impl DialTarget {
    /// Parses `address`, which may carry the logical host as a `host` query
    /// parameter (`signal.example.com:443?host=robot-1`).
    ///
    /// With a signaling server override the target address itself names the
    /// peer, so it becomes the host unless the query says otherwise.
    pub fn parse(address: &str, signaling_server: Option<&str>) -> Result<Self, DialError> {
        let raw = if address.contains("://") {
            address.to_string()
        } else {
            format!("rpc://{address}")
        };
        let url = Url::parse(&raw)
            .map_err(|err| DialError::InvalidAddress(format!("{address}: {err}")))?;
        let authority = match (url.host_str().filter(|host| !host.is_empty()), url.port()) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (Some(host), None) => host.to_string(),
            (None, _) => {
                return Err(DialError::InvalidAddress(format!("{address}: missing host")));
            }
        };
        let host = url
            .query_pairs()
            .find(|(key, _)| key == "host")
            .map(|(_, value)| value.into_owned())
            .filter(|value| !value.is_empty());

        Ok(match signaling_server {
            Some(server) => DialTarget {
                signaling_address: server.to_string(),
                host: host.or(Some(authority)),
            },
            None => DialTarget {
                signaling_address: authority,
                host,
            },
        })
    }
}

/// Dials peers through a signaling service.
pub struct WebRtcDialer {
    connector: Arc<dyn SignalingConnector>,
    engine: Arc<dyn PeerEngine>,
    default_config: WebRtcConfig,
}

impl WebRtcDialer {
    pub fn new(connector: Arc<dyn SignalingConnector>, engine: Arc<dyn PeerEngine>) -> Self {
        Self {
            connector,
            engine,
            default_config: WebRtcConfig::with_default_ice_servers(),
        }
    }

    /// Configuration used when a dial does not bring its own.
    pub fn with_default_config(mut self, config: WebRtcConfig) -> Self {
        self.default_config = config;
        self
    }

    pub fn default_config(&self) -> &WebRtcConfig {
        &self.default_config
    }

    /// Establishes a channel to the peer named by `address`.
    ///
    /// Connecting to the signaling service and fetching its advised
    /// configuration share `options.signaling_timeout`; the rest is bounded
    /// only by `ctx`. The control connection is closed before returning, and
    /// on failure so is everything else this call opened.
    pub async fn dial(
        &self,
        ctx: &CancellationToken,
        address: &str,
        options: &DialWebRtcOptions,
    ) -> Result<Arc<WebRtcChannel>, DialError> {
        let target = DialTarget::parse(address, options.signaling_server.as_deref())?;
        let deadline = Instant::now() + options.signaling_timeout;
        let connect_options = ConnectOptions {
            insecure: options.insecure,
            host: target.host.clone(),
        };

        debug!(
            address = %target.signaling_address,
            host = ?target.host,
            "connecting to signaling server"
        );
        let client = bounded(ctx, deadline, options.signaling_timeout, async {
            self.connector
                .connect(&target.signaling_address, &connect_options)
                .await
                .map_err(DialError::from)
        })
        .await?;
        debug!(address = %target.signaling_address, "connected");

        let result = self
            .negotiate(ctx, Arc::clone(&client), options, deadline)
            .await;
        let closed = client.close().await.map_err(DialError::from);
        match result {
            Ok(channel) => match closed {
                Ok(()) => Ok(channel),
                Err(err) => Err(err.combine(channel.close().await)),
            },
            Err(err) => Err(err.combine(closed)),
        }
    }

    async fn negotiate(
        &self,
        ctx: &CancellationToken,
        client: Arc<dyn SignalingClient>,
        options: &DialWebRtcOptions,
        deadline: Instant,
    ) -> Result<Arc<WebRtcChannel>, DialError> {
        let advised = bounded(ctx, deadline, options.signaling_timeout, async {
            client
                .optional_webrtc_config()
                .await
                .map_err(|err| match err {
                    err if err.is_unimplemented() => DialError::NoSignaler,
                    err => DialError::Signaling(err),
                })
        })
        .await?;

        let base = options
            .config
            .clone()
            .unwrap_or_else(|| self.default_config.clone());
        let config = base.extend(&advised.config);
        let mode = NegotiationMode::from_disable_trickle(options.disable_trickle_ice);
        debug!(%mode, ice_servers = config.ice_servers.len(), "creating peer connection");

        let new_peer =
            new_peer_connection_for_client(ctx, self.engine.as_ref(), &config, mode).await?;
        let peer = Arc::clone(&new_peer.peer);
        match run_offer(ctx, client, new_peer, mode).await {
            Ok(channel) => Ok(channel),
            Err(err) => Err(err.combine(peer.close().await)),
        }
    }
}

async fn bounded<T, F>(
    ctx: &CancellationToken,
    deadline: Instant,
    timeout: Duration,
    future: F,
) -> Result<T, DialError>
where
    F: Future<Output = Result<T, DialError>>,
{
    tokio::select! {
        biased;
        _ = ctx.cancelled() => Err(DialError::Canceled),
        result = tokio::time::timeout_at(deadline, future) => {
            result.unwrap_or(Err(DialError::Timeout(timeout)))
        }
    }
}

/// Dials over WebSocket signaling with the `webrtc` crate engine and the
/// default ICE servers.
pub async fn dial_webrtc(
    ctx: &CancellationToken,
    address: &str,
    options: &DialWebRtcOptions,
) -> Result<Arc<WebRtcChannel>, DialError> {
    let engine = RtcEngine::new()?;
    WebRtcDialer::new(Arc::new(WsSignalingConnector::new()), Arc::new(engine))
        .dial(ctx, address, options)
        .await
}
