//! Builds a local endpoint bound to the single pre-negotiated data channel.

use std::sync::{Arc, Weak};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::config::WebRtcConfig;
use crate::error::DialError;
use crate::peer::{DataChannel, PeerConnection, PeerEngine};
use crate::sdp::decode_sdp;
use crate::session::{NegotiationMode, Role};

pub const DATA_CHANNEL_LABEL: &str = "data";
pub const DATA_CHANNEL_ID: u16 = 0;

/// Locally gathered candidates in discovery order; `None` ends the feed.
pub type CandidateFeed = mpsc::UnboundedReceiver<Option<RTCIceCandidateInit>>;

pub struct NewPeer {
    pub peer: Arc<PeerConnection>,
    pub data_channel: Arc<dyn DataChannel>,
    /// Present in trickle mode. Subscribed before the local description was
    /// set, so no candidate is missed.
    pub candidates: Option<CandidateFeed>,
}

/// Creates an endpoint that offers. The offer is installed as the local
/// description; in vanilla mode this waits for gathering so the description
/// already lists every candidate.
pub async fn new_peer_connection_for_client(
    ctx: &CancellationToken,
    engine: &dyn PeerEngine,
    config: &WebRtcConfig,
    mode: NegotiationMode,
) -> Result<NewPeer, DialError> {
    let peer = Arc::new(PeerConnection::new(engine.new_peer_connection(config).await?));
    let result = async {
        let data_channel = open_data_channel(&peer).await?;
        let offer = peer.endpoint().create_offer().await?;
        let candidates = install_local_description(ctx, &peer, offer, mode).await?;
        Ok::<_, DialError>((data_channel, candidates))
    }
    .await;
    finish(peer, Role::Client, mode, result).await
}

/// Creates an endpoint that answers the encoded remote offer.
pub async fn new_peer_connection_for_server(
    ctx: &CancellationToken,
    engine: &dyn PeerEngine,
    encoded_offer: &str,
    config: &WebRtcConfig,
    mode: NegotiationMode,
) -> Result<NewPeer, DialError> {
    let peer = Arc::new(PeerConnection::new(engine.new_peer_connection(config).await?));
    let result = async {
        let data_channel = open_data_channel(&peer).await?;
        let offer = decode_sdp(encoded_offer)?;
        peer.endpoint().set_remote_description(offer).await?;
        let answer = peer.endpoint().create_answer().await?;
        let candidates = install_local_description(ctx, &peer, answer, mode).await?;
        Ok::<_, DialError>((data_channel, candidates))
    }
    .await;
    finish(peer, Role::Server, mode, result).await
}

async fn finish(
    peer: Arc<PeerConnection>,
    role: Role,
    mode: NegotiationMode,
    result: Result<(Arc<dyn DataChannel>, Option<CandidateFeed>), DialError>,
) -> Result<NewPeer, DialError> {
    match result {
        Ok((data_channel, candidates)) => {
            debug!(%role, %mode, "peer connection ready for signaling");
            Ok(NewPeer {
                peer,
                data_channel,
                candidates,
            })
        }
        // Closing the endpoint releases its data channel with it.
        Err(err) => Err(err.combine(peer.close().await)),
    }
}

async fn open_data_channel(peer: &Arc<PeerConnection>) -> Result<Arc<dyn DataChannel>, DialError> {
    let data_channel = peer
        .endpoint()
        .create_data_channel(DATA_CHANNEL_LABEL, DATA_CHANNEL_ID)
        .await?;
    data_channel.on_error(premature_error_handler(Arc::downgrade(peer)));
    Ok(data_channel)
}

// Until the channel is wrapped, any data channel error tears the endpoint down.
fn premature_error_handler(peer: Weak<PeerConnection>) -> Box<dyn Fn(String) + Send + Sync> {
    Box::new(move |err| {
        error!(error = %err, "premature data channel error before channel association");
        let Some(peer) = peer.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            if let Err(err) = peer.close().await {
                debug!(error = %err, "closing peer connection after data channel error");
            }
        });
    })
}

async fn install_local_description(
    ctx: &CancellationToken,
    peer: &PeerConnection,
    description: RTCSessionDescription,
    mode: NegotiationMode,
) -> Result<Option<CandidateFeed>, DialError> {
    let endpoint = peer.endpoint();
    match mode {
        NegotiationMode::Trickle => {
            let feed = endpoint.local_candidates();
            endpoint.set_local_description(description).await?;
            Ok(Some(feed))
        }
        NegotiationMode::Vanilla => {
            let mut gathered = endpoint.gathering_complete().await;
            endpoint.set_local_description(description).await?;
            tokio::select! {
                _ = ctx.cancelled() => Err(DialError::Canceled),
                _ = gathered.recv() => Ok(None),
            }
        }
    }
}
