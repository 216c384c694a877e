//! [`PeerEngine`] backed by the `webrtc` crate.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::stats::StatsReportType;

use super::{
    ConnectionStats, DataChannel, OnErrorFn, OnMessageFn, OnOpenFn, PeerEndpoint, PeerEngine,
};
use crate::config::WebRtcConfig;
use crate::error::DialError;

const ICE_DISCONNECTED_TIMEOUT: Duration = Duration::from_secs(5);
const ICE_FAILED_TIMEOUT: Duration = Duration::from_secs(25);
const ICE_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(2);

pub struct RtcEngine {
    api: API,
}

impl RtcEngine {
    pub fn new() -> Result<Self, DialError> {
        let mut setting = SettingEngine::default();
        setting.set_ice_timeouts(
            Some(ICE_DISCONNECTED_TIMEOUT),
            Some(ICE_FAILED_TIMEOUT),
            Some(ICE_KEEPALIVE_INTERVAL),
        );
        Ok(Self {
            api: build_api(setting)?,
        })
    }
}

fn build_api(setting: SettingEngine) -> Result<API, DialError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(DialError::negotiation)?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)
        .map_err(DialError::negotiation)?;

    Ok(APIBuilder::new()
        .with_setting_engine(setting)
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

#[async_trait]
impl PeerEngine for RtcEngine {
    async fn new_peer_connection(
        &self,
        config: &WebRtcConfig,
    ) -> Result<Arc<dyn PeerEndpoint>, DialError> {
        let pc = self
            .api
            .new_peer_connection(config.to_rtc_configuration())
            .await
            .map_err(DialError::negotiation)?;
        Ok(Arc::new(RtcEndpoint { pc: Arc::new(pc) }))
    }
}

pub struct RtcEndpoint {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl PeerEndpoint for RtcEndpoint {
    async fn create_data_channel(
        &self,
        label: &str,
        id: u16,
    ) -> Result<Arc<dyn DataChannel>, DialError> {
        let init = RTCDataChannelInit {
            ordered: Some(true),
            negotiated: Some(id),
            ..Default::default()
        };
        let dc = self
            .pc
            .create_data_channel(label, Some(init))
            .await
            .map_err(DialError::negotiation)?;
        Ok(Arc::new(RtcDataChannel { dc }))
    }

    async fn create_offer(&self) -> Result<RTCSessionDescription, DialError> {
        self.pc
            .create_offer(None)
            .await
            .map_err(DialError::negotiation)
    }

    async fn create_answer(&self) -> Result<RTCSessionDescription, DialError> {
        self.pc
            .create_answer(None)
            .await
            .map_err(DialError::negotiation)
    }

    async fn set_local_description(
        &self,
        description: RTCSessionDescription,
    ) -> Result<(), DialError> {
        self.pc
            .set_local_description(description)
            .await
            .map_err(DialError::negotiation)
    }

    async fn set_remote_description(
        &self,
        description: RTCSessionDescription,
    ) -> Result<(), DialError> {
        self.pc
            .set_remote_description(description)
            .await
            .map_err(DialError::negotiation)
    }

    async fn local_description(&self) -> Option<RTCSessionDescription> {
        self.pc.local_description().await
    }

    async fn add_ice_candidate(&self, candidate: RTCIceCandidateInit) -> Result<(), DialError> {
        self.pc
            .add_ice_candidate(candidate)
            .await
            .map_err(DialError::negotiation)
    }

    async fn stats(&self) -> ConnectionStats {
        let report = self.pc.get_stats().await;
        let mut stats = ConnectionStats::default();
        for entry in report.reports.values() {
            match entry {
                StatsReportType::PeerConnection(pc) => stats.id = pc.id.clone(),
                StatsReportType::RemoteCandidate(candidate) => {
                    let ice_type = candidate.candidate_type.to_string();
                    stats.record_remote(&ice_type, candidate.ip.clone());
                }
                _ => {}
            }
        }
        stats
    }

    fn local_candidates(&self) -> mpsc::UnboundedReceiver<Option<RTCIceCandidateInit>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.pc.on_ice_candidate(Box::new(move |candidate| {
            let tx = tx.clone();
            Box::pin(async move {
                let next = match candidate {
                    Some(candidate) => match candidate.to_json() {
                        Ok(init) => Some(init),
                        Err(err) => {
                            tracing::warn!(error = %err, "dropping unserializable local candidate");
                            return;
                        }
                    },
                    None => None,
                };
                let _ = tx.send(next);
            })
        }));
        rx
    }

    async fn gathering_complete(&self) -> mpsc::Receiver<()> {
        self.pc.gathering_complete_promise().await
    }

    async fn close(&self) -> Result<(), DialError> {
        self.pc.close().await.map_err(DialError::negotiation)
    }
}

pub struct RtcDataChannel {
    dc: Arc<RTCDataChannel>,
}

#[async_trait]
impl DataChannel for RtcDataChannel {
    fn label(&self) -> String {
        self.dc.label().to_string()
    }

    fn id(&self) -> u16 {
        self.dc.id()
    }

    fn on_open(&self, handler: OnOpenFn) {
        self.dc.on_open(Box::new(move || {
            handler();
            Box::pin(async {})
        }));
    }

    fn on_error(&self, handler: OnErrorFn) {
        self.dc.on_error(Box::new(move |err| {
            handler(err.to_string());
            Box::pin(async {})
        }));
    }

    fn on_message(&self, handler: OnMessageFn) {
        self.dc.on_message(Box::new(move |message| {
            handler(message.data);
            Box::pin(async {})
        }));
    }

    async fn send(&self, data: Bytes) -> Result<usize, DialError> {
        self.dc.send(&data).await.map_err(DialError::negotiation)
    }

    async fn close(&self) -> Result<(), DialError> {
        self.dc.close().await.map_err(DialError::negotiation)
    }
}
