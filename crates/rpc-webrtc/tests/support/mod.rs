#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tracing_subscriber::{EnvFilter, fmt::SubscriberBuilder};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use rpc_webrtc::config::WebRtcConfig;
use rpc_webrtc::error::{DialError, SignalingError};
use rpc_webrtc::peer::{
    ConnectionStats, DataChannel, OnErrorFn, OnMessageFn, OnOpenFn, PeerEndpoint, PeerEngine,
};
use rpc_webrtc::proto::{
    AdvisedWebRtcConfig, AnswerResponse, CallRequest, CallResponse, CallUpdate,
    CallUpdateRequest, IceCandidate, OptionalWebRtcConfigResponse, Status,
};
use rpc_webrtc::sdp::encode_sdp;
use rpc_webrtc::signaling::{
    AnswerRequestSender, AnswerStream, CallStream, CallStreamSender, ConnectOptions,
    SignalingClient, SignalingConnector,
};

/// The service's ends of one answer stream.
pub type ServiceAnswerEnds = (AnswerRequestSender, mpsc::UnboundedReceiver<AnswerResponse>);

pub const OFFER_SDP: &str = "v=0\r\no=- 1 1 IN IP4 127.0.0.1\r\ns=offer\r\nt=0 0\r\n";
pub const ANSWER_SDP: &str = "v=0\r\no=- 2 2 IN IP4 127.0.0.1\r\ns=answer\r\nt=0 0\r\n";

pub fn init_tracing() {
    let _ = SubscriberBuilder::default()
        .with_test_writer()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

pub fn description(kind: &str, sdp: &str) -> RTCSessionDescription {
    serde_json::from_value(json!({ "type": kind, "sdp": sdp })).expect("session description")
}

pub fn encoded(kind: &str, sdp: &str) -> String {
    encode_sdp(&description(kind, sdp)).expect("encode description")
}

pub fn local_candidate(idx: usize) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: format!("candidate:{idx} 1 udp 2130706431 192.0.2.{idx} 5000 typ host"),
        sdp_mid: Some("0".into()),
        sdp_mline_index: Some(0),
        username_fragment: None,
    }
}

pub fn remote_candidate(idx: usize) -> IceCandidate {
    IceCandidate {
        candidate: format!("candidate:{idx} 1 udp 1694498815 198.51.100.{idx} 6000 typ srflx"),
        sdp_mid: Some("0".into()),
        sdp_mline_index: Some(0),
        username_fragment: Some("remote".into()),
    }
}

/// Knobs for the scripted negotiation engine.
#[derive(Debug, Clone)]
pub struct EngineScript {
    /// Gathered right after the local description is set, before any remote
    /// description exists.
    pub local_candidates: Vec<RTCIceCandidateInit>,
    /// Whether the data channel opens as soon as a remote description is set.
    pub open_on_remote: bool,
    /// Whether gathering ever ends: no `None` on the trickle feed and no
    /// completion signal in vanilla mode otherwise.
    pub gathering_completes: bool,
    pub fail_new_peer_connection: bool,
    pub fail_create_data_channel: bool,
    pub fail_create_offer: bool,
    pub fail_set_remote: bool,
    pub fail_add_candidate: bool,
    pub panic_on_add_candidate: bool,
    /// Remote candidates the stats report lists, as (ICE type, address).
    pub remote_stats: Vec<(&'static str, &'static str)>,
}

impl Default for EngineScript {
    fn default() -> Self {
        Self {
            local_candidates: Vec::new(),
            open_on_remote: true,
            gathering_completes: true,
            fail_new_peer_connection: false,
            fail_create_data_channel: false,
            fail_create_offer: false,
            fail_set_remote: false,
            fail_add_candidate: false,
            panic_on_add_candidate: false,
            remote_stats: Vec::new(),
        }
    }
}

pub struct FakeEngine {
    script: EngineScript,
    endpoints: Mutex<Vec<Arc<FakeEndpoint>>>,
    configs: Mutex<Vec<WebRtcConfig>>,
}

impl FakeEngine {
    pub fn new(script: EngineScript) -> Arc<Self> {
        Arc::new(Self {
            script,
            endpoints: Mutex::new(Vec::new()),
            configs: Mutex::new(Vec::new()),
        })
    }

    pub fn endpoints(&self) -> Vec<Arc<FakeEndpoint>> {
        self.endpoints.lock().clone()
    }

    pub fn endpoint(&self) -> Arc<FakeEndpoint> {
        let endpoints = self.endpoints.lock();
        assert_eq!(endpoints.len(), 1, "expected exactly one endpoint");
        endpoints[0].clone()
    }

    pub fn configs(&self) -> Vec<WebRtcConfig> {
        self.configs.lock().clone()
    }

    /// Whether the latest endpoint has a remote description.
    pub fn remote_is_set(&self) -> bool {
        self.endpoints
            .lock()
            .last()
            .is_some_and(|endpoint| endpoint.remote_is_set())
    }
}

#[async_trait]
impl PeerEngine for FakeEngine {
    async fn new_peer_connection(
        &self,
        config: &WebRtcConfig,
    ) -> Result<Arc<dyn PeerEndpoint>, DialError> {
        self.configs.lock().push(config.clone());
        if self.script.fail_new_peer_connection {
            return Err(DialError::negotiation("engine unavailable"));
        }
        let endpoint = Arc::new(FakeEndpoint::new(self.script.clone()));
        self.endpoints.lock().push(endpoint.clone());
        Ok(endpoint)
    }
}

pub struct FakeEndpoint {
    script: EngineScript,
    close_count: AtomicUsize,
    remote_set: AtomicBool,
    local: Mutex<Option<RTCSessionDescription>>,
    remote: Mutex<Option<RTCSessionDescription>>,
    added: Mutex<Vec<RTCIceCandidateInit>>,
    candidate_tx: Mutex<Option<mpsc::UnboundedSender<Option<RTCIceCandidateInit>>>>,
    gathering_tx: Mutex<Option<mpsc::Sender<()>>>,
    data_channel: Mutex<Option<Arc<FakeDataChannel>>>,
    stats_queries: AtomicUsize,
}

impl FakeEndpoint {
    fn new(script: EngineScript) -> Self {
        Self {
            script,
            close_count: AtomicUsize::new(0),
            remote_set: AtomicBool::new(false),
            local: Mutex::new(None),
            remote: Mutex::new(None),
            added: Mutex::new(Vec::new()),
            candidate_tx: Mutex::new(None),
            gathering_tx: Mutex::new(None),
            data_channel: Mutex::new(None),
            stats_queries: AtomicUsize::new(0),
        }
    }

    pub fn stats_queries(&self) -> usize {
        self.stats_queries.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }

    pub fn remote_is_set(&self) -> bool {
        self.remote_set.load(Ordering::SeqCst)
    }

    pub fn remote(&self) -> Option<RTCSessionDescription> {
        self.remote.lock().clone()
    }

    pub fn added_candidates(&self) -> Vec<RTCIceCandidateInit> {
        self.added.lock().clone()
    }

    pub fn data_channel(&self) -> Arc<FakeDataChannel> {
        self.data_channel
            .lock()
            .clone()
            .expect("data channel created")
    }

    fn description(&self, kind: &str) -> RTCSessionDescription {
        let sdp = if kind == "offer" { OFFER_SDP } else { ANSWER_SDP };
        description(kind, sdp)
    }
}

#[async_trait]
impl PeerEndpoint for FakeEndpoint {
    async fn create_data_channel(
        &self,
        label: &str,
        id: u16,
    ) -> Result<Arc<dyn DataChannel>, DialError> {
        if self.script.fail_create_data_channel {
            return Err(DialError::negotiation("data channel refused"));
        }
        let channel = Arc::new(FakeDataChannel::new(label, id));
        *self.data_channel.lock() = Some(channel.clone());
        Ok(channel)
    }

    async fn create_offer(&self) -> Result<RTCSessionDescription, DialError> {
        if self.script.fail_create_offer {
            return Err(DialError::negotiation("offer refused"));
        }
        Ok(self.description("offer"))
    }

    async fn create_answer(&self) -> Result<RTCSessionDescription, DialError> {
        if !self.remote_is_set() {
            return Err(DialError::negotiation("answer without remote offer"));
        }
        Ok(self.description("answer"))
    }

    async fn set_local_description(
        &self,
        description: RTCSessionDescription,
    ) -> Result<(), DialError> {
        *self.local.lock() = Some(description);
        if let Some(tx) = self.candidate_tx.lock().as_ref() {
            for candidate in &self.script.local_candidates {
                let _ = tx.send(Some(candidate.clone()));
            }
            if self.script.gathering_completes {
                let _ = tx.send(None);
            }
        }
        if self.script.gathering_completes {
            if let Some(tx) = self.gathering_tx.lock().take() {
                let _ = tx.try_send(());
            }
        }
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: RTCSessionDescription,
    ) -> Result<(), DialError> {
        if self.script.fail_set_remote {
            return Err(DialError::negotiation("remote description rejected"));
        }
        *self.remote.lock() = Some(description);
        self.remote_set.store(true, Ordering::SeqCst);
        let channel = self.data_channel.lock().clone();
        if let Some(channel) = channel.filter(|_| self.script.open_on_remote) {
            channel.open();
        }
        Ok(())
    }

    async fn local_description(&self) -> Option<RTCSessionDescription> {
        self.local.lock().clone()
    }

    async fn add_ice_candidate(&self, candidate: RTCIceCandidateInit) -> Result<(), DialError> {
        if self.script.panic_on_add_candidate {
            panic!("engine crashed adding candidate");
        }
        if self.script.fail_add_candidate {
            return Err(DialError::negotiation("candidate rejected"));
        }
        if !self.remote_is_set() {
            return Err(DialError::negotiation("remote description not set"));
        }
        self.added.lock().push(candidate);
        Ok(())
    }

    async fn stats(&self) -> ConnectionStats {
        self.stats_queries.fetch_add(1, Ordering::SeqCst);
        let mut stats = ConnectionStats {
            id: "PeerConnection-fake".into(),
            ..Default::default()
        };
        for (ice_type, ip) in &self.script.remote_stats {
            stats.record_remote(ice_type, *ip);
        }
        stats
    }

    fn local_candidates(&self) -> mpsc::UnboundedReceiver<Option<RTCIceCandidateInit>> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.candidate_tx.lock() = Some(tx);
        rx
    }

    async fn gathering_complete(&self) -> mpsc::Receiver<()> {
        let (tx, rx) = mpsc::channel(1);
        *self.gathering_tx.lock() = Some(tx);
        rx
    }

    async fn close(&self) -> Result<(), DialError> {
        self.close_count.fetch_add(1, Ordering::SeqCst);
        let channel = self.data_channel.lock().clone();
        if let Some(channel) = channel {
            channel.closed.store(true, Ordering::SeqCst);
        }
        Ok(())
    }
}

pub struct FakeDataChannel {
    label: String,
    id: u16,
    opened: AtomicBool,
    closed: AtomicBool,
    close_count: AtomicUsize,
    on_open: Mutex<Option<OnOpenFn>>,
    on_error: Mutex<Option<Arc<dyn Fn(String) + Send + Sync>>>,
    on_message: Mutex<Option<Arc<dyn Fn(Bytes) + Send + Sync>>>,
    sent: Mutex<Vec<Bytes>>,
}

impl FakeDataChannel {
    fn new(label: &str, id: u16) -> Self {
        Self {
            label: label.to_string(),
            id,
            opened: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            close_count: AtomicUsize::new(0),
            on_open: Mutex::new(None),
            on_error: Mutex::new(None),
            on_message: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn open(&self) {
        self.opened.store(true, Ordering::SeqCst);
        let handler = self.on_open.lock().take();
        if let Some(handler) = handler {
            handler();
        }
    }

    pub fn fail(&self, err: &str) {
        let handler = self.on_error.lock().clone();
        if let Some(handler) = handler {
            handler(err.to_string());
        }
    }

    pub fn deliver(&self, data: &'static [u8]) {
        let handler = self.on_message.lock().clone();
        if let Some(handler) = handler {
            handler(Bytes::from_static(data));
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<Bytes> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl DataChannel for FakeDataChannel {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn id(&self) -> u16 {
        self.id
    }

    fn on_open(&self, handler: OnOpenFn) {
        if self.opened.load(Ordering::SeqCst) {
            handler();
        } else {
            *self.on_open.lock() = Some(handler);
        }
    }

    fn on_error(&self, handler: OnErrorFn) {
        *self.on_error.lock() = Some(Arc::from(handler));
    }

    fn on_message(&self, handler: OnMessageFn) {
        *self.on_message.lock() = Some(Arc::from(handler));
    }

    async fn send(&self, data: Bytes) -> Result<usize, DialError> {
        let len = data.len();
        self.sent.lock().push(data);
        Ok(len)
    }

    async fn close(&self) -> Result<(), DialError> {
        self.close_count.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// One step of the scripted inbound call stream.
#[derive(Debug, Clone)]
pub enum CallStep {
    Respond(CallResponse),
    Fail(SignalingError),
    Delay(Duration),
    /// Keep the stream open without sending anything else.
    Hang,
}

#[derive(Debug, Clone)]
pub struct RecordedUpdate {
    pub request: CallUpdateRequest,
    /// Whether the dialing endpoint had a remote description at send time.
    pub remote_was_set: bool,
    pub after_close: bool,
}

pub struct FakeSignaling {
    advised: AdvisedWebRtcConfig,
    config_error: Option<SignalingError>,
    call_error: Option<SignalingError>,
    answer_failures: Mutex<Vec<SignalingError>>,
    steps: Vec<CallStep>,
    engine: Option<Arc<FakeEngine>>,
    calls: Mutex<Vec<CallRequest>>,
    updates: Mutex<Vec<RecordedUpdate>>,
    held: Mutex<Vec<CallStreamSender>>,
    close_count: AtomicUsize,
    answer_tx: mpsc::UnboundedSender<ServiceAnswerEnds>,
    answer_rx: AsyncMutex<mpsc::UnboundedReceiver<ServiceAnswerEnds>>,
}

impl FakeSignaling {
    pub fn new(steps: Vec<CallStep>) -> Self {
        let (answer_tx, answer_rx) = mpsc::unbounded_channel();
        Self {
            advised: AdvisedWebRtcConfig::default(),
            config_error: None,
            call_error: None,
            answer_failures: Mutex::new(Vec::new()),
            steps,
            engine: None,
            calls: Mutex::new(Vec::new()),
            updates: Mutex::new(Vec::new()),
            held: Mutex::new(Vec::new()),
            close_count: AtomicUsize::new(0),
            answer_tx,
            answer_rx: AsyncMutex::new(answer_rx),
        }
    }

    pub fn with_advised(mut self, advised: AdvisedWebRtcConfig) -> Self {
        self.advised = advised;
        self
    }

    pub fn with_config_error(mut self, err: SignalingError) -> Self {
        self.config_error = Some(err);
        self
    }

    pub fn with_call_error(mut self, err: SignalingError) -> Self {
        self.call_error = Some(err);
        self
    }

    /// Fails the next `answer` once with `err`; queued failures are used in
    /// order.
    pub fn with_answer_failure(self, err: SignalingError) -> Self {
        self.answer_failures.lock().push(err);
        self
    }

    /// Lets recorded updates note whether the engine had a remote description.
    pub fn observing(mut self, engine: Arc<FakeEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn into_arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn calls(&self) -> Vec<CallRequest> {
        self.calls.lock().clone()
    }

    pub fn updates(&self) -> Vec<RecordedUpdate> {
        self.updates.lock().clone()
    }

    pub fn candidate_updates(&self) -> Vec<RecordedUpdate> {
        self.updates()
            .into_iter()
            .filter(|update| matches!(update.request.update, CallUpdate::Candidate { .. }))
            .collect()
    }

    pub fn terminal_updates(&self) -> Vec<CallUpdateRequest> {
        self.updates()
            .into_iter()
            .map(|update| update.request)
            .filter(CallUpdateRequest::is_terminal)
            .collect()
    }

    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }

    /// Waits for the next answer stream and returns the service's ends of it.
    pub async fn next_answer_stream(&self) -> ServiceAnswerEnds {
        self.answer_rx
            .lock()
            .await
            .recv()
            .await
            .expect("answer stream opened")
    }
}

#[async_trait]
impl SignalingClient for FakeSignaling {
    async fn optional_webrtc_config(
        &self,
    ) -> Result<OptionalWebRtcConfigResponse, SignalingError> {
        if let Some(err) = self.config_error.clone() {
            return Err(err);
        }
        Ok(OptionalWebRtcConfigResponse {
            config: self.advised.clone(),
        })
    }

    async fn call(&self, request: CallRequest) -> Result<CallStream, SignalingError> {
        self.calls.lock().push(request);
        if let Some(err) = self.call_error.clone() {
            return Err(err);
        }
        let (tx, stream) = CallStream::channel();
        let steps = self.steps.clone();
        if steps.iter().any(|step| matches!(step, CallStep::Hang)) {
            self.held.lock().push(tx.clone());
        }
        tokio::spawn(async move {
            for step in steps {
                match step {
                    CallStep::Respond(response) => {
                        let _ = tx.send(Ok(response));
                    }
                    CallStep::Fail(err) => {
                        let _ = tx.send(Err(err));
                    }
                    CallStep::Delay(delay) => tokio::time::sleep(delay).await,
                    CallStep::Hang => break,
                }
            }
        });
        Ok(stream)
    }

    async fn call_update(&self, request: CallUpdateRequest) -> Result<(), SignalingError> {
        let remote_was_set = self
            .engine
            .as_ref()
            .is_some_and(|engine| engine.remote_is_set());
        let after_close = self.close_count() > 0;
        self.updates.lock().push(RecordedUpdate {
            request,
            remote_was_set,
            after_close,
        });
        Ok(())
    }

    async fn answer(&self) -> Result<AnswerStream, SignalingError> {
        if let Some(err) = self.call_error.clone() {
            return Err(err);
        }
        let failure = {
            let mut failures = self.answer_failures.lock();
            (!failures.is_empty()).then(|| failures.remove(0))
        };
        if let Some(err) = failure {
            return Err(err);
        }
        let (stream, requests, responses) = AnswerStream::channel();
        self.answer_tx
            .send((requests, responses))
            .map_err(|_| SignalingError::Closed)?;
        Ok(stream)
    }

    async fn close(&self) -> Result<(), SignalingError> {
        self.close_count.fetch_add(1, Ordering::SeqCst);
        self.held.lock().clear();
        Ok(())
    }
}

/// Hands out one shared [`FakeSignaling`] and records how it was reached.
pub struct FakeConnector {
    client: Arc<FakeSignaling>,
    delay: Option<Duration>,
    connects: Mutex<Vec<(String, ConnectOptions)>>,
}

impl FakeConnector {
    pub fn new(client: Arc<FakeSignaling>) -> Arc<Self> {
        Arc::new(Self {
            client,
            delay: None,
            connects: Mutex::new(Vec::new()),
        })
    }

    pub fn delayed(client: Arc<FakeSignaling>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            client,
            delay: Some(delay),
            connects: Mutex::new(Vec::new()),
        })
    }

    pub fn connects(&self) -> Vec<(String, ConnectOptions)> {
        self.connects.lock().clone()
    }
}

#[async_trait]
impl SignalingConnector for FakeConnector {
    async fn connect(
        &self,
        address: &str,
        options: &ConnectOptions,
    ) -> Result<Arc<dyn SignalingClient>, SignalingError> {
        self.connects
            .lock()
            .push((address.to_string(), options.clone()));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.client.clone())
    }
}

pub fn unimplemented() -> SignalingError {
    SignalingError::Status(Status::unimplemented("webrtc signaling not available"))
}

/// Polls until `condition` holds. Callers rely on the test timeout.
pub async fn eventually(condition: impl Fn() -> bool) {
    while !condition() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
