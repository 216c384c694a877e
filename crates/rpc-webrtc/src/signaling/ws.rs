//! Signaling over a single WebSocket control connection.
//!
//! Every client frame carries an `id` chosen by the client; the service echoes
//! it on replies and stream messages, so unary requests and streams share the
//! socket. Frames are JSON text messages tagged by `type`.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message, error::ProtocolError};
use tracing::{debug, trace, warn};
use url::Url;

use super::{AnswerStream, CallStream, ConnectOptions, SignalingClient, SignalingConnector};
use crate::error::SignalingError;
use crate::proto::{
    AnswerRequest, AnswerResponse, CallRequest, CallResponse, CallUpdateRequest,
    OptionalWebRtcConfigResponse, Status,
};
use crate::session::OnceGuard;

pub const SIGNALING_PATH: &str = "/webrtc/signaling";
pub const HOST_HEADER: &str = "rpc-host";

const CLOSE_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    OptionalWebrtcConfig {
        id: u64,
    },
    Call {
        id: u64,
        request: CallRequest,
    },
    CallUpdate {
        id: u64,
        request: CallUpdateRequest,
    },
    Answer {
        id: u64,
    },
    AnswerResponse {
        id: u64,
        response: AnswerResponse,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    OptionalWebrtcConfig {
        id: u64,
        response: OptionalWebRtcConfigResponse,
    },
    /// A `call` or `answer` stream was opened.
    Accepted {
        id: u64,
    },
    CallResponse {
        id: u64,
        response: CallResponse,
    },
    /// Acknowledges a `call_update`.
    CallUpdate {
        id: u64,
    },
    AnswerRequest {
        id: u64,
        request: AnswerRequest,
    },
    /// Clean end of a stream.
    End {
        id: u64,
    },
    Error {
        id: u64,
        status: Status,
    },
}

impl ServerFrame {
    pub fn id(&self) -> u64 {
        match self {
            ServerFrame::OptionalWebrtcConfig { id, .. }
            | ServerFrame::Accepted { id }
            | ServerFrame::CallResponse { id, .. }
            | ServerFrame::CallUpdate { id }
            | ServerFrame::AnswerRequest { id, .. }
            | ServerFrame::End { id }
            | ServerFrame::Error { id, .. } => *id,
        }
    }
}

/// Builds the control connection URL for a signaling address. Bare
/// `host:port` addresses get `wss://` (or `ws://` when insecure).
pub fn signaling_url(address: &str, insecure: bool) -> Result<Url, SignalingError> {
    let raw = if address.contains("://") {
        address.to_string()
    } else {
        let scheme = if insecure { "ws" } else { "wss" };
        format!("{scheme}://{address}")
    };
    let mut url = Url::parse(&raw).map_err(|err| {
        SignalingError::Transport(format!("invalid signaling address {address}: {err}"))
    })?;
    let scheme = match url.scheme() {
        "ws" | "wss" => None,
        "http" => Some("ws"),
        "https" => Some("wss"),
        other => {
            return Err(SignalingError::Transport(format!(
                "unsupported signaling scheme {other}"
            )));
        }
    };
    if let Some(scheme) = scheme {
        url.set_scheme(scheme)
            .map_err(|_| SignalingError::Transport("invalid websocket scheme".into()))?;
    }
    url.set_path(SIGNALING_PATH);
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WsSignalingConnector;

impl WsSignalingConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SignalingConnector for WsSignalingConnector {
    async fn connect(
        &self,
        address: &str,
        options: &ConnectOptions,
    ) -> Result<Arc<dyn SignalingClient>, SignalingError> {
        let client = WsSignalingClient::connect(address, options).await?;
        Ok(client)
    }
}

enum Outbound {
    Frame(ClientFrame),
    Close,
}

type Opened = oneshot::Sender<Result<(), SignalingError>>;

enum Pending {
    Unary(oneshot::Sender<Result<ServerFrame, SignalingError>>),
    Call {
        opened: Option<Opened>,
        inbound: mpsc::UnboundedSender<Result<CallResponse, SignalingError>>,
    },
    Answer {
        opened: Option<Opened>,
        inbound: mpsc::UnboundedSender<Result<AnswerRequest, SignalingError>>,
    },
}

impl Pending {
    fn fail(self, err: SignalingError) {
        match self {
            Pending::Unary(reply) => {
                let _ = reply.send(Err(err));
            }
            Pending::Call { opened, inbound } => match opened {
                Some(opened) => {
                    let _ = opened.send(Err(err));
                }
                None => {
                    let _ = inbound.send(Err(err));
                }
            },
            Pending::Answer { opened, inbound } => match opened {
                Some(opened) => {
                    let _ = opened.send(Err(err));
                }
                None => {
                    let _ = inbound.send(Err(err));
                }
            },
        }
    }

    fn take_opened(&mut self) -> Option<Opened> {
        match self {
            Pending::Unary(_) => None,
            Pending::Call { opened, .. } | Pending::Answer { opened, .. } => opened.take(),
        }
    }
}

#[derive(Default)]
struct Requests {
    pending: HashMap<u64, Pending>,
    closed: bool,
}

impl Requests {
    fn fail_all(&mut self, err: SignalingError) {
        self.closed = true;
        for (_, pending) in self.pending.drain() {
            pending.fail(err.clone());
        }
    }
}

pub struct WsSignalingClient {
    send_tx: mpsc::UnboundedSender<Outbound>,
    next_id: AtomicU64,
    requests: Arc<Mutex<Requests>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: OnceGuard,
}

impl WsSignalingClient {
    pub async fn connect(
        address: &str,
        options: &ConnectOptions,
    ) -> Result<Arc<Self>, SignalingError> {
        let url = signaling_url(address, options.insecure)?;
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|err| SignalingError::Transport(err.to_string()))?;
        if let Some(host) = options.host.as_deref() {
            let value = HeaderValue::from_str(host)
                .map_err(|err| SignalingError::Transport(format!("invalid host {host}: {err}")))?;
            request.headers_mut().insert(HOST_HEADER, value);
        }

        let (ws_stream, _) = connect_async(request)
            .await
            .map_err(|err| SignalingError::Transport(format!("websocket connect failed: {err}")))?;
        debug!(url = %url, host = ?options.host, "signaling websocket connected");
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let (send_tx, mut send_rx) = mpsc::unbounded_channel::<Outbound>();
        let requests = Arc::new(Mutex::new(Requests::default()));

        let writer = tokio::spawn(async move {
            while let Some(outbound) = send_rx.recv().await {
                match outbound {
                    Outbound::Frame(frame) => {
                        let text = match serde_json::to_string(&frame) {
                            Ok(text) => text,
                            Err(err) => {
                                warn!(error = %err, "failed to encode signaling frame");
                                continue;
                            }
                        };
                        trace!(event = "ws_out", len = text.len());
                        if ws_write.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Outbound::Close => {
                        let _ = ws_write.send(Message::Close(None)).await;
                        if let Err(err) = ws_write.close().await {
                            debug!(error = %err, "closing signaling websocket");
                        }
                        break;
                    }
                }
            }
        });

        let reader_requests = Arc::clone(&requests);
        let reader = tokio::spawn(async move {
            while let Some(message) = ws_read.next().await {
                let text = match message {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Binary(data)) => match String::from_utf8(data) {
                        Ok(text) => text,
                        Err(_) => continue,
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => {
                        match &err {
                            WsError::ConnectionClosed
                            | WsError::AlreadyClosed
                            | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                                debug!("signaling websocket closed: {err}");
                            }
                            _ => warn!("signaling websocket error: {err}"),
                        }
                        break;
                    }
                };
                trace!(event = "ws_in", len = text.len());
                match serde_json::from_str::<ServerFrame>(&text) {
                    Ok(frame) => dispatch(&reader_requests, frame),
                    Err(err) => warn!(error = %err, "ignoring malformed signaling frame"),
                }
            }
            reader_requests.lock().fail_all(SignalingError::Closed);
        });

        Ok(Arc::new(WsSignalingClient {
            send_tx,
            next_id: AtomicU64::new(1),
            requests,
            tasks: Mutex::new(vec![writer, reader]),
            closed: OnceGuard::new(),
        }))
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn register(&self, id: u64, pending: Pending) -> Result<PendingEntry<'_>, SignalingError> {
        let mut requests = self.requests.lock();
        if requests.closed {
            return Err(SignalingError::Closed);
        }
        requests.pending.insert(id, pending);
        Ok(PendingEntry {
            requests: &self.requests,
            id,
            armed: true,
        })
    }

    fn send(&self, frame: ClientFrame) -> Result<(), SignalingError> {
        self.send_tx
            .send(Outbound::Frame(frame))
            .map_err(|_| SignalingError::Closed)
    }

    async fn unary(
        &self,
        frame: impl FnOnce(u64) -> ClientFrame,
    ) -> Result<ServerFrame, SignalingError> {
        let id = self.next_id();
        let (reply_tx, reply_rx) = oneshot::channel();
        let _entry = self.register(id, Pending::Unary(reply_tx))?;
        self.send(frame(id))?;
        reply_rx.await.map_err(|_| SignalingError::Closed)?
    }

    async fn open(
        &self,
        id: u64,
        pending: Pending,
        frame: ClientFrame,
        opened: oneshot::Receiver<Result<(), SignalingError>>,
    ) -> Result<(), SignalingError> {
        let entry = self.register(id, pending)?;
        self.send(frame)?;
        opened.await.map_err(|_| SignalingError::Closed)??;
        entry.keep();
        Ok(())
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.requests.lock().pending.len()
    }
}

/// Removes a request from the pending table when dropped, unless kept, so an
/// abandoned request does not linger until the connection closes.
struct PendingEntry<'a> {
    requests: &'a Mutex<Requests>,
    id: u64,
    armed: bool,
}

impl PendingEntry<'_> {
    fn keep(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingEntry<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.requests.lock().pending.remove(&self.id);
        }
    }
}

fn dispatch(requests: &Mutex<Requests>, frame: ServerFrame) {
    let mut requests = requests.lock();
    let id = frame.id();
    match frame {
        ServerFrame::Accepted { .. } => {
            if let Some(opened) = requests.pending.get_mut(&id).and_then(Pending::take_opened) {
                let _ = opened.send(Ok(()));
            }
        }
        ServerFrame::CallResponse { response, .. } => {
            if let Some(Pending::Call { inbound, .. }) = requests.pending.get(&id) {
                let _ = inbound.send(Ok(response));
            }
        }
        ServerFrame::AnswerRequest { request, .. } => {
            if let Some(Pending::Answer { inbound, .. }) = requests.pending.get(&id) {
                let _ = inbound.send(Ok(request));
            }
        }
        ServerFrame::End { .. } => {
            // Dropping the entry drops the stream's sender.
            if let Some(mut pending) = requests.pending.remove(&id) {
                if let Some(opened) = pending.take_opened() {
                    let _ = opened.send(Ok(()));
                }
            }
        }
        ServerFrame::Error { status, .. } => {
            if let Some(pending) = requests.pending.remove(&id) {
                pending.fail(SignalingError::Status(status));
            }
        }
        frame @ (ServerFrame::OptionalWebrtcConfig { .. } | ServerFrame::CallUpdate { .. }) => {
            match requests.pending.remove(&id) {
                Some(Pending::Unary(reply)) => {
                    let _ = reply.send(Ok(frame));
                }
                Some(other) => {
                    requests.pending.insert(id, other);
                }
                None => {}
            }
        }
    }
}

#[async_trait]
impl SignalingClient for WsSignalingClient {
    async fn optional_webrtc_config(
        &self,
    ) -> Result<OptionalWebRtcConfigResponse, SignalingError> {
        match self
            .unary(|id| ClientFrame::OptionalWebrtcConfig { id })
            .await?
        {
            ServerFrame::OptionalWebrtcConfig { response, .. } => Ok(response),
            other => Err(SignalingError::Transport(format!(
                "unexpected reply to optional_webrtc_config: {other:?}"
            ))),
        }
    }

    async fn call(&self, request: CallRequest) -> Result<CallStream, SignalingError> {
        let id = self.next_id();
        let (opened_tx, opened_rx) = oneshot::channel();
        let (inbound, stream) = CallStream::channel();
        let pending = Pending::Call {
            opened: Some(opened_tx),
            inbound,
        };
        self.open(id, pending, ClientFrame::Call { id, request }, opened_rx)
            .await?;
        Ok(stream)
    }

    async fn call_update(&self, request: CallUpdateRequest) -> Result<(), SignalingError> {
        match self
            .unary(|id| ClientFrame::CallUpdate { id, request })
            .await?
        {
            ServerFrame::CallUpdate { .. } => Ok(()),
            other => Err(SignalingError::Transport(format!(
                "unexpected reply to call_update: {other:?}"
            ))),
        }
    }

    async fn answer(&self) -> Result<AnswerStream, SignalingError> {
        let id = self.next_id();
        let (opened_tx, opened_rx) = oneshot::channel();
        let (stream, inbound, mut responses) = AnswerStream::channel();
        let pending = Pending::Answer {
            opened: Some(opened_tx),
            inbound,
        };
        self.open(id, pending, ClientFrame::Answer { id }, opened_rx)
            .await?;

        let send_tx = self.send_tx.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(response) = responses.recv().await {
                let frame = ClientFrame::AnswerResponse { id, response };
                if send_tx.send(Outbound::Frame(frame)).is_err() {
                    break;
                }
            }
        });
        self.tasks.lock().push(forwarder);
        Ok(stream)
    }

    async fn close(&self) -> Result<(), SignalingError> {
        if !self.closed.try_claim() {
            return Ok(());
        }
        let _ = self.send_tx.send(Outbound::Close);
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        let mut tasks = tasks.into_iter();
        if let Some(writer) = tasks.next() {
            if tokio::time::timeout(CLOSE_GRACE, writer).await.is_err() {
                debug!("signaling writer did not finish before close grace period");
            }
        }
        for task in tasks {
            task.abort();
        }
        self.requests.lock().fail_all(SignalingError::Closed);
        debug!("signaling connection closed");
        Ok(())
    }
}

impl Drop for WsSignalingClient {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}
