//! Client side of the signaling service.
//!
//! [`SignalingConnector`] opens the control connection; [`SignalingClient`]
//! carries the unary requests and the two streaming exchanges over it.

pub mod ws;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::SignalingError;
use crate::proto::{
    AnswerRequest, AnswerResponse, CallRequest, CallResponse, CallUpdateRequest,
    OptionalWebRtcConfigResponse,
};

pub use ws::WsSignalingConnector;

#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    /// Plain `ws://` instead of `wss://`.
    pub insecure: bool,
    /// Logical host behind the signaling address, sent as request metadata.
    pub host: Option<String>,
}

#[async_trait]
pub trait SignalingConnector: Send + Sync {
    async fn connect(
        &self,
        address: &str,
        options: &ConnectOptions,
    ) -> Result<Arc<dyn SignalingClient>, SignalingError>;
}

#[async_trait]
pub trait SignalingClient: Send + Sync {
    async fn optional_webrtc_config(
        &self,
    ) -> Result<OptionalWebRtcConfigResponse, SignalingError>;

    /// Opens the offer-side exchange with the initial request.
    async fn call(&self, request: CallRequest) -> Result<CallStream, SignalingError>;

    async fn call_update(&self, request: CallUpdateRequest) -> Result<(), SignalingError>;

    /// Registers as an answerer and opens a stream of forwarded offers.
    async fn answer(&self) -> Result<AnswerStream, SignalingError>;

    /// Closes the control connection. Pending requests and streams fail with
    /// [`SignalingError::Closed`].
    async fn close(&self) -> Result<(), SignalingError>;
}

pub type CallStreamSender = mpsc::UnboundedSender<Result<CallResponse, SignalingError>>;

/// Inbound half of an offer-side exchange. Dropping every sender is a clean end.
#[derive(Debug)]
pub struct CallStream {
    inbound: mpsc::UnboundedReceiver<Result<CallResponse, SignalingError>>,
}

impl CallStream {
    pub fn new(inbound: mpsc::UnboundedReceiver<Result<CallResponse, SignalingError>>) -> Self {
        Self { inbound }
    }

    pub fn channel() -> (CallStreamSender, CallStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, CallStream::new(rx))
    }

    /// `Ok(None)` once the stream has ended cleanly.
    pub async fn recv(&mut self) -> Result<Option<CallResponse>, SignalingError> {
        self.inbound.recv().await.transpose()
    }
}

pub type AnswerRequestSender = mpsc::UnboundedSender<Result<AnswerRequest, SignalingError>>;

/// Both halves of an answerer stream.
#[derive(Debug)]
pub struct AnswerStream {
    outbound: mpsc::UnboundedSender<AnswerResponse>,
    inbound: mpsc::UnboundedReceiver<Result<AnswerRequest, SignalingError>>,
}

impl AnswerStream {
    pub fn new(
        outbound: mpsc::UnboundedSender<AnswerResponse>,
        inbound: mpsc::UnboundedReceiver<Result<AnswerRequest, SignalingError>>,
    ) -> Self {
        Self { outbound, inbound }
    }

    /// Returns the stream plus the service's ends of it.
    pub fn channel() -> (
        AnswerStream,
        AnswerRequestSender,
        mpsc::UnboundedReceiver<AnswerResponse>,
    ) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        (AnswerStream::new(out_tx, in_rx), in_tx, out_rx)
    }

    pub fn send(&self, response: AnswerResponse) -> Result<(), SignalingError> {
        self.outbound
            .send(response)
            .map_err(|_| SignalingError::Closed)
    }

    pub fn responder(&self) -> mpsc::UnboundedSender<AnswerResponse> {
        self.outbound.clone()
    }

    pub async fn recv(&mut self) -> Result<Option<AnswerRequest>, SignalingError> {
        self.inbound.recv().await.transpose()
    }
}
