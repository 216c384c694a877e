//! Answering side of the exchange.
//!
//! Mirrors the offer side: the first inbound message carries the offer, the
//! answer goes back as `init`, and only then are local candidates relayed.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::WebRtcChannel;
use crate::config::WebRtcConfig;
use crate::error::{DialError, SignalingError};
use crate::exchange::{
    ErrorReporter, ExchangeSink, Terminal, Termination, apply_remote_candidate, await_channel,
    conclude, relay_local_candidates, spawn_reporting,
};
use crate::factory::{NewPeer, new_peer_connection_for_server};
use crate::peer::{PeerConnection, PeerEngine};
use crate::proto::{AnswerRequestStage, AnswerResponse, AnswerResponseStage, IceCandidate};
use crate::sdp::encode_sdp;
use crate::session::{NegotiationMode, NegotiationSession, Role, SessionOutcome};
use crate::signaling::{AnswerStream, ConnectOptions, SignalingClient, SignalingConnector};

pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Answer-side sink: everything goes back over the answer stream.
pub struct AnswerSink {
    outbound: mpsc::UnboundedSender<AnswerResponse>,
}

impl AnswerSink {
    pub fn new(outbound: mpsc::UnboundedSender<AnswerResponse>) -> Self {
        Self { outbound }
    }

    fn send(&self, uuid: &str, stage: AnswerResponseStage) -> Result<(), DialError> {
        self.outbound
            .send(AnswerResponse {
                uuid: uuid.to_string(),
                stage,
            })
            .map_err(|_| DialError::Signaling(SignalingError::Closed))
    }
}

#[async_trait]
impl ExchangeSink for AnswerSink {
    async fn send_candidate(&self, uuid: &str, candidate: IceCandidate) -> Result<(), DialError> {
        self.send(uuid, AnswerResponseStage::Update { candidate })
    }

    async fn send_terminal(&self, uuid: &str, terminal: Terminal) -> Result<(), DialError> {
        let stage = match terminal {
            Terminal::Done => AnswerResponseStage::Done,
            Terminal::Error(status) => AnswerResponseStage::Error { status },
        };
        self.send(uuid, stage)
    }
}

/// Answers one forwarded call: waits for the offer on a fresh answer stream,
/// builds a server-role endpoint, and runs the exchange until the channel is
/// ready.
pub async fn answer_call(
    ctx: &CancellationToken,
    client: &dyn SignalingClient,
    engine: &dyn PeerEngine,
    config: &WebRtcConfig,
) -> Result<Arc<WebRtcChannel>, DialError> {
    let mut stream = tokio::select! {
        biased;
        _ = ctx.cancelled() => return Err(DialError::Canceled),
        result = client.answer() => result.map_err(|err| {
            if err.is_unimplemented() {
                DialError::NoSignaler
            } else {
                DialError::Signaling(err)
            }
        })?,
    };

    let request = tokio::select! {
        biased;
        _ = ctx.cancelled() => return Err(DialError::Canceled),
        request = stream.recv() => request?,
    };
    let Some(request) = request else {
        return Err(DialError::Signaling(SignalingError::Closed));
    };
    let (sdp, disable_trickle) = match request.stage {
        Some(AnswerRequestStage::Init {
            sdp,
            disable_trickle,
        }) => (sdp, disable_trickle),
        Some(AnswerRequestStage::Update { .. }) => {
            return Err(reject(
                &stream,
                &request.uuid,
                DialError::protocol("got update stage before init stage"),
            ));
        }
        Some(AnswerRequestStage::Error { status }) => return Err(DialError::Remote(status)),
        Some(AnswerRequestStage::Done) | None => {
            return Err(reject(
                &stream,
                &request.uuid,
                DialError::protocol(format!("unexpected stage before init for {}", request.uuid)),
            ));
        }
    };

    let mode = NegotiationMode::from_disable_trickle(disable_trickle);
    let session = Arc::new(NegotiationSession::new(mode, Role::Server));
    session.assign_id(&request.uuid)?;
    debug!(uuid = %request.uuid, %mode, "answering call");

    let exchange = ctx.child_token();
    let _teardown = exchange.clone().drop_guard();
    let sink: Arc<dyn ExchangeSink> = Arc::new(AnswerSink::new(stream.responder()));
    let termination = Arc::new(Termination::new(
        Arc::clone(&session),
        exchange.clone(),
        Arc::clone(&sink),
    ));

    let NewPeer {
        peer,
        data_channel,
        candidates,
    } = match new_peer_connection_for_server(ctx, engine, &sdp, config, mode).await {
        Ok(new_peer) => new_peer,
        Err(err) => return Err(fail_early(&session, &termination, err).await),
    };

    if let Err(err) = send_answer(&stream, &session, &peer).await {
        let err = err.combine(peer.close().await);
        return Err(fail_early(&session, &termination, err).await);
    }

    let channel = WebRtcChannel::new(Role::Server, Arc::clone(&peer), data_channel);
    let (reporter, mut errors) = ErrorReporter::channel(exchange.clone());
    // The offer is already applied; relaying is gated on the answer being out.
    let (ready_tx, ready_rx) = watch::channel(true);
    drop(ready_tx);

    match candidates {
        Some(feed) => {
            spawn_reporting(
                "candidate relay",
                reporter.clone(),
                relay_local_candidates(
                    feed,
                    ready_rx,
                    Arc::clone(&session),
                    Arc::clone(&sink),
                    Arc::clone(&termination),
                ),
            );
        }
        None => {
            if let Err(err) = termination.send_done().await {
                let err = err.combine(channel.close().await);
                return conclude(&session, &termination, channel, Err(err)).await;
            }
        }
    }
    spawn_reporting(
        "answer receiver",
        reporter.clone(),
        receive_answer_requests(stream, Arc::clone(&session), Arc::clone(&peer)),
    );

    let outcome = await_channel(ctx, &channel, &mut errors).await;
    conclude(&session, &termination, channel, outcome).await
}

async fn send_answer(
    stream: &AnswerStream,
    session: &NegotiationSession,
    peer: &PeerConnection,
) -> Result<(), DialError> {
    let local = peer
        .endpoint()
        .local_description()
        .await
        .ok_or_else(|| DialError::negotiation("local description missing"))?;
    stream.send(AnswerResponse {
        uuid: session.id().unwrap_or_default().to_string(),
        stage: AnswerResponseStage::Init {
            sdp: encode_sdp(&local)?,
        },
    })?;
    Ok(())
}

// Failure before the channel exists: report it on the stream and settle the
// session.
async fn fail_early(
    session: &NegotiationSession,
    termination: &Termination,
    err: DialError,
) -> DialError {
    session.finish(if err.is_canceled() {
        SessionOutcome::Canceled
    } else {
        SessionOutcome::Errored
    });
    warn!(uuid = ?session.id(), error = %err, "answering call failed");
    let reported = termination.send_error(err.to_status()).await;
    err.combine(reported)
}

fn reject(stream: &AnswerStream, uuid: &str, err: DialError) -> DialError {
    let reported = stream
        .send(AnswerResponse {
            uuid: uuid.to_string(),
            stage: AnswerResponseStage::Error {
                status: err.to_status(),
            },
        })
        .map_err(DialError::from);
    err.combine(reported)
}

async fn receive_answer_requests(
    mut stream: AnswerStream,
    session: Arc<NegotiationSession>,
    peer: Arc<PeerConnection>,
) -> Result<(), DialError> {
    loop {
        let Some(request) = stream.recv().await? else {
            return Ok(());
        };
        match request.stage {
            Some(AnswerRequestStage::Init { .. }) => {
                session.assign_id(&request.uuid)?;
            }
            Some(AnswerRequestStage::Update { candidate }) => {
                apply_remote_candidate(&session, &peer, &request.uuid, &candidate).await?;
            }
            Some(AnswerRequestStage::Done) => {
                session.check_update(&request.uuid)?;
                debug!(uuid = %request.uuid, "caller finished sending candidates");
                return Ok(());
            }
            Some(AnswerRequestStage::Error { status }) => {
                session.check_update(&request.uuid)?;
                return Err(DialError::Remote(status));
            }
            None => {
                return Err(DialError::protocol(format!(
                    "unexpected stage in answer request for {}",
                    request.uuid
                )));
            }
        }
    }
}

/// Keeps answering calls forwarded by a signaling service and hands every
/// established channel to the caller.
pub struct WebRtcSignalingAnswerer {
    address: String,
    options: ConnectOptions,
    connector: Arc<dyn SignalingConnector>,
    engine: Arc<dyn PeerEngine>,
    config: WebRtcConfig,
    retry_delay: Duration,
}

impl WebRtcSignalingAnswerer {
    pub fn new(
        address: impl Into<String>,
        options: ConnectOptions,
        connector: Arc<dyn SignalingConnector>,
        engine: Arc<dyn PeerEngine>,
        config: WebRtcConfig,
    ) -> Self {
        Self {
            address: address.into(),
            options,
            connector,
            engine,
            config,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Runs until `ctx` is canceled or the returned receiver is dropped. The
    /// handle yields an error only when the service cannot forward calls at
    /// all ([`DialError::NoSignaler`]); the caller decides what to fall back
    /// to.
    pub fn start(
        self,
        ctx: CancellationToken,
    ) -> (
        JoinHandle<Result<(), DialError>>,
        mpsc::Receiver<Arc<WebRtcChannel>>,
    ) {
        let (tx, rx) = mpsc::channel(1);
        let handle = tokio::spawn(async move { self.run(ctx, tx).await });
        (handle, rx)
    }

    async fn run(
        self,
        ctx: CancellationToken,
        channels: mpsc::Sender<Arc<WebRtcChannel>>,
    ) -> Result<(), DialError> {
        info!(address = %self.address, "webrtc answerer started");
        let result = self.serve(&ctx, &channels).await;
        match &result {
            Ok(()) => info!(address = %self.address, "webrtc answerer stopped"),
            Err(err) => warn!(address = %self.address, error = %err, "webrtc answerer gave up"),
        }
        result
    }

    async fn serve(
        &self,
        ctx: &CancellationToken,
        channels: &mpsc::Sender<Arc<WebRtcChannel>>,
    ) -> Result<(), DialError> {
        'connect: while !ctx.is_cancelled() {
            let client = tokio::select! {
                biased;
                _ = ctx.cancelled() => break,
                result = self.connector.connect(&self.address, &self.options) => result,
            };
            let client = match client {
                Ok(client) => client,
                Err(err) => {
                    warn!(
                        address = %self.address,
                        error = %err,
                        "answerer failed to connect to signaling service"
                    );
                    if !self.back_off(ctx).await {
                        break;
                    }
                    continue;
                }
            };

            loop {
                match answer_call(ctx, client.as_ref(), self.engine.as_ref(), &self.config).await {
                    Ok(channel) => {
                        if !deliver(ctx, channels, channel).await {
                            self.close_client(client.as_ref()).await;
                            break 'connect;
                        }
                    }
                    Err(err) if err.is_canceled() => {
                        self.close_client(client.as_ref()).await;
                        break 'connect;
                    }
                    Err(err) if err.is_no_signaler() => {
                        self.close_client(client.as_ref()).await;
                        return Err(err);
                    }
                    Err(err) => {
                        warn!(address = %self.address, error = %err, "answering call failed");
                        let reconnect = matches!(err.primary(), DialError::Signaling(_));
                        if !self.back_off(ctx).await {
                            self.close_client(client.as_ref()).await;
                            break 'connect;
                        }
                        if reconnect {
                            self.close_client(client.as_ref()).await;
                            continue 'connect;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    async fn close_client(&self, client: &dyn SignalingClient) {
        if let Err(err) = client.close().await {
            warn!(
                address = %self.address,
                error = %err,
                "closing signaling connection failed"
            );
        }
    }

    async fn back_off(&self, ctx: &CancellationToken) -> bool {
        tokio::select! {
            _ = ctx.cancelled() => false,
            _ = tokio::time::sleep(self.retry_delay) => true,
        }
    }
}

// Hands the channel over unless the answerer is stopped first, in which case
// the channel is closed. Returns whether the answerer should keep going.
async fn deliver(
    ctx: &CancellationToken,
    channels: &mpsc::Sender<Arc<WebRtcChannel>>,
    channel: Arc<WebRtcChannel>,
) -> bool {
    let delivered = tokio::select! {
        biased;
        _ = ctx.cancelled() => false,
        result = channels.send(Arc::clone(&channel)) => result.is_ok(),
    };
    if !delivered {
        if let Err(err) = channel.close().await {
            warn!(error = %err, "closing undelivered channel failed");
        }
    }
    delivered
}
