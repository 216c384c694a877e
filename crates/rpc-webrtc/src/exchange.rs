//! The signaling exchange that turns a fresh endpoint into a ready channel.
//!
//! Three actors take part: the orchestrating task, a receiver draining the
//! inbound stream, and (trickle mode only) a relay forwarding local
//! candidates. They share exactly three things: an error funnel towards the
//! orchestrator, a broadcast-once "remote description ready" signal, and the
//! one-shot termination record.

use std::any::Any;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::candidate::{from_wire, to_wire};
use crate::channel::WebRtcChannel;
use crate::error::{DialError, SignalingError};
use crate::factory::{CandidateFeed, NewPeer};
use crate::peer::PeerConnection;
use crate::proto::{
    CallRequest, CallResponseStage, CallUpdate, CallUpdateRequest, IceCandidate, Status,
};
use crate::sdp::{decode_sdp, encode_sdp};
use crate::session::{NegotiationMode, NegotiationSession, Role, SessionOutcome};
use crate::signaling::{CallStream, SignalingClient};

/// Terminal update of an exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Terminal {
    Done,
    Error(Status),
}

/// Outbound half of an exchange, as seen by the shared plumbing.
#[async_trait]
pub trait ExchangeSink: Send + Sync {
    async fn send_candidate(&self, uuid: &str, candidate: IceCandidate) -> Result<(), DialError>;

    async fn send_terminal(&self, uuid: &str, terminal: Terminal) -> Result<(), DialError>;
}

/// Sends the termination record at most once per session, whichever path
/// gets there first. Nothing is sent once the exchange has been torn down.
///
/// The claim is held for the whole send: a later caller returns only after the
/// first send has finished.
pub struct Termination {
    claimed: Mutex<bool>,
    session: Arc<NegotiationSession>,
    exchange: CancellationToken,
    sink: Arc<dyn ExchangeSink>,
}

impl Termination {
    pub fn new(
        session: Arc<NegotiationSession>,
        exchange: CancellationToken,
        sink: Arc<dyn ExchangeSink>,
    ) -> Self {
        Self {
            claimed: Mutex::new(false),
            session,
            exchange,
            sink,
        }
    }

    pub async fn send_done(&self) -> Result<(), DialError> {
        self.send(Terminal::Done).await
    }

    pub async fn send_error(&self, status: Status) -> Result<(), DialError> {
        self.send(Terminal::Error(status)).await
    }

    /// True once a send has been claimed, including one still in flight.
    #[cfg(test)]
    fn is_sent(&self) -> bool {
        self.claimed.try_lock().map_or(true, |claimed| *claimed)
    }

    async fn send(&self, terminal: Terminal) -> Result<(), DialError> {
        let mut claimed = self.claimed.lock().await;
        if *claimed {
            return Ok(());
        }
        *claimed = true;
        if self.exchange.is_cancelled() {
            debug!(?terminal, "exchange torn down; termination record not sent");
            return Ok(());
        }
        let uuid = self.session.id().unwrap_or_default().to_string();
        debug!(%uuid, ?terminal, "sending termination record");
        tokio::select! {
            biased;
            _ = self.exchange.cancelled() => Err(DialError::Canceled),
            result = self.sink.send_terminal(&uuid, terminal) => result,
        }
    }
}

/// Funnel from background tasks to the orchestrator. Reporting never blocks
/// past teardown of the exchange.
#[derive(Clone)]
pub struct ErrorReporter {
    tx: mpsc::Sender<DialError>,
    exchange: CancellationToken,
}

impl ErrorReporter {
    pub fn channel(exchange: CancellationToken) -> (Self, mpsc::Receiver<DialError>) {
        let (tx, rx) = mpsc::channel(1);
        (Self { tx, exchange }, rx)
    }

    pub async fn report(&self, err: DialError) {
        tokio::select! {
            biased;
            _ = self.exchange.cancelled() => {
                debug!(error = %err, "exchange already finished; dropping error");
            }
            _ = self.tx.send(err.clone()) => {}
        }
    }
}

/// Runs an exchange task until it finishes or the exchange is torn down. Its
/// error, or its panic, goes to the reporter.
pub fn spawn_reporting<F>(name: &'static str, reporter: ErrorReporter, task: F) -> JoinHandle<()>
where
    F: Future<Output = Result<(), DialError>> + Send + 'static,
{
    let exchange = reporter.exchange.clone();
    let inner = tokio::spawn(async move {
        tokio::select! {
            biased;
            _ = exchange.cancelled() => Ok(()),
            result = task => result,
        }
    });
    tokio::spawn(async move {
        match inner.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => reporter.report(err).await,
            Err(join) if join.is_panic() => {
                let message = panic_message(join.into_panic());
                error!(task = name, panic = %message, "exchange task panicked");
                reporter.report(DialError::TaskPanicked(message)).await;
            }
            Err(_) => {}
        }
    })
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(message) => *message,
        Err(payload) => match payload.downcast::<&'static str>() {
            Ok(message) => (*message).to_string(),
            Err(_) => "unknown panic".to_string(),
        },
    }
}

pub async fn remote_description_ready(mut ready: watch::Receiver<bool>) -> bool {
    ready.wait_for(|ready| *ready).await.is_ok()
}

/// Forwards local candidates once the remote description is applied. Earlier
/// candidates wait in the feed. The end of gathering sends the termination
/// record instead of a candidate.
pub async fn relay_local_candidates(
    mut feed: CandidateFeed,
    ready: watch::Receiver<bool>,
    session: Arc<NegotiationSession>,
    sink: Arc<dyn ExchangeSink>,
    termination: Arc<Termination>,
) -> Result<(), DialError> {
    if !remote_description_ready(ready).await {
        return Ok(());
    }
    while let Some(candidate) = feed.recv().await {
        let Some(candidate) = candidate else {
            debug!(role = %session.role(), "local candidate gathering complete");
            return termination.send_done().await;
        };
        let uuid = session.id().unwrap_or_default();
        trace!(%uuid, candidate = %candidate.candidate, "relaying local candidate");
        sink.send_candidate(uuid, to_wire(&candidate)).await?;
    }
    Ok(())
}

/// Applies a candidate received for the session `uuid`.
pub async fn apply_remote_candidate(
    session: &NegotiationSession,
    peer: &PeerConnection,
    uuid: &str,
    candidate: &IceCandidate,
) -> Result<(), DialError> {
    session.check_update(uuid)?;
    trace!(%uuid, candidate = %candidate.candidate, "applying remote candidate");
    peer.endpoint().add_ice_candidate(from_wire(candidate)?).await
}

/// Waits for the first of cancellation, readiness, or a reported error. On
/// failure the channel is closed and the close result folded in.
pub async fn await_channel(
    ctx: &CancellationToken,
    channel: &WebRtcChannel,
    errors: &mut mpsc::Receiver<DialError>,
) -> Result<(), DialError> {
    tokio::select! {
        biased;
        _ = ctx.cancelled() => Err(DialError::Canceled.combine(channel.close().await)),
        Some(err) = errors.recv() => Err(err.combine(channel.close().await)),
        ready = channel.ready() => {
            if ready {
                Ok(())
            } else {
                Err(DialError::negotiation("data channel closed before opening")
                    .combine(channel.close().await))
            }
        }
    }
}

/// Settles a finished exchange: a failure is reported to the service (best
/// effort, combined into the error), a success sends `done` if nothing has.
pub async fn conclude(
    session: &NegotiationSession,
    termination: &Termination,
    channel: Arc<WebRtcChannel>,
    outcome: Result<(), DialError>,
) -> Result<Arc<WebRtcChannel>, DialError> {
    match outcome {
        Err(err) => {
            session.finish(if err.is_canceled() {
                SessionOutcome::Canceled
            } else {
                SessionOutcome::Errored
            });
            warn!(
                uuid = ?session.id(),
                role = %session.role(),
                error = %err,
                "signaling exchange failed"
            );
            let reported = termination.send_error(err.to_status()).await;
            if let Err(report_err) = &reported {
                warn!(
                    error = %report_err,
                    "failed to report exchange error to signaling service"
                );
            }
            Err(err.combine(reported))
        }
        Ok(()) => {
            if let Err(err) = termination.send_done().await {
                session.finish(SessionOutcome::Errored);
                return Err(err.combine(channel.close().await));
            }
            session.finish(SessionOutcome::Connected);
            let stats = channel.stats().await;
            debug!(
                uuid = ?session.id(),
                role = %session.role(),
                connection_id = %stats.id,
                remote_candidates = ?stats.remote_candidates,
                "webrtc channel established"
            );
            Ok(channel)
        }
    }
}

/// Offer-side sink: candidates and the termination record go out as
/// `call_update` requests.
pub struct CallSink {
    client: Arc<dyn SignalingClient>,
}

impl CallSink {
    pub fn new(client: Arc<dyn SignalingClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ExchangeSink for CallSink {
    async fn send_candidate(&self, uuid: &str, candidate: IceCandidate) -> Result<(), DialError> {
        self.client
            .call_update(CallUpdateRequest {
                uuid: uuid.to_string(),
                update: CallUpdate::Candidate { candidate },
            })
            .await
            .map_err(DialError::from)
    }

    async fn send_terminal(&self, uuid: &str, terminal: Terminal) -> Result<(), DialError> {
        let update = match terminal {
            Terminal::Done => CallUpdate::Done,
            Terminal::Error(status) => CallUpdate::Error { status },
        };
        self.client
            .call_update(CallUpdateRequest {
                uuid: uuid.to_string(),
                update,
            })
            .await
            .map_err(DialError::from)
    }
}

fn classify_call_error(err: SignalingError) -> DialError {
    if err.is_unimplemented() {
        DialError::NoSignaler
    } else {
        DialError::Signaling(err)
    }
}

/// Runs the offer side of the exchange over `client` for a client-role
/// endpoint. The endpoint is closed on every failure path.
pub async fn run_offer(
    ctx: &CancellationToken,
    client: Arc<dyn SignalingClient>,
    new_peer: NewPeer,
    mode: NegotiationMode,
) -> Result<Arc<WebRtcChannel>, DialError> {
    let NewPeer {
        peer,
        data_channel,
        candidates,
    } = new_peer;

    let exchange = ctx.child_token();
    let _teardown = exchange.clone().drop_guard();
    let session = Arc::new(NegotiationSession::new(mode, Role::Client));

    let stream = match open_call(ctx, client.as_ref(), &peer, mode).await {
        Ok(stream) => stream,
        Err(err) => {
            session.finish(if err.is_canceled() {
                SessionOutcome::Canceled
            } else {
                SessionOutcome::Errored
            });
            return Err(err.combine(peer.close().await));
        }
    };

    let channel = WebRtcChannel::new(Role::Client, Arc::clone(&peer), data_channel);
    let (reporter, mut errors) = ErrorReporter::channel(exchange.clone());
    let (ready_tx, ready_rx) = watch::channel(false);
    let sink: Arc<dyn ExchangeSink> = Arc::new(CallSink::new(Arc::clone(&client)));
    let termination = Arc::new(Termination::new(
        Arc::clone(&session),
        exchange.clone(),
        Arc::clone(&sink),
    ));

    if let Some(feed) = candidates {
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
    spawn_reporting(
        "call receiver",
        reporter.clone(),
        receive_call_responses(
            stream,
            Arc::clone(&session),
            Arc::clone(&peer),
            ready_tx,
            Arc::clone(&termination),
        ),
    );

    let outcome = await_channel(ctx, &channel, &mut errors).await;
    conclude(&session, &termination, channel, outcome).await
}

async fn open_call(
    ctx: &CancellationToken,
    client: &dyn SignalingClient,
    peer: &PeerConnection,
    mode: NegotiationMode,
) -> Result<CallStream, DialError> {
    let local = peer
        .endpoint()
        .local_description()
        .await
        .ok_or_else(|| DialError::negotiation("local description missing"))?;
    let request = CallRequest {
        sdp: encode_sdp(&local)?,
        disable_trickle: !mode.is_trickle(),
    };
    debug!(%mode, "calling signaling service");
    tokio::select! {
        biased;
        _ = ctx.cancelled() => Err(DialError::Canceled),
        result = client.call(request) => result.map_err(classify_call_error),
    }
}

async fn receive_call_responses(
    mut stream: CallStream,
    session: Arc<NegotiationSession>,
    peer: Arc<PeerConnection>,
    remote_ready: watch::Sender<bool>,
    termination: Arc<Termination>,
) -> Result<(), DialError> {
    loop {
        let response = match stream.recv().await {
            Ok(Some(response)) => response,
            Ok(None) => return Ok(()),
            Err(err) if session.id().is_none() => return Err(classify_call_error(err)),
            Err(err) => return Err(err.into()),
        };
        match response.stage {
            Some(CallResponseStage::Init { sdp }) => {
                session.assign_id(&response.uuid)?;
                let answer = decode_sdp(&sdp)?;
                peer.endpoint().set_remote_description(answer).await?;
                remote_ready.send_replace(true);
                debug!(uuid = %response.uuid, "remote description set");
                if !session.mode().is_trickle() {
                    return termination.send_done().await;
                }
            }
            Some(CallResponseStage::Update { candidate }) => {
                apply_remote_candidate(&session, &peer, &response.uuid, &candidate).await?;
            }
            None => {
                return Err(DialError::protocol(format!(
                    "unexpected stage in call response for {}",
                    response.uuid
                )));
            }
        }
    }
}
