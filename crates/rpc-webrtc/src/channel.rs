use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::error::DialError;
use crate::peer::{ConnectionStats, DataChannel, PeerConnection};
use crate::session::{OnceGuard, Role};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChannelState {
    Connecting,
    Ready,
    Closed,
}

/// An established (or establishing) peer-to-peer channel.
///
/// Sole owner of the endpoint and its data channel once constructed. Closing
/// releases both, and only the first close does anything.
pub struct WebRtcChannel {
    role: Role,
    peer: Arc<PeerConnection>,
    data_channel: Arc<dyn DataChannel>,
    state: watch::Sender<ChannelState>,
    closed: OnceGuard,
    incoming: Mutex<Option<mpsc::UnboundedReceiver<Bytes>>>,
}

impl WebRtcChannel {
    pub fn new(
        role: Role,
        peer: Arc<PeerConnection>,
        data_channel: Arc<dyn DataChannel>,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(ChannelState::Connecting);
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();

        let channel = Arc::new(WebRtcChannel {
            role,
            peer,
            data_channel: data_channel.clone(),
            state,
            closed: OnceGuard::new(),
            incoming: Mutex::new(Some(incoming_rx)),
        });

        // Handlers hold weak references; the data channel is owned by the
        // wrapper and must not keep it alive.
        let on_open = Arc::downgrade(&channel);
        data_channel.on_open(Box::new(move || {
            if let Some(channel) = on_open.upgrade() {
                channel.mark_ready();
            }
        }));

        // Replaces the factory's handler, which closed the bare endpoint.
        let on_error = Arc::downgrade(&channel);
        data_channel.on_error(Box::new(move |err| {
            warn!(%role, error = %err, "data channel error");
            let Some(channel) = on_error.upgrade() else {
                return;
            };
            tokio::spawn(async move {
                if let Err(err) = channel.close().await {
                    debug!(error = %err, "closing channel after data channel error");
                }
            });
        }));

        data_channel.on_message(Box::new(move |data| {
            let _ = incoming_tx.send(data);
        }));

        channel
    }

    fn mark_ready(&self) {
        let fired = self.state.send_if_modified(|state| {
            if *state == ChannelState::Connecting {
                *state = ChannelState::Ready;
                true
            } else {
                false
            }
        });
        if fired {
            debug!(role = %self.role, "data channel open");
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Waits until the data channel opens. Returns false if the channel was
    /// closed first.
    pub async fn ready(&self) -> bool {
        let mut rx = self.state.subscribe();
        match rx.wait_for(|state| *state != ChannelState::Connecting).await {
            Ok(state) => *state == ChannelState::Ready,
            Err(_) => false,
        }
    }

    pub fn is_ready(&self) -> bool {
        *self.state.borrow() == ChannelState::Ready
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_claimed()
    }

    pub async fn send(&self, data: Bytes) -> Result<usize, DialError> {
        if self.is_closed() {
            return Err(DialError::negotiation("channel closed"));
        }
        self.data_channel.send(data).await
    }

    /// Which remote candidates the connection uses.
    pub async fn stats(&self) -> ConnectionStats {
        self.peer.endpoint().stats().await
    }

    /// Inbound messages. Can be taken once.
    pub fn take_incoming(&self) -> Option<mpsc::UnboundedReceiver<Bytes>> {
        self.incoming.lock().take()
    }

    pub async fn close(&self) -> Result<(), DialError> {
        if !self.closed.try_claim() {
            return Ok(());
        }
        self.state.send_replace(ChannelState::Closed);
        debug!(role = %self.role, "closing channel");
        let data_channel = self.data_channel.close().await;
        let peer = self.peer.close().await;
        match data_channel {
            Ok(()) => peer,
            Err(err) => Err(err.combine(peer)),
        }
    }
}

impl fmt::Debug for WebRtcChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebRtcChannel")
            .field("role", &self.role)
            .field("state", &*self.state.borrow())
            .field("peer", &self.peer)
            .finish()
    }
}
