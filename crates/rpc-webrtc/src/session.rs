use std::fmt;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::DialError;

/// How candidates reach the remote side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationMode {
    /// Candidates are relayed one by one as they are gathered.
    Trickle,
    /// The description is sent only after gathering completes, with every
    /// candidate embedded.
    Vanilla,
}

impl NegotiationMode {
    pub fn from_disable_trickle(disable_trickle: bool) -> Self {
        if disable_trickle {
            NegotiationMode::Vanilla
        } else {
            NegotiationMode::Trickle
        }
    }

    pub fn is_trickle(self) -> bool {
        self == NegotiationMode::Trickle
    }
}

impl fmt::Display for NegotiationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NegotiationMode::Trickle => f.write_str("trickle"),
            NegotiationMode::Vanilla => f.write_str("vanilla"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Client => f.write_str("client"),
            Role::Server => f.write_str("server"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    Connected,
    Errored,
    Canceled,
}

/// One attempt to establish a channel.
///
/// The identifier is assigned by the first inbound `init` and then pinned;
/// the outcome slot is written once.
#[derive(Debug)]
pub struct NegotiationSession {
    id: OnceLock<String>,
    mode: NegotiationMode,
    role: Role,
    outcome: OnceLock<SessionOutcome>,
}

impl NegotiationSession {
    pub fn new(mode: NegotiationMode, role: Role) -> Self {
        Self {
            id: OnceLock::new(),
            mode,
            role,
            outcome: OnceLock::new(),
        }
    }

    pub fn mode(&self) -> NegotiationMode {
        self.mode
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn id(&self) -> Option<&str> {
        self.id.get().map(String::as_str)
    }

    /// Pins the identifier. A second init for the same attempt is rejected.
    pub fn assign_id(&self, id: &str) -> Result<(), DialError> {
        self.id
            .set(id.to_string())
            .map_err(|_| DialError::protocol("got init stage more than once"))
    }

    /// Checks an update's identifier against the pinned one.
    pub fn check_update(&self, id: &str) -> Result<(), DialError> {
        match self.id() {
            None => Err(DialError::protocol("got update stage before init stage")),
            Some(expected) if expected != id => Err(DialError::protocol(format!(
                "uuid mismatch; have={expected} want={id}"
            ))),
            Some(_) => Ok(()),
        }
    }

    /// Records the terminal state. Returns false if one was already recorded,
    /// in which case the earlier state stands.
    pub fn finish(&self, outcome: SessionOutcome) -> bool {
        self.outcome.set(outcome).is_ok()
    }

    #[cfg(test)]
    fn outcome(&self) -> Option<SessionOutcome> {
        self.outcome.get().copied()
    }
}

/// Lets exactly one caller through.
#[derive(Debug, Default)]
pub struct OnceGuard(AtomicBool);

impl OnceGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_claim(&self) -> bool {
        !self.0.swap(true, Ordering::AcqRel)
    }

    pub fn is_claimed(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}
