use std::time::Duration;

use thiserror::Error;

/// Errors produced while coupling a local connection to a remote peer.
///
/// Session-fatal variants terminate exactly one session and surface through
/// its event stream as `Error(reason)` followed by `Closed`; recoverable
/// ones are absorbed (retried or dropped) unless they exceed their budget.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CoupleError {
    /// The signalling relay could not deliver a message.
    #[error("signalling channel unavailable: {0}")]
    ChannelUnavailable(String),
    /// The signalling relay went away entirely.
    #[error("signalling channel closed")]
    ChannelClosed,
    /// The remote description could not be applied to the local connection.
    #[error("remote description rejected: {0}")]
    NegotiationRejected(String),
    /// A candidate was malformed or arrived in a state that cannot take it.
    #[error("invalid candidate: {0}")]
    InvalidCandidate(String),
    /// The handshake did not complete within its window.
    #[error("negotiation did not complete within {0:?}")]
    NegotiationTimeout(Duration),
    /// A disconnected session did not recover within the grace period.
    #[error("connection did not recover within {0:?}")]
    Timeout(Duration),
    /// Construction or wiring of a collaborator failed.
    #[error("setup failed: {0}")]
    Setup(String),
}
