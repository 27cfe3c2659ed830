use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::CoupleError;

/// What a description payload is for. The payload itself is opaque.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DescriptionKind {
    Offer,
    Answer,
}

/// A negotiation description produced or consumed by the local connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Description {
    pub kind: DescriptionKind,
    pub sdp: String,
}

impl Description {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: DescriptionKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: DescriptionKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// A single connectivity candidate, in the shape candidates travel on the
/// wire. Hashable so duplicate delivery can be recognized.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Candidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<u32>,
}

impl Candidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
        }
    }
}

/// Raw state reported by the local connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RawConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Push notifications from the local connection to its monitor.
#[derive(Debug, Clone, PartialEq)]
pub enum MediaEvent {
    State(RawConnectionState),
    LocalCandidate(Candidate),
}

/// One side of a media-capable connection.
///
/// The monitor drives this seam without knowing what is behind it: a real
/// peer connection, or a scripted stand-in in tests. Implementations report
/// raw state changes and locally discovered candidates through [`events`];
/// the stream may be taken once, and later calls return a receiver that
/// never yields.
///
/// [`events`]: MediaConnection::events
#[async_trait]
pub trait MediaConnection: Send + Sync {
    /// Produce the local offer and install it as the local description.
    async fn create_offer(&self) -> Result<Description, CoupleError>;

    /// Produce the local answer. Requires the remote offer to have been
    /// applied first.
    async fn create_answer(&self) -> Result<Description, CoupleError>;

    /// Install the remote description. Fails with
    /// [`CoupleError::NegotiationRejected`] when it is incompatible.
    async fn apply_remote_description(&self, description: &Description) -> Result<(), CoupleError>;

    /// Install a remote candidate. Fails with
    /// [`CoupleError::InvalidCandidate`] when malformed or when no remote
    /// description has been applied yet.
    async fn apply_remote_candidate(&self, candidate: &Candidate) -> Result<(), CoupleError>;

    /// Raw state changes and locally discovered candidates, in the order
    /// the connection produced them.
    fn events(&self) -> mpsc::UnboundedReceiver<MediaEvent>;

    /// Tear the connection down. Idempotent.
    async fn close(&self);
}
