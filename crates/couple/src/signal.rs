use std::fmt;

use serde::{Deserialize, Serialize};

use crate::media::Candidate;

/// Identity of an endpoint on the signalling relay.
///
/// Supplied by the discovery layer, never generated here. Ordered so that
/// identity comparison can break ties when two session ids collide.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for PeerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Distinguishes concurrent negotiation attempts between the same pair of
/// peers. The total order over the raw value is what makes the glare
/// tie-break deterministic: the lower id keeps the initiator role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(u64);

impl SessionId {
    /// Randomly sampled id; large enough that collisions between two racing
    /// offers are improbable.
    pub fn random() -> Self {
        Self(rand::random())
    }

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Messages relayed between two peers while negotiating a session.
///
/// Description payloads are opaque to the monitor; candidates are
/// individually addressable so duplicates can be recognized. Every message
/// carries the session id it belongs to, which is how receivers reject
/// traffic from a discarded negotiation attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "signal_type", rename_all = "snake_case")]
pub enum SignalMessage {
    Offer {
        session_id: SessionId,
        sdp: String,
    },
    Answer {
        session_id: SessionId,
        sdp: String,
    },
    Candidate {
        session_id: SessionId,
        candidate: String,
        sdp_mid: Option<String>,
        sdp_mline_index: Option<u32>,
    },
    Bye {
        session_id: SessionId,
    },
}

impl SignalMessage {
    pub fn candidate(session_id: SessionId, candidate: &Candidate) -> Self {
        SignalMessage::Candidate {
            session_id,
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_mline_index,
        }
    }

    pub fn session_id(&self) -> SessionId {
        match self {
            SignalMessage::Offer { session_id, .. }
            | SignalMessage::Answer { session_id, .. }
            | SignalMessage::Candidate { session_id, .. }
            | SignalMessage::Bye { session_id } => *session_id,
        }
    }
}

/// Discovery broadcast delivered to every other endpoint on the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Announcement {
    pub peer: PeerId,
    pub metadata: serde_json::Value,
}
