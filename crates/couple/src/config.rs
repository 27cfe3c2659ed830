use std::time::Duration;

use crate::signal::SessionId;

/// Which side of the handshake this monitor starts as. The role may still
/// swap if two racing offers collide and the tie-break goes the other way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CoupleRole {
    /// Sends the opening offer as soon as coupling starts.
    #[default]
    Initiator,
    /// Waits for the remote side's offer.
    Responder,
}

/// Policy knobs for one coupling session.
///
/// The timing windows are policy rather than protocol, so they live here
/// instead of being constants in the state machine.
#[derive(Debug, Clone)]
pub struct CoupleConfig {
    pub role: CoupleRole,
    /// How long a raw disconnection may last before the session fails.
    pub grace_period: Duration,
    /// Budget for the whole handshake, from start to the first usable
    /// connection.
    pub negotiation_timeout: Duration,
    /// How long a connection must stay up before it counts as active, when
    /// the raw layer gives no second connectivity signal of its own.
    pub activation_delay: Duration,
    /// Relay send attempts for offers and answers before the session fails.
    pub send_retries: u32,
    pub send_retry_delay: Duration,
    /// Fixed session id for the opening offer; sampled randomly when unset.
    pub session_id: Option<SessionId>,
}

impl Default for CoupleConfig {
    fn default() -> Self {
        Self {
            role: CoupleRole::Initiator,
            grace_period: Duration::from_secs(10),
            negotiation_timeout: Duration::from_secs(30),
            activation_delay: Duration::from_millis(500),
            send_retries: 3,
            send_retry_delay: Duration::from_millis(250),
            session_id: None,
        }
    }
}

impl CoupleConfig {
    /// Config for the side that waits for the remote offer.
    pub fn responder() -> Self {
        Self {
            role: CoupleRole::Responder,
            ..Self::default()
        }
    }

    pub fn with_role(mut self, role: CoupleRole) -> Self {
        self.role = role;
        self
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn with_negotiation_timeout(mut self, negotiation_timeout: Duration) -> Self {
        self.negotiation_timeout = negotiation_timeout;
        self
    }

    pub fn with_activation_delay(mut self, activation_delay: Duration) -> Self {
        self.activation_delay = activation_delay;
        self
    }

    pub fn with_session_id(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }
}
