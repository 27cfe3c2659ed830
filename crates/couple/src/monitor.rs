use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, sleep_until};
use tracing::{debug, trace, warn};

use crate::channel::SignalChannel;
use crate::config::{CoupleConfig, CoupleRole};
use crate::error::CoupleError;
use crate::media::{Candidate, Description, MediaConnection, MediaEvent, RawConnectionState};
use crate::signal::{PeerId, SessionId, SignalMessage};

/// Observable state of a coupling session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Idle,
    Negotiating,
    Connected,
    Active,
    Disconnected,
    Closed,
    Failed,
}

impl MonitorState {
    pub fn is_terminal(self) -> bool {
        matches!(self, MonitorState::Closed | MonitorState::Failed)
    }
}

/// Lifecycle notifications emitted to the application, exactly once per
/// logical change. `Disconnected` may recur before `Closed`; every fatal
/// condition surfaces as `Error(reason)` followed by `Closed`.
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    Negotiating,
    Connected,
    Active,
    Disconnected,
    Closed,
    Error(CoupleError),
}

enum Control {
    Close,
}

/// Handle to a running coupling session.
///
/// Dropping the handle tears the session down.
pub struct MonitorHandle {
    remote_peer: PeerId,
    state: Arc<Mutex<MonitorState>>,
    events: Mutex<Option<mpsc::UnboundedReceiver<LifecycleEvent>>>,
    control: mpsc::UnboundedSender<Control>,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    pub fn remote_peer(&self) -> &PeerId {
        &self.remote_peer
    }

    /// Snapshot of the session state.
    pub fn state(&self) -> MonitorState {
        *self.state.lock()
    }

    /// Lifecycle events in emission order. The stream may be taken once.
    pub fn events(&self) -> Result<mpsc::UnboundedReceiver<LifecycleEvent>, CoupleError> {
        self.events
            .lock()
            .take()
            .ok_or_else(|| CoupleError::Setup("event stream already taken".into()))
    }

    /// Ask the session to say goodbye to the remote side and shut down.
    /// Idempotent; the `Closed` event confirms completion.
    pub fn close(&self) {
        let _ = self.control.send(Control::Close);
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Couple `connection` to `remote_peer` over `channel` with default policy.
///
/// The caller starts as initiator and sends the opening offer immediately.
/// Must be called from within a tokio runtime.
pub fn couple(
    connection: Arc<dyn MediaConnection>,
    remote_peer: impl Into<PeerId>,
    channel: Arc<dyn SignalChannel>,
) -> MonitorHandle {
    couple_with_config(connection, remote_peer, channel, CoupleConfig::default())
}

/// [`couple`] with explicit policy.
pub fn couple_with_config(
    connection: Arc<dyn MediaConnection>,
    remote_peer: impl Into<PeerId>,
    channel: Arc<dyn SignalChannel>,
    config: CoupleConfig,
) -> MonitorHandle {
    let remote_peer = remote_peer.into();
    let signals = channel.subscribe(&remote_peer);
    let media = connection.events();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let shared_state = Arc::new(Mutex::new(MonitorState::Idle));

    let task = SessionTask {
        local_peer: channel.local_peer().clone(),
        remote_peer: remote_peer.clone(),
        role: config.role,
        connection,
        channel,
        config,
        events: events_tx,
        shared_state: Arc::clone(&shared_state),
        state: MonitorState::Idle,
        session_id: None,
        local_description_sent: false,
        remote_description_applied: false,
        raw_connected_seen: false,
        was_active: false,
        relay_faulted: false,
        channel_open: true,
        pending_outbound: Vec::new(),
        sent_candidates: Vec::new(),
        pending_inbound: Vec::new(),
        seen_inbound: HashSet::new(),
        negotiation_deadline: None,
        grace_deadline: None,
        activation_deadline: None,
    };
    let join = tokio::spawn(task.run(signals, media, control_rx));

    MonitorHandle {
        remote_peer,
        state: shared_state,
        events: Mutex::new(Some(events_rx)),
        control: control_tx,
        task: join,
    }
}

enum Flow {
    Continue,
    Stop,
}

/// Owns every piece of mutable session state. Runs as a single task per
/// session, so protocol messages, raw state changes and timers are handled
/// strictly one at a time; independent sessions share nothing but the
/// channel adapter.
struct SessionTask {
    local_peer: PeerId,
    remote_peer: PeerId,
    role: CoupleRole,
    connection: Arc<dyn MediaConnection>,
    channel: Arc<dyn SignalChannel>,
    config: CoupleConfig,
    events: mpsc::UnboundedSender<LifecycleEvent>,
    shared_state: Arc<Mutex<MonitorState>>,

    state: MonitorState,
    session_id: Option<SessionId>,
    local_description_sent: bool,
    remote_description_applied: bool,
    raw_connected_seen: bool,
    was_active: bool,
    relay_faulted: bool,
    channel_open: bool,
    /// Locally discovered candidates waiting for a session id to travel
    /// under.
    pending_outbound: Vec<Candidate>,
    /// Candidates already relayed; re-sent under the winning id when a
    /// glare tie-break discards our session.
    sent_candidates: Vec<Candidate>,
    /// Inbound candidates held until the description they belong to is
    /// applied, in arrival order.
    pending_inbound: Vec<(SessionId, Candidate)>,
    seen_inbound: HashSet<Candidate>,
    negotiation_deadline: Option<Instant>,
    grace_deadline: Option<Instant>,
    activation_deadline: Option<Instant>,
}

impl SessionTask {
    async fn run(
        mut self,
        mut signals: mpsc::UnboundedReceiver<SignalMessage>,
        mut media: mpsc::UnboundedReceiver<MediaEvent>,
        mut control: mpsc::UnboundedReceiver<Control>,
    ) {
        if let Err(err) = self.start().await {
            self.fail(err).await;
            return;
        }
        loop {
            let deadline = self.next_deadline();
            let flow = tokio::select! {
                message = signals.recv(), if self.channel_open => match message {
                    Some(message) => match self.on_signal(message).await {
                        Ok(flow) => flow,
                        Err(err) => {
                            self.fail(err).await;
                            Flow::Stop
                        }
                    },
                    None => self.on_signals_lost().await,
                },
                event = media.recv() => match event {
                    Some(event) => match self.on_media(event).await {
                        Ok(flow) => flow,
                        Err(err) => {
                            self.fail(err).await;
                            Flow::Stop
                        }
                    },
                    // The connection's event stream ended; nothing further
                    // can be observed, so treat it as closed.
                    None => {
                        self.shutdown(false).await;
                        Flow::Stop
                    }
                },
                request = control.recv() => {
                    let send_bye = matches!(request, Some(Control::Close));
                    self.shutdown(send_bye).await;
                    Flow::Stop
                },
                _ = idle_until(deadline) => match self.on_deadline().await {
                    Ok(flow) => flow,
                    Err(err) => {
                        self.fail(err).await;
                        Flow::Stop
                    }
                },
            };
            if matches!(flow, Flow::Stop) {
                break;
            }
        }
    }

    async fn start(&mut self) -> Result<(), CoupleError> {
        debug!(
            target: "couple",
            local = %self.local_peer,
            peer = %self.remote_peer,
            role = ?self.role,
            "coupling started"
        );
        self.negotiation_deadline = Some(Instant::now() + self.config.negotiation_timeout);
        self.transition(MonitorState::Negotiating, LifecycleEvent::Negotiating);
        if self.role == CoupleRole::Initiator {
            let session_id = self.config.session_id.unwrap_or_else(SessionId::random);
            self.session_id = Some(session_id);
            let offer = self.connection.create_offer().await?;
            self.send_with_retry(SignalMessage::Offer {
                session_id,
                sdp: offer.sdp,
            })
            .await?;
            self.local_description_sent = true;
            debug!(target: "couple", peer = %self.remote_peer, %session_id, "offer sent");
        }
        Ok(())
    }

    async fn on_signal(&mut self, message: SignalMessage) -> Result<Flow, CoupleError> {
        match message {
            SignalMessage::Offer { session_id, sdp } => self.on_offer(session_id, sdp).await,
            SignalMessage::Answer { session_id, sdp } => self.on_answer(session_id, sdp).await,
            SignalMessage::Candidate {
                session_id,
                candidate,
                sdp_mid,
                sdp_mline_index,
            } => {
                self.on_candidate(
                    session_id,
                    Candidate {
                        candidate,
                        sdp_mid,
                        sdp_mline_index,
                    },
                )
                .await
            }
            SignalMessage::Bye { session_id } => self.on_bye(session_id).await,
        }
    }

    async fn on_offer(&mut self, session_id: SessionId, sdp: String) -> Result<Flow, CoupleError> {
        if self.state != MonitorState::Negotiating {
            trace!(target: "couple", %session_id, "discarding offer outside negotiation");
            return Ok(Flow::Continue);
        }
        if self.remote_description_applied {
            trace!(target: "couple", %session_id, "discarding duplicate offer");
            return Ok(Flow::Continue);
        }
        match self.session_id {
            None => {
                debug!(target: "couple", peer = %self.remote_peer, %session_id, "accepting remote offer");
                self.accept_offer(session_id, sdp, false).await
            }
            Some(local_session)
                if remote_offer_wins(
                    session_id,
                    local_session,
                    &self.remote_peer,
                    &self.local_peer,
                ) =>
            {
                debug!(
                    target: "couple",
                    theirs = %session_id,
                    ours = %local_session,
                    "offer glare: remote session wins, discarding ours"
                );
                self.accept_offer(session_id, sdp, true).await
            }
            Some(local_session) => {
                debug!(
                    target: "couple",
                    theirs = %session_id,
                    ours = %local_session,
                    "offer glare: local session wins, ignoring remote offer"
                );
                Ok(Flow::Continue)
            }
        }
    }

    /// Apply a remote offer and answer it. `yielded` marks the glare path
    /// where our own in-flight offer is being discarded.
    async fn accept_offer(
        &mut self,
        session_id: SessionId,
        sdp: String,
        yielded: bool,
    ) -> Result<Flow, CoupleError> {
        if yielded {
            self.role = CoupleRole::Responder;
            self.local_description_sent = false;
            // Anything relayed under the discarded session id has been (or
            // will be) rejected remotely; queue it again under the winner.
            let mut resend = std::mem::take(&mut self.sent_candidates);
            resend.append(&mut self.pending_outbound);
            self.pending_outbound = resend;
        }
        self.session_id = Some(session_id);
        self.connection
            .apply_remote_description(&Description::offer(sdp))
            .await?;
        self.remote_description_applied = true;
        self.flush_inbound().await;
        let answer = self.connection.create_answer().await?;
        self.send_with_retry(SignalMessage::Answer {
            session_id,
            sdp: answer.sdp,
        })
        .await?;
        self.local_description_sent = true;
        debug!(target: "couple", peer = %self.remote_peer, %session_id, "answer sent");
        self.flush_outbound().await;
        self.maybe_enter_connected();
        Ok(Flow::Continue)
    }

    async fn on_answer(&mut self, session_id: SessionId, sdp: String) -> Result<Flow, CoupleError> {
        if self.state != MonitorState::Negotiating || self.role != CoupleRole::Initiator {
            trace!(target: "couple", %session_id, "discarding unexpected answer");
            return Ok(Flow::Continue);
        }
        if self.session_id != Some(session_id) {
            trace!(target: "couple", %session_id, "discarding answer for stale session");
            return Ok(Flow::Continue);
        }
        if self.remote_description_applied {
            trace!(target: "couple", %session_id, "discarding duplicate answer");
            return Ok(Flow::Continue);
        }
        self.connection
            .apply_remote_description(&Description::answer(sdp))
            .await?;
        self.remote_description_applied = true;
        debug!(target: "couple", peer = %self.remote_peer, %session_id, "answer applied");
        self.flush_inbound().await;
        self.maybe_enter_connected();
        Ok(Flow::Continue)
    }

    async fn on_candidate(
        &mut self,
        session_id: SessionId,
        candidate: Candidate,
    ) -> Result<Flow, CoupleError> {
        if self.state.is_terminal() {
            return Ok(Flow::Continue);
        }
        if self.session_id == Some(session_id) && self.remote_description_applied {
            self.apply_candidate(candidate).await;
        } else if self.state != MonitorState::Negotiating && self.session_id != Some(session_id) {
            trace!(target: "couple", %session_id, "dropping candidate from stale session");
        } else if self
            .pending_inbound
            .iter()
            .any(|(sid, held)| *sid == session_id && *held == candidate)
        {
            trace!(target: "couple", %session_id, "ignoring duplicate queued candidate");
        } else {
            trace!(target: "couple", %session_id, "holding candidate until its description applies");
            self.pending_inbound.push((session_id, candidate));
        }
        Ok(Flow::Continue)
    }

    async fn on_bye(&mut self, session_id: SessionId) -> Result<Flow, CoupleError> {
        if self.session_id.is_none() || self.session_id == Some(session_id) {
            debug!(target: "couple", peer = %self.remote_peer, %session_id, "remote requested close");
            self.shutdown(false).await;
            Ok(Flow::Stop)
        } else {
            trace!(target: "couple", %session_id, "ignoring bye for stale session");
            Ok(Flow::Continue)
        }
    }

    async fn on_media(&mut self, event: MediaEvent) -> Result<Flow, CoupleError> {
        match event {
            MediaEvent::LocalCandidate(candidate) => {
                match self.session_id {
                    Some(session_id) if self.local_description_sent => {
                        self.relay_candidate(session_id, &candidate).await;
                        self.sent_candidates.push(candidate);
                    }
                    _ => {
                        trace!(target: "couple", "holding local candidate until a session exists");
                        self.pending_outbound.push(candidate);
                    }
                }
                Ok(Flow::Continue)
            }
            MediaEvent::State(raw) => self.on_raw_state(raw).await,
        }
    }

    async fn on_raw_state(&mut self, raw: RawConnectionState) -> Result<Flow, CoupleError> {
        trace!(target: "couple", peer = %self.remote_peer, ?raw, "raw connection state");
        match raw {
            RawConnectionState::New | RawConnectionState::Connecting => Ok(Flow::Continue),
            RawConnectionState::Connected => {
                self.on_raw_connected();
                Ok(Flow::Continue)
            }
            RawConnectionState::Disconnected | RawConnectionState::Failed => {
                self.on_raw_disconnected(raw);
                Ok(Flow::Continue)
            }
            RawConnectionState::Closed => {
                debug!(target: "couple", peer = %self.remote_peer, "local connection closed");
                self.shutdown(false).await;
                Ok(Flow::Stop)
            }
        }
    }

    fn on_raw_connected(&mut self) {
        match self.state {
            MonitorState::Negotiating => {
                self.raw_connected_seen = true;
                self.maybe_enter_connected();
            }
            // A second connectivity signal while connected is the flow
            // indicator that promotes the session to active.
            MonitorState::Connected => self.activate(),
            MonitorState::Active => {
                trace!(target: "couple", "already active");
            }
            MonitorState::Disconnected => {
                debug!(target: "couple", peer = %self.remote_peer, "connection recovered within grace period");
                self.grace_deadline = None;
                if self.was_active {
                    self.transition(MonitorState::Active, LifecycleEvent::Active);
                } else {
                    self.activation_deadline =
                        Some(Instant::now() + self.config.activation_delay);
                    self.transition(MonitorState::Connected, LifecycleEvent::Connected);
                }
            }
            _ => {}
        }
    }

    fn on_raw_disconnected(&mut self, raw: RawConnectionState) {
        match self.state {
            MonitorState::Connected | MonitorState::Active => {
                debug!(
                    target: "couple",
                    peer = %self.remote_peer,
                    ?raw,
                    grace = ?self.config.grace_period,
                    "connection dropped; grace period started"
                );
                self.activation_deadline = None;
                self.grace_deadline = Some(Instant::now() + self.config.grace_period);
                self.transition(MonitorState::Disconnected, LifecycleEvent::Disconnected);
            }
            MonitorState::Disconnected => {
                trace!(target: "couple", "already within grace period");
            }
            _ => {
                trace!(target: "couple", ?raw, "ignoring raw drop outside established states");
            }
        }
    }

    async fn on_signals_lost(&mut self) -> Flow {
        self.channel_open = false;
        self.relay_faulted = true;
        if self.state == MonitorState::Negotiating {
            self.fail(CoupleError::ChannelClosed).await;
            return Flow::Stop;
        }
        // Established media keeps flowing without the relay; it is only
        // needed again if the connection later drops.
        debug!(target: "couple", peer = %self.remote_peer, "signalling subscription ended");
        Flow::Continue
    }

    async fn on_deadline(&mut self) -> Result<Flow, CoupleError> {
        let now = Instant::now();
        if self.negotiation_deadline.is_some_and(|at| now >= at) {
            self.negotiation_deadline = None;
            return Err(CoupleError::NegotiationTimeout(
                self.config.negotiation_timeout,
            ));
        }
        if self.grace_deadline.is_some_and(|at| now >= at) {
            self.grace_deadline = None;
            return Err(if self.relay_faulted {
                CoupleError::ChannelUnavailable(
                    "signalling channel lost while disconnected".into(),
                )
            } else {
                CoupleError::Timeout(self.config.grace_period)
            });
        }
        if self.activation_deadline.is_some_and(|at| now >= at) {
            self.activation_deadline = None;
            if self.state == MonitorState::Connected {
                self.activate();
            }
        }
        Ok(Flow::Continue)
    }

    fn maybe_enter_connected(&mut self) {
        if self.state == MonitorState::Negotiating
            && self.local_description_sent
            && self.remote_description_applied
            && self.raw_connected_seen
        {
            self.negotiation_deadline = None;
            self.activation_deadline = Some(Instant::now() + self.config.activation_delay);
            self.transition(MonitorState::Connected, LifecycleEvent::Connected);
        }
    }

    fn activate(&mut self) {
        self.activation_deadline = None;
        self.was_active = true;
        self.transition(MonitorState::Active, LifecycleEvent::Active);
    }

    async fn apply_candidate(&mut self, candidate: Candidate) {
        if !self.seen_inbound.insert(candidate.clone()) {
            trace!(target: "couple", "ignoring duplicate candidate");
            return;
        }
        match self.connection.apply_remote_candidate(&candidate).await {
            Ok(()) => trace!(target: "couple", "remote candidate applied"),
            // Malformed candidates are dropped; the rest of the session is
            // unaffected.
            Err(err) => warn!(target: "couple", error = %err, "dropping candidate"),
        }
    }

    async fn flush_inbound(&mut self) {
        let Some(session_id) = self.session_id else {
            return;
        };
        let held = std::mem::take(&mut self.pending_inbound);
        let mut stale = 0usize;
        for (sid, candidate) in held {
            if sid == session_id {
                self.apply_candidate(candidate).await;
            } else {
                stale += 1;
            }
        }
        if stale > 0 {
            trace!(target: "couple", stale, "discarded candidates from stale sessions");
        }
    }

    async fn flush_outbound(&mut self) {
        let Some(session_id) = self.session_id else {
            return;
        };
        if !self.local_description_sent {
            return;
        }
        let pending: Vec<Candidate> = self.pending_outbound.drain(..).collect();
        for candidate in pending {
            self.relay_candidate(session_id, &candidate).await;
            self.sent_candidates.push(candidate);
        }
    }

    async fn relay_candidate(&mut self, session_id: SessionId, candidate: &Candidate) {
        let message = SignalMessage::candidate(session_id, candidate);
        if let Err(err) = self.channel.send(&self.remote_peer, message).await {
            self.relay_faulted = true;
            warn!(target: "couple", error = %err, "failed to relay candidate");
        }
    }

    /// Offers and answers must arrive; retry within the configured budget
    /// before giving up on the session.
    async fn send_with_retry(&mut self, message: SignalMessage) -> Result<(), CoupleError> {
        let mut attempt = 0u32;
        loop {
            match self.channel.send(&self.remote_peer, message.clone()).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    self.relay_faulted = true;
                    attempt += 1;
                    if attempt > self.config.send_retries {
                        return Err(err);
                    }
                    warn!(
                        target: "couple",
                        error = %err,
                        attempt,
                        "relay send failed; retrying"
                    );
                    sleep(self.config.send_retry_delay).await;
                }
            }
        }
    }

    async fn fail(&mut self, err: CoupleError) {
        warn!(target: "couple", peer = %self.remote_peer, error = %err, "session failed");
        self.set_state(MonitorState::Failed);
        self.emit(LifecycleEvent::Error(err));
        self.connection.close().await;
        self.emit(LifecycleEvent::Closed);
    }

    async fn shutdown(&mut self, send_bye: bool) {
        if send_bye {
            if let Some(session_id) = self.session_id {
                if let Err(err) = self
                    .channel
                    .send(&self.remote_peer, SignalMessage::Bye { session_id })
                    .await
                {
                    debug!(target: "couple", error = %err, "failed to send bye");
                }
            }
        }
        self.negotiation_deadline = None;
        self.grace_deadline = None;
        self.activation_deadline = None;
        self.connection.close().await;
        self.transition(MonitorState::Closed, LifecycleEvent::Closed);
    }

    fn next_deadline(&self) -> Option<Instant> {
        [
            self.negotiation_deadline,
            self.grace_deadline,
            self.activation_deadline,
        ]
        .into_iter()
        .flatten()
        .min()
    }

    fn transition(&mut self, state: MonitorState, event: LifecycleEvent) {
        self.set_state(state);
        self.emit(event);
    }

    fn set_state(&mut self, state: MonitorState) {
        trace!(
            target: "couple",
            peer = %self.remote_peer,
            from = ?self.state,
            to = ?state,
            "state change"
        );
        self.state = state;
        *self.shared_state.lock() = state;
    }

    fn emit(&self, event: LifecycleEvent) {
        debug!(target: "couple", peer = %self.remote_peer, event = ?event, "lifecycle event");
        let _ = self.events.send(event);
    }
}

async fn idle_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Glare tie-break: the lower session id keeps the initiator role; equal
/// ids fall back to the lower peer identity.
fn remote_offer_wins(
    remote_session: SessionId,
    local_session: SessionId,
    remote_peer: &PeerId,
    local_peer: &PeerId,
) -> bool {
    match remote_session.cmp(&local_session) {
        Ordering::Less => true,
        Ordering::Greater => false,
        Ordering::Equal => remote_peer < local_peer,
    }
}
