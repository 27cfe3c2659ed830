use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::CoupleError;
use crate::media::{Candidate, Description, MediaConnection, MediaEvent, RawConnectionState};

/// One call made against a [`MockMedia`], in invocation order.
#[derive(Debug, Clone, PartialEq)]
pub enum MockCall {
    CreateOffer,
    CreateAnswer,
    ApplyRemoteDescription(Description),
    ApplyRemoteCandidate(Candidate),
    Close,
}

/// Scripted [`MediaConnection`] for exercising a monitor without a real
/// media stack.
///
/// Records every call in order, so tests can assert ordering properties
/// such as "no candidate before the remote description", and lets the test
/// push raw states and candidates as if the underlying connection produced
/// them.
pub struct MockMedia {
    label: String,
    calls: Mutex<Vec<MockCall>>,
    remote_applied: AtomicBool,
    reject_descriptions: Mutex<Option<String>>,
    events_tx: mpsc::UnboundedSender<MediaEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<MediaEvent>>>,
}

impl MockMedia {
    pub fn new(label: impl Into<String>) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            label: label.into(),
            calls: Mutex::new(Vec::new()),
            remote_applied: AtomicBool::new(false),
            reject_descriptions: Mutex::new(None),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        })
    }

    /// Everything the monitor has asked of this connection, in order.
    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().clone()
    }

    /// Make every following description application fail.
    pub fn reject_descriptions(&self, reason: impl Into<String>) {
        *self.reject_descriptions.lock() = Some(reason.into());
    }

    /// Report a raw state change, as the underlying connection would.
    pub fn push_state(&self, state: RawConnectionState) {
        let _ = self.events_tx.send(MediaEvent::State(state));
    }

    /// Surface a locally discovered candidate.
    pub fn push_candidate(&self, candidate: Candidate) {
        let _ = self.events_tx.send(MediaEvent::LocalCandidate(candidate));
    }

    fn record(&self, call: MockCall) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl MediaConnection for MockMedia {
    async fn create_offer(&self) -> Result<Description, CoupleError> {
        self.record(MockCall::CreateOffer);
        Ok(Description::offer(format!("v=0 {} offer", self.label)))
    }

    async fn create_answer(&self) -> Result<Description, CoupleError> {
        self.record(MockCall::CreateAnswer);
        if !self.remote_applied.load(Ordering::SeqCst) {
            return Err(CoupleError::Setup(
                "create_answer before remote description".into(),
            ));
        }
        Ok(Description::answer(format!("v=0 {} answer", self.label)))
    }

    async fn apply_remote_description(&self, description: &Description) -> Result<(), CoupleError> {
        self.record(MockCall::ApplyRemoteDescription(description.clone()));
        if let Some(reason) = self.reject_descriptions.lock().clone() {
            return Err(CoupleError::NegotiationRejected(reason));
        }
        self.remote_applied.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn apply_remote_candidate(&self, candidate: &Candidate) -> Result<(), CoupleError> {
        self.record(MockCall::ApplyRemoteCandidate(candidate.clone()));
        if !self.remote_applied.load(Ordering::SeqCst) {
            return Err(CoupleError::InvalidCandidate(
                "no remote description applied".into(),
            ));
        }
        Ok(())
    }

    fn events(&self) -> mpsc::UnboundedReceiver<MediaEvent> {
        self.events_rx.lock().take().unwrap_or_else(|| {
            let (_tx, rx) = mpsc::unbounded_channel();
            rx
        })
    }

    async fn close(&self) {
        self.record(MockCall::Close);
    }
}
