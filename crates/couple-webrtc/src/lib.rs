//! Binds a `webrtc` peer connection to the `couple` negotiation seam.
//!
//! [`WebRtcMedia`] implements [`MediaConnection`] over
//! `webrtc::RTCPeerConnection`: descriptions and candidates pass straight
//! through, locally discovered candidates and raw state changes are
//! forwarded to the monitor, and losing an offer race rebuilds the
//! underlying connection so the winning remote offer lands on a clean
//! signaling state.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
pub use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;

use couple::{
    Candidate, CoupleError, Description, DescriptionKind, MediaConnection, MediaEvent,
    RawConnectionState,
};

/// Construction options for a [`WebRtcMedia`].
#[derive(Clone)]
pub struct WebRtcMediaConfig {
    /// ICE servers for connection establishment. TURN/STUN details are
    /// opaque configuration here.
    pub ice_servers: Vec<RTCIceServer>,
    /// Label of a data channel created up front so negotiation has
    /// something to describe before any track is attached.
    pub warmup_channel: Option<String>,
}

impl Default for WebRtcMediaConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![RTCIceServer {
                urls: vec!["stun:stun.l.google.com:19302".to_string()],
                ..Default::default()
            }],
            warmup_channel: Some("couple-data".to_string()),
        }
    }
}

impl WebRtcMediaConfig {
    /// Host-candidates-only configuration, for peers that can reach each
    /// other without NAT traversal.
    pub fn localhost() -> Self {
        Self {
            ice_servers: vec![],
            ..Self::default()
        }
    }
}

/// A `webrtc` peer connection exposed through the [`MediaConnection`] seam.
pub struct WebRtcMedia {
    api: API,
    config: WebRtcMediaConfig,
    /// Bumped on every rebuild; handlers wired to an older connection stop
    /// reporting once their generation is stale.
    generation: Arc<AtomicU64>,
    pc: Mutex<Arc<RTCPeerConnection>>,
    events_tx: mpsc::UnboundedSender<MediaEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<MediaEvent>>>,
}

impl WebRtcMedia {
    pub async fn new() -> Result<Arc<Self>, CoupleError> {
        Self::with_config(WebRtcMediaConfig::default()).await
    }

    pub async fn with_config(config: WebRtcMediaConfig) -> Result<Arc<Self>, CoupleError> {
        let api = build_api()?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let generation = Arc::new(AtomicU64::new(0));
        let pc = build_peer(&api, &config, &events_tx, &generation, 0).await?;
        Ok(Arc::new(Self {
            api,
            config,
            generation,
            pc: Mutex::new(pc),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        }))
    }

    fn current(&self) -> Arc<RTCPeerConnection> {
        Arc::clone(&self.pc.lock())
    }

    /// Replace the underlying connection. Candidates gathered by the old
    /// one are void; the remote side drops them by session-id tagging while
    /// the fresh connection gathers its own.
    async fn rebuild(&self) -> Result<Arc<RTCPeerConnection>, CoupleError> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::debug!(
            target: "couple::webrtc",
            generation,
            "rebuilding peer connection after losing the offer race"
        );
        let fresh = build_peer(
            &self.api,
            &self.config,
            &self.events_tx,
            &self.generation,
            generation,
        )
        .await?;
        let stale = {
            let mut guard = self.pc.lock();
            std::mem::replace(&mut *guard, Arc::clone(&fresh))
        };
        if let Err(err) = stale.close().await {
            tracing::debug!(
                target: "couple::webrtc",
                error = %err,
                "failed to close replaced connection"
            );
        }
        Ok(fresh)
    }
}

#[async_trait]
impl MediaConnection for WebRtcMedia {
    async fn create_offer(&self) -> Result<Description, CoupleError> {
        let pc = self.current();
        let offer = pc.create_offer(None).await.map_err(setup)?;
        pc.set_local_description(offer.clone())
            .await
            .map_err(setup)?;
        Ok(Description::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<Description, CoupleError> {
        let pc = self.current();
        let answer = pc.create_answer(None).await.map_err(setup)?;
        pc.set_local_description(answer.clone())
            .await
            .map_err(setup)?;
        Ok(Description::answer(answer.sdp))
    }

    async fn apply_remote_description(&self, description: &Description) -> Result<(), CoupleError> {
        let remote = match description.kind {
            DescriptionKind::Offer => RTCSessionDescription::offer(description.sdp.clone()),
            DescriptionKind::Answer => RTCSessionDescription::answer(description.sdp.clone()),
        }
        .map_err(|err| CoupleError::NegotiationRejected(err.to_string()))?;

        let pc = self.current();
        let pc = if description.kind == DescriptionKind::Offer
            && pc.signaling_state() == RTCSignalingState::HaveLocalOffer
        {
            // Our own offer is outstanding but the remote one won the
            // tie-break; adopt it on a clean connection.
            self.rebuild().await?
        } else {
            pc
        };
        pc.set_remote_description(remote)
            .await
            .map_err(|err| CoupleError::NegotiationRejected(err.to_string()))
    }

    async fn apply_remote_candidate(&self, candidate: &Candidate) -> Result<(), CoupleError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_mline_index.map(|index| index as u16),
            username_fragment: None,
        };
        self.current()
            .add_ice_candidate(init)
            .await
            .map_err(|err| CoupleError::InvalidCandidate(err.to_string()))
    }

    fn events(&self) -> mpsc::UnboundedReceiver<MediaEvent> {
        self.events_rx.lock().take().unwrap_or_else(|| {
            let (_tx, rx) = mpsc::unbounded_channel();
            rx
        })
    }

    async fn close(&self) {
        if let Err(err) = self.current().close().await {
            tracing::debug!(target: "couple::webrtc", error = %err, "close failed");
        }
    }
}

fn build_api() -> Result<API, CoupleError> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs().map_err(setup)?;
    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine).map_err(setup)?;
    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

async fn build_peer(
    api: &API,
    config: &WebRtcMediaConfig,
    events_tx: &mpsc::UnboundedSender<MediaEvent>,
    gate: &Arc<AtomicU64>,
    generation: u64,
) -> Result<Arc<RTCPeerConnection>, CoupleError> {
    let rtc_config = RTCConfiguration {
        ice_servers: config.ice_servers.clone(),
        ..Default::default()
    };
    let pc = Arc::new(api.new_peer_connection(rtc_config).await.map_err(setup)?);

    let tx = events_tx.clone();
    let guard = Arc::clone(gate);
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let tx = tx.clone();
        let guard = Arc::clone(&guard);
        Box::pin(async move {
            if guard.load(Ordering::SeqCst) != generation {
                return;
            }
            let Some(candidate) = candidate else {
                // End-of-gathering marker.
                return;
            };
            match candidate.to_json() {
                Ok(init) => {
                    let _ = tx.send(MediaEvent::LocalCandidate(Candidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index.map(u32::from),
                    }));
                }
                Err(err) => tracing::warn!(
                    target: "couple::webrtc",
                    error = %err,
                    "failed to serialize local candidate"
                ),
            }
        })
    }));

    let tx = events_tx.clone();
    let guard = Arc::clone(gate);
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let tx = tx.clone();
        let guard = Arc::clone(&guard);
        Box::pin(async move {
            if guard.load(Ordering::SeqCst) != generation {
                return;
            }
            tracing::trace!(target: "couple::webrtc", ?state, "peer connection state");
            if let Some(raw) = map_peer_state(state) {
                let _ = tx.send(MediaEvent::State(raw));
            }
        })
    }));

    // The ICE layer reports connectivity ahead of the connection layer;
    // together they give the monitor its two connected signals.
    let tx = events_tx.clone();
    let guard = Arc::clone(gate);
    pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
        let tx = tx.clone();
        let guard = Arc::clone(&guard);
        Box::pin(async move {
            if guard.load(Ordering::SeqCst) != generation {
                return;
            }
            tracing::trace!(target: "couple::webrtc", ?state, "ice connection state");
            if let Some(raw) = map_ice_state(state) {
                let _ = tx.send(MediaEvent::State(raw));
            }
        })
    }));

    if let Some(label) = &config.warmup_channel {
        pc.create_data_channel(
            label,
            Some(RTCDataChannelInit {
                ordered: Some(true),
                ..Default::default()
            }),
        )
        .await
        .map_err(setup)?;
    }

    Ok(pc)
}

fn map_peer_state(state: RTCPeerConnectionState) -> Option<RawConnectionState> {
    match state {
        RTCPeerConnectionState::New => Some(RawConnectionState::New),
        RTCPeerConnectionState::Connecting => Some(RawConnectionState::Connecting),
        RTCPeerConnectionState::Connected => Some(RawConnectionState::Connected),
        RTCPeerConnectionState::Disconnected => Some(RawConnectionState::Disconnected),
        RTCPeerConnectionState::Failed => Some(RawConnectionState::Failed),
        RTCPeerConnectionState::Closed => Some(RawConnectionState::Closed),
        RTCPeerConnectionState::Unspecified => None,
    }
}

fn map_ice_state(state: RTCIceConnectionState) -> Option<RawConnectionState> {
    match state {
        RTCIceConnectionState::Checking => Some(RawConnectionState::Connecting),
        RTCIceConnectionState::Connected | RTCIceConnectionState::Completed => {
            Some(RawConnectionState::Connected)
        }
        RTCIceConnectionState::Disconnected => Some(RawConnectionState::Disconnected),
        RTCIceConnectionState::Failed => Some(RawConnectionState::Failed),
        // Closure is reported once, by the connection layer.
        RTCIceConnectionState::New
        | RTCIceConnectionState::Closed
        | RTCIceConnectionState::Unspecified => None,
    }
}

fn setup(err: impl std::fmt::Display) -> CoupleError {
    CoupleError::Setup(err.to_string())
}
