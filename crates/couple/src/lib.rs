//! Couple local media connections to remote peers over an out-of-band
//! signalling relay.
//!
//! Two endpoints that cannot reach each other directly exchange offers,
//! answers and connectivity candidates through a relay until a direct
//! connection stands. The work happens in a per-peer **coupling monitor**:
//! it drives the handshake, resolves racing offers deterministically,
//! buffers candidates until the description they belong to has been
//! applied, and reports a small set of lifecycle events (`Negotiating`,
//! `Connected`, `Active`, `Disconnected`, `Closed`, `Error`).
//!
//! The relay and the media stack are both seams: anything implementing
//! [`SignalChannel`] can relay, anything implementing [`MediaConnection`]
//! can be coupled. [`MemoryHub`] relays inside one process;
//! `couple-webrtc` binds a real peer connection to the seam.
//!
//! # Example
//!
//! ```
//! use couple::mock::MockMedia;
//! use couple::{
//!     couple, couple_with_config, CoupleConfig, LifecycleEvent, MemoryHub, RawConnectionState,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), couple::CoupleError> {
//!     let hub = MemoryHub::new();
//!     let alice_media = MockMedia::new("alice");
//!     let bob_media = MockMedia::new("bob");
//!
//!     // Alice initiates; bob waits for her offer.
//!     let alice = couple(alice_media.clone(), "bob", hub.endpoint("alice"));
//!     let bob = couple_with_config(
//!         bob_media.clone(),
//!         "alice",
//!         hub.endpoint("bob"),
//!         CoupleConfig::responder(),
//!     );
//!     let mut alice_events = alice.events()?;
//!     let mut bob_events = bob.events()?;
//!
//!     async fn wait_for(
//!         events: &mut tokio::sync::mpsc::UnboundedReceiver<LifecycleEvent>,
//!         wanted: LifecycleEvent,
//!     ) {
//!         while let Some(event) = events.recv().await {
//!             if event == wanted {
//!                 return;
//!             }
//!         }
//!         panic!("event stream ended before {wanted:?}");
//!     }
//!
//!     // The underlying connections come up once the descriptions cross.
//!     alice_media.push_state(RawConnectionState::Connected);
//!     bob_media.push_state(RawConnectionState::Connected);
//!     wait_for(&mut alice_events, LifecycleEvent::Connected).await;
//!     wait_for(&mut bob_events, LifecycleEvent::Connected).await;
//!
//!     // A further connectivity signal marks the sessions active.
//!     alice_media.push_state(RawConnectionState::Connected);
//!     bob_media.push_state(RawConnectionState::Connected);
//!     wait_for(&mut alice_events, LifecycleEvent::Active).await;
//!     wait_for(&mut bob_events, LifecycleEvent::Active).await;
//!
//!     // Saying goodbye closes both sides.
//!     alice.close();
//!     wait_for(&mut bob_events, LifecycleEvent::Closed).await;
//!     Ok(())
//! }
//! ```

pub mod channel;
pub mod config;
pub mod error;
pub mod media;
pub mod mock;
pub mod monitor;
pub mod signal;

pub use channel::{MemoryChannel, MemoryHub, SignalChannel};
pub use config::{CoupleConfig, CoupleRole};
pub use error::CoupleError;
pub use media::{
    Candidate, Description, DescriptionKind, MediaConnection, MediaEvent, RawConnectionState,
};
pub use monitor::{LifecycleEvent, MonitorHandle, MonitorState, couple, couple_with_config};
pub use signal::{Announcement, PeerId, SessionId, SignalMessage};
