//! # ipaclinker-core - Rendezvous and Multiplexing Building Blocks
//!
//! `ipaclinker-core` holds the pieces of the ipaclinker tunnel that do not
//! touch a local socket: the signaling wire format, the relay's registry
//! state machine, the peer transport abstraction and the peer session that
//! multiplexes many channels over one transport.
//!
//! ## Architecture
//!
//! - [`protocol`] - Signaling messages and node identities
//! - [`registry`] - Server/client registration and signal routing rules
//! - [`transport`] - Peer transport traits, with in-memory and WebRTC backends
//! - [`peer`] - Channel multiplexer with per-channel backpressure
//! - [`error`] - Error types
//!
//! ## Quick Start
//!
//! ### Running the registry
//!
//! ```rust
//! use ipaclinker_core::protocol::{ClientReg, ServerReg, PROTOCOL_VERSION};
//! use ipaclinker_core::registry::{Registry, RegistryEvent, SessionId};
//!
//! let (mut registry, mut events) = Registry::new();
//! registry
//!     .register_server(SessionId(1), &ServerReg {
//!         version: PROTOCOL_VERSION.to_string(),
//!         server: "S1".to_string(),
//!     })
//!     .unwrap();
//! registry
//!     .register_client(SessionId(2), "203.0.113.5", &ClientReg {
//!         version: PROTOCOL_VERSION.to_string(),
//!         server: "S1".to_string(),
//!         uuid: "C1".to_string(),
//!     })
//!     .unwrap();
//! assert!(matches!(events.try_recv(), Ok(RegistryEvent::ClientRegistered { .. })));
//! ```
//!
//! ## Feature Flags
//!
//! - `webrtc` (default) - enables [`transport::webrtc`]

pub mod error;
pub mod peer;
pub mod protocol;
pub mod registry;
pub mod transport;
