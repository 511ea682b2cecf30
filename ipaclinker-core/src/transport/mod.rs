//! Peer transport abstraction.
//!
//! A [`PeerTransport`] is one negotiated peer connection able to carry
//! named, ordered, reliable message channels. Everything it observes
//! (local negotiation data, state changes, channel traffic) comes out of a
//! single [`TransportEvent`] stream so the owner can drive it from one task.
//!
//! Two implementations ship with the crate: [`memory::MemoryNetwork`], an
//! in-process transport used by tests, and (behind the `webrtc` feature)
//! [`webrtc::WebRtcFactory`].

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::protocol::{IceCandidate, SessionDescription};

pub mod memory;
#[cfg(feature = "webrtc")]
pub mod webrtc;

/// Which side of the negotiation a transport plays.
///
/// The initiator produces the offer once it creates its first channel; the
/// responder answers the offer it is given.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    /// Terminal. Failures are reported as `Closed` too.
    Closed,
}

pub enum TransportEvent {
    LocalDescription(SessionDescription),
    LocalCandidate(IceCandidate),
    StateChange(ConnectionState),
    /// The remote side opened a channel.
    IncomingChannel(Arc<dyn DataChannel>),
    ChannelOpen(String),
    ChannelMessage(String, Bytes),
    BufferedAmountLow(String),
    ChannelClosed(String),
    ChannelError(String, String),
}

impl std::fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportEvent::LocalDescription(d) => write!(f, "LocalDescription({:?})", d.kind),
            TransportEvent::LocalCandidate(c) => write!(f, "LocalCandidate({})", c.candidate),
            TransportEvent::StateChange(s) => write!(f, "StateChange({s:?})"),
            TransportEvent::IncomingChannel(dc) => write!(f, "IncomingChannel({})", dc.label()),
            TransportEvent::ChannelOpen(l) => write!(f, "ChannelOpen({l})"),
            TransportEvent::ChannelMessage(l, b) => write!(f, "ChannelMessage({l}, {})", b.len()),
            TransportEvent::BufferedAmountLow(l) => write!(f, "BufferedAmountLow({l})"),
            TransportEvent::ChannelClosed(l) => write!(f, "ChannelClosed({l})"),
            TransportEvent::ChannelError(l, e) => write!(f, "ChannelError({l}, {e})"),
        }
    }
}

/// A STUN or TURN server.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IceServer {
    pub url: String,
    pub username: String,
    pub credential: String,
}

impl IceServer {
    /// Parses `stun:host:port` or `turn:user:pass@host:port`. The inline TURN
    /// credentials are split off the URL.
    ///
    /// ```rust
    /// use ipaclinker_core::transport::IceServer;
    ///
    /// let server = IceServer::parse("turn:free:free@freeturn.net:3478");
    /// assert_eq!(server.url, "turn:freeturn.net:3478");
    /// assert_eq!(server.username, "free");
    /// assert_eq!(server.credential, "free");
    /// ```
    pub fn parse(s: &str) -> IceServer {
        let s = s.trim();
        if let Some((scheme, rest)) = s.split_once(':') {
            if scheme == "turn" || scheme == "turns" {
                if let Some((creds, host)) = rest.rsplit_once('@') {
                    let (username, credential) = creds.split_once(':').unwrap_or((creds, ""));
                    return IceServer {
                        url: format!("{scheme}:{host}"),
                        username: username.to_string(),
                        credential: credential.to_string(),
                    };
                }
            }
        }
        IceServer {
            url: s.to_string(),
            ..Default::default()
        }
    }
}

/// Builds transports. Kept behind a trait so the mapping layer can run over
/// the in-memory network in tests.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        role: Role,
    ) -> io::Result<(Arc<dyn PeerTransport>, UnboundedReceiver<TransportEvent>)>;
}

#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Creates a locally initiated channel. Its `ChannelOpen` event follows
    /// once the connection is up.
    async fn create_channel(&self, label: &str) -> io::Result<Arc<dyn DataChannel>>;
    async fn set_remote_description(&self, desc: SessionDescription) -> io::Result<()>;
    async fn add_remote_candidate(&self, candidate: IceCandidate) -> io::Result<()>;
    async fn close(&self) -> io::Result<()>;
}

#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;
    async fn send(&self, data: Bytes) -> io::Result<()>;
    /// Bytes handed to `send` that the transport has not yet put on the wire.
    async fn buffered_amount(&self) -> usize;
    /// `BufferedAmountLow` fires when the buffered amount drops to this value.
    async fn set_buffered_amount_low_threshold(&self, threshold: usize);
    async fn close(&self) -> io::Result<()>;
}
