//! WebRTC transport backed by webrtc-rs.
//!
//! Descriptions and candidates are trickled through [`TransportEvent`]s; the
//! initiator generates its offer together with its first channel, the
//! responder answers whatever offer it is handed.

use std::fmt::Display;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::protocol::{IceCandidate, SdpType, SessionDescription};
use crate::transport::{
    ConnectionState, DataChannel, IceServer, PeerTransport, Role, TransportEvent,
    TransportFactory,
};

fn other<E: Display>(e: E) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e.to_string())
}

fn invalid<E: Display>(e: E) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e.to_string())
}

#[derive(Clone, Debug, Default)]
pub struct WebRtcFactory {
    ice_servers: Vec<IceServer>,
}

impl WebRtcFactory {
    pub fn new(ice_servers: Vec<IceServer>) -> Self {
        Self { ice_servers }
    }

    fn configuration(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: self
                .ice_servers
                .iter()
                .map(|s| RTCIceServer {
                    urls: vec![s.url.clone()],
                    username: s.username.clone(),
                    credential: s.credential.clone(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
    }
}

#[async_trait]
impl TransportFactory for WebRtcFactory {
    async fn create(
        &self,
        role: Role,
    ) -> io::Result<(Arc<dyn PeerTransport>, UnboundedReceiver<TransportEvent>)> {
        let api = APIBuilder::new().build();
        let pc = Arc::new(
            api.new_peer_connection(self.configuration())
                .await
                .map_err(other)?,
        );
        let (events, rx) = unbounded_channel();

        let tx = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx.send(TransportEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            mid: init.sdp_mid.unwrap_or_default(),
                        }));
                    }
                    Err(e) => log::warn!("ice candidate to_json e={e:?}"),
                }
            })
        }));

        let tx = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            log::debug!("peer connection state {state}");
            let _ = tx.send(TransportEvent::StateChange(map_state(state)));
            Box::pin(async {})
        }));

        let tx = events.clone();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let tx = tx.clone();
            Box::pin(async move {
                let channel = WebRtcChannel::new(dc.clone());
                let _ = tx.send(TransportEvent::IncomingChannel(Arc::new(channel)));
                wire_channel(&dc, &tx).await;
            })
        }));

        let peer = WebRtcPeer {
            role,
            pc,
            events,
            offered: AtomicBool::new(false),
            remote_set: AtomicBool::new(false),
            pending_candidates: Mutex::new(Vec::new()),
        };
        Ok((Arc::new(peer), rx))
    }
}

fn map_state(state: RTCPeerConnectionState) -> ConnectionState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => ConnectionState::New,
        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed => ConnectionState::Closed,
    }
}

/// Forwards the channel callbacks into the transport event stream, keyed by label.
async fn wire_channel(dc: &Arc<RTCDataChannel>, events: &UnboundedSender<TransportEvent>) {
    let label = dc.label().to_string();

    let (tx, l) = (events.clone(), label.clone());
    dc.on_open(Box::new(move || {
        let _ = tx.send(TransportEvent::ChannelOpen(l));
        Box::pin(async {})
    }));

    let (tx, l) = (events.clone(), label.clone());
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let _ = tx.send(TransportEvent::ChannelMessage(l.clone(), msg.data));
        Box::pin(async {})
    }));

    let (tx, l) = (events.clone(), label.clone());
    dc.on_close(Box::new(move || {
        let _ = tx.send(TransportEvent::ChannelClosed(l.clone()));
        Box::pin(async {})
    }));

    let (tx, l) = (events.clone(), label.clone());
    dc.on_error(Box::new(move |e: webrtc::Error| {
        let _ = tx.send(TransportEvent::ChannelError(l.clone(), e.to_string()));
        Box::pin(async {})
    }));

    let (tx, l) = (events.clone(), label);
    dc.on_buffered_amount_low(Box::new(move || {
        let _ = tx.send(TransportEvent::BufferedAmountLow(l.clone()));
        Box::pin(async {})
    }))
    .await;
}

fn to_description(desc: &RTCSessionDescription) -> io::Result<SessionDescription> {
    let value = serde_json::to_value(desc).map_err(invalid)?;
    serde_json::from_value(value).map_err(invalid)
}

fn from_description(desc: SessionDescription) -> io::Result<RTCSessionDescription> {
    let value = serde_json::to_value(desc).map_err(invalid)?;
    serde_json::from_value(value).map_err(invalid)
}

struct WebRtcPeer {
    role: Role,
    pc: Arc<RTCPeerConnection>,
    events: UnboundedSender<TransportEvent>,
    offered: AtomicBool,
    remote_set: AtomicBool,
    // candidates that arrived ahead of the remote description
    pending_candidates: Mutex<Vec<RTCIceCandidateInit>>,
}

impl WebRtcPeer {
    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl PeerTransport for WebRtcPeer {
    async fn create_channel(&self, label: &str) -> io::Result<Arc<dyn DataChannel>> {
        let dc = self
            .pc
            .create_data_channel(label, None)
            .await
            .map_err(other)?;
        wire_channel(&dc, &self.events).await;
        if self.role == Role::Initiator && !self.offered.swap(true, Ordering::AcqRel) {
            let offer = self.pc.create_offer(None).await.map_err(other)?;
            // announced before gathering starts so it precedes every candidate
            self.emit(TransportEvent::LocalDescription(to_description(&offer)?));
            self.pc.set_local_description(offer).await.map_err(other)?;
        }
        Ok(Arc::new(WebRtcChannel::new(dc)))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> io::Result<()> {
        let kind = desc.kind;
        self.pc
            .set_remote_description(from_description(desc)?)
            .await
            .map_err(other)?;
        self.remote_set.store(true, Ordering::Release);

        let pending = std::mem::take(&mut *self.pending_candidates.lock());
        for candidate in pending {
            if let Err(e) = self.pc.add_ice_candidate(candidate).await {
                log::debug!("add_ice_candidate e={e:?}");
            }
        }

        if kind == SdpType::Offer {
            let answer = self.pc.create_answer(None).await.map_err(other)?;
            self.emit(TransportEvent::LocalDescription(to_description(&answer)?));
            self.pc.set_local_description(answer).await.map_err(other)?;
        }
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> io::Result<()> {
        let init = if candidate.mid.is_empty() {
            RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mline_index: Some(0),
                ..Default::default()
            }
        } else {
            RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: Some(candidate.mid),
                ..Default::default()
            }
        };
        if !self.remote_set.load(Ordering::Acquire) {
            self.pending_candidates.lock().push(init);
            return Ok(());
        }
        self.pc.add_ice_candidate(init).await.map_err(other)
    }

    async fn close(&self) -> io::Result<()> {
        self.pc.close().await.map_err(other)
    }
}

struct WebRtcChannel {
    label: String,
    dc: Arc<RTCDataChannel>,
}

impl WebRtcChannel {
    fn new(dc: Arc<RTCDataChannel>) -> Self {
        Self {
            label: dc.label().to_string(),
            dc,
        }
    }
}

#[async_trait]
impl DataChannel for WebRtcChannel {
    fn label(&self) -> &str {
        &self.label
    }

    async fn send(&self, data: Bytes) -> io::Result<()> {
        self.dc.send(&data).await.map(|_| ()).map_err(other)
    }

    async fn buffered_amount(&self) -> usize {
        self.dc.buffered_amount().await
    }

    async fn set_buffered_amount_low_threshold(&self, threshold: usize) {
        self.dc.set_buffered_amount_low_threshold(threshold).await
    }

    async fn close(&self) -> io::Result<()> {
        self.dc.close().await.map_err(other)
    }
}
