//! In-process transport.
//!
//! Peers created from the same [`MemoryNetwork`] find each other through the
//! session descriptions they exchange, which only carry a peer id. Once
//! linked, channel messages are delivered straight into the other peer's
//! event stream. Nothing is ever buffered, so the buffered amount is always 0.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::protocol::{IceCandidate, SdpType, SessionDescription};
use crate::transport::{
    ConnectionState, DataChannel, PeerTransport, Role, TransportEvent, TransportFactory,
};

const SDP_PREFIX: &str = "memory:";

#[derive(Clone, Default)]
pub struct MemoryNetwork {
    hub: Arc<Hub>,
}

#[derive(Default)]
struct Hub {
    next_id: AtomicU64,
    peers: Mutex<HashMap<u64, Weak<MemoryPeer>>>,
    candidates: Mutex<Vec<String>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Addresses every peer announces as its local candidates.
    pub fn set_candidate_addresses(&self, addrs: Vec<String>) {
        *self.hub.candidates.lock() = addrs;
    }

    /// Number of peers that are created and not yet closed.
    pub fn live_peers(&self) -> usize {
        self.hub
            .peers
            .lock()
            .values()
            .filter(|p| p.strong_count() > 0)
            .count()
    }

    /// Closes every live peer, as a network outage would.
    pub fn sever(&self) {
        let peers: Vec<Arc<MemoryPeer>> = self
            .hub
            .peers
            .lock()
            .values()
            .filter_map(Weak::upgrade)
            .collect();
        for peer in peers {
            peer.shutdown();
        }
    }
}

#[async_trait]
impl TransportFactory for MemoryNetwork {
    async fn create(
        &self,
        role: Role,
    ) -> io::Result<(Arc<dyn PeerTransport>, UnboundedReceiver<TransportEvent>)> {
        let id = self.hub.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (events, rx) = unbounded_channel();
        let peer = Arc::new_cyclic(|me| MemoryPeer {
            id,
            role,
            me: me.clone(),
            hub: Arc::downgrade(&self.hub),
            events,
            remote: Mutex::new(Weak::new()),
            channels: Mutex::new(HashMap::new()),
            connected: AtomicBool::new(false),
            offered: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        self.hub.peers.lock().insert(id, Arc::downgrade(&peer));
        Ok((peer, rx))
    }
}

struct MemoryPeer {
    id: u64,
    role: Role,
    me: Weak<MemoryPeer>,
    hub: Weak<Hub>,
    events: UnboundedSender<TransportEvent>,
    remote: Mutex<Weak<MemoryPeer>>,
    channels: Mutex<HashMap<String, Arc<MemoryChannel>>>,
    connected: AtomicBool,
    offered: AtomicBool,
    closed: AtomicBool,
}

impl MemoryPeer {
    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    fn remote(&self) -> Option<Arc<MemoryPeer>> {
        self.remote.lock().upgrade()
    }

    fn announce(&self, kind: SdpType) {
        self.emit(TransportEvent::LocalDescription(SessionDescription {
            kind,
            sdp: format!("{SDP_PREFIX}{}", self.id),
        }));
        let Some(hub) = self.hub.upgrade() else {
            return;
        };
        let addrs = hub.candidates.lock().clone();
        for addr in addrs {
            self.emit(TransportEvent::LocalCandidate(IceCandidate {
                candidate: format!("candidate:1 1 udp 2130706431 {addr} 9 typ host"),
                mid: "0".to_string(),
            }));
        }
    }

    fn lookup(&self, desc: &SessionDescription) -> io::Result<Arc<MemoryPeer>> {
        let id = desc
            .sdp
            .strip_prefix(SDP_PREFIX)
            .and_then(|id| id.parse::<u64>().ok())
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidData, "not a memory session description")
            })?;
        let peer = match self.hub.upgrade() {
            Some(hub) => {
                let peers = hub.peers.lock();
                peers.get(&id).and_then(Weak::upgrade)
            }
            None => None,
        };
        peer.ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("memory peer {id} is gone"))
        })
    }

    fn link(&self, remote: &Arc<MemoryPeer>) {
        *self.remote.lock() = Arc::downgrade(remote);
        if !self.connected.swap(true, Ordering::AcqRel) {
            self.emit(TransportEvent::StateChange(ConnectionState::Connected));
        }
        self.open_pending();
    }

    fn open_pending(&self) {
        let Some(remote) = self.remote() else {
            return;
        };
        let pending: Vec<Arc<MemoryChannel>> = self
            .channels
            .lock()
            .values()
            .filter(|ch| !ch.open.swap(true, Ordering::AcqRel))
            .cloned()
            .collect();
        for ch in pending {
            remote.accept_channel(&ch.label);
            self.emit(TransportEvent::ChannelOpen(ch.label.clone()));
        }
    }

    fn accept_channel(&self, label: &str) {
        let ch = Arc::new(MemoryChannel::new(label, self.me.clone()));
        ch.open.store(true, Ordering::Release);
        self.channels.lock().insert(label.to_string(), ch.clone());
        self.emit(TransportEvent::IncomingChannel(ch));
        self.emit(TransportEvent::ChannelOpen(label.to_string()));
    }

    fn deliver(&self, label: &str, data: Bytes) -> bool {
        if !self.channels.lock().contains_key(label) {
            return false;
        }
        self.emit(TransportEvent::ChannelMessage(label.to_string(), data));
        true
    }

    fn drop_channel(&self, label: &str) {
        let removed = self.channels.lock().remove(label);
        if let Some(ch) = removed {
            ch.closed.store(true, Ordering::Release);
            self.emit(TransportEvent::ChannelClosed(label.to_string()));
        }
    }

    /// Returns false if the peer was already closed.
    fn shutdown(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        let channels: Vec<Arc<MemoryChannel>> =
            self.channels.lock().drain().map(|(_, ch)| ch).collect();
        for ch in channels {
            ch.closed.store(true, Ordering::Release);
            self.emit(TransportEvent::ChannelClosed(ch.label.clone()));
        }
        self.emit(TransportEvent::StateChange(ConnectionState::Closed));
        if let Some(hub) = self.hub.upgrade() {
            hub.peers.lock().remove(&self.id);
        }
        if let Some(remote) = self.remote() {
            remote.shutdown();
        }
        true
    }

    fn check_open(&self) -> io::Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "peer closed"));
        }
        Ok(())
    }
}

#[async_trait]
impl PeerTransport for MemoryPeer {
    async fn create_channel(&self, label: &str) -> io::Result<Arc<dyn DataChannel>> {
        self.check_open()?;
        let ch = {
            let mut channels = self.channels.lock();
            if channels.contains_key(label) {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("channel {label} exists"),
                ));
            }
            let ch = Arc::new(MemoryChannel::new(label, self.me.clone()));
            channels.insert(label.to_string(), ch.clone());
            ch
        };
        if self.role == Role::Initiator && !self.offered.swap(true, Ordering::AcqRel) {
            self.announce(SdpType::Offer);
        }
        if self.connected.load(Ordering::Acquire) {
            self.open_pending();
        }
        Ok(ch)
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> io::Result<()> {
        self.check_open()?;
        match desc.kind {
            SdpType::Offer => {
                let remote = self.lookup(&desc)?;
                self.announce(SdpType::Answer);
                self.link(&remote);
            }
            SdpType::Answer => {
                let remote = self.lookup(&desc)?;
                self.link(&remote);
            }
            SdpType::Pranswer | SdpType::Rollback => {}
        }
        Ok(())
    }

    async fn add_remote_candidate(&self, _candidate: IceCandidate) -> io::Result<()> {
        self.check_open()
    }

    async fn close(&self) -> io::Result<()> {
        self.shutdown();
        Ok(())
    }
}

struct MemoryChannel {
    label: String,
    owner: Weak<MemoryPeer>,
    open: AtomicBool,
    closed: AtomicBool,
}

impl MemoryChannel {
    fn new(label: &str, owner: Weak<MemoryPeer>) -> Self {
        Self {
            label: label.to_string(),
            owner,
            open: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl DataChannel for MemoryChannel {
    fn label(&self) -> &str {
        &self.label
    }

    async fn send(&self, data: Bytes) -> io::Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "channel closed"));
        }
        if !self.open.load(Ordering::Acquire) {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "channel not open"));
        }
        let remote = self.owner.upgrade().and_then(|owner| owner.remote());
        match remote {
            Some(remote) if remote.deliver(&self.label, data) => Ok(()),
            _ => Err(io::Error::new(io::ErrorKind::BrokenPipe, "remote channel gone")),
        }
    }

    async fn buffered_amount(&self) -> usize {
        0
    }

    async fn set_buffered_amount_low_threshold(&self, _threshold: usize) {}

    async fn close(&self) -> io::Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(owner) = self.owner.upgrade() {
            owner.drop_channel(&self.label);
            if let Some(remote) = owner.remote() {
                remote.drop_channel(&self.label);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn next_description(rx: &mut UnboundedReceiver<TransportEvent>) -> SessionDescription {
        loop {
            if let TransportEvent::LocalDescription(desc) = rx.recv().await.unwrap() {
                return desc;
            }
        }
    }

    #[tokio::test]
    async fn test_negotiate_and_exchange() {
        let network = MemoryNetwork::new();
        network.set_candidate_addresses(vec!["10.1.1.1".to_string()]);
        let (a, mut a_rx) = network.create(Role::Initiator).await.unwrap();
        let (b, mut b_rx) = network.create(Role::Responder).await.unwrap();

        let ch = a.create_channel("DataChannel").await.unwrap();
        let offer = next_description(&mut a_rx).await;
        assert_eq!(offer.kind, SdpType::Offer);
        match a_rx.recv().await.unwrap() {
            TransportEvent::LocalCandidate(c) => assert_eq!(c.address(), Some("10.1.1.1")),
            e => panic!("unexpected {e:?}"),
        }

        b.set_remote_description(offer).await.unwrap();
        let answer = next_description(&mut b_rx).await;
        a.set_remote_description(answer).await.unwrap();

        let mut incoming = None;
        while incoming.is_none() {
            if let TransportEvent::IncomingChannel(dc) = b_rx.recv().await.unwrap() {
                incoming = Some(dc);
            }
        }
        let incoming = incoming.unwrap();
        assert_eq!(incoming.label(), "DataChannel");

        ch.send(Bytes::from_static(b"hi")).await.unwrap();
        loop {
            if let TransportEvent::ChannelMessage(label, data) = b_rx.recv().await.unwrap() {
                assert_eq!(label, "DataChannel");
                assert_eq!(&data[..], b"hi");
                break;
            }
        }

        incoming.close().await.unwrap();
        assert!(ch.send(Bytes::from_static(b"late")).await.is_err());
        assert_eq!(network.live_peers(), 2);

        a.close().await.unwrap();
        assert_eq!(network.live_peers(), 0);
        loop {
            if let TransportEvent::StateChange(ConnectionState::Closed) = b_rx.recv().await.unwrap() {
                break;
            }
        }
    }

    #[tokio::test]
    async fn test_offer_from_vanished_peer() {
        let network = MemoryNetwork::new();
        let (b, _b_rx) = network.create(Role::Responder).await.unwrap();
        let desc = SessionDescription {
            kind: SdpType::Offer,
            sdp: "memory:4242".to_string(),
        };
        let err = b.set_remote_description(desc).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
