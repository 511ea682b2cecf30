//! Responder side of a mapping: one peer session per registered client,
//! every channel of which is forwarded to a fixed local port.

use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use async_shutdown::ShutdownManager;
use ipaclinker_core::peer::{CandidateFilter, PeerEvent, PeerSession, PeerSignal, DEFAULT_CHANNEL};
use ipaclinker_core::protocol::node_id::NodeId;
use ipaclinker_core::protocol::{
    ClientArrived, IceCandidate, RelayMessage, SessionDescription, Signal, SignalEvent,
};
use ipaclinker_core::transport::{Role, TransportFactory};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::config::Timings;
use crate::error::Result;
use crate::mapping::bridge::{self, Bridge};
use crate::mapping::{display_buf, proxy};
use crate::signal::{SessionEvent, SignalSession};

#[derive(Clone, Debug)]
pub struct ServerOptions {
    pub name: String,
    /// Identity clients register against.
    pub uuid: NodeId,
    /// Local port every channel is forwarded to.
    pub port: u16,
    /// Greeting sent once the default channel opens.
    pub msg: String,
    /// Prefix each forwarded connection with a PROXY header.
    pub proxy_protocol: bool,
    pub signal_server: String,
    pub filter: CandidateFilter,
    pub timings: Timings,
}

pub struct MappingServer {
    options: ServerOptions,
    factory: Arc<dyn TransportFactory>,
    shutdown_manager: ShutdownManager<()>,
}

struct ClientSession {
    ip: String,
    peer: Option<PeerSession>,
    generation: u64,
    bridges: HashMap<String, Bridge>,
}

impl ClientSession {
    fn is_connected(&self) -> bool {
        self.peer.as_ref().map(|p| p.is_connected()).unwrap_or(false)
    }
}

/// Peer events tagged with the client session that produced them.
type Tagged<T> = (String, u64, T);

impl MappingServer {
    pub fn new(options: ServerOptions, factory: Arc<dyn TransportFactory>) -> Self {
        Self {
            options,
            factory,
            shutdown_manager: ShutdownManager::new(),
        }
    }

    pub fn shutdown_manager(&self) -> ShutdownManager<()> {
        self.shutdown_manager.clone()
    }

    pub async fn run(self) -> Result<()> {
        let name = self.options.name.clone();
        log::info!(
            "[{name}] serving local port {} as Server[{}]",
            self.options.port,
            self.options.uuid
        );
        let (signal, signal_events) = SignalSession::connect(
            &name,
            &self.options.signal_server,
            self.options.timings.reconnect_interval(),
        );
        let (peer_tx, peer_rx) = unbounded_channel();
        let (done_tx, done_rx) = unbounded_channel();
        let mut actor = Actor {
            options: &self.options,
            factory: &self.factory,
            signal,
            clients: HashMap::new(),
            next_generation: 0,
            peer_tx,
            done_tx,
        };
        actor
            .drive(&self.shutdown_manager, signal_events, peer_rx, done_rx)
            .await;
        actor.close().await;
        Ok(())
    }
}

struct Actor<'a> {
    options: &'a ServerOptions,
    factory: &'a Arc<dyn TransportFactory>,
    signal: SignalSession,
    clients: HashMap<String, ClientSession>,
    next_generation: u64,
    peer_tx: UnboundedSender<Tagged<PeerEvent>>,
    done_tx: UnboundedSender<Tagged<(String, io::Result<()>)>>,
}

impl Actor<'_> {
    async fn drive(
        &mut self,
        shutdown_manager: &ShutdownManager<()>,
        signal_events: flume::Receiver<SessionEvent>,
        mut peer_events: UnboundedReceiver<Tagged<PeerEvent>>,
        mut done: UnboundedReceiver<Tagged<(String, io::Result<()>)>>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown_manager.wait_shutdown_triggered() => return,
                event = signal_events.recv_async() => {
                    let Ok(event) = event else {
                        return;
                    };
                    self.on_signal(event).await;
                }
                Some((uuid, generation, event)) = peer_events.recv() => {
                    self.on_peer(uuid, generation, event);
                }
                Some((uuid, generation, (label, rs))) = done.recv() => {
                    self.on_bridge_done(uuid, generation, label, rs);
                }
            }
        }
    }

    async fn on_signal(&mut self, event: SessionEvent) {
        let name = &self.options.name;
        match event {
            SessionEvent::Connected => {
                log::info!("[{name}] registering Server[{}]...", self.options.uuid);
                self.signal.server_register(&self.options.uuid);
            }
            SessionEvent::Disconnected => {
                log::info!("[{name}] signal server disconnected");
            }
            SessionEvent::Message(RelayMessage::ServerReg(ack)) => {
                if ack.success {
                    log::info!("[{name}] server registered: Server[{}]", self.options.uuid);
                } else {
                    log::error!("[{name}] server registration refused");
                }
            }
            SessionEvent::Message(RelayMessage::ClientRegistered(arrived)) => {
                self.on_client_registered(arrived);
            }
            SessionEvent::Message(RelayMessage::ClientUnregister(left)) => {
                let uuid = left.uuid;
                match self.clients.get(&uuid).map(ClientSession::is_connected) {
                    Some(true) => {
                        log::info!("[{name}] client left signaling, peer kept: Client[{uuid}]");
                    }
                    Some(false) => {
                        log::info!("[{name}] client unregistered: Client[{uuid}]");
                        if let Some(client) = self.clients.remove(&uuid) {
                            close_detached(client);
                        }
                    }
                    None => {}
                }
            }
            SessionEvent::Message(RelayMessage::ClientSignal(signal)) => {
                self.on_client_signal(signal).await;
            }
            SessionEvent::Message(RelayMessage::ErrMsg(msg)) => {
                log::error!("[{name}] [signal server]: {msg}");
            }
            SessionEvent::Message(msg) => {
                log::debug!("[{name}] ignore relay message {msg:?}");
            }
        }
    }

    fn on_client_registered(&mut self, arrived: ClientArrived) {
        let name = &self.options.name;
        let ClientArrived { uuid, ip } = arrived;
        log::info!("[{name}] client registered: Client[{uuid}] from {ip}");
        if let Some(client) = self.clients.get_mut(&uuid) {
            if client.is_connected() {
                client.ip = ip;
                return;
            }
        }
        self.next_generation += 1;
        let fresh = ClientSession {
            ip,
            peer: None,
            generation: self.next_generation,
            bridges: HashMap::new(),
        };
        if let Some(stale) = self.clients.insert(uuid, fresh) {
            close_detached(stale);
        }
    }

    async fn on_client_signal(&mut self, signal: Signal) {
        let name = &self.options.name;
        let uuid = signal.uuid.clone();
        let peer_signal = match signal.event {
            SignalEvent::ClientDescription => signal
                .decode::<SessionDescription>()
                .map(PeerSignal::Description),
            SignalEvent::ClientCandidate => signal.decode::<IceCandidate>().map(PeerSignal::Candidate),
            SignalEvent::ClientMsg => {
                log::info!("[{name}] [Client[{uuid}]]: {}", display_buf(&signal.buf));
                return;
            }
            SignalEvent::ErrMsg => {
                log::error!("[{name}] [Client[{uuid}]]: {}", display_buf(&signal.buf));
                return;
            }
            event => {
                log::error!("[{name}] unexpected signal event {event:?} from Client[{uuid}]");
                return;
            }
        };
        let peer_signal = match peer_signal {
            Ok(peer_signal) => peer_signal,
            Err(e) => {
                log::warn!("[{name}] Client[{uuid}] {e}");
                return;
            }
        };
        let Some(client) = self.clients.get_mut(&uuid) else {
            log::warn!("[{name}] signal from unknown Client[{uuid}]");
            return;
        };
        if client.peer.is_none() {
            if !matches!(peer_signal, PeerSignal::Description(_)) {
                log::debug!("[{name}] no peer yet for Client[{uuid}], drop candidate");
                return;
            }
            match PeerSession::new(
                self.factory.as_ref(),
                Role::Responder,
                self.options.filter.clone(),
            )
            .await
            {
                Ok((peer, events)) => {
                    forward_events(uuid.clone(), client.generation, events, self.peer_tx.clone());
                    client.peer = Some(peer);
                }
                Err(e) => {
                    log::error!("[{name}] create peer for Client[{uuid}] e={e:?}");
                    return;
                }
            }
        }
        if let Some(peer) = &client.peer {
            if let Err(e) = peer.apply_signal(peer_signal).await {
                log::warn!("[{name}] apply signal of Client[{uuid}] e={e:?}");
            }
        }
    }

    fn on_peer(&mut self, uuid: String, generation: u64, event: PeerEvent) {
        let name = &self.options.name;
        let Some(client) = self
            .clients
            .get_mut(&uuid)
            .filter(|c| c.generation == generation)
        else {
            log::debug!("[{name}] stale peer event of Client[{uuid}]: {event:?}");
            return;
        };
        match event {
            PeerEvent::Signal(signal) => {
                let (event, buf) = match signal {
                    PeerSignal::Description(desc) => {
                        (SignalEvent::ServerDescription, serde_json::to_value(desc))
                    }
                    PeerSignal::Candidate(candidate) => {
                        log::debug!("[{name}] local candidate {}", candidate.candidate);
                        (SignalEvent::ServerCandidate, serde_json::to_value(candidate))
                    }
                };
                match buf {
                    Ok(buf) => {
                        self.signal
                            .server_send_signal(&self.options.uuid, &uuid, event, buf);
                    }
                    Err(e) => log::warn!("[{name}] encode signal e={e:?}"),
                }
            }
            PeerEvent::Connected => {
                log::info!("[{name}] peer connected: Client[{uuid}]");
            }
            PeerEvent::ChannelOpened(label) if label == DEFAULT_CHANNEL => {
                self.signal
                    .server_send_msg(&self.options.uuid, &uuid, &self.options.msg);
            }
            PeerEvent::ChannelOpened(label) => {
                let Some(peer) = client.peer.clone() else {
                    return;
                };
                let target = SocketAddr::from((Ipv4Addr::LOCALHOST, self.options.port));
                log::info!("[{name}] [NET] Client[{uuid}] Channel[{label}] <-> {target}");
                let preamble = self
                    .options
                    .proxy_protocol
                    .then(|| proxy::preamble(&client.ip));
                let done = self.done_tx.clone();
                let tag = (uuid.clone(), generation, label.clone());
                let bridge = bridge::spawn_connect(label.clone(), target, preamble, peer, move |rs| {
                    let (uuid, generation, label) = tag;
                    let _ = done.send((uuid, generation, (label, rs)));
                });
                client.bridges.insert(label, bridge);
            }
            PeerEvent::ChannelClosed(label) => {
                if client.bridges.remove(&label).is_some() {
                    log::info!("[{name}] channel closed: Client[{uuid}] Channel[{label}]");
                }
            }
            PeerEvent::Data(label, data) => {
                if let Some(bridge) = client.bridges.get(&label) {
                    bridge.write(data);
                }
            }
            PeerEvent::ChannelError(label, e) => {
                log::warn!("[{name}] Client[{uuid}] channel {label} error: {e}");
                client.bridges.remove(&label);
                if let Some(peer) = &client.peer {
                    peer.close_channel(&label);
                }
            }
            PeerEvent::Closed => {
                log::info!("[{name}] peer closed: Client[{uuid}]");
                // dropping the bridges ends every local socket
                self.clients.remove(&uuid);
            }
        }
    }

    fn on_bridge_done(&mut self, uuid: String, generation: u64, label: String, rs: io::Result<()>) {
        let name = &self.options.name;
        if let Err(e) = rs {
            log::warn!("[{name}] Client[{uuid}] Channel[{label}] local socket e={e:?}");
        }
        let Some(client) = self
            .clients
            .get_mut(&uuid)
            .filter(|c| c.generation == generation)
        else {
            return;
        };
        client.bridges.remove(&label);
        if let Some(peer) = &client.peer {
            peer.close_channel(&label);
        }
    }

    async fn close(&mut self) {
        let name = &self.options.name;
        let peers: Vec<PeerSession> = self
            .clients
            .drain()
            .filter_map(|(_, client)| client.peer)
            .collect();
        log::info!("[{name}] closing {} peer(s)...", peers.len());
        futures::future::join_all(peers.iter().map(|peer| peer.close())).await;
        self.signal.close();
        log::info!("[{name}] signal session closed");
    }
}

fn forward_events(
    uuid: String,
    generation: u64,
    events: flume::Receiver<PeerEvent>,
    tx: UnboundedSender<Tagged<PeerEvent>>,
) {
    tokio::spawn(async move {
        while let Ok(event) = events.recv_async().await {
            if tx.send((uuid.clone(), generation, event)).is_err() {
                break;
            }
        }
    });
}

/// Closes a replaced session's peer without holding up the actor.
fn close_detached(client: ClientSession) {
    if let Some(peer) = client.peer {
        tokio::spawn(async move {
            peer.close().await;
        });
    }
}
