//! Initiator side of a mapping: a local listener whose connections are
//! carried to the server over one peer session.
//!
//! Each attempt walks `Registering -> CreatingPeer -> AwaitingPeerConnected
//! -> Bridging -> Closing`; the supervisor in [`MappingClient::run`] starts a
//! new attempt after a fixed delay, forever, until shutdown.

use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use async_shutdown::ShutdownManager;
use ipaclinker_core::peer::{CandidateFilter, PeerEvent, PeerSession, PeerSignal, DEFAULT_CHANNEL};
use ipaclinker_core::protocol::node_id::NodeId;
use ipaclinker_core::protocol::{IceCandidate, RelayMessage, SessionDescription, Signal, SignalEvent};
use ipaclinker_core::transport::{Role, TransportFactory};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::time::Instant;

use crate::config::Timings;
use crate::error::{Error, Result};
use crate::mapping::bridge::{self, Bridge};
use crate::mapping::display_buf;
use crate::signal::{SessionEvent, SignalSession};

#[derive(Clone, Debug)]
pub struct ClientOptions {
    pub name: String,
    /// Server identity to reach.
    pub server: NodeId,
    pub uuid: NodeId,
    /// Local port to listen on.
    pub port: u16,
    pub signal_server: String,
    pub filter: CandidateFilter,
    pub timings: Timings,
}

pub struct MappingClient {
    options: ClientOptions,
    factory: Arc<dyn TransportFactory>,
    shutdown_manager: ShutdownManager<()>,
}

enum AttemptEnd {
    Restart,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Registering,
    AwaitingPeerConnected { polls: u32 },
    Bridging,
}

impl MappingClient {
    pub fn new(options: ClientOptions, factory: Arc<dyn TransportFactory>) -> Self {
        Self {
            options,
            factory,
            shutdown_manager: ShutdownManager::new(),
        }
    }

    pub fn shutdown_manager(&self) -> ShutdownManager<()> {
        self.shutdown_manager.clone()
    }

    /// Runs attempts until shutdown. Only a listener bind failure ends the
    /// mapping early.
    pub async fn run(self) -> Result<()> {
        let name = &self.options.name;
        log::info!(
            "[{name}] connecting to server {}... and listening on local port {}",
            self.options.server.chars().take(4).collect::<String>(),
            self.options.port
        );
        // labels stay unique across attempts
        let mut next_label = 0u64;
        loop {
            match self.attempt(&mut next_label).await {
                Ok(AttemptEnd::Shutdown) => return Ok(()),
                Ok(AttemptEnd::Restart) => {}
                Err(e @ Error::Bind { .. }) => {
                    log::error!("[{name}] {e}");
                    return Err(e);
                }
                Err(e) => log::warn!("[{name}] attempt failed: {e}"),
            }
            let delay = self.options.timings.restart_delay();
            if self
                .shutdown_manager
                .wrap_cancel(tokio::time::sleep(delay))
                .await
                .is_err()
            {
                return Ok(());
            }
            log::info!("[{name}] restarting mapping...");
        }
    }

    async fn attempt(&self, next_label: &mut u64) -> Result<AttemptEnd> {
        let (signal, signal_events) = SignalSession::connect(
            &self.options.name,
            &self.options.signal_server,
            self.options.timings.reconnect_interval(),
        );
        let mut attempt = Attempt {
            options: &self.options,
            factory: &self.factory,
            signal,
            phase: Phase::Registering,
            listener: None,
            peer: None,
            bridges: HashMap::new(),
            next_check: None,
            done: unbounded_channel(),
        };
        let rs = attempt.drive(&self.shutdown_manager, signal_events, next_label).await;
        attempt.close().await;
        rs
    }
}

struct Attempt<'a> {
    options: &'a ClientOptions,
    factory: &'a Arc<dyn TransportFactory>,
    signal: SignalSession,
    phase: Phase,
    listener: Option<TcpListener>,
    peer: Option<(PeerSession, flume::Receiver<PeerEvent>)>,
    bridges: HashMap<String, Bridge>,
    next_check: Option<Instant>,
    done: (
        UnboundedSender<(String, io::Result<()>)>,
        UnboundedReceiver<(String, io::Result<()>)>,
    ),
}

impl Attempt<'_> {
    async fn drive(
        &mut self,
        shutdown_manager: &ShutdownManager<()>,
        signal_events: flume::Receiver<SessionEvent>,
        next_label: &mut u64,
    ) -> Result<AttemptEnd> {
        let name = self.options.name.clone();
        loop {
            let peer_events = self.peer.as_ref().map(|(_, rx)| rx.clone());
            let next_check = self.next_check;
            tokio::select! {
                _ = shutdown_manager.wait_shutdown_triggered() => {
                    return Ok(AttemptEnd::Shutdown);
                }
                event = signal_events.recv_async() => {
                    let Ok(event) = event else {
                        return Ok(AttemptEnd::Restart);
                    };
                    if let Some(end) = self.on_signal(event).await? {
                        return Ok(end);
                    }
                }
                event = recv_peer(peer_events) => {
                    if let Some(end) = self.on_peer(event) {
                        return Ok(end);
                    }
                }
                accepted = accept(self.listener.as_ref()) => match accepted {
                    Ok((stream, addr)) => self.on_accept(stream, addr, next_label).await,
                    Err(e) => log::warn!("[{name}] accept e={e:?}"),
                },
                Some((label, rs)) = self.done.1.recv() => {
                    if let Err(e) = rs {
                        log::debug!("[{name}] channel {label} socket e={e:?}");
                    }
                    log::info!("[{name}] local socket closed: Channel[{label}]");
                    self.bridges.remove(&label);
                    if let Some((peer, _)) = &self.peer {
                        peer.close_channel(&label);
                    }
                }
                _ = sleep_until(next_check) => {
                    if let Some(end) = self.on_check() {
                        return Ok(end);
                    }
                }
            }
        }
    }

    async fn on_signal(&mut self, event: SessionEvent) -> Result<Option<AttemptEnd>> {
        let name = &self.options.name;
        match event {
            SessionEvent::Connected => {
                log::info!("[{name}] preparing peer connection...");
                self.signal
                    .client_register(&self.options.server, &self.options.uuid);
            }
            SessionEvent::Disconnected => {
                log::info!("[{name}] signal server disconnected");
            }
            SessionEvent::Message(RelayMessage::ClientReg(ack)) => {
                if !ack.success {
                    log::error!("[{name}] registration refused");
                    return Ok(Some(AttemptEnd::Restart));
                }
                log::debug!("[{name}] client registered");
                if self.phase == Phase::Registering {
                    self.start_peer().await?;
                }
            }
            SessionEvent::Message(RelayMessage::ErrMsg(msg)) => {
                log::error!("[{name}] [signal server]: {msg}");
                if self.phase == Phase::Registering {
                    return Ok(Some(AttemptEnd::Restart));
                }
            }
            SessionEvent::Message(RelayMessage::ServerSignal(signal)) => {
                self.on_server_signal(signal).await;
            }
            SessionEvent::Message(msg) => {
                log::debug!("[{name}] ignore relay message {msg:?}");
            }
        }
        Ok(None)
    }

    /// Registration acknowledged: listen locally, then create the peer.
    async fn start_peer(&mut self) -> Result<()> {
        let port = self.options.port;
        let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, port)))
            .await
            .map_err(|source| Error::Bind { port, source })?;
        self.listener = Some(listener);

        let (peer, events) = PeerSession::new(
            self.factory.as_ref(),
            Role::Initiator,
            self.options.filter.clone(),
        )
        .await?;
        peer.create_channel(DEFAULT_CHANNEL).await?;
        self.peer = Some((peer, events));
        self.phase = Phase::AwaitingPeerConnected { polls: 0 };
        self.next_check = Some(Instant::now() + self.options.timings.connect_poll_interval());
        Ok(())
    }

    async fn on_server_signal(&mut self, signal: Signal) {
        let name = &self.options.name;
        let peer_signal = match signal.event {
            SignalEvent::ServerDescription => signal
                .decode::<SessionDescription>()
                .map(PeerSignal::Description),
            SignalEvent::ServerCandidate => signal.decode::<IceCandidate>().map(PeerSignal::Candidate),
            SignalEvent::ServerMsg => {
                log::info!("[{name}] [server]: {}", display_buf(&signal.buf));
                return;
            }
            SignalEvent::ErrMsg => {
                log::error!("[{name}] [server]: {}", display_buf(&signal.buf));
                return;
            }
            event => {
                log::error!("[{name}] unexpected signal event {event:?}");
                return;
            }
        };
        let peer_signal = match peer_signal {
            Ok(peer_signal) => peer_signal,
            Err(e) => {
                log::warn!("[{name}] {e}");
                return;
            }
        };
        let Some((peer, _)) = &self.peer else {
            log::debug!("[{name}] no peer yet, drop {:?}", signal.event);
            return;
        };
        if let Err(e) = peer.apply_signal(peer_signal).await {
            log::warn!("[{name}] apply server signal e={e:?}");
        }
    }

    fn on_peer(&mut self, event: PeerEvent) -> Option<AttemptEnd> {
        let name = &self.options.name;
        match event {
            PeerEvent::Signal(signal) => {
                let (event, buf) = match signal {
                    PeerSignal::Description(desc) => {
                        (SignalEvent::ClientDescription, serde_json::to_value(desc))
                    }
                    PeerSignal::Candidate(candidate) => {
                        log::debug!("[{name}] local candidate {}", candidate.candidate);
                        (SignalEvent::ClientCandidate, serde_json::to_value(candidate))
                    }
                };
                match buf {
                    Ok(buf) => {
                        self.signal.client_send_signal(
                            &self.options.server,
                            &self.options.uuid,
                            event,
                            buf,
                        );
                    }
                    Err(e) => log::warn!("[{name}] encode signal e={e:?}"),
                }
            }
            PeerEvent::Connected => {
                log::debug!("[{name}] peer connected: Client[{}]", self.options.uuid);
            }
            PeerEvent::Closed => {
                log::info!("[{name}] peer closed");
                return Some(AttemptEnd::Restart);
            }
            PeerEvent::ChannelOpened(label) => {
                log::debug!("[{name}] channel connected: Channel[{label}]");
            }
            PeerEvent::ChannelClosed(label) => {
                log::debug!("[{name}] channel closed: Channel[{label}]");
                // ends the local socket
                self.bridges.remove(&label);
            }
            PeerEvent::Data(label, data) => {
                if let Some(bridge) = self.bridges.get(&label) {
                    bridge.write(data);
                }
            }
            PeerEvent::ChannelError(label, e) => {
                log::warn!("[{name}] channel {label} error: {e}");
                self.bridges.remove(&label);
                if let Some((peer, _)) = &self.peer {
                    peer.close_channel(&label);
                }
            }
        }
        None
    }

    async fn on_accept(&mut self, stream: TcpStream, addr: SocketAddr, next_label: &mut u64) {
        let name = &self.options.name;
        *next_label += 1;
        let label = format!("#{next_label}");
        log::info!("[{name}] [NET] {addr} <-> Channel[{label}]");
        let Some((peer, _)) = &self.peer else {
            return;
        };
        if !peer.is_connected() {
            log::error!("[{name}] [NET] peer not connected yet, rejecting Channel[{label}]");
            return;
        }
        if let Err(e) = peer.create_channel(&label).await {
            log::error!("[{name}] create Channel[{label}] e={e:?}");
            return;
        }
        let done = self.done.0.clone();
        let done_label = label.clone();
        let bridge = bridge::spawn(label.clone(), stream, peer.clone(), move |rs| {
            let _ = done.send((done_label, rs));
        });
        self.bridges.insert(label, bridge);
    }

    fn on_check(&mut self) -> Option<AttemptEnd> {
        let name = &self.options.name;
        let timings = &self.options.timings;
        let connected = self
            .peer
            .as_ref()
            .map(|(peer, _)| peer.is_connected())
            .unwrap_or(false);
        match self.phase {
            Phase::Registering => {
                self.next_check = None;
            }
            Phase::AwaitingPeerConnected { polls } => {
                let polls = polls + 1;
                if connected {
                    log::debug!(
                        "[{name}] connection established! Server[{}] -> Client[{}]",
                        self.options.server,
                        self.options.uuid
                    );
                    log::info!(
                        "[{name}] use this address to reach the server: 127.0.0.1:{}",
                        self.options.port
                    );
                    self.phase = Phase::Bridging;
                    self.next_check = Some(Instant::now() + timings.liveness_interval());
                } else if polls >= timings.connect_poll_attempts {
                    log::warn!("[{name}] peer still not connected after {polls} checks");
                    self.phase = Phase::Bridging;
                    self.next_check = Some(Instant::now() + timings.liveness_interval());
                } else {
                    self.phase = Phase::AwaitingPeerConnected { polls };
                    self.next_check = Some(Instant::now() + timings.connect_poll_interval());
                }
            }
            Phase::Bridging => {
                if !connected {
                    return Some(AttemptEnd::Restart);
                }
                self.next_check = Some(Instant::now() + timings.liveness_interval());
            }
        }
        None
    }

    /// Tears down peer, listener and signaling, in that order.
    async fn close(&mut self) {
        let name = &self.options.name;
        self.bridges.clear();
        if let Some((peer, _)) = self.peer.take() {
            log::info!("[{name}] closing peer...");
            peer.close().await;
            log::info!("[{name}] peer closed");
        }
        if self.listener.take().is_some() {
            log::info!("[{name}] local listener closed");
        }
        self.signal.close();
        log::info!("[{name}] signal session closed");
    }
}

async fn recv_peer(events: Option<flume::Receiver<PeerEvent>>) -> PeerEvent {
    match events {
        Some(events) => match events.recv_async().await {
            Ok(event) => event,
            // the session is gone without saying so
            Err(_) => PeerEvent::Closed,
        },
        None => std::future::pending().await,
    }
}

async fn accept(listener: Option<&TcpListener>) -> io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
