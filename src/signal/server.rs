use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};

use async_shutdown::ShutdownManager;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use ipaclinker_core::protocol::{
    Ack, ClientArrived, ClientLeft, RelayMessage, Request, Signal, SignalEnvelope,
};
use ipaclinker_core::registry::{Registry, RegistryEvent, SessionId};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio_util::codec::Framed;

use crate::signal::codec;

/// Signaling relay. Matches servers and clients by identity and forwards
/// their opaque signals; it never carries tunnel traffic.
pub struct SignalServer {
    listener: TcpListener,
    shutdown_manager: ShutdownManager<()>,
}

enum RelayEvent {
    Open {
        session: SessionId,
        ip: String,
        writer: UnboundedSender<RelayMessage>,
    },
    Request {
        session: SessionId,
        req: Request,
    },
    Closed {
        session: SessionId,
    },
}

impl SignalServer {
    pub async fn bind<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            shutdown_manager: ShutdownManager::new(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Triggering this manager stops the accept loop and the registry actor.
    pub fn shutdown_manager(&self) -> ShutdownManager<()> {
        self.shutdown_manager.clone()
    }

    pub async fn run(self) -> io::Result<()> {
        let SignalServer {
            listener,
            shutdown_manager,
        } = self;
        log::info!("signal server listen {}", listener.local_addr()?);
        let (actor_tx, actor_rx) = unbounded_channel();
        let actor = shutdown_manager.wrap_cancel(registry_actor(actor_rx));
        tokio::spawn(async move {
            if actor.await.is_err() {
                log::debug!("recv shutdown signal: registry actor stopped");
            }
        });

        let mut next_session = 0u64;
        loop {
            let Ok(accepted) = shutdown_manager.wrap_cancel(listener.accept()).await else {
                return Ok(());
            };
            let (stream, addr) = match accepted {
                Ok(rs) => rs,
                Err(e) => {
                    log::warn!("signal server accept e={e:?}");
                    continue;
                }
            };
            next_session += 1;
            let session = SessionId(next_session);
            log::debug!("signal connection {session} from {addr}");
            let fut = shutdown_manager.wrap_cancel(connection(
                session,
                stream,
                canonical_ip(addr.ip()),
                actor_tx.clone(),
            ));
            tokio::spawn(async move {
                let _ = fut.await;
            });
        }
    }
}

/// IPv4-mapped IPv6 peers are reported with their IPv4 address.
pub(crate) fn canonical_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
        ip => ip,
    }
}

async fn connection(
    session: SessionId,
    stream: TcpStream,
    ip: IpAddr,
    actor: UnboundedSender<RelayEvent>,
) {
    let (mut sink, mut stream) = Framed::new(stream, codec()).split();
    let (writer, mut outbound) = unbounded_channel::<RelayMessage>();
    if actor
        .send(RelayEvent::Open {
            session,
            ip: ip.to_string(),
            writer: writer.clone(),
        })
        .is_err()
    {
        return;
    }
    let write_task = tokio::spawn(async move {
        while let Some(msg) = outbound.recv().await {
            let buf = match serde_json::to_vec(&msg) {
                Ok(buf) => buf,
                Err(e) => {
                    log::warn!("encode relay message e={e:?}");
                    continue;
                }
            };
            if let Err(e) = sink.send(Bytes::from(buf)).await {
                log::debug!("signal connection {session} send e={e:?}");
                break;
            }
        }
    });

    while let Some(frame) = stream.next().await {
        let buf = match frame {
            Ok(buf) => buf,
            Err(e) => {
                log::debug!("signal connection {session} recv e={e:?}");
                break;
            }
        };
        match serde_json::from_slice::<Request>(&buf) {
            Ok(req) => {
                if actor.send(RelayEvent::Request { session, req }).is_err() {
                    break;
                }
            }
            Err(e) => {
                let _ = writer.send(RelayMessage::ErrMsg(format!("invalid request: {e}")));
            }
        }
    }
    let _ = actor.send(RelayEvent::Closed { session });
    drop(writer);
    let _ = write_task.await;
    log::debug!("signal connection {session} closed");
}

struct Connection {
    ip: String,
    writer: UnboundedSender<RelayMessage>,
}

/// Owns the registry; every mutation happens here, one event at a time.
async fn registry_actor(mut events: UnboundedReceiver<RelayEvent>) {
    let (mut registry, mut bus) = Registry::new();
    let mut connections: HashMap<SessionId, Connection> = HashMap::new();
    while let Some(event) = events.recv().await {
        match event {
            RelayEvent::Open {
                session,
                ip,
                writer,
            } => {
                connections.insert(session, Connection { ip, writer });
            }
            RelayEvent::Request { session, req } => {
                if let Err(msg) = handle_request(&mut registry, &connections, session, req) {
                    reply(&connections, session, RelayMessage::ErrMsg(msg));
                }
            }
            RelayEvent::Closed { session } => {
                connections.remove(&session);
                if let Some(registration) = registry.disconnect(session) {
                    log::info!("signal connection {session} left: {registration:?}");
                }
            }
        }
        while let Ok(notice) = bus.try_recv() {
            match notice {
                RegistryEvent::ClientRegistered {
                    server_session,
                    uuid,
                    ip,
                } => reply(
                    &connections,
                    server_session,
                    RelayMessage::ClientRegistered(ClientArrived {
                        uuid: uuid.to_string(),
                        ip,
                    }),
                ),
                RegistryEvent::ClientUnregistered {
                    server_session,
                    uuid,
                } => reply(
                    &connections,
                    server_session,
                    RelayMessage::ClientUnregister(ClientLeft {
                        uuid: uuid.to_string(),
                    }),
                ),
            }
        }
    }
}

fn handle_request(
    registry: &mut Registry,
    connections: &HashMap<SessionId, Connection>,
    session: SessionId,
    req: Request,
) -> Result<(), String> {
    match req {
        Request::ServerReg(r) => {
            registry
                .register_server(session, &r)
                .map_err(|e| e.to_string())?;
            reply(connections, session, RelayMessage::ServerReg(Ack { success: true }));
        }
        Request::ClientReg(r) => {
            let ip = connections
                .get(&session)
                .map(|c| c.ip.clone())
                .unwrap_or_default();
            registry
                .register_client(session, &ip, &r)
                .map_err(|e| e.to_string())?;
            reply(connections, session, RelayMessage::ClientReg(Ack { success: true }));
        }
        Request::ServerSendSignal(env) => {
            let target = registry
                .route_to_client(&env.server, &env.uuid)
                .map_err(|e| e.to_string())?;
            reply(connections, target, RelayMessage::ServerSignal(forward(env)));
        }
        Request::ClientSendSignal(env) => {
            let target = registry
                .route_to_server(&env.server, &env.uuid)
                .map_err(|e| e.to_string())?;
            reply(connections, target, RelayMessage::ClientSignal(forward(env)));
        }
    }
    Ok(())
}

fn forward(env: SignalEnvelope) -> Signal {
    Signal {
        event: env.event,
        buf: env.buf,
        uuid: env.uuid,
    }
}

fn reply(connections: &HashMap<SessionId, Connection>, session: SessionId, msg: RelayMessage) {
    match connections.get(&session) {
        Some(conn) => {
            let _ = conn.writer.send(msg);
        }
        None => log::debug!("signal connection {session} gone, drop {msg:?}"),
    }
}
