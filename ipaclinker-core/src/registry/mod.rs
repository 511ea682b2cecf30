//! Rendezvous registry for the signaling relay.
//!
//! The registry maintains:
//! - server identities and the clients registered under each of them
//! - client identities and the server that owns them
//! - which relay connection (session) holds which registration
//!
//! It never touches a socket. Replies are returned to the caller, and the
//! asynchronous notices owed to a server (a client arrived or left) are
//! published on the event bus handed out by [`Registry::new`].

use std::collections::{HashMap, HashSet};
use std::fmt;

use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::error::ProtocolError;
use crate::protocol::node_id::NodeId;
use crate::protocol::{ClientReg, ServerReg};

/// Handle of one relay connection.
#[derive(Hash, Eq, PartialEq, Ord, PartialOrd, Copy, Clone, Debug)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What a relay connection registered as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
    Server(NodeId),
    Client { server: NodeId, uuid: NodeId },
}

#[derive(Debug, Clone)]
pub struct ServerRecord {
    pub id: NodeId,
    pub session: SessionId,
    pub version: String,
    pub clients: HashSet<NodeId>,
}

#[derive(Debug, Clone)]
pub struct ClientRecord {
    pub id: NodeId,
    pub session: SessionId,
    pub server: NodeId,
}

/// Notices owed to a registered server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    ClientRegistered {
        server_session: SessionId,
        uuid: NodeId,
        ip: String,
    },
    ClientUnregistered {
        server_session: SessionId,
        uuid: NodeId,
    },
}

pub struct Registry {
    servers: HashMap<NodeId, ServerRecord>,
    clients: HashMap<NodeId, ClientRecord>,
    sessions: HashMap<SessionId, Registration>,
    bus: UnboundedSender<RegistryEvent>,
}

impl Registry {
    /// Create an empty registry together with the receiving end of its event bus.
    pub fn new() -> (Registry, UnboundedReceiver<RegistryEvent>) {
        let (bus, events) = unbounded_channel();
        let registry = Registry {
            servers: HashMap::new(),
            clients: HashMap::new(),
            sessions: HashMap::new(),
            bus,
        };
        (registry, events)
    }

    /// Register `session` as the server named in `req`.
    ///
    /// The first registrant of an identifier wins; later attempts are
    /// rejected without touching the existing record.
    pub fn register_server(
        &mut self,
        session: SessionId,
        req: &ServerReg,
    ) -> Result<(), ProtocolError> {
        let id = NodeId::new(req.server.as_str())?;
        if let Some(reg) = self.sessions.get(&session) {
            return Err(ProtocolError::AlreadyRegistered(describe(reg)));
        }
        if self.servers.contains_key(&id) {
            return Err(ProtocolError::AlreadyOnline(id.to_string()));
        }
        log::info!("register server Server[{id}] version={} session={session}", req.version);
        self.servers.insert(
            id.clone(),
            ServerRecord {
                id: id.clone(),
                session,
                version: req.version.clone(),
                clients: HashSet::new(),
            },
        );
        self.sessions.insert(session, Registration::Server(id));
        Ok(())
    }

    /// Register `session` as client `req.uuid` of server `req.server`.
    ///
    /// On success the owning server is notified through the event bus. If
    /// another connection held the identity, that registration is dropped
    /// and its server is told the client left.
    pub fn register_client(
        &mut self,
        session: SessionId,
        ip: &str,
        req: &ClientReg,
    ) -> Result<(), ProtocolError> {
        let uuid = NodeId::new(req.uuid.as_str())?;
        let server_id = NodeId::new(req.server.as_str())?;
        let server = self
            .servers
            .get(&server_id)
            .ok_or_else(|| ProtocolError::UnknownServer(server_id.to_string()))?;
        if server.version != req.version {
            return Err(ProtocolError::VersionMismatch {
                client: req.version.clone(),
                server: server.version.clone(),
            });
        }
        let server_session = server.session;
        match self.sessions.get(&session) {
            Some(Registration::Client { uuid: current, .. }) if *current == uuid => {}
            Some(reg) => return Err(ProtocolError::AlreadyRegistered(describe(reg))),
            None => {}
        }
        // the newest connection holds the identity; an older holder is evicted
        if let Some(holder) = self.clients.get(&uuid).map(|c| c.session) {
            if holder != session {
                log::info!("client {uuid} moved from session={holder} to session={session}");
                self.sessions.remove(&holder);
            }
        }
        self.drop_client(&uuid);

        log::info!("register client {uuid} -> Server[{server_id}] session={session}");
        self.clients.insert(
            uuid.clone(),
            ClientRecord {
                id: uuid.clone(),
                session,
                server: server_id.clone(),
            },
        );
        if let Some(server) = self.servers.get_mut(&server_id) {
            server.clients.insert(uuid.clone());
        }
        self.sessions.insert(
            session,
            Registration::Client {
                server: server_id,
                uuid: uuid.clone(),
            },
        );
        self.publish(RegistryEvent::ClientRegistered {
            server_session,
            uuid,
            ip: ip.to_string(),
        });
        Ok(())
    }

    /// Session of the client a server-originated signal must reach.
    pub fn route_to_client(&self, server: &str, uuid: &str) -> Result<SessionId, ProtocolError> {
        self.check_pair(server, uuid)?;
        self.clients
            .get(uuid)
            .map(|c| c.session)
            .ok_or_else(|| ProtocolError::UnknownClient(uuid.to_string()))
    }

    /// Session of the server a client-originated signal must reach.
    pub fn route_to_server(&self, server: &str, uuid: &str) -> Result<SessionId, ProtocolError> {
        self.check_pair(server, uuid).map(|s| s.session)
    }

    fn check_pair(&self, server: &str, uuid: &str) -> Result<&ServerRecord, ProtocolError> {
        let record = self
            .servers
            .get(server)
            .ok_or_else(|| ProtocolError::UnknownServer(server.to_string()))?;
        if !record.clients.contains(uuid) {
            return Err(ProtocolError::UnknownClient(uuid.to_string()));
        }
        Ok(record)
    }

    /// Forget whatever `session` registered as.
    ///
    /// A departing client is removed from its server's set and the server is
    /// told, unless the identity has since moved to another connection. A
    /// departing server takes its record and the records of every client
    /// registered under it; those connections are left unregistered.
    pub fn disconnect(&mut self, session: SessionId) -> Option<Registration> {
        let registration = self.sessions.remove(&session)?;
        match &registration {
            Registration::Client { uuid, .. } => {
                if self.clients.get(uuid).map(|c| c.session) == Some(session) {
                    self.drop_client(uuid);
                }
            }
            Registration::Server(id) => {
                if let Some(record) = self.servers.remove(id) {
                    log::info!(
                        "unregister server Server[{id}], purging {} clients",
                        record.clients.len()
                    );
                    for uuid in &record.clients {
                        if let Some(client) = self.clients.remove(uuid) {
                            self.sessions.remove(&client.session);
                        }
                    }
                }
            }
        }
        Some(registration)
    }

    fn drop_client(&mut self, uuid: &NodeId) {
        let Some(record) = self.clients.remove(uuid) else {
            return;
        };
        if let Some(server) = self.servers.get_mut(&record.server) {
            if server.clients.remove(uuid) {
                log::info!("unregister client {uuid} -> Server[{}]", record.server);
                let server_session = server.session;
                self.publish(RegistryEvent::ClientUnregistered {
                    server_session,
                    uuid: uuid.clone(),
                });
            }
        }
    }

    fn publish(&self, event: RegistryEvent) {
        if self.bus.send(event).is_err() {
            log::debug!("registry event bus has no listener");
        }
    }

    pub fn server(&self, id: &str) -> Option<&ServerRecord> {
        self.servers.get(id)
    }
    pub fn client(&self, id: &str) -> Option<&ClientRecord> {
        self.clients.get(id)
    }
    pub fn registration(&self, session: SessionId) -> Option<&Registration> {
        self.sessions.get(&session)
    }
    pub fn server_count(&self) -> usize {
        self.servers.len()
    }
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }
}

fn describe(reg: &Registration) -> String {
    match reg {
        Registration::Server(id) => format!("Server[{id}]"),
        Registration::Client { uuid, .. } => format!("Client[{uuid}]"),
    }
}
