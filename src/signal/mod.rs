//! Signaling: the relay server and the node-side session talking to it.
//!
//! Both ends speak length-prefixed JSON frames over TCP, each frame holding
//! one [`Request`] (node to relay) or one [`RelayMessage`] (relay to node).

use std::sync::Arc;
use std::time::Duration;

use async_shutdown::ShutdownManager;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use ipaclinker_core::protocol::node_id::NodeId;
use ipaclinker_core::protocol::{
    ClientReg, RelayMessage, Request, ServerReg, SignalEnvelope, SignalEvent, PROTOCOL_VERSION,
};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

pub mod server;

/// Largest signaling frame either side accepts.
pub(crate) const MAX_FRAME_LEN: usize = 1024 * 1024;

pub(crate) fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LEN)
        .new_codec()
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    Connected,
    Disconnected,
    Message(RelayMessage),
}

/// Connection to the relay, kept up in the background.
///
/// Each time the connection comes up the owner sees
/// [`SessionEvent::Connected`] and is expected to register again: the relay
/// forgets everything about a connection once it drops.
#[derive(Clone)]
pub struct SignalSession {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    name: String,
    outbound: Arc<Mutex<Option<UnboundedSender<Request>>>>,
    shutdown_manager: ShutdownManager<()>,
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        _ = self.shutdown_manager.trigger_shutdown(());
    }
}

impl SignalSession {
    pub fn connect(
        name: &str,
        addr: &str,
        reconnect_interval: Duration,
    ) -> (SignalSession, flume::Receiver<SessionEvent>) {
        let (events, receiver) = flume::unbounded();
        let inner = Arc::new(SessionInner {
            name: name.to_string(),
            outbound: Arc::new(Mutex::new(None)),
            shutdown_manager: ShutdownManager::new(),
        });
        let fut = inner.shutdown_manager.wrap_cancel(run(
            name.to_string(),
            addr.to_string(),
            reconnect_interval,
            inner.outbound.clone(),
            events,
        ));
        let name = name.to_string();
        tokio::spawn(async move {
            if fut.await.is_err() {
                log::debug!("[{name}] recv shutdown signal: signal session stopped");
            }
        });
        (SignalSession { inner }, receiver)
    }

    pub fn is_connected(&self) -> bool {
        self.inner.outbound.lock().is_some()
    }

    /// Sends `req` if the relay is reachable. While disconnected the request
    /// is logged and dropped.
    pub fn send(&self, req: Request) -> bool {
        let sent = match self.inner.outbound.lock().as_ref() {
            Some(outbound) => outbound.send(req).is_ok(),
            None => false,
        };
        if !sent {
            log::error!("[{}] signal server not connected, message dropped", self.inner.name);
        }
        sent
    }

    pub fn server_register(&self, server: &NodeId) -> bool {
        self.send(Request::ServerReg(ServerReg {
            version: PROTOCOL_VERSION.to_string(),
            server: server.to_string(),
        }))
    }

    pub fn client_register(&self, server: &NodeId, uuid: &NodeId) -> bool {
        self.send(Request::ClientReg(ClientReg {
            version: PROTOCOL_VERSION.to_string(),
            server: server.to_string(),
            uuid: uuid.to_string(),
        }))
    }

    /// Server side: signal one of its clients.
    pub fn server_send_signal(
        &self,
        server: &NodeId,
        uuid: &str,
        event: SignalEvent,
        buf: Value,
    ) -> bool {
        self.send(Request::ServerSendSignal(SignalEnvelope {
            server: server.to_string(),
            uuid: uuid.to_string(),
            event,
            buf,
        }))
    }

    /// Client side: signal the server it registered against.
    pub fn client_send_signal(
        &self,
        server: &NodeId,
        uuid: &NodeId,
        event: SignalEvent,
        buf: Value,
    ) -> bool {
        self.send(Request::ClientSendSignal(SignalEnvelope {
            server: server.to_string(),
            uuid: uuid.to_string(),
            event,
            buf,
        }))
    }

    /// Free-form text from a server to one of its clients.
    pub fn server_send_msg(&self, server: &NodeId, uuid: &str, text: &str) -> bool {
        self.server_send_signal(server, uuid, SignalEvent::ServerMsg, Value::from(text))
    }

    pub fn close(&self) {
        _ = self.inner.shutdown_manager.trigger_shutdown(());
        self.inner.outbound.lock().take();
    }
}

async fn run(
    name: String,
    addr: String,
    reconnect_interval: Duration,
    outbound: Arc<Mutex<Option<UnboundedSender<Request>>>>,
    events: flume::Sender<SessionEvent>,
) {
    loop {
        match TcpStream::connect(&addr).await {
            Ok(stream) => {
                log::info!("[{name}] connected to signal server {addr}");
                let (sink, stream) = Framed::new(stream, codec()).split();
                let (tx, rx) = unbounded_channel();
                *outbound.lock() = Some(tx);
                let alive = events.send(SessionEvent::Connected).is_ok()
                    && serve(&name, sink, stream, rx, &events).await;
                outbound.lock().take();
                if !alive || events.send(SessionEvent::Disconnected).is_err() {
                    return;
                }
                log::warn!("[{name}] disconnected from signal server {addr}");
            }
            Err(e) => log::debug!("[{name}] connect signal server {addr} e={e:?}"),
        }
        tokio::time::sleep(reconnect_interval).await;
    }
}

/// Pumps one connection. Returns false once nobody listens for events.
async fn serve<S, R>(
    name: &str,
    mut sink: S,
    mut stream: R,
    mut rx: tokio::sync::mpsc::UnboundedReceiver<Request>,
    events: &flume::Sender<SessionEvent>,
) -> bool
where
    S: futures::Sink<Bytes, Error = std::io::Error> + Unpin,
    R: futures::Stream<Item = std::io::Result<bytes::BytesMut>> + Unpin,
{
    loop {
        tokio::select! {
            req = rx.recv() => {
                let Some(req) = req else {
                    return true;
                };
                let buf = match serde_json::to_vec(&req) {
                    Ok(buf) => buf,
                    Err(e) => {
                        log::warn!("[{name}] encode request e={e:?}");
                        continue;
                    }
                };
                if let Err(e) = sink.send(Bytes::from(buf)).await {
                    log::warn!("[{name}] signal send e={e:?}");
                    return true;
                }
            }
            frame = stream.next() => {
                let buf = match frame {
                    Some(Ok(buf)) => buf,
                    Some(Err(e)) => {
                        log::warn!("[{name}] signal recv e={e:?}");
                        return true;
                    }
                    None => return true,
                };
                match serde_json::from_slice::<RelayMessage>(&buf) {
                    Ok(msg) => {
                        if events.send(SessionEvent::Message(msg)).is_err() {
                            return false;
                        }
                    }
                    Err(e) => log::warn!("[{name}] invalid relay message e={e:?}"),
                }
            }
        }
    }
}
