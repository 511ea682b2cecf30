use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use ipaclinker::signal::server::SignalServer;
use ipaclinker::signal::{SessionEvent, SignalSession};
use ipaclinker_core::protocol::node_id::NodeId;
use ipaclinker_core::protocol::{
    Ack, ClientArrived, ClientLeft, ClientReg, RelayMessage, Request, ServerReg, SignalEnvelope,
    SignalEvent, PROTOCOL_VERSION,
};
use serde_json::json;
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

struct Node {
    framed: Framed<TcpStream, LengthDelimitedCodec>,
}

impl Node {
    async fn connect(addr: std::net::SocketAddr) -> Node {
        let stream = TcpStream::connect(addr).await.unwrap();
        Node {
            framed: Framed::new(stream, LengthDelimitedCodec::new()),
        }
    }

    async fn send(&mut self, req: &Request) {
        let buf = serde_json::to_vec(req).unwrap();
        self.framed.send(Bytes::from(buf)).await.unwrap();
    }

    async fn recv(&mut self) -> RelayMessage {
        let frame = tokio::time::timeout(Duration::from_secs(5), self.framed.next())
            .await
            .expect("relay reply")
            .unwrap()
            .unwrap();
        serde_json::from_slice(&frame).unwrap()
    }

    async fn recv_raw(&mut self) -> serde_json::Value {
        let frame = tokio::time::timeout(Duration::from_secs(5), self.framed.next())
            .await
            .expect("relay reply")
            .unwrap()
            .unwrap();
        serde_json::from_slice(&frame).unwrap()
    }
}

async fn start_relay() -> std::net::SocketAddr {
    let server = SignalServer::bind("127.0.0.1:0").await.unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.run());
    addr
}

fn server_reg(server: &str) -> Request {
    Request::ServerReg(ServerReg {
        version: PROTOCOL_VERSION.to_string(),
        server: server.to_string(),
    })
}

fn client_reg(server: &str, uuid: &str, version: &str) -> Request {
    Request::ClientReg(ClientReg {
        version: version.to_string(),
        server: server.to_string(),
        uuid: uuid.to_string(),
    })
}

#[tokio::test]
async fn test_register_and_forward_signals() {
    let addr = start_relay().await;
    let mut server = Node::connect(addr).await;
    server.send(&server_reg("S1")).await;
    assert_eq!(
        server.recv_raw().await,
        json!({"type": "ServerReg", "data": {"success": true}})
    );

    let mut client = Node::connect(addr).await;
    client.send(&client_reg("S1", "C1", PROTOCOL_VERSION)).await;
    assert_eq!(client.recv().await, RelayMessage::ClientReg(Ack { success: true }));
    assert_eq!(
        server.recv().await,
        RelayMessage::ClientRegistered(ClientArrived {
            uuid: "C1".to_string(),
            ip: "127.0.0.1".to_string(),
        })
    );

    let offer = json!({"type": "offer", "sdp": "v=0"});
    client
        .send(&Request::ClientSendSignal(SignalEnvelope {
            server: "S1".to_string(),
            uuid: "C1".to_string(),
            event: SignalEvent::ClientDescription,
            buf: offer.clone(),
        }))
        .await;
    assert_eq!(
        server.recv_raw().await,
        json!({
            "type": "clientSignal",
            "data": {"event": "client_signal_description", "buf": offer, "uuid": "C1"}
        })
    );

    server
        .send(&Request::ServerSendSignal(SignalEnvelope {
            server: "S1".to_string(),
            uuid: "C1".to_string(),
            event: SignalEvent::ServerMsg,
            buf: json!("welcome"),
        }))
        .await;
    match client.recv().await {
        RelayMessage::ServerSignal(signal) => {
            assert_eq!(signal.event, SignalEvent::ServerMsg);
            assert_eq!(signal.buf, json!("welcome"));
            assert_eq!(signal.uuid, "C1");
        }
        msg => panic!("unexpected {msg:?}"),
    }

    drop(client);
    assert_eq!(
        server.recv().await,
        RelayMessage::ClientUnregister(ClientLeft {
            uuid: "C1".to_string()
        })
    );
}

#[tokio::test]
async fn test_registration_errors() {
    let addr = start_relay().await;
    let mut server = Node::connect(addr).await;
    server.send(&server_reg("S1")).await;
    server.recv().await;

    let mut client = Node::connect(addr).await;
    client.send(&client_reg("nobody", "C1", PROTOCOL_VERSION)).await;
    match client.recv().await {
        RelayMessage::ErrMsg(msg) => assert!(msg.contains("Server[nobody]"), "{msg}"),
        msg => panic!("unexpected {msg:?}"),
    }

    client.send(&client_reg("S1", "C1", "0.0")).await;
    match client.recv().await {
        RelayMessage::ErrMsg(msg) => assert!(msg.contains("version"), "{msg}"),
        msg => panic!("unexpected {msg:?}"),
    }

    // a failed attempt leaves the connection free to register
    client.send(&client_reg("S1", "C1", PROTOCOL_VERSION)).await;
    assert_eq!(client.recv().await, RelayMessage::ClientReg(Ack { success: true }));

    let mut rival = Node::connect(addr).await;
    rival.send(&server_reg("S1")).await;
    assert!(matches!(rival.recv().await, RelayMessage::ErrMsg(_)));
}

#[tokio::test]
async fn test_client_identity_moves_to_new_connection() {
    let addr = start_relay().await;
    let mut server = Node::connect(addr).await;
    server.send(&server_reg("S1")).await;
    server.recv().await;

    let mut client = Node::connect(addr).await;
    client.send(&client_reg("S1", "C1", PROTOCOL_VERSION)).await;
    assert_eq!(client.recv().await, RelayMessage::ClientReg(Ack { success: true }));
    assert!(matches!(server.recv().await, RelayMessage::ClientRegistered(_)));

    let mut twin = Node::connect(addr).await;
    twin.send(&client_reg("S1", "C1", PROTOCOL_VERSION)).await;
    assert_eq!(twin.recv().await, RelayMessage::ClientReg(Ack { success: true }));
    assert_eq!(
        server.recv().await,
        RelayMessage::ClientUnregister(ClientLeft {
            uuid: "C1".to_string()
        })
    );
    assert!(matches!(server.recv().await, RelayMessage::ClientRegistered(_)));

    // the superseded connection leaving does not unregister the twin
    drop(client);
    tokio::time::sleep(Duration::from_millis(200)).await;
    server
        .send(&Request::ServerSendSignal(SignalEnvelope {
            server: "S1".to_string(),
            uuid: "C1".to_string(),
            event: SignalEvent::ServerMsg,
            buf: json!("still there"),
        }))
        .await;
    match twin.recv().await {
        RelayMessage::ServerSignal(signal) => assert_eq!(signal.buf, json!("still there")),
        msg => panic!("unexpected {msg:?}"),
    }
    assert!(tokio::time::timeout(Duration::from_millis(200), server.framed.next())
        .await
        .is_err());
}

#[tokio::test]
async fn test_server_leaving_drops_its_clients() {
    let addr = start_relay().await;
    let mut server = Node::connect(addr).await;
    server.send(&server_reg("S1")).await;
    server.recv().await;

    let mut client = Node::connect(addr).await;
    client.send(&client_reg("S1", "C1", PROTOCOL_VERSION)).await;
    client.recv().await;
    server.recv().await;

    drop(server);
    tokio::time::sleep(Duration::from_millis(200)).await;
    client
        .send(&Request::ClientSendSignal(SignalEnvelope {
            server: "S1".to_string(),
            uuid: "C1".to_string(),
            event: SignalEvent::ClientMsg,
            buf: json!("hello?"),
        }))
        .await;
    assert!(matches!(client.recv().await, RelayMessage::ErrMsg(_)));
}

#[tokio::test]
async fn test_invalid_request_is_answered() {
    let addr = start_relay().await;
    let mut node = Node::connect(addr).await;
    node.framed
        .send(Bytes::from_static(b"{\"type\":\"Bogus\"}"))
        .await
        .unwrap();
    assert!(matches!(node.recv().await, RelayMessage::ErrMsg(_)));
}

async fn next_event(events: &flume::Receiver<SessionEvent>) -> SessionEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv_async())
        .await
        .expect("session event")
        .unwrap()
}

#[tokio::test]
async fn test_signal_sessions_exchange_messages() {
    let addr = start_relay().await.to_string();
    let server_id = NodeId::new("S9").unwrap();
    let client_id = NodeId::new("C9").unwrap();
    let interval = Duration::from_millis(50);

    let (server, server_events) = SignalSession::connect("server", &addr, interval);
    assert!(matches!(next_event(&server_events).await, SessionEvent::Connected));
    assert!(server.server_register(&server_id));
    assert!(matches!(
        next_event(&server_events).await,
        SessionEvent::Message(RelayMessage::ServerReg(Ack { success: true }))
    ));

    let (client, client_events) = SignalSession::connect("client", &addr, interval);
    assert!(matches!(next_event(&client_events).await, SessionEvent::Connected));
    assert!(client.client_register(&server_id, &client_id));
    assert!(matches!(
        next_event(&client_events).await,
        SessionEvent::Message(RelayMessage::ClientReg(Ack { success: true }))
    ));
    assert!(matches!(
        next_event(&server_events).await,
        SessionEvent::Message(RelayMessage::ClientRegistered(_))
    ));

    assert!(client.client_send_signal(
        &server_id,
        &client_id,
        SignalEvent::ClientMsg,
        json!("hi")
    ));
    match next_event(&server_events).await {
        SessionEvent::Message(RelayMessage::ClientSignal(signal)) => {
            assert_eq!(signal.event, SignalEvent::ClientMsg);
            assert_eq!(signal.buf, json!("hi"));
            assert_eq!(signal.uuid, "C9");
        }
        event => panic!("unexpected {event:?}"),
    }

    server.server_send_msg(&server_id, "C9", "welcome");
    match next_event(&client_events).await {
        SessionEvent::Message(RelayMessage::ServerSignal(signal)) => {
            assert_eq!(signal.event, SignalEvent::ServerMsg);
            assert_eq!(signal.buf, json!("welcome"));
        }
        event => panic!("unexpected {event:?}"),
    }

    client.close();
    assert!(!client.is_connected());
    assert!(matches!(
        next_event(&server_events).await,
        SessionEvent::Message(RelayMessage::ClientUnregister(_))
    ));
}
