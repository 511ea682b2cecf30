use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_shutdown::ShutdownManager;
use ipaclinker::config::Timings;
use ipaclinker::mapping::{ClientOptions, MappingClient, MappingServer, ServerOptions};
use ipaclinker::signal::server::SignalServer;
use ipaclinker::signal::{SessionEvent, SignalSession};
use ipaclinker_core::peer::CandidateFilter;
use ipaclinker_core::protocol::node_id::NodeId;
use ipaclinker_core::protocol::{Ack, RelayMessage};
use ipaclinker_core::transport::memory::MemoryNetwork;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

fn timings() -> Timings {
    Timings {
        connect_poll_interval_ms: 50,
        connect_poll_attempts: 20,
        restart_delay_ms: 200,
        liveness_interval_ms: 50,
        reconnect_interval_ms: 50,
    }
}

async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

async fn start_relay() -> (SocketAddr, ShutdownManager<()>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let server = SignalServer::bind("127.0.0.1:0").await.unwrap();
    let addr = server.local_addr().unwrap();
    let shutdown_manager = server.shutdown_manager();
    tokio::spawn(server.run());
    (addr, shutdown_manager)
}

/// Echoes everything back, per connection.
async fn start_echo() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let (mut stream, _) = listener.accept().await.unwrap();
            tokio::spawn(async move {
                let (mut r, mut w) = stream.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
        }
    });
    port
}

struct Tunnel {
    local_port: u16,
    server_id: NodeId,
    client_id: NodeId,
    client: ShutdownManager<()>,
    server: ShutdownManager<()>,
}

async fn start_tunnel(
    network: &MemoryNetwork,
    relay: SocketAddr,
    backend_port: u16,
    proxy_protocol: bool,
) -> Tunnel {
    let server_id = NodeId::random();
    let server = MappingServer::new(
        ServerOptions {
            name: "test-server".to_string(),
            uuid: server_id.clone(),
            port: backend_port,
            msg: "hello from test".to_string(),
            proxy_protocol,
            signal_server: relay.to_string(),
            filter: CandidateFilter::default(),
            timings: timings(),
        },
        Arc::new(network.clone()),
    );
    let server_sm = server.shutdown_manager();
    tokio::spawn(server.run());
    // the client must not register before the server did
    tokio::time::sleep(Duration::from_millis(200)).await;

    let local_port = free_port().await;
    let client_id = NodeId::random();
    let client = MappingClient::new(
        ClientOptions {
            name: "test-client".to_string(),
            server: server_id.clone(),
            uuid: client_id.clone(),
            port: local_port,
            signal_server: relay.to_string(),
            filter: CandidateFilter::default(),
            timings: timings(),
        },
        Arc::new(network.clone()),
    );
    let client_sm = client.shutdown_manager();
    tokio::spawn(client.run());
    Tunnel {
        local_port,
        server_id,
        client_id,
        client: client_sm,
        server: server_sm,
    }
}

/// Connects through the tunnel, retrying until the peer accepts channels.
async fn open(port: u16) -> TcpStream {
    for _ in 0..100 {
        if let Ok(mut stream) = TcpStream::connect(("127.0.0.1", port)).await {
            if stream.write_all(b"ping").await.is_ok() {
                let mut buf = [0u8; 4];
                let rs =
                    tokio::time::timeout(Duration::from_millis(500), stream.read_exact(&mut buf))
                        .await;
                if matches!(rs, Ok(Ok(_))) && &buf == b"ping" {
                    return stream;
                }
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("tunnel on port {port} never came up");
}

async fn next_event(events: &flume::Receiver<SessionEvent>) -> SessionEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv_async())
        .await
        .expect("session event")
        .unwrap()
}

async fn echo_once(stream: &mut TcpStream, payload: &[u8]) {
    stream.write_all(payload).await.unwrap();
    let mut buf = vec![0u8; payload.len()];
    tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(buf, payload);
}

#[tokio::test]
async fn test_echo_over_concurrent_channels() {
    let network = MemoryNetwork::new();
    let (relay, _relay_sm) = start_relay().await;
    let echo = start_echo().await;
    let tunnel = start_tunnel(&network, relay, echo, false).await;

    let first = open(tunnel.local_port).await;
    let second = open(tunnel.local_port).await;
    let mut handles = Vec::new();
    for (i, mut stream) in [first, second].into_iter().enumerate() {
        handles.push(tokio::spawn(async move {
            let payload: Vec<u8> = (0..64 * 1024).map(|n| (n + i) as u8).collect();
            let (mut r, mut w) = stream.split();
            let send = async {
                w.write_all(&payload).await.unwrap();
            };
            let mut echoed = vec![0u8; payload.len()];
            let recv = async {
                r.read_exact(&mut echoed).await.unwrap();
            };
            tokio::join!(send, recv);
            assert_eq!(echoed, payload);
        }));
    }
    for handle in handles {
        tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .unwrap()
            .unwrap();
    }

    _ = tunnel.client.trigger_shutdown(());
    _ = tunnel.server.trigger_shutdown(());
}

#[tokio::test]
async fn test_proxy_preamble_precedes_data() {
    let network = MemoryNetwork::new();
    let (relay, _relay_sm) = start_relay().await;
    let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend_port = backend.local_addr().unwrap().port();
    let tunnel = start_tunnel(&network, relay, backend_port, true).await;

    let (line_tx, mut line_rx) = tokio::sync::mpsc::unbounded_channel();
    tokio::spawn(async move {
        loop {
            let (stream, _) = backend.accept().await.unwrap();
            let line_tx = line_tx.clone();
            tokio::spawn(async move {
                let (r, mut w) = stream.into_split();
                let mut reader = BufReader::new(r);
                let mut line = String::new();
                reader.read_line(&mut line).await.unwrap();
                let _ = line_tx.send(line);
                let _ = tokio::io::copy(&mut reader, &mut w).await;
            });
        }
    });

    let _stream = open(tunnel.local_port).await;
    let line = tokio::time::timeout(Duration::from_secs(5), line_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(line, "PROXY TCP4 127.0.0.1 127.0.0.1 1024 1024\r\n");

    _ = tunnel.client.trigger_shutdown(());
    _ = tunnel.server.trigger_shutdown(());
}

#[tokio::test]
async fn test_client_recovers_after_peer_loss() {
    let network = MemoryNetwork::new();
    let (relay, _relay_sm) = start_relay().await;
    let echo = start_echo().await;
    let tunnel = start_tunnel(&network, relay, echo, false).await;

    let mut stream = open(tunnel.local_port).await;
    network.sever();
    let mut buf = [0u8; 1];
    let rs = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
        .await
        .unwrap();
    // the local socket ends with the peer
    assert!(matches!(rs, Ok(0) | Err(_)));

    let _stream = open(tunnel.local_port).await;

    _ = tunnel.client.trigger_shutdown(());
    _ = tunnel.server.trigger_shutdown(());
}

#[tokio::test]
async fn test_client_bind_failure_is_fatal() {
    let network = MemoryNetwork::new();
    let (relay, _relay_sm) = start_relay().await;
    let echo = start_echo().await;
    let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = taken.local_addr().unwrap().port();

    let server_id = NodeId::random();
    let server = MappingServer::new(
        ServerOptions {
            name: "test-server".to_string(),
            uuid: server_id.clone(),
            port: echo,
            msg: String::new(),
            proxy_protocol: false,
            signal_server: relay.to_string(),
            filter: CandidateFilter::default(),
            timings: timings(),
        },
        Arc::new(network.clone()),
    );
    let server_sm = server.shutdown_manager();
    tokio::spawn(server.run());
    tokio::time::sleep(Duration::from_millis(200)).await;

    let client = MappingClient::new(
        ClientOptions {
            name: "test-client".to_string(),
            server: server_id,
            uuid: NodeId::random(),
            port,
            signal_server: relay.to_string(),
            filter: CandidateFilter::default(),
            timings: timings(),
        },
        Arc::new(network.clone()),
    );
    let rs = tokio::time::timeout(Duration::from_secs(5), client.run())
        .await
        .unwrap();
    assert!(matches!(rs, Err(ipaclinker::error::Error::Bind { .. })));
    _ = server_sm.trigger_shutdown(());
}

#[tokio::test]
async fn test_closing_one_channel_spares_its_siblings() {
    let network = MemoryNetwork::new();
    let (relay, _relay_sm) = start_relay().await;
    let echo = start_echo().await;
    let tunnel = start_tunnel(&network, relay, echo, false).await;

    let first = open(tunnel.local_port).await;
    let mut second = open(tunnel.local_port).await;
    drop(first);
    tokio::time::sleep(Duration::from_millis(300)).await;

    echo_once(&mut second, b"still here").await;
    let mut third = open(tunnel.local_port).await;
    echo_once(&mut third, b"and here").await;
    echo_once(&mut second, b"twice").await;

    _ = tunnel.client.trigger_shutdown(());
    _ = tunnel.server.trigger_shutdown(());
}

#[tokio::test]
async fn test_connected_peer_outlives_client_unregister() {
    let network = MemoryNetwork::new();
    let (relay, _relay_sm) = start_relay().await;
    let echo = start_echo().await;
    let tunnel = start_tunnel(&network, relay, echo, false).await;
    let mut stream = open(tunnel.local_port).await;

    // a second registration of the same identity takes it from the mapping
    // client, so the server sees that client leave signaling
    let (other, other_events) =
        SignalSession::connect("other", &relay.to_string(), Duration::from_millis(50));
    assert!(matches!(next_event(&other_events).await, SessionEvent::Connected));
    assert!(other.client_register(&tunnel.server_id, &tunnel.client_id));
    assert!(matches!(
        next_event(&other_events).await,
        SessionEvent::Message(RelayMessage::ClientReg(Ack { success: true }))
    ));
    tokio::time::sleep(Duration::from_millis(300)).await;

    echo_once(&mut stream, b"kept").await;
    let mut fresh = open(tunnel.local_port).await;
    echo_once(&mut fresh, b"new channel").await;

    other.close();
    _ = tunnel.client.trigger_shutdown(());
    _ = tunnel.server.trigger_shutdown(());
}

#[tokio::test]
async fn test_connections_rejected_until_peer_connects() {
    let network = MemoryNetwork::new();
    let (relay, _relay_sm) = start_relay().await;
    let relay = relay.to_string();

    // a registered server that never answers the offer
    let server_id = NodeId::random();
    let (server, server_events) =
        SignalSession::connect("silent", &relay, Duration::from_millis(50));
    assert!(matches!(next_event(&server_events).await, SessionEvent::Connected));
    assert!(server.server_register(&server_id));
    assert!(matches!(
        next_event(&server_events).await,
        SessionEvent::Message(RelayMessage::ServerReg(Ack { success: true }))
    ));

    let local_port = free_port().await;
    let client = MappingClient::new(
        ClientOptions {
            name: "test-client".to_string(),
            server: server_id,
            uuid: NodeId::random(),
            port: local_port,
            signal_server: relay,
            filter: CandidateFilter::default(),
            timings: timings(),
        },
        Arc::new(network.clone()),
    );
    let client_sm = client.shutdown_manager();
    tokio::spawn(client.run());

    let mut stream = None;
    for _ in 0..50 {
        if let Ok(s) = TcpStream::connect(("127.0.0.1", local_port)).await {
            stream = Some(s);
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let mut stream = stream.expect("client listener never came up");
    let _ = stream.write_all(b"ping").await;
    let mut buf = [0u8; 4];
    let rs = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
        .await
        .unwrap();
    // accepted, then dropped without a channel
    assert!(matches!(rs, Ok(0) | Err(_)));

    server.close();
    _ = client_sm.trigger_shutdown(());
}
