//! Byte pump between one local TCP socket and one peer channel.

use std::io;
use std::net::SocketAddr;

use bytes::{Bytes, BytesMut};
use ipaclinker_core::peer::PeerSession;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

const READ_CHUNK: usize = 16 * 1024;

/// Socket side of a bridge, held in the owner's channel table.
///
/// Dropping it ends the local socket once the bytes already handed to
/// [`Bridge::write`] are written.
pub(crate) struct Bridge {
    to_socket: UnboundedSender<Bytes>,
}

impl Bridge {
    pub(crate) fn write(&self, data: Bytes) {
        let _ = self.to_socket.send(data);
    }
}

/// Bridges an accepted socket. `done` runs once, when the pump stops.
pub(crate) fn spawn<F>(label: String, stream: TcpStream, peer: PeerSession, done: F) -> Bridge
where
    F: FnOnce(io::Result<()>) + Send + 'static,
{
    let (to_socket, rx) = unbounded_channel();
    tokio::spawn(async move {
        done(pump(&label, stream, &peer, rx).await);
    });
    Bridge { to_socket }
}

/// Connects to `target` first, writing `preamble` before anything else.
/// Channel bytes arriving meanwhile are queued.
pub(crate) fn spawn_connect<F>(
    label: String,
    target: SocketAddr,
    preamble: Option<String>,
    peer: PeerSession,
    done: F,
) -> Bridge
where
    F: FnOnce(io::Result<()>) + Send + 'static,
{
    let (to_socket, rx) = unbounded_channel();
    tokio::spawn(async move {
        let rs = async {
            let mut stream = TcpStream::connect(target).await?;
            if let Some(preamble) = preamble {
                stream.write_all(preamble.as_bytes()).await?;
            }
            log::debug!("channel {label} connected to {target}");
            pump(&label, stream, &peer, rx).await
        }
        .await;
        done(rs);
    });
    Bridge { to_socket }
}

async fn pump(
    label: &str,
    stream: TcpStream,
    peer: &PeerSession,
    mut from_channel: UnboundedReceiver<Bytes>,
) -> io::Result<()> {
    let (mut reader, mut writer) = stream.into_split();
    let mut buf = BytesMut::with_capacity(READ_CHUNK);
    loop {
        tokio::select! {
            rs = reader.read_buf(&mut buf) => {
                if rs? == 0 {
                    return Ok(());
                }
                peer.send(label, buf.split().freeze())
                    .map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, e.to_string()))?;
                buf.reserve(READ_CHUNK);
            }
            data = from_channel.recv() => match data {
                Some(data) => writer.write_all(&data).await?,
                None => {
                    // channel side is gone
                    writer.shutdown().await?;
                    return Ok(());
                }
            }
        }
    }
}
