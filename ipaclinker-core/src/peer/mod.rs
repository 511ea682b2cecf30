//! Peer session: one transport multiplexed into labelled channels.
//!
//! The session owns the channel table and a send queue per channel. A
//! background driver turns [`TransportEvent`]s into [`PeerEvent`]s, filters
//! locally gathered candidates and keeps the table consistent with the
//! transport's view, so the owner only sees two session-level transitions:
//! [`PeerEvent::Connected`] and [`PeerEvent::Closed`].
//!
//! ```rust,no_run
//! use bytes::Bytes;
//! use ipaclinker_core::peer::{CandidateFilter, PeerEvent, PeerSession, DEFAULT_CHANNEL};
//! use ipaclinker_core::transport::memory::MemoryNetwork;
//! use ipaclinker_core::transport::Role;
//!
//! # #[tokio::main]
//! # async fn main() -> ipaclinker_core::error::Result<()> {
//! let network = MemoryNetwork::new();
//! let (session, events) = PeerSession::new(&network, Role::Initiator, CandidateFilter::default()).await?;
//! session.create_channel(DEFAULT_CHANNEL).await?;
//! while let Ok(event) = events.recv_async().await {
//!     match event {
//!         PeerEvent::Signal(signal) => { /* hand to the signaling path */ }
//!         PeerEvent::ChannelOpened(label) => session.send(&label, Bytes::from_static(b"hello"))?,
//!         PeerEvent::Closed => break,
//!         _ => {}
//!     }
//! }
//! # Ok(())
//! # }
//! ```

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_shutdown::ShutdownManager;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::error::{Error, Result};
use crate::protocol::{IceCandidate, SessionDescription};
use crate::transport::{
    ConnectionState, DataChannel, PeerTransport, Role, TransportEvent, TransportFactory,
};

pub mod filter;
mod writer;

pub use filter::CandidateFilter;
pub use writer::BUFFER_THRESHOLD;

/// Label of the control channel. It never carries tunnel payload.
pub const DEFAULT_CHANNEL: &str = "DataChannel";
/// Time given to in-flight close notifications after the transport is closed.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Negotiation data produced locally, to be carried to the remote peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerSignal {
    Description(SessionDescription),
    Candidate(IceCandidate),
}

#[derive(Debug, Clone)]
pub enum PeerEvent {
    Connected,
    /// Terminal. Every channel has been closed by the time this is seen.
    Closed,
    ChannelOpened(String),
    ChannelClosed(String),
    Data(String, Bytes),
    Signal(PeerSignal),
    ChannelError(String, String),
}

struct ChannelState {
    opened: bool,
    // None until the transport hands the channel back
    dc: Option<Arc<dyn DataChannel>>,
    writer: writer::ChannelWriter,
}

impl ChannelState {
    fn new(dc: Option<Arc<dyn DataChannel>>) -> Self {
        Self {
            opened: false,
            dc,
            writer: writer::ChannelWriter::new(),
        }
    }

    fn open(&mut self, events: &flume::Sender<PeerEvent>) {
        self.opened = true;
        if let Some(dc) = &self.dc {
            if !self.writer.is_started() {
                self.writer.start(dc.clone(), events.clone());
            }
        }
    }
}

#[derive(Clone)]
pub struct PeerSession {
    inner: Arc<Inner>,
}

struct Inner {
    transport: Arc<dyn PeerTransport>,
    channels: DashMap<String, ChannelState>,
    connected: AtomicBool,
    closed: AtomicBool,
    closing: AtomicBool,
    filter: CandidateFilter,
    events: flume::Sender<PeerEvent>,
    shutdown_manager: ShutdownManager<()>,
}

impl PeerSession {
    pub async fn new(
        factory: &dyn TransportFactory,
        role: Role,
        filter: CandidateFilter,
    ) -> io::Result<(PeerSession, flume::Receiver<PeerEvent>)> {
        let (transport, transport_events) = factory.create(role).await?;
        let (events, receiver) = flume::unbounded();
        let inner = Arc::new(Inner {
            transport,
            channels: DashMap::new(),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            filter,
            events,
            shutdown_manager: ShutdownManager::new(),
        });
        let fut = inner
            .shutdown_manager
            .wrap_cancel(drive(Arc::downgrade(&inner), transport_events));
        tokio::spawn(async move {
            if fut.await.is_err() {
                log::debug!("recv shutdown signal: peer session driver stopped");
            }
        });
        Ok((PeerSession { inner }, receiver))
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire) || self.inner.closing.load(Ordering::Acquire)
    }

    pub fn channel_labels(&self) -> Vec<String> {
        self.inner.channels.iter().map(|c| c.key().clone()).collect()
    }

    /// Requests a new channel. [`PeerEvent::ChannelOpened`] follows once it is
    /// usable; on failure the table is left as it was.
    pub async fn create_channel(&self, label: &str) -> Result<()> {
        if self.is_closed() {
            return Err(Error::PeerClosed);
        }
        match self.inner.channels.entry(label.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("channel {label} exists"),
                )));
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(ChannelState::new(None));
            }
        }
        let dc = match self.inner.transport.create_channel(label).await {
            Ok(dc) => dc,
            Err(e) => {
                self.inner.channels.remove(label);
                log::warn!("create channel {label} failed e={e:?}");
                self.inner.emit(PeerEvent::ChannelError(label.to_string(), e.to_string()));
                return Err(e.into());
            }
        };
        match self.inner.channels.get_mut(label) {
            Some(mut state) => {
                state.dc = Some(dc);
                if state.opened {
                    state.open(&self.inner.events);
                }
            }
            None => {
                // closed while the transport was still creating it
                tokio::spawn(async move {
                    let _ = dc.close().await;
                });
            }
        }
        Ok(())
    }

    /// Closes one channel. Queued outbound bytes are discarded. Returns false
    /// if the channel was not in the table.
    pub fn close_channel(&self, label: &str) -> bool {
        self.inner.close_channel(label)
    }

    /// Queues `data` on the channel. Never waits for the transport.
    pub fn send(&self, label: &str, data: Bytes) -> Result<()> {
        if self.is_closed() {
            return Err(Error::PeerClosed);
        }
        let state = self
            .inner
            .channels
            .get(label)
            .ok_or_else(|| Error::ChannelNotFound(label.to_string()))?;
        if !state.writer.push(data) {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                format!("channel {label} writer stopped"),
            )));
        }
        Ok(())
    }

    /// Applies negotiation data received from the remote peer. Remote
    /// candidates are never filtered.
    pub async fn apply_signal(&self, signal: PeerSignal) -> Result<()> {
        if self.is_closed() {
            return Err(Error::PeerClosed);
        }
        match signal {
            PeerSignal::Description(desc) => self.inner.transport.set_remote_description(desc).await?,
            PeerSignal::Candidate(candidate) => {
                self.inner.transport.add_remote_candidate(candidate).await?
            }
        }
        Ok(())
    }

    /// Closes every channel, then the transport, then waits a short grace
    /// period for the close notifications to settle.
    pub async fn close(&self) {
        if self.inner.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        for label in self.channel_labels() {
            self.inner.close_channel(&label);
        }
        if let Err(e) = self.inner.transport.close().await {
            log::debug!("transport close e={e:?}");
        }
        tokio::time::sleep(CLOSE_GRACE).await;
        self.inner.connected.store(false, Ordering::Release);
        if !self.inner.closed.swap(true, Ordering::AcqRel) {
            self.inner.emit(PeerEvent::Closed);
        }
        _ = self.inner.shutdown_manager.trigger_shutdown(());
    }
}

impl Inner {
    fn emit(&self, event: PeerEvent) {
        let _ = self.events.send(event);
    }

    fn close_channel(&self, label: &str) -> bool {
        let Some((_, state)) = self.channels.remove(label) else {
            return false;
        };
        if let Some(dc) = state.dc {
            tokio::spawn(async move {
                if let Err(e) = dc.close().await {
                    log::debug!("channel {} close e={e:?}", dc.label());
                }
            });
        }
        self.emit(PeerEvent::ChannelClosed(label.to_string()));
        true
    }

    fn on_closed(&self) {
        self.connected.store(false, Ordering::Release);
        let labels: Vec<String> = self.channels.iter().map(|c| c.key().clone()).collect();
        for label in labels {
            self.close_channel(&label);
        }
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.emit(PeerEvent::Closed);
        }
    }

    fn handle(&self, event: TransportEvent) {
        match event {
            TransportEvent::LocalDescription(desc) => {
                self.emit(PeerEvent::Signal(PeerSignal::Description(desc)));
            }
            TransportEvent::LocalCandidate(candidate) => {
                if let Some(pattern) = self.filter.excluded_by(&candidate) {
                    log::debug!(
                        "drop local candidate {:?}, matched {}",
                        candidate.address(),
                        pattern.as_str()
                    );
                } else {
                    self.emit(PeerEvent::Signal(PeerSignal::Candidate(candidate)));
                }
            }
            TransportEvent::StateChange(state) => match state {
                ConnectionState::Connected => {
                    if !self.connected.swap(true, Ordering::AcqRel) {
                        self.emit(PeerEvent::Connected);
                    }
                }
                ConnectionState::Closed => self.on_closed(),
                state => log::debug!("peer state {state:?}"),
            },
            TransportEvent::IncomingChannel(dc) => {
                let label = dc.label().to_string();
                if self.closed.load(Ordering::Acquire) {
                    tokio::spawn(async move {
                        let _ = dc.close().await;
                    });
                    return;
                }
                if self
                    .channels
                    .insert(label.clone(), ChannelState::new(Some(dc)))
                    .is_some()
                {
                    log::warn!("remote reopened channel {label}");
                }
            }
            TransportEvent::ChannelOpen(label) => {
                let Some(mut state) = self.channels.get_mut(&label) else {
                    log::debug!("open event for unknown channel {label}");
                    return;
                };
                if state.opened {
                    return;
                }
                state.open(&self.events);
                drop(state);
                self.emit(PeerEvent::ChannelOpened(label));
            }
            TransportEvent::ChannelMessage(label, data) => {
                self.emit(PeerEvent::Data(label, data));
            }
            TransportEvent::BufferedAmountLow(label) => {
                if let Some(state) = self.channels.get(&label) {
                    state.writer.wake();
                }
            }
            TransportEvent::ChannelClosed(label) => {
                self.close_channel(&label);
            }
            TransportEvent::ChannelError(label, e) => {
                log::warn!("channel {label} error: {e}");
                self.emit(PeerEvent::ChannelError(label, e));
            }
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        _ = self.shutdown_manager.trigger_shutdown(());
        if self.closing.load(Ordering::Acquire) {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let transport = self.transport.clone();
            handle.spawn(async move {
                let _ = transport.close().await;
            });
        }
    }
}

async fn drive(inner: Weak<Inner>, mut transport_events: UnboundedReceiver<TransportEvent>) {
    while let Some(event) = transport_events.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.handle(event);
    }
}
