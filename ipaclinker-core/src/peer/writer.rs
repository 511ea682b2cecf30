use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::Notify;
use tokio::task::AbortHandle;
use tokio::time::MissedTickBehavior;

use crate::peer::PeerEvent;
use crate::transport::DataChannel;

/// Outstanding bytes on a channel above which the writer stops transmitting.
pub const BUFFER_THRESHOLD: usize = 10 * 1024;
/// Fallback flush trigger, in case a low-watermark notification is missed.
const FLUSH_TICK: Duration = Duration::from_millis(50);

/// Per-channel FIFO plus the task draining it into the transport.
///
/// Pushing never blocks. The queue is drained while the channel's buffered
/// amount stays at or below [`BUFFER_THRESHOLD`]; past it the task sleeps
/// until the transport reports a low buffer or the coarse tick fires.
pub(crate) struct ChannelWriter {
    queue: UnboundedSender<Bytes>,
    receiver: Option<UnboundedReceiver<Bytes>>,
    wake: Arc<Notify>,
    task: Option<AbortHandle>,
}

impl ChannelWriter {
    pub(crate) fn new() -> Self {
        let (queue, receiver) = unbounded_channel();
        Self {
            queue,
            receiver: Some(receiver),
            wake: Arc::new(Notify::new()),
            task: None,
        }
    }

    /// Returns false once the writer has given up on the channel.
    pub(crate) fn push(&self, data: Bytes) -> bool {
        self.queue.send(data).is_ok()
    }

    pub(crate) fn is_started(&self) -> bool {
        self.task.is_some()
    }

    /// Spawns the drain task. Calling it again is a no-op.
    pub(crate) fn start(&mut self, dc: Arc<dyn DataChannel>, events: flume::Sender<PeerEvent>) {
        let Some(receiver) = self.receiver.take() else {
            return;
        };
        let handle = tokio::spawn(drain(dc, receiver, self.wake.clone(), events));
        self.task = Some(handle.abort_handle());
    }

    pub(crate) fn wake(&self) {
        self.wake.notify_one();
    }
}

impl Drop for ChannelWriter {
    fn drop(&mut self) {
        // queued bytes are discarded with the task
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn drain(
    dc: Arc<dyn DataChannel>,
    mut receiver: UnboundedReceiver<Bytes>,
    wake: Arc<Notify>,
    events: flume::Sender<PeerEvent>,
) {
    dc.set_buffered_amount_low_threshold(BUFFER_THRESHOLD).await;
    let mut tick = tokio::time::interval(FLUSH_TICK);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut held: Option<Bytes> = None;
    loop {
        let data = match held.take() {
            Some(data) => data,
            None => match receiver.recv().await {
                Some(data) => data,
                None => break,
            },
        };
        if dc.buffered_amount().await > BUFFER_THRESHOLD {
            held = Some(data);
            tokio::select! {
                _ = wake.notified() => {}
                _ = tick.tick() => {}
            }
            continue;
        }
        if let Err(e) = dc.send(data).await {
            log::debug!("channel {} send failed e={e:?}", dc.label());
            let _ = events.send(PeerEvent::ChannelError(dc.label().to_string(), e.to_string()));
            break;
        }
    }
}
