//! Per-channel state: bounded send queues, outbound fragmentation,
//! inbound reassembly, and the priority scheduler.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::error::{ConnError, ConnResult};
use crate::protocol::PacketMsg;

/// Default scheduling priority.
pub const DEFAULT_PRIORITY: u32 = 1;

/// Default capacity of a channel's send queue, in whole messages.
pub const DEFAULT_SEND_QUEUE_CAPACITY: usize = 1;

/// Default initial size of a channel's reassembly buffer.
pub const DEFAULT_RECV_BUFFER_CAPACITY: usize = 4096;

/// Default bound on a reassembled message (21 MB).
pub const DEFAULT_RECV_MESSAGE_CAPACITY: usize = 22_020_096;

/// Multiplier applied to `recently_sent` on every stats tick, so idle
/// channels recover scheduling priority over a few seconds.
pub(crate) const SENT_DECAY: f64 = 0.8;

/// Static description of one logical channel within a connection.
#[derive(Debug, Clone)]
pub struct ChannelDescriptor {
    /// Channel id, unique per connection.
    pub id: u8,
    /// Scheduling weight; higher drains faster under contention. Minimum 1.
    pub priority: u32,
    /// Send queue capacity in whole messages.
    pub send_queue_capacity: usize,
    /// Maximum size of a reassembled inbound message.
    pub recv_message_capacity: usize,
    /// Initial size of the reassembly buffer.
    pub recv_buffer_capacity: usize,
}

impl ChannelDescriptor {
    /// Create a descriptor with default queue and buffer sizes.
    pub fn new(id: u8) -> Self {
        Self {
            id,
            priority: DEFAULT_PRIORITY,
            send_queue_capacity: DEFAULT_SEND_QUEUE_CAPACITY,
            recv_message_capacity: DEFAULT_RECV_MESSAGE_CAPACITY,
            recv_buffer_capacity: DEFAULT_RECV_BUFFER_CAPACITY,
        }
    }

    /// Set the scheduling priority.
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the send queue capacity.
    pub fn with_send_queue_capacity(mut self, capacity: usize) -> Self {
        self.send_queue_capacity = capacity;
        self
    }

    /// Set the reassembled-message size bound.
    pub fn with_recv_message_capacity(mut self, capacity: usize) -> Self {
        self.recv_message_capacity = capacity;
        self
    }

    /// Set the initial reassembly buffer size.
    pub fn with_recv_buffer_capacity(mut self, capacity: usize) -> Self {
        self.recv_buffer_capacity = capacity;
        self
    }

    /// Clamp zero-valued fields up to their minimums.
    pub(crate) fn normalized(mut self) -> Self {
        if self.priority == 0 {
            self.priority = DEFAULT_PRIORITY;
        }
        if self.send_queue_capacity == 0 {
            self.send_queue_capacity = DEFAULT_SEND_QUEUE_CAPACITY;
        }
        if self.recv_message_capacity == 0 {
            self.recv_message_capacity = DEFAULT_RECV_MESSAGE_CAPACITY;
        }
        self
    }
}

/// Point-in-time view of one channel, for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelStatus {
    /// Channel id.
    pub id: u8,
    /// Scheduling priority.
    pub priority: u32,
    /// Send queue capacity in messages.
    pub send_queue_capacity: usize,
    /// Messages currently queued for sending.
    pub send_queue_size: usize,
    /// Decaying count of bytes recently emitted on this channel.
    pub recently_sent: i64,
}

/// Producer half of a channel, held by the connection for `send`/`try_send`
/// and status queries.
#[derive(Debug, Clone)]
pub(crate) struct ChannelHandle {
    pub(crate) desc: ChannelDescriptor,
    pub(crate) queue_tx: mpsc::Sender<Bytes>,
    pub(crate) recently_sent: Arc<AtomicI64>,
}

impl ChannelHandle {
    /// Whether the send queue has room for another message.
    pub(crate) fn has_capacity(&self) -> bool {
        self.queue_tx.capacity() > 0
    }

    pub(crate) fn status(&self) -> ChannelStatus {
        ChannelStatus {
            id: self.desc.id,
            priority: self.desc.priority,
            send_queue_capacity: self.desc.send_queue_capacity,
            send_queue_size: self.queue_tx.max_capacity() - self.queue_tx.capacity(),
            recently_sent: self.recently_sent.load(Ordering::Relaxed),
        }
    }
}

/// Consumer half of a channel, owned by the send loop. Pops whole messages
/// from the queue and fragments them into wire packets.
#[derive(Debug)]
pub(crate) struct Channel {
    desc: ChannelDescriptor,
    queue_rx: mpsc::Receiver<Bytes>,
    /// Unsent remainder of the message currently being fragmented.
    sending: Option<Bytes>,
    recently_sent: Arc<AtomicI64>,
}

/// Create the two halves of a channel from its descriptor.
pub(crate) fn channel_pair(desc: ChannelDescriptor) -> (ChannelHandle, Channel) {
    let desc = desc.normalized();
    let (queue_tx, queue_rx) = mpsc::channel(desc.send_queue_capacity);
    let recently_sent = Arc::new(AtomicI64::new(0));

    let handle = ChannelHandle {
        desc: desc.clone(),
        queue_tx,
        recently_sent: recently_sent.clone(),
    };
    let channel = Channel {
        desc,
        queue_rx,
        sending: None,
        recently_sent,
    };
    (handle, channel)
}

impl Channel {
    pub(crate) fn id(&self) -> u8 {
        self.desc.id
    }

    /// True if this channel has bytes to put on the wire: either a message
    /// mid-fragmentation or queued messages waiting.
    pub(crate) fn is_sendable(&self) -> bool {
        self.sending.is_some() || !self.queue_rx.is_empty()
    }

    /// Produce the next packet for this channel, up to `max_payload` bytes.
    /// Pops a fresh message from the queue when nothing is in flight. The
    /// packet that exhausts the current message carries `eof`.
    pub(crate) fn next_packet(&mut self, max_payload: usize) -> Option<PacketMsg> {
        if self.sending.is_none() {
            self.sending = Some(self.queue_rx.try_recv().ok()?);
        }

        let mut remaining = self.sending.take()?;
        let chunk = remaining.split_to(remaining.len().min(max_payload));
        let eof = remaining.is_empty();
        if !eof {
            self.sending = Some(remaining);
        }

        Some(PacketMsg {
            channel_id: i32::from(self.desc.id),
            eof,
            data: chunk.to_vec(),
        })
    }

    /// Account wire bytes emitted on this channel for the scheduler.
    pub(crate) fn note_sent(&self, wire_bytes: usize) {
        self.recently_sent
            .fetch_add(wire_bytes as i64, Ordering::Relaxed);
    }

    /// Apply one tick of exponential decay to the recently-sent counter.
    pub(crate) fn decay_recently_sent(&self) {
        let current = self.recently_sent.load(Ordering::Relaxed);
        self.recently_sent
            .store((current as f64 * SENT_DECAY) as i64, Ordering::Relaxed);
    }

    /// Scheduling weight: recently-sent bytes per unit of priority.
    fn ratio(&self) -> f64 {
        self.recently_sent.load(Ordering::Relaxed) as f64 / f64::from(self.desc.priority)
    }
}

/// Pick the sendable channel with the lowest recently-sent/priority ratio.
/// `channels` is ordered by ascending id, so ties resolve to the lowest id.
pub(crate) fn least_sent_channel(channels: &[Channel]) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (idx, channel) in channels.iter().enumerate() {
        if !channel.is_sendable() {
            continue;
        }
        let ratio = channel.ratio();
        match best {
            Some((_, best_ratio)) if ratio >= best_ratio => {}
            _ => best = Some((idx, ratio)),
        }
    }
    best.map(|(idx, _)| idx)
}

/// Inbound reassembly state for one channel, owned by the receive loop.
#[derive(Debug)]
pub(crate) struct Reassembly {
    desc: ChannelDescriptor,
    buf: BytesMut,
}

impl Reassembly {
    pub(crate) fn new(desc: ChannelDescriptor) -> Self {
        let buf = BytesMut::with_capacity(desc.recv_buffer_capacity);
        Self {
            desc: desc.normalized(),
            buf,
        }
    }

    /// Append one fragment. Returns the complete message when the fragment
    /// carries `eof`, or an error when the message would exceed the
    /// channel's reassembly bound.
    pub(crate) fn absorb(&mut self, packet: &PacketMsg) -> ConnResult<Option<Bytes>> {
        let size = self.buf.len() + packet.data.len();
        if size > self.desc.recv_message_capacity {
            return Err(ConnError::MessageTooLong {
                size,
                max: self.desc.recv_message_capacity,
            });
        }

        self.buf.extend_from_slice(&packet.data);
        if packet.eof {
            Ok(Some(self.buf.split().freeze()))
        } else {
            Ok(None)
        }
    }
}
