//! The multiplexed connection: lifecycle, send loop, receive loop, and the
//! single-fire error sink.
//!
//! A connection owns one full-duplex byte stream. The stream is split once
//! at start: the send loop is the only writer and the receive loop the only
//! reader, so neither half needs a lock. Application threads talk to the
//! send loop through per-channel bounded queues; the receive loop talks to
//! the send loop through a small event channel (pong requests, pong
//! arrivals) that is serviced ahead of data traffic.

use std::collections::BTreeMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use futures::{FutureExt, SinkExt, StreamExt};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::channel::{
    channel_pair, least_sent_channel, Channel, ChannelDescriptor, ChannelHandle, ChannelStatus,
    Reassembly,
};
use crate::config::ConnConfig;
use crate::error::{ConnError, ConnResult};
use crate::flow::{FlowMeter, TokenBucket};
use crate::liveness::Liveness;
use crate::protocol::{packet, Packet, PacketCodec, PacketMsg};

/// Data packets emitted per scheduling round before yielding back to the
/// select loop, so control traffic and timers interleave with a backlog.
const SEND_BATCH_SIZE: usize = 10;

/// Cadence of the recently-sent decay applied to every channel.
const STATS_TICK: Duration = Duration::from_secs(2);

/// Buffered events from the receive loop to the send loop.
const RECV_EVENT_BUFFER: usize = 16;

/// How long `stop` waits for a loop to exit before aborting its task.
const STOP_TIMEOUT: Duration = Duration::from_secs(2);

type StreamReader = Box<dyn AsyncRead + Send + Unpin>;
type StreamWriter = Box<dyn AsyncWrite + Send + Unpin>;
type ReceiveFn = dyn Fn(u8, Bytes) + Send + Sync;
type ErrorFn = dyn Fn(ConnError) + Send + Sync;

/// Lifecycle state of a connection. Transitions are monotonic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// Built but not yet started.
    Created = 0,
    /// Send and receive loops are running.
    Started = 1,
    /// Shutdown in progress.
    Stopping = 2,
    /// Fully stopped.
    Stopped = 3,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Created => write!(f, "created"),
            ConnectionState::Started => write!(f, "started"),
            ConnectionState::Stopping => write!(f, "stopping"),
            ConnectionState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Atomic cell holding the connection state.
struct StateCell(AtomicU8);

impl StateCell {
    fn new() -> Self {
        Self(AtomicU8::new(ConnectionState::Created as u8))
    }

    fn load(&self) -> ConnectionState {
        match self.0.load(Ordering::SeqCst) {
            0 => ConnectionState::Created,
            1 => ConnectionState::Started,
            2 => ConnectionState::Stopping,
            _ => ConnectionState::Stopped,
        }
    }

    fn store(&self, state: ConnectionState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }

    /// Compare-and-swap; returns true if this call performed the transition.
    fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

/// Shutdown mode broadcast to both loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopMode {
    /// Normal operation.
    Run,
    /// Send loop drains its queues and flushes before exiting.
    Drain,
    /// Both loops exit as soon as they observe the signal.
    Halt,
}

/// Events the receive loop forwards to the send loop.
#[derive(Debug, Clone, Copy)]
enum RecvEvent {
    /// The peer pinged us; answer with a pong ahead of data traffic.
    PingReceived,
    /// The peer ponged; disarm the pong deadline if one is armed.
    PongReceived,
}

/// Funnels every fatal error (including task panics) into a single
/// `on_error` invocation, then halts the connection. First caller wins.
struct ErrorSink {
    fired: AtomicBool,
    state: Arc<StateCell>,
    stop_tx: watch::Sender<StopMode>,
    on_error: Arc<ErrorFn>,
}

impl ErrorSink {
    fn fire(&self, err: ConnError) {
        if self.fired.swap(true, Ordering::SeqCst) {
            tracing::debug!(error = %err, "suppressing error after connection failure");
            return;
        }
        // A shutdown already in progress wins over a late error from a
        // closing stream.
        if matches!(
            self.state.load(),
            ConnectionState::Stopping | ConnectionState::Stopped
        ) {
            tracing::debug!(error = %err, "ignoring error during shutdown");
            let _ = self.stop_tx.send(StopMode::Halt);
            return;
        }
        // The state must read as stopped before the callback observes the
        // error.
        self.state.store(ConnectionState::Stopped);
        let _ = self.stop_tx.send(StopMode::Halt);
        tracing::warn!(error = %err, "connection failed");
        (self.on_error)(err);
    }
}

/// Point-in-time view of the connection, for monitoring.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStatus {
    /// Time since the connection was created.
    pub uptime: Duration,
    /// Total wire bytes written.
    pub bytes_sent: u64,
    /// Total wire bytes read.
    pub bytes_recv: u64,
    /// Average outbound byte rate since creation.
    pub send_rate: u64,
    /// Average inbound byte rate since creation.
    pub recv_rate: u64,
    /// Per-channel queue and scheduling counters, ascending by id.
    pub channels: Vec<ChannelStatus>,
}

/// Parts consumed exactly once when the connection starts.
struct Boot {
    reader: StreamReader,
    writer: StreamWriter,
    channels: Vec<Channel>,
    reassemblies: BTreeMap<u8, Reassembly>,
}

/// A multiplexed connection over a single full-duplex byte stream.
///
/// Carries independent logical channels of length-delimited messages with
/// priority-weighted fair scheduling, fragmentation, keepalive, and
/// flush-then-stop shutdown. Inbound messages are delivered through the
/// `on_receive` callback; every fatal error is delivered exactly once
/// through `on_error`, after which the connection is stopped.
pub struct Connection {
    config: ConnConfig,
    handles: BTreeMap<u8, ChannelHandle>,
    state: Arc<StateCell>,
    stop_tx: watch::Sender<StopMode>,
    send_notify: Arc<Notify>,
    on_receive: Arc<ReceiveFn>,
    error_sink: Arc<ErrorSink>,
    send_meter: Arc<FlowMeter>,
    recv_meter: Arc<FlowMeter>,
    boot: Mutex<Option<Boot>>,
    send_task: Mutex<Option<JoinHandle<()>>>,
    recv_task: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// Create a connection over `stream` carrying the given channels.
    ///
    /// `on_receive` is invoked from the receive loop for every complete
    /// message, in per-channel send order; it serializes frame decoding and
    /// must not block indefinitely. `on_error` is invoked at most once.
    /// Descriptors with duplicate ids are ignored beyond the first.
    pub fn new<S, R, E>(
        stream: S,
        descriptors: Vec<ChannelDescriptor>,
        on_receive: R,
        on_error: E,
        config: ConnConfig,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
        R: Fn(u8, Bytes) + Send + Sync + 'static,
        E: Fn(ConnError) + Send + Sync + 'static,
    {
        debug_assert!(
            config.pong_timeout < config.ping_interval,
            "pong timeout must be shorter than the ping interval"
        );

        let (read_half, write_half) = tokio::io::split(stream);
        let (stop_tx, _) = watch::channel(StopMode::Run);
        let state = Arc::new(StateCell::new());

        let mut handles = BTreeMap::new();
        let mut channels = Vec::new();
        let mut reassemblies = BTreeMap::new();
        for desc in descriptors {
            let desc = desc.normalized();
            if handles.contains_key(&desc.id) {
                tracing::warn!(channel = desc.id, "ignoring duplicate channel descriptor");
                continue;
            }
            let (handle, channel) = channel_pair(desc.clone());
            reassemblies.insert(desc.id, Reassembly::new(desc.clone()));
            handles.insert(desc.id, handle);
            channels.push(channel);
        }
        // Scheduler tie-break is lowest id first.
        channels.sort_by_key(Channel::id);

        let error_sink = Arc::new(ErrorSink {
            fired: AtomicBool::new(false),
            state: state.clone(),
            stop_tx: stop_tx.clone(),
            on_error: Arc::new(on_error),
        });

        Self {
            config,
            handles,
            state,
            stop_tx,
            send_notify: Arc::new(Notify::new()),
            on_receive: Arc::new(on_receive),
            error_sink,
            send_meter: Arc::new(FlowMeter::new()),
            recv_meter: Arc::new(FlowMeter::new()),
            boot: Mutex::new(Some(Boot {
                reader: Box::new(read_half),
                writer: Box::new(write_half),
                channels,
                reassemblies,
            })),
            send_task: Mutex::new(None),
            recv_task: Mutex::new(None),
        }
    }

    /// Spawn the send and receive loops and arm the keepalive timer.
    pub fn start(&self) -> ConnResult<()> {
        if !self
            .state
            .transition(ConnectionState::Created, ConnectionState::Started)
        {
            return Err(ConnError::AlreadyStarted);
        }
        let Some(boot) = lock(&self.boot).take() else {
            return Err(ConnError::AlreadyStarted);
        };

        tracing::info!(channels = boot.channels.len(), "starting connection");

        let (event_tx, event_rx) = mpsc::channel(RECV_EVENT_BUFFER);
        let max_packet_size = self.config.max_packet_size();

        let send_loop = SendLoop {
            writer: FramedWrite::new(boot.writer, PacketCodec::new(max_packet_size)),
            channels: boot.channels,
            config: self.config.clone(),
            liveness: Liveness::new(),
            bucket: TokenBucket::new(self.config.send_rate),
            meter: self.send_meter.clone(),
            notify: self.send_notify.clone(),
            flush_deadline: None,
            needs_flush: false,
        };
        let sink = self.error_sink.clone();
        let stop_rx = self.stop_tx.subscribe();
        *lock(&self.send_task) = Some(tokio::spawn(async move {
            match AssertUnwindSafe(send_loop.run(event_rx, stop_rx))
                .catch_unwind()
                .await
            {
                Ok(Ok(())) => tracing::debug!("send loop finished"),
                Ok(Err(err)) => sink.fire(err),
                Err(payload) => sink.fire(ConnError::Panic(panic_message(payload))),
            }
        }));

        let recv_loop = RecvLoop {
            channels: boot.reassemblies,
            bucket: TokenBucket::new(self.config.recv_rate),
            meter: self.recv_meter.clone(),
            on_receive: self.on_receive.clone(),
            event_tx,
            max_payload: self.config.max_packet_msg_payload_size,
        };
        let frames = FramedRead::new(boot.reader, PacketCodec::new(max_packet_size));
        let sink = self.error_sink.clone();
        let stop_rx = self.stop_tx.subscribe();
        *lock(&self.recv_task) = Some(tokio::spawn(async move {
            match AssertUnwindSafe(recv_loop.run(frames, stop_rx))
                .catch_unwind()
                .await
            {
                Ok(Ok(())) => tracing::debug!("receive loop finished"),
                Ok(Err(err)) => sink.fire(err),
                Err(payload) => sink.fire(ConnError::Panic(panic_message(payload))),
            }
        }));

        Ok(())
    }

    /// Queue `message` on a channel, waiting for queue space if necessary.
    ///
    /// Returns false if the channel is unknown or the connection is not
    /// running.
    pub async fn send(&self, channel_id: u8, message: impl Into<Bytes>) -> bool {
        if !self.is_running() {
            tracing::debug!(channel = channel_id, "send on a connection that is not running");
            return false;
        }
        let Some(handle) = self.handles.get(&channel_id) else {
            tracing::debug!(channel = channel_id, "send on unknown channel");
            return false;
        };
        match handle.queue_tx.send(message.into()).await {
            Ok(()) => {
                self.send_notify.notify_one();
                true
            }
            Err(_) => false,
        }
    }

    /// Queue `message` on a channel without waiting.
    ///
    /// Returns false if the channel is unknown, the connection is not
    /// running, or the queue is full.
    pub fn try_send(&self, channel_id: u8, message: impl Into<Bytes>) -> bool {
        if !self.is_running() {
            return false;
        }
        let Some(handle) = self.handles.get(&channel_id) else {
            tracing::debug!(channel = channel_id, "try_send on unknown channel");
            return false;
        };
        match handle.queue_tx.try_send(message.into()) {
            Ok(()) => {
                self.send_notify.notify_one();
                true
            }
            Err(_) => false,
        }
    }

    /// Whether a channel is known and its send queue has room.
    pub fn can_send(&self, channel_id: u8) -> bool {
        self.is_running()
            && self
                .handles
                .get(&channel_id)
                .is_some_and(ChannelHandle::has_capacity)
    }

    /// Whether the connection is started and not stopping or failed.
    pub fn is_running(&self) -> bool {
        self.state.load() == ConnectionState::Started
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.state.load()
    }

    /// Snapshot of byte counters and per-channel queue state.
    pub fn status(&self) -> ConnectionStatus {
        ConnectionStatus {
            uptime: self.send_meter.uptime(),
            bytes_sent: self.send_meter.total(),
            bytes_recv: self.recv_meter.total(),
            send_rate: self.send_meter.rate(),
            recv_rate: self.recv_meter.rate(),
            channels: self.handles.values().map(ChannelHandle::status).collect(),
        }
    }

    /// Stop the connection, closing the underlying stream. Idempotent.
    pub async fn stop(&self) -> ConnResult<()> {
        if self
            .state
            .transition(ConnectionState::Created, ConnectionState::Stopped)
        {
            return Ok(());
        }
        if self
            .state
            .transition(ConnectionState::Started, ConnectionState::Stopping)
        {
            tracing::info!("stopping connection");
        }
        let _ = self.stop_tx.send(StopMode::Halt);
        let send_handle = lock(&self.send_task).take();
        join_or_abort(send_handle, "send").await;
        let recv_handle = lock(&self.recv_task).take();
        join_or_abort(recv_handle, "receive").await;
        self.state.store(ConnectionState::Stopped);
        Ok(())
    }

    /// Drain every message accepted so far, flush the stream, then stop.
    ///
    /// Sends arriving after this call return false. If a fatal error lands
    /// first, this call is a no-op.
    pub async fn flush_stop(&self) {
        if self
            .state
            .transition(ConnectionState::Created, ConnectionState::Stopped)
        {
            return;
        }
        if !self
            .state
            .transition(ConnectionState::Started, ConnectionState::Stopping)
        {
            return;
        }
        tracing::info!("flushing and stopping connection");

        let _ = self.stop_tx.send(StopMode::Drain);
        // The drain is bounded by queue contents but paced by the rate
        // limiter and peer backpressure, so no timeout here.
        let send_handle = lock(&self.send_task).take();
        if let Some(handle) = send_handle {
            let _ = handle.await;
        }
        let _ = self.stop_tx.send(StopMode::Halt);
        let recv_handle = lock(&self.recv_task).take();
        join_or_abort(recv_handle, "receive").await;
        self.state.store(ConnectionState::Stopped);
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.send_task).take() {
            handle.abort();
        }
        if let Some(handle) = lock(&self.recv_task).take() {
            handle.abort();
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state.load())
            .field("channels", &self.handles.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Lock a mutex, recovering the guard if a task panicked while holding it.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Await a loop task within [`STOP_TIMEOUT`], aborting it if it does not
/// exit cooperatively (e.g. wedged in a write the peer never drains).
async fn join_or_abort(handle: Option<JoinHandle<()>>, name: &str) {
    let Some(mut handle) = handle else { return };
    if tokio::time::timeout(STOP_TIMEOUT, &mut handle).await.is_err() {
        tracing::warn!(task = name, "loop did not stop in time; aborting");
        handle.abort();
        let _ = handle.await;
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "opaque panic payload".to_string()
    }
}

/// Sleep until `deadline`, or forever when there is none. Used for the
/// optional pong and flush deadlines in the send loop select.
async fn maybe_sleep(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// The task owning the outbound half of the stream.
struct SendLoop {
    writer: FramedWrite<StreamWriter, PacketCodec>,
    /// Ascending by id.
    channels: Vec<Channel>,
    config: ConnConfig,
    liveness: Liveness,
    bucket: TokenBucket,
    meter: Arc<FlowMeter>,
    notify: Arc<Notify>,
    /// Armed while buffered bytes await a flush.
    flush_deadline: Option<Instant>,
    needs_flush: bool,
}

impl SendLoop {
    async fn run(
        mut self,
        mut events: mpsc::Receiver<RecvEvent>,
        mut stop_rx: watch::Receiver<StopMode>,
    ) -> ConnResult<()> {
        let notify = self.notify.clone();
        let mut ping_timer = interval_at(
            Instant::now() + self.config.ping_interval,
            self.config.ping_interval,
        );
        ping_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut stats_timer = interval_at(Instant::now() + STATS_TICK, STATS_TICK);
        stats_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let pong_deadline = self.liveness.deadline();
            let flush_deadline = self.flush_deadline;

            tokio::select! {
                biased;

                changed = stop_rx.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                    let mode = *stop_rx.borrow_and_update();
                    match mode {
                        StopMode::Run => {}
                        StopMode::Drain => {
                            self.drain().await?;
                            tracing::debug!("send queues drained");
                            return Ok(());
                        }
                        StopMode::Halt => return Ok(()),
                    }
                }

                event = events.recv() => match event {
                    Some(RecvEvent::PingReceived) => {
                        tracing::trace!("answering peer ping");
                        self.write_packet(Packet::pong()).await?;
                        self.flush().await?;
                    }
                    Some(RecvEvent::PongReceived) => {
                        if self.liveness.pong_received() {
                            tracing::trace!("pong received in time");
                        } else {
                            tracing::trace!("ignoring unsolicited pong");
                        }
                    }
                    // Receive loop is gone; it reports its own exit cause.
                    None => return Ok(()),
                },

                _ = maybe_sleep(pong_deadline) => {
                    return Err(ConnError::PongTimeout {
                        timeout: self.config.pong_timeout,
                    });
                }

                _ = ping_timer.tick() => {
                    if self.liveness.is_idle() {
                        tracing::trace!("sending ping");
                        self.write_packet(Packet::ping()).await?;
                        self.flush().await?;
                        self.liveness
                            .ping_sent(Instant::now() + self.config.pong_timeout);
                    }
                }

                _ = stats_timer.tick() => {
                    for channel in &self.channels {
                        channel.decay_recently_sent();
                    }
                }

                _ = maybe_sleep(flush_deadline) => {
                    self.flush().await?;
                }

                _ = notify.notified() => {
                    let sent = self.send_batch().await?;
                    if sent > 0 && least_sent_channel(&self.channels).is_some() {
                        // More than one batch queued: reschedule ourselves so
                        // control traffic and timers interleave with the
                        // backlog.
                        notify.notify_one();
                    }
                }
            }
        }
    }

    /// Emit up to [`SEND_BATCH_SIZE`] data packets, scheduler-fair.
    async fn send_batch(&mut self) -> ConnResult<usize> {
        let mut sent = 0;
        while sent < SEND_BATCH_SIZE {
            let Some(idx) = least_sent_channel(&self.channels) else {
                break;
            };
            let Some(msg) =
                self.channels[idx].next_packet(self.config.max_packet_msg_payload_size)
            else {
                break;
            };
            tracing::trace!(
                channel = self.channels[idx].id(),
                bytes = msg.data.len(),
                eof = msg.eof,
                "sending packet"
            );
            let wire_bytes = self.write_packet(Packet::from(msg)).await?;
            self.channels[idx].note_sent(wire_bytes);
            sent += 1;
        }
        if sent > 0 && self.flush_deadline.is_none() {
            self.flush_deadline = Some(Instant::now() + self.config.flush_throttle);
        }
        Ok(sent)
    }

    /// Rate-limit, then buffer one packet on the stream. Returns its wire
    /// size, length prefix included.
    async fn write_packet(&mut self, packet: Packet) -> ConnResult<usize> {
        let wire_bytes = packet.frame_len();
        self.bucket.throttle(wire_bytes).await;
        self.writer.feed(packet).await?;
        self.meter.record(wire_bytes);
        self.needs_flush = true;
        Ok(wire_bytes)
    }

    async fn flush(&mut self) -> ConnResult<()> {
        if self.needs_flush {
            self.writer.flush().await?;
            self.needs_flush = false;
        }
        self.flush_deadline = None;
        Ok(())
    }

    /// Emit everything queued on every channel, then flush.
    async fn drain(&mut self) -> ConnResult<()> {
        while self.send_batch().await? > 0 {}
        self.flush().await
    }
}

/// The task owning the inbound half of the stream.
struct RecvLoop {
    channels: BTreeMap<u8, Reassembly>,
    bucket: TokenBucket,
    meter: Arc<FlowMeter>,
    on_receive: Arc<ReceiveFn>,
    event_tx: mpsc::Sender<RecvEvent>,
    max_payload: usize,
}

impl RecvLoop {
    async fn run(
        mut self,
        mut frames: FramedRead<StreamReader, PacketCodec>,
        mut stop_rx: watch::Receiver<StopMode>,
    ) -> ConnResult<()> {
        loop {
            tokio::select! {
                biased;

                changed = stop_rx.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                    match *stop_rx.borrow_and_update() {
                        // Keep reading during a drain; the halt follows it.
                        StopMode::Run | StopMode::Drain => {}
                        StopMode::Halt => return Ok(()),
                    }
                }

                frame = frames.next() => match frame {
                    None => {
                        return Err(ConnError::Io(std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            "connection closed by peer",
                        )));
                    }
                    Some(Err(err)) => return Err(err),
                    Some(Ok((sum, wire_bytes))) => {
                        self.bucket.throttle(wire_bytes).await;
                        self.meter.record(wire_bytes);
                        match sum {
                            packet::Sum::Ping(_) => {
                                tracing::trace!("peer ping");
                                if self.event_tx.send(RecvEvent::PingReceived).await.is_err() {
                                    return Ok(());
                                }
                            }
                            packet::Sum::Pong(_) => {
                                tracing::trace!("peer pong");
                                if self.event_tx.send(RecvEvent::PongReceived).await.is_err() {
                                    return Ok(());
                                }
                            }
                            packet::Sum::Msg(msg) => self.handle_msg(msg)?,
                        }
                    }
                }
            }
        }
    }

    /// Validate and reassemble one data packet; deliver the message to the
    /// receive callback when the fragment completes it.
    fn handle_msg(&mut self, msg: PacketMsg) -> ConnResult<()> {
        let channel_id = u8::try_from(msg.channel_id)
            .map_err(|_| ConnError::UnknownChannel { id: msg.channel_id })?;
        let Some(reassembly) = self.channels.get_mut(&channel_id) else {
            return Err(ConnError::UnknownChannel { id: msg.channel_id });
        };
        if msg.data.len() > self.max_payload {
            return Err(ConnError::MessageTooLong {
                size: msg.data.len(),
                max: self.max_payload,
            });
        }
        if let Some(message) = reassembly.absorb(&msg)? {
            tracing::trace!(
                channel = channel_id,
                bytes = message.len(),
                "delivering message"
            );
            (self.on_receive)(channel_id, message);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_state_transitions_are_monotonic() {
        let state = StateCell::new();
        assert_eq!(state.load(), ConnectionState::Created);

        assert!(state.transition(ConnectionState::Created, ConnectionState::Started));
        assert!(!state.transition(ConnectionState::Created, ConnectionState::Started));

        assert!(state.transition(ConnectionState::Started, ConnectionState::Stopping));
        assert!(!state.transition(ConnectionState::Started, ConnectionState::Stopping));
        assert_eq!(state.load(), ConnectionState::Stopping);
    }

    #[test]
    fn test_error_sink_fires_once() {
        let (stop_tx, stop_rx) = watch::channel(StopMode::Run);
        let state = Arc::new(StateCell::new());
        state.store(ConnectionState::Started);

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in_sink = calls.clone();
        let state_in_sink = state.clone();
        let sink = ErrorSink {
            fired: AtomicBool::new(false),
            state: state.clone(),
            stop_tx,
            on_error: Arc::new(move |_err| {
                // The state must already read as stopped here.
                assert_eq!(state_in_sink.load(), ConnectionState::Stopped);
                calls_in_sink.fetch_add(1, Ordering::SeqCst);
            }),
        };

        sink.fire(ConnError::UnknownMsgType);
        sink.fire(ConnError::PongTimeout {
            timeout: Duration::from_millis(45),
        });

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(state.load(), ConnectionState::Stopped);
        assert_eq!(*stop_rx.borrow(), StopMode::Halt);
    }

    #[test]
    fn test_panic_message_downcasts() {
        assert_eq!(panic_message(Box::new("boom")), "boom");
        assert_eq!(panic_message(Box::new(String::from("kaboom"))), "kaboom");
        assert_eq!(panic_message(Box::new(17u32)), "opaque panic payload");
    }

    #[tokio::test]
    async fn test_sends_require_running_connection() {
        let (stream, _peer) = tokio::io::duplex(1024);
        let conn = Connection::new(
            stream,
            vec![ChannelDescriptor::new(0x01)],
            |_, _| {},
            |_| {},
            ConnConfig::default(),
        );

        // Not running yet: every send path reports false.
        assert!(!conn.send(0x01, Bytes::from_static(b"x")).await);
        assert!(!conn.try_send(0x01, Bytes::from_static(b"x")));
        assert!(!conn.can_send(0x01));
        assert_eq!(conn.state(), ConnectionState::Created);
    }

    #[tokio::test]
    async fn test_stop_before_start_is_clean() {
        let (stream, _peer) = tokio::io::duplex(1024);
        let conn = Connection::new(
            stream,
            vec![ChannelDescriptor::new(0x01)],
            |_, _| {},
            |_| {},
            ConnConfig::default(),
        );

        conn.stop().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Stopped);
        assert!(conn.start().is_err());
    }

    #[tokio::test]
    async fn test_double_start_fails() {
        let (stream, _peer) = tokio::io::duplex(1024);
        let conn = Connection::new(
            stream,
            vec![ChannelDescriptor::new(0x01)],
            |_, _| {},
            |_| {},
            ConnConfig::default(),
        );

        conn.start().unwrap();
        assert!(matches!(conn.start(), Err(ConnError::AlreadyStarted)));
        conn.stop().await.unwrap();
    }
}
