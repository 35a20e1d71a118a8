//! Connection core: owns the receive, send, and dispatch loops, and
//! orchestrates the wire codec, estimators, capability negotiation, the
//! priority send queue, the dispatch queue, and message life cycle.

use crate::callback::{Callback, CallbackRegistry, MessageEvent};
use crate::capability::CapabilitySet;
use crate::config::TransportConfig;
use crate::dispatch::DispatchQueue;
use crate::error::Error;
use crate::estimator::MovingAverage;
use crate::frame::{
    CapabilityRecord, ControlFrame, ControlFramePayload, DataFrameDescriptor,
    MAX_DESCRIPTORS_PER_FRAME,
};
use crate::message::{Direction, Message, OutgoingMessage, RegistryLevel};
use crate::queue::PrioritySendQueue;
use crate::socket::FramedSocket;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

const INCOMING_SLOT_COUNT: usize = 16;

/// Bandwidth estimates are exchanged, not configured: a side only learns how
/// fast it may send once the peer has measured real throughput and reported
/// it back. Seeding both estimators at zero would be a permanent deadlock
/// (nobody would ever send a first descriptor), so both start here instead
/// and ramp to the measured value once data has actually flowed.
const INITIAL_THROUGHPUT_ESTIMATE_BPS: i64 = 1_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionState {
    Opening,
    Open,
    Closing,
    Closed,
}

struct PendingDataFrame {
    message: Message,
    offset: usize,
    length: usize,
    is_last: bool,
}

struct ThroughputGroup {
    started: Instant,
    bytes: usize,
}

struct Shared {
    socket: Arc<dyn FramedSocket>,
    config: TransportConfig,
    name: String,

    state: StdMutex<ConnectionState>,
    negotiated_capabilities: StdMutex<CapabilitySet>,
    capabilities_sent: AtomicBool,
    capabilities_requested: AtomicBool,

    incoming_slots: StdMutex<Vec<Option<Message>>>,
    incoming_slots_occupied: AtomicUsize,
    available_send_numbers: StdMutex<VecDeque<u8>>,

    send_queue: StdMutex<PrioritySendQueue>,
    dispatch_queue: StdMutex<DispatchQueue>,
    outgoing_cancel_queue: StdMutex<Vec<Arc<OutgoingMessage>>>,
    connection_registry: StdMutex<CallbackRegistry>,

    inbound_throughput: StdMutex<MovingAverage>,
    local_rtt: StdMutex<MovingAverage>,
    remote_rtt_estimate: AtomicI64,
    outbound_throughput_estimate: AtomicI64,

    outstanding_ping: StdMutex<Option<Instant>>,
    missed_ping_count: AtomicU32,
    ping_count: AtomicU32,
    send_pong: AtomicBool,

    bytes_in: AtomicU64,
    bytes_out: AtomicU64,

    notify_send: Notify,
    notify_dispatch: Notify,
    notify_send_permit: Notify,
    close_tx: watch::Sender<Option<String>>,
    close_rx: watch::Receiver<Option<String>>,
}

impl Shared {
    fn new(socket: Arc<dyn FramedSocket>, config: TransportConfig, name: String) -> Shared {
        let (close_tx, close_rx) = watch::channel(None);
        let available_send_numbers = (0..config.max_concurrent_messages).collect();
        Shared {
            socket,
            config,
            name,
            state: StdMutex::new(ConnectionState::Opening),
            negotiated_capabilities: StdMutex::new(CapabilitySet::zero()),
            capabilities_sent: AtomicBool::new(false),
            capabilities_requested: AtomicBool::new(false),
            incoming_slots: StdMutex::new(vec![None; INCOMING_SLOT_COUNT]),
            incoming_slots_occupied: AtomicUsize::new(0),
            available_send_numbers: StdMutex::new(available_send_numbers),
            send_queue: StdMutex::new(PrioritySendQueue::new(config.priority_levels)),
            dispatch_queue: StdMutex::new(DispatchQueue::new()),
            outgoing_cancel_queue: StdMutex::new(Vec::new()),
            connection_registry: StdMutex::new(CallbackRegistry::new()),
            inbound_throughput: StdMutex::new(MovingAverage::new(
                config.bandwidth_estimator_samples,
                INITIAL_THROUGHPUT_ESTIMATE_BPS,
            )),
            local_rtt: StdMutex::new(MovingAverage::new(config.bandwidth_estimator_samples, 0)),
            remote_rtt_estimate: AtomicI64::new(0),
            outbound_throughput_estimate: AtomicI64::new(INITIAL_THROUGHPUT_ESTIMATE_BPS),
            outstanding_ping: StdMutex::new(None),
            missed_ping_count: AtomicU32::new(0),
            ping_count: AtomicU32::new(0),
            send_pong: AtomicBool::new(false),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            notify_send: Notify::new(),
            notify_dispatch: Notify::new(),
            notify_send_permit: Notify::new(),
            close_tx,
            close_rx,
        }
    }

    fn is_closing(&self) -> bool {
        matches!(
            *self.state.lock().expect("state mutex poisoned"),
            ConnectionState::Closing | ConnectionState::Closed
        )
    }

    fn transition_to_open(&self) {
        let mut state = self.state.lock().expect("state mutex poisoned");
        if *state == ConnectionState::Opening {
            *state = ConnectionState::Open;
        }
    }

    fn rtt_estimate_ms(&self) -> u16 {
        let local = self.local_rtt.lock().expect("rtt mutex poisoned").value();
        local.clamp(0, u16::MAX as i64) as u16
    }

    fn release_send_number(&self, number: u8) {
        self.available_send_numbers
            .lock()
            .expect("send number pool poisoned")
            .push_back(number);
        self.notify_send_permit.notify_waiters();
    }

    async fn acquire_send_number(&self) -> Result<u8, Error> {
        loop {
            if self.is_closing() {
                return Err(Error::TransportClosed);
            }
            let notified = self.notify_send_permit.notified();
            {
                let mut pool = self
                    .available_send_numbers
                    .lock()
                    .expect("send number pool poisoned");
                if let Some(number) = pool.pop_front() {
                    return Ok(number);
                }
            }
            notified.await;
        }
    }

    async fn force_close(&self, reason: String) {
        {
            let mut state = self.state.lock().expect("state mutex poisoned");
            if matches!(*state, ConnectionState::Closing | ConnectionState::Closed) {
                return;
            }
            *state = ConnectionState::Closing;
        }
        log::warn!("connection '{}' closing: {reason}", self.name);

        let cancelled: Vec<Message> = {
            let mut slots = self.incoming_slots.lock().expect("incoming slots poisoned");
            slots.iter_mut().filter_map(|slot| slot.take()).collect()
        };
        for message in cancelled {
            message.mark_cancelled();
            self.dispatch_queue
                .lock()
                .expect("dispatch queue poisoned")
                .enqueue(message);
        }
        self.incoming_slots_occupied.store(0, Ordering::SeqCst);

        let _ = self.close_tx.send(Some(reason.clone()));
        self.notify_send.notify_waiters();
        self.notify_dispatch.notify_waiters();
        self.notify_send_permit.notify_waiters();

        let closed = tokio::time::timeout(Duration::from_secs(60), self.socket.close(&reason, false)).await;
        if closed.is_err() {
            log::warn!(
                "connection '{}' did not finish closing within the 60s fallback timer",
                self.name
            );
        }

        let mut state = self.state.lock().expect("state mutex poisoned");
        *state = ConnectionState::Closed;
    }
}

/// A multiplexed connection layered over one [`FramedSocket`].
///
/// Spawns the receive and send loops at construction. The application must
/// register connection-level callbacks and then call [`Connection::begin_dispatch`]
/// to start delivering events.
pub struct Connection {
    shared: Arc<Shared>,
    receive_handle: StdMutex<Option<JoinHandle<()>>>,
    send_handle: StdMutex<Option<JoinHandle<()>>>,
    dispatch_handle: StdMutex<Option<JoinHandle<()>>>,
}

impl Connection {
    pub fn new(
        socket: Arc<dyn FramedSocket>,
        config: TransportConfig,
        name: impl Into<String>,
        send_capabilities: bool,
    ) -> Connection {
        let config = config.normalized();
        let shared = Arc::new(Shared::new(socket, config, name.into()));
        if send_capabilities {
            shared.capabilities_requested.store(true, Ordering::SeqCst);
        }
        let receive_handle = tokio::spawn(receive_loop(shared.clone()));
        let send_handle = tokio::spawn(send_loop(shared.clone()));
        Connection {
            shared,
            receive_handle: StdMutex::new(Some(receive_handle)),
            send_handle: StdMutex::new(Some(send_handle)),
            dispatch_handle: StdMutex::new(None),
        }
    }

    pub fn register_callback(&self, filter: MessageEvent, callback: Callback) {
        self.shared
            .connection_registry
            .lock()
            .expect("connection registry poisoned")
            .register(filter, callback);
    }

    /// Starts the dispatch loop. Must be called once, after connection-level
    /// callbacks are registered; a second call is a no-op.
    pub fn begin_dispatch(&self) {
        let mut handle = self.dispatch_handle.lock().expect("dispatch handle poisoned");
        if handle.is_none() {
            *handle = Some(tokio::spawn(dispatch_loop(self.shared.clone())));
        }
    }

    pub async fn send_message(
        &self,
        message: Message,
        priority: u8,
        header: Option<Vec<u8>>,
    ) -> Result<Arc<OutgoingMessage>, Error> {
        if priority as usize >= self.shared.config.priority_levels as usize {
            return Err(Error::PriorityOutOfRange(priority, self.shared.config.priority_levels));
        }
        if header.is_some() && message.direction() == Direction::Incoming {
            return Err(Error::HeaderOnIncoming);
        }
        if self.shared.is_closing() {
            return Err(Error::TransportClosed);
        }

        let message_number = self.shared.acquire_send_number().await?;
        if self.shared.is_closing() {
            self.shared.release_send_number(message_number);
            return Err(Error::TransportClosed);
        }

        let outgoing = Arc::new(OutgoingMessage::new(message.clone(), message_number, priority, header));

        if !message.complete() {
            let wake_shared = self.shared.clone();
            message.register_callback(
                MessageEvent::PAYLOAD_RECEIVED,
                Arc::new(move |_message, _events| wake_shared.notify_send.notify_one()),
            )?;
            let cancel_shared = self.shared.clone();
            let outgoing_for_cancel = outgoing.clone();
            message.register_callback(
                MessageEvent::CANCELLED,
                Arc::new(move |_message, _events| {
                    cancel_shared
                        .outgoing_cancel_queue
                        .lock()
                        .expect("cancel queue poisoned")
                        .push(outgoing_for_cancel.clone());
                    cancel_shared.notify_send.notify_one();
                }),
            )?;
        }

        self.shared
            .send_queue
            .lock()
            .expect("send queue poisoned")
            .enqueue(outgoing.clone());
        self.shared.notify_send.notify_one();
        Ok(outgoing)
    }

    /// Requests cancellation of an in-flight outgoing message. Non-blocking;
    /// the send loop performs the actual bookkeeping.
    pub fn cancel(&self, outgoing: Arc<OutgoingMessage>) {
        self.shared
            .outgoing_cancel_queue
            .lock()
            .expect("cancel queue poisoned")
            .push(outgoing);
        self.shared.notify_send.notify_one();
    }

    pub async fn force_close(&self, reason: impl Into<String>, _wait_for_remote: bool) {
        self.shared.force_close(reason.into()).await;
    }

    pub async fn wait_close(&self) -> String {
        let mut rx = self.shared.close_rx.clone();
        loop {
            if let Some(reason) = rx.borrow_and_update().clone() {
                return reason;
            }
            if rx.changed().await.is_err() {
                return "transport closed".to_string();
            }
        }
    }

    pub fn rtt_estimate(&self) -> i64 {
        let local = self.shared.local_rtt.lock().expect("rtt mutex poisoned").value();
        let remote = self.shared.remote_rtt_estimate.load(Ordering::Relaxed);
        local.min(remote)
    }

    pub fn inbound_throughput_estimate(&self) -> i64 {
        self.shared
            .inbound_throughput
            .lock()
            .expect("throughput mutex poisoned")
            .value()
    }

    pub fn outbound_throughput_estimate(&self) -> i64 {
        self.shared.outbound_throughput_estimate.load(Ordering::Relaxed)
    }

    pub fn negotiated_capabilities(&self) -> CapabilitySet {
        *self
            .shared
            .negotiated_capabilities
            .lock()
            .expect("negotiated capabilities mutex poisoned")
    }

    pub fn bytes_in(&self) -> u64 {
        self.shared.bytes_in.load(Ordering::Relaxed)
    }

    pub fn bytes_out(&self) -> u64 {
        self.shared.bytes_out.load(Ordering::Relaxed)
    }

    pub fn is_closing(&self) -> bool {
        self.shared.is_closing()
    }
}

async fn receive_loop(shared: Arc<Shared>) {
    let mut staging = vec![0u8; crate::frame::MAX_CONTROL_FRAME_SIZE];
    let mut expected_data_frames: VecDeque<PendingDataFrame> = VecDeque::new();
    let mut throughput_group: Option<ThroughputGroup> = None;

    loop {
        if shared.is_closing() {
            return;
        }

        let outcome = if let Some(pending) = expected_data_frames.pop_front() {
            receive_data_frame(&shared, pending, &mut throughput_group).await
        } else {
            receive_control_frame(&shared, &mut staging, &mut expected_data_frames, &mut throughput_group).await
        };

        if let Err(err) = outcome {
            shared.force_close(err.to_string()).await;
            return;
        }
    }
}

async fn receive_data_frame(
    shared: &Arc<Shared>,
    pending: PendingDataFrame,
    throughput_group: &mut Option<ThroughputGroup>,
) -> Result<(), Error> {
    let mut buffer = vec![0u8; pending.length];
    let n = shared.socket.receive_frame(&mut buffer).await?;
    shared.bytes_in.fetch_add(n as u64, Ordering::Relaxed);

    pending.message.receive_at(pending.offset, &buffer[..n]);
    shared
        .dispatch_queue
        .lock()
        .expect("dispatch queue poisoned")
        .enqueue(pending.message.clone());
    shared.notify_dispatch.notify_one();

    if let Some(group) = throughput_group.as_mut() {
        group.bytes += n;
    }

    if pending.is_last {
        {
            let mut slots = shared.incoming_slots.lock().expect("incoming slots poisoned");
            if let Some(slot) = slots.iter_mut().find(|slot| {
                slot.as_ref().map(|m| m.id()) == Some(pending.message.id())
            }) {
                *slot = None;
            }
        }
        shared.incoming_slots_occupied.fetch_sub(1, Ordering::SeqCst);

        if let Some(group) = throughput_group.take() {
            let elapsed_ms = group.started.elapsed().as_millis() as i64;
            if group.bytes > shared.config.single_packet_mtu && elapsed_ms > 0 {
                shared
                    .inbound_throughput
                    .lock()
                    .expect("throughput mutex poisoned")
                    .record((group.bytes as i64) * 1000 / elapsed_ms);
            }
        }
    }

    Ok(())
}

async fn receive_control_frame(
    shared: &Arc<Shared>,
    staging: &mut [u8],
    expected_data_frames: &mut VecDeque<PendingDataFrame>,
    throughput_group: &mut Option<ThroughputGroup>,
) -> Result<(), Error> {
    let n = shared.socket.receive_frame(staging).await?;
    shared.bytes_in.fetch_add(n as u64, Ordering::Relaxed);
    let frame = ControlFrame::decode(&staging[..n])?;
    handle_control_frame(shared, frame, expected_data_frames, throughput_group)
}

fn handle_control_frame(
    shared: &Arc<Shared>,
    frame: ControlFrame,
    expected_data_frames: &mut VecDeque<PendingDataFrame>,
    throughput_group: &mut Option<ThroughputGroup>,
) -> Result<(), Error> {
    shared.transition_to_open();
    shared.remote_rtt_estimate.store(frame.rtt_ms as i64, Ordering::Relaxed);
    shared
        .outbound_throughput_estimate
        .store(frame.throughput_bps as i64, Ordering::Relaxed);

    match frame.payload {
        ControlFramePayload::Capabilities(record) => {
            let remote = CapabilitySet {
                major_version: record.major_version,
                minor_version: record.minor_version,
                capability_bits: record.capability_bits,
            };
            let negotiated = CapabilitySet::negotiate(CapabilitySet::LOCAL, remote);
            *shared
                .negotiated_capabilities
                .lock()
                .expect("negotiated capabilities mutex poisoned") = negotiated;
            if negotiated.supports_capabilities() && !shared.capabilities_sent.load(Ordering::SeqCst) {
                shared.capabilities_requested.store(true, Ordering::SeqCst);
                shared.notify_send.notify_one();
            }
        }
        ControlFramePayload::SendData(descriptors) => {
            *throughput_group = Some(ThroughputGroup {
                started: Instant::now(),
                bytes: 0,
            });
            for descriptor in descriptors {
                let message = if descriptor.is_first {
                    let message =
                        Message::new_incoming(descriptor.total_message_length as usize, descriptor.header.clone());
                    let mut slots = shared.incoming_slots.lock().expect("incoming slots poisoned");
                    slots[descriptor.message_number as usize] = Some(message.clone());
                    shared.incoming_slots_occupied.fetch_add(1, Ordering::SeqCst);
                    message
                } else {
                    let slots = shared.incoming_slots.lock().expect("incoming slots poisoned");
                    match slots[descriptor.message_number as usize].clone() {
                        Some(message) => message,
                        None => {
                            return Err(Error::ProtocolViolation(format!(
                                "data frame for unknown message number {}",
                                descriptor.message_number
                            )));
                        }
                    }
                };
                let expected_length = message.expected_length();
                if descriptor.offset as usize > expected_length {
                    return Err(Error::ProtocolViolation(format!(
                        "data frame offset {} exceeds message {} length {expected_length}",
                        descriptor.offset, descriptor.message_number
                    )));
                }
                let length = expected_length - descriptor.offset as usize;
                expected_data_frames.push_back(PendingDataFrame {
                    message,
                    offset: descriptor.offset as usize,
                    length,
                    is_last: descriptor.is_last,
                });
            }
        }
        ControlFramePayload::Ping => {
            shared.send_pong.store(true, Ordering::SeqCst);
            shared.notify_send.notify_one();
        }
        ControlFramePayload::Pong => {
            let sent_at = shared
                .outstanding_ping
                .lock()
                .expect("outstanding ping mutex poisoned")
                .take();
            if let Some(sent_at) = sent_at {
                shared
                    .local_rtt
                    .lock()
                    .expect("rtt mutex poisoned")
                    .record(sent_at.elapsed().as_millis() as i64);
            }
            shared.missed_ping_count.store(0, Ordering::SeqCst);
        }
        ControlFramePayload::CancelMessages(bitmask) => {
            for bit in 0..INCOMING_SLOT_COUNT as u8 {
                if bitmask & (1 << bit) == 0 {
                    continue;
                }
                let slot_message = {
                    let mut slots = shared.incoming_slots.lock().expect("incoming slots poisoned");
                    slots[bit as usize].take()
                };
                if let Some(message) = slot_message {
                    message.mark_cancelled();
                    shared.incoming_slots_occupied.fetch_sub(1, Ordering::SeqCst);
                    shared
                        .dispatch_queue
                        .lock()
                        .expect("dispatch queue poisoned")
                        .enqueue(message);
                    shared.notify_dispatch.notify_one();
                }
            }
        }
        ControlFramePayload::Reserved(opcode) => {
            log::debug!("connection '{}' ignoring reserved opcode {opcode:#x}", shared.name);
        }
    }
    Ok(())
}

fn compute_bytes_budget(shared: &Shared) -> usize {
    let throughput = shared.outbound_throughput_estimate.load(Ordering::Relaxed).max(0) as u64;
    let mtu = (shared.config.single_packet_mtu as u64).max(1);
    let inner = throughput * shared.config.max_percent_throughput as u64 * shared.config.target_responsiveness_ms
        / 100_000;
    let packets = inner.div_ceil(mtu);
    (packets * mtu) as usize
}

fn ping_base_delay(config: &TransportConfig, ping_count: u32) -> Duration {
    let ratio = (config.ping_interval_ms / config.initial_ping_interval_ms.max(1)).max(1);
    let base_ms = if (ping_count as u64) < ratio {
        config.initial_ping_interval_ms
    } else {
        config.ping_interval_ms
    };
    Duration::from_millis(base_ms)
}

/// `base ± 50%`, uniformly at random.
fn jittered_delay(base: Duration) -> Duration {
    let half = (base.as_millis() as i64) / 2;
    let mut rng = StdRng::from_rng(rand::thread_rng());
    let jitter = rng.random_range(-half..=half);
    let millis = (base.as_millis() as i64 + jitter).max(0) as u64;
    Duration::from_millis(millis)
}

async fn outgoing_control_frame(shared: &Arc<Shared>, payload: ControlFramePayload) {
    let frame = ControlFrame {
        rtt_ms: shared.rtt_estimate_ms(),
        throughput_bps: shared
            .inbound_throughput
            .lock()
            .expect("throughput mutex poisoned")
            .value() as i32,
        payload,
    };
    let encoded = frame.encode();
    shared.bytes_out.fetch_add(encoded.len() as u64, Ordering::Relaxed);
    shared.socket.send_frame(&encoded).await;
}

async fn drain_outgoing_cancels(shared: &Arc<Shared>) {
    let pending: Vec<Arc<OutgoingMessage>> = {
        let mut queue = shared.outgoing_cancel_queue.lock().expect("cancel queue poisoned");
        std::mem::take(&mut *queue)
    };
    if pending.is_empty() {
        return;
    }

    let negotiated = *shared
        .negotiated_capabilities
        .lock()
        .expect("negotiated capabilities mutex poisoned");
    let mut bitmask: u16 = 0;
    let mut deadlocked = false;

    for outgoing in pending {
        if outgoing.bytes_remaining() == 0 {
            continue;
        }
        if !negotiated.supports_cancel_message() {
            let pool_empty = shared
                .available_send_numbers
                .lock()
                .expect("send number pool poisoned")
                .is_empty();
            if pool_empty {
                deadlocked = true;
            }
            continue;
        }
        let _ = shared
            .send_queue
            .lock()
            .expect("send queue poisoned")
            .cancel(outgoing.priority, outgoing.message_number);
        shared.release_send_number(outgoing.message_number);
        bitmask |= 1 << outgoing.message_number;
    }

    if deadlocked {
        shared
            .force_close("out of message numbers and unable to cancel".to_string())
            .await;
        return;
    }

    if bitmask != 0 {
        outgoing_control_frame(shared, ControlFramePayload::CancelMessages(bitmask)).await;
    }
}

async fn send_loop(shared: Arc<Shared>) {
    let target_responsiveness = Duration::from_millis(shared.config.target_responsiveness_ms);
    let mut bytes_budget: usize = 0;
    let mut budget_deadline = Instant::now();
    let mut ping_deadline = Instant::now() + jittered_delay(ping_base_delay(&shared.config, 0));
    let mut close_rx = shared.close_rx.clone();

    loop {
        if shared.is_closing() {
            return;
        }

        let now = Instant::now();
        if now >= budget_deadline {
            bytes_budget = compute_bytes_budget(&shared);
            budget_deadline = now + target_responsiveness;
        }

        if shared.send_pong.swap(false, Ordering::SeqCst) {
            outgoing_control_frame(&shared, ControlFramePayload::Pong).await;
        }

        if shared.capabilities_requested.swap(false, Ordering::SeqCst)
            && !shared.capabilities_sent.load(Ordering::SeqCst)
        {
            outgoing_control_frame(
                &shared,
                ControlFramePayload::Capabilities(CapabilityRecord {
                    major_version: CapabilitySet::LOCAL.major_version,
                    minor_version: CapabilitySet::LOCAL.minor_version,
                    capability_bits: CapabilitySet::LOCAL.capability_bits,
                }),
            )
            .await;
            shared.capabilities_sent.store(true, Ordering::SeqCst);
        }

        drain_outgoing_cancels(&shared).await;

        if Instant::now() >= ping_deadline {
            let already_outstanding = {
                let mut outstanding = shared.outstanding_ping.lock().expect("outstanding ping mutex poisoned");
                if outstanding.is_none() {
                    *outstanding = Some(Instant::now());
                    false
                } else {
                    true
                }
            };

            if !already_outstanding {
                outgoing_control_frame(&shared, ControlFramePayload::Ping).await;
                let count = shared.ping_count.fetch_add(1, Ordering::SeqCst) + 1;
                ping_deadline = Instant::now() + jittered_delay(ping_base_delay(&shared.config, count));
            } else {
                let missed = shared.missed_ping_count.fetch_add(1, Ordering::SeqCst) + 1;
                if missed >= shared.config.missed_ping_count {
                    shared
                        .force_close("remote side did not respond to a ping".to_string())
                        .await;
                    return;
                }
                let count = shared.ping_count.load(Ordering::SeqCst);
                ping_deadline = Instant::now() + jittered_delay(ping_base_delay(&shared.config, count));
            }
        }

        let mut descriptors = Vec::new();
        let mut payloads: Vec<Vec<u8>> = Vec::new();
        while bytes_budget > 0 && descriptors.len() < MAX_DESCRIPTORS_PER_FRAME {
            let picked = shared.send_queue.lock().expect("send queue poisoned").next(bytes_budget);
            let Some((outgoing, n)) = picked else { break };

            let offset = outgoing.bytes_sent();
            let is_first = offset == 0;
            let payload = outgoing.payload_slice(offset, n);
            let header = if is_first { outgoing.header() } else { None };
            let new_sent = outgoing.advance(n);
            let is_last = new_sent == outgoing.message.expected_length();
            bytes_budget -= n;

            if is_last {
                shared.release_send_number(outgoing.message_number);
            }

            descriptors.push(DataFrameDescriptor {
                message_number: outgoing.message_number,
                offset: offset as u32,
                total_message_length: outgoing.message.expected_length() as u32,
                is_first,
                is_last,
                header,
            });
            payloads.push(payload);
        }

        if !descriptors.is_empty() {
            outgoing_control_frame(&shared, ControlFramePayload::SendData(descriptors)).await;
            for payload in payloads {
                shared.bytes_out.fetch_add(payload.len() as u64, Ordering::Relaxed);
                shared.socket.send_frame(&payload).await;
            }
            continue;
        }

        if bytes_budget > 0 {
            tokio::select! {
                _ = shared.notify_send.notified() => {}
                _ = tokio::time::sleep_until(ping_deadline) => {}
                _ = close_rx.changed() => {}
            }
        } else {
            tokio::select! {
                _ = shared.notify_send.notified() => {}
                _ = tokio::time::sleep_until(budget_deadline) => {}
                _ = close_rx.changed() => {}
            }
        }
    }
}

fn dispatch_one(shared: &Arc<Shared>, message: &Message) {
    let cancelled = message.cancelled();
    let complete = message.complete();

    if message.has_message_level_registrations() {
        let mut events = MessageEvent::empty();
        if cancelled {
            events |= MessageEvent::CANCELLED;
        } else {
            events |= MessageEvent::PAYLOAD_RECEIVED;
            if complete && message.take_complete_event(RegistryLevel::Message) {
                events |= MessageEvent::COMPLETE;
            }
        }
        message.fire_message_level(events);
    }

    if cancelled && !message.new_message_ever_delivered() {
        return;
    }

    let mut events = MessageEvent::empty();
    if message.take_new_message_event() {
        events |= MessageEvent::NEW_MESSAGE;
    }
    if cancelled {
        events |= MessageEvent::CANCELLED;
    } else {
        events |= MessageEvent::PAYLOAD_RECEIVED;
        if complete && message.take_complete_event(RegistryLevel::Connection) {
            events |= MessageEvent::COMPLETE;
        }
    }

    let registry = shared
        .connection_registry
        .lock()
        .expect("connection registry poisoned")
        .clone();
    registry.fire(message, events);
}

async fn dispatch_loop(shared: Arc<Shared>) {
    let mut close_rx = shared.close_rx.clone();
    loop {
        loop {
            let message = shared.dispatch_queue.lock().expect("dispatch queue poisoned").dequeue();
            let Some(message) = message else { break };
            dispatch_one(&shared, &message);
        }

        if shared.is_closing() && shared.incoming_slots_occupied.load(Ordering::SeqCst) == 0 {
            return;
        }

        tokio::select! {
            _ = shared.notify_dispatch.notified() => {}
            _ = close_rx.changed() => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::DuplexFramedSocket;
    use std::sync::atomic::AtomicU32 as TestCounter;
    use std::sync::Mutex as TestMutex;
    use tokio::io::split;

    fn paired_sockets() -> (
        Arc<dyn FramedSocket>,
        Arc<dyn FramedSocket>,
    ) {
        let (a, b) = tokio::io::duplex(1 << 20);
        let (a_read, a_write) = split(a);
        let (b_read, b_write) = split(b);
        (
            Arc::new(DuplexFramedSocket::new(a_read, a_write)),
            Arc::new(DuplexFramedSocket::new(b_read, b_write)),
        )
    }

    #[tokio::test]
    async fn large_loopback_send_delivers_the_full_payload() {
        let (socket_a, socket_b) = paired_sockets();
        let config = TransportConfig::default();

        let connection_a = Connection::new(socket_a, config, "a", true);
        let connection_b = Connection::new(socket_b, config, "b", false);

        let received: Arc<TestMutex<Option<(Vec<u8>, Option<Vec<u8>>)>>> = Arc::new(TestMutex::new(None));
        let received_clone = received.clone();
        let complete_count = Arc::new(TestCounter::new(0));
        let complete_count_clone = complete_count.clone();

        connection_b.register_callback(
            MessageEvent::ALL,
            Arc::new(move |_message, events| {
                if events.contains(MessageEvent::COMPLETE) {
                    complete_count_clone.fetch_add(1, Ordering::SeqCst);
                }
            }),
        );
        connection_b.register_callback(
            MessageEvent::COMPLETE,
            Arc::new(move |message, _events| {
                *received_clone.lock().unwrap() = Some((message.payload(), message.header()));
            }),
        );
        connection_b.begin_dispatch();
        connection_a.begin_dispatch();

        let payload = vec![0xABu8; 1 << 20];
        let header = vec![1, 2, 3];
        let message = Message::new_outgoing(payload.clone(), Some(header.clone()));
        let outgoing = connection_a.send_message(message, 0, None).await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while received.lock().unwrap().is_none() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let (received_payload, received_header) =
            received.lock().unwrap().take().expect("message did not arrive within 10s");
        assert_eq!(received_payload, payload);
        assert_eq!(received_header, Some(header));
        assert_eq!(complete_count.load(Ordering::SeqCst), 1);
        assert_eq!(outgoing.bytes_remaining(), 0);
    }

    #[test]
    fn byte_budget_formula_matches_the_corrected_spec() {
        let mut config = TransportConfig::default();
        config.single_packet_mtu = 1398;
        config.max_percent_throughput = 75;
        config.target_responsiveness_ms = 100;
        let shared = Shared::new(
            Arc::new(NullSocket),
            config,
            "test".to_string(),
        );
        shared.outbound_throughput_estimate.store(1_000_000, Ordering::SeqCst);
        let budget = compute_bytes_budget(&shared);
        assert_eq!(budget % config.single_packet_mtu, 0);
        assert!(budget > 0);
    }

    #[test]
    fn send_data_descriptor_offset_beyond_message_length_is_a_protocol_violation() {
        let shared = Arc::new(Shared::new(Arc::new(NullSocket), TransportConfig::default(), "test".to_string()));
        let mut expected_data_frames = VecDeque::new();
        let mut throughput_group = None;
        let frame = ControlFrame {
            rtt_ms: 0,
            throughput_bps: 0,
            payload: ControlFramePayload::SendData(vec![DataFrameDescriptor {
                message_number: 0,
                offset: 100,
                total_message_length: 10,
                is_first: true,
                is_last: true,
                header: None,
            }]),
        };
        let result = handle_control_frame(&shared, frame, &mut expected_data_frames, &mut throughput_group);
        assert!(matches!(result, Err(Error::ProtocolViolation(_))));
        assert!(expected_data_frames.is_empty());
    }

    #[test]
    fn send_data_continuation_for_unknown_message_number_is_a_protocol_violation() {
        let shared = Arc::new(Shared::new(Arc::new(NullSocket), TransportConfig::default(), "test".to_string()));
        let mut expected_data_frames = VecDeque::new();
        let mut throughput_group = None;
        let frame = ControlFrame {
            rtt_ms: 0,
            throughput_bps: 0,
            payload: ControlFramePayload::SendData(vec![DataFrameDescriptor {
                message_number: 5,
                offset: 10,
                total_message_length: 20,
                is_first: false,
                is_last: false,
                header: None,
            }]),
        };
        let result = handle_control_frame(&shared, frame, &mut expected_data_frames, &mut throughput_group);
        assert!(matches!(result, Err(Error::ProtocolViolation(_))));
        assert!(expected_data_frames.is_empty());
    }

    struct NullSocket;

    #[async_trait::async_trait]
    impl FramedSocket for NullSocket {
        async fn receive_frame(&self, _buffer: &mut [u8]) -> Result<usize, Error> {
            std::future::pending::<()>().await;
            unreachable!()
        }
        async fn send_frame(&self, _buffer: &[u8]) {}
        async fn close(&self, _reason: &str, _wait_for_remote: bool) {}
    }
}
