//! Message and outgoing-message entities: payload buffer, header, progress
//! counters, and (for incoming messages) a per-message callback registry.

use crate::callback::{Callback, CallbackRegistry, MessageEvent};
use crate::error::Error;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::sync::{Arc, MutexGuard};

static NEXT_MESSAGE_ID: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Incoming,
    Outgoing,
}

/// Which registry a dispatch cycle is computing events for. NewMessage is
/// only ever meaningful at connection level; message-level registries are
/// rejected at registration time for that bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryLevel {
    Message,
    Connection,
}

struct MessageInner {
    direction: Direction,
    header: Option<Vec<u8>>,
    payload: Vec<u8>,
    bytes_received: usize,
    cancelled: bool,
    registry: CallbackRegistry,
    new_message_delivered: bool,
    complete_fired_message_level: bool,
    complete_fired_connection_level: bool,
}

/// A shared, reference-counted handle to one message's state. Cheap to
/// clone: every holder (an incoming slot, the dispatch queue, an
/// application callback parameter) shares the same underlying buffer.
#[derive(Clone)]
pub struct Message {
    id: u64,
    inner: Arc<Mutex<MessageInner>>,
}

impl Message {
    /// A fresh incoming message of `expected_length` bytes, allocated when
    /// the first data frame bearing its message number arrives.
    pub fn new_incoming(expected_length: usize, header: Option<Vec<u8>>) -> Self {
        Message {
            id: NEXT_MESSAGE_ID.fetch_add(1, Ordering::Relaxed),
            inner: Arc::new(Mutex::new(MessageInner {
                direction: Direction::Incoming,
                header,
                payload: vec![0u8; expected_length],
                bytes_received: 0,
                cancelled: false,
                registry: CallbackRegistry::new(),
                new_message_delivered: false,
                complete_fired_message_level: false,
                complete_fired_connection_level: false,
            })),
        }
    }

    /// A fully-populated outgoing message, ready for immediate send.
    pub fn new_outgoing(payload: Vec<u8>, header: Option<Vec<u8>>) -> Self {
        let len = payload.len();
        Message {
            id: NEXT_MESSAGE_ID.fetch_add(1, Ordering::Relaxed),
            inner: Arc::new(Mutex::new(MessageInner {
                direction: Direction::Outgoing,
                header,
                payload,
                bytes_received: len,
                cancelled: false,
                registry: CallbackRegistry::new(),
                new_message_delivered: false,
                complete_fired_message_level: false,
                complete_fired_connection_level: false,
            })),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    fn lock(&self) -> MutexGuard<'_, MessageInner> {
        self.inner.lock().expect("message mutex poisoned")
    }

    pub fn direction(&self) -> Direction {
        self.lock().direction
    }

    pub fn header(&self) -> Option<Vec<u8>> {
        self.lock().header.clone()
    }

    pub fn payload(&self) -> Vec<u8> {
        self.lock().payload.clone()
    }

    pub fn expected_length(&self) -> usize {
        self.lock().payload.len()
    }

    pub fn bytes_received(&self) -> usize {
        self.lock().bytes_received
    }

    pub fn complete(&self) -> bool {
        let inner = self.lock();
        inner.bytes_received == inner.payload.len()
    }

    pub fn cancelled(&self) -> bool {
        self.lock().cancelled
    }

    /// Appends `data` at `offset` into the payload buffer and advances
    /// `bytesReceived`. Only meaningful for incoming messages; the receive
    /// loop is the sole writer.
    pub fn receive_at(&self, offset: usize, data: &[u8]) {
        let mut inner = self.lock();
        let end = offset + data.len();
        inner.payload[offset..end].copy_from_slice(data);
        inner.bytes_received = inner.bytes_received.max(end);
    }

    /// Marks the message cancelled. Terminal: no further payload is
    /// accepted and `complete()` will never become true afterwards.
    pub fn mark_cancelled(&self) {
        self.lock().cancelled = true;
    }

    /// Registers a callback on this message's own registry. Rejects the
    /// NewMessage bit (only valid at connection level) and any
    /// registration on an outgoing message (outgoing messages never fire
    /// callbacks).
    pub fn register_callback(
        &self,
        filter: MessageEvent,
        callback: Callback,
    ) -> Result<(), Error> {
        let mut inner = self.lock();
        if inner.direction == Direction::Outgoing {
            return Err(Error::NewMessageAtMessageLevel);
        }
        if filter.contains(MessageEvent::NEW_MESSAGE) {
            return Err(Error::NewMessageAtMessageLevel);
        }
        inner.registry.register(filter, callback);
        Ok(())
    }

    /// Fires against a snapshot of the registry, taken under the lock and
    /// released before any callback runs: callbacks routinely read the
    /// message back (payload, header, complete()), which would deadlock
    /// against a non-reentrant mutex held across the call.
    pub(crate) fn fire_message_level(&self, events: MessageEvent) {
        let registry = self.lock().registry.clone();
        registry.fire(self, events);
    }

    pub(crate) fn has_message_level_registrations(&self) -> bool {
        !self.lock().registry.is_empty()
    }

    /// Returns `true`, and marks it delivered, only the first time this is
    /// called for this message. Subsequent calls return `false`.
    pub(crate) fn take_new_message_event(&self) -> bool {
        let mut inner = self.lock();
        if inner.new_message_delivered {
            false
        } else {
            inner.new_message_delivered = true;
            true
        }
    }

    pub(crate) fn new_message_ever_delivered(&self) -> bool {
        self.lock().new_message_delivered
    }

    /// Returns `true`, and marks it fired, only the first time this is
    /// called for this message at the given registry level.
    pub(crate) fn take_complete_event(&self, level: RegistryLevel) -> bool {
        let mut inner = self.lock();
        let flag = match level {
            RegistryLevel::Message => &mut inner.complete_fired_message_level,
            RegistryLevel::Connection => &mut inner.complete_fired_connection_level,
        };
        if *flag {
            false
        } else {
            *flag = true;
            true
        }
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("Message")
            .field("id", &self.id)
            .field("direction", &inner.direction)
            .field("bytes_received", &inner.bytes_received)
            .field("expected_length", &inner.payload.len())
            .field("cancelled", &inner.cancelled)
            .finish()
    }
}

struct OutgoingState {
    header_override: Option<Vec<u8>>,
    bytes_sent: usize,
}

/// Wraps a [`Message`] with the bookkeeping the send queue and send loop
/// need: an assigned message number, a priority, an optional header
/// override, and a `bytesSent` cursor.
pub struct OutgoingMessage {
    pub message: Message,
    pub message_number: u8,
    pub priority: u8,
    state: Mutex<OutgoingState>,
}

impl OutgoingMessage {
    pub fn new(
        message: Message,
        message_number: u8,
        priority: u8,
        header_override: Option<Vec<u8>>,
    ) -> Self {
        OutgoingMessage {
            message,
            message_number,
            priority,
            state: Mutex::new(OutgoingState {
                header_override,
                bytes_sent: 0,
            }),
        }
    }

    pub fn bytes_sent(&self) -> usize {
        self.state.lock().expect("outgoing mutex poisoned").bytes_sent
    }

    pub fn bytes_remaining(&self) -> usize {
        self.message.expected_length() - self.bytes_sent()
    }

    /// Bytes of payload available to forward right now: the gap between
    /// what the underlying message has received and what this send has
    /// already emitted. For a fully-buffered outgoing message the
    /// underlying message is complete up front, so this equals
    /// `bytesRemaining` until the last byte is sent.
    pub fn bytes_ready(&self) -> usize {
        self.message.bytes_received() - self.bytes_sent()
    }

    pub fn header(&self) -> Option<Vec<u8>> {
        let state = self.state.lock().expect("outgoing mutex poisoned");
        state.header_override.clone().or_else(|| self.message.header())
    }

    pub fn payload_slice(&self, offset: usize, len: usize) -> Vec<u8> {
        let payload = self.message.payload();
        payload[offset..offset + len].to_vec()
    }

    /// Advances `bytesSent` by `n`, returning the new value.
    pub fn advance(&self, n: usize) -> usize {
        let mut state = self.state.lock().expect("outgoing mutex poisoned");
        state.bytes_sent += n;
        state.bytes_sent
    }

    pub fn cancelled(&self) -> bool {
        self.message.cancelled()
    }
}

impl std::fmt::Debug for OutgoingMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutgoingMessage")
            .field("message_number", &self.message_number)
            .field("priority", &self.priority)
            .field("bytes_sent", &self.bytes_sent())
            .field("bytes_remaining", &self.bytes_remaining())
            .finish()
    }
}
