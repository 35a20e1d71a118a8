//! Event-mask-filtered callback registration and firing.

use crate::message::Message;
use bitflags::bitflags;
use std::fmt;
use std::sync::Arc;

bitflags! {
    /// Message life-cycle events. `fire` passes the full occurred-set to
    /// every callback whose filter intersects it, not just the bit that
    /// triggered the call.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MessageEvent: u8 {
        const NEW_MESSAGE = 0b0001;
        const PAYLOAD_RECEIVED = 0b0010;
        const COMPLETE = 0b0100;
        const CANCELLED = 0b1000;
        const ALL = Self::NEW_MESSAGE.bits()
            | Self::PAYLOAD_RECEIVED.bits()
            | Self::COMPLETE.bits()
            | Self::CANCELLED.bits();
    }
}

impl Default for MessageEvent {
    fn default() -> Self {
        MessageEvent::COMPLETE
    }
}

/// Registered against either a single `Message` (message-level registry) or
/// a `Connection` (connection-level registry, fired for every message that
/// reaches dispatch). Always receives the triggering message itself, not
/// just the mask, since that is the only way a connection-level NewMessage
/// handler can get a handle to read or forward it.
pub type Callback = Arc<dyn Fn(Message, MessageEvent) + Send + Sync>;

#[derive(Clone)]
struct Registration {
    filter: MessageEvent,
    callback: Callback,
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration").field("filter", &self.filter).finish()
    }
}

/// An ordered list of (filter, callback) pairs. `fire` invokes, in
/// registration order, every callback whose filter intersects the events
/// that occurred.
#[derive(Debug, Default, Clone)]
pub struct CallbackRegistry {
    registrations: Vec<Registration>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        CallbackRegistry {
            registrations: Vec::new(),
        }
    }

    pub fn register(&mut self, filter: MessageEvent, callback: Callback) {
        self.registrations.push(Registration { filter, callback });
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    /// Invokes every callback whose filter intersects `events_occurred`,
    /// in registration order, passing the message and the full
    /// occurred-set. A panicking callback is caught so it cannot take down
    /// a cooperating loop.
    pub fn fire(&self, message: &Message, events_occurred: MessageEvent) {
        for registration in &self.registrations {
            if registration.filter.intersects(events_occurred) {
                let callback = registration.callback.clone();
                let message = message.clone();
                if let Err(payload) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    callback(message, events_occurred)
                })) {
                    let message = payload
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| payload.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "non-string panic payload".to_string());
                    log::error!("message callback panicked: {message}");
                }
            }
        }
    }
}
