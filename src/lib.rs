//! Preemptive priority-multiplexed message transport over a framed
//! byte-stream (conceptually, a WebSocket: each underlying send/receive is
//! one atomic binary frame of known length).
//!
//! Multiplexes up to 16 in-flight messages per connection with priority
//! preemption, explicit bandwidth shaping, in-band bandwidth/RTT
//! estimation, ping/pong liveness detection, streaming forwarding of
//! partially-received messages, capability negotiation, and message
//! cancellation, on top of a transport assumed reliable and ordered while
//! open.

pub mod binary;
pub mod callback;
pub mod capability;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod estimator;
pub mod frame;
pub mod message;
pub mod queue;
pub mod socket;

pub use callback::MessageEvent;
pub use capability::CapabilitySet;
pub use config::TransportConfig;
pub use connection::Connection;
pub use error::Error;
pub use message::{Message, OutgoingMessage};
pub use socket::FramedSocket;
