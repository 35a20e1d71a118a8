use thiserror::Error;
use tokio::time::error::Elapsed;

/// Errors this crate surfaces, following the teacher's flat `thiserror`
/// enum shape (one variant per failure mode, `#[from]` conversions for
/// collaborator error types).
///
/// `ApplicationMisuse`-class variants (`PriorityOutOfRange`,
/// `HeaderOnIncoming`, `NewMessageAtMessageLevel`, `NotInQueue`) are
/// returned synchronously to the caller. Everything else funnels through
/// `Connection::force_close` and is surfaced to `wait_close()` as a reason
/// string rather than returned from the call that triggered it.
#[derive(Error, Debug)]
pub enum Error {
    #[error("underlying transport closed")]
    TransportClosed,

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("no message numbers available and the remote peer cannot cancel")]
    BackpressureExhausted,

    #[error("remote side did not respond to a ping")]
    LivenessTimeout,

    #[error("priority {0} is out of range (configured levels: {1})")]
    PriorityOutOfRange(u8, u8),

    #[error("cannot set a header override on an incoming message")]
    HeaderOnIncoming,

    #[error("NewMessage callbacks may only be registered at connection level")]
    NewMessageAtMessageLevel,

    #[error("message is not present in the send queue")]
    NotInQueue,

    #[error("channel communication error")]
    CommunicationError,

    #[error("{source}")]
    Timeout {
        #[from]
        source: Elapsed,
    },

    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}
