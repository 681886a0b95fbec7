use std::fmt;

use bluest::Uuid;

/// The phases of a session that run under their own timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Connecting,
    ResolvingServices,
    Subscribing,
    AwaitingResponse,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Connecting => "connecting",
            Phase::ResolvingServices => "resolving services",
            Phase::Subscribing => "subscribing to notifications",
            Phase::AwaitingResponse => "awaiting a response",
        };
        f.write_str(name)
    }
}

/// Everything a fetch can fail with.
///
/// Transport and decode failures are folded into one of these kinds at the
/// session boundary, and the link is torn down before the error is returned.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("device {0} not found")]
    DeviceNotFound(String),

    #[error("timed out while {phase}")]
    ConnectionTimeout { phase: Phase },

    #[error("connection error: {0}")]
    ConnectionError(String),

    #[error("characteristic {uuid} not found")]
    CharacteristicNotFound { uuid: Uuid },

    #[error("write still busy after {attempts} attempts")]
    WriteRetriesExhausted { attempts: u32 },

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("unsupported adapter: {0}")]
    UnsupportedAdapter(String),

    /// A plan entry the adapter cannot encode as a request.
    #[error("invalid command: {0}")]
    InvalidCommand(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// A failure reported by a radio backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct TransportError(pub String);

impl TransportError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// The outcome of a failed characteristic write.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WriteError {
    /// Another operation is still in progress on the link; the same payload
    /// may be written again.
    #[error("operation in progress")]
    Busy,

    #[error("write failed: {0}")]
    Failed(String),
}

#[test]
fn test_error_display() {
    assert_eq!(
        Error::ConnectionTimeout { phase: Phase::Connecting }.to_string(),
        "timed out while connecting"
    );
    assert_eq!(
        Error::WriteRetriesExhausted { attempts: 5 }.to_string(),
        "write still busy after 5 attempts"
    );
    assert_eq!(
        Error::DeviceNotFound("A4:C1:38:0B:79:22".into()).to_string(),
        "device A4:C1:38:0B:79:22 not found"
    );
}

#[test]
fn test_error_is_send_sync() {
    fn assert_send_sync<T: Send + Sync + std::error::Error>() {}
    assert_send_sync::<Error>();
    assert_send_sync::<TransportError>();
    assert_send_sync::<WriteError>();
}
