use std::time::Duration;

/// Errors surfaced by the engine and its adapters.
///
/// Transport-level failures of an *attempted* operation are not reported
/// through this type: they come back as a failed [`Response`](crate::Response)
/// with `success = false` and a populated `error` field, and they are credited
/// to the metrics aggregator. `Error` covers the cases where an operation
/// could not be meaningfully attempted at all; those never advance metrics.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A mandatory field was empty or malformed (URL, connection string, ...).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A connection registry or the request queue is at capacity.
    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// DNS resolution, connect or socket I/O failed.
    #[error("transport failed: {0}")]
    TransportFailed(String),

    /// A deadline expired before the operation completed.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The peer reset or closed the connection mid-operation.
    #[error("connection closed by peer")]
    PeerClosed,

    /// Unexpected framing or a short read on the wire.
    #[error("protocol error: {0}")]
    ProtocolError(String),

    /// The operation requires an established connection entry.
    #[error("not connected: {0}")]
    NotConnected(String),

    /// A predicate evaluated to false. Reported, never fatal to a run.
    #[error("assertion failed: {0}")]
    AssertionFailed(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// The HTTP-flavoured status code a failed response carries for this
    /// error kind, mirroring the wire-level conventions of the adapters.
    pub(crate) fn status_code(&self) -> u16 {
        match self {
            Error::InvalidArgument(_) | Error::NotConnected(_) => 400,
            Error::Timeout(_) => 408,
            Error::PeerClosed => 410,
            Error::AssertionFailed(_) => 417,
            Error::TransportFailed(msg) if msg.contains("resolve") => 404,
            _ => 500,
        }
    }
}
