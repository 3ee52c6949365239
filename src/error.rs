//! Main Crate Error

#[derive(thiserror::Error, Debug)]
/// Multikad crate error enum.
pub enum Error {
    /// Indicates that an Id was constructed from a byte string of the wrong length.
    #[error("Invalid Id size, expected 20 bytes, got {0}")]
    InvalidIdSize(usize),

    /// Indicates that a hex string could not be decoded into an Id.
    #[error("Invalid Id encoding: {0}")]
    InvalidIdEncoding(String),

    /// Indicates that a prefix assignment would cover the entire Id width.
    #[error("Prefix length {0} out of range, must be less than 160 bits")]
    PrefixTooLong(usize),

    /// Indicates a zero bucket capacity in the configuration.
    #[error("Invalid bucket size: {0}")]
    InvalidBucketSize(usize),

    /// Indicates a zero lookup concurrency in the configuration.
    #[error("Invalid lookup concurrency: {0}")]
    InvalidConcurrency(usize),

    /// The node's actor thread is gone; no further operations are possible.
    #[error("Dht node has been shutdown")]
    Shutdown,
}

impl From<flume::RecvError> for Error {
    fn from(_: flume::RecvError) -> Self {
        Error::Shutdown
    }
}

impl<T> From<flume::SendError<T>> for Error {
    fn from(_: flume::SendError<T>) -> Self {
        Error::Shutdown
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
/// A single RPC to a remote node failed.
///
/// Transient by design: lookups drop the contact from their shortlist and
/// move on, replication treats stores as best-effort.
pub enum RpcError {
    /// The transport gave up waiting for a response.
    #[error("Request timed out")]
    Timeout,

    /// The endpoint could not be reached at all.
    #[error("Endpoint unreachable")]
    Unreachable,

    /// Any other transport-level failure.
    #[error("Rpc failed: {0}")]
    Other(String),
}
