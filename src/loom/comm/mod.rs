use thiserror::Error;

use super::device::Staging;

pub use local::{LocalComm, LocalRequest};

pub mod local;

#[derive(Debug, Error)]
pub enum CommError {
    #[error("rank {0} out of range for {1} ranks")]
    InvalidRank(usize, usize),
    #[error("peer rank {0} has disconnected")]
    Disconnected(usize),
    #[error("message from rank {peer} with tag {tag} has {len} bytes, buffer holds {expected}")]
    Truncated {
        peer: usize,
        tag: u32,
        len: usize,
        expected: usize,
    },
}

/// Non-blocking point-to-point communication between ranks.
pub trait Communicator: Send {
    /// Handle of an outstanding operation.
    type Request: Send;

    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    /// Starts sending the contents of `buf` to `dest`.
    /// The buffer must not be modified until the request completes.
    fn isend(&self, buf: &Staging, dest: usize, tag: u32) -> Result<Self::Request, CommError>;

    /// Starts receiving a message from `source` into `buf`.
    /// The buffer must not be accessed until the request completes.
    fn irecv(&self, buf: &Staging, source: usize, tag: u32) -> Result<Self::Request, CommError>;

    /// Blocks until every request completes.
    fn wait_all(&self, reqs: Vec<Self::Request>) -> Result<(), CommError>;
}
