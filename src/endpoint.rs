//! The external call being protected, and how its failures are classified.

use async_trait::async_trait;
use std::io;

/// Failures that are likely to succeed if the same call is made again later.
pub trait Transient {
    fn is_transient(&self) -> bool;
}

/// Failure of a single request to a remote API.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("connection reset by peer")]
    ConnectionReset,
    #[error("server responded with status {0}")]
    Status(u16),
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl Transient for TransportError {
    /// Timeouts, resets, 5xx and 429 are worth retrying; other statuses and undecodable
    /// responses will fail the same way again.
    fn is_transient(&self) -> bool {
        match self {
            Self::Timeout | Self::ConnectionReset => true,
            Self::Status(code) => *code == 429 || (500..600).contains(code),
            Self::Malformed(_) => false,
        }
    }
}

impl Transient for io::Error {
    fn is_transient(&self) -> bool {
        matches!(
            self.kind(),
            io::ErrorKind::TimedOut
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::ConnectionRefused
                | io::ErrorKind::Interrupted
                | io::ErrorKind::WouldBlock
                | io::ErrorKind::BrokenPipe
        )
    }
}

/// A remote operation taking a request descriptor `D`. One call is one attempt; retries
/// and admission are layered on top.
#[async_trait]
pub trait Endpoint<D>: Send + Sync
where
    D: Send + Sync,
{
    type Output: Send;
    type Error: std::error::Error + Transient + Send + Sync + 'static;

    async fn call(&self, descriptor: &D) -> Result<Self::Output, Self::Error>;
}

/// One page of a paginated listing: `limit` items starting at offset `start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageRequest {
    pub start: u64,
    pub limit: u64,
}

/// Split `total` items into pages of `page_size`; the last page is clamped to what remains.
///
/// Returns no pages when `total` or `page_size` is zero.
pub fn page_requests(total: u64, page_size: u64) -> Vec<PageRequest> {
    if page_size == 0 {
        return Vec::new();
    }
    (0..total)
        .step_by(usize::try_from(page_size).unwrap_or(usize::MAX))
        .map(|start| PageRequest { start, limit: page_size.min(total - start) })
        .collect()
}
