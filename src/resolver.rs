// src/resolver.rs

use crate::models::Request;
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors reported by a resolver or by a running transfer.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("source not found: {0}")]
    NotFound(String),
    #[error("HTTP {status} fetching {url}")]
    Http { url: String, status: u16 },
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(std::io::Error),
    #[error("out of storage: {0}")]
    ResourceExhausted(String),
    #[error("{0}")]
    Other(String),
}

impl From<std::io::Error> for ResolveError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::StorageFull {
            ResolveError::ResourceExhausted(err.to_string())
        } else {
            ResolveError::Io(err)
        }
    }
}

impl ResolveError {
    pub fn is_resource_exhausted(&self) -> bool {
        matches!(self, ResolveError::ResourceExhausted(_))
    }
}

/// Events emitted by a transfer stream.
#[derive(Debug)]
pub enum TransferEvent {
    /// The resolver is provisioning external tooling before the transfer.
    BinariesAcquiring,
    BinariesAcquired,
    Progress {
        percent: f64,
        transferred: u64,
        total: Option<u64>,
    },
    Error(ResolveError),
    Complete,
}

pub type TransferSender = mpsc::UnboundedSender<TransferEvent>;
pub type TransferReceiver = mpsc::UnboundedReceiver<TransferEvent>;

pub fn transfer_channel() -> (TransferSender, TransferReceiver) {
    mpsc::unbounded_channel()
}

/// Control side of a running transfer. Signals are synchronous; any
/// teardown the stream performs afterwards happens in the background.
pub trait TransferHandle: Send + Sync {
    fn pause(&self);
    fn resume(&self);
    /// Stops the transfer for good and discards partial output.
    fn destroy(&self);
}

/// Turns a request into a running transfer.
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Locates the source and begins the transfer, reporting through `events`.
    async fn resolve(
        &self,
        request: &Request,
        events: TransferSender,
    ) -> Result<Box<dyn TransferHandle>, ResolveError>;
}
