//! Source handler abstraction.
//!
//! A source handler opens readable byte streams over file ranges of a
//! scanned backend (local filesystem, object storage, ...) and removes
//! source objects after export. Handlers are resolved from the `kind`
//! tag on a `sources` row, so new backends plug in without touching the
//! pack pipeline.

mod local;

pub use local::LocalSource;

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncRead;

use crate::db::entities::source;

/// Source error types
#[derive(Error, Debug)]
pub enum SourceError {
    /// The backend could not serve the object right now; worth retrying
    #[error("source unavailable: {0}")]
    Unavailable(String),
    /// The object does not match its catalog record
    #[error("source corrupt: {0}")]
    Corrupt(String),
    /// IO error talking to the backend
    #[error("source IO error: {0}")]
    Io(#[from] std::io::Error),
    /// No handler is registered for the source kind
    #[error("unsupported source kind: {0}")]
    UnsupportedKind(String),
}

pub type SourceResult<T> = std::result::Result<T, SourceError>;

/// Readable byte stream over one file range.
pub type ByteStream = Box<dyn AsyncRead + Unpin + Send>;

/// Capability set over one source backend.
#[async_trait]
pub trait SourceHandler: Send + Sync {
    /// Open a stream over `[offset, offset + length)` of the object at
    /// `path`. The stream must yield exactly `length` bytes for an
    /// intact object; a shorter stream means the object is corrupt.
    async fn open(&self, path: &str, offset: u64, length: u64) -> SourceResult<ByteStream>;

    /// Remove the source object. Best effort; callers log failures and
    /// move on.
    async fn remove(&self, path: &str) -> SourceResult<()>;

    /// Opaque identifier of the object for logs.
    fn remote(&self, path: &str) -> String;
}

/// Resolves a catalog `sources` row to a handler for its backend.
#[async_trait]
pub trait HandlerResolver: Send + Sync {
    async fn resolve(&self, source: &source::Model) -> SourceResult<Arc<dyn SourceHandler>>;
}

/// Resolver for the built-in backends.
#[derive(Debug, Default)]
pub struct DefaultResolver;

#[async_trait]
impl HandlerResolver for DefaultResolver {
    async fn resolve(&self, source: &source::Model) -> SourceResult<Arc<dyn SourceHandler>> {
        match source.kind.as_str() {
            "local" => Ok(Arc::new(LocalSource::new(source.path.clone().into()))),
            other => Err(SourceError::UnsupportedKind(other.to_string())),
        }
    }
}
