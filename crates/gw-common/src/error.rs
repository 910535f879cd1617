//! Errors

use thiserror::Error;

/// Gateway engine error
#[derive(Debug, Error)]
pub enum Error {
    /// `TypeMapper::describe` was asked to describe a native field it cannot represent
    #[error("Unsupported native type: {0}")]
    UnsupportedType(String),
    /// A read/write was attempted against a buffer whose type does not match the attached channel
    #[error("Type mismatch: {0}")]
    TypeMismatch(String),
    /// `ChannelCache::lookup` could not open the upstream channel
    #[error("Upstream channel '{0}' unavailable")]
    UpstreamUnavailable(String),
    /// The upstream signalled that no more updates will ever arrive
    #[error("Upstream '{0}' terminated")]
    UpstreamTerminated(String),
    /// Caller misused the API, e.g. released a slot that was not in use
    #[error("Invalid usage: {0}")]
    InvalidUsage(String),
}

/// Convenience alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;
