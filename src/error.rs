//! Engine-wide error handling
//!
//! Subsystems define their own error enums where the failure modes are
//! local (network, assets); this module holds the crate-level error used
//! at the engine facade and the helpers shared by all of them.

use crate::net::NetError;

/// Result type for engine-level operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors surfaced by the engine facade
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Invalid travel URL: {url}")]
    InvalidUrl { url: String },

    #[error("Package not found: {name}")]
    PackageNotFound { name: String },

    #[error("Package '{name}' is not a level")]
    PackageNotALevel { name: String },

    #[error("Cannot spawn abstract class '{class}'")]
    AbstractClass { class: String },

    #[error("World is not initialized")]
    WorldNotInitialized,

    #[error("Travel refused: {reason}")]
    TravelRefused { reason: String },

    #[error("Network error: {0}")]
    Net(#[from] NetError),
}
