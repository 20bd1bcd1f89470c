//! Error types for the provider directory
//!
//! This module defines all error types using anyhow for consistent error handling
//! throughout the application.

/// Result type alias for convenience
pub type Result<T> = anyhow::Result<T>;

/// Custom error types for specific directory scenarios
#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("Provider store unavailable: {message}")]
    StoreUnavailable { message: String },

    #[error("Change feed disconnected: {message}")]
    FeedDisconnected { message: String },

    #[error("Provider not found: {provider_id}")]
    ProviderNotFound { provider_id: String },

    #[error("Invalid change message: {reason}")]
    InvalidChangeMessage { reason: String },

    #[error("Configuration error: {message}")]
    ConfigurationError { message: String },

    #[error("Internal service error: {message}")]
    InternalError { message: String },
}

impl DirectoryError {
    /// Whether the error came from the backing store
    pub fn is_store_unavailable(error: &anyhow::Error) -> bool {
        matches!(
            error.downcast_ref::<DirectoryError>(),
            Some(DirectoryError::StoreUnavailable { .. })
        )
    }

    /// Whether the error means the change feed is gone
    pub fn is_feed_disconnected(error: &anyhow::Error) -> bool {
        matches!(
            error.downcast_ref::<DirectoryError>(),
            Some(DirectoryError::FeedDisconnected { .. })
        )
    }
}
