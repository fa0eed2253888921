//! Grid-specific error types

use thiserror::Error;

/// Errors that can occur in grid maintenance
#[derive(Error, Debug, Clone)]
pub enum GridError {
    #[error("Invalid grid configuration: {0}")]
    InvalidConfig(String),

    #[error("Order quantity rounds to zero at level {index} (price {price})")]
    QuantityTooSmall { index: i32, price: f64 },

    #[error("Gateway error: {0}")]
    Gateway(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Exchange snapshot disagrees with local grid: {0}")]
    StaleData(String),

    #[error("No engine registered for symbol {0}")]
    UnknownSymbol(String),

    #[error("Order operation failed after {attempts} attempts: {reason}")]
    RetriesExhausted { attempts: u32, reason: String },

    #[error("Shutdown in progress")]
    ShuttingDown,

    #[error("Channel send error: {0}")]
    ChannelSend(String),
}

impl GridError {
    /// Configuration problems exclude the symbol but never stop the run
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            GridError::InvalidConfig(_) | GridError::QuantityTooSmall { .. }
        )
    }

    /// Errors that must abort the whole run when seen at startup
    pub fn is_fatal(&self) -> bool {
        matches!(self, GridError::Authentication(_))
    }

    /// Whether retrying the same request could succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, GridError::Gateway(_) | GridError::RateLimited(_))
    }
}

/// Result type for grid operations
pub type GridResult<T> = std::result::Result<T, GridError>;
