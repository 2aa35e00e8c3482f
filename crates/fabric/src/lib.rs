//! Durable per-agent message delivery with manual acknowledgement, bounded
//! retry, and dead-lettering.

mod breaker;
mod broker;
mod notification;

pub use breaker::ErrorRateLimiter;
pub use broker::{queue_name, Broker, Delivery, MAX_RETRIES};
pub use notification::{Notification, NotificationType};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FabricError {
    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("recipient '{recipient}' does not own queue '{queue}'")]
    RecipientMismatch { recipient: String, queue: String },
    #[error("unknown delivery tag {0}")]
    UnknownDeliveryTag(u64),
}

impl FabricError {
    /// Whether a retry could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FabricError::TransportUnavailable(_) | FabricError::Storage(_)
        )
    }
}
