//! Error types for event bus operations

/// Error types for event bus operations
#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    /// Bus was already shut down when publish was attempted
    #[error("Event bus shutdown")]
    Shutdown,

    /// Subscriber id did not match a registered subscriber
    #[error("Unknown subscriber id {0}")]
    UnknownSubscriber(u64),
}
