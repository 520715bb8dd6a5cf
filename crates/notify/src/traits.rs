//! Notifier trait definition and shared error types.

use std::collections::HashMap;

/// Errors that can occur during notification delivery.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Template rendering failed: {0}")]
    Template(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Rate limited: retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Rejected by channel (HTTP {status}): {description}")]
    Rejected { status: u16, description: String },
}

impl NotifyError {
    /// Seconds the channel asked us to wait, if it rate limited the send.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            NotifyError::RateLimited { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        }
    }
}

/// A rendered notification ready for delivery.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Notification {
    /// The rendered subject/title.
    pub subject: String,
    /// The rendered body content.
    pub body: String,
    /// Additional metadata (e.g., severity, rule type).
    pub metadata: HashMap<String, String>,
}

/// Trait for notification channel implementations.
#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver a notification to one recipient through this channel.
    async fn send(&self, recipient: &str, notification: &Notification) -> Result<(), NotifyError>;

    /// Test connectivity with a sample notification.
    async fn test(&self, recipient: &str) -> Result<(), NotifyError> {
        let test_notification = Notification {
            subject: "[TEST] pvwatch".to_string(),
            body: "This is a test notification from pvwatch alarm monitoring.".to_string(),
            metadata: HashMap::from([("event".to_string(), "test".to_string())]),
        };
        self.send(recipient, &test_notification).await
    }

    /// Human-readable name for this channel (e.g., "telegram").
    fn channel_name(&self) -> &str;
}

/// Result of delivering one intent to one recipient on one channel.
#[derive(Debug)]
pub struct DispatchResult {
    pub channel: String,
    pub recipient: String,
    pub alarm_key: String,
    pub success: bool,
    pub error: Option<String>,
    /// Set when the channel rate limited this send.
    pub retry_after_secs: Option<u64>,
    pub duration_ms: u64,
}
