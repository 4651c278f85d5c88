//! Error types shared by every sync component.

use thiserror::Error;

/// Errors raised while talking to either side of the sync.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Credential refresh failed or no refresh token is configured.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// An upstream API answered with a non-success status.
    #[error("{service} error ({status}): {message}")]
    Upstream {
        service: &'static str,
        status: u16,
        message: String,
    },

    /// HTTP transport failure
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The platform closed a change-feed subscription.
    #[error("Subscription closed: {0}")]
    SubscriptionClosed(String),

    /// The platform reported that the subscribed view is out of date.
    #[error("Subscription data is out of date")]
    DataStale,

    #[error("Not found: {0}")]
    NotFound(String),

    /// A payload could not be decoded into the expected shape.
    #[error("Failed to decode {what}: {message}")]
    Decode { what: &'static str, message: String },
}

impl SyncError {
    pub(crate) fn decode(what: &'static str, err: impl std::fmt::Display) -> Self {
        SyncError::Decode {
            what,
            message: err.to_string(),
        }
    }

    /// Whether the next timer tick should simply try again.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SyncError::Upstream { .. }
                | SyncError::Request(_)
                | SyncError::SubscriptionClosed(_)
                | SyncError::DataStale
        )
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
