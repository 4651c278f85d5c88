//! Bearer credential cache with serialized refresh.
//!
//! Refreshing rotates the refresh token on the streaming service. Two
//! callers refreshing independently with the same captured refresh token
//! would each get a grant and then invalidate each other, leaving the stored
//! chain broken. The record therefore lives behind an async mutex that is
//! held for the whole refresh: a concurrent caller waits for the in-flight
//! refresh and then reads its result.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Result, SyncError};

/// Current bearer credential. Replaced wholesale on refresh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
    pub scope: String,
}

impl CredentialRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Result of a refresh call against the token endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    /// Omitted when the endpoint keeps the previous refresh token valid.
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Seconds
    pub expires_in: i64,
    #[serde(default)]
    pub scope: Option<String>,
}

/// Something that can exchange a refresh token for a new access token.
#[async_trait]
pub trait TokenEndpoint: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant>;
}

pub struct CredentialCache {
    record: Mutex<CredentialRecord>,
    endpoint: Arc<dyn TokenEndpoint>,
}

impl CredentialCache {
    pub fn new(record: CredentialRecord, endpoint: Arc<dyn TokenEndpoint>) -> Self {
        Self {
            record: Mutex::new(record),
            endpoint,
        }
    }

    /// Seed the cache from configured tokens. The expiry of a configured
    /// access token is unknown, so the first call refreshes.
    pub fn from_tokens(
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
        scope: impl Into<String>,
        endpoint: Arc<dyn TokenEndpoint>,
    ) -> Self {
        Self::new(
            CredentialRecord {
                access_token: access_token.into(),
                refresh_token: refresh_token.into(),
                expires_at: Utc::now(),
                scope: scope.into(),
            },
            endpoint,
        )
    }

    /// Return a valid credential, refreshing it first when expired.
    pub async fn get_credential(&self) -> Result<CredentialRecord> {
        let mut record = self.record.lock().await;
        if !record.is_expired(Utc::now()) {
            return Ok(record.clone());
        }

        if record.refresh_token.is_empty() {
            return Err(SyncError::Auth("no refresh token configured".to_string()));
        }

        debug!("Access token expired, refreshing");
        let requested_at = Utc::now();
        let grant = self.endpoint.refresh(&record.refresh_token).await.map_err(|e| {
            warn!(error = %e, "Token refresh failed");
            match e {
                SyncError::Auth(msg) => SyncError::Auth(msg),
                other => SyncError::Auth(other.to_string()),
            }
        })?;

        let refreshed = CredentialRecord {
            access_token: grant.access_token,
            refresh_token: grant
                .refresh_token
                .unwrap_or_else(|| record.refresh_token.clone()),
            expires_at: requested_at + Duration::seconds(grant.expires_in),
            scope: grant.scope.unwrap_or_else(|| record.scope.clone()),
        };
        *record = refreshed.clone();
        info!(expires_at = %refreshed.expires_at, "Access token refreshed");

        Ok(refreshed)
    }

    /// Shortcut for the bearer header value.
    pub async fn access_token(&self) -> Result<String> {
        Ok(self.get_credential().await?.access_token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Rotates the refresh token on every call and rejects stale ones.
    struct RotatingEndpoint {
        calls: AtomicUsize,
        current: std::sync::Mutex<String>,
    }

    impl RotatingEndpoint {
        fn new(initial: &str) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                current: std::sync::Mutex::new(initial.to_string()),
            }
        }
    }

    #[async_trait]
    impl TokenEndpoint for RotatingEndpoint {
        async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant> {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            let mut current = self.current.lock().unwrap();
            if *current != refresh_token {
                return Err(SyncError::Auth("invalid_grant".to_string()));
            }
            *current = format!("refresh-{n}");
            Ok(TokenGrant {
                access_token: format!("access-{n}"),
                refresh_token: Some(current.clone()),
                expires_in: 3600,
                scope: None,
            })
        }
    }

    struct FailingEndpoint;

    #[async_trait]
    impl TokenEndpoint for FailingEndpoint {
        async fn refresh(&self, _refresh_token: &str) -> Result<TokenGrant> {
            Err(SyncError::Upstream {
                service: "accounts",
                status: 500,
                message: "boom".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn test_refreshes_expired_record_once() {
        let endpoint = Arc::new(RotatingEndpoint::new("refresh-0"));
        let cache = CredentialCache::from_tokens("stale", "refresh-0", "scope", endpoint.clone());

        let first = cache.get_credential().await.unwrap();
        assert_eq!(first.access_token, "access-1");
        assert_eq!(first.refresh_token, "refresh-1");

        let second = cache.get_credential().await.unwrap();
        assert_eq!(second, first);
        assert_eq!(endpoint.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_refresh() {
        let endpoint = Arc::new(RotatingEndpoint::new("refresh-0"));
        let cache = Arc::new(CredentialCache::from_tokens(
            "stale",
            "refresh-0",
            "scope",
            endpoint.clone(),
        ));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.get_credential().await })
            })
            .collect();

        for handle in handles {
            let record = handle.await.unwrap().unwrap();
            assert_eq!(record.access_token, "access-1");
        }
        assert_eq!(endpoint.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_refresh_token_is_auth_error() {
        let cache = CredentialCache::from_tokens("a", "", "scope", Arc::new(FailingEndpoint));
        let err = cache.get_credential().await.unwrap_err();
        assert!(matches!(err, SyncError::Auth(_)));
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_record_for_retry() {
        let cache = CredentialCache::from_tokens("a", "r", "scope", Arc::new(FailingEndpoint));
        assert!(matches!(cache.get_credential().await, Err(SyncError::Auth(_))));
        // Still expired with the same refresh token, so the next call retries.
        assert!(matches!(cache.get_credential().await, Err(SyncError::Auth(_))));
        assert_eq!(cache.record.lock().await.refresh_token, "r");
    }

    #[tokio::test]
    async fn test_keeps_refresh_token_when_grant_omits_it() {
        struct NoRotation;

        #[async_trait]
        impl TokenEndpoint for NoRotation {
            async fn refresh(&self, _refresh_token: &str) -> Result<TokenGrant> {
                Ok(TokenGrant {
                    access_token: "fresh".to_string(),
                    refresh_token: None,
                    expires_in: 60,
                    scope: Some("user-read-currently-playing".to_string()),
                })
            }
        }

        let cache = CredentialCache::from_tokens("a", "keep-me", "old", Arc::new(NoRotation));
        let record = cache.get_credential().await.unwrap();
        assert_eq!(record.refresh_token, "keep-me");
        assert_eq!(record.scope, "user-read-currently-playing");
    }
}
