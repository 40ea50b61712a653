//! Platform adapter abstraction and implementations
//!
//! Each supported platform implements [`PlatformAdapter`], which covers the
//! full credential lifecycle (authorization URL, code exchange, token
//! refresh) plus publishing. Adapters translate provider responses into
//! [`PlatformError`] classifications; workers act only on the
//! classification and never see raw HTTP responses.

use async_trait::async_trait;
use secrecy::SecretString;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::Config;
use crate::error::{PlatformError, Result};
use crate::types::{Platform, Post, SocialAccount};

pub mod facebook;
pub mod instagram;
pub mod tiktok;

// Mock adapter is available for all builds to support integration tests
pub mod mock;

/// Tokens obtained from a code exchange or refresh.
pub struct TokenGrant {
    pub access_token: SecretString,
    pub refresh_token: Option<SecretString>,
    /// Absolute expiry timestamp, when the provider reports one.
    pub expires_at: Option<i64>,
    /// The provider-side account id, when the token response carries one
    /// (TikTok returns its `open_id`; the Graph exchange does not).
    pub provider_account_id: Option<String>,
}

/// Result of a successful publish.
#[derive(Debug, Clone)]
pub struct PublishReceipt {
    pub platform_post_id: String,
}

/// Unified interface over remote publishing platforms.
///
/// `publish` receives an idempotency key derived from the target and its
/// attempt count; adapters forward it so a retried request that already
/// landed remotely is deduplicated by the provider where supported.
#[async_trait]
pub trait PlatformAdapter: Send + Sync {
    fn platform(&self) -> Platform;

    /// Build the URL the account owner visits to authorize access.
    fn auth_url(&self, redirect_uri: &str, state: &str) -> String;

    /// Exchange an authorization code for tokens.
    async fn exchange_code(&self, code: &str, redirect_uri: &str) -> Result<TokenGrant>;

    /// Exchange a refresh token (or long-lived token) for fresh tokens.
    async fn refresh(&self, refresh_token: &SecretString) -> Result<TokenGrant>;

    /// Publish a post to the given account.
    async fn publish(
        &self,
        access_token: &SecretString,
        account: &SocialAccount,
        post: &Post,
        idempotency_key: &str,
    ) -> Result<PublishReceipt>;
}

/// Adapters keyed by platform.
pub type AdapterSet = HashMap<Platform, Arc<dyn PlatformAdapter>>;

/// Build the adapter set from configuration. Platforms without app
/// credentials configured are simply absent from the set; targets for
/// them fail at dispatch with a clear error rather than at startup.
pub fn create_adapters(config: &Config) -> AdapterSet {
    let mut adapters: AdapterSet = HashMap::new();

    if let Some(fb) = &config.facebook {
        adapters.insert(
            Platform::Facebook,
            Arc::new(facebook::FacebookAdapter::new(
                fb.app_id.clone(),
                fb.app_secret.clone(),
            )),
        );
        // Instagram publishing rides on the same Graph app
        adapters.insert(
            Platform::Instagram,
            Arc::new(instagram::InstagramAdapter::new(
                fb.app_id.clone(),
                fb.app_secret.clone(),
            )),
        );
    }

    if let Some(tt) = &config.tiktok {
        adapters.insert(
            Platform::TikTok,
            Arc::new(tiktok::TikTokAdapter::new(
                tt.client_key.clone(),
                tt.client_secret.clone(),
            )),
        );
    }

    adapters
}

/// Classify an HTTP response status into a platform error.
pub(crate) fn classify_status(status: reqwest::StatusCode, body: &str) -> PlatformError {
    let detail = if body.is_empty() {
        status.to_string()
    } else {
        format!("{}: {}", status, truncate(body, 300))
    };

    if status.as_u16() == 429 {
        PlatformError::RateLimit(detail)
    } else if status.as_u16() == 401 || status.as_u16() == 403 {
        PlatformError::InvalidToken(detail)
    } else if status.is_client_error() {
        PlatformError::Rejected(detail)
    } else {
        PlatformError::Remote(detail)
    }
}

/// Classify a transport-level failure.
pub(crate) fn classify_request_error(e: reqwest::Error) -> PlatformError {
    if e.is_timeout() {
        PlatformError::Timeout(e.to_string())
    } else {
        PlatformError::Network(e.to_string())
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_rate_limit() {
        let err = classify_status(reqwest::StatusCode::TOO_MANY_REQUESTS, "slow down");
        assert!(matches!(err, PlatformError::RateLimit(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_classify_auth_failures() {
        for status in [
            reqwest::StatusCode::UNAUTHORIZED,
            reqwest::StatusCode::FORBIDDEN,
        ] {
            let err = classify_status(status, "");
            assert!(matches!(err, PlatformError::InvalidToken(_)));
            assert!(!err.is_retryable());
        }
    }

    #[test]
    fn test_classify_client_error_is_terminal() {
        let err = classify_status(reqwest::StatusCode::BAD_REQUEST, "unsupported media");
        assert!(matches!(err, PlatformError::Rejected(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_classify_server_error_is_retryable() {
        for status in [
            reqwest::StatusCode::INTERNAL_SERVER_ERROR,
            reqwest::StatusCode::BAD_GATEWAY,
            reqwest::StatusCode::SERVICE_UNAVAILABLE,
        ] {
            let err = classify_status(status, "");
            assert!(matches!(err, PlatformError::Remote(_)));
            assert!(err.is_retryable());
        }
    }

    #[test]
    fn test_error_detail_is_truncated() {
        let long_body = "x".repeat(1000);
        let err = classify_status(reqwest::StatusCode::BAD_REQUEST, &long_body);
        assert!(format!("{}", err).len() < 400);
    }

    #[test]
    fn test_create_adapters_from_config() {
        let mut config = Config::default_config();
        config.facebook = Some(crate::config::FacebookAppConfig {
            app_id: "app".to_string(),
            app_secret: "secret".to_string(),
        });

        let adapters = create_adapters(&config);
        assert!(adapters.contains_key(&Platform::Facebook));
        assert!(adapters.contains_key(&Platform::Instagram));
        assert!(!adapters.contains_key(&Platform::TikTok));
    }
}
