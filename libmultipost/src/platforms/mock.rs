//! Mock platform adapter for testing
//!
//! A scriptable adapter that replays a queue of publish and refresh
//! outcomes, recording every call for later verification. Integration
//! tests use it to exercise claim, retry, and refresh logic without
//! network access or real credentials.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;

use crate::error::{PlatformError, Result};
use crate::platforms::{PlatformAdapter, PublishReceipt, TokenGrant};
use crate::types::{Platform, Post, SocialAccount};

/// A recorded publish invocation.
#[derive(Debug, Clone)]
pub struct PublishCall {
    pub account_id: String,
    pub post_id: String,
    pub idempotency_key: String,
}

/// Scripted outcome of a refresh call.
#[derive(Debug, Clone)]
pub struct RefreshOutcome {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<i64>,
}

pub struct MockAdapter {
    platform: Platform,
    /// Scripted publish outcomes, consumed front to back. When empty,
    /// publishes succeed with a generated post id.
    publish_script: Mutex<VecDeque<std::result::Result<String, PlatformError>>>,
    /// Scripted refresh outcomes. When empty, refreshes succeed with a
    /// generic grant.
    refresh_script: Mutex<VecDeque<std::result::Result<RefreshOutcome, PlatformError>>>,
    publish_calls: Arc<Mutex<Vec<PublishCall>>>,
    refresh_calls: Arc<Mutex<usize>>,
    delay: Duration,
}

impl MockAdapter {
    pub fn new(platform: Platform) -> Self {
        Self {
            platform,
            publish_script: Mutex::new(VecDeque::new()),
            refresh_script: Mutex::new(VecDeque::new()),
            publish_calls: Arc::new(Mutex::new(Vec::new())),
            refresh_calls: Arc::new(Mutex::new(0)),
            delay: Duration::from_millis(0),
        }
    }

    /// An adapter that always publishes successfully
    pub fn success(platform: Platform) -> Self {
        Self::new(platform)
    }

    /// An adapter whose next publishes fail with the given errors, then
    /// succeed
    pub fn fail_then_succeed(platform: Platform, errors: Vec<PlatformError>) -> Self {
        let adapter = Self::new(platform);
        for e in errors {
            adapter.push_publish_outcome(Err(e));
        }
        adapter
    }

    /// An adapter that fails every publish with the given error
    pub fn always_fail(platform: Platform, error: PlatformError) -> Self {
        let adapter = Self::new(platform);
        // Enough repeats to outlast any retry policy under test
        for _ in 0..100 {
            adapter.push_publish_outcome(Err(error.clone()));
        }
        adapter
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn push_publish_outcome(&self, outcome: std::result::Result<String, PlatformError>) {
        self.publish_script.lock().unwrap().push_back(outcome);
    }

    pub fn push_refresh_outcome(
        &self,
        outcome: std::result::Result<RefreshOutcome, PlatformError>,
    ) {
        self.refresh_script.lock().unwrap().push_back(outcome);
    }

    pub fn publish_calls(&self) -> Vec<PublishCall> {
        self.publish_calls.lock().unwrap().clone()
    }

    pub fn refresh_call_count(&self) -> usize {
        *self.refresh_calls.lock().unwrap()
    }
}

#[async_trait]
impl PlatformAdapter for MockAdapter {
    fn platform(&self) -> Platform {
        self.platform
    }

    fn auth_url(&self, redirect_uri: &str, state: &str) -> String {
        format!(
            "https://mock.example/{}/auth?redirect_uri={}&state={}",
            self.platform, redirect_uri, state
        )
    }

    async fn exchange_code(&self, code: &str, _redirect_uri: &str) -> Result<TokenGrant> {
        Ok(TokenGrant {
            access_token: SecretString::from(format!("mock-access-{}", code)),
            refresh_token: Some(SecretString::from(format!("mock-refresh-{}", code))),
            expires_at: Some(chrono::Utc::now().timestamp() + 3600),
            provider_account_id: Some(format!("mock-account-{}", code)),
        })
    }

    async fn refresh(&self, refresh_token: &SecretString) -> Result<TokenGrant> {
        *self.refresh_calls.lock().unwrap() += 1;

        let scripted = self.refresh_script.lock().unwrap().pop_front();
        match scripted {
            Some(Ok(outcome)) => Ok(TokenGrant {
                access_token: SecretString::from(outcome.access_token),
                refresh_token: outcome.refresh_token.map(SecretString::from),
                expires_at: outcome.expires_at,
                provider_account_id: None,
            }),
            Some(Err(e)) => Err(e.into()),
            None => Ok(TokenGrant {
                access_token: SecretString::from(format!(
                    "refreshed-{}",
                    refresh_token.expose_secret()
                )),
                refresh_token: None,
                expires_at: Some(chrono::Utc::now().timestamp() + 3600),
                provider_account_id: None,
            }),
        }
    }

    async fn publish(
        &self,
        _access_token: &SecretString,
        account: &SocialAccount,
        post: &Post,
        idempotency_key: &str,
    ) -> Result<PublishReceipt> {
        if self.delay > Duration::from_millis(0) {
            sleep(self.delay).await;
        }

        self.publish_calls.lock().unwrap().push(PublishCall {
            account_id: account.id.clone(),
            post_id: post.id.clone(),
            idempotency_key: idempotency_key.to_string(),
        });

        let scripted = self.publish_script.lock().unwrap().pop_front();
        match scripted {
            Some(Ok(id)) => Ok(PublishReceipt {
                platform_post_id: id,
            }),
            Some(Err(e)) => Err(e.into()),
            None => Ok(PublishReceipt {
                platform_post_id: format!("{}_{}", self.platform, idempotency_key),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MultipostError;

    fn account() -> SocialAccount {
        SocialAccount::new(
            "user-1".to_string(),
            Platform::Facebook,
            "page-1".to_string(),
        )
    }

    #[tokio::test]
    async fn test_default_publish_succeeds() {
        let adapter = MockAdapter::success(Platform::Facebook);
        let post = Post::new("user-1".to_string(), "hello".to_string());
        let token = SecretString::from("tok".to_string());

        let receipt = adapter
            .publish(&token, &account(), &post, "t-1:1")
            .await
            .unwrap();
        assert_eq!(receipt.platform_post_id, "facebook_t-1:1");
        assert_eq!(adapter.publish_calls().len(), 1);
        assert_eq!(adapter.publish_calls()[0].idempotency_key, "t-1:1");
    }

    #[tokio::test]
    async fn test_scripted_failures_are_consumed_in_order() {
        let adapter = MockAdapter::fail_then_succeed(
            Platform::Instagram,
            vec![PlatformError::RateLimit("429".to_string())],
        );
        let post = Post::new("user-1".to_string(), "hello".to_string());
        let token = SecretString::from("tok".to_string());

        let err = adapter
            .publish(&token, &account(), &post, "t-1:1")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            MultipostError::Platform(PlatformError::RateLimit(_))
        ));

        assert!(adapter.publish(&token, &account(), &post, "t-1:2").await.is_ok());
        assert_eq!(adapter.publish_calls().len(), 2);
    }

    #[tokio::test]
    async fn test_scripted_refresh() {
        let adapter = MockAdapter::new(Platform::TikTok);
        adapter.push_refresh_outcome(Ok(RefreshOutcome {
            access_token: "new-access".to_string(),
            refresh_token: Some("new-refresh".to_string()),
            expires_at: Some(12345),
        }));

        let grant = adapter
            .refresh(&SecretString::from("old".to_string()))
            .await
            .unwrap();
        assert_eq!(grant.access_token.expose_secret(), "new-access");
        assert_eq!(grant.expires_at, Some(12345));
        assert_eq!(adapter.refresh_call_count(), 1);
    }
}
