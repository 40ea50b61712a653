//! Facebook platform adapter (Graph API)
//!
//! Publishes to Facebook Pages via the Graph API. Facebook has no refresh
//! tokens; instead a long-lived token is re-exchanged for a fresh one via
//! the `fb_exchange_token` grant, so the stored "refresh" token is the
//! long-lived token itself.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use crate::error::{PlatformError, Result};
use crate::platforms::{
    classify_request_error, classify_status, PlatformAdapter, PublishReceipt, TokenGrant,
};
use crate::types::{MediaKind, Platform, Post, SocialAccount};

const GRAPH_BASE: &str = "https://graph.facebook.com/v18.0";
const DIALOG_BASE: &str = "https://www.facebook.com/v18.0/dialog/oauth";

const SCOPES: &str =
    "pages_manage_posts,pages_read_engagement,instagram_basic,instagram_content_publish";

pub struct FacebookAdapter {
    app_id: String,
    app_secret: String,
    client: reqwest::Client,
}

impl FacebookAdapter {
    pub fn new(app_id: String, app_secret: String) -> Self {
        Self {
            app_id,
            app_secret,
            client: reqwest::Client::new(),
        }
    }

    /// Exchange a short-lived token for a long-lived one.
    async fn exchange_long_lived(&self, token: &str) -> Result<TokenGrant> {
        let resp = self
            .client
            .get(format!("{}/oauth/access_token", GRAPH_BASE))
            .query(&[
                ("grant_type", "fb_exchange_token"),
                ("client_id", self.app_id.as_str()),
                ("client_secret", self.app_secret.as_str()),
                ("fb_exchange_token", token),
            ])
            .send()
            .await
            .map_err(classify_request_error)?;

        parse_token_response(resp).await
    }
}

#[async_trait]
impl PlatformAdapter for FacebookAdapter {
    fn platform(&self) -> Platform {
        Platform::Facebook
    }

    fn auth_url(&self, redirect_uri: &str, state: &str) -> String {
        format!(
            "{}?client_id={}&redirect_uri={}&state={}&scope={}",
            DIALOG_BASE, self.app_id, redirect_uri, state, SCOPES
        )
    }

    async fn exchange_code(&self, code: &str, redirect_uri: &str) -> Result<TokenGrant> {
        let resp = self
            .client
            .get(format!("{}/oauth/access_token", GRAPH_BASE))
            .query(&[
                ("client_id", self.app_id.as_str()),
                ("client_secret", self.app_secret.as_str()),
                ("redirect_uri", redirect_uri),
                ("code", code),
            ])
            .send()
            .await
            .map_err(classify_request_error)?;

        let short_lived = parse_token_response(resp).await?;

        // Upgrade immediately so the stored grant survives past an hour
        self.exchange_long_lived(short_lived.access_token.expose_secret())
            .await
    }

    async fn refresh(&self, refresh_token: &SecretString) -> Result<TokenGrant> {
        self.exchange_long_lived(refresh_token.expose_secret()).await
    }

    async fn publish(
        &self,
        access_token: &SecretString,
        account: &SocialAccount,
        post: &Post,
        _idempotency_key: &str,
    ) -> Result<PublishReceipt> {
        // Graph has no idempotency mechanism; redelivery protection relies
        // on the terminal-state check before dispatch.
        let page_id = &account.platform_account_id;

        let mut body = serde_json::json!({
            "access_token": access_token.expose_secret(),
        });

        let endpoint = match post.media.first() {
            Some(item) if item.kind == MediaKind::Image => {
                body["url"] = serde_json::json!(item.uri);
                body["caption"] = serde_json::json!(post.text);
                format!("{}/{}/photos", GRAPH_BASE, page_id)
            }
            Some(item) => {
                body["file_url"] = serde_json::json!(item.uri);
                body["description"] = serde_json::json!(post.text);
                format!("{}/{}/videos", GRAPH_BASE, page_id)
            }
            None => {
                body["message"] = serde_json::json!(post.text);
                format!("{}/{}/feed", GRAPH_BASE, page_id)
            }
        };

        let resp = self
            .client
            .post(&endpoint)
            .json(&body)
            .send()
            .await
            .map_err(classify_request_error)?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_status(status, &body).into());
        }

        let json: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| PlatformError::Remote(format!("malformed publish response: {}", e)))?;

        let platform_post_id = json["id"]
            .as_str()
            .ok_or_else(|| PlatformError::Remote("publish response missing post id".to_string()))?
            .to_string();

        Ok(PublishReceipt { platform_post_id })
    }
}

/// Parse a Graph token endpoint response into a grant.
pub(crate) async fn parse_token_response(resp: reqwest::Response) -> Result<TokenGrant> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(classify_status(status, &body).into());
    }

    let json: serde_json::Value = resp
        .json()
        .await
        .map_err(|e| PlatformError::Remote(format!("malformed token response: {}", e)))?;

    let access_token = json["access_token"]
        .as_str()
        .ok_or_else(|| PlatformError::Remote("token response missing access_token".to_string()))?
        .to_string();

    let expires_at = json["expires_in"]
        .as_i64()
        .map(|secs| chrono::Utc::now().timestamp() + secs);

    // Long-lived tokens double as the refresh material
    Ok(TokenGrant {
        refresh_token: Some(SecretString::from(access_token.clone())),
        access_token: SecretString::from(access_token),
        expires_at,
        provider_account_id: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_url_contains_app_and_scopes() {
        let adapter = FacebookAdapter::new("app-1".to_string(), "secret".to_string());
        let url = adapter.auth_url("https://example.com/cb", "state-xyz");

        assert!(url.starts_with(DIALOG_BASE));
        assert!(url.contains("client_id=app-1"));
        assert!(url.contains("state=state-xyz"));
        assert!(url.contains("pages_manage_posts"));
        assert!(!url.contains("secret"));
    }

    #[test]
    fn test_platform_identity() {
        let adapter = FacebookAdapter::new("app".to_string(), "secret".to_string());
        assert_eq!(adapter.platform(), Platform::Facebook);
    }
}
