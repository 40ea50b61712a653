//! TikTok platform adapter
//!
//! Uses the TikTok v2 OAuth flow and the direct-post content API. Unlike
//! the Graph platforms, TikTok issues real refresh tokens and honors an
//! idempotency key on publish requests.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use crate::error::{PlatformError, Result};
use crate::platforms::{
    classify_request_error, classify_status, PlatformAdapter, PublishReceipt, TokenGrant,
};
use crate::types::{MediaKind, Platform, Post, SocialAccount};

const AUTH_BASE: &str = "https://www.tiktok.com/v2/auth/authorize/";
const TOKEN_URL: &str = "https://open-api.tiktok.com/oauth/access_token/";
const REFRESH_URL: &str = "https://open-api.tiktok.com/oauth/refresh_token/";
const PUBLISH_URL: &str = "https://open.tiktokapis.com/v2/post/publish/video/init/";

const SCOPES: &str = "user.info.basic,video.publish";

pub struct TikTokAdapter {
    client_key: String,
    client_secret: String,
    client: reqwest::Client,
}

impl TikTokAdapter {
    pub fn new(client_key: String, client_secret: String) -> Self {
        Self {
            client_key,
            client_secret,
            client: reqwest::Client::new(),
        }
    }

    async fn parse_token_response(&self, resp: reqwest::Response) -> Result<TokenGrant> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_status(status, &body).into());
        }

        let json: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| PlatformError::Remote(format!("malformed token response: {}", e)))?;

        // TikTok nests the grant under "data" and reports some failures
        // with HTTP 200 plus an error payload
        let data = &json["data"];
        let access_token = data["access_token"].as_str().ok_or_else(|| {
            PlatformError::InvalidToken(format!(
                "token response missing access_token: {}",
                json["data"]["description"].as_str().unwrap_or("unknown")
            ))
        })?;

        let refresh_token = data["refresh_token"]
            .as_str()
            .map(|t| SecretString::from(t.to_string()));

        let expires_at = data["expires_in"]
            .as_i64()
            .map(|secs| chrono::Utc::now().timestamp() + secs);

        Ok(TokenGrant {
            access_token: SecretString::from(access_token.to_string()),
            refresh_token,
            expires_at,
            provider_account_id: data["open_id"].as_str().map(str::to_string),
        })
    }
}

#[async_trait]
impl PlatformAdapter for TikTokAdapter {
    fn platform(&self) -> Platform {
        Platform::TikTok
    }

    fn auth_url(&self, redirect_uri: &str, state: &str) -> String {
        format!(
            "{}?client_key={}&redirect_uri={}&state={}&scope={}&response_type=code",
            AUTH_BASE, self.client_key, redirect_uri, state, SCOPES
        )
    }

    async fn exchange_code(&self, code: &str, redirect_uri: &str) -> Result<TokenGrant> {
        let resp = self
            .client
            .post(TOKEN_URL)
            .json(&serde_json::json!({
                "client_key": self.client_key,
                "client_secret": self.client_secret,
                "code": code,
                "grant_type": "authorization_code",
                "redirect_uri": redirect_uri,
            }))
            .send()
            .await
            .map_err(classify_request_error)?;

        self.parse_token_response(resp).await
    }

    async fn refresh(&self, refresh_token: &SecretString) -> Result<TokenGrant> {
        let resp = self
            .client
            .post(REFRESH_URL)
            .json(&serde_json::json!({
                "client_key": self.client_key,
                "client_secret": self.client_secret,
                "grant_type": "refresh_token",
                "refresh_token": refresh_token.expose_secret(),
            }))
            .send()
            .await
            .map_err(classify_request_error)?;

        self.parse_token_response(resp).await
    }

    async fn publish(
        &self,
        access_token: &SecretString,
        _account: &SocialAccount,
        post: &Post,
        idempotency_key: &str,
    ) -> Result<PublishReceipt> {
        let video = post
            .media
            .iter()
            .find(|m| m.kind == MediaKind::Video)
            .ok_or_else(|| {
                PlatformError::Rejected("tiktok posts require a video media item".to_string())
            })?;

        let resp = self
            .client
            .post(PUBLISH_URL)
            .bearer_auth(access_token.expose_secret())
            .header("X-Idempotency-Key", idempotency_key)
            .json(&serde_json::json!({
                "post_info": {
                    "title": post.text,
                },
                "source_info": {
                    "source": "PULL_FROM_URL",
                    "video_url": video.uri,
                },
            }))
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

        let platform_post_id = json["data"]["publish_id"]
            .as_str()
            .ok_or_else(|| {
                PlatformError::Remote("publish response missing publish_id".to_string())
            })?
            .to_string();

        Ok(PublishReceipt { platform_post_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_url_contains_client_key_and_scopes() {
        let adapter = TikTokAdapter::new("key-1".to_string(), "secret".to_string());
        let url = adapter.auth_url("https://example.com/cb", "state-abc");

        assert!(url.starts_with(AUTH_BASE));
        assert!(url.contains("client_key=key-1"));
        assert!(url.contains("video.publish"));
        assert!(url.contains("response_type=code"));
        assert!(!url.contains("secret"));
    }

    #[test]
    fn test_platform_identity() {
        let adapter = TikTokAdapter::new("key".to_string(), "secret".to_string());
        assert_eq!(adapter.platform(), Platform::TikTok);
    }
}
