//! Instagram platform adapter (Graph API)
//!
//! Instagram Business accounts publish through the same Graph app as
//! Facebook, via a two-step container flow: create a media container,
//! then publish it. Token lifecycle is identical to Facebook's, so the
//! OAuth pieces delegate to the shared Graph helpers.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use crate::error::{PlatformError, Result};
use crate::platforms::facebook::FacebookAdapter;
use crate::platforms::{
    classify_request_error, classify_status, PlatformAdapter, PublishReceipt, TokenGrant,
};
use crate::types::{MediaKind, Platform, Post, SocialAccount};

const GRAPH_BASE: &str = "https://graph.facebook.com/v18.0";

pub struct InstagramAdapter {
    graph: FacebookAdapter,
    client: reqwest::Client,
}

impl InstagramAdapter {
    pub fn new(app_id: String, app_secret: String) -> Self {
        Self {
            graph: FacebookAdapter::new(app_id, app_secret),
            client: reqwest::Client::new(),
        }
    }

    /// Step one of the publish flow: create a media container.
    async fn create_container(
        &self,
        access_token: &SecretString,
        ig_user_id: &str,
        post: &Post,
    ) -> Result<String> {
        let mut body = serde_json::json!({
            "access_token": access_token.expose_secret(),
            "caption": post.text,
        });

        match post.media.first() {
            Some(item) if item.kind == MediaKind::Video => {
                body["media_type"] = serde_json::json!("REELS");
                body["video_url"] = serde_json::json!(item.uri);
            }
            Some(item) => {
                body["image_url"] = serde_json::json!(item.uri);
            }
            None => {
                // Instagram requires media on every post
                return Err(PlatformError::Rejected(
                    "instagram posts require at least one media item".to_string(),
                )
                .into());
            }
        }

        let resp = self
            .client
            .post(format!("{}/{}/media", GRAPH_BASE, ig_user_id))
            .json(&body)
            .send()
            .await
            .map_err(classify_request_error)?;

        extract_id(resp).await
    }
}

#[async_trait]
impl PlatformAdapter for InstagramAdapter {
    fn platform(&self) -> Platform {
        Platform::Instagram
    }

    fn auth_url(&self, redirect_uri: &str, state: &str) -> String {
        self.graph.auth_url(redirect_uri, state)
    }

    async fn exchange_code(&self, code: &str, redirect_uri: &str) -> Result<TokenGrant> {
        self.graph.exchange_code(code, redirect_uri).await
    }

    async fn refresh(&self, refresh_token: &SecretString) -> Result<TokenGrant> {
        self.graph.refresh(refresh_token).await
    }

    async fn publish(
        &self,
        access_token: &SecretString,
        account: &SocialAccount,
        post: &Post,
        _idempotency_key: &str,
    ) -> Result<PublishReceipt> {
        let ig_user_id = &account.platform_account_id;

        let container_id = self.create_container(access_token, ig_user_id, post).await?;

        let resp = self
            .client
            .post(format!("{}/{}/media_publish", GRAPH_BASE, ig_user_id))
            .json(&serde_json::json!({
                "access_token": access_token.expose_secret(),
                "creation_id": container_id,
            }))
            .send()
            .await
            .map_err(classify_request_error)?;

        let platform_post_id = extract_id(resp).await?;
        Ok(PublishReceipt { platform_post_id })
    }
}

async fn extract_id(resp: reqwest::Response) -> Result<String> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(classify_status(status, &body).into());
    }

    let json: serde_json::Value = resp
        .json()
        .await
        .map_err(|e| PlatformError::Remote(format!("malformed response: {}", e)))?;

    Ok(json["id"]
        .as_str()
        .ok_or_else(|| PlatformError::Remote("response missing id".to_string()))?
        .to_string())
}
