//! Core types for multipost

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Supported remote platforms.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Facebook,
    Instagram,
    TikTok,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Facebook => "facebook",
            Platform::Instagram => "instagram",
            Platform::TikTok => "tiktok",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "facebook" => Some(Platform::Facebook),
            "instagram" => Some(Platform::Instagram),
            "tiktok" => Some(Platform::TikTok),
            _ => None,
        }
    }

    pub const ALL: [Platform; 3] = [Platform::Facebook, Platform::Instagram, Platform::TikTok];
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Aggregate status of a post, derived from its targets.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PostStatus {
    Draft,
    Scheduled,
    Publishing,
    Published,
    Failed,
}

impl PostStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PostStatus::Draft => "draft",
            PostStatus::Scheduled => "scheduled",
            PostStatus::Publishing => "publishing",
            PostStatus::Published => "published",
            PostStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(PostStatus::Draft),
            "scheduled" => Some(PostStatus::Scheduled),
            "publishing" => Some(PostStatus::Publishing),
            "published" => Some(PostStatus::Published),
            "failed" => Some(PostStatus::Failed),
            _ => None,
        }
    }
}

/// Per-target publish lifecycle state.
///
/// Transitions are monotonic along
/// `pending -> publishing -> {published | failed-retryable | failed-terminal}`,
/// with `failed-retryable -> publishing` as the only backward edge
/// (re-dispatch). Terminal states never change.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum TargetState {
    Pending,
    Publishing,
    Published,
    FailedRetryable,
    FailedTerminal,
}

impl TargetState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetState::Pending => "pending",
            TargetState::Publishing => "publishing",
            TargetState::Published => "published",
            TargetState::FailedRetryable => "failed-retryable",
            TargetState::FailedTerminal => "failed-terminal",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TargetState::Pending),
            "publishing" => Some(TargetState::Publishing),
            "published" => Some(TargetState::Published),
            "failed-retryable" => Some(TargetState::FailedRetryable),
            "failed-terminal" => Some(TargetState::FailedTerminal),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TargetState::Published | TargetState::FailedTerminal)
    }
}

impl std::fmt::Display for TargetState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
}

/// Already-uploaded media, referenced by URI. The core never performs
/// uploads; it receives these records from the media store boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MediaItem {
    pub uri: String,
    pub kind: MediaKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Post {
    pub id: String,
    pub owner_id: String,
    pub text: String,
    pub media: Vec<MediaItem>,
    pub scheduled_at: Option<i64>,
    pub status: PostStatus,
    pub created_at: i64,
}

impl Post {
    pub fn new(owner_id: String, text: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            owner_id,
            text,
            media: Vec::new(),
            scheduled_at: None,
            status: PostStatus::Draft,
            created_at: chrono::Utc::now().timestamp(),
        }
    }
}

/// A linked platform account. Token material lives in the credential
/// store, never on this struct.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocialAccount {
    pub id: String,
    pub owner_id: String,
    pub platform: Platform,
    pub platform_account_id: String,
    pub created_at: i64,
}

impl SocialAccount {
    pub fn new(owner_id: String, platform: Platform, platform_account_id: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            owner_id,
            platform,
            platform_account_id,
            created_at: chrono::Utc::now().timestamp(),
        }
    }
}

/// One publish attempt unit for a single (post, account) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    pub id: String,
    pub post_id: String,
    pub account_id: String,
    pub state: TargetState,
    pub platform_post_id: Option<String>,
    pub last_error: Option<String>,
    pub attempt_count: u32,
    pub updated_at: i64,
}

impl Target {
    pub fn new(post_id: String, account_id: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            post_id,
            account_id,
            state: TargetState::Pending,
            platform_post_id: None,
            last_error: None,
            attempt_count: 0,
            updated_at: chrono::Utc::now().timestamp(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AuditLevel {
    Info,
    Warning,
    Error,
}

impl AuditLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditLevel::Info => "info",
            AuditLevel::Warning => "warning",
            AuditLevel::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "info" => Some(AuditLevel::Info),
            "warning" => Some(AuditLevel::Warning),
            "error" => Some(AuditLevel::Error),
            _ => None,
        }
    }
}

/// Append-only audit trail entry. Written on notable transitions, never
/// mutated; retention is handled by the maintenance sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Option<i64>,
    pub entity_type: String,
    pub entity_id: String,
    pub level: AuditLevel,
    pub message: String,
    pub created_at: i64,
}

impl AuditEntry {
    pub fn new(
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        level: AuditLevel,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: None,
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            level,
            message: message.into(),
            created_at: chrono::Utc::now().timestamp(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_roundtrip() {
        for p in Platform::ALL {
            assert_eq!(Platform::parse(p.as_str()), Some(p));
        }
        assert_eq!(Platform::parse("myspace"), None);
    }

    #[test]
    fn test_post_status_roundtrip() {
        for s in [
            PostStatus::Draft,
            PostStatus::Scheduled,
            PostStatus::Publishing,
            PostStatus::Published,
            PostStatus::Failed,
        ] {
            assert_eq!(PostStatus::parse(s.as_str()), Some(s));
        }
    }

    #[test]
    fn test_target_state_roundtrip() {
        for s in [
            TargetState::Pending,
            TargetState::Publishing,
            TargetState::Published,
            TargetState::FailedRetryable,
            TargetState::FailedTerminal,
        ] {
            assert_eq!(TargetState::parse(s.as_str()), Some(s));
        }
    }

    #[test]
    fn test_terminal_states() {
        assert!(TargetState::Published.is_terminal());
        assert!(TargetState::FailedTerminal.is_terminal());

        assert!(!TargetState::Pending.is_terminal());
        assert!(!TargetState::Publishing.is_terminal());
        assert!(!TargetState::FailedRetryable.is_terminal());
    }

    #[test]
    fn test_post_new_defaults() {
        let post = Post::new("user-1".to_string(), "hello".to_string());

        assert!(Uuid::parse_str(&post.id).is_ok());
        assert_eq!(post.owner_id, "user-1");
        assert_eq!(post.status, PostStatus::Draft);
        assert!(post.media.is_empty());
        assert_eq!(post.scheduled_at, None);
    }

    #[test]
    fn test_target_new_defaults() {
        let target = Target::new("post-1".to_string(), "acct-1".to_string());

        assert!(Uuid::parse_str(&target.id).is_ok());
        assert_eq!(target.state, TargetState::Pending);
        assert_eq!(target.attempt_count, 0);
        assert_eq!(target.platform_post_id, None);
        assert_eq!(target.last_error, None);
    }

    #[test]
    fn test_unique_ids() {
        let t1 = Target::new("p".to_string(), "a".to_string());
        let t2 = Target::new("p".to_string(), "a".to_string());
        assert_ne!(t1.id, t2.id);
    }

    #[test]
    fn test_media_item_serialization() {
        let item = MediaItem {
            uri: "s3://bucket/vid.mp4".to_string(),
            kind: MediaKind::Video,
            width: Some(1920),
            height: Some(1080),
            duration_secs: Some(42),
        };

        let json = serde_json::to_string(&item).unwrap();
        let back: MediaItem = serde_json::from_str(&json).unwrap();
        assert_eq!(back, item);
    }

    #[test]
    fn test_media_item_omits_absent_dimensions() {
        let item = MediaItem {
            uri: "s3://bucket/pic.jpg".to_string(),
            kind: MediaKind::Image,
            width: None,
            height: None,
            duration_secs: None,
        };

        let json = serde_json::to_string(&item).unwrap();
        assert!(!json.contains("width"));
        assert!(!json.contains("duration_secs"));
    }

    #[test]
    fn test_target_state_serde_kebab_case() {
        let json = serde_json::to_string(&TargetState::FailedRetryable).unwrap();
        assert_eq!(json, r#""failed-retryable""#);
    }

    #[test]
    fn test_audit_entry_new() {
        let entry = AuditEntry::new("target", "t-1", AuditLevel::Warning, "retry scheduled");
        assert_eq!(entry.id, None);
        assert_eq!(entry.entity_type, "target");
        assert_eq!(entry.level, AuditLevel::Warning);
        assert!(entry.created_at > 1_600_000_000);
    }
}
