//! Database operations for multipost

use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use std::path::Path;

use crate::error::Result;
use crate::types::{
    AuditEntry, AuditLevel, MediaItem, Platform, Post, PostStatus, SocialAccount, Target,
    TargetState,
};

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Create a new database connection
    pub async fn new(db_path: &str) -> Result<Self> {
        // Expand path and create parent directories
        let expanded_path = shellexpand::tilde(db_path).to_string();
        let path = Path::new(&expanded_path);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(crate::error::DbError::IoError)?;
        }

        // Use mode=rwc to allow creating the database file if it doesn't exist
        let db_url = format!("sqlite://{}?mode=rwc", expanded_path.replace('\\', "/"));

        let pool = SqlitePool::connect(&db_url)
            .await
            .map_err(crate::error::DbError::SqlxError)?;

        // Run migrations
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(crate::error::DbError::MigrationError)?;

        Ok(Self { pool })
    }

    // ---- posts ----

    /// Create a new post
    pub async fn create_post(&self, post: &Post) -> Result<()> {
        let media_json = serde_json::to_string(&post.media)
            .map_err(|e| crate::error::MultipostError::InvalidInput(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO posts (id, owner_id, text, media, scheduled_at, status, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&post.id)
        .bind(&post.owner_id)
        .bind(&post.text)
        .bind(media_json)
        .bind(post.scheduled_at)
        .bind(post.status.as_str())
        .bind(post.created_at)
        .execute(&self.pool)
        .await
        .map_err(crate::error::DbError::SqlxError)?;

        Ok(())
    }

    /// Get a post by ID
    pub async fn get_post(&self, post_id: &str) -> Result<Option<Post>> {
        let row = sqlx::query(
            r#"
            SELECT id, owner_id, text, media, scheduled_at, status, created_at
            FROM posts WHERE id = ?
            "#,
        )
        .bind(post_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(crate::error::DbError::SqlxError)?;

        match row {
            Some(r) => Ok(Some(row_to_post(&r)?)),
            None => Ok(None),
        }
    }

    /// Update the aggregate status of a post
    pub async fn update_post_status(&self, post_id: &str, status: PostStatus) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE posts SET status = ? WHERE id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(post_id)
        .execute(&self.pool)
        .await
        .map_err(crate::error::DbError::SqlxError)?;

        Ok(())
    }

    // ---- social accounts ----

    /// Create a linked account. The (owner, platform, remote account)
    /// triple is unique; re-linking the same remote account is an upsert
    /// that keeps the existing row id.
    pub async fn upsert_account(&self, account: &SocialAccount) -> Result<SocialAccount> {
        sqlx::query(
            r#"
            INSERT INTO social_accounts (id, owner_id, platform, platform_account_id, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (owner_id, platform, platform_account_id) DO NOTHING
            "#,
        )
        .bind(&account.id)
        .bind(&account.owner_id)
        .bind(account.platform.as_str())
        .bind(&account.platform_account_id)
        .bind(account.created_at)
        .execute(&self.pool)
        .await
        .map_err(crate::error::DbError::SqlxError)?;

        let row = sqlx::query(
            r#"
            SELECT id, owner_id, platform, platform_account_id, created_at
            FROM social_accounts
            WHERE owner_id = ? AND platform = ? AND platform_account_id = ?
            "#,
        )
        .bind(&account.owner_id)
        .bind(account.platform.as_str())
        .bind(&account.platform_account_id)
        .fetch_one(&self.pool)
        .await
        .map_err(crate::error::DbError::SqlxError)?;

        row_to_account(&row)
    }

    /// Get an account by ID
    pub async fn get_account(&self, account_id: &str) -> Result<Option<SocialAccount>> {
        let row = sqlx::query(
            r#"
            SELECT id, owner_id, platform, platform_account_id, created_at
            FROM social_accounts WHERE id = ?
            "#,
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(crate::error::DbError::SqlxError)?;

        match row {
            Some(r) => Ok(Some(row_to_account(&r)?)),
            None => Ok(None),
        }
    }

    /// List all accounts owned by a user
    pub async fn list_accounts(&self, owner_id: &str) -> Result<Vec<SocialAccount>> {
        let rows = sqlx::query(
            r#"
            SELECT id, owner_id, platform, platform_account_id, created_at
            FROM social_accounts WHERE owner_id = ?
            ORDER BY created_at
            "#,
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await
        .map_err(crate::error::DbError::SqlxError)?;

        rows.iter().map(row_to_account).collect()
    }

    // ---- targets ----

    /// Create a target for a (post, account) pair, or return the existing
    /// one. Repeated submissions must not create duplicate units of work.
    pub async fn find_or_create_target(&self, post_id: &str, account_id: &str) -> Result<Target> {
        let target = Target::new(post_id.to_string(), account_id.to_string());

        sqlx::query(
            r#"
            INSERT INTO targets (id, post_id, account_id, state, attempt_count, updated_at)
            VALUES (?, ?, ?, 'pending', 0, ?)
            ON CONFLICT (post_id, account_id) DO NOTHING
            "#,
        )
        .bind(&target.id)
        .bind(post_id)
        .bind(account_id)
        .bind(target.updated_at)
        .execute(&self.pool)
        .await
        .map_err(crate::error::DbError::SqlxError)?;

        let row = sqlx::query(
            r#"
            SELECT id, post_id, account_id, state, platform_post_id, last_error,
                   attempt_count, updated_at
            FROM targets WHERE post_id = ? AND account_id = ?
            "#,
        )
        .bind(post_id)
        .bind(account_id)
        .fetch_one(&self.pool)
        .await
        .map_err(crate::error::DbError::SqlxError)?;

        row_to_target(&row)
    }

    /// Get a target by ID
    pub async fn get_target(&self, target_id: &str) -> Result<Option<Target>> {
        let row = sqlx::query(
            r#"
            SELECT id, post_id, account_id, state, platform_post_id, last_error,
                   attempt_count, updated_at
            FROM targets WHERE id = ?
            "#,
        )
        .bind(target_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(crate::error::DbError::SqlxError)?;

        match row {
            Some(r) => Ok(Some(row_to_target(&r)?)),
            None => Ok(None),
        }
    }

    /// Get all targets for a post
    pub async fn get_targets_for_post(&self, post_id: &str) -> Result<Vec<Target>> {
        let rows = sqlx::query(
            r#"
            SELECT id, post_id, account_id, state, platform_post_id, last_error,
                   attempt_count, updated_at
            FROM targets WHERE post_id = ?
            ORDER BY updated_at
            "#,
        )
        .bind(post_id)
        .fetch_all(&self.pool)
        .await
        .map_err(crate::error::DbError::SqlxError)?;

        rows.iter().map(row_to_target).collect()
    }

    /// Atomically claim a target for publishing and bump its attempt count.
    ///
    /// Only a target in `pending` or `failed-retryable` can be claimed;
    /// the state filter on the UPDATE makes the claim race-free. Returns
    /// the claimed target, or None if another worker got there first or
    /// the target is already terminal.
    pub async fn claim_target(&self, target_id: &str) -> Result<Option<Target>> {
        let result = sqlx::query(
            r#"
            UPDATE targets
            SET state = 'publishing',
                attempt_count = attempt_count + 1,
                updated_at = ?
            WHERE id = ? AND state IN ('pending', 'failed-retryable')
            "#,
        )
        .bind(chrono::Utc::now().timestamp())
        .bind(target_id)
        .execute(&self.pool)
        .await
        .map_err(crate::error::DbError::SqlxError)?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }

        self.get_target(target_id).await
    }

    /// Record a successful publish. Guarded on `publishing` so a stray
    /// late transition cannot clobber a terminal state.
    pub async fn mark_target_published(
        &self,
        target_id: &str,
        platform_post_id: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE targets
            SET state = 'published', platform_post_id = ?, last_error = NULL, updated_at = ?
            WHERE id = ? AND state = 'publishing'
            "#,
        )
        .bind(platform_post_id)
        .bind(chrono::Utc::now().timestamp())
        .bind(target_id)
        .execute(&self.pool)
        .await
        .map_err(crate::error::DbError::SqlxError)?;

        Ok(result.rows_affected() > 0)
    }

    /// Record a retryable failure
    pub async fn mark_target_failed_retryable(&self, target_id: &str, error: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE targets
            SET state = 'failed-retryable', last_error = ?, updated_at = ?
            WHERE id = ? AND state = 'publishing'
            "#,
        )
        .bind(error)
        .bind(chrono::Utc::now().timestamp())
        .bind(target_id)
        .execute(&self.pool)
        .await
        .map_err(crate::error::DbError::SqlxError)?;

        Ok(result.rows_affected() > 0)
    }

    /// Record a terminal failure
    pub async fn mark_target_failed_terminal(&self, target_id: &str, error: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE targets
            SET state = 'failed-terminal', last_error = ?, updated_at = ?
            WHERE id = ? AND state = 'publishing'
            "#,
        )
        .bind(error)
        .bind(chrono::Utc::now().timestamp())
        .bind(target_id)
        .execute(&self.pool)
        .await
        .map_err(crate::error::DbError::SqlxError)?;

        Ok(result.rows_affected() > 0)
    }

    /// Move every non-terminal target of a post to terminal failure.
    /// In-flight (`publishing`) targets are cancelled too; the worker's
    /// late transition write is refused by its `state = 'publishing'`
    /// guard, so cancellation suppresses any further retries. Returns
    /// the number of cancelled targets.
    pub async fn cancel_open_targets(&self, post_id: &str) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE targets
            SET state = 'failed-terminal', last_error = 'cancelled', updated_at = ?
            WHERE post_id = ? AND state IN ('pending', 'publishing', 'failed-retryable')
            "#,
        )
        .bind(chrono::Utc::now().timestamp())
        .bind(post_id)
        .execute(&self.pool)
        .await
        .map_err(crate::error::DbError::SqlxError)?;

        Ok(result.rows_affected())
    }

    /// All targets not yet in a terminal state, for startup recovery
    pub async fn non_terminal_targets(&self) -> Result<Vec<Target>> {
        let rows = sqlx::query(
            r#"
            SELECT id, post_id, account_id, state, platform_post_id, last_error,
                   attempt_count, updated_at
            FROM targets
            WHERE state NOT IN ('published', 'failed-terminal')
            ORDER BY updated_at
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(crate::error::DbError::SqlxError)?;

        rows.iter().map(row_to_target).collect()
    }

    /// Undo a claim after an infrastructure failure: back to `pending`
    /// with the attempt uncounted, so the stale-target poll redelivers it
    /// once the infrastructure recovers.
    pub async fn release_claim(&self, target_id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE targets
            SET state = 'pending', attempt_count = attempt_count - 1, updated_at = ?
            WHERE id = ? AND state = 'publishing'
            "#,
        )
        .bind(chrono::Utc::now().timestamp())
        .bind(target_id)
        .execute(&self.pool)
        .await
        .map_err(crate::error::DbError::SqlxError)?;

        Ok(result.rows_affected() > 0)
    }

    /// Release a target stuck in `publishing`, for startup recovery after
    /// a crash. The attempt already counted when the target was claimed.
    pub async fn release_stuck_target(&self, target_id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE targets
            SET state = 'failed-retryable', last_error = 'interrupted', updated_at = ?
            WHERE id = ? AND state = 'publishing'
            "#,
        )
        .bind(chrono::Utc::now().timestamp())
        .bind(target_id)
        .execute(&self.pool)
        .await
        .map_err(crate::error::DbError::SqlxError)?;

        Ok(result.rows_affected() > 0)
    }

    // ---- audit log ----

    /// Append an audit entry
    pub async fn append_audit(&self, entry: &AuditEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO audit_log (entity_type, entity_id, level, message, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&entry.entity_type)
        .bind(&entry.entity_id)
        .bind(entry.level.as_str())
        .bind(&entry.message)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await
        .map_err(crate::error::DbError::SqlxError)?;

        Ok(())
    }

    /// Get the audit trail for an entity, oldest first
    pub async fn get_audit_entries(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Vec<AuditEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT id, entity_type, entity_id, level, message, created_at
            FROM audit_log
            WHERE entity_type = ? AND entity_id = ?
            ORDER BY id
            "#,
        )
        .bind(entity_type)
        .bind(entity_id)
        .fetch_all(&self.pool)
        .await
        .map_err(crate::error::DbError::SqlxError)?;

        rows.iter().map(row_to_audit).collect()
    }

    /// Purge audit entries older than the cutoff. Returns the number of
    /// deleted rows.
    pub async fn purge_audit_before(&self, cutoff: i64) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM audit_log WHERE created_at < ?
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(crate::error::DbError::SqlxError)?;

        Ok(result.rows_affected())
    }

    /// Direct pool access for the credential store
    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn row_to_post(r: &sqlx::sqlite::SqliteRow) -> Result<Post> {
    let media_json: String = r.get("media");
    let media: Vec<MediaItem> = serde_json::from_str(&media_json)
        .map_err(|e| crate::error::MultipostError::InvalidInput(e.to_string()))?;

    Ok(Post {
        id: r.get("id"),
        owner_id: r.get("owner_id"),
        text: r.get("text"),
        media,
        scheduled_at: r.get("scheduled_at"),
        status: PostStatus::parse(&r.get::<String, _>("status")).unwrap_or(PostStatus::Draft),
        created_at: r.get("created_at"),
    })
}

fn row_to_account(r: &sqlx::sqlite::SqliteRow) -> Result<SocialAccount> {
    let platform_str: String = r.get("platform");
    let platform = Platform::parse(&platform_str).ok_or_else(|| {
        crate::error::MultipostError::InvalidInput(format!("unknown platform: {}", platform_str))
    })?;

    Ok(SocialAccount {
        id: r.get("id"),
        owner_id: r.get("owner_id"),
        platform,
        platform_account_id: r.get("platform_account_id"),
        created_at: r.get("created_at"),
    })
}

fn row_to_target(r: &sqlx::sqlite::SqliteRow) -> Result<Target> {
    Ok(Target {
        id: r.get("id"),
        post_id: r.get("post_id"),
        account_id: r.get("account_id"),
        state: TargetState::parse(&r.get::<String, _>("state"))
            .unwrap_or(TargetState::FailedTerminal),
        platform_post_id: r.get("platform_post_id"),
        last_error: r.get("last_error"),
        attempt_count: r.get::<i64, _>("attempt_count") as u32,
        updated_at: r.get("updated_at"),
    })
}

fn row_to_audit(r: &sqlx::sqlite::SqliteRow) -> Result<AuditEntry> {
    Ok(AuditEntry {
        id: Some(r.get("id")),
        entity_type: r.get("entity_type"),
        entity_id: r.get("entity_id"),
        level: AuditLevel::parse(&r.get::<String, _>("level")).unwrap_or(AuditLevel::Info),
        message: r.get("message"),
        created_at: r.get("created_at"),
    })
}
