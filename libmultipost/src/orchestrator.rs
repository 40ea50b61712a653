//! Publish orchestration
//!
//! Fans a post out to one target per selected account, enqueues the
//! targets onto their platform queues, and derives the post's aggregate
//! status from target states. Submission is idempotent: resubmitting a
//! post reuses existing targets and never duplicates work.

use crate::db::Database;
use crate::error::{MultipostError, Result};
use crate::types::{AuditEntry, AuditLevel, Post, PostStatus, SocialAccount, Target, TargetState};
use crate::worker::{ClaimMessage, QueueSet};

pub struct Orchestrator {
    db: Database,
    queues: QueueSet,
}

impl Orchestrator {
    pub fn new(db: Database, queues: QueueSet) -> Self {
        Self { db, queues }
    }

    /// Fan a post out to the given accounts and enqueue the resulting
    /// targets. An empty `account_ids` selects every account the owner
    /// has linked.
    ///
    /// Every account must belong to `owner_id`; a single foreign account
    /// rejects the whole submission before any target is created.
    pub async fn submit_for_publish(
        &self,
        post_id: &str,
        owner_id: &str,
        account_ids: &[String],
    ) -> Result<Vec<Target>> {
        let post = self
            .db
            .get_post(post_id)
            .await?
            .ok_or_else(|| MultipostError::InvalidInput(format!("unknown post: {}", post_id)))?;

        if post.owner_id != owner_id {
            return Err(MultipostError::Forbidden(format!(
                "post {} is not owned by {}",
                post_id, owner_id
            )));
        }

        if post.text.is_empty() && post.media.is_empty() {
            return Err(MultipostError::InvalidInput(
                "post has no text and no media".to_string(),
            ));
        }

        let accounts = self.resolve_accounts(owner_id, account_ids).await?;
        if accounts.is_empty() {
            return Err(MultipostError::InvalidInput(format!(
                "no linked accounts for owner {}",
                owner_id
            )));
        }

        let mut targets = Vec::with_capacity(accounts.len());
        for account in &accounts {
            let target = self.db.find_or_create_target(post_id, &account.id).await?;

            // Only fresh or previously-failed-retryable targets go back on
            // a queue; in-flight and terminal targets are left untouched
            if matches!(
                target.state,
                TargetState::Pending | TargetState::FailedRetryable
            ) {
                self.queues.enqueue(
                    account.platform,
                    ClaimMessage {
                        target_id: target.id.clone(),
                        attempt_count: target.attempt_count,
                    },
                )?;
            }
            targets.push(target);
        }

        self.db
            .append_audit(&AuditEntry::new(
                "post",
                post_id,
                AuditLevel::Info,
                format!("submitted to {} target(s)", targets.len()),
            ))
            .await?;

        recompute_post_status(&self.db, post_id).await?;

        tracing::info!(post_id, targets = targets.len(), "post submitted");
        Ok(targets)
    }

    /// Cancel a post's remaining work. Every non-terminal target becomes
    /// terminal with reason `cancelled`; finished targets keep their
    /// outcome. A worker mid-publish completes its current remote call,
    /// but its follow-up transition is refused, so no further retries
    /// happen. Returns the number of cancelled targets.
    pub async fn cancel(&self, post_id: &str, owner_id: &str) -> Result<u64> {
        let post = self
            .db
            .get_post(post_id)
            .await?
            .ok_or_else(|| MultipostError::InvalidInput(format!("unknown post: {}", post_id)))?;

        if post.owner_id != owner_id {
            return Err(MultipostError::Forbidden(format!(
                "post {} is not owned by {}",
                post_id, owner_id
            )));
        }

        let cancelled = self.db.cancel_open_targets(post_id).await?;

        if cancelled > 0 {
            self.db
                .append_audit(&AuditEntry::new(
                    "post",
                    post_id,
                    AuditLevel::Warning,
                    format!("cancelled {} target(s)", cancelled),
                ))
                .await?;
            recompute_post_status(&self.db, post_id).await?;
        }

        tracing::info!(post_id, cancelled, "post cancelled");
        Ok(cancelled)
    }

    /// Current post with its per-target breakdown
    pub async fn status(&self, post_id: &str) -> Result<(Post, Vec<Target>)> {
        let post = self
            .db
            .get_post(post_id)
            .await?
            .ok_or_else(|| MultipostError::InvalidInput(format!("unknown post: {}", post_id)))?;
        let targets = self.db.get_targets_for_post(post_id).await?;
        Ok((post, targets))
    }

    async fn resolve_accounts(
        &self,
        owner_id: &str,
        account_ids: &[String],
    ) -> Result<Vec<SocialAccount>> {
        if account_ids.is_empty() {
            return self.db.list_accounts(owner_id).await;
        }

        let mut accounts = Vec::with_capacity(account_ids.len());
        for account_id in account_ids {
            let account = self.db.get_account(account_id).await?.ok_or_else(|| {
                MultipostError::InvalidInput(format!("unknown account: {}", account_id))
            })?;

            if account.owner_id != owner_id {
                return Err(MultipostError::Forbidden(format!(
                    "account {} is not owned by {}",
                    account_id, owner_id
                )));
            }
            accounts.push(account);
        }
        Ok(accounts)
    }
}

/// Derive the aggregate post status from its target states.
///
/// All published means published; any target still in play means
/// publishing; otherwise every target is terminal and at least one
/// failed. Returns None for a post with no targets.
pub fn aggregate_status(states: &[TargetState]) -> Option<PostStatus> {
    if states.is_empty() {
        return None;
    }

    if states.iter().all(|s| *s == TargetState::Published) {
        return Some(PostStatus::Published);
    }

    if states.iter().any(|s| !s.is_terminal()) {
        return Some(PostStatus::Publishing);
    }

    Some(PostStatus::Failed)
}

/// Recompute and persist a post's aggregate status from its targets.
///
/// Reading states and writing the status is not transactional; the
/// recompute after the final target transition always runs against
/// all-terminal states, so the last write wins with the correct value.
pub async fn recompute_post_status(db: &Database, post_id: &str) -> Result<PostStatus> {
    let targets = db.get_targets_for_post(post_id).await?;
    let states: Vec<TargetState> = targets.iter().map(|t| t.state).collect();

    let status = aggregate_status(&states).unwrap_or(PostStatus::Draft);
    db.update_post_status(post_id, status).await?;
    Ok(status)
}
