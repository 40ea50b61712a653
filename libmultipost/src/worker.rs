//! Per-platform publish workers
//!
//! Each platform gets its own queue and worker pool, so one provider's
//! rate limits or outages never stall the others. A message on a queue is
//! only a hint that a target may need work; the atomic claim in the
//! database is the sole source of truth, which makes duplicate delivery
//! and crash-recovery requeues harmless.

use secrecy::SecretString;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use crate::credentials::CredentialStore;
use crate::db::Database;
use crate::error::{CredentialError, MultipostError, PlatformError, Result};
use crate::orchestrator::recompute_post_status;
use crate::platforms::AdapterSet;
use crate::target::RetryPolicy;
use crate::types::{AuditEntry, AuditLevel, Platform, Target};

/// A hint that a target may be ready for a publish attempt. The attempt
/// count is a snapshot from enqueue time and may be stale; the worker
/// re-fetches the target before acting on it.
#[derive(Debug, Clone)]
pub struct ClaimMessage {
    pub target_id: String,
    pub attempt_count: u32,
}

/// Send side of the per-platform queues.
#[derive(Clone)]
pub struct QueueSet {
    senders: HashMap<Platform, mpsc::UnboundedSender<ClaimMessage>>,
}

impl QueueSet {
    pub fn enqueue(&self, platform: Platform, msg: ClaimMessage) -> Result<()> {
        let sender = self
            .senders
            .get(&platform)
            .ok_or_else(|| MultipostError::Queue(format!("no queue for platform {}", platform)))?;

        sender
            .send(msg)
            .map_err(|_| MultipostError::Queue(format!("queue for {} is closed", platform)))
    }
}

/// Build one queue per platform, returning the shared send side and the
/// receive ends for the worker pools.
pub fn build_queues() -> (
    QueueSet,
    HashMap<Platform, mpsc::UnboundedReceiver<ClaimMessage>>,
) {
    let mut senders = HashMap::new();
    let mut receivers = HashMap::new();

    for platform in Platform::ALL {
        let (tx, rx) = mpsc::unbounded_channel();
        senders.insert(platform, tx);
        receivers.insert(platform, rx);
    }

    (QueueSet { senders }, receivers)
}

/// Everything a worker needs to process a claim.
#[derive(Clone)]
pub struct PublishContext {
    pub db: Database,
    pub credentials: CredentialStore,
    pub adapters: Arc<AdapterSet>,
    pub queues: QueueSet,
    pub retry: RetryPolicy,
    pub call_timeout: Duration,
}

/// Process one queued claim end to end.
///
/// The sequence is: terminal re-check (idempotent redelivery no-op),
/// atomic claim, credential gate, timed adapter call, then exactly one
/// state transition plus an audit entry. Errors from the remote side are
/// absorbed into target state; only infrastructure failures (database,
/// queue) propagate.
pub async fn process_message(ctx: &PublishContext, msg: ClaimMessage) -> Result<()> {
    let Some(target) = ctx.db.get_target(&msg.target_id).await? else {
        tracing::warn!(target_id = %msg.target_id, "queued target no longer exists");
        return Ok(());
    };

    if target.state.is_terminal() {
        tracing::debug!(target_id = %target.id, state = %target.state, "redelivery for terminal target, skipping");
        return Ok(());
    }

    let Some(claimed) = ctx.db.claim_target(&msg.target_id).await? else {
        // Another worker holds it, or it went terminal since the re-check
        tracing::debug!(target_id = %msg.target_id, "claim lost, skipping");
        return Ok(());
    };

    let Some(account) = ctx.db.get_account(&claimed.account_id).await? else {
        return fail_terminal(ctx, &claimed, "linked account no longer exists").await;
    };

    let Some(post) = ctx.db.get_post(&claimed.post_id).await? else {
        return fail_terminal(ctx, &claimed, "post no longer exists").await;
    };

    let Some(adapter) = ctx.adapters.get(&account.platform) else {
        return fail_terminal(
            ctx,
            &claimed,
            &format!("platform {} is not configured", account.platform),
        )
        .await;
    };

    let access_token = match credential_gate(ctx, &claimed, &account.id).await? {
        CredentialGate::Ready(token) => token,
        CredentialGate::Handled => return Ok(()),
    };

    let idempotency_key = format!("{}:{}", claimed.id, claimed.attempt_count);

    tracing::info!(
        target_id = %claimed.id,
        platform = %account.platform,
        attempt = claimed.attempt_count,
        "publishing"
    );

    let outcome = match tokio::time::timeout(
        ctx.call_timeout,
        adapter.publish(&access_token, &account, &post, &idempotency_key),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => Err(PlatformError::Timeout(format!(
            "publish call exceeded {}s",
            ctx.call_timeout.as_secs()
        ))
        .into()),
    };

    match outcome {
        Ok(receipt) => {
            if !ctx
                .db
                .mark_target_published(&claimed.id, &receipt.platform_post_id)
                .await?
            {
                // Cancelled while the remote call was in flight
                tracing::warn!(target_id = %claimed.id, "target went terminal mid-publish, outcome dropped");
                return Ok(());
            }
            ctx.db
                .append_audit(&AuditEntry::new(
                    "target",
                    &claimed.id,
                    AuditLevel::Info,
                    format!(
                        "published as {} on attempt {}",
                        receipt.platform_post_id, claimed.attempt_count
                    ),
                ))
                .await?;
            recompute_post_status(&ctx.db, &claimed.post_id).await?;

            tracing::info!(target_id = %claimed.id, remote_id = %receipt.platform_post_id, "publish succeeded");
            Ok(())
        }
        Err(MultipostError::Platform(e)) => {
            if matches!(e, PlatformError::InvalidToken(_)) {
                ctx.credentials.flag_needs_reauth(&account.id).await?;
            }

            if e.is_retryable() && ctx.retry.attempts_remain(claimed.attempt_count) {
                fail_retryable(ctx, &claimed, account.platform, &e.to_string()).await
            } else {
                fail_terminal(ctx, &claimed, &e.to_string()).await
            }
        }
        Err(other) => {
            // Infrastructure failure mid-attempt: undo the claim so the
            // attempt is not consumed and the stale-target poll redelivers
            // once the infrastructure recovers. The release itself may
            // fail for the same reason; the original error still surfaces.
            if let Err(release_err) = ctx.db.release_claim(&claimed.id).await {
                tracing::error!(target_id = %claimed.id, "failed to release claim: {}", release_err);
            }
            Err(other)
        }
    }
}

enum CredentialGate {
    Ready(SecretString),
    Handled,
}

/// Check credential health before spending a remote call on a doomed
/// attempt. Missing, flagged, or expired credentials fail the target
/// terminally; an expired one also flags the account for re-auth.
async fn credential_gate(
    ctx: &PublishContext,
    claimed: &Target,
    account_id: &str,
) -> Result<CredentialGate> {
    let cred = match ctx.credentials.get(account_id).await {
        Ok(cred) => cred,
        Err(MultipostError::Credential(CredentialError::NotFound(_))) => {
            fail_terminal(ctx, claimed, "no credential stored for account").await?;
            return Ok(CredentialGate::Handled);
        }
        Err(e) => return Err(e),
    };

    match cred.ensure_usable(chrono::Utc::now().timestamp()) {
        Ok(()) => {}
        Err(e @ CredentialError::Expired(_)) => {
            ctx.credentials.flag_needs_reauth(account_id).await?;
            fail_terminal(ctx, claimed, &e.to_string()).await?;
            return Ok(CredentialGate::Handled);
        }
        Err(e) => {
            fail_terminal(ctx, claimed, &e.to_string()).await?;
            return Ok(CredentialGate::Handled);
        }
    }

    match ctx.credentials.decrypt_access(account_id).await {
        Ok(token) => Ok(CredentialGate::Ready(token)),
        Err(MultipostError::Credential(CredentialError::Decryption(e))) => {
            fail_terminal(ctx, claimed, &format!("credential decryption failed: {}", e)).await?;
            Ok(CredentialGate::Handled)
        }
        Err(e) => Err(e),
    }
}

/// Record a retryable failure and schedule the delayed re-enqueue. A
/// refused transition means the target went terminal while the attempt
/// was in flight (cancellation); no retry is scheduled then.
async fn fail_retryable(
    ctx: &PublishContext,
    claimed: &Target,
    platform: Platform,
    error: &str,
) -> Result<()> {
    if !ctx.db.mark_target_failed_retryable(&claimed.id, error).await? {
        tracing::warn!(target_id = %claimed.id, "target went terminal mid-publish, retry suppressed");
        return Ok(());
    }
    ctx.db
        .append_audit(&AuditEntry::new(
            "target",
            &claimed.id,
            AuditLevel::Warning,
            format!("attempt {} failed: {}", claimed.attempt_count, error),
        ))
        .await?;
    recompute_post_status(&ctx.db, &claimed.post_id).await?;

    let delay = ctx.retry.backoff_delay(claimed.attempt_count);
    let queues = ctx.queues.clone();
    let target_id = claimed.id.clone();
    let attempt_count = claimed.attempt_count;

    tracing::warn!(
        target_id = %claimed.id,
        attempt = claimed.attempt_count,
        delay_ms = delay.as_millis() as u64,
        error,
        "publish failed, retry scheduled"
    );

    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let msg = ClaimMessage {
            target_id,
            attempt_count,
        };
        if let Err(e) = queues.enqueue(platform, msg) {
            tracing::error!("failed to re-enqueue target: {}", e);
        }
    });

    Ok(())
}

async fn fail_terminal(ctx: &PublishContext, claimed: &Target, error: &str) -> Result<()> {
    if !ctx.db.mark_target_failed_terminal(&claimed.id, error).await? {
        tracing::warn!(target_id = %claimed.id, "target went terminal mid-publish, outcome dropped");
        return Ok(());
    }
    ctx.db
        .append_audit(&AuditEntry::new(
            "target",
            &claimed.id,
            AuditLevel::Error,
            format!(
                "failed permanently on attempt {}: {}",
                claimed.attempt_count, error
            ),
        ))
        .await?;
    recompute_post_status(&ctx.db, &claimed.post_id).await?;

    tracing::error!(target_id = %claimed.id, error, "publish failed permanently");
    Ok(())
}

/// Running worker pools, one per platform.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `per_platform` workers for each platform queue. Workers share
    /// their platform's receiver. On shutdown each worker finishes its
    /// in-flight attempt, drains what is already queued, and exits; a
    /// closed send side also stops the pool.
    pub fn spawn(
        ctx: PublishContext,
        per_platform: u32,
        receivers: HashMap<Platform, mpsc::UnboundedReceiver<ClaimMessage>>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let mut handles = Vec::new();

        for (platform, receiver) in receivers {
            let receiver = Arc::new(Mutex::new(receiver));

            for worker_idx in 0..per_platform {
                let ctx = ctx.clone();
                let receiver = Arc::clone(&receiver);
                let mut shutdown = shutdown.clone();

                handles.push(tokio::spawn(async move {
                    tracing::debug!(%platform, worker_idx, "worker started");
                    loop {
                        let msg = {
                            let mut rx = receiver.lock().await;
                            if *shutdown.borrow() {
                                rx.try_recv().ok()
                            } else {
                                tokio::select! {
                                    msg = rx.recv() => msg,
                                    _ = shutdown.changed() => continue,
                                }
                            }
                        };

                        let Some(msg) = msg else {
                            break;
                        };

                        if let Err(e) = process_message(&ctx, msg).await {
                            tracing::error!(%platform, worker_idx, "worker error: {}", e);
                        }
                    }
                    tracing::debug!(%platform, worker_idx, "worker stopped");
                }));
            }
        }

        Self { handles }
    }

    /// Wait for every worker to drain and exit.
    pub async fn join(self) {
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}
