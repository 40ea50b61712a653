//! Token refresh and maintenance sweeps
//!
//! The refresh sweep walks credentials that expire inside the lookahead
//! window and exchanges their refresh tokens for fresh grants. Accounts
//! are processed independently: one provider rejecting a refresh never
//! blocks the rest of the sweep. A refresh that the provider refuses
//! flags the account for re-authorization so subsequent sweeps skip it
//! instead of hammering a dead grant every hour.

use std::sync::Arc;

use crate::credentials::CredentialStore;
use crate::db::Database;
use crate::error::{CredentialError, MultipostError, Result};
use crate::platforms::{AdapterSet, TokenGrant};
use crate::types::{AuditEntry, AuditLevel};

/// Outcome counts for one sweep run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub examined: usize,
    pub refreshed: usize,
    pub flagged: usize,
    pub skipped: usize,
}

pub struct RefreshSweep {
    db: Database,
    credentials: CredentialStore,
    adapters: Arc<AdapterSet>,
    lookahead_secs: i64,
}

impl RefreshSweep {
    pub fn new(
        db: Database,
        credentials: CredentialStore,
        adapters: Arc<AdapterSet>,
        lookahead_secs: i64,
    ) -> Self {
        Self {
            db,
            credentials,
            adapters,
            lookahead_secs,
        }
    }

    /// Refresh every credential expiring within the lookahead window.
    pub async fn run(&self, now: i64) -> Result<SweepReport> {
        let expiring = self.credentials.expiring_within(now, self.lookahead_secs).await?;
        let mut report = SweepReport {
            examined: expiring.len(),
            ..Default::default()
        };

        tracing::info!(candidates = expiring.len(), "refresh sweep started");

        for cred in expiring {
            match self.refresh_one(&cred.account_id, cred.version).await {
                Ok(RefreshOutcome::Refreshed) => report.refreshed += 1,
                Ok(RefreshOutcome::Flagged) => report.flagged += 1,
                Ok(RefreshOutcome::Skipped) => report.skipped += 1,
                Err(e) => {
                    // Infrastructure failure for this account only; the
                    // sweep carries on
                    tracing::error!(account_id = %cred.account_id, "refresh failed: {}", e);
                    report.skipped += 1;
                }
            }
        }

        tracing::info!(
            refreshed = report.refreshed,
            flagged = report.flagged,
            skipped = report.skipped,
            "refresh sweep finished"
        );
        Ok(report)
    }

    async fn refresh_one(&self, account_id: &str, version: i64) -> Result<RefreshOutcome> {
        let Some(account) = self.db.get_account(account_id).await? else {
            tracing::warn!(account_id, "credential for unknown account, skipping");
            return Ok(RefreshOutcome::Skipped);
        };

        let Some(adapter) = self.adapters.get(&account.platform) else {
            tracing::warn!(account_id, platform = %account.platform, "platform not configured, skipping");
            return Ok(RefreshOutcome::Skipped);
        };

        let Some(refresh_token) = self.credentials.decrypt_refresh(account_id).await? else {
            self.flag(account_id, "no refresh token stored").await?;
            return Ok(RefreshOutcome::Flagged);
        };

        let grant = match adapter.refresh(&refresh_token).await {
            Ok(grant) => grant,
            Err(MultipostError::Platform(e)) if !e.is_retryable() => {
                self.flag(account_id, &format!("provider refused refresh: {}", e))
                    .await?;
                return Ok(RefreshOutcome::Flagged);
            }
            Err(e) => {
                // Transient failure: leave the credential alone, the next
                // sweep will pick it up again
                tracing::warn!(account_id, "refresh attempt failed transiently: {}", e);
                return Ok(RefreshOutcome::Skipped);
            }
        };

        match self.store_grant(account_id, &grant, version).await {
            Ok(()) => {}
            Err(MultipostError::Credential(CredentialError::CasConflict(_))) => {
                // Another writer bumped the version mid-refresh. Retry once
                // against the current version; a second conflict means a
                // fresh grant already landed and ours is stale.
                let current = self.credentials.get(account_id).await?;
                if let Err(e) = self.store_grant(account_id, &grant, current.version).await {
                    if matches!(
                        e,
                        MultipostError::Credential(CredentialError::CasConflict(_))
                    ) {
                        tracing::debug!(account_id, "credential updated concurrently, dropping refresh result");
                        return Ok(RefreshOutcome::Skipped);
                    }
                    return Err(e);
                }
            }
            Err(e) => return Err(e),
        }

        self.db
            .append_audit(&AuditEntry::new(
                "credential",
                account_id,
                AuditLevel::Info,
                "access token refreshed",
            ))
            .await?;

        tracing::info!(account_id, "credential refreshed");
        Ok(RefreshOutcome::Refreshed)
    }

    async fn store_grant(
        &self,
        account_id: &str,
        grant: &TokenGrant,
        expected_version: i64,
    ) -> Result<()> {
        use secrecy::ExposeSecret;

        self.credentials
            .put_versioned(
                account_id,
                grant.access_token.expose_secret(),
                grant.refresh_token.as_ref().map(|t| t.expose_secret()),
                grant.expires_at,
                expected_version,
            )
            .await
    }

    async fn flag(&self, account_id: &str, reason: &str) -> Result<()> {
        self.credentials.flag_needs_reauth(account_id).await?;
        self.db
            .append_audit(&AuditEntry::new(
                "credential",
                account_id,
                AuditLevel::Warning,
                format!("flagged for re-authorization: {}", reason),
            ))
            .await?;
        Ok(())
    }
}

enum RefreshOutcome {
    Refreshed,
    Flagged,
    Skipped,
}

/// Purge audit entries older than the retention horizon. Returns the
/// number of deleted entries.
pub async fn retention_sweep(db: &Database, now: i64, retention_days: i64) -> Result<u64> {
    let cutoff = now - retention_days * 24 * 3600;
    let purged = db.purge_audit_before(cutoff).await?;

    if purged > 0 {
        tracing::info!(purged, "retention sweep purged audit entries");
    }
    Ok(purged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AuditLevel, Platform, SocialAccount};
    use tempfile::TempDir;

    async fn setup() -> (Database, CredentialStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.db");
        let db = Database::new(path.to_str().unwrap()).await.unwrap();
        let store = CredentialStore::new(db.clone(), "sweep-test-master-key-01".to_string());
        (db, store, dir)
    }

    #[tokio::test]
    async fn test_retention_sweep_purges_only_old_entries() {
        let (db, _store, _dir) = setup().await;
        let now = 100 * 24 * 3600;

        let mut old = AuditEntry::new("target", "t-1", AuditLevel::Info, "ancient");
        old.created_at = now - 91 * 24 * 3600;
        db.append_audit(&old).await.unwrap();

        let mut recent = AuditEntry::new("target", "t-1", AuditLevel::Info, "recent");
        recent.created_at = now - 10 * 24 * 3600;
        db.append_audit(&recent).await.unwrap();

        let purged = retention_sweep(&db, now, 90).await.unwrap();
        assert_eq!(purged, 1);

        let remaining = db.get_audit_entries("target", "t-1").await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].message, "recent");
    }

    #[tokio::test]
    async fn test_sweep_with_no_candidates() {
        let (db, store, _dir) = setup().await;

        let account = db
            .upsert_account(&SocialAccount::new(
                "user-1".to_string(),
                Platform::Facebook,
                "page-1".to_string(),
            ))
            .await
            .unwrap();
        // Expires far beyond the lookahead
        store
            .put(&account.id, "access", Some("refresh"), Some(i64::MAX))
            .await
            .unwrap();

        let sweep = RefreshSweep::new(
            db,
            store,
            Arc::new(crate::platforms::AdapterSet::new()),
            7200,
        );
        let report = sweep.run(1_000_000).await.unwrap();
        assert_eq!(report.examined, 0);
        assert_eq!(report.refreshed, 0);
    }
}
