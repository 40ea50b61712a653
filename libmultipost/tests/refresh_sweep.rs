//! Token refresh sweep tests

use libmultipost::credentials::CredentialStore;
use libmultipost::db::Database;
use libmultipost::error::PlatformError;
use libmultipost::platforms::mock::{MockAdapter, RefreshOutcome};
use libmultipost::platforms::{AdapterSet, PlatformAdapter};
use libmultipost::refresh::RefreshSweep;
use libmultipost::types::{Platform, SocialAccount};
use secrecy::ExposeSecret;
use std::collections::HashMap;
use std::sync::Arc;
use tempfile::TempDir;

const NOW: i64 = 1_700_000_000;
const LOOKAHEAD: i64 = 2 * 3600;

struct Harness {
    db: Database,
    credentials: CredentialStore,
    sweep: RefreshSweep,
    mock: Arc<MockAdapter>,
    _dir: TempDir,
}

impl Harness {
    async fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sweep.db");
        let db = Database::new(path.to_str().unwrap()).await.unwrap();
        let credentials = CredentialStore::new(db.clone(), "sweep-test-master-key".to_string());

        let mock = Arc::new(MockAdapter::new(Platform::Facebook));
        let mut adapters: AdapterSet = HashMap::new();
        adapters.insert(Platform::Facebook, mock.clone() as Arc<dyn PlatformAdapter>);

        let sweep = RefreshSweep::new(
            db.clone(),
            credentials.clone(),
            Arc::new(adapters),
            LOOKAHEAD,
        );

        Self {
            db,
            credentials,
            sweep,
            mock,
            _dir: dir,
        }
    }

    async fn account_expiring_at(&self, remote_id: &str, expires_at: i64) -> SocialAccount {
        let account = self
            .db
            .upsert_account(&SocialAccount::new(
                "user-1".to_string(),
                Platform::Facebook,
                remote_id.to_string(),
            ))
            .await
            .unwrap();

        self.credentials
            .put(
                &account.id,
                &format!("access-{}", remote_id),
                Some(&format!("refresh-{}", remote_id)),
                Some(expires_at),
            )
            .await
            .unwrap();

        account
    }
}

#[tokio::test]
async fn test_expiring_credential_is_refreshed_distant_one_untouched() {
    let h = Harness::new().await;

    // 90 minutes out: inside the 2h lookahead
    let soon = h.account_expiring_at("page-soon", NOW + 90 * 60).await;
    // 3 hours out: left alone
    let later = h.account_expiring_at("page-later", NOW + 3 * 3600).await;

    h.mock.push_refresh_outcome(Ok(RefreshOutcome {
        access_token: "fresh-access".to_string(),
        refresh_token: Some("fresh-refresh".to_string()),
        expires_at: Some(NOW + 60 * 24 * 3600),
    }));

    let report = h.sweep.run(NOW).await.unwrap();
    assert_eq!(report.examined, 1);
    assert_eq!(report.refreshed, 1);
    assert_eq!(h.mock.refresh_call_count(), 1);

    let refreshed = h.credentials.get(&soon.id).await.unwrap();
    assert_eq!(refreshed.expires_at, Some(NOW + 60 * 24 * 3600));
    assert_eq!(refreshed.version, 2);
    let access = h.credentials.decrypt_access(&soon.id).await.unwrap();
    assert_eq!(access.expose_secret(), "fresh-access");

    let untouched = h.credentials.get(&later.id).await.unwrap();
    assert_eq!(untouched.expires_at, Some(NOW + 3 * 3600));
    assert_eq!(untouched.version, 1);
}

#[tokio::test]
async fn test_refresh_failure_is_isolated_per_account() {
    let h = Harness::new().await;

    // The sweep visits credentials in expiry order
    let first = h.account_expiring_at("page-a", NOW + 10 * 60).await;
    let second = h.account_expiring_at("page-b", NOW + 20 * 60).await;

    h.mock
        .push_refresh_outcome(Err(PlatformError::InvalidToken("revoked".to_string())));
    h.mock.push_refresh_outcome(Ok(RefreshOutcome {
        access_token: "fresh-b".to_string(),
        refresh_token: None,
        expires_at: Some(NOW + 7 * 24 * 3600),
    }));

    let report = h.sweep.run(NOW).await.unwrap();
    assert_eq!(report.examined, 2);
    assert_eq!(report.flagged, 1);
    assert_eq!(report.refreshed, 1);

    // First account is flagged, not retried blindly
    assert!(h.credentials.get(&first.id).await.unwrap().needs_reauth);

    // Second account refreshed despite its neighbor's failure
    let cred = h.credentials.get(&second.id).await.unwrap();
    assert!(!cred.needs_reauth);
    let access = h.credentials.decrypt_access(&second.id).await.unwrap();
    assert_eq!(access.expose_secret(), "fresh-b");
}

#[tokio::test]
async fn test_flagged_credential_is_not_swept_again() {
    let h = Harness::new().await;

    let account = h.account_expiring_at("page-1", NOW + 60).await;
    h.credentials.flag_needs_reauth(&account.id).await.unwrap();

    let report = h.sweep.run(NOW).await.unwrap();
    assert_eq!(report.examined, 0);
    assert_eq!(h.mock.refresh_call_count(), 0);
}

#[tokio::test]
async fn test_transient_refresh_failure_leaves_credential_for_next_sweep() {
    let h = Harness::new().await;

    let account = h.account_expiring_at("page-1", NOW + 60).await;
    h.mock
        .push_refresh_outcome(Err(PlatformError::Network("connection reset".to_string())));

    let report = h.sweep.run(NOW).await.unwrap();
    assert_eq!(report.skipped, 1);
    assert_eq!(report.flagged, 0);

    // Untouched and unflagged: the next sweep will try again
    let cred = h.credentials.get(&account.id).await.unwrap();
    assert!(!cred.needs_reauth);
    assert_eq!(cred.version, 1);
}

#[tokio::test]
async fn test_missing_refresh_token_flags_the_account() {
    let h = Harness::new().await;

    let account = h
        .db
        .upsert_account(&SocialAccount::new(
            "user-1".to_string(),
            Platform::Facebook,
            "page-1".to_string(),
        ))
        .await
        .unwrap();
    h.credentials
        .put(&account.id, "access-only", None, Some(NOW + 60))
        .await
        .unwrap();

    let report = h.sweep.run(NOW).await.unwrap();
    assert_eq!(report.flagged, 1);
    assert_eq!(h.mock.refresh_call_count(), 0);
    assert!(h.credentials.get(&account.id).await.unwrap().needs_reauth);
}

#[tokio::test]
async fn test_relinked_credential_refreshes_at_its_current_version() {
    let h = Harness::new().await;

    let account = h.account_expiring_at("page-1", NOW + 60).await;
    h.mock.push_refresh_outcome(Ok(RefreshOutcome {
        access_token: "sweep-access".to_string(),
        refresh_token: None,
        expires_at: Some(NOW + 3600),
    }));

    // An owner re-links before the sweep visits the account, bumping the
    // credential version past what a stale snapshot would carry
    h.credentials
        .put(&account.id, "relinked-access", Some("relinked-refresh"), Some(NOW + 3000))
        .await
        .unwrap();

    let report = h.sweep.run(NOW).await.unwrap();
    assert_eq!(report.examined, 1);
    assert_eq!(report.refreshed, 1);

    let cred = h.credentials.get(&account.id).await.unwrap();
    assert_eq!(cred.version, 3);
}
