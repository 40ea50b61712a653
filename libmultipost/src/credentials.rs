//! Encrypted credential storage
//!
//! Token material is encrypted at rest with age passphrase encryption,
//! keyed by the master key from configuration. Plaintext tokens only ever
//! exist in memory, wrapped in [`SecretString`] so they are zeroized on
//! drop and kept out of Debug output. Refresh writes go through an
//! optimistic version check so a concurrent refresh loses cleanly instead
//! of silently overwriting newer tokens.

use secrecy::{ExposeSecret, SecretString};
use sqlx::Row;
use std::io::{Read, Write};

use crate::db::Database;
use crate::error::{CredentialError, Result};

/// Credential metadata. Token bytes stay in the database; this struct
/// carries only what callers need to make refresh and publish decisions.
#[derive(Debug, Clone)]
pub struct Credential {
    pub account_id: String,
    pub expires_at: Option<i64>,
    pub needs_reauth: bool,
    pub version: i64,
    pub has_refresh: bool,
}

impl Credential {
    /// Whether the access token has expired as of `now`.
    pub fn is_expired(&self, now: i64) -> bool {
        matches!(self.expires_at, Some(exp) if exp <= now)
    }

    /// Check the credential is fit for a publish attempt as of `now`.
    /// Flagged credentials are revoked until the owner re-links; expired
    /// ones are a distinct kind so callers can tell the two apart.
    pub fn ensure_usable(&self, now: i64) -> std::result::Result<(), CredentialError> {
        if self.needs_reauth {
            return Err(CredentialError::RevokedOrInvalid(self.account_id.clone()));
        }
        if self.is_expired(now) {
            return Err(CredentialError::Expired(self.account_id.clone()));
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct CredentialStore {
    db: Database,
    master_key: SecretString,
}

impl CredentialStore {
    pub fn new(db: Database, master_key: String) -> Self {
        Self {
            db,
            master_key: SecretString::from(master_key),
        }
    }

    /// Store tokens for an account, replacing any existing credential.
    ///
    /// A fresh grant always clears `needs_reauth` and bumps the version,
    /// so refresh sweeps racing against a re-link lose their CAS.
    pub async fn put(
        &self,
        account_id: &str,
        access_token: &str,
        refresh_token: Option<&str>,
        expires_at: Option<i64>,
    ) -> Result<()> {
        let access_enc = self.encrypt(access_token)?;
        let refresh_enc = match refresh_token {
            Some(t) => Some(self.encrypt(t)?),
            None => None,
        };

        sqlx::query(
            r#"
            INSERT INTO credentials (account_id, access_secret, refresh_secret, expires_at, needs_reauth, version)
            VALUES (?, ?, ?, ?, 0, 1)
            ON CONFLICT (account_id) DO UPDATE SET
                access_secret = excluded.access_secret,
                refresh_secret = excluded.refresh_secret,
                expires_at = excluded.expires_at,
                needs_reauth = 0,
                version = credentials.version + 1
            "#,
        )
        .bind(account_id)
        .bind(access_enc)
        .bind(refresh_enc)
        .bind(expires_at)
        .execute(self.db.pool())
        .await
        .map_err(crate::error::DbError::SqlxError)?;

        tracing::debug!(account_id, "stored credential");
        Ok(())
    }

    /// Store refreshed tokens only if the credential is still at
    /// `expected_version`. Fails with `CasConflict` when another writer
    /// got there first.
    pub async fn put_versioned(
        &self,
        account_id: &str,
        access_token: &str,
        refresh_token: Option<&str>,
        expires_at: Option<i64>,
        expected_version: i64,
    ) -> Result<()> {
        let access_enc = self.encrypt(access_token)?;
        let refresh_enc = match refresh_token {
            Some(t) => Some(self.encrypt(t)?),
            None => None,
        };

        let result = sqlx::query(
            r#"
            UPDATE credentials
            SET access_secret = ?,
                refresh_secret = COALESCE(?, refresh_secret),
                expires_at = ?,
                needs_reauth = 0,
                version = version + 1
            WHERE account_id = ? AND version = ?
            "#,
        )
        .bind(access_enc)
        .bind(refresh_enc)
        .bind(expires_at)
        .bind(account_id)
        .bind(expected_version)
        .execute(self.db.pool())
        .await
        .map_err(crate::error::DbError::SqlxError)?;

        if result.rows_affected() == 0 {
            return Err(CredentialError::CasConflict(account_id.to_string()).into());
        }

        tracing::debug!(account_id, expected_version, "refreshed credential");
        Ok(())
    }

    /// Get credential metadata for an account
    pub async fn get(&self, account_id: &str) -> Result<Credential> {
        let row = sqlx::query(
            r#"
            SELECT account_id, expires_at, needs_reauth, version,
                   refresh_secret IS NOT NULL AS has_refresh
            FROM credentials WHERE account_id = ?
            "#,
        )
        .bind(account_id)
        .fetch_optional(self.db.pool())
        .await
        .map_err(crate::error::DbError::SqlxError)?;

        let row = row.ok_or_else(|| CredentialError::NotFound(account_id.to_string()))?;

        Ok(Credential {
            account_id: row.get("account_id"),
            expires_at: row.get("expires_at"),
            needs_reauth: row.get::<i64, _>("needs_reauth") != 0,
            version: row.get("version"),
            has_refresh: row.get::<i64, _>("has_refresh") != 0,
        })
    }

    /// Decrypt the access token for an account
    pub async fn decrypt_access(&self, account_id: &str) -> Result<SecretString> {
        let blob = self.fetch_secret(account_id, "access_secret").await?;
        let blob = blob.ok_or_else(|| CredentialError::NotFound(account_id.to_string()))?;
        self.decrypt(&blob)
    }

    /// Decrypt the refresh token for an account, if one is stored
    pub async fn decrypt_refresh(&self, account_id: &str) -> Result<Option<SecretString>> {
        match self.fetch_secret(account_id, "refresh_secret").await? {
            Some(blob) => Ok(Some(self.decrypt(&blob)?)),
            None => Ok(None),
        }
    }

    /// Flag an account as needing the owner to re-authorize. Flagged
    /// credentials are skipped by refresh sweeps until a new grant lands.
    pub async fn flag_needs_reauth(&self, account_id: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE credentials SET needs_reauth = 1 WHERE account_id = ?
            "#,
        )
        .bind(account_id)
        .execute(self.db.pool())
        .await
        .map_err(crate::error::DbError::SqlxError)?;

        tracing::warn!(account_id, "credential flagged for re-authorization");
        Ok(())
    }

    /// Credentials whose access token expires within the lookahead window,
    /// excluding those already flagged for re-authorization.
    pub async fn expiring_within(&self, now: i64, lookahead_secs: i64) -> Result<Vec<Credential>> {
        let rows = sqlx::query(
            r#"
            SELECT account_id, expires_at, needs_reauth, version,
                   refresh_secret IS NOT NULL AS has_refresh
            FROM credentials
            WHERE expires_at IS NOT NULL
              AND expires_at <= ?
              AND needs_reauth = 0
            ORDER BY expires_at
            "#,
        )
        .bind(now + lookahead_secs)
        .fetch_all(self.db.pool())
        .await
        .map_err(crate::error::DbError::SqlxError)?;

        Ok(rows
            .iter()
            .map(|row| Credential {
                account_id: row.get("account_id"),
                expires_at: row.get("expires_at"),
                needs_reauth: row.get::<i64, _>("needs_reauth") != 0,
                version: row.get("version"),
                has_refresh: row.get::<i64, _>("has_refresh") != 0,
            })
            .collect())
    }

    async fn fetch_secret(&self, account_id: &str, column: &str) -> Result<Option<Vec<u8>>> {
        // column comes from a fixed call site, never user input
        let query_str = format!("SELECT {} FROM credentials WHERE account_id = ?", column);

        let row = sqlx::query(&query_str)
            .bind(account_id)
            .fetch_optional(self.db.pool())
            .await
            .map_err(crate::error::DbError::SqlxError)?;

        match row {
            Some(r) => Ok(r.get(0)),
            None => Err(CredentialError::NotFound(account_id.to_string()).into()),
        }
    }

    fn encrypt(&self, plaintext: &str) -> Result<Vec<u8>> {
        let encryptor = age::Encryptor::with_user_passphrase(age::secrecy::Secret::new(
            self.master_key.expose_secret().to_string(),
        ));

        let mut encrypted = vec![];
        let mut writer = encryptor
            .wrap_output(&mut encrypted)
            .map_err(|e| CredentialError::Encryption(e.to_string()))?;

        writer
            .write_all(plaintext.as_bytes())
            .map_err(|e| CredentialError::Encryption(e.to_string()))?;

        writer
            .finish()
            .map_err(|e| CredentialError::Encryption(e.to_string()))?;

        Ok(encrypted)
    }

    fn decrypt(&self, data: &[u8]) -> Result<SecretString> {
        let decryptor = match age::Decryptor::new(data) {
            Ok(age::Decryptor::Passphrase(d)) => d,
            Ok(_) => {
                return Err(CredentialError::Decryption(
                    "invalid encryption format (expected passphrase)".to_string(),
                )
                .into())
            }
            Err(e) => return Err(CredentialError::Decryption(e.to_string()).into()),
        };

        let mut decrypted = vec![];
        let mut reader = decryptor
            .decrypt(
                &age::secrecy::Secret::new(self.master_key.expose_secret().to_string()),
                None,
            )
            .map_err(|e| CredentialError::Decryption(e.to_string()))?;

        reader
            .read_to_end(&mut decrypted)
            .map_err(|e| CredentialError::Decryption(e.to_string()))?;

        let plaintext = String::from_utf8(decrypted)
            .map_err(|e| CredentialError::Decryption(format!("invalid UTF-8: {}", e)))?;

        Ok(SecretString::from(plaintext))
    }
}
