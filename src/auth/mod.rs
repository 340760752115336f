//! Account selection and OAuth2 token lifecycle.
//!
//! The token manager is the only component that mutates stored tokens. A
//! per-account async mutex serializes refreshes so concurrent 401s collapse
//! into one wire exchange; late arrivals re-check the stored expiry under
//! the lock and reuse the fresh token.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use log::{debug, info, warn};
use serde::Deserialize;
use tokio::sync::Mutex;

use crate::account::AccountStore;
use crate::config::Oauth2Provider;
use crate::error::{CrawlError, Result};
use crate::models::{Account, AccountUpdate};

/// Name that wins account resolution when present.
const DEFAULT_ACCOUNT_NAME: &str = "default";

/// OAuth2 token endpoint response (RFC 6749 §5.1).
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[allow(dead_code, reason = "required by the wire format but unused")]
    token_type: Option<String>,
    expires_in: Option<i64>,
    refresh_token: Option<String>,
    refresh_expires_in: Option<i64>,
    scope: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: Option<String>,
}

/// Selects an account, serves currently-valid access tokens, and performs
/// OAuth2 refresh against the configured provider.
pub struct TokenManager {
    store: Arc<dyn AccountStore>,
    http: reqwest::Client,
    provider: Option<Oauth2Provider>,
    refresh_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl TokenManager {
    pub fn new(store: Arc<dyn AccountStore>, provider: Option<Oauth2Provider>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(5))
            .timeout(std::time::Duration::from_secs(15))
            .build()?;
        Ok(Self {
            store,
            http,
            provider,
            refresh_locks: Mutex::new(HashMap::new()),
        })
    }

    /// Pick the account a crawl should authenticate as.
    ///
    /// Resolution order: explicit hint (confirmed against the store), an
    /// account literally named `default`, the single account holding both
    /// tokens, the most recently updated account when all belong to one
    /// user, otherwise none — the caller must require explicit selection.
    pub fn resolve_account_id(&self, hint: Option<&str>) -> Option<String> {
        if let Some(hint) = hint {
            return self
                .store
                .find_account_by_account_id(hint)
                .map(|a| a.account_id);
        }
        let accounts = self.store.get_all_accounts();
        if let Some(account) = accounts
            .iter()
            .find(|a| a.account_id == DEFAULT_ACCOUNT_NAME)
        {
            return Some(account.account_id.clone());
        }
        let with_both: Vec<&Account> = accounts.iter().filter(|a| a.has_both_tokens()).collect();
        if let [only] = with_both.as_slice() {
            return Some(only.account_id.clone());
        }
        let mut user_ids: Vec<&str> = accounts.iter().map(|a| a.user_id.as_str()).collect();
        user_ids.sort_unstable();
        user_ids.dedup();
        if let [_single_user] = user_ids.as_slice() {
            return accounts
                .iter()
                .max_by_key(|a| a.updated_at)
                .map(|a| a.account_id.clone());
        }
        None
    }

    /// Return a currently-valid access token, refreshing when expired.
    pub async fn get_access_token(&self, account_id: &str) -> Result<Option<String>> {
        let Some(account) = self.store.find_account_by_account_id(account_id) else {
            return Ok(None);
        };
        if let (Some(token), Some(expires_at)) =
            (&account.access_token, account.access_token_expires_at)
            && Utc::now() < expires_at
        {
            return Ok(Some(token.clone()));
        }
        if account.access_token.is_some() && account.access_token_expires_at.is_none() {
            // Tokens without a recorded expiry (e.g. personal access
            // tokens) are served as-is.
            return Ok(account.access_token);
        }
        self.refresh_access_token(account_id).await
    }

    /// Exchange the refresh token for a new access token.
    ///
    /// On success the new tokens and their absolute expirations are written
    /// back to the store. On failure the stored tokens are left untouched
    /// unless the provider reports the refresh token itself as invalid, in
    /// which case it is cleared.
    pub async fn refresh_access_token(&self, account_id: &str) -> Result<Option<String>> {
        let lock = self.refresh_lock(account_id).await;
        let _guard = lock.lock().await;

        // Another caller may have finished the refresh while this one
        // waited on the lock.
        if let Some(account) = self.store.find_account_by_account_id(account_id)
            && let (Some(token), Some(expires_at)) =
                (&account.access_token, account.access_token_expires_at)
            && Utc::now() < expires_at
        {
            debug!("refresh for {account_id} already completed by a concurrent caller");
            return Ok(Some(token.clone()));
        }

        let Some(account) = self.store.find_account_by_account_id(account_id) else {
            return Ok(None);
        };
        let Some(refresh_token) = account.refresh_token.clone() else {
            debug!("account {account_id} has no refresh token");
            return Ok(None);
        };
        let Some(provider) = &self.provider else {
            debug!("no oauth2 provider configured; cannot refresh {account_id}");
            return Ok(None);
        };

        let mut form = vec![
            ("grant_type", "refresh_token".to_owned()),
            ("refresh_token", refresh_token),
            ("client_id", provider.client_id.clone()),
            ("client_secret", provider.client_secret.clone()),
        ];
        if !provider.scopes.is_empty() {
            form.push(("scope", provider.scopes.join(" ")));
        }
        let response = self
            .http
            .post(&provider.token_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| CrawlError::from_transport(&provider.token_url, e))?;
        let status = response.status();
        let body = response.bytes().await.unwrap_or_default();

        if !status.is_success() {
            let parsed: Option<TokenErrorResponse> = serde_json::from_slice(&body).ok();
            let error = parsed.and_then(|p| p.error).unwrap_or_default();
            if error == "invalid_grant" {
                warn!("provider reports refresh token for {account_id} invalid; clearing it");
                self.invalidate_refresh_token(account_id)?;
            } else {
                warn!(
                    "token refresh for {account_id} failed with HTTP {}: {}",
                    status.as_u16(),
                    String::from_utf8_lossy(&body)
                );
            }
            return Ok(None);
        }

        let token: TokenResponse = serde_json::from_slice(&body).map_err(|e| {
            CrawlError::BadResponse(format!("token endpoint returned malformed JSON: {e}"))
        })?;
        let now = Utc::now();
        let update = AccountUpdate {
            access_token: Some(token.access_token.clone()),
            refresh_token: token.refresh_token,
            access_token_expires_at: token
                .expires_in
                .map(|secs| now + ChronoDuration::seconds(secs)),
            refresh_token_expires_at: token
                .refresh_expires_in
                .map(|secs| now + ChronoDuration::seconds(secs)),
            scope: token.scope,
            clear_refresh_token: false,
        };
        self.store.update_account(account_id, update)?;
        self.store.flush()?;
        info!("refreshed access token for {account_id}");
        Ok(Some(token.access_token))
    }

    /// True iff the refresh token exists and carries a future expiration.
    pub fn validate_refresh_token(&self, account_id: &str) -> bool {
        let Some(account) = self.store.find_account_by_account_id(account_id) else {
            return false;
        };
        match (account.refresh_token, account.refresh_token_expires_at) {
            (Some(_), Some(expires_at)) => Utc::now() < expires_at,
            _ => false,
        }
    }

    /// Drop a refresh token the provider has declared dead.
    pub fn invalidate_refresh_token(&self, account_id: &str) -> Result<()> {
        self.store.update_account(
            account_id,
            AccountUpdate {
                clear_refresh_token: true,
                ..AccountUpdate::default()
            },
        )?;
        self.store.flush()
    }

    async fn refresh_lock(&self, account_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.refresh_locks.lock().await;
        locks
            .entry(account_id.to_owned())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::FileAccountStore;
    use crate::models::{NewAccount, NewUser};
    use chrono::Duration as ChronoDuration;

    fn store_with(accounts: &[NewAccount]) -> (tempfile::TempDir, Arc<FileAccountStore>) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileAccountStore::open(&dir.path().join("accounts.json")).expect("open");
        let mut users: Vec<&str> = accounts.iter().map(|a| a.user_id.as_str()).collect();
        users.sort_unstable();
        users.dedup();
        for user in users {
            store
                .insert_user(NewUser {
                    id: user.into(),
                    name: user.into(),
                    email: format!("{user}@example.com"),
                    email_verified: true,
                })
                .expect("insert user");
        }
        for account in accounts {
            store.insert_account(account.clone()).expect("insert account");
        }
        (dir, Arc::new(store))
    }

    fn manager(store: Arc<FileAccountStore>) -> TokenManager {
        TokenManager::new(store, None).expect("manager")
    }

    fn account(id: &str, user: &str, tokens: bool) -> NewAccount {
        NewAccount {
            account_id: id.into(),
            provider_id: "gitlab".into(),
            user_id: user.into(),
            access_token: tokens.then(|| format!("at-{id}")),
            refresh_token: tokens.then(|| format!("rt-{id}")),
            ..NewAccount::default()
        }
    }

    #[test]
    fn hint_wins_when_confirmed() {
        let (_dir, store) = store_with(&[account("alice", "u1", true)]);
        let manager = manager(store);
        assert_eq!(
            manager.resolve_account_id(Some("alice")).as_deref(),
            Some("alice")
        );
        assert_eq!(manager.resolve_account_id(Some("nobody")), None);
    }

    #[test]
    fn default_named_account_wins_without_hint() {
        let (_dir, store) = store_with(&[
            account("alice", "u1", true),
            account("default", "u2", false),
        ]);
        let manager = manager(store);
        assert_eq!(manager.resolve_account_id(None).as_deref(), Some("default"));
    }

    #[test]
    fn single_fully_tokened_account_wins() {
        let (_dir, store) = store_with(&[
            account("alice", "u1", true),
            account("bob", "u2", false),
        ]);
        let manager = manager(store);
        assert_eq!(manager.resolve_account_id(None).as_deref(), Some("alice"));
    }

    #[test]
    fn ambiguous_accounts_resolve_to_none() {
        let (_dir, store) = store_with(&[
            account("alice", "u1", true),
            account("bob", "u2", true),
        ]);
        let manager = manager(store);
        assert_eq!(manager.resolve_account_id(None), None);
    }

    #[test]
    fn single_user_resolves_to_most_recent() {
        let (_dir, store) = store_with(&[account("old", "u1", true)]);
        // Insert the second account after the first so its timestamps are
        // strictly newer.
        std::thread::sleep(std::time::Duration::from_millis(5));
        store
            .insert_account(account("new", "u1", true))
            .expect("insert");
        let manager = manager(store);
        assert_eq!(manager.resolve_account_id(None).as_deref(), Some("new"));
    }

    #[test]
    fn validate_refresh_token_requires_future_expiry() {
        let (_dir, store) = store_with(&[NewAccount {
            refresh_token_expires_at: Some(Utc::now() - ChronoDuration::hours(1)),
            ..account("alice", "u1", true)
        }]);
        let manager = manager(store.clone());
        assert!(!manager.validate_refresh_token("alice"));
        store
            .update_account(
                "alice",
                AccountUpdate {
                    refresh_token_expires_at: Some(Utc::now() + ChronoDuration::hours(1)),
                    ..AccountUpdate::default()
                },
            )
            .expect("update");
        assert!(manager.validate_refresh_token("alice"));
    }

    #[tokio::test]
    async fn unexpired_access_token_is_served_without_refresh() {
        let (_dir, store) = store_with(&[NewAccount {
            access_token_expires_at: Some(Utc::now() + ChronoDuration::hours(1)),
            ..account("alice", "u1", true)
        }]);
        let manager = manager(store);
        let token = manager.get_access_token("alice").await.expect("token");
        assert_eq!(token.as_deref(), Some("at-alice"));
    }

    #[tokio::test]
    async fn expired_token_without_provider_yields_none() {
        let (_dir, store) = store_with(&[NewAccount {
            access_token_expires_at: Some(Utc::now() - ChronoDuration::hours(1)),
            ..account("alice", "u1", true)
        }]);
        let manager = manager(store);
        let token = manager.get_access_token("alice").await.expect("lookup");
        assert_eq!(token, None);
    }
}
