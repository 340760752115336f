//! JSON-file-backed account store.
//!
//! Users and accounts live in two maps serialized as a single JSON document
//! at `database.path`. Writes mutate the in-memory copy and mark the store
//! dirty; `flush` persists via a temp-file rename so a crash never leaves a
//! half-written database.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use log::debug;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{AccountStore, UserKey};
use crate::error::{CrawlError, Result};
use crate::models::{Account, AccountUpdate, NewAccount, NewUser, User};

#[derive(Debug, Default, Serialize, Deserialize)]
struct Database {
    users: BTreeMap<String, User>,
    accounts: BTreeMap<String, Account>,
}

struct Inner {
    db: Database,
    dirty: bool,
}

/// Account store persisted as a JSON file.
pub struct FileAccountStore {
    path: PathBuf,
    inner: Mutex<Inner>,
}

impl FileAccountStore {
    /// Open the store at `path`, starting empty when the file is missing.
    pub fn open(path: &Path) -> Result<Self> {
        let db = match std::fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("account database {} missing, starting empty", path.display());
                Database::default()
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path: path.to_owned(),
            inner: Mutex::new(Inner { db, dirty: false }),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn persist(&self, inner: &mut Inner) -> Result<()> {
        if !inner.dirty {
            return Ok(());
        }
        let json = serde_json::to_vec_pretty(&inner.db)?;
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        inner.dirty = false;
        Ok(())
    }
}

impl AccountStore for FileAccountStore {
    fn find_account_by_account_id(&self, account_id: &str) -> Option<Account> {
        let inner = self.lock();
        inner
            .db
            .accounts
            .values()
            .find(|a| a.account_id == account_id)
            .cloned()
    }

    fn find_user_by_id(&self, id: &str) -> Option<User> {
        self.lock().db.users.get(id).cloned()
    }

    fn find_user_by_email(&self, email: &str) -> Option<User> {
        let inner = self.lock();
        inner.db.users.values().find(|u| u.email == email).cloned()
    }

    fn find_accounts_by_user_id(&self, user_id: &str) -> Vec<Account> {
        let inner = self.lock();
        inner
            .db
            .accounts
            .values()
            .filter(|a| a.user_id == user_id)
            .cloned()
            .collect()
    }

    fn get_all_accounts(&self) -> Vec<Account> {
        self.lock().db.accounts.values().cloned().collect()
    }

    fn get_accounts_with_users(&self) -> Vec<(Account, User)> {
        let inner = self.lock();
        inner
            .db
            .accounts
            .values()
            .filter_map(|a| {
                inner
                    .db
                    .users
                    .get(&a.user_id)
                    .map(|u| (a.clone(), u.clone()))
            })
            .collect()
    }

    fn insert_user(&self, user: NewUser) -> Result<User> {
        let mut inner = self.lock();
        if inner.db.users.contains_key(&user.id) {
            return Err(CrawlError::Config(format!(
                "user {} already exists",
                user.id
            )));
        }
        let now = Utc::now();
        let user = User {
            id: user.id,
            name: user.name,
            email: user.email,
            email_verified: user.email_verified,
            image: None,
            role: None,
            banned: None,
            ban_reason: None,
            ban_expires: None,
            created_at: now,
            updated_at: now,
        };
        inner.db.users.insert(user.id.clone(), user.clone());
        inner.dirty = true;
        Ok(user)
    }

    fn upsert_user(&self, mut user: User, key: UserKey) -> Result<User> {
        let mut inner = self.lock();
        let existing_id = match key {
            UserKey::Id => inner.db.users.contains_key(&user.id).then(|| user.id.clone()),
            UserKey::Email => inner
                .db
                .users
                .values()
                .find(|u| u.email == user.email)
                .map(|u| u.id.clone()),
        };
        user.updated_at = Utc::now();
        if let Some(id) = existing_id {
            let created_at = inner
                .db
                .users
                .get(&id)
                .map(|u| u.created_at)
                .unwrap_or(user.created_at);
            user.id = id;
            user.created_at = created_at;
        }
        inner.db.users.insert(user.id.clone(), user.clone());
        inner.dirty = true;
        Ok(user)
    }

    fn insert_account(&self, account: NewAccount) -> Result<Account> {
        let mut inner = self.lock();
        if !inner.db.users.contains_key(&account.user_id) {
            return Err(CrawlError::Config(format!(
                "account references unknown user {}",
                account.user_id
            )));
        }
        let duplicate = inner.db.accounts.values().any(|a| {
            a.provider_id == account.provider_id && a.account_id == account.account_id
        });
        if duplicate {
            return Err(CrawlError::Config(format!(
                "account ({}, {}) already exists",
                account.provider_id, account.account_id
            )));
        }
        let now = Utc::now();
        let account = Account {
            id: Uuid::new_v4().to_string(),
            account_id: account.account_id,
            provider_id: account.provider_id,
            user_id: account.user_id,
            access_token: account.access_token,
            refresh_token: account.refresh_token,
            access_token_expires_at: account.access_token_expires_at,
            refresh_token_expires_at: account.refresh_token_expires_at,
            id_token: account.id_token,
            scope: account.scope,
            created_at: now,
            updated_at: now,
        };
        inner.db.accounts.insert(account.id.clone(), account.clone());
        inner.dirty = true;
        Ok(account)
    }

    fn update_account(&self, account_id: &str, update: AccountUpdate) -> Result<()> {
        let mut inner = self.lock();
        let account = inner
            .db
            .accounts
            .values_mut()
            .find(|a| a.account_id == account_id)
            .ok_or_else(|| CrawlError::Config(format!("no account with id {account_id}")))?;
        if let Some(token) = update.access_token {
            account.access_token = Some(token);
        }
        if let Some(token) = update.refresh_token {
            account.refresh_token = Some(token);
        }
        if let Some(at) = update.access_token_expires_at {
            account.access_token_expires_at = Some(at);
        }
        if let Some(at) = update.refresh_token_expires_at {
            account.refresh_token_expires_at = Some(at);
        }
        if let Some(scope) = update.scope {
            account.scope = Some(scope);
        }
        if update.clear_refresh_token {
            account.refresh_token = None;
            account.refresh_token_expires_at = None;
        }
        account.updated_at = Utc::now();
        inner.dirty = true;
        Ok(())
    }

    fn delete_account(&self, id: &str) -> Result<()> {
        let mut inner = self.lock();
        inner.db.accounts.remove(id);
        inner.dirty = true;
        Ok(())
    }

    fn delete_user(&self, id: &str) -> Result<()> {
        let mut inner = self.lock();
        inner.db.users.remove(id);
        inner.db.accounts.retain(|_, a| a.user_id != id);
        inner.dirty = true;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        let mut inner = self.lock();
        self.persist(&mut inner)
    }
}

impl Drop for FileAccountStore {
    fn drop(&mut self) {
        if let Ok(mut inner) = self.inner.lock()
            && inner.dirty
            && let Err(e) = self.persist(&mut inner)
        {
            log::warn!("failed to flush account store on drop: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::AccountStore;

    fn store() -> (tempfile::TempDir, FileAccountStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileAccountStore::open(&dir.path().join("accounts.json")).expect("open");
        (dir, store)
    }

    fn seed_user(store: &FileAccountStore, id: &str) -> User {
        store
            .insert_user(NewUser {
                id: id.into(),
                name: format!("user {id}"),
                email: format!("{id}@example.com"),
                email_verified: true,
            })
            .expect("insert user")
    }

    #[test]
    fn provider_account_pair_is_unique() {
        let (_dir, store) = store();
        seed_user(&store, "u1");
        let new = |user: &str| NewAccount {
            account_id: "alice".into(),
            provider_id: "gitlab".into(),
            user_id: user.into(),
            ..NewAccount::default()
        };
        store.insert_account(new("u1")).expect("first insert");
        assert!(store.insert_account(new("u1")).is_err());
    }

    #[test]
    fn deleting_a_user_cascades_to_accounts() {
        let (_dir, store) = store();
        seed_user(&store, "u1");
        store
            .insert_account(NewAccount {
                account_id: "alice".into(),
                provider_id: "gitlab".into(),
                user_id: "u1".into(),
                ..NewAccount::default()
            })
            .expect("insert");
        store.delete_user("u1").expect("delete");
        assert!(store.get_all_accounts().is_empty());
    }

    #[test]
    fn update_account_is_partial() {
        let (_dir, store) = store();
        seed_user(&store, "u1");
        store
            .insert_account(NewAccount {
                account_id: "alice".into(),
                provider_id: "gitlab".into(),
                user_id: "u1".into(),
                access_token: Some("t1".into()),
                refresh_token: Some("r1".into()),
                ..NewAccount::default()
            })
            .expect("insert");
        store
            .update_account(
                "alice",
                AccountUpdate {
                    access_token: Some("t2".into()),
                    ..AccountUpdate::default()
                },
            )
            .expect("update");
        let account = store.find_account_by_account_id("alice").expect("find");
        assert_eq!(account.access_token.as_deref(), Some("t2"));
        assert_eq!(account.refresh_token.as_deref(), Some("r1"));
    }

    #[test]
    fn flush_round_trips_through_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("accounts.json");
        {
            let store = FileAccountStore::open(&path).expect("open");
            seed_user(&store, "u1");
            store.flush().expect("flush");
        }
        let store = FileAccountStore::open(&path).expect("reopen");
        assert!(store.find_user_by_id("u1").is_some());
        assert_eq!(store.find_user_by_email("u1@example.com").map(|u| u.id), Some("u1".into()));
    }
}
