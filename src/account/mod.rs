//! Account storage: the interface the core consumes plus the file-backed
//! implementation used by the CLI.
//!
//! The core calls the store from at most one task at a time per account
//! identifier, so implementations only need coarse interior locking.

mod file_store;

pub use file_store::FileAccountStore;

use crate::error::Result;
use crate::models::{Account, AccountUpdate, NewAccount, NewUser, User};

/// Which field identifies an existing user during an upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserKey {
    Id,
    Email,
}

/// CRUD over `{user, account}` records with tokens.
pub trait AccountStore: Send + Sync {
    fn find_account_by_account_id(&self, account_id: &str) -> Option<Account>;
    fn find_user_by_id(&self, id: &str) -> Option<User>;
    fn find_user_by_email(&self, email: &str) -> Option<User>;
    fn find_accounts_by_user_id(&self, user_id: &str) -> Vec<Account>;
    fn get_all_accounts(&self) -> Vec<Account>;
    /// Accounts joined with their owning users; accounts whose user is
    /// missing are skipped.
    fn get_accounts_with_users(&self) -> Vec<(Account, User)>;
    fn insert_user(&self, user: NewUser) -> Result<User>;
    /// Insert or update, matching on `key`; preserves `created_at` on
    /// update.
    fn upsert_user(&self, user: User, key: UserKey) -> Result<User>;
    fn insert_account(&self, account: NewAccount) -> Result<Account>;
    /// Apply a partial token update to the account with the given
    /// provider-scoped id, bumping `updated_at`.
    fn update_account(&self, account_id: &str, update: AccountUpdate) -> Result<()>;
    fn delete_account(&self, id: &str) -> Result<()>;
    /// Deleting a user cascades to its accounts.
    fn delete_user(&self, id: &str) -> Result<()>;
    /// Persist pending changes.
    fn flush(&self) -> Result<()>;
}
