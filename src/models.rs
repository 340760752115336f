//! Shared data model: identities, credentials, areas, and wire structures.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identity the crawler authenticates as.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub name: String,
    pub email: String,
    pub email_verified: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub banned: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ban_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ban_expires: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields for creating a [`User`]; the store assigns timestamps.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub id: String,
    pub name: String,
    pub email: String,
    pub email_verified: bool,
}

/// Credential binding of a user to a remote host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub id: String,
    /// Provider-scoped identifier, e.g. the username on the host.
    pub account_id: String,
    /// The host this credential belongs to.
    pub provider_id: String,
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token_expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token_expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    /// True when both tokens are present, regardless of expiry.
    pub fn has_both_tokens(&self) -> bool {
        self.access_token.is_some() && self.refresh_token.is_some()
    }
}

/// Fields for creating an [`Account`].
#[derive(Debug, Clone, Default)]
pub struct NewAccount {
    pub account_id: String,
    pub provider_id: String,
    pub user_id: String,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub access_token_expires_at: Option<DateTime<Utc>>,
    pub refresh_token_expires_at: Option<DateTime<Utc>>,
    pub id_token: Option<String>,
    pub scope: Option<String>,
}

/// Partial token update applied by the token manager; `None` leaves the
/// stored field untouched.
#[derive(Debug, Clone, Default)]
pub struct AccountUpdate {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub access_token_expires_at: Option<DateTime<Utc>>,
    pub refresh_token_expires_at: Option<DateTime<Utc>>,
    pub scope: Option<String>,
    /// Set to clear the stored refresh token and its expiry.
    pub clear_refresh_token: bool,
}

/// Logical container on the remote forge; the unit of on-disk hierarchy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Area {
    pub kind: AreaKind,
    /// `/`-joined identifier, unique within a host. The sole basis of the
    /// output directory hierarchy.
    pub full_path: String,
    pub id: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AreaKind {
    Group,
    Project,
}

/// Context handed to the user transform with every record.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackContext {
    pub host: String,
    pub account_id: String,
    pub resource_type: String,
}

/// Cursor-pagination marker from a GraphQL connection.
#[derive(Debug, Deserialize, Default, Clone)]
pub struct PageInfo {
    #[serde(rename = "hasNextPage")]
    pub has_next_page: bool,
    #[serde(rename = "endCursor")]
    pub end_cursor: Option<String>,
}

/// Generic GraphQL connection: a page of nodes plus its cursor state.
#[derive(Debug, Deserialize, Default)]
pub struct Connection<T> {
    #[serde(default = "Vec::new")]
    pub nodes: Vec<T>,
    #[serde(rename = "pageInfo", default)]
    pub page_info: PageInfo,
}

/// Final result of one crawl session.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CrawlResult {
    pub success: bool,
    pub total_processing_time_ms: u64,
    pub summary: CrawlSummary,
}

/// Aggregated counters for the end-of-run summary.
#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CrawlSummary {
    pub resources_crawled: u64,
    pub errors: u64,
    pub warnings: u64,
    /// Per-resource-type record counts, sorted for stable output.
    pub details: BTreeMap<String, u64>,
}

/// Pull the `id` field out of an opaque record, if present.
///
/// Both numeric and string ids appear on the wire (REST uses integers,
/// GraphQL uses `gid://` strings); both normalize to a string key for the
/// resume store.
pub fn record_id(record: &serde_json::Value) -> Option<String> {
    match record.get("id") {
        Some(serde_json::Value::String(s)) => Some(s.clone()),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}
