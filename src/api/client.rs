//! Authenticated REST and GraphQL transports.
//!
//! Both clients share [`AuthState`]: a bearer token cell plus an optional
//! refresh capability. A 401 triggers at most one refresh-and-retry per
//! attempt; a second 401 (or a failed refresh) surfaces as an expired-auth
//! error with a remediation hint. Transient failures go through the backoff
//! policy in [`super::retry`].

use std::sync::Arc;

use backon::Retryable;
use log::{debug, warn};
use reqwest::Method;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::sync::{Mutex, RwLock};
use tokio::time::{Duration, Instant, sleep};
use url::Url;

use super::retry::{RetryConfig, build_retry_builder, should_retry};
use crate::auth::TokenManager;
use crate::error::{CrawlError, Result};
use crate::models::{Connection, PageInfo};

const GRAPHQL_PATH: &str = "/api/graphql";
const BODY_SNIPPET_LEN: usize = 500;

fn snippet(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_owned()
    } else {
        let mut out = text.chars().take(max).collect::<String>();
        out.push_str("...");
        out
    }
}

/// Shared bearer-token state with an optional refresh capability.
pub struct AuthState {
    token: RwLock<Option<String>>,
    refresher: Option<(Arc<TokenManager>, String)>,
}

impl AuthState {
    /// Token-only state; 401s surface immediately as expired auth.
    pub fn fixed(token: Option<String>) -> Arc<Self> {
        Arc::new(Self {
            token: RwLock::new(token),
            refresher: None,
        })
    }

    /// State that can refresh through the token manager for `account_id`.
    pub fn with_refresh(
        token: Option<String>,
        manager: Arc<TokenManager>,
        account_id: String,
    ) -> Arc<Self> {
        Arc::new(Self {
            token: RwLock::new(token),
            refresher: Some((manager, account_id)),
        })
    }

    pub fn can_refresh(&self) -> bool {
        self.refresher.is_some()
    }

    async fn bearer(&self) -> Option<String> {
        self.token.read().await.clone()
    }

    /// Refresh the access token and update the cell. `Ok(false)` means the
    /// provider declined; the caller must treat the credential as dead.
    async fn refresh(&self) -> Result<bool> {
        let Some((manager, account_id)) = &self.refresher else {
            return Ok(false);
        };
        match manager.refresh_access_token(account_id).await? {
            Some(token) => {
                *self.token.write().await = Some(token);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Minimum-interval gate enforcing the configured requests-per-second
/// ceiling.
struct RateGate {
    interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl RateGate {
    fn new(per_second: u32) -> Self {
        Self {
            interval: Duration::from_millis(1_000 / u64::from(per_second.max(1))),
            last: Mutex::new(None),
        }
    }

    async fn wait(&self) {
        let mut last = self.last.lock().await;
        let now = Instant::now();
        if let Some(previous) = *last {
            let ready = previous + self.interval;
            if ready > now {
                sleep(ready - now).await;
            }
        }
        *last = Some(Instant::now());
    }
}

/// Authenticated REST transport for the forge's v4 API.
pub struct RestClient {
    http: reqwest::Client,
    base: Url,
    auth: Arc<AuthState>,
    retry: RetryConfig,
    gate: Option<RateGate>,
    timeout: Duration,
}

impl RestClient {
    pub fn new(
        base: Url,
        auth: Arc<AuthState>,
        timeout: Duration,
        rate_limit: Option<u32>,
    ) -> Result<Self> {
        Self::with_retry(base, auth, timeout, rate_limit, RetryConfig::default())
    }

    pub fn with_retry(
        base: Url,
        auth: Arc<AuthState>,
        timeout: Duration,
        rate_limit: Option<u32>,
        retry: RetryConfig,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            http,
            base,
            auth,
            retry,
            gate: rate_limit.map(RateGate::new),
            timeout,
        })
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    /// Issue an authenticated request and return the raw response body.
    ///
    /// `endpoint` is a path (optionally with a query string) joined onto the
    /// host base URL.
    pub async fn request(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<&Value>,
    ) -> Result<bytes::Bytes> {
        let url = self
            .base
            .join(endpoint)
            .map_err(|e| CrawlError::BadResponse(format!("bad endpoint {endpoint}: {e}")))?;
        let builder = build_retry_builder(self.retry);
        (|| self.execute_once(method.clone(), url.clone(), endpoint, body))
            .retry(builder)
            .sleep(sleep)
            .when(should_retry)
            .notify(|err: &CrawlError, dur| warn!("retrying {endpoint} after {dur:?}: {err}"))
            .await
    }

    /// Convenience wrapper deserializing the body as JSON.
    pub async fn request_json(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<&Value>,
    ) -> Result<Value> {
        let bytes = self.request(method, endpoint, body).await?;
        serde_json::from_slice(&bytes).map_err(|e| {
            let text = String::from_utf8_lossy(&bytes);
            CrawlError::BadResponse(format!(
                "{endpoint}: {e} | body snippet: {}",
                snippet(&text, BODY_SNIPPET_LEN)
            ))
        })
    }

    async fn execute_once(
        &self,
        method: Method,
        url: Url,
        endpoint: &str,
        body: Option<&Value>,
    ) -> Result<bytes::Bytes> {
        if let Some(gate) = &self.gate {
            gate.wait().await;
        }
        let mut refreshed = false;
        loop {
            let mut request = self
                .http
                .request(method.clone(), url.clone())
                .timeout(self.timeout)
                .header(reqwest::header::CONTENT_TYPE, "application/json");
            if let Some(token) = self.auth.bearer().await {
                request = request.bearer_auth(token);
            }
            if let Some(payload) = body {
                request = request.json(payload);
            }
            let response = request
                .send()
                .await
                .map_err(|e| CrawlError::from_transport(endpoint, e))?;
            let status = response.status();
            if status == reqwest::StatusCode::UNAUTHORIZED {
                if !refreshed && self.auth.can_refresh() {
                    refreshed = true;
                    debug!("401 from {endpoint}; attempting token refresh");
                    if self.auth.refresh().await.unwrap_or(false) {
                        continue;
                    }
                }
                return Err(CrawlError::AuthExpired {
                    remediation: format!(
                        "{endpoint} rejected the access token and it could not be refreshed; \
                         re-authenticate with `glcrawl account add`"
                    ),
                });
            }
            if !status.is_success() {
                let text = response.text().await.unwrap_or_default();
                return Err(CrawlError::HttpStatus {
                    status: status.as_u16(),
                    endpoint: endpoint.to_owned(),
                    snippet: snippet(&text, BODY_SNIPPET_LEN),
                });
            }
            return response
                .bytes()
                .await
                .map_err(|e| CrawlError::from_transport(endpoint, e));
        }
    }
}

#[derive(Debug, Deserialize)]
struct GraphqlResponse<T> {
    data: Option<T>,
    errors: Option<Vec<GraphqlError>>,
}

#[derive(Debug, Deserialize)]
struct GraphqlError {
    message: String,
}

/// GraphQL transport layered over [`RestClient`].
pub struct GraphqlClient {
    rest: RestClient,
}

impl GraphqlClient {
    pub fn new(rest: RestClient) -> Self {
        Self { rest }
    }

    /// Execute a GraphQL query and deserialize its `data` payload.
    ///
    /// A non-empty `errors` array fails the call even on HTTP 200.
    pub async fn run_query<V, T>(&self, query: &str, variables: V) -> Result<T>
    where
        V: serde::Serialize,
        T: DeserializeOwned,
    {
        let payload = json!({ "query": query, "variables": variables });
        let bytes = self
            .rest
            .request(Method::POST, GRAPHQL_PATH, Some(&payload))
            .await?;
        let response: GraphqlResponse<Value> = serde_json::from_slice(&bytes).map_err(|e| {
            let text = String::from_utf8_lossy(&bytes);
            CrawlError::BadResponse(format!(
                "graphql: {e} | body snippet: {}",
                snippet(&text, BODY_SNIPPET_LEN)
            ))
        })?;
        if let Some(errors) = response.errors
            && !errors.is_empty()
        {
            let joined = errors
                .into_iter()
                .map(|e| e.message)
                .collect::<Vec<_>>()
                .join(", ");
            return Err(CrawlError::GraphqlErrors(joined));
        }
        let value = response
            .data
            .ok_or_else(|| CrawlError::BadResponse("graphql response carried no data".into()))?;
        serde_path_to_error::deserialize(value).map_err(|e| {
            let path = e.path().to_string();
            CrawlError::BadResponse(format!("graphql data at {path}: {}", e.into_inner()))
        })
    }

    /// Fetch one page of a connection located at `path` inside `data`.
    ///
    /// A `null` anywhere along the path (e.g. an inaccessible project)
    /// yields an empty final page rather than an error.
    pub async fn fetch_connection_page(
        &self,
        query: &str,
        mut variables: serde_json::Map<String, Value>,
        first: u32,
        cursor: Option<String>,
        path: &[&str],
    ) -> Result<(Vec<Value>, PageInfo)> {
        variables.insert("first".into(), json!(first));
        variables.insert("cursor".into(), cursor.map_or(Value::Null, Value::String));
        let data: Value = self.run_query(query, Value::Object(variables)).await?;
        let mut node = &data;
        for segment in path {
            match node.get(segment) {
                Some(next) if !next.is_null() => node = next,
                _ => return Ok((Vec::new(), PageInfo::default())),
            }
        }
        let connection: Connection<Value> =
            serde_path_to_error::deserialize(node.clone()).map_err(|e| {
                let at = e.path().to_string();
                CrawlError::BadResponse(format!(
                    "connection at {}.{at}: {}",
                    path.join("."),
                    e.into_inner()
                ))
            })?;
        Ok((connection.nodes, connection.page_info))
    }
}
