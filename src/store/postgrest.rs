use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode, Url};
use serde::Deserialize;
use serde_json::Value;
use std::fmt;
use tracing::{debug, instrument, warn};

use super::{filter_literal, ContentStore, Query, StoreError};

/// REST client for the hosted backend's table API (`/rest/v1`).
#[derive(Clone)]
pub struct PostgrestClient {
    http: Client,
    base_url: Url,
    anon_key: String,
    access_token: Option<String>,
}

impl fmt::Debug for PostgrestClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgrestClient")
            .field("base_url", &self.base_url)
            .field("authenticated", &self.access_token.is_some())
            .finish_non_exhaustive()
    }
}

/// Error body returned by the REST interface.
#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    code: Option<String>,
    message: Option<String>,
    details: Option<String>,
}

/// Ensure the base ends in `/` so relative joins append instead of replace.
pub(crate) fn normalize_base(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}

impl PostgrestClient {
    pub fn new(base_url: Url, anon_key: String) -> Self {
        let http = Client::builder()
            .user_agent("portfolio-cms/0.1")
            .build()
            .unwrap_or_else(|_| Client::new());
        Self::with_client(http, base_url, anon_key)
    }

    pub fn with_client(http: Client, base_url: Url, anon_key: String) -> Self {
        Self {
            http,
            base_url: normalize_base(base_url),
            anon_key,
            access_token: None,
        }
    }

    /// Same client, acting as the signed-in user instead of the anonymous role.
    pub fn with_access_token(&self, token: impl Into<String>) -> Self {
        Self {
            access_token: Some(token.into()),
            ..self.clone()
        }
    }

    fn endpoint(&self, path: &str) -> Result<Url, StoreError> {
        self.base_url
            .join(&format!("rest/v1/{path}"))
            .map_err(|e| StoreError::Invalid(format!("invalid table endpoint {path}: {e}")))
    }

    fn request(&self, method: Method, url: Url) -> reqwest::RequestBuilder {
        let bearer = self.access_token.as_deref().unwrap_or(&self.anon_key);
        self.http
            .request(method, url)
            .header("apikey", &self.anon_key)
            .header("Authorization", format!("Bearer {bearer}"))
            .header("Accept", "application/json")
    }

    pub fn build_select(&self, table: &str, query: &Query) -> Result<reqwest::Request, StoreError> {
        let mut url = self.endpoint(table)?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("select", "*");
            for (column, value) in &query.filters {
                pairs.append_pair(column, &format!("eq.{}", filter_literal(value)?));
            }
            if let Some(order) = &query.order {
                let dir = if order.descending { "desc" } else { "asc" };
                pairs.append_pair("order", &format!("{}.{dir}", order.column));
            }
            if let Some(limit) = query.limit {
                pairs.append_pair("limit", &limit.to_string());
            }
        }
        Ok(self.request(Method::GET, url).build()?)
    }

    pub fn build_insert(&self, table: &str, record: &Value) -> Result<reqwest::Request, StoreError> {
        let url = self.endpoint(table)?;
        Ok(self
            .request(Method::POST, url)
            .header("Content-Type", "application/json")
            .header("Prefer", "return=representation")
            .json(&[record])
            .build()?)
    }

    pub fn build_update(
        &self,
        table: &str,
        id: &str,
        changes: &Value,
    ) -> Result<reqwest::Request, StoreError> {
        let mut url = self.endpoint(table)?;
        url.query_pairs_mut().append_pair("id", &format!("eq.{id}"));
        Ok(self
            .request(Method::PATCH, url)
            .header("Content-Type", "application/json")
            .header("Prefer", "return=representation")
            .json(changes)
            .build()?)
    }

    /// Deletes ask for the removed rows back so an unknown id can be told
    /// apart from a successful delete.
    pub fn build_delete(&self, table: &str, id: &str) -> Result<reqwest::Request, StoreError> {
        let mut url = self.endpoint(table)?;
        url.query_pairs_mut().append_pair("id", &format!("eq.{id}"));
        Ok(self
            .request(Method::DELETE, url)
            .header("Prefer", "return=representation")
            .build()?)
    }

    pub fn build_rpc(&self, function: &str, args: &Value) -> Result<reqwest::Request, StoreError> {
        let url = self.endpoint(&format!("rpc/{function}"))?;
        Ok(self
            .request(Method::POST, url)
            .header("Content-Type", "application/json")
            .json(args)
            .build()?)
    }

    async fn execute(&self, request: reqwest::Request) -> Result<String, StoreError> {
        debug!(method=%request.method(), url=%request.url(), "sending store request");
        let res = self.http.execute(request).await?;
        let status = res.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            warn!("rate limited by content store");
        }
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(api_error(status, &body));
        }
        Ok(res.text().await?)
    }

    async fn execute_rows(&self, request: reqwest::Request) -> Result<Vec<Value>, StoreError> {
        let body = self.execute(request).await?;
        if body.trim().is_empty() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_str(&body)?)
    }
}

fn api_error(status: StatusCode, body: &str) -> StoreError {
    match serde_json::from_str::<ApiErrorBody>(body) {
        Ok(parsed) => {
            let mut message = parsed.message.unwrap_or_else(|| body.to_string());
            if let Some(details) = parsed.details.filter(|d| !d.is_empty()) {
                message = format!("{message} ({details})");
            }
            StoreError::Api {
                status: status.as_u16(),
                code: parsed.code,
                message,
            }
        }
        Err(_) => StoreError::Api {
            status: status.as_u16(),
            code: None,
            message: body.to_string(),
        },
    }
}

#[async_trait]
impl ContentStore for PostgrestClient {
    #[instrument(skip_all, fields(table = %table))]
    async fn select(&self, table: &str, query: &Query) -> Result<Vec<Value>, StoreError> {
        let request = self.build_select(table, query)?;
        self.execute_rows(request).await
    }

    #[instrument(skip_all, fields(table = %table))]
    async fn insert(&self, table: &str, record: Value) -> Result<Value, StoreError> {
        let request = self.build_insert(table, &record)?;
        let mut rows = self.execute_rows(request).await?;
        if rows.is_empty() {
            return Err(StoreError::Invalid(format!(
                "insert into {table} returned no row"
            )));
        }
        Ok(rows.swap_remove(0))
    }

    #[instrument(skip_all, fields(table = %table, id = %id))]
    async fn update(&self, table: &str, id: &str, changes: Value) -> Result<Value, StoreError> {
        let request = self.build_update(table, id, &changes)?;
        let mut rows = self.execute_rows(request).await?;
        if rows.is_empty() {
            return Err(StoreError::NotFound {
                table: table.to_string(),
                id: id.to_string(),
            });
        }
        Ok(rows.swap_remove(0))
    }

    #[instrument(skip_all, fields(table = %table, id = %id))]
    async fn delete(&self, table: &str, id: &str) -> Result<(), StoreError> {
        let request = self.build_delete(table, id)?;
        let rows = self.execute_rows(request).await?;
        if rows.is_empty() {
            return Err(StoreError::NotFound {
                table: table.to_string(),
                id: id.to_string(),
            });
        }
        Ok(())
    }

    #[instrument(skip_all, fields(function = %function))]
    async fn rpc(&self, function: &str, args: Value) -> Result<Value, StoreError> {
        let request = self.build_rpc(function, &args)?;
        let body = self.execute(request).await?;
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&body)?)
    }
}
