//! Remote store boundary.
//!
//! Every content and allowlist read or write goes through [`ContentStore`].
//! Two implementations exist:
//! - `postgrest`: the hosted backend's REST interface over HTTP.
//! - `sqlite`: a local SQLite database with the same table semantics, used for
//!   offline development and tests.
//!
//! Neither implementation caches; each call is one round trip.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

pub mod postgrest;
pub mod sqlite;

pub use postgrest::PostgrestClient;
pub use sqlite::SqliteStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to reach content store: {0}")]
    Http(#[from] reqwest::Error),
    #[error("content store error {status}: {message}")]
    Api {
        status: u16,
        code: Option<String>,
        message: String,
    },
    #[error("no record in {table} with id {id}")]
    NotFound { table: String, id: String },
    #[error("invalid content store payload: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("invalid request: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    pub column: String,
    pub descending: bool,
}

/// Equality filters, one sort key and an optional row cap.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub filters: Vec<(String, Value)>,
    pub order: Option<Order>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.filters.push((column.to_string(), value.into()));
        self
    }

    pub fn order_desc(mut self, column: &str) -> Self {
        self.order = Some(Order {
            column: column.to_string(),
            descending: true,
        });
        self
    }

    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }
}

#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn select(&self, table: &str, query: &Query) -> Result<Vec<Value>, StoreError>;

    /// Store a new row. The store assigns `id` and `created_at`.
    async fn insert(&self, table: &str, record: Value) -> Result<Value, StoreError>;

    /// Apply `changes` to the row with `id`. Missing rows are `NotFound`.
    async fn update(&self, table: &str, id: &str, changes: Value) -> Result<Value, StoreError>;

    /// Remove the row with `id`. Missing rows are `NotFound`, not a no-op.
    async fn delete(&self, table: &str, id: &str) -> Result<(), StoreError>;

    async fn rpc(&self, function: &str, args: Value) -> Result<Value, StoreError>;
}

/// Render a filter value the way the REST interface expects it after `eq.`.
pub(crate) fn filter_literal(value: &Value) -> Result<String, StoreError> {
    match value {
        Value::Bool(b) => Ok(b.to_string()),
        Value::Number(n) => Ok(n.to_string()),
        Value::String(s) => Ok(s.clone()),
        other => Err(StoreError::Invalid(format!(
            "unsupported filter value {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn query_builder_collects_parts() {
        let q = Query::new()
            .eq("featured", true)
            .eq("email", "a@x.com")
            .order_desc("created_at")
            .limit(4);
        assert_eq!(
            q.filters,
            vec![
                ("featured".to_string(), json!(true)),
                ("email".to_string(), json!("a@x.com"))
            ]
        );
        assert_eq!(q.order.as_ref().map(|o| o.column.as_str()), Some("created_at"));
        assert!(q.order.unwrap().descending);
        assert_eq!(q.limit, Some(4));
    }

    #[test]
    fn filter_literal_rejects_structures() {
        assert_eq!(filter_literal(&json!(false)).unwrap(), "false");
        assert_eq!(filter_literal(&json!(150)).unwrap(), "150");
        assert_eq!(filter_literal(&json!("x")).unwrap(), "x");
        assert!(matches!(
            filter_literal(&json!({"a": 1})),
            Err(StoreError::Invalid(_))
        ));
    }
}
