use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use tracing::{debug, instrument};
use uuid::Uuid;

use super::{ContentStore, Query, StoreError};

/// Local store backed by a single `records` table of JSON documents.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

/// Open a pool for `database_url`. In-memory databases get one connection so
/// every query sees the same data.
pub async fn init_pool(database_url: &str) -> Result<SqlitePool, StoreError> {
    let url = prepare_sqlite_url(database_url);
    let in_memory = url.starts_with("sqlite::memory");
    let options = SqliteConnectOptions::from_str(&url)?.create_if_missing(true);
    let pool = if in_memory {
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?
    } else {
        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        sqlx::query("PRAGMA journal_mode=WAL;").execute(&pool).await?;
        pool
    };
    Ok(pool)
}

/// Expand a leading `~/` in a file-backed SQLite URL and create its parent
/// directory. Other URLs pass through untouched.
fn prepare_sqlite_url(url: &str) -> String {
    let Some(rest) = url.strip_prefix("sqlite:") else {
        return url.to_string();
    };
    if rest.starts_with(":memory") {
        return url.to_string();
    }
    let rest = rest.strip_prefix("//").unwrap_or(rest);
    let (path, query) = match rest.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (rest, None),
    };
    if path.is_empty() {
        return url.to_string();
    }

    let path = match (path.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(tail), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), tail),
        _ => path.to_string(),
    };
    if let Some(parent) = std::path::Path::new(&path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    match query {
        Some(q) => format!("sqlite://{path}?{q}"),
        None => format!("sqlite://{path}"),
    }
}

pub async fn run_migrations(pool: &SqlitePool) -> Result<(), StoreError> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| StoreError::Database(e.into()))?;
    Ok(())
}

fn json_path(column: &str) -> Result<String, StoreError> {
    if column.is_empty() || !column.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(StoreError::Invalid(format!("invalid column name {column:?}")));
    }
    Ok(format!("$.{column}"))
}

fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open `database_url`, apply migrations and wrap the pool.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = init_pool(database_url).await?;
        run_migrations(&pool).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl ContentStore for SqliteStore {
    #[instrument(skip_all, fields(table = %table))]
    async fn select(&self, table: &str, query: &Query) -> Result<Vec<Value>, StoreError> {
        let mut sql = String::from("SELECT body FROM records WHERE tbl = ?");
        let mut paths = Vec::with_capacity(query.filters.len());
        for (column, _) in &query.filters {
            paths.push(json_path(column)?);
            sql.push_str(" AND json_extract(body, ?) = ?");
        }
        let order_path = match &query.order {
            Some(order) => {
                let dir = if order.descending { "DESC" } else { "ASC" };
                sql.push_str(&format!(" ORDER BY json_extract(body, ?) {dir}, rowid {dir}"));
                Some(json_path(&order.column)?)
            }
            None => None,
        };
        if query.limit.is_some() {
            sql.push_str(" LIMIT ?");
        }

        let mut q = sqlx::query(&sql).bind(table);
        for ((_, value), path) in query.filters.iter().zip(paths) {
            q = q.bind(path);
            q = match value {
                Value::Bool(b) => q.bind(i64::from(*b)),
                Value::Number(n) if n.is_i64() => q.bind(n.as_i64()),
                Value::Number(n) => q.bind(n.as_f64()),
                Value::String(s) => q.bind(s.clone()),
                other => {
                    return Err(StoreError::Invalid(format!(
                        "unsupported filter value {other}"
                    )))
                }
            };
        }
        if let Some(path) = order_path {
            q = q.bind(path);
        }
        if let Some(limit) = query.limit {
            q = q.bind(i64::try_from(limit).unwrap_or(i64::MAX));
        }

        let rows = q.fetch_all(&self.pool).await?;
        debug!(rows = rows.len(), "select finished");
        rows.iter()
            .map(|row| {
                let body: String = row.get("body");
                serde_json::from_str(&body).map_err(StoreError::from)
            })
            .collect()
    }

    #[instrument(skip_all, fields(table = %table))]
    async fn insert(&self, table: &str, record: Value) -> Result<Value, StoreError> {
        let Value::Object(mut body) = record else {
            return Err(StoreError::Invalid("record must be a JSON object".into()));
        };
        let id = match body.get("id") {
            Some(Value::String(s)) if !s.is_empty() => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => Uuid::new_v4().to_string(),
        };
        let created_at = match body.get("created_at") {
            Some(Value::String(s)) if !s.is_empty() => s.clone(),
            _ => now_timestamp(),
        };
        body.insert("id".into(), Value::String(id.clone()));
        body.insert("created_at".into(), Value::String(created_at.clone()));
        let body = Value::Object(body);

        let result = sqlx::query("INSERT INTO records (tbl, id, created_at, body) VALUES (?, ?, ?, ?)")
            .bind(table)
            .bind(&id)
            .bind(&created_at)
            .bind(body.to_string())
            .execute(&self.pool)
            .await;
        match result {
            Ok(_) => Ok(body),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => Err(StoreError::Api {
                status: 409,
                code: Some("23505".into()),
                message: format!("duplicate id {id} in {table}"),
            }),
            Err(err) => Err(err.into()),
        }
    }

    #[instrument(skip_all, fields(table = %table, id = %id))]
    async fn update(&self, table: &str, id: &str, changes: Value) -> Result<Value, StoreError> {
        let Value::Object(changes) = changes else {
            return Err(StoreError::Invalid("changes must be a JSON object".into()));
        };
        let mut tx = self.pool.begin().await?;
        let current: Option<String> =
            sqlx::query_scalar("SELECT body FROM records WHERE tbl = ? AND id = ?")
                .bind(table)
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;
        let Some(current) = current else {
            return Err(StoreError::NotFound {
                table: table.to_string(),
                id: id.to_string(),
            });
        };
        let mut body: Map<String, Value> = serde_json::from_str(&current)?;
        for (key, value) in changes {
            if key == "id" || key == "created_at" {
                continue;
            }
            body.insert(key, value);
        }
        let body = Value::Object(body);
        sqlx::query("UPDATE records SET body = ? WHERE tbl = ? AND id = ?")
            .bind(body.to_string())
            .bind(table)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(body)
    }

    #[instrument(skip_all, fields(table = %table, id = %id))]
    async fn delete(&self, table: &str, id: &str) -> Result<(), StoreError> {
        let done = sqlx::query("DELETE FROM records WHERE tbl = ? AND id = ?")
            .bind(table)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if done.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                table: table.to_string(),
                id: id.to_string(),
            });
        }
        Ok(())
    }

    #[instrument(skip_all, fields(function = %function))]
    async fn rpc(&self, function: &str, args: Value) -> Result<Value, StoreError> {
        match function {
            "increment_views" => {
                let table = args["table_name"].as_str().ok_or_else(|| {
                    StoreError::Invalid("increment_views needs table_name".into())
                })?;
                let id = match &args["record_id"] {
                    Value::String(s) => s.clone(),
                    Value::Number(n) => n.to_string(),
                    _ => {
                        return Err(StoreError::Invalid(
                            "increment_views needs record_id".into(),
                        ))
                    }
                };
                let done = sqlx::query(
                    "UPDATE records \
                     SET body = json_set(body, '$.views', COALESCE(json_extract(body, '$.views'), 0) + 1) \
                     WHERE tbl = ? AND id = ?",
                )
                .bind(table)
                .bind(&id)
                .execute(&self.pool)
                .await?;
                if done.rows_affected() == 0 {
                    return Err(StoreError::NotFound {
                        table: table.to_string(),
                        id,
                    });
                }
                Ok(Value::Null)
            }
            other => Err(StoreError::Api {
                status: 404,
                code: Some("PGRST202".into()),
                message: format!("function {other} not found"),
            }),
        }
    }
}
