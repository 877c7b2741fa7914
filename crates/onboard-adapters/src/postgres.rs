//! PostgreSQL JSONB document store.
//!
//! Every document lives in one `onboard_documents` row keyed by `(collection, id)`.
//! Partial updates merge top-level keys with `body || patch` and express preconditions
//! as `body -> field = value` in the same statement, so a conditional write is atomic.
//! Change notifications are fanned out in-process after each committed write.

use crate::AdapterError;
use async_trait::async_trait;
use onboard_core::{ChangeFeed, Collection, DocumentStore, FieldEquals, OnboardError, Patch, Subscription};
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct PostgresDocumentStore {
    pool: PgPool,
    feed: ChangeFeed,
}

fn db_err(action: &str) -> impl Fn(sqlx::Error) -> OnboardError + '_ {
    move |e| AdapterError::Database(format!("postgres {action} failed: {e}")).into()
}

impl PostgresDocumentStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, OnboardError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await
            .map_err(db_err("connect"))?;
        let store = Self {
            pool,
            feed: ChangeFeed::default(),
        };
        store.ensure_schema().await?;
        info!(max_connections, "postgres document store ready");
        Ok(store)
    }

    async fn ensure_schema(&self) -> Result<(), OnboardError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS onboard_documents (
                collection TEXT NOT NULL,
                id TEXT NOT NULL,
                body JSONB NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                PRIMARY KEY (collection, id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(db_err("schema create"))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_onboard_documents_body ON onboard_documents USING GIN (body)",
        )
        .execute(&self.pool)
        .await
        .map_err(db_err("index create"))?;

        Ok(())
    }

    async fn exists(&self, collection: Collection, id: &str) -> Result<bool, OnboardError> {
        let row = sqlx::query("SELECT 1 FROM onboard_documents WHERE collection = $1 AND id = $2")
            .bind(collection.name())
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err("exists"))?;
        Ok(row.is_some())
    }
}

/// `UPDATE` with one `body -> $field = $value` clause per precondition.
fn update_statement(conditions: usize) -> String {
    let mut sql = String::from(
        "UPDATE onboard_documents SET body = body || $3, updated_at = now() \
         WHERE collection = $1 AND id = $2",
    );
    for i in 0..conditions {
        let field = 4 + i * 2;
        sql.push_str(&format!(" AND body -> ${} = ${}", field, field + 1));
    }
    sql.push_str(" RETURNING body");
    sql
}

fn body_of(row: &sqlx::postgres::PgRow) -> Result<Value, OnboardError> {
    let Json(body): Json<Value> = row.try_get("body").map_err(db_err("decode body"))?;
    Ok(body)
}

#[async_trait]
impl DocumentStore for PostgresDocumentStore {
    fn backend_label(&self) -> &'static str {
        "postgres"
    }

    async fn get(&self, collection: Collection, id: &str) -> Result<Option<Value>, OnboardError> {
        let row = sqlx::query("SELECT body FROM onboard_documents WHERE collection = $1 AND id = $2")
            .bind(collection.name())
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err("get"))?;
        row.as_ref().map(body_of).transpose()
    }

    async fn create(
        &self,
        collection: Collection,
        id: &str,
        document: Value,
    ) -> Result<(), OnboardError> {
        let result = sqlx::query(
            "INSERT INTO onboard_documents (collection, id, body) VALUES ($1, $2, $3) \
             ON CONFLICT (collection, id) DO NOTHING",
        )
        .bind(collection.name())
        .bind(id)
        .bind(Json(&document))
        .execute(&self.pool)
        .await
        .map_err(db_err("insert"))?;

        if result.rows_affected() == 0 {
            return Err(OnboardError::Conflict(format!(
                "{} '{}' already exists",
                collection.name(),
                id
            )));
        }
        self.feed.publish(collection, id, document);
        Ok(())
    }

    async fn set(
        &self,
        collection: Collection,
        id: &str,
        document: Value,
    ) -> Result<(), OnboardError> {
        sqlx::query(
            "INSERT INTO onboard_documents (collection, id, body) VALUES ($1, $2, $3) \
             ON CONFLICT (collection, id) DO UPDATE SET body = EXCLUDED.body, updated_at = now()",
        )
        .bind(collection.name())
        .bind(id)
        .bind(Json(&document))
        .execute(&self.pool)
        .await
        .map_err(db_err("upsert"))?;

        self.feed.publish(collection, id, document);
        Ok(())
    }

    async fn update(
        &self,
        collection: Collection,
        id: &str,
        patch: Patch,
        conditions: &[FieldEquals],
    ) -> Result<Value, OnboardError> {
        let sql = update_statement(conditions.len());
        let mut query = sqlx::query(&sql)
            .bind(collection.name())
            .bind(id)
            .bind(Json(Value::Object(patch)));
        for condition in conditions {
            query = query
                .bind(condition.field.as_str())
                .bind(Json(condition.value.clone()));
        }

        let row = query
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err("update"))?;
        let Some(row) = row else {
            if self.exists(collection, id).await? {
                debug!(collection = collection.name(), id, "conditional update rejected");
                return Err(OnboardError::Conflict(format!(
                    "{} '{}' precondition failed",
                    collection.name(),
                    id
                )));
            }
            return Err(OnboardError::NotFound(format!(
                "{} '{}' not found",
                collection.name(),
                id
            )));
        };

        let merged = body_of(&row)?;
        self.feed.publish(collection, id, merged.clone());
        Ok(merged)
    }

    async fn query(
        &self,
        collection: Collection,
        field: &str,
        value: &Value,
    ) -> Result<Vec<Value>, OnboardError> {
        let rows = sqlx::query(
            "SELECT body FROM onboard_documents WHERE collection = $1 AND body -> $2 = $3 ORDER BY id",
        )
        .bind(collection.name())
        .bind(field)
        .bind(Json(value))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("query"))?;
        rows.iter().map(body_of).collect()
    }

    async fn list(&self, collection: Collection) -> Result<Vec<Value>, OnboardError> {
        let rows = sqlx::query("SELECT body FROM onboard_documents WHERE collection = $1 ORDER BY id")
            .bind(collection.name())
            .fetch_all(&self.pool)
            .await
            .map_err(db_err("list"))?;
        rows.iter().map(body_of).collect()
    }

    fn subscribe(&self, collection: Collection, id: Option<&str>) -> Subscription {
        self.feed.subscribe(collection, id)
    }
}
