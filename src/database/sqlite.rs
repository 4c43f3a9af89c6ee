//! SQLite document store: every collection lives in one `documents` table as
//! JSON text, addressed through `json_extract`.

use std::collections::HashSet;
use std::path::Path;

use async_trait::async_trait;
use futures::TryStreamExt;
use serde_json::Value;
use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqlitePoolOptions};
use sqlx::{Row, Sqlite, SqlitePool, migrate::MigrateDatabase};
use tracing::{debug, info};

use super::{check_collection, index_name, json_path};
use crate::error::StoreError;
use crate::models::{Filter, Identity, IdentityKey, Record, Scalar};
use crate::traits::{DocumentStore, IndexSpec, UpsertOp};

type SqliteQuery<'q> = Query<'q, Sqlite, SqliteArguments<'q>>;

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn connect(db_url: &str) -> Result<Self, StoreError> {
        let in_memory = db_url.contains(":memory:") || db_url.contains("mode=memory");

        // Create database file (and its directory) if it doesn't exist
        if !in_memory && !Sqlite::database_exists(db_url).await.unwrap_or(false) {
            if let Some(parent) = database_file(db_url).and_then(|p| p.parent().map(Path::to_path_buf))
                && !parent.as_os_str().is_empty()
            {
                tokio::fs::create_dir_all(&parent)
                    .await
                    .map_err(sqlx::Error::Io)?;
            }
            info!(url = db_url, "Creating database file");
            Sqlite::create_database(db_url).await?;
        }

        // An in-memory database exists per connection, so keep exactly one
        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 4 })
            .connect(db_url)
            .await?;

        debug!("Running database migrations");
        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }
}

/// Path of the database file named by a `sqlite:` url.
fn database_file(db_url: &str) -> Option<&Path> {
    let rest = db_url
        .strip_prefix("sqlite://")
        .or_else(|| db_url.strip_prefix("sqlite:"))?;
    let path = rest.split('?').next()?;
    (!path.is_empty()).then(|| Path::new(path))
}

fn bind_scalar<'q>(query: SqliteQuery<'q>, value: &Scalar) -> SqliteQuery<'q> {
    match value {
        Scalar::Text(s) => query.bind(s.clone()),
        Scalar::Integer(n) => query.bind(*n),
        // json_extract yields 1/0 for JSON booleans
        Scalar::Bool(b) => query.bind(i64::from(*b)),
    }
}

/// SQL condition for `filter` plus the values to bind, in order.
fn filter_clause(filter: &Filter) -> Result<(String, Vec<Scalar>), StoreError> {
    let mut conditions = Vec::with_capacity(filter.0.len());
    let mut binds = Vec::with_capacity(filter.0.len() * 2);
    for (path, value) in &filter.0 {
        conditions.push("json_extract(doc, ?) = ?");
        binds.push(Scalar::Text(json_path(path)?));
        binds.push(value.clone());
    }
    if conditions.is_empty() {
        return Ok(("1 = 1".to_string(), binds));
    }
    Ok((conditions.join(" AND "), binds))
}

fn bind_all<'q>(mut query: SqliteQuery<'q>, binds: &[Scalar]) -> SqliteQuery<'q> {
    for value in binds {
        query = bind_scalar(query, value);
    }
    query
}

#[async_trait]
impl DocumentStore for SqliteStore {
    fn backend(&self) -> &'static str {
        "sqlite"
    }

    async fn load_identities(
        &self,
        collection: &str,
        key: &IdentityKey,
    ) -> Result<HashSet<Identity>, StoreError> {
        let columns = key
            .fields()
            .iter()
            .map(|field| Ok(format!("json_quote(json_extract(doc, '{}'))", json_path(field)?)))
            .collect::<Result<Vec<_>, StoreError>>()?;
        let sql = format!(
            "SELECT {} FROM documents WHERE collection = ?",
            columns.join(", ")
        );

        let mut identities = HashSet::new();
        let mut rows = sqlx::query(&sql).bind(collection).fetch(&self.pool);
        while let Some(row) = rows.try_next().await? {
            let mut values = Vec::with_capacity(columns.len());
            for i in 0..columns.len() {
                let raw: Option<String> = row.try_get(i)?;
                let value = match raw {
                    Some(text) => serde_json::from_str::<Value>(&text)?,
                    None => Value::Null,
                };
                values.push(value);
            }
            if let Ok(identity) = key.from_parts(values.iter().map(Some)) {
                identities.insert(identity);
            }
        }
        Ok(identities)
    }

    async fn upsert_many(&self, collection: &str, ops: &[UpsertOp]) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        for op in ops {
            let (clause, binds) = filter_clause(&op.filter)?;
            let sql = format!(
                "SELECT id, doc FROM documents WHERE collection = ? AND {clause} ORDER BY id LIMIT 1"
            );
            let existing = bind_all(sqlx::query(&sql).bind(collection), &binds)
                .fetch_optional(&mut *tx)
                .await?;

            match existing {
                Some(row) => {
                    let id: i64 = row.try_get("id")?;
                    let doc: String = row.try_get("doc")?;
                    let mut merged: Record = serde_json::from_str(&doc)?;
                    for (field, value) in &op.payload {
                        merged.insert(field.clone(), value.clone());
                    }
                    sqlx::query("UPDATE documents SET doc = ? WHERE id = ?")
                        .bind(serde_json::to_string(&merged)?)
                        .bind(id)
                        .execute(&mut *tx)
                        .await?;
                }
                None => {
                    sqlx::query("INSERT INTO documents (collection, doc) VALUES (?, ?)")
                        .bind(collection)
                        .bind(serde_json::to_string(&op.payload)?)
                        .execute(&mut *tx)
                        .await?;
                }
            }
        }
        tx.commit().await?;
        Ok(ops.len() as u64)
    }

    async fn insert_many(&self, collection: &str, docs: &[Record]) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        for doc in docs {
            sqlx::query("INSERT INTO documents (collection, doc) VALUES (?, ?)")
                .bind(collection)
                .bind(serde_json::to_string(doc)?)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(docs.len() as u64)
    }

    async fn delete_matching(
        &self,
        collection: &str,
        filters: &[Filter],
    ) -> Result<u64, StoreError> {
        let mut removed = 0;
        let mut tx = self.pool.begin().await?;
        for filter in filters {
            let (clause, binds) = filter_clause(filter)?;
            let sql = format!("DELETE FROM documents WHERE collection = ? AND {clause}");
            let result = bind_all(sqlx::query(&sql).bind(collection), &binds)
                .execute(&mut *tx)
                .await?;
            removed += result.rows_affected();
        }
        tx.commit().await?;
        Ok(removed)
    }

    async fn set_field(
        &self,
        collection: &str,
        filters: &[Filter],
        field: &str,
        value: Scalar,
    ) -> Result<u64, StoreError> {
        let path = json_path(field)?;
        let encoded = value.to_json().to_string();
        let mut changed = 0;
        let mut tx = self.pool.begin().await?;
        for filter in filters {
            let (clause, binds) = filter_clause(filter)?;
            let sql = format!(
                "UPDATE documents SET doc = json_set(doc, ?, json(?)) \
                 WHERE collection = ? AND {clause} AND json_extract(doc, ?) IS NOT ?"
            );
            let query = sqlx::query(&sql)
                .bind(path.clone())
                .bind(encoded.clone())
                .bind(collection);
            let query = bind_all(query, &binds).bind(path.clone());
            let result = bind_scalar(query, &value).execute(&mut *tx).await?;
            changed += result.rows_affected();
        }
        tx.commit().await?;
        Ok(changed)
    }

    async fn count(&self, collection: &str, filter: Option<&Filter>) -> Result<u64, StoreError> {
        let (clause, binds) = match filter {
            Some(filter) => filter_clause(filter)?,
            None => ("1 = 1".to_string(), Vec::new()),
        };
        let sql = format!("SELECT COUNT(*) AS n FROM documents WHERE collection = ? AND {clause}");
        let row = bind_all(sqlx::query(&sql).bind(collection), &binds)
            .fetch_one(&self.pool)
            .await?;
        let n: i64 = row.try_get("n")?;
        Ok(u64::try_from(n).unwrap_or_default())
    }

    async fn drop_indexes(&self, collection: &str) -> Result<(), StoreError> {
        check_collection(collection)?;
        let rows = sqlx::query(
            "SELECT name FROM sqlite_master WHERE type = 'index' AND tbl_name = 'documents' AND name GLOB ?",
        )
        .bind(format!("ix__{collection}__*"))
        .fetch_all(&self.pool)
        .await?;

        for row in rows {
            let name: String = row.try_get("name")?;
            sqlx::query(&format!("DROP INDEX IF EXISTS \"{name}\""))
                .execute(&self.pool)
                .await?;
            debug!(collection, index = %name, "Dropped index");
        }
        Ok(())
    }

    async fn create_index(&self, collection: &str, index: &IndexSpec) -> Result<(), StoreError> {
        check_collection(collection)?;
        let columns = index
            .fields
            .iter()
            .map(|field| Ok(format!("json_extract(doc, '{}')", json_path(field)?)))
            .collect::<Result<Vec<_>, StoreError>>()?;
        let sql = format!(
            "CREATE {unique}INDEX IF NOT EXISTS \"{name}\" ON documents ({columns}) WHERE collection = '{collection}'",
            unique = if index.unique { "UNIQUE " } else { "" },
            name = index_name(collection, index),
            columns = columns.join(", "),
        );
        sqlx::query(&sql).execute(&self.pool).await?;
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
