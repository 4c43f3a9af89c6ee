//! Document store backends and the configuration that selects one

mod mongo;
mod sqlite;

use async_trait::async_trait;
use tracing::info;

pub use mongo::MongoStore;
pub use sqlite::SqliteStore;

use crate::error::StoreError;
use crate::traits::{Connector, DocumentStore, IndexSpec};

/// Where sync runs write to. Chosen from the store url scheme.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreConfig {
    Mongo { uri: String, database: String },
    Sqlite { url: String },
}

impl StoreConfig {
    pub fn from_url(url: &str, database: &str) -> Result<Self, StoreError> {
        if url.starts_with("mongodb://") || url.starts_with("mongodb+srv://") {
            Ok(Self::Mongo {
                uri: url.to_string(),
                database: database.to_string(),
            })
        } else if url.starts_with("sqlite:") {
            Ok(Self::Sqlite {
                url: url.to_string(),
            })
        } else {
            Err(StoreError::UnsupportedUrl(url.to_string()))
        }
    }
}

#[async_trait]
impl Connector for StoreConfig {
    async fn connect(&self) -> Result<Box<dyn DocumentStore>, StoreError> {
        match self {
            Self::Mongo { uri, database } => {
                let store = MongoStore::connect(uri, database).await?;
                info!(database = %database, "Connected to MongoDB");
                Ok(Box::new(store))
            }
            Self::Sqlite { url } => {
                let store = SqliteStore::connect(url).await?;
                info!(url = %url, "Opened SQLite document store");
                Ok(Box::new(store))
            }
        }
    }
}

/// Collection names end up inside DDL, so they are restricted to `[A-Za-z0-9_]`.
pub(crate) fn check_collection(name: &str) -> Result<(), StoreError> {
    let valid = !name.is_empty()
        && !name.contains("__")
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidName(name.to_string()))
    }
}

/// SQLite JSON path for a dotted field path: `desktop.url` → `$."desktop"."url"`.
pub(crate) fn json_path(field: &str) -> Result<String, StoreError> {
    let mut path = String::from("$");
    for segment in field.split('.') {
        let valid = !segment.is_empty()
            && segment
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(StoreError::InvalidName(field.to_string()));
        }
        path.push_str(".\"");
        path.push_str(segment);
        path.push('"');
    }
    Ok(path)
}

pub(crate) fn index_name(collection: &str, index: &IndexSpec) -> String {
    let fields: Vec<String> = index.fields.iter().map(|f| f.replace(['.', '-'], "_")).collect();
    let mut name = format!("ix__{collection}__{}", fields.join("__"));
    if index.unique {
        name.push_str("__unique");
    }
    name
}
