use std::collections::HashSet;

use async_trait::async_trait;
use futures::TryStreamExt;
use mongodb::bson::{Bson, Document, doc};
use mongodb::error::ErrorKind;
use mongodb::options::{ClientOptions, FindOptions, IndexOptions};
use mongodb::{Client, Collection, Database, IndexModel};
use serde_json::Value;
use tracing::debug;

use crate::error::StoreError;
use crate::models::{Filter, Identity, IdentityKey, Record, Scalar};
use crate::traits::{DocumentStore, IndexSpec, UpsertOp};

/// Server code for operations on a collection that does not exist yet.
const NAMESPACE_NOT_FOUND: i32 = 26;

#[derive(Clone)]
pub struct MongoStore {
    client: Client,
    db: Database,
}

impl MongoStore {
    /// Connect and verify the deployment answers before any work starts.
    pub async fn connect(uri: &str, database: &str) -> Result<Self, StoreError> {
        let options = ClientOptions::parse(uri).await?;
        let client = Client::with_options(options)?;
        let db = client.database(database);
        db.run_command(doc! { "ping": 1 }, None).await?;
        Ok(Self { client, db })
    }

    fn collection(&self, name: &str) -> Collection<Document> {
        self.db.collection::<Document>(name)
    }
}

fn scalar_bson(value: &Scalar) -> Bson {
    match value {
        Scalar::Text(s) => Bson::String(s.clone()),
        Scalar::Integer(n) => Bson::Int64(*n),
        Scalar::Bool(b) => Bson::Boolean(*b),
    }
}

fn filter_doc(filter: &Filter) -> Document {
    let mut query = Document::new();
    for (path, value) in &filter.0 {
        query.insert(path.clone(), scalar_bson(value));
    }
    query
}

fn any_of(filters: &[Filter]) -> Document {
    let clauses: Vec<Document> = filters.iter().map(filter_doc).collect();
    doc! { "$or": clauses }
}

/// Key fields only, without `_id`.
fn identity_projection(key: &IdentityKey) -> Document {
    let mut projection = doc! { "_id": 0 };
    for field in key.fields() {
        projection.insert(field.clone(), 1);
    }
    projection
}

/// Ordered `update` command upserting every op. A payload `_id` is dropped
/// so it never conflicts with the stored one.
fn upsert_command(collection: &str, ops: &[UpsertOp]) -> Result<Document, StoreError> {
    let mut statements = Vec::with_capacity(ops.len());
    for op in ops {
        let mut payload = mongodb::bson::to_document(&op.payload)?;
        payload.remove("_id");
        statements.push(doc! {
            "q": filter_doc(&op.filter),
            "u": { "$set": payload },
            "upsert": true,
        });
    }
    Ok(doc! { "update": collection, "updates": statements, "ordered": true })
}

fn check_write_errors(reply: &Document, attempted: usize) -> Result<(), StoreError> {
    if let Ok(errors) = reply.get_array("writeErrors")
        && let Some(first) = errors.first()
    {
        let message = first
            .as_document()
            .and_then(|e| e.get_str("errmsg").ok())
            .unwrap_or("unknown write error");
        return Err(StoreError::Rejected(format!(
            "{} of {attempted} upserts rejected, first: {message}",
            errors.len()
        )));
    }
    Ok(())
}

/// Query and update setting `field` to `value` on matching documents that do
/// not already hold it, so the modified count only covers real changes.
fn set_field_update(filters: &[Filter], field: &str, value: &Scalar) -> (Document, Document) {
    let value = scalar_bson(value);
    let mut query = any_of(filters);
    query.insert(field, doc! { "$ne": value.clone() });
    let mut set = Document::new();
    set.insert(field, value);
    (query, doc! { "$set": set })
}

fn index_model(index: &IndexSpec) -> IndexModel {
    let mut keys = Document::new();
    for field in &index.fields {
        keys.insert(field.clone(), 1);
    }
    IndexModel::builder()
        .keys(keys)
        .options(IndexOptions::builder().unique(index.unique).build())
        .build()
}

#[async_trait]
impl DocumentStore for MongoStore {
    fn backend(&self) -> &'static str {
        "mongodb"
    }

    async fn load_identities(
        &self,
        collection: &str,
        key: &IdentityKey,
    ) -> Result<HashSet<Identity>, StoreError> {
        let options = FindOptions::builder()
            .projection(identity_projection(key))
            .build();

        let mut identities = HashSet::new();
        let mut cursor = self.collection(collection).find(doc! {}, options).await?;
        while let Some(document) = cursor.try_next().await? {
            if let Value::Object(record) = Bson::Document(document).into_relaxed_extjson()
                && let Ok(identity) = key.extract(&record)
            {
                identities.insert(identity);
            }
        }
        Ok(identities)
    }

    async fn upsert_many(&self, collection: &str, ops: &[UpsertOp]) -> Result<u64, StoreError> {
        if ops.is_empty() {
            return Ok(0);
        }

        // One round trip for the whole batch, applied in order
        let reply = self
            .db
            .run_command(upsert_command(collection, ops)?, None)
            .await?;
        check_write_errors(&reply, ops.len())?;
        Ok(ops.len() as u64)
    }

    async fn insert_many(&self, collection: &str, docs: &[Record]) -> Result<u64, StoreError> {
        if docs.is_empty() {
            return Ok(0);
        }
        let documents = docs
            .iter()
            .map(mongodb::bson::to_document)
            .collect::<Result<Vec<_>, _>>()?;
        let result = self.collection(collection).insert_many(documents, None).await?;
        Ok(result.inserted_ids.len() as u64)
    }

    async fn delete_matching(
        &self,
        collection: &str,
        filters: &[Filter],
    ) -> Result<u64, StoreError> {
        if filters.is_empty() {
            return Ok(0);
        }
        let result = self
            .collection(collection)
            .delete_many(any_of(filters), None)
            .await?;
        Ok(result.deleted_count)
    }

    async fn set_field(
        &self,
        collection: &str,
        filters: &[Filter],
        field: &str,
        value: Scalar,
    ) -> Result<u64, StoreError> {
        if filters.is_empty() {
            return Ok(0);
        }
        let (query, update) = set_field_update(filters, field, &value);
        let result = self
            .collection(collection)
            .update_many(query, update, None)
            .await?;
        Ok(result.modified_count)
    }

    async fn count(&self, collection: &str, filter: Option<&Filter>) -> Result<u64, StoreError> {
        let query = filter.map(filter_doc).unwrap_or_default();
        Ok(self.collection(collection).count_documents(query, None).await?)
    }

    async fn drop_indexes(&self, collection: &str) -> Result<(), StoreError> {
        match self.collection(collection).drop_indexes(None).await {
            Ok(()) => Ok(()),
            Err(e) if matches!(*e.kind, ErrorKind::Command(ref c) if c.code == NAMESPACE_NOT_FOUND) => {
                debug!(collection, "No collection yet, nothing to drop");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn create_index(&self, collection: &str, index: &IndexSpec) -> Result<(), StoreError> {
        self.collection(collection)
            .create_index(index_model(index), None)
            .await?;
        Ok(())
    }

    async fn close(&self) {
        self.client.clone().shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    fn sku(s: &str) -> Filter {
        Filter::eq("sku", Scalar::Text(s.into()))
    }

    #[test]
    fn scalars_keep_their_bson_type() {
        assert_eq!(scalar_bson(&Scalar::Text("A".into())), Bson::String("A".into()));
        assert_eq!(scalar_bson(&Scalar::Integer(7)), Bson::Int64(7));
        assert_eq!(scalar_bson(&Scalar::Bool(true)), Bson::Boolean(true));
    }

    #[test]
    fn composite_filter_matches_every_path() {
        let filter = Filter(vec![
            ("desktop.url".into(), Scalar::Text("d".into())),
            ("mobile.url".into(), Scalar::Text("m".into())),
        ]);
        assert_eq!(filter_doc(&filter), doc! { "desktop.url": "d", "mobile.url": "m" });
        assert_eq!(
            any_of(&[sku("A"), sku("B")]),
            doc! { "$or": [{ "sku": "A" }, { "sku": "B" }] }
        );
    }

    #[test]
    fn projection_is_limited_to_key_fields() {
        assert_eq!(
            identity_projection(&IdentityKey::composite("desktop.url", "mobile.url")),
            doc! { "_id": 0, "desktop.url": 1, "mobile.url": 1 }
        );
    }

    #[test]
    fn upsert_command_is_ordered_and_sets_payload() {
        let ops = [
            UpsertOp {
                filter: sku("A"),
                payload: record(json!({"_id": "x", "sku": "A", "price": 10})),
            },
            UpsertOp {
                filter: sku("B"),
                payload: record(json!({"sku": "B"})),
            },
        ];
        let command = upsert_command("products", &ops).unwrap();

        assert_eq!(command.get_str("update").unwrap(), "products");
        assert!(command.get_bool("ordered").unwrap());
        let updates = command.get_array("updates").unwrap();
        assert_eq!(updates.len(), 2);
        let first = updates[0].as_document().unwrap();
        assert_eq!(first.get_document("q").unwrap(), &doc! { "sku": "A" });
        assert!(first.get_bool("upsert").unwrap());
        let set = first.get_document("u").unwrap().get_document("$set").unwrap();
        assert!(!set.contains_key("_id"));
        assert_eq!(set.get_str("sku").unwrap(), "A");
        assert_eq!(set.get_i64("price").unwrap(), 10);
    }

    #[test]
    fn write_errors_become_rejections() {
        assert!(check_write_errors(&doc! { "ok": 1, "n": 2 }, 2).is_ok());
        assert!(check_write_errors(&doc! { "ok": 1, "writeErrors": [] }, 2).is_ok());

        let reply = doc! {
            "ok": 1,
            "n": 1,
            "writeErrors": [{ "index": 1, "code": 11000, "errmsg": "E11000 duplicate key" }],
        };
        match check_write_errors(&reply, 3) {
            Err(StoreError::Rejected(message)) => {
                assert_eq!(message, "1 of 3 upserts rejected, first: E11000 duplicate key");
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn set_field_skips_documents_already_holding_the_value() {
        let (query, update) = set_field_update(&[sku("C")], "deleted", &Scalar::Bool(true));
        assert_eq!(
            query,
            doc! { "$or": [{ "sku": "C" }], "deleted": { "$ne": true } }
        );
        assert_eq!(update, doc! { "$set": { "deleted": true } });
    }

    #[test]
    fn index_model_carries_uniqueness() {
        let unique = index_model(&IndexSpec::unique(&["desktop.url".into(), "mobile.url".into()]));
        assert_eq!(unique.keys, doc! { "desktop.url": 1, "mobile.url": 1 });
        assert_eq!(unique.options.and_then(|o| o.unique), Some(true));

        let secondary = index_model(&IndexSpec::secondary("title"));
        assert_eq!(secondary.options.and_then(|o| o.unique), Some(false));
    }
}
