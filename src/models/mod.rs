//! Catalog records and the identity keys used to match them across runs

use std::fmt;

use serde_json::{Map, Value};

/// One catalog entity (product, category, brand, carousel slide or banner)
/// as it appears in a hand-off file.
pub type Record = Map<String, Value>;

/// A filterable scalar: identity parts and flag values.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Scalar {
    Text(String),
    Integer(i64),
    Bool(bool),
}

impl Scalar {
    pub fn to_json(&self) -> Value {
        match self {
            Self::Text(s) => Value::String(s.clone()),
            Self::Integer(n) => Value::from(*n),
            Self::Bool(b) => Value::Bool(*b),
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(s) => write!(f, "{s}"),
            Self::Integer(n) => write!(f, "{n}"),
            Self::Bool(b) => write!(f, "{b}"),
        }
    }
}

/// The identity of a record: one scalar per field of its [`IdentityKey`],
/// in key order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identity(pub Vec<Scalar>);

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, part) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" | ")?;
            }
            write!(f, "{part}")?;
        }
        Ok(())
    }
}

/// Equality conditions on dotted field paths, all of which must hold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter(pub Vec<(String, Scalar)>);

impl Filter {
    pub fn eq(path: &str, value: Scalar) -> Self {
        Self(vec![(path.to_string(), value)])
    }
}

/// Field or field combination designating a logical record across runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityKey {
    fields: Vec<String>,
}

impl IdentityKey {
    pub fn single(field: &str) -> Self {
        Self {
            fields: vec![field.to_string()],
        }
    }

    pub fn composite(first: &str, second: &str) -> Self {
        Self {
            fields: vec![first.to_string(), second.to_string()],
        }
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// Extract the identity of `record`, or describe why it has none.
    ///
    /// Each part must be a non-empty string or an integer. Dotted paths walk
    /// nested objects.
    pub fn extract(&self, record: &Record) -> Result<Identity, String> {
        self.from_parts(self.fields.iter().map(|field| lookup(record, field)))
    }

    /// Build an identity from already-projected values, one per key field.
    pub fn from_parts<'a>(
        &self,
        values: impl IntoIterator<Item = Option<&'a Value>>,
    ) -> Result<Identity, String> {
        let mut parts = Vec::with_capacity(self.fields.len());
        let mut values = values.into_iter();
        for field in &self.fields {
            let value = values
                .next()
                .flatten()
                .ok_or_else(|| format!("`{field}` is absent"))?;
            let part = match value {
                Value::String(s) if s.trim().is_empty() => {
                    return Err(format!("`{field}` is empty"));
                }
                Value::String(s) => Scalar::Text(s.clone()),
                Value::Number(n) => match n.as_i64() {
                    Some(n) => Scalar::Integer(n),
                    None => return Err(format!("`{field}` is not an integer")),
                },
                Value::Null => return Err(format!("`{field}` is null")),
                _ => return Err(format!("`{field}` is not a scalar")),
            };
            parts.push(part);
        }
        Ok(Identity(parts))
    }

    /// Filter matching documents that carry `identity`.
    pub fn filter(&self, identity: &Identity) -> Filter {
        Filter(
            self.fields
                .iter()
                .cloned()
                .zip(identity.0.iter().cloned())
                .collect(),
        )
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.fields.join("+"))
    }
}

/// Resolve a dotted path (`desktop.url`) inside a record.
pub fn lookup<'a>(record: &'a Record, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = record.get(segments.next()?)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn extracts_single_and_composite_keys() {
        let sku = IdentityKey::single("sku");
        let id = sku.extract(&record(json!({"sku": "A-1", "price": 3}))).unwrap();
        assert_eq!(id, Identity(vec![Scalar::Text("A-1".into())]));

        let slide = IdentityKey::composite("desktop.url", "mobile.url");
        let id = slide
            .extract(&record(json!({
                "desktop": {"url": "https://cdn/d.jpg"},
                "mobile": {"url": "https://cdn/m.jpg"}
            })))
            .unwrap();
        assert_eq!(id.to_string(), "https://cdn/d.jpg | https://cdn/m.jpg");
    }

    #[test]
    fn integer_ids_are_identities() {
        let key = IdentityKey::single("id");
        let id = key.extract(&record(json!({"id": 42}))).unwrap();
        assert_eq!(id.0, vec![Scalar::Integer(42)]);
    }

    #[test]
    fn rejects_absent_empty_and_non_scalar_keys() {
        let key = IdentityKey::single("sku");
        assert!(key.extract(&record(json!({"title": "x"}))).is_err());
        assert!(key.extract(&record(json!({"sku": "  "}))).is_err());
        assert!(key.extract(&record(json!({"sku": null}))).is_err());
        assert!(key.extract(&record(json!({"sku": ["a"]}))).is_err());
        assert!(key.extract(&record(json!({"sku": 1.5}))).is_err());

        let slide = IdentityKey::composite("desktop.url", "mobile.url");
        let err = slide
            .extract(&record(json!({"desktop": {"url": "d"}, "mobile": {}})))
            .unwrap_err();
        assert!(err.contains("mobile.url"));
    }

    #[test]
    fn filter_pairs_fields_with_parts() {
        let slide = IdentityKey::composite("desktop.url", "mobile.url");
        let identity = Identity(vec![Scalar::Text("d".into()), Scalar::Text("m".into())]);
        assert_eq!(
            slide.filter(&identity),
            Filter(vec![
                ("desktop.url".into(), Scalar::Text("d".into())),
                ("mobile.url".into(), Scalar::Text("m".into())),
            ])
        );
    }
}
