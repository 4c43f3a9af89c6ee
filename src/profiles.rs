//! Per-entity parameters of the sync engine: identity key, staleness policy,
//! index specification, input layout and record preparation.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use serde_json::Value;

use crate::models::{IdentityKey, Record};
use crate::source::SourceLayout;
use crate::traits::IndexSpec;

pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Field carrying the soft-delete marker on tombstoned entities.
pub const TOMBSTONE_FIELD: &str = "deleted";

/// What happens to persisted records whose identity is missing from the input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StalenessPolicy {
    /// Left alone.
    None,
    /// Kept, with the tombstone flag set.
    Soft,
    /// Deleted.
    Hard,
}

/// The catalog entities this tool synchronizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Products,
    Carousel,
    Categories,
    Brands,
    Banners,
}

impl EntityKind {
    pub const ALL: [EntityKind; 5] = [
        Self::Products,
        Self::Carousel,
        Self::Categories,
        Self::Brands,
        Self::Banners,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Products => "products",
            Self::Carousel => "carousel",
            Self::Categories => "categories",
            Self::Brands => "brands",
            Self::Banners => "banners",
        }
    }

    /// Hand-off file name, relative to the data directory.
    pub fn default_input(self) -> &'static str {
        match self {
            Self::Products => "products_updated_prices.json",
            Self::Carousel => "carousel_data/carousel_images_with_cloudinary.json",
            Self::Categories => "menu_structure.json",
            Self::Brands => "brand_structure.json",
            Self::Banners => "carousel_banners.json",
        }
    }

    pub fn profile(self) -> EntityProfile {
        match self {
            Self::Products => EntityProfile {
                kind: self,
                collection: "products".to_string(),
                key: IdentityKey::single("sku"),
                staleness: StalenessPolicy::Soft,
                layout: SourceLayout::Array,
                batch_size: DEFAULT_BATCH_SIZE,
                secondary_indexes: fields(&[
                    "title",
                    "main_category",
                    "sub_category",
                    "product_type",
                    "availability",
                    TOMBSTONE_FIELD,
                ]),
                insert_defaults: Record::from_iter([(
                    TOMBSTONE_FIELD.to_string(),
                    Value::Bool(false),
                )]),
                stamp_field: None,
            },
            Self::Carousel => EntityProfile {
                kind: self,
                collection: "carousel".to_string(),
                key: IdentityKey::composite("desktop.url", "mobile.url"),
                staleness: StalenessPolicy::Hard,
                layout: SourceLayout::Array,
                batch_size: DEFAULT_BATCH_SIZE,
                secondary_indexes: fields(&["timestamp", "params.category_id"]),
                insert_defaults: Record::new(),
                stamp_field: Some("last_updated"),
            },
            Self::Categories => Self::titled(self, "categories"),
            Self::Brands => Self::titled(self, "brands"),
            Self::Banners => EntityProfile {
                kind: self,
                collection: "banners".to_string(),
                key: IdentityKey::single("id"),
                staleness: StalenessPolicy::None,
                layout: SourceLayout::Wrapped("banners"),
                batch_size: DEFAULT_BATCH_SIZE,
                secondary_indexes: Vec::new(),
                insert_defaults: Record::new(),
                stamp_field: None,
            },
        }
    }

    fn titled(kind: Self, field: &'static str) -> EntityProfile {
        EntityProfile {
            kind,
            collection: field.to_string(),
            key: IdentityKey::single("title"),
            staleness: StalenessPolicy::None,
            layout: SourceLayout::Wrapped(field),
            batch_size: DEFAULT_BATCH_SIZE,
            secondary_indexes: Vec::new(),
            insert_defaults: Record::new(),
            stamp_field: None,
        }
    }
}

fn fields(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| (*s).to_string()).collect()
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown entity `{s}`"))
    }
}

/// Everything the engine needs to know about one entity type.
#[derive(Debug, Clone)]
pub struct EntityProfile {
    pub kind: EntityKind,
    pub collection: String,
    pub key: IdentityKey,
    pub staleness: StalenessPolicy,
    pub layout: SourceLayout,
    pub batch_size: usize,
    /// Non-unique indexes created after the unique identity index
    pub secondary_indexes: Vec<String>,
    /// Fields added to inserted records that do not carry them
    pub insert_defaults: Record,
    /// Field stamped with the run time on every record
    pub stamp_field: Option<&'static str>,
}

impl EntityProfile {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Unique identity index first, then the secondary ones.
    pub fn indexes(&self) -> Vec<IndexSpec> {
        let mut indexes = vec![IndexSpec::unique(self.key.fields())];
        indexes.extend(
            self.secondary_indexes
                .iter()
                .map(|field| IndexSpec::secondary(field)),
        );
        indexes
    }

    /// Normalize a record seen in the input before it is resolved: records
    /// present in the input are live, and stamped entities get `now`.
    pub fn prepare(&self, record: &mut Record, now: &str) {
        if self.staleness == StalenessPolicy::Soft {
            record.insert(TOMBSTONE_FIELD.to_string(), Value::Bool(false));
        }
        if let Some(field) = self.stamp_field {
            record.insert(field.to_string(), Value::String(now.to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn entity_names_round_trip() {
        for kind in EntityKind::ALL {
            assert_eq!(kind.name().parse::<EntityKind>().unwrap(), kind);
        }
        assert_eq!("Products".parse::<EntityKind>().unwrap(), EntityKind::Products);
        assert!("widgets".parse::<EntityKind>().is_err());
    }

    #[test]
    fn policies_per_entity() {
        assert_eq!(EntityKind::Products.profile().staleness, StalenessPolicy::Soft);
        assert_eq!(EntityKind::Carousel.profile().staleness, StalenessPolicy::Hard);
        assert_eq!(EntityKind::Categories.profile().staleness, StalenessPolicy::None);
        assert_eq!(EntityKind::Brands.profile().staleness, StalenessPolicy::None);
        assert_eq!(
            EntityKind::Brands.profile().layout,
            SourceLayout::Wrapped("brands")
        );
    }

    #[test]
    fn identity_index_comes_first() {
        let indexes = EntityKind::Carousel.profile().indexes();
        assert_eq!(indexes[0].describe(), "desktop.url+mobile.url (unique)");
        assert_eq!(indexes.len(), 3);
        assert!(!indexes[1].unique);
    }

    #[test]
    fn prepare_revives_and_stamps() {
        let mut product = json!({"sku": "A", "deleted": true}).as_object().cloned().unwrap();
        EntityKind::Products.profile().prepare(&mut product, "2024-01-01T00:00:00Z");
        assert_eq!(product["deleted"], json!(false));
        assert!(!product.contains_key("last_updated"));

        let mut slide = json!({"desktop": {"url": "d"}}).as_object().cloned().unwrap();
        EntityKind::Carousel.profile().prepare(&mut slide, "2024-01-01T00:00:00Z");
        assert_eq!(slide["last_updated"], json!("2024-01-01T00:00:00Z"));
        assert!(!slide.contains_key("deleted"));
    }

    #[test]
    fn batch_size_is_at_least_one() {
        assert_eq!(EntityKind::Products.profile().with_batch_size(0).batch_size, 1);
    }
}
