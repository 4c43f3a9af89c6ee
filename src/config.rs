use std::path::PathBuf;

use serde::Serialize;

use crate::database::StoreConfig;
use crate::error::StoreError;
use crate::profiles::{EntityKind, EntityProfile};

pub const DEFAULT_STORE_URL: &str = "sqlite:database/catalog.db";
pub const DEFAULT_DATABASE_NAME: &str = "abc_electronics";
pub const MARKUP_INPUT: &str = "products.json";
/// Every two hours, on the hour.
pub const DEFAULT_PIPELINE_CRON: &str = "0 0 */2 * * *";

#[derive(Debug, Clone, Serialize)]
pub struct Config {
    pub store_url: String,
    pub database_name: String,
    /// Directory holding the hand-off files
    pub data_dir: PathBuf,
    /// Overrides every profile's batch size when set
    pub batch_size: Option<usize>,
    pub strict_indexes: bool,
    pub pipeline_cron: String,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let store_url = get("STORE_URL").unwrap_or_else(|| DEFAULT_STORE_URL.to_string());
        let database_name = get("DATABASE_NAME").unwrap_or_else(|| DEFAULT_DATABASE_NAME.to_string());
        let data_dir = get("DATA_DIR").map_or_else(|| PathBuf::from("."), PathBuf::from);
        let batch_size = get("SYNC_BATCH_SIZE")
            .and_then(|s| s.parse().ok())
            .filter(|&n: &usize| n > 0);
        let strict_indexes = get("SYNC_STRICT_INDEXES")
            .and_then(|s| s.parse().ok())
            .unwrap_or(false);
        let pipeline_cron = get("PIPELINE_CRON").unwrap_or_else(|| DEFAULT_PIPELINE_CRON.to_string());

        Self {
            store_url,
            database_name,
            data_dir,
            batch_size,
            strict_indexes,
            pipeline_cron,
        }
    }

    pub fn store(&self) -> Result<StoreConfig, StoreError> {
        StoreConfig::from_url(&self.store_url, &self.database_name)
    }

    /// Default hand-off file for `kind`, under the data directory.
    pub fn input_path(&self, kind: EntityKind) -> PathBuf {
        self.data_dir.join(kind.default_input())
    }

    /// Raw scraper output the markup step reads.
    pub fn markup_input(&self) -> PathBuf {
        self.data_dir.join(MARKUP_INPUT)
    }

    /// The markup step writes the file the product sync reads.
    pub fn markup_output(&self) -> PathBuf {
        self.input_path(EntityKind::Products)
    }

    pub fn profile(&self, kind: EntityKind) -> EntityProfile {
        let profile = kind.profile();
        match self.batch_size {
            Some(size) => profile.with_batch_size(size),
            None => profile,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Config::from_lookup(|k| vars.get(k).cloned())
    }

    #[test]
    fn defaults() {
        let cfg = config(&[]);
        assert_eq!(cfg.store_url, DEFAULT_STORE_URL);
        assert_eq!(cfg.database_name, "abc_electronics");
        assert_eq!(cfg.data_dir, PathBuf::from("."));
        assert_eq!(cfg.batch_size, None);
        assert!(!cfg.strict_indexes);
        assert_eq!(cfg.pipeline_cron, DEFAULT_PIPELINE_CRON);
        assert_eq!(cfg.profile(EntityKind::Products).batch_size, 1000);
    }

    #[test]
    fn overrides() {
        let cfg = config(&[
            ("STORE_URL", "mongodb://localhost:27017"),
            ("DATABASE_NAME", "shop"),
            ("DATA_DIR", "/srv/handoff"),
            ("SYNC_BATCH_SIZE", "50"),
            ("SYNC_STRICT_INDEXES", "true"),
        ]);
        assert!(cfg.strict_indexes);
        assert_eq!(cfg.profile(EntityKind::Carousel).batch_size, 50);
        assert_eq!(
            cfg.input_path(EntityKind::Products),
            PathBuf::from("/srv/handoff").join(EntityKind::Products.default_input())
        );
        assert!(matches!(cfg.store().unwrap(), StoreConfig::Mongo { .. }));
        assert_eq!(cfg.markup_input(), PathBuf::from("/srv/handoff/products.json"));
        assert_eq!(cfg.markup_output(), cfg.input_path(EntityKind::Products));
    }

    #[test]
    fn invalid_numbers_fall_back() {
        let cfg = config(&[("SYNC_BATCH_SIZE", "0"), ("SYNC_STRICT_INDEXES", "yes")]);
        assert_eq!(cfg.batch_size, None);
        assert!(!cfg.strict_indexes);
    }
}
