//! Cross-provider normalization: each provider's raw payload maps
//! into a common [`NormalizedItem`] shape through a small per-provider
//! `Mapper`, looked up by a provider key that doesn't have to match a
//! connector name one-to-one (a provider can register synthetic keys for
//! sub-resources, e.g. `"google-calendar"` alongside `"google"`).

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::{SdkError, SdkResult};
use crate::model::NormalizedItem;

pub trait Mapper: Send + Sync {
    fn map(&self, raw: &serde_json::Value, user_id: &str) -> SdkResult<NormalizedItem>;
}

#[derive(Default)]
pub struct Normalizer {
    mappers: RwLock<HashMap<String, Arc<dyn Mapper>>>,
}

impl Normalizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the mapper for a provider key. Takes `&self`
    /// so a connector can register its mapper after the `Normalizer` is
    /// already shared behind an `Arc` (e.g. from `Sdk::register_connector`).
    pub fn register(&self, provider_key: impl Into<String>, mapper: Arc<dyn Mapper>) {
        self.mappers.write().unwrap().insert(provider_key.into(), mapper);
    }

    /// Maps and validates a whole batch. Validation failure on any item
    /// aborts the batch rather than returning a partial result.
    pub fn normalize_batch(
        &self,
        provider_key: &str,
        raw_items: &[serde_json::Value],
        user_id: &str,
    ) -> SdkResult<Vec<NormalizedItem>> {
        let mappers = self.mappers.read().unwrap();
        let mapper = mappers
            .get(provider_key)
            .ok_or_else(|| SdkError::Schema(format!("no mapper registered for {provider_key}")))?;

        raw_items
            .iter()
            .map(|raw| {
                let item = mapper.map(raw, user_id)?;
                validate(&item)?;
                Ok(item)
            })
            .collect()
    }
}

fn validate(item: &NormalizedItem) -> SdkResult<()> {
    if item.source.is_empty() {
        return Err(SdkError::Schema("normalized item missing source".into()));
    }
    if item.external_id.is_empty() {
        return Err(SdkError::Schema("normalized item missing external_id".into()));
    }
    if item.user_id.is_empty() {
        return Err(SdkError::Schema("normalized item missing user_id".into()));
    }
    let expected_id = NormalizedItem::derive_id(&item.source, &item.external_id, &item.user_id);
    if item.id != expected_id {
        return Err(SdkError::Schema(format!(
            "normalized item id does not match derive_id for ({}, {}, {})",
            item.source, item.external_id, item.user_id
        )));
    }
    Ok(())
}
