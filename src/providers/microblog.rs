//! Microblog provider adapter: results capped at 100 per page, with an
//! extra-fields projection so the normalizer gets author/engagement data
//! in one round trip instead of N+1 lookups.

use async_trait::async_trait;
use secrecy::SecretString;

use crate::connector::{FetchContext, ProviderAdapter};
use crate::error::SdkResult;
use crate::etag_cache::EtagCache;
use crate::http_core::HttpRequest;

const MAX_LIMIT: u32 = 100;
const FIELD_PROJECTION: &str = "author,created_at,metrics,permalink";

pub struct MicroblogAdapter {
    base_url: String,
}

impl MicroblogAdapter {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl ProviderAdapter for MicroblogAdapter {
    fn provider_key(&self) -> &str {
        "microblog"
    }

    async fn fetch(&self, ctx: &FetchContext<'_>) -> SdkResult<Vec<serde_json::Value>> {
        let provider_key = self.provider_key();
        let mut url = format!(
            "{}/api/v1/timelines/home?limit={MAX_LIMIT}&fields={FIELD_PROJECTION}",
            self.base_url
        );
        if let Some(cursor) = &ctx.cursor {
            url.push_str(&format!("&max_id={cursor}"));
        }

        let cache_key = EtagCache::fingerprint(ctx.user_id, provider_key, "timeline:home");
        let request = HttpRequest::get(url)
            .bearer(SecretString::from(ctx.access_token.clone()))
            .cached(cache_key);
        let response = ctx.http.request(provider_key, request).await?;

        Ok(response.body.as_array().cloned().unwrap_or_default())
    }
}
