//! Social-link aggregator adapter: results capped at 100 per page,
//! cursor pagination via `after`/`before`, username resolved through a
//! `/me` pre-fetch since the links endpoint is keyed by username rather
//! than the authenticated user id.

use async_trait::async_trait;
use secrecy::SecretString;

use crate::connector::{FetchContext, ProviderAdapter};
use crate::error::SdkResult;
use crate::etag_cache::EtagCache;
use crate::http_core::HttpRequest;

const MAX_LIMIT: u32 = 100;

pub struct SocialLinkAdapter {
    base_url: String,
}

impl SocialLinkAdapter {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl ProviderAdapter for SocialLinkAdapter {
    fn provider_key(&self) -> &str {
        "social-link-aggregator"
    }

    async fn fetch(&self, ctx: &FetchContext<'_>) -> SdkResult<Vec<serde_json::Value>> {
        let provider_key = self.provider_key();
        let token = SecretString::from(ctx.access_token.clone());

        let me_request = HttpRequest::get(format!("{}/api/v1/me", self.base_url))
            .bearer(token.clone())
            .cached(EtagCache::fingerprint(ctx.user_id, provider_key, "me"));
        let me = ctx.http.request(provider_key, me_request).await?;
        let username = me.body["username"]
            .as_str()
            .unwrap_or_default()
            .to_string();

        let mut url = format!(
            "{}/api/v1/users/{username}/links?limit={MAX_LIMIT}",
            self.base_url
        );
        if let Some(cursor) = &ctx.cursor {
            url.push_str(&format!("&after={cursor}"));
        }

        let cache_key = EtagCache::fingerprint(ctx.user_id, provider_key, &format!("links:{username}"));
        let request = HttpRequest::get(url).bearer(token).cached(cache_key);
        let response = ctx.http.request(provider_key, request).await?;

        Ok(response.body["data"].as_array().cloned().unwrap_or_default())
    }
}
