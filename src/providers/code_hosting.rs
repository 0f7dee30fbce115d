//! Code-hosting provider adapter: paged repository/starred-repo resources
//! with a versioned `Accept` header and `per_page`/`page` pagination
//! parameters.

use async_trait::async_trait;
use secrecy::SecretString;

use crate::connector::{FetchContext, ProviderAdapter};
use crate::error::SdkResult;
use crate::etag_cache::EtagCache;
use crate::http_core::HttpRequest;

const PAGE_SIZE: u32 = 50;

pub enum CodeHostingResource {
    Starred,
    Repos,
}

pub struct CodeHostingAdapter {
    base_url: String,
    provider_key: &'static str,
    resource: CodeHostingResource,
    accept_header: String,
}

impl CodeHostingAdapter {
    pub fn new(base_url: impl Into<String>, resource: CodeHostingResource, api_version: &str) -> Self {
        let provider_key = match resource {
            CodeHostingResource::Starred => "code-hosting-starred",
            CodeHostingResource::Repos => "code-hosting-repos",
        };
        Self {
            base_url: base_url.into(),
            provider_key,
            resource,
            accept_header: format!("application/vnd.code-hosting.{api_version}+json"),
        }
    }

    fn resource_path(&self) -> &'static str {
        match self.resource {
            CodeHostingResource::Starred => "user/starred",
            CodeHostingResource::Repos => "user/repos",
        }
    }
}

#[async_trait]
impl ProviderAdapter for CodeHostingAdapter {
    fn provider_key(&self) -> &str {
        self.provider_key
    }

    async fn fetch(&self, ctx: &FetchContext<'_>) -> SdkResult<Vec<serde_json::Value>> {
        let page: u32 = ctx
            .cursor
            .as_deref()
            .and_then(|c| c.parse().ok())
            .unwrap_or(1);

        let url = format!(
            "{}/{}?per_page={PAGE_SIZE}&page={page}",
            self.base_url,
            self.resource_path()
        );
        let cache_key = EtagCache::fingerprint(
            ctx.user_id,
            self.provider_key,
            &format!("{}:{page}", self.resource_path()),
        );

        let request = HttpRequest::get(url)
            .bearer(SecretString::from(ctx.access_token.clone()))
            .header("Accept", self.accept_header.as_str())
            .cached(cache_key);

        let response = ctx.http.request(self.provider_key, request).await?;
        Ok(response.body.as_array().cloned().unwrap_or_default())
    }
}
