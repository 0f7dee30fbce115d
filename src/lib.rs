//! OAuth-aware ingestion SDK: token lifecycle management, governed HTTP
//! fetching, and cross-provider normalization behind a single [`Sdk`]
//! handle.
//!
//! ```text
//! let sdk = Sdk::init(config).await?;
//! sdk.register_connector("code-hosting-starred", adapter, mapper).await;
//! let url = sdk.connect("code-hosting-starred", "user-1").await?;
//! // ...redirect the user, receive the callback...
//! sdk.handle_callback("code-hosting-starred", &code, &state).await?;
//! let items = sdk.fetch("code-hosting-starred", "user-1", None).await?;
//! ```

pub mod auth_core;
pub mod circuit_breaker;
pub mod config;
pub mod connector;
pub mod crypto;
pub mod distributed_lock;
pub mod error;
pub mod etag_cache;
pub mod http_core;
pub mod metrics;
pub mod model;
pub mod normalizer;
pub mod providers;
pub mod rate_limiter;
pub mod retry;
pub mod sdk;
pub mod token_store;

pub use config::SdkConfig;
pub use connector::{BaseConnector, FetchContext, ProviderAdapter};
pub use error::{SdkError, SdkResult};
pub use model::{ClientCredentials, NormalizedItem, PkceChallenge, StoredToken, TokenSet};
pub use normalizer::Mapper;
pub use sdk::{Sdk, SdkHealth};
