//! Study source clients and shared HTTP utilities.

use std::borrow::Cow;
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use http_cache_reqwest::{
    CACacheManager, Cache, CacheMode, CacheOptions, HttpCache, HttpCacheOptions,
};
use reqwest::header::{CACHE_CONTROL, HeaderMap, HeaderValue};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware, RequestBuilder};
use reqwest_retry::{RetryTransientMiddleware, policies::ExponentialBackoff};
use tracing::warn;

use crate::error::{FetchError, TrialScopeError};
use crate::sources::clinicaltrials::StudyApi;

pub mod clinicaltrials;
pub mod params;
pub(crate) mod rate_limit;

const ERROR_BODY_MAX_BYTES: usize = 2048;
pub(crate) const DEFAULT_MAX_BODY_BYTES: usize = 8 * 1024 * 1024;

tokio::task_local! {
    static NO_CACHE: bool;
}

pub async fn with_no_cache<R, F>(no_cache: bool, fut: F) -> R
where
    F: Future<Output = R>,
{
    NO_CACHE.scope(no_cache, fut).await
}

pub(crate) fn apply_cache_mode(req: RequestBuilder) -> RequestBuilder {
    match NO_CACHE.try_with(|v| *v) {
        Ok(true) => req.with_extension(CacheMode::NoStore),
        _ => req,
    }
}

pub(crate) fn env_base(default: &'static str, env_var: &str) -> Cow<'static, str> {
    std::env::var(env_var)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .map(Cow::Owned)
        .unwrap_or_else(|| Cow::Borrowed(default))
}

pub(crate) fn cache_dir() -> PathBuf {
    match dirs::cache_dir() {
        Some(dir) => dir.join("trialscope"),
        None => std::env::temp_dir().join("trialscope"),
    }
}

/// Middleware choices for a study client.
///
/// Retrying is opt-in: the fetch layer itself never retries, callers decide.
#[derive(Debug, Clone, Copy)]
pub struct ClientOptions {
    pub cache: bool,
    pub retries: u32,
    pub rate_limit: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            cache: true,
            retries: 0,
            rate_limit: true,
        }
    }
}

impl ClientOptions {
    /// Plain client with every middleware switched off.
    pub fn bare() -> Self {
        Self {
            cache: false,
            retries: 0,
            rate_limit: false,
        }
    }
}

/// Builds an HTTP client with the middleware selected in `options`.
///
/// - Cache: disk-based HTTP cache in the XDG cache directory
/// - Cache TTL: `Cache-Control: max-stale=300` keeps header-less responses usable for 5 minutes
/// - Retry: exponential backoff for transient errors, only when `retries > 0`
/// - Pacing: requests to `api` share one process-wide send schedule
pub(crate) fn build_client(
    api: StudyApi,
    options: ClientOptions,
) -> Result<ClientWithMiddleware, TrialScopeError> {
    let mut default_headers = HeaderMap::new();
    if options.cache {
        default_headers.insert(CACHE_CONTROL, HeaderValue::from_static("max-stale=300"));
    }

    let base_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .connect_timeout(Duration::from_secs(10))
        .user_agent(concat!("trialscope/", env!("CARGO_PKG_VERSION")))
        .default_headers(default_headers)
        .build()
        .map_err(TrialScopeError::HttpClientInit)?;

    let mut builder = ClientBuilder::new(base_client);

    if options.cache {
        let cache_path = cache_dir().join("http-cacache");
        std::fs::create_dir_all(&cache_path)?;
        let cache_options = HttpCacheOptions {
            cache_options: Some(CacheOptions {
                shared: true,
                ..CacheOptions::default()
            }),
            ..HttpCacheOptions::default()
        };
        builder = builder.with(Cache(HttpCache {
            mode: CacheMode::Default,
            manager: CACacheManager { path: cache_path },
            options: cache_options,
        }));
    }
    if options.retries > 0 {
        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(options.retries);
        builder = builder.with(RetryTransientMiddleware::new_with_policy(retry_policy));
    }
    if options.rate_limit {
        builder = builder.with(rate_limit::PacingMiddleware::new(api));
    }

    Ok(builder.build())
}

/// First bytes of an error body on one line, for inclusion in a message.
pub(crate) fn body_excerpt(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    let cut = (0..=ERROR_BODY_MAX_BYTES.min(text.len()))
        .rev()
        .find(|&i| text.is_char_boundary(i))
        .unwrap_or(0);
    let mut excerpt = text[..cut]
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    if cut < text.len() {
        excerpt.push_str(" …");
    }
    excerpt
}

pub(crate) fn ensure_json_content_type(
    api: &str,
    status: u16,
    content_type: Option<&HeaderValue>,
    body: &[u8],
) -> Result<(), FetchError> {
    let Some(content_type) = content_type else {
        return Ok(());
    };

    let raw = match content_type.to_str() {
        Ok(v) => v.trim(),
        Err(_) => {
            warn!(
                source = api,
                "content-type is not UTF-8; decoding body as JSON anyway"
            );
            return Ok(());
        }
    };
    if raw.is_empty() {
        return Ok(());
    }

    let media_type = raw
        .split(';')
        .next()
        .map(str::trim)
        .unwrap_or_default()
        .to_ascii_lowercase();
    if matches!(media_type.as_str(), "text/html" | "application/xhtml+xml") {
        return Err(FetchError::new(
            Some(status),
            format!(
                "{api} returned HTML (content-type: {raw}): {}",
                body_excerpt(body)
            ),
        ));
    }

    let is_json = media_type == "application/json"
        || media_type == "text/json"
        || media_type.ends_with("+json");
    if !is_json {
        warn!(
            source = api,
            content_type = raw,
            "content-type is not JSON; decoding body as JSON anyway"
        );
    }

    Ok(())
}

pub(crate) async fn read_limited_body(
    mut resp: reqwest::Response,
    api: &str,
) -> Result<Vec<u8>, FetchError> {
    let status = resp.status().as_u16();
    let mut body: Vec<u8> = Vec::new();

    while let Some(chunk) = resp
        .chunk()
        .await
        .map_err(|err| FetchError::from_reqwest(api, &err))?
    {
        let next_len = body.len().saturating_add(chunk.len());
        if next_len > DEFAULT_MAX_BODY_BYTES {
            return Err(FetchError::new(
                Some(status),
                format!("{api} response body exceeded {DEFAULT_MAX_BODY_BYTES} bytes"),
            ));
        }
        body.extend_from_slice(&chunk);
    }

    Ok(body)
}
