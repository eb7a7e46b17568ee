//! Fetch client for ClinicalTrials.gov v2 and the application backend.

use std::borrow::Cow;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest_middleware::ClientWithMiddleware;
use serde_json::Value;
use tracing::debug;

use crate::entities::loader::StudySource;
use crate::error::{FetchError, TrialScopeError};
use crate::sources::params::QueryParams;
use crate::sources::{
    ClientOptions, apply_cache_mode, body_excerpt, build_client, ensure_json_content_type,
    read_limited_body,
};

pub(crate) const CTGOV_BASE: &str = "https://clinicaltrials.gov/api/v2";
pub(crate) const CTGOV_BASE_ENV: &str = "TRIALSCOPE_CTGOV_BASE";
pub(crate) const BACKEND_BASE: &str = "http://127.0.0.1:8000";
pub(crate) const BACKEND_BASE_ENV: &str = "TRIALSCOPE_BACKEND_BASE";

/// Which upstream convention a client speaks.
///
/// `Ctgov` returns nested study records from `/studies`; `Backend` returns the
/// flattened records served by `/api/filtered-studies`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, clap::ValueEnum)]
pub enum StudyApi {
    #[default]
    Ctgov,
    Backend,
}

impl StudyApi {
    pub fn name(self) -> &'static str {
        match self {
            Self::Ctgov => "ctgov",
            Self::Backend => "backend",
        }
    }

    fn search_path(self) -> &'static str {
        match self {
            Self::Ctgov => "studies",
            Self::Backend => "api/filtered-studies",
        }
    }

    pub fn page_token_param(self) -> &'static str {
        match self {
            Self::Ctgov => "pageToken",
            Self::Backend => "page_token",
        }
    }

    pub(crate) fn base_from_env(self) -> Cow<'static, str> {
        match self {
            Self::Ctgov => crate::sources::env_base(CTGOV_BASE, CTGOV_BASE_ENV),
            Self::Backend => crate::sources::env_base(BACKEND_BASE, BACKEND_BASE_ENV),
        }
    }
}

/// One decoded page of upstream study records.
#[derive(Debug, Clone, Default)]
pub struct StudyPage {
    pub studies: Vec<Value>,
    pub next_page_token: Option<String>,
    pub total_count: Option<usize>,
}

impl StudyPage {
    pub(crate) fn from_body(api: StudyApi, body: Value) -> Result<Self, FetchError> {
        let Value::Object(mut obj) = body else {
            return Err(FetchError::transport(format!(
                "{}: Invalid response structure: expected a JSON object",
                api.name()
            )));
        };
        let Some(Value::Array(studies)) = obj.remove("studies") else {
            return Err(FetchError::transport(format!(
                "{}: Invalid response structure: no `studies` array",
                api.name()
            )));
        };
        let next_page_token = obj
            .get("nextPageToken")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string);
        // The backend's `count` is the size of this page, not a match total.
        let total_count = obj
            .get("totalCount")
            .and_then(Value::as_u64)
            .and_then(|n| usize::try_from(n).ok());

        Ok(Self {
            studies,
            next_page_token,
            total_count,
        })
    }
}

#[derive(Clone)]
pub struct StudyClient {
    client: ClientWithMiddleware,
    base: Cow<'static, str>,
    api: StudyApi,
}

impl StudyClient {
    /// Client for `api` at its configured base URL (see `TRIALSCOPE_*_BASE`).
    pub fn new(api: StudyApi, options: ClientOptions) -> Result<Self, TrialScopeError> {
        Ok(Self {
            client: build_client(api, options)?,
            base: api.base_from_env(),
            api,
        })
    }

    pub fn with_base(
        api: StudyApi,
        base: impl Into<String>,
        options: ClientOptions,
    ) -> Result<Self, TrialScopeError> {
        Ok(Self {
            client: build_client(api, options)?,
            base: Cow::Owned(base.into()),
            api,
        })
    }

    pub fn api(&self) -> StudyApi {
        self.api
    }

    pub fn base(&self) -> &str {
        self.base.as_ref()
    }

    fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base.as_ref().trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    /// Performs one GET and decodes the JSON body. Never retries on its own.
    pub async fn get_json(&self, path: &str, params: &QueryParams) -> Result<Value, FetchError> {
        let api = self.api.name();
        let url = self.endpoint(path);
        debug!(source = api, url = %url, params = %params, "GET");

        let req = apply_cache_mode(self.client.get(&url).query(&params.pairs()));
        let resp = req
            .send()
            .await
            .map_err(|err| FetchError::from_middleware(api, &err))?;
        let status = resp.status();
        let content_type = resp.headers().get(CONTENT_TYPE).cloned();
        let bytes = read_limited_body(resp, api).await?;

        if !status.is_success() {
            let excerpt = body_excerpt(&bytes);
            let message = if excerpt.is_empty() {
                format!("{api}: {}", status.canonical_reason().unwrap_or("request failed"))
            } else {
                format!("{api}: {excerpt}")
            };
            return Err(FetchError::new(Some(status.as_u16()), message));
        }

        ensure_json_content_type(api, status.as_u16(), content_type.as_ref(), &bytes)?;
        serde_json::from_slice(&bytes).map_err(|err| {
            FetchError::new(
                Some(status.as_u16()),
                format!("{api} returned invalid JSON: {err}"),
            )
        })
    }

    pub async fn fetch_page(&self, params: &QueryParams) -> Result<StudyPage, FetchError> {
        let body = self.get_json(self.api.search_path(), params).await?;
        let page = StudyPage::from_body(self.api, body)?;
        debug!(
            source = self.api.name(),
            studies = page.studies.len(),
            has_next = page.next_page_token.is_some(),
            "page received"
        );
        Ok(page)
    }

    /// Fetches one raw study by NCT id. Only ClinicalTrials.gov exposes a single-study route.
    pub async fn get_study(&self, nct_id: &str) -> Result<Value, TrialScopeError> {
        let nct_id = nct_id.trim();
        if nct_id.is_empty() || !nct_id.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(TrialScopeError::InvalidArgument(format!(
                "'{nct_id}' is not a valid study id (expected e.g. NCT04280705)"
            )));
        }
        if self.api == StudyApi::Backend {
            return Err(TrialScopeError::InvalidArgument(
                "The backend source has no single-study endpoint. Use --source ctgov".into(),
            ));
        }

        let params = QueryParams::new().scalar("format", "json");
        match self.get_json(&format!("studies/{nct_id}"), &params).await {
            Ok(value) => Ok(value),
            Err(err) if err.status == Some(404) => Err(TrialScopeError::NotFound {
                entity: "trial".into(),
                id: nct_id.to_string(),
                suggestion: "Try searching: trialscope search -q <keyword>".into(),
            }),
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait]
impl StudySource for StudyClient {
    fn page_token_param(&self) -> &'static str {
        self.api.page_token_param()
    }

    async fn fetch_page(&self, params: &QueryParams) -> Result<StudyPage, FetchError> {
        StudyClient::fetch_page(self, params).await
    }
}
