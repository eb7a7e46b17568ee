use serde::Serialize;
use tracing::warn;

use crate::entities::loader::TrialLoader;
use crate::error::{FetchError, TrialScopeError};
use crate::sources::clinicaltrials::{StudyApi, StudyClient};
use crate::sources::params::QueryParams;

pub const STATUS_UNKNOWN: &str = "UNKNOWN";
pub const DEFAULT_PAGE_SIZE: usize = 10;
pub const MAX_PAGE_SIZE: usize = 1000;
const PAGE_SIZE_ENV: &str = "TRIALSCOPE_PAGE_SIZE";

/// ClinicalTrials.gov field paths needed to project a [`Trial`].
pub const DEFAULT_CTGOV_FIELDS: [&str; 6] = [
    "protocolSection.identificationModule.nctId",
    "protocolSection.identificationModule.briefTitle",
    "protocolSection.statusModule.overallStatus",
    "protocolSection.statusModule.lastUpdatePostDateStruct",
    "protocolSection.conditionsModule.conditions",
    "hasResults",
];

/// Flat summary of one study.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Trial {
    pub id: String,
    pub title: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    pub has_results: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_update_date: Option<String>,
}

impl Default for Trial {
    fn default() -> Self {
        Self {
            id: String::new(),
            title: String::new(),
            status: STATUS_UNKNOWN.to_string(),
            condition: None,
            has_results: false,
            last_update_date: None,
        }
    }
}

/// Circle filter; `radius` carries a unit, e.g. `50mi`.
#[derive(Debug, Clone, PartialEq)]
pub struct GeoFilter {
    pub latitude: f64,
    pub longitude: f64,
    pub radius: String,
}

impl GeoFilter {
    fn validate(&self) -> Result<(), TrialScopeError> {
        if !(-90.0..=90.0).contains(&self.latitude) {
            return Err(TrialScopeError::InvalidArgument(
                "--lat must be between -90 and 90".into(),
            ));
        }
        if !(-180.0..=180.0).contains(&self.longitude) {
            return Err(TrialScopeError::InvalidArgument(
                "--lng must be between -180 and 180".into(),
            ));
        }
        if self.radius().is_empty() {
            return Err(TrialScopeError::InvalidArgument(
                "--radius must not be empty (e.g. 50mi)".into(),
            ));
        }
        Ok(())
    }

    /// Bare numbers are read as miles.
    fn radius(&self) -> String {
        let radius = self.radius.trim();
        if !radius.is_empty() && radius.parse::<f64>().is_ok() {
            format!("{radius}mi")
        } else {
            radius.to_string()
        }
    }

    fn distance(&self) -> String {
        format!(
            "distance({},{},{})",
            self.latitude,
            self.longitude,
            self.radius()
        )
    }
}

#[derive(Debug, Clone)]
pub struct TrialSearch {
    pub condition: Option<String>,
    pub term: Option<String>,
    pub statuses: Vec<String>,
    pub location: Option<GeoFilter>,
    pub updated_since: Option<String>,
    pub only_with_results: bool,
    pub fields: Vec<String>,
    pub sort: Vec<String>,
    pub page_size: usize,
    /// Resume from a continuation token printed by an earlier search.
    pub page_token: Option<String>,
}

impl Default for TrialSearch {
    fn default() -> Self {
        Self {
            condition: None,
            term: None,
            statuses: Vec::new(),
            location: None,
            updated_since: None,
            only_with_results: false,
            fields: Vec::new(),
            sort: Vec::new(),
            page_size: default_page_size(),
            page_token: None,
        }
    }
}

/// Page size from `TRIALSCOPE_PAGE_SIZE`, falling back to [`DEFAULT_PAGE_SIZE`].
pub fn default_page_size() -> usize {
    let Ok(raw) = std::env::var(PAGE_SIZE_ENV) else {
        return DEFAULT_PAGE_SIZE;
    };
    match raw.trim().parse::<usize>() {
        Ok(size) if (1..=MAX_PAGE_SIZE).contains(&size) => size,
        _ => {
            warn!(
                env = PAGE_SIZE_ENV,
                value = raw.as_str(),
                "ignoring invalid page size"
            );
            DEFAULT_PAGE_SIZE
        }
    }
}

fn clean_opt(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn clean_list(values: &[String]) -> Vec<String> {
    values
        .iter()
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect()
}

impl TrialSearch {
    /// Builds the query parameters for `api`, validating the search first.
    pub fn to_params(&self, api: StudyApi) -> Result<QueryParams, TrialScopeError> {
        if self.page_size == 0 || self.page_size > MAX_PAGE_SIZE {
            return Err(TrialScopeError::InvalidArgument(format!(
                "--page-size must be between 1 and {MAX_PAGE_SIZE}"
            )));
        }
        if let Some(geo) = &self.location {
            geo.validate()?;
        }
        let since = self
            .updated_since
            .as_deref()
            .map(|v| crate::utils::date::normalize_date(v, "--updated-since"))
            .transpose()?;
        let advanced =
            since.map(|date| format!("AREA[LastUpdatePostDate]RANGE[{date},MAX]"));
        let statuses = clean_list(&self.statuses)
            .into_iter()
            .map(|s| s.to_ascii_uppercase())
            .collect::<Vec<_>>();
        let condition = clean_opt(self.condition.as_deref());
        let term = clean_opt(self.term.as_deref());

        let params = match api {
            StudyApi::Ctgov => {
                let fields = if self.fields.is_empty() {
                    DEFAULT_CTGOV_FIELDS.iter().map(|f| f.to_string()).collect()
                } else {
                    clean_list(&self.fields)
                };
                let mut params = QueryParams::new()
                    .scalar("format", "json")
                    .scalar("pageSize", self.page_size)
                    .scalar("countTotal", true)
                    .opt_scalar("query.cond", condition)
                    .opt_scalar("query.term", term)
                    .opt_scalar(
                        "filter.overallStatus",
                        (!statuses.is_empty()).then(|| statuses.join(",")),
                    )
                    .opt_scalar("filter.advanced", advanced)
                    .opt_scalar(
                        "aggFilters",
                        self.only_with_results.then_some("results:with"),
                    )
                    .list("fields", fields);
                if let Some(geo) = &self.location {
                    params = params.object(
                        "location",
                        QueryParams::new()
                            .scalar("latitude", geo.latitude)
                            .scalar("longitude", geo.longitude)
                            .scalar("radius", geo.radius()),
                    );
                }
                let sort = clean_list(&self.sort);
                if !sort.is_empty() {
                    params = params.list("sort", sort);
                }
                params
            }
            StudyApi::Backend => {
                let mut params = QueryParams::new()
                    .scalar("page_size", self.page_size)
                    .opt_scalar("condition", condition)
                    .opt_scalar("search_term", term)
                    .opt_scalar("location_str", self.location.as_ref().map(GeoFilter::distance))
                    .opt_scalar("advanced_filter", advanced);
                if !statuses.is_empty() {
                    params = params.list("overall_status", statuses);
                }
                if self.only_with_results {
                    params = params.scalar("only_with_results", true);
                }
                params
            }
        };
        Ok(params.opt_scalar(api.page_token_param(), clean_opt(self.page_token.as_deref())))
    }
}

/// What a multi-page search produced.
///
/// A failure after the first page does not discard what was already loaded: the
/// loader keeps those trials and `error` carries the failure.
pub struct SearchRun<S> {
    pub loader: TrialLoader<S>,
    pub pages: usize,
    pub error: Option<FetchError>,
}

/// Runs `search` against `client`, reading at most `max_pages` pages.
///
/// Fails only when nothing could be loaded; later page failures are reported in
/// [`SearchRun::error`].
pub async fn search(
    client: StudyClient,
    search: &TrialSearch,
    max_pages: usize,
) -> Result<SearchRun<StudyClient>, TrialScopeError> {
    let params = search.to_params(client.api())?;
    let loader = TrialLoader::new(client);
    match loader.load_pages(params, max_pages).await {
        Ok(pages) => Ok(SearchRun {
            loader,
            pages,
            error: None,
        }),
        Err(err) => {
            let pages = loader.snapshot().await.pages_loaded;
            if pages == 0 {
                return Err(err.into());
            }
            warn!(pages, error = %err, "search stopped early; keeping loaded pages");
            Ok(SearchRun {
                loader,
                pages,
                error: Some(err),
            })
        }
    }
}

pub async fn get(client: &StudyClient, nct_id: &str) -> Result<Trial, TrialScopeError> {
    let raw = client.get_study(nct_id).await?;
    Ok(crate::transform::trial::from_raw_study(&raw))
}
