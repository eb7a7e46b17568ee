//! Command-line surface: argument parsing and dispatch to the trial workflows.

use clap::{Args, Parser, Subcommand};
use serde::Serialize;

use crate::entities::trial::{self, GeoFilter, TrialSearch};
use crate::render::json::to_pretty;
use crate::render::markdown;
use crate::transform::aggregate::AggregateView;
use crate::sources::ClientOptions;
use crate::sources::clinicaltrials::{StudyApi, StudyClient};

pub mod health;

const DEFAULT_RADIUS: &str = "50mi";

#[derive(Parser, Debug)]
#[command(
    name = "trialscope",
    version,
    about = "Search ClinicalTrials.gov and summarize the results"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Print JSON instead of Markdown
    #[arg(long, global = true)]
    pub json: bool,

    /// Bypass the HTTP cache for this invocation
    #[arg(long, global = true)]
    pub no_cache: bool,

    /// Retry transient upstream failures up to N times
    #[arg(long, global = true, default_value_t = 0)]
    pub retries: u32,

    /// Which study API to query
    #[arg(long, global = true, value_enum, default_value_t = StudyApi::Ctgov)]
    pub source: StudyApi,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List trials matching a search
    Search {
        #[command(flatten)]
        args: SearchArgs,
        /// Number of pages to load
        #[arg(long, default_value_t = 1)]
        pages: usize,
    },
    /// Load several pages and chart status, condition and update-date breakdowns
    Dashboard {
        #[command(flatten)]
        args: SearchArgs,
        #[arg(long, default_value_t = 5)]
        pages: usize,
    },
    /// Show one study by NCT ID
    Get { nct_id: String },
    /// Check API connectivity and the cache directory
    Health {
        /// Skip the cache directory check
        #[arg(long)]
        apis_only: bool,
    },
}

#[derive(Args, Debug, Clone, Default)]
pub struct SearchArgs {
    #[arg(short = 'c', long)]
    pub condition: Option<String>,

    /// Free-text search term
    #[arg(short = 'q', long)]
    pub term: Option<String>,

    /// Overall status filter, e.g. RECRUITING (repeatable)
    #[arg(short = 's', long = "status")]
    pub statuses: Vec<String>,

    #[arg(long, allow_hyphen_values = true, requires = "lng")]
    pub lat: Option<f64>,

    #[arg(long, allow_hyphen_values = true, requires = "lat")]
    pub lng: Option<f64>,

    /// Search radius around --lat/--lng, e.g. 50mi or 25km
    #[arg(long, requires = "lat")]
    pub radius: Option<String>,

    /// Only trials updated on or after this date (YYYY, YYYY-MM, or YYYY-MM-DD)
    #[arg(long)]
    pub updated_since: Option<String>,

    /// Only trials with posted results
    #[arg(long)]
    pub with_results: bool,

    /// Upstream field to return (repeatable)
    #[arg(long = "field")]
    pub fields: Vec<String>,

    /// Sort key, e.g. LastUpdatePostDate:desc (repeatable)
    #[arg(long)]
    pub sort: Vec<String>,

    #[arg(long)]
    pub page_size: Option<usize>,

    /// Continue from the token printed by a previous search
    #[arg(long)]
    pub page_token: Option<String>,
}

impl SearchArgs {
    pub fn to_search(&self) -> TrialSearch {
        let location = match (self.lat, self.lng) {
            (Some(latitude), Some(longitude)) => Some(GeoFilter {
                latitude,
                longitude,
                radius: self
                    .radius
                    .clone()
                    .unwrap_or_else(|| DEFAULT_RADIUS.to_string()),
            }),
            _ => None,
        };
        let defaults = TrialSearch::default();
        TrialSearch {
            condition: self.condition.clone(),
            term: self.term.clone(),
            statuses: self.statuses.clone(),
            location,
            updated_since: self.updated_since.clone(),
            only_with_results: self.with_results,
            fields: self.fields.clone(),
            sort: self.sort.clone(),
            page_size: self.page_size.unwrap_or(defaults.page_size),
            page_token: self.page_token.clone(),
        }
    }

    /// Short human summary of the filters, used as a heading.
    pub fn summary(&self) -> String {
        let mut parts = Vec::new();
        if let Some(c) = self.condition.as_deref().map(str::trim).filter(|c| !c.is_empty()) {
            parts.push(format!("condition={c}"));
        }
        if let Some(t) = self.term.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
            parts.push(format!("term={t}"));
        }
        if !self.statuses.is_empty() {
            parts.push(format!("status={}", self.statuses.join(",")));
        }
        if let (Some(lat), Some(lng)) = (self.lat, self.lng) {
            let radius = self.radius.as_deref().unwrap_or(DEFAULT_RADIUS);
            parts.push(format!("near={lat},{lng} ({radius})"));
        }
        if let Some(since) = &self.updated_since {
            parts.push(format!("updated_since={since}"));
        }
        if self.with_results {
            parts.push("with_results".to_string());
        }
        parts.join(", ")
    }
}

#[derive(Serialize)]
struct DashboardReport<'a> {
    pages: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(flatten)]
    view: &'a AggregateView,
}

fn client_options(retries: u32) -> ClientOptions {
    ClientOptions {
        retries,
        ..ClientOptions::default()
    }
}

async fn dispatch(
    command: Commands,
    json: bool,
    options: ClientOptions,
    source: StudyApi,
) -> anyhow::Result<String> {
    match command {
        Commands::Search { args, pages } => {
            let client = StudyClient::new(source, options)?;
            let run = trial::search(client, &args.to_search(), pages).await?;
            let snapshot = run.loader.snapshot().await;
            if json {
                return Ok(to_pretty(&snapshot)?);
            }
            Ok(markdown::trial_search_markdown(&args.summary(), &snapshot)?)
        }
        Commands::Dashboard { args, pages } => {
            let client = StudyClient::new(source, options)?;
            let run = trial::search(client, &args.to_search(), pages).await?;
            let view = run.loader.aggregate().await;
            let error = run.error.map(|err| err.to_string());
            if json {
                return Ok(to_pretty(&DashboardReport {
                    pages: run.pages,
                    error,
                    view: &view,
                })?);
            }
            Ok(markdown::dashboard_markdown(
                &args.summary(),
                &view,
                run.pages,
                error.as_deref(),
            )?)
        }
        Commands::Get { nct_id } => {
            let client = StudyClient::new(source, options)?;
            let study = trial::get(&client, &nct_id).await?;
            if json {
                return Ok(to_pretty(&study)?);
            }
            Ok(markdown::trial_markdown(&study)?)
        }
        Commands::Health { apis_only } => {
            let report = health::check(apis_only).await?;
            if json {
                return Ok(to_pretty(&report)?);
            }
            Ok(markdown::health_markdown(&report)?)
        }
    }
}

/// Executes a parsed command and returns the text to print.
///
/// # Errors
///
/// Returns an error for invalid arguments, upstream failures, and rendering failures.
pub async fn run(cli: Cli) -> anyhow::Result<String> {
    let options = client_options(cli.retries);
    crate::sources::with_no_cache(
        cli.no_cache,
        dispatch(cli.command, cli.json, options, cli.source),
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).expect("valid args")
    }

    #[test]
    fn search_flags_map_onto_trial_search() {
        let cli = parse(&[
            "trialscope",
            "search",
            "-c",
            "asthma",
            "-s",
            "RECRUITING",
            "-s",
            "COMPLETED",
            "--lat",
            "40.7",
            "--lng",
            "-74.0",
            "--with-results",
            "--page-size",
            "25",
            "--pages",
            "3",
        ]);
        let Commands::Search { args, pages } = cli.command else {
            panic!("expected search");
        };
        assert_eq!(pages, 3);
        let search = args.to_search();
        assert_eq!(search.condition.as_deref(), Some("asthma"));
        assert_eq!(search.statuses, vec!["RECRUITING", "COMPLETED"]);
        assert!(search.only_with_results);
        assert_eq!(search.page_size, 25);
        let geo = search.location.expect("location");
        assert_eq!(geo.longitude, -74.0);
        assert_eq!(geo.radius, DEFAULT_RADIUS);
    }

    #[test]
    fn global_flags_work_after_subcommand() {
        let cli = parse(&[
            "trialscope",
            "dashboard",
            "-q",
            "vaccine",
            "--json",
            "--no-cache",
            "--retries",
            "2",
            "--source",
            "backend",
        ]);
        assert!(cli.json);
        assert!(cli.no_cache);
        assert_eq!(cli.retries, 2);
        assert_eq!(cli.source, StudyApi::Backend);
        let Commands::Dashboard { pages, .. } = cli.command else {
            panic!("expected dashboard");
        };
        assert_eq!(pages, 5);
    }

    #[test]
    fn defaults_to_ctgov_without_retries() {
        let cli = parse(&["trialscope", "get", "NCT04280705"]);
        assert_eq!(cli.source, StudyApi::Ctgov);
        assert_eq!(cli.retries, 0);
        assert!(!cli.json);
    }

    #[test]
    fn lat_without_lng_is_rejected() {
        assert!(Cli::try_parse_from(["trialscope", "search", "--lat", "40.7"]).is_err());
        assert!(Cli::try_parse_from(["trialscope", "search", "--radius", "5mi"]).is_err());
    }

    #[test]
    fn dashboard_json_reports_pages_applied_and_error() {
        let view = AggregateView::default();
        let report = DashboardReport {
            pages: 2,
            error: Some("HTTP 503: busy".into()),
            view: &view,
        };
        let json = to_pretty(&report).expect("json");
        assert!(json.contains("\"pages\": 2"));
        assert!(json.contains("\"error\": \"HTTP 503: busy\""));
        assert!(json.contains("\"total\": 0"));
    }

    #[test]
    fn summary_lists_active_filters() {
        let args = SearchArgs {
            condition: Some("asthma".into()),
            statuses: vec!["RECRUITING".into()],
            with_results: true,
            ..SearchArgs::default()
        };
        assert_eq!(args.summary(), "condition=asthma, status=RECRUITING, with_results");
        assert_eq!(SearchArgs::default().summary(), "");
    }
}
