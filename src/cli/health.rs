//! `trialscope health`: fetches a one-study page from each API through the
//! regular client path and checks that the cache directory is writable.

use std::path::Path;
use std::time::Instant;

use serde::Serialize;

use crate::entities::trial::TrialSearch;
use crate::error::TrialScopeError;
use crate::sources::ClientOptions;
use crate::sources::clinicaltrials::{StudyApi, StudyClient};

const MARKER_FILE: &str = ".health";

#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub target: String,
    pub healthy: bool,
    pub detail: String,
}

impl HealthCheck {
    fn pass(target: String, detail: String) -> Self {
        Self {
            target,
            healthy: true,
            detail,
        }
    }

    fn fail(target: String, detail: String) -> Self {
        Self {
            target,
            healthy: false,
            detail,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub checks: Vec<HealthCheck>,
}

impl HealthReport {
    pub fn healthy_count(&self) -> usize {
        self.checks.iter().filter(|c| c.healthy).count()
    }

    pub fn all_healthy(&self) -> bool {
        self.healthy_count() == self.checks.len()
    }
}

/// A study API is healthy when it serves a decodable search page.
async fn check_api(client: &StudyClient) -> HealthCheck {
    let api = client.api();
    let target = format!("{} ({})", api.name(), client.base());
    let search = TrialSearch {
        page_size: 1,
        ..TrialSearch::default()
    };
    let params = match search.to_params(api) {
        Ok(params) => params,
        Err(err) => return HealthCheck::fail(target, err.to_string()),
    };

    let start = Instant::now();
    match client.fetch_page(&params).await {
        Ok(page) => HealthCheck::pass(
            target,
            format!(
                "{} ms, {} study record(s)",
                start.elapsed().as_millis(),
                page.studies.len()
            ),
        ),
        Err(err) => HealthCheck::fail(target, err.to_string()),
    }
}

async fn check_cache_dir(dir: &Path) -> HealthCheck {
    let target = format!("cache ({})", dir.display());
    let marker = dir.join(MARKER_FILE);
    let written = async {
        tokio::fs::create_dir_all(dir).await?;
        tokio::fs::write(&marker, env!("CARGO_PKG_VERSION")).await
    }
    .await;
    match written {
        Ok(()) => HealthCheck::pass(target, "writable".into()),
        Err(err) => HealthCheck::fail(target, err.to_string()),
    }
}

async fn run_checks(
    ctgov: &StudyClient,
    backend: &StudyClient,
    cache: Option<&Path>,
) -> HealthReport {
    let (ctgov, backend) = tokio::join!(check_api(ctgov), check_api(backend));
    let mut checks = vec![ctgov, backend];
    if let Some(dir) = cache {
        checks.push(check_cache_dir(dir).await);
    }
    HealthReport { checks }
}

/// Checks both study APIs at their configured bases and, unless `apis_only`,
/// the cache directory. Responses are never served from the cache.
///
/// # Errors
///
/// Returns an error only when the HTTP clients cannot be built.
pub async fn check(apis_only: bool) -> Result<HealthReport, TrialScopeError> {
    let options = ClientOptions {
        cache: false,
        ..ClientOptions::default()
    };
    let ctgov = StudyClient::new(StudyApi::Ctgov, options)?;
    let backend = StudyClient::new(StudyApi::Backend, options)?;
    let cache = (!apis_only).then(crate::sources::cache_dir);
    Ok(run_checks(&ctgov, &backend, cache.as_deref()).await)
}
