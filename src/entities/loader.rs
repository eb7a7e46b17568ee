//! Paginated, deduplicating trial accumulator.
//!
//! [`LoaderState`] is the state machine with pure transitions; [`TrialLoader`]
//! drives it against a [`StudySource`] and never holds its lock across a fetch.

use std::collections::HashSet;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::entities::trial::Trial;
use crate::error::FetchError;
use crate::sources::clinicaltrials::StudyPage;
use crate::sources::params::QueryParams;
use crate::transform::aggregate::{AggregateView, aggregate};

/// A paginated upstream that returns one page of raw studies per call.
#[async_trait]
pub trait StudySource: Send + Sync {
    /// Query parameter that carries the continuation token.
    fn page_token_param(&self) -> &'static str {
        "pageToken"
    }

    async fn fetch_page(&self, params: &QueryParams) -> Result<StudyPage, FetchError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadPhase {
    #[default]
    Idle,
    Loading,
    HasMore,
    Exhausted,
    Failed,
}

/// Proof that a fetch was started; results are applied only if it is still current.
#[derive(Debug, Clone)]
pub struct PageTicket {
    generation: u64,
    pub params: QueryParams,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    Applied { added: usize },
    /// Nothing to fetch: no token, or a load is already in flight.
    Skipped,
    /// A newer `load`/`reset` invalidated this request; its result was discarded.
    Superseded,
}

#[derive(Debug, Default)]
pub struct LoaderState {
    trials: Vec<Trial>,
    seen: HashSet<String>,
    phase: LoadPhase,
    error: Option<FetchError>,
    next_page_token: Option<String>,
    total_count: Option<usize>,
    pages_loaded: usize,
    params: QueryParams,
    generation: u64,
}

impl LoaderState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trials(&self) -> &[Trial] {
        &self.trials
    }

    pub fn phase(&self) -> LoadPhase {
        self.phase
    }

    pub fn is_loading(&self) -> bool {
        self.phase == LoadPhase::Loading
    }

    pub fn error(&self) -> Option<&FetchError> {
        self.error.as_ref()
    }

    pub fn next_page_token(&self) -> Option<&str> {
        self.next_page_token.as_deref()
    }

    /// Starts a fresh search. Any in-flight request becomes stale.
    pub fn begin_load(&mut self, params: QueryParams) -> PageTicket {
        if self.is_loading() {
            warn!(
                generation = self.generation,
                "load requested while a load is in flight; superseding it"
            );
        }
        self.clear();
        self.params = params.clone();
        self.phase = LoadPhase::Loading;
        PageTicket {
            generation: self.generation,
            params,
        }
    }

    /// Starts fetching the next page, or returns `None` when there is nothing to do.
    pub fn begin_next(&mut self, token_param: &str) -> Option<PageTicket> {
        if self.is_loading() {
            debug!("load_next ignored: a load is in flight");
            return None;
        }
        let token = self.next_page_token.clone()?;
        let params = self
            .params
            .merge_over(&QueryParams::new().scalar(token_param, token));
        self.error = None;
        self.phase = LoadPhase::Loading;
        Some(PageTicket {
            generation: self.generation,
            params,
        })
    }

    /// Applies a finished fetch. Stale tickets change nothing.
    pub fn finish(
        &mut self,
        ticket: &PageTicket,
        result: Result<StudyPage, FetchError>,
    ) -> Result<LoadOutcome, FetchError> {
        if ticket.generation != self.generation {
            debug!(
                ticket = ticket.generation,
                current = self.generation,
                "discarding superseded page"
            );
            return Ok(LoadOutcome::Superseded);
        }

        match result {
            Ok(page) => {
                let fresh = self.project_unseen(&page);
                let added = fresh.len();
                self.pages_loaded += 1;
                for trial in fresh {
                    self.seen.insert(trial.id.clone());
                    self.trials.push(trial);
                }
                self.next_page_token = page.next_page_token;
                if page.total_count.is_some() {
                    self.total_count = page.total_count;
                }
                self.phase = if self.next_page_token.is_some() {
                    LoadPhase::HasMore
                } else {
                    LoadPhase::Exhausted
                };
                debug!(
                    generation = self.generation,
                    added,
                    total = self.trials.len(),
                    "page applied"
                );
                Ok(LoadOutcome::Applied { added })
            }
            Err(err) => {
                warn!(generation = self.generation, error = %err, "page load failed");
                self.phase = LoadPhase::Failed;
                self.error = Some(err.clone());
                Err(err)
            }
        }
    }

    /// Projects a page and keeps the first occurrence of each id not already accumulated.
    fn project_unseen(&self, page: &StudyPage) -> Vec<Trial> {
        let mut page_ids: HashSet<String> = HashSet::new();
        page.studies
            .iter()
            .map(crate::transform::trial::from_raw_study)
            .filter(|trial| !self.seen.contains(&trial.id) && page_ids.insert(trial.id.clone()))
            .collect()
    }

    /// Returns to `Idle` with nothing accumulated. Always legal.
    pub fn reset(&mut self) {
        self.clear();
        self.params = QueryParams::new();
        self.phase = LoadPhase::Idle;
    }

    fn clear(&mut self) {
        self.generation = self.generation.wrapping_add(1);
        self.trials.clear();
        self.seen.clear();
        self.error = None;
        self.next_page_token = None;
        self.total_count = None;
        self.pages_loaded = 0;
    }

    pub fn snapshot(&self) -> LoaderSnapshot {
        LoaderSnapshot {
            trials: self.trials.clone(),
            loading: self.is_loading(),
            error: self.error.as_ref().map(ToString::to_string),
            next_page_token: self.next_page_token.clone(),
            total_count: self.total_count,
            pages_loaded: self.pages_loaded,
        }
    }
}

/// What a presentation layer reads from the loader.
#[derive(Debug, Clone, Serialize)]
pub struct LoaderSnapshot {
    pub trials: Vec<Trial>,
    pub loading: bool,
    pub error: Option<String>,
    pub next_page_token: Option<String>,
    /// Upstream match count, when the source reports one.
    pub total_count: Option<usize>,
    /// Pages applied since the last `load`/`reset`.
    pub pages_loaded: usize,
}

pub struct TrialLoader<S> {
    source: S,
    state: Mutex<LoaderState>,
}

impl<S: StudySource> TrialLoader<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            state: Mutex::new(LoaderState::new()),
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Clears the accumulator and fetches the first page for `params`.
    ///
    /// Calling this while another load is in flight supersedes it; the older
    /// result is discarded when it arrives.
    pub async fn load(&self, params: QueryParams) -> Result<LoadOutcome, FetchError> {
        let ticket = self.state.lock().await.begin_load(params);
        self.run(ticket).await
    }

    /// Fetches the page after the stored token. No-op without a token or while loading.
    pub async fn load_next(&self) -> Result<LoadOutcome, FetchError> {
        let token_param = self.source.page_token_param();
        let Some(ticket) = self.state.lock().await.begin_next(token_param) else {
            return Ok(LoadOutcome::Skipped);
        };
        self.run(ticket).await
    }

    /// Loads the first page, then follows tokens until exhausted or `max_pages` pages were read.
    pub async fn load_pages(
        &self,
        params: QueryParams,
        max_pages: usize,
    ) -> Result<usize, FetchError> {
        if max_pages == 0 {
            self.reset().await;
            return Ok(0);
        }
        let mut pages = 0;
        if let LoadOutcome::Applied { .. } = self.load(params).await? {
            pages += 1;
        }
        while pages < max_pages {
            match self.load_next().await? {
                LoadOutcome::Applied { .. } => pages += 1,
                LoadOutcome::Skipped | LoadOutcome::Superseded => break,
            }
        }
        Ok(pages)
    }

    pub async fn reset(&self) {
        self.state.lock().await.reset();
    }

    pub async fn snapshot(&self) -> LoaderSnapshot {
        self.state.lock().await.snapshot()
    }

    pub async fn phase(&self) -> LoadPhase {
        self.state.lock().await.phase()
    }

    /// Aggregates over the trials accumulated so far.
    pub async fn aggregate(&self) -> AggregateView {
        aggregate(self.state.lock().await.trials())
    }

    async fn run(&self, ticket: PageTicket) -> Result<LoadOutcome, FetchError> {
        let result = self.source.fetch_page(&ticket.params).await;
        self.state.lock().await.finish(&ticket, result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use serde_json::{Value, json};

    use crate::sources::params::ParamValue;

    fn study(id: &str, status: &str, condition: &str) -> Value {
        json!({
            "protocolSection": {
                "identificationModule": {"nctId": id, "briefTitle": format!("Trial {id}")},
                "statusModule": {"overallStatus": status},
                "conditionsModule": {"conditions": [condition]}
            },
            "hasResults": false
        })
    }

    fn page(ids: &[&str], next: Option<&str>) -> StudyPage {
        StudyPage {
            studies: ids.iter().map(|id| study(id, "RECRUITING", "Asthma")).collect(),
            next_page_token: next.map(str::to_string),
            total_count: None,
        }
    }

    /// Serves pages keyed by `pageToken` (absent = first page) and counts calls.
    #[derive(Default)]
    struct FakeSource {
        pages: HashMap<Option<String>, Result<StudyPage, FetchError>>,
        calls: AtomicUsize,
        seen_params: std::sync::Mutex<Vec<QueryParams>>,
    }

    impl FakeSource {
        fn with_page(mut self, token: Option<&str>, page: StudyPage) -> Self {
            self.pages.insert(token.map(str::to_string), Ok(page));
            self
        }

        fn with_error(mut self, token: Option<&str>, err: FetchError) -> Self {
            self.pages.insert(token.map(str::to_string), Err(err));
            self
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl StudySource for FakeSource {
        async fn fetch_page(&self, params: &QueryParams) -> Result<StudyPage, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen_params.lock().unwrap().push(params.clone());
            let token = match params.get("pageToken") {
                Some(ParamValue::Scalar(t)) => Some(t.clone()),
                _ => None,
            };
            self.pages
                .get(&token)
                .cloned()
                .unwrap_or_else(|| Err(FetchError::new(Some(404), "no such page")))
        }
    }

    fn ids(snapshot: &LoaderSnapshot) -> Vec<&str> {
        snapshot.trials.iter().map(|t| t.id.as_str()).collect()
    }

    #[tokio::test]
    async fn twenty_five_studies_with_one_overlap_yield_twenty_four_trials() {
        let first: Vec<String> = (1..=20).map(|i| format!("NCT{i:08}")).collect();
        // page 2 repeats NCT00000020 and adds five new ids
        let second: Vec<String> = (20..=25).map(|i| format!("NCT{i:08}")).collect();
        let first_refs: Vec<&str> = first.iter().map(String::as_str).collect();
        let second_refs: Vec<&str> = second.iter().map(String::as_str).collect();

        let loader = TrialLoader::new(
            FakeSource::default()
                .with_page(None, page(&first_refs, Some("p2")))
                .with_page(Some("p2"), page(&second_refs, None)),
        );

        loader.load(QueryParams::new().scalar("pageSize", 20)).await.unwrap();
        assert_eq!(loader.phase().await, LoadPhase::HasMore);
        let outcome = loader.load_next().await.unwrap();
        assert_eq!(outcome, LoadOutcome::Applied { added: 5 });

        let snapshot = loader.snapshot().await;
        assert_eq!(snapshot.trials.len(), 24);
        assert_eq!(loader.phase().await, LoadPhase::Exhausted);
        assert!(snapshot.next_page_token.is_none());

        let expected: Vec<String> = (1..=24).map(|i| format!("NCT{i:08}")).collect();
        assert_eq!(ids(&snapshot), expected.iter().map(String::as_str).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn duplicates_within_a_page_keep_first_occurrence() {
        let mut first = page(&["A", "B"], None);
        first.studies.push(study("A", "COMPLETED", "Flu"));
        let loader = TrialLoader::new(FakeSource::default().with_page(None, first));

        let outcome = loader.load(QueryParams::new()).await.unwrap();
        assert_eq!(outcome, LoadOutcome::Applied { added: 2 });
        let snapshot = loader.snapshot().await;
        assert_eq!(ids(&snapshot), vec!["A", "B"]);
        assert_eq!(snapshot.trials[0].status, "RECRUITING");
    }

    #[tokio::test]
    async fn load_next_without_token_makes_no_call() {
        let source = FakeSource::default().with_page(None, page(&["A"], None));
        let loader = TrialLoader::new(source);

        assert_eq!(loader.load_next().await.unwrap(), LoadOutcome::Skipped);
        assert_eq!(loader.source().calls(), 0);
        assert_eq!(loader.phase().await, LoadPhase::Idle);

        loader.load(QueryParams::new()).await.unwrap();
        let before = loader.snapshot().await;
        assert_eq!(loader.load_next().await.unwrap(), LoadOutcome::Skipped);
        assert_eq!(loader.source().calls(), 1);
        let after = loader.snapshot().await;
        assert_eq!(ids(&before), ids(&after));
        assert_eq!(loader.phase().await, LoadPhase::Exhausted);
    }

    #[tokio::test]
    async fn load_next_merges_token_over_search_params() {
        let loader = TrialLoader::new(
            FakeSource::default()
                .with_page(None, page(&["A"], Some("tok")))
                .with_page(Some("tok"), page(&["B"], None)),
        );
        loader
            .load(QueryParams::new().scalar("query.cond", "asthma").scalar("pageSize", 1))
            .await
            .unwrap();
        loader.load_next().await.unwrap();

        let seen = loader.source().seen_params.lock().unwrap().clone();
        assert_eq!(seen[1].to_string(), "query.cond=asthma&pageSize=1&pageToken=tok");
    }

    #[tokio::test]
    async fn failed_page_keeps_previous_trials_and_surfaces_error() {
        let loader = TrialLoader::new(
            FakeSource::default()
                .with_page(None, page(&["A", "B"], Some("p2")))
                .with_error(Some("p2"), FetchError::new(Some(503), "ctgov: unavailable")),
        );
        loader.load(QueryParams::new()).await.unwrap();
        let err = loader.load_next().await.unwrap_err();
        assert_eq!(err.status, Some(503));

        let snapshot = loader.snapshot().await;
        assert_eq!(ids(&snapshot), vec!["A", "B"]);
        assert_eq!(snapshot.error.as_deref(), Some("HTTP 503: ctgov: unavailable"));
        assert!(!snapshot.loading);
        assert_eq!(loader.phase().await, LoadPhase::Failed);
        // the token survives so the caller can retry
        assert_eq!(snapshot.next_page_token.as_deref(), Some("p2"));
        assert_eq!(snapshot.pages_loaded, 1);
    }

    #[tokio::test]
    async fn new_load_clears_accumulated_trials() {
        let loader = TrialLoader::new(
            FakeSource::default()
                .with_page(None, page(&["A"], Some("p2")))
                .with_page(Some("p2"), page(&["B"], None)),
        );
        loader.load_pages(QueryParams::new(), 5).await.unwrap();
        assert_eq!(loader.snapshot().await.trials.len(), 2);

        loader.load(QueryParams::new()).await.unwrap();
        let snapshot = loader.snapshot().await;
        assert_eq!(ids(&snapshot), vec!["A"]);
        assert_eq!(snapshot.pages_loaded, 1);
    }

    #[tokio::test]
    async fn load_pages_stops_at_max_pages() {
        let loader = TrialLoader::new(
            FakeSource::default()
                .with_page(None, page(&["A"], Some("p2")))
                .with_page(Some("p2"), page(&["B"], Some("p3")))
                .with_page(Some("p3"), page(&["C"], None)),
        );
        let pages = loader.load_pages(QueryParams::new(), 2).await.unwrap();
        assert_eq!(pages, 2);
        let snapshot = loader.snapshot().await;
        assert_eq!(ids(&snapshot), vec!["A", "B"]);
        assert_eq!(snapshot.next_page_token.as_deref(), Some("p3"));
    }

    #[test]
    fn reset_is_idempotent() {
        let mut state = LoaderState::new();
        let ticket = state.begin_load(QueryParams::new());
        state.finish(&ticket, Ok(page(&["A"], Some("t")))).unwrap();

        state.reset();
        let once = (state.phase(), state.trials().len(), state.next_page_token().is_none());
        state.reset();
        let twice = (state.phase(), state.trials().len(), state.next_page_token().is_none());
        assert_eq!(once, (LoadPhase::Idle, 0, true));
        assert_eq!(once, twice);
        assert!(state.error().is_none());
    }

    #[test]
    fn result_arriving_after_reset_is_discarded() {
        let mut state = LoaderState::new();
        let ticket = state.begin_load(QueryParams::new());
        state.reset();

        let outcome = state.finish(&ticket, Ok(page(&["A"], Some("t")))).unwrap();
        assert_eq!(outcome, LoadOutcome::Superseded);
        assert!(state.trials().is_empty());
        assert_eq!(state.phase(), LoadPhase::Idle);

        // a stale failure is discarded too
        let ticket = state.begin_load(QueryParams::new());
        let _newer = state.begin_load(QueryParams::new());
        let outcome = state.finish(&ticket, Err(FetchError::transport("late")));
        assert_eq!(outcome, Ok(LoadOutcome::Superseded));
        assert!(state.error().is_none());
        assert!(state.is_loading());
    }

    #[test]
    fn begin_next_is_refused_while_loading() {
        let mut state = LoaderState::new();
        let ticket = state.begin_load(QueryParams::new());
        state.finish(&ticket, Ok(page(&["A"], Some("t")))).unwrap();

        assert!(state.begin_next("pageToken").is_some());
        assert!(state.begin_next("pageToken").is_none());
    }

    /// Answers after 150 ms when `query.cond` is `slow`, immediately otherwise.
    struct SlowSource {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl StudySource for SlowSource {
        async fn fetch_page(&self, params: &QueryParams) -> Result<StudyPage, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let (delay, id) = match params.get("query.cond") {
                Some(ParamValue::Scalar(c)) if c == "slow" => (150, "SLOW"),
                _ => (0, "FAST"),
            };
            tokio::time::sleep(Duration::from_millis(delay)).await;
            Ok(page(&[id], None))
        }
    }

    #[tokio::test]
    async fn newer_load_supersedes_in_flight_request() {
        let loader = Arc::new(TrialLoader::new(SlowSource {
            calls: AtomicUsize::new(0),
        }));

        let slow = {
            let loader = loader.clone();
            tokio::spawn(async move {
                loader
                    .load(QueryParams::new().scalar("query.cond", "slow"))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        let fast = loader
            .load(QueryParams::new().scalar("query.cond", "fast"))
            .await
            .unwrap();
        assert_eq!(fast, LoadOutcome::Applied { added: 1 });

        let slow = slow.await.unwrap().unwrap();
        assert_eq!(slow, LoadOutcome::Superseded);
        assert_eq!(ids(&loader.snapshot().await), vec!["FAST"]);
        assert_eq!(loader.source().calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn aggregate_reflects_accumulated_trials() {
        let loader = TrialLoader::new(
            FakeSource::default().with_page(None, page(&["A", "B", "C"], None)),
        );
        assert_eq!(loader.aggregate().await.total, 0);
        loader.load(QueryParams::new()).await.unwrap();
        let view = loader.aggregate().await;
        assert_eq!(view.total, 3);
        assert_eq!(view.status_counts[0].label, "RECRUITING");
        assert_eq!(view.status_counts[0].count, 3);
    }
}
