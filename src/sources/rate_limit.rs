//! Request pacing per study API.
//!
//! Each `StudyApi` owns a schedule of send slots. A request reserves the next
//! free slot under the lock and then sleeps until it, so concurrent callers
//! queue in reservation order without re-checking.

use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;

use http::Extensions;
use reqwest_middleware::{Middleware, Next};
use tokio::sync::Mutex;
use tokio::time::{Instant, sleep_until};
use tracing::trace;

use super::clinicaltrials::StudyApi;

const CTGOV_SPACING: Duration = Duration::from_millis(250);
const BACKEND_SPACING: Duration = Duration::from_millis(50);

#[derive(Debug)]
pub(crate) struct Pacer {
    ctgov_spacing: Duration,
    backend_spacing: Duration,
    next_slot: Mutex<HashMap<StudyApi, Instant>>,
}

impl Pacer {
    pub(crate) fn new(ctgov_spacing: Duration, backend_spacing: Duration) -> Self {
        Self {
            ctgov_spacing,
            backend_spacing,
            next_slot: Mutex::new(HashMap::new()),
        }
    }

    fn spacing(&self, api: StudyApi) -> Duration {
        match api {
            StudyApi::Ctgov => self.ctgov_spacing,
            StudyApi::Backend => self.backend_spacing,
        }
    }

    /// Claims the next send slot for `api` and returns when it arrives.
    pub(crate) async fn reserve(&self, api: StudyApi) {
        let now = Instant::now();
        let slot = {
            let mut schedule = self.next_slot.lock().await;
            let slot = schedule.get(&api).copied().map_or(now, |free| free.max(now));
            schedule.insert(api, slot + self.spacing(api));
            slot
        };
        if slot > now {
            trace!(api = api.name(), wait_ms = (slot - now).as_millis(), "pacing request");
            sleep_until(slot).await;
        }
    }
}

static PACER: OnceLock<Pacer> = OnceLock::new();

fn shared_pacer() -> &'static Pacer {
    PACER.get_or_init(|| Pacer::new(CTGOV_SPACING, BACKEND_SPACING))
}

/// Holds every request of one client to its API's schedule in the process-wide pacer.
#[derive(Clone, Copy, Debug)]
pub(crate) struct PacingMiddleware {
    api: StudyApi,
    pacer: &'static Pacer,
}

impl PacingMiddleware {
    pub(crate) fn new(api: StudyApi) -> Self {
        Self {
            api,
            pacer: shared_pacer(),
        }
    }
}

#[async_trait::async_trait]
impl Middleware for PacingMiddleware {
    async fn handle(
        &self,
        req: reqwest::Request,
        extensions: &mut Extensions,
        next: Next<'_>,
    ) -> reqwest_middleware::Result<reqwest::Response> {
        self.pacer.reserve(self.api).await;
        next.run(req, extensions).await
    }
}
