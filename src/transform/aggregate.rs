//! Chart-ready aggregates over an accumulated trial set.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;

use crate::entities::trial::Trial;

pub const NO_CONDITION_INFO: &str = "No Condition Info";
pub const TOP_CONDITIONS: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LabelCount {
    pub label: String,
    pub count: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AggregateView {
    pub total: usize,
    pub with_results: usize,
    /// Keys in first-seen order.
    pub status_counts: Vec<LabelCount>,
    /// At most [`TOP_CONDITIONS`] entries, count descending, ties in first-seen order.
    pub top_conditions: Vec<LabelCount>,
    /// `YYYY-MM` → count.
    pub monthly_trend: BTreeMap<String, usize>,
    /// `YYYY` → count.
    pub yearly_trend: BTreeMap<String, usize>,
}

/// Counter that remembers first-seen key order.
#[derive(Default)]
struct OrderedCounter {
    index: HashMap<String, usize>,
    entries: Vec<LabelCount>,
}

impl OrderedCounter {
    fn bump(&mut self, label: &str) {
        match self.index.get(label) {
            Some(&i) => self.entries[i].count += 1,
            None => {
                self.index.insert(label.to_string(), self.entries.len());
                self.entries.push(LabelCount {
                    label: label.to_string(),
                    count: 1,
                });
            }
        }
    }

    fn into_entries(self) -> Vec<LabelCount> {
        self.entries
    }
}

fn date_prefix(date: &str, len: usize) -> Option<&str> {
    let date = date.trim();
    date.get(..len).filter(|_| date.len() >= len)
}

/// Recomputes every aggregate from scratch. Never fails; empty input gives empty collections.
pub fn aggregate(trials: &[Trial]) -> AggregateView {
    let mut statuses = OrderedCounter::default();
    let mut conditions = OrderedCounter::default();
    let mut monthly_trend: BTreeMap<String, usize> = BTreeMap::new();
    let mut yearly_trend: BTreeMap<String, usize> = BTreeMap::new();
    let mut with_results = 0;

    for trial in trials {
        statuses.bump(&trial.status);

        let condition = trial
            .condition
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .unwrap_or(NO_CONDITION_INFO);
        conditions.bump(condition);

        if let Some(date) = trial.last_update_date.as_deref() {
            if let Some(month) = date_prefix(date, 7) {
                *monthly_trend.entry(month.to_string()).or_default() += 1;
            }
            if let Some(year) = date_prefix(date, 4) {
                *yearly_trend.entry(year.to_string()).or_default() += 1;
            }
        }

        if trial.has_results {
            with_results += 1;
        }
    }

    let mut top_conditions = conditions
        .into_entries()
        .into_iter()
        .filter(|entry| entry.label != NO_CONDITION_INFO)
        .collect::<Vec<_>>();
    // stable: equal counts keep first-seen order
    top_conditions.sort_by(|a, b| b.count.cmp(&a.count));
    top_conditions.truncate(TOP_CONDITIONS);

    AggregateView {
        total: trials.len(),
        with_results,
        status_counts: statuses.into_entries(),
        top_conditions,
        monthly_trend,
        yearly_trend,
    }
}
