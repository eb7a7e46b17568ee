use std::sync::OnceLock;

use minijinja::{Environment, context};

use crate::cli::health::HealthReport;
use crate::entities::loader::LoaderSnapshot;
use crate::entities::trial::Trial;
use crate::error::TrialScopeError;
use crate::transform::aggregate::AggregateView;

static ENV: OnceLock<Environment<'static>> = OnceLock::new();

const BAR_WIDTH: usize = 20;

pub fn pagination_footer(
    returned: usize,
    total: Option<usize>,
    next_page_token: Option<&str>,
) -> String {
    let token = next_page_token
        .map(str::trim)
        .filter(|value| !value.is_empty());
    let shown = match total {
        Some(total) => format!("Showing {returned} of {total} results."),
        None if token.is_some() => format!("Showing {returned} results (total unknown)."),
        None => format!("Showing {returned} results."),
    };
    match token {
        Some(token) if returned > 0 => {
            format!("{shown} Use --page-token {} for more.", quote_arg(token))
        }
        _ => shown,
    }
}

fn with_pagination_footer(mut body: String, pagination_footer: &str) -> String {
    let footer = pagination_footer.trim();
    if footer.is_empty() || body.contains(footer) {
        return body;
    }
    if !body.ends_with('\n') {
        body.push('\n');
    }
    body.push('\n');
    body.push_str(footer);
    body.push('\n');
    body
}

fn append_evidence_urls(mut body: String, urls: Vec<(&str, String)>) -> String {
    let links = urls
        .into_iter()
        .filter(|(label, url)| !label.trim().is_empty() && !url.trim().is_empty())
        .map(|(label, url)| format!("[{}]({})", label.trim(), url.trim()))
        .collect::<Vec<_>>();
    if links.is_empty() {
        return body;
    }
    if !body.ends_with('\n') {
        body.push('\n');
    }
    body.push('\n');
    body.push_str(&links.join(" | "));
    body.push('\n');
    body
}

fn trial_evidence_urls(trial: &Trial) -> Vec<(&'static str, String)> {
    let id = trial.id.trim();
    if id.is_empty() {
        return Vec::new();
    }
    vec![(
        "ClinicalTrials.gov",
        format!("https://clinicaltrials.gov/study/{id}"),
    )]
}

fn quote_arg(value: &str) -> String {
    let v = value.trim();
    if v.is_empty() {
        return String::new();
    }
    if v.chars().any(|c| c.is_whitespace()) {
        return format!("\"{}\"", v.replace('\"', "\\\""));
    }
    v.to_string()
}

/// `ACTIVE_NOT_RECRUITING` → `Active not recruiting`.
fn status_label(status: &str) -> String {
    let lower = status.trim().replace('_', " ").to_ascii_lowercase();
    let mut chars = lower.chars();
    match chars.next() {
        Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
        None => "-".to_string(),
    }
}

fn bar(count: usize, max: usize) -> String {
    if count == 0 || max == 0 {
        return String::new();
    }
    let len = (count * BAR_WIDTH).div_ceil(max).clamp(1, BAR_WIDTH);
    "█".repeat(len)
}

fn env() -> Result<&'static Environment<'static>, TrialScopeError> {
    if let Some(env) = ENV.get() {
        return Ok(env);
    }

    let mut env = Environment::new();
    env.add_filter("truncate", |s: String, max_bytes: usize| -> String {
        if s.len() <= max_bytes {
            return s;
        }
        if max_bytes == 0 {
            return "…".to_string();
        }
        let mut boundary = max_bytes;
        while boundary > 0 && !s.is_char_boundary(boundary) {
            boundary -= 1;
        }
        let mut out = s[..boundary].trim_end().to_string();
        out.push('…');
        out
    });
    env.add_filter("cell", |s: String| -> String {
        s.replace('|', "\\|").replace('\n', " ")
    });
    env.add_filter("status_label", |s: String| -> String { status_label(&s) });
    env.add_filter("bar", bar);
    env.add_template("trial.md.j2", include_str!("../../templates/trial.md.j2"))?;
    env.add_template(
        "trial_search.md.j2",
        include_str!("../../templates/trial_search.md.j2"),
    )?;
    env.add_template(
        "dashboard.md.j2",
        include_str!("../../templates/dashboard.md.j2"),
    )?;
    env.add_template("health.md.j2", include_str!("../../templates/health.md.j2"))?;

    Ok(ENV.get_or_init(|| env))
}

pub fn trial_markdown(trial: &Trial) -> Result<String, TrialScopeError> {
    let tmpl = env()?.get_template("trial.md.j2")?;
    let body = tmpl.render(context! {
        id => &trial.id,
        title => &trial.title,
        status => &trial.status,
        condition => &trial.condition,
        has_results => trial.has_results,
        last_update_date => &trial.last_update_date,
    })?;
    Ok(append_evidence_urls(body, trial_evidence_urls(trial)))
}

pub fn trial_search_markdown(
    query: &str,
    snapshot: &LoaderSnapshot,
) -> Result<String, TrialScopeError> {
    let footer = pagination_footer(
        snapshot.trials.len(),
        snapshot.total_count,
        snapshot.next_page_token.as_deref(),
    );
    let tmpl = env()?.get_template("trial_search.md.j2")?;
    let body = tmpl.render(context! {
        query => query,
        count => snapshot.trials.len(),
        results => &snapshot.trials,
        error => &snapshot.error,
    })?;
    Ok(with_pagination_footer(body, &footer))
}

/// `pages` is the number of pages actually applied; `error` is set when a
/// later page failed and the view covers only what loaded before it.
pub fn dashboard_markdown(
    query: &str,
    view: &AggregateView,
    pages: usize,
    error: Option<&str>,
) -> Result<String, TrialScopeError> {
    let status_max = view.status_counts.iter().map(|e| e.count).max().unwrap_or(0);
    let condition_max = view.top_conditions.iter().map(|e| e.count).max().unwrap_or(0);
    let month_max = view.monthly_trend.values().copied().max().unwrap_or(0);
    let year_max = view.yearly_trend.values().copied().max().unwrap_or(0);
    let monthly = view.monthly_trend.iter().collect::<Vec<_>>();
    let yearly = view.yearly_trend.iter().collect::<Vec<_>>();

    let tmpl = env()?.get_template("dashboard.md.j2")?;
    Ok(tmpl.render(context! {
        query => query,
        pages => pages,
        error => error,
        total => view.total,
        with_results => view.with_results,
        status_counts => &view.status_counts,
        status_max => status_max,
        top_conditions => &view.top_conditions,
        condition_max => condition_max,
        monthly => monthly,
        month_max => month_max,
        yearly => yearly,
        year_max => year_max,
    })?)
}

pub fn health_markdown(report: &HealthReport) -> Result<String, TrialScopeError> {
    let tmpl = env()?.get_template("health.md.j2")?;
    Ok(tmpl.render(context! {
        checks => &report.checks,
        healthy => report.healthy_count(),
    })?)
}
