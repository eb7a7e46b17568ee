/// Failure at the HTTP boundary of a study source.
///
/// Carries the upstream status code when one was received. The loader stores this
/// value verbatim as its error state, so it is cheap to clone.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("{}", render_fetch_error(*status, message))]
pub struct FetchError {
    pub status: Option<u16>,
    pub message: String,
}

fn render_fetch_error(status: Option<u16>, message: &str) -> String {
    match status {
        Some(code) => format!("HTTP {code}: {message}"),
        None => message.to_string(),
    }
}

impl FetchError {
    pub fn new(status: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(None, message)
    }

    pub(crate) fn from_reqwest(api: &str, err: &reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            "request timed out"
        } else if err.is_connect() {
            "connection failed"
        } else {
            "request failed"
        };
        Self::new(
            err.status().map(|s| s.as_u16()),
            format!("{api} {kind}: {err}"),
        )
    }

    pub(crate) fn from_middleware(api: &str, err: &reqwest_middleware::Error) -> Self {
        match err {
            reqwest_middleware::Error::Reqwest(inner) => Self::from_reqwest(api, inner),
            reqwest_middleware::Error::Middleware(inner) => {
                Self::transport(format!("{api} middleware error: {inner}"))
            }
        }
    }
}

#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum TrialScopeError {
    #[error("HTTP client initialization failed: {0}")]
    HttpClientInit(reqwest::Error),

    #[error("Fetch failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("{entity} '{id}' not found.\n\n{suggestion}")]
    NotFound {
        entity: String,
        id: String,
        suggestion: String,
    },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Template error: {0}")]
    Template(#[from] minijinja::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
