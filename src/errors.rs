use thiserror::Error;

/// Classified failure from any venue call. Every C1 operation resolves into
/// one of these variants; callers branch on the class, never on message text.
#[derive(Debug, Error)]
pub enum VenueError {
    #[error("transient venue error: {0}")]
    Transient(String),

    #[error("venue rate limit hit")]
    RateLimited,

    #[error("venue authentication failed: {0}")]
    Auth(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("fatal venue error: {0}")]
    Fatal(String),
}

impl VenueError {
    /// Map an HTTP status code onto the error taxonomy.
    pub fn from_status(status: reqwest::StatusCode, context: &str) -> Self {
        match status.as_u16() {
            401 | 403 => VenueError::Auth(context.to_string()),
            404 => VenueError::NotFound(context.to_string()),
            429 => VenueError::RateLimited,
            400 | 422 => VenueError::InvalidArgument(context.to_string()),
            s if s >= 500 => VenueError::Transient(format!("{context}: HTTP {s}")),
            s => VenueError::Fatal(format!("{context}: HTTP {s}")),
        }
    }

    /// Whether the executor's backoff loop may retry this failure.
    pub fn is_retryable(&self) -> bool {
        matches!(self, VenueError::Transient(_) | VenueError::RateLimited)
    }
}

impl From<reqwest::Error> for VenueError {
    fn from(e: reqwest::Error) -> Self {
        if let Some(status) = e.status() {
            return VenueError::from_status(status, &e.to_string());
        }
        if e.is_timeout() || e.is_connect() {
            return VenueError::Transient(e.to_string());
        }
        if e.is_decode() {
            return VenueError::Fatal(format!("response decode failed: {e}"));
        }
        VenueError::Transient(e.to_string())
    }
}

/// Fatal configuration problems, surfaced at startup with exit code 1.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config not found: {0}")]
    NotFound(String),

    #[error("config parse error: {0}")]
    Parse(String),

    #[error("missing environment variable {0}")]
    MissingEnv(String),

    #[error("{0}")]
    Invalid(String),
}

/// Ledger protocol violations. These indicate a bug in the engine, not a
/// runtime condition, so the orchestrator halts on them.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("commit for unknown reservation {0}")]
    UnknownReservation(uuid::Uuid),

    #[error("fill {0} already processed")]
    AlreadyProcessed(String),
}
