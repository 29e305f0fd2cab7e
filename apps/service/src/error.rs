use thiserror::Error;
use uuid::Uuid;

/// Rejection of a target definition at registration or update time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Target URL cannot be empty")]
    EmptyUrl,
    #[error("URL must include scheme (http:// or https://)")]
    MissingScheme,
    #[error("Invalid scheme '{0}'. Must be http or https")]
    UnsupportedScheme(String),
    #[error("URL must have a valid host")]
    MissingHost,
    #[error("Invalid URL: {0}")]
    MalformedUrl(String),
    #[error("Name cannot be empty")]
    EmptyName,
    #[error("Name too long (max {max} characters)")]
    NameTooLong { max: usize },
    #[error("Interval too long: {0} seconds (max 24 hours)")]
    IntervalTooLong(u64),
    #[error("This URL is already being monitored by target {existing}")]
    DuplicateUrl { existing: Uuid },
    #[error("One-time targets cannot be scheduled")]
    OneTimeNotSchedulable,
    #[error("Target {0} is inactive")]
    Inactive(Uuid),
    #[error("Target {0} is already scheduled")]
    AlreadyScheduled(Uuid),
}
