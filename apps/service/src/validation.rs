use tracing::warn;
use url::Url;

use crate::error::ValidationError;

const MAX_NAME_LEN: usize = 100;
const MAX_INTERVAL_SECONDS: u64 = 86_400;

/// Validate an HTTP/HTTPS probe target and return the parsed URL.
pub fn validate_target_url(target: &str) -> Result<Url, ValidationError> {
    let trimmed = target.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::EmptyUrl);
    }

    match Url::parse(trimmed) {
        Ok(url) => {
            let scheme = url.scheme();
            if scheme != "http" && scheme != "https" {
                return Err(ValidationError::UnsupportedScheme(scheme.to_string()));
            }

            if url.host_str().is_none_or(str::is_empty) {
                return Err(ValidationError::MissingHost);
            }

            Ok(url)
        }
        Err(e) => {
            // Bare hostnames parse as relative URLs, which is the common mistake.
            if !trimmed.contains("://") {
                Err(ValidationError::MissingScheme)
            } else {
                Err(ValidationError::MalformedUrl(e.to_string()))
            }
        }
    }
}

/// Validate a display name
pub fn validate_target_name(name: &str) -> Result<(), ValidationError> {
    let trimmed = name.trim();

    if trimmed.is_empty() {
        return Err(ValidationError::EmptyName);
    }

    if trimmed.chars().count() > MAX_NAME_LEN {
        return Err(ValidationError::NameTooLong { max: MAX_NAME_LEN });
    }

    Ok(())
}

/// Apply the interval floor.
///
/// Intervals below `floor_seconds` are raised to the floor (the only value we
/// coerce); intervals above 24 hours are rejected.
pub fn clamp_interval(interval_seconds: u64, floor_seconds: u64) -> Result<u64, ValidationError> {
    if interval_seconds > MAX_INTERVAL_SECONDS {
        return Err(ValidationError::IntervalTooLong(interval_seconds));
    }

    if interval_seconds < floor_seconds {
        warn!(
            requested = interval_seconds,
            floor = floor_seconds,
            "Check interval below minimum, clamping"
        );
        return Ok(floor_seconds);
    }

    Ok(interval_seconds)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_url_validation() {
        assert!(validate_target_url("http://example.com").is_ok());
        assert!(validate_target_url("https://example.com").is_ok());
        assert!(validate_target_url("http://192.168.1.1").is_ok());
        assert!(validate_target_url("http://example.com:8080/path").is_ok());
        assert!(validate_target_url("  https://example.com  ").is_ok());

        assert_eq!(validate_target_url(""), Err(ValidationError::EmptyUrl));
        assert_eq!(validate_target_url("example.com"), Err(ValidationError::MissingScheme));
        assert_eq!(
            validate_target_url("ftp://example.com"),
            Err(ValidationError::UnsupportedScheme("ftp".into()))
        );
        assert!(matches!(validate_target_url("http://[::1"), Err(ValidationError::MalformedUrl(_))));
    }

    #[test]
    fn test_name_validation() {
        assert!(validate_target_name("My Site").is_ok());
        assert_eq!(validate_target_name("   "), Err(ValidationError::EmptyName));
        assert!(validate_target_name(&"x".repeat(101)).is_err());
    }

    #[test]
    fn test_interval_clamping() {
        assert_eq!(clamp_interval(5, 10), Ok(10));
        assert_eq!(clamp_interval(0, 10), Ok(10));
        assert_eq!(clamp_interval(10, 10), Ok(10));
        assert_eq!(clamp_interval(60, 10), Ok(60));
        assert_eq!(clamp_interval(100_000, 10), Err(ValidationError::IntervalTooLong(100_000)));
    }
}
