//! Text-signature classification of external command failures.
//!
//! The `gh`-style CLI surfaces transport failures as opaque error strings, so
//! retry eligibility is decided purely from text patterns. Signatures are
//! checked in priority order: rate limits first (they carry their own delay),
//! then explicit non-recoverable statuses, then recoverable transport
//! failures. Anything unrecognized is treated as non-recoverable.

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;

/// Category assigned to a failed command invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    RateLimit,
    AuthError,
    NotFound,
    Validation,
    ServerError,
    Network,
    Timeout,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::AuthError => "auth_error",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Validation => "validation",
            ErrorKind::ServerError => "server_error",
            ErrorKind::Network => "network",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of classifying one error string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub recoverable: bool,
    pub kind: ErrorKind,
    /// Server-requested delay, parsed from rate-limit messages.
    pub retry_after: Option<Duration>,
}

static RATE_LIMIT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)rate.?limit|secondary limit|abuse detection|429").expect("valid regex")
});
static RETRY_AFTER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)retry.?after:?\s*(\d+)").expect("valid regex"));
static AUTH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b401\b|\b403\b|unauthorized|forbidden|bad credentials|authentication")
        .expect("valid regex")
});
static NOT_FOUND_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b404\b|not found|could not resolve").expect("valid regex"));
static VALIDATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b422\b|unprocessable|validation failed|invalid field").expect("valid regex")
});
static SERVER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b5\d\d\b|internal server error|bad gateway|service unavailable|server error")
        .expect("valid regex")
});
static TIMEOUT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)timed?.?out|deadline exceeded").expect("valid regex"));
static NETWORK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)connection (refused|reset|closed)|network|no such host|dns|could not connect|broken pipe")
        .expect("valid regex")
});

/// Classify an error string for retry eligibility.
pub fn classify(text: &str) -> Classification {
    if RATE_LIMIT_RE.is_match(text) {
        return Classification {
            recoverable: true,
            kind: ErrorKind::RateLimit,
            retry_after: parse_retry_after(text),
        };
    }
    if AUTH_RE.is_match(text) {
        return not_recoverable(ErrorKind::AuthError);
    }
    if NOT_FOUND_RE.is_match(text) {
        return not_recoverable(ErrorKind::NotFound);
    }
    if VALIDATION_RE.is_match(text) {
        return not_recoverable(ErrorKind::Validation);
    }
    if SERVER_RE.is_match(text) {
        return recoverable(ErrorKind::ServerError);
    }
    if TIMEOUT_RE.is_match(text) {
        return recoverable(ErrorKind::Timeout);
    }
    if NETWORK_RE.is_match(text) {
        return recoverable(ErrorKind::Network);
    }
    not_recoverable(ErrorKind::Unknown)
}

fn parse_retry_after(text: &str) -> Option<Duration> {
    let captures = RETRY_AFTER_RE.captures(text)?;
    let seconds: u64 = captures.get(1)?.as_str().parse().ok()?;
    Some(Duration::from_secs(seconds))
}

fn recoverable(kind: ErrorKind) -> Classification {
    Classification {
        recoverable: true,
        kind,
        retry_after: None,
    }
}

fn not_recoverable(kind: ErrorKind) -> Classification {
    Classification {
        recoverable: false,
        kind,
        retry_after: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_404_is_not_found_and_final() {
        let c = classify("HTTP 404 Not Found");
        assert!(!c.recoverable);
        assert_eq!(c.kind, ErrorKind::NotFound);
    }

    #[test]
    fn http_503_is_recoverable_server_error() {
        let c = classify("503 Service Unavailable");
        assert!(c.recoverable);
        assert_eq!(c.kind, ErrorKind::ServerError);
    }

    #[test]
    fn rate_limit_parses_retry_after_seconds() {
        let c = classify("rate limit exceeded, retry after: 5");
        assert!(c.recoverable);
        assert_eq!(c.kind, ErrorKind::RateLimit);
        assert_eq!(c.retry_after, Some(Duration::from_secs(5)));
    }

    /// Rate-limit signatures win even when the message also matches a
    /// non-recoverable pattern.
    #[test]
    fn rate_limit_takes_priority_over_forbidden() {
        let c = classify("403 Forbidden: API rate limit exceeded");
        assert_eq!(c.kind, ErrorKind::RateLimit);
        assert!(c.recoverable);
    }

    #[test]
    fn auth_errors_are_final() {
        for text in ["401 Unauthorized", "HTTP 403: bad credentials"] {
            let c = classify(text);
            assert!(!c.recoverable, "{text}");
            assert_eq!(c.kind, ErrorKind::AuthError, "{text}");
        }
    }

    #[test]
    fn validation_422_is_final() {
        let c = classify("HTTP 422: Validation Failed");
        assert!(!c.recoverable);
        assert_eq!(c.kind, ErrorKind::Validation);
    }

    #[test]
    fn network_and_timeout_phrases_are_recoverable() {
        assert_eq!(classify("connection refused").kind, ErrorKind::Network);
        assert!(classify("connection refused").recoverable);
        assert_eq!(classify("request timed out").kind, ErrorKind::Timeout);
        assert!(classify("request timed out").recoverable);
    }

    #[test]
    fn unrecognized_text_defaults_to_unknown_final() {
        let c = classify("something exploded");
        assert!(!c.recoverable);
        assert_eq!(c.kind, ErrorKind::Unknown);
    }

    #[test]
    fn missing_retry_after_yields_none() {
        let c = classify("secondary limit hit");
        assert_eq!(c.kind, ErrorKind::RateLimit);
        assert_eq!(c.retry_after, None);
    }
}
