//! Failure classification.
//!
//! Checked in order: validation keywords, timeouts, upstream
//! unavailability, contention. Anything unrecognised is non-retryable.

use crate::error::Error;
use crate::model::job::ErrorClass;

const VALIDATION: &[&str] = &["schema", "validation", "invalid", "must be"];
const TIMEOUT: &[&str] = &["etimedout", "timed out", "timeout", "abort"];
const UPSTREAM: &[&str] = &[
    "econnreset",
    "econnrefused",
    "enotfound",
    "connection refused",
    "connection reset",
];
/// Matched as whole words so "blocked" or "clock" stay permanent.
const CONTENTION: &[&str] = &["eacces", "ebusy", "eperm", "elocked", "lock", "locked", "busy"];

fn mentions(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

fn mentions_word(haystack: &str, words: &[&str]) -> bool {
    haystack
        .split(|c: char| !c.is_ascii_alphanumeric())
        .any(|token| words.contains(&token))
}

/// Classify a failure from its message, an optional OS-style code, and an
/// optional HTTP status.
pub fn classify_error(message: &str, code: Option<&str>, http_status: Option<u16>) -> ErrorClass {
    let message = message.to_lowercase();
    let code = code.map(str::to_lowercase).unwrap_or_default();
    let text = format!("{code} {message}");

    if mentions(&message, VALIDATION) {
        return ErrorClass::NonRetryable;
    }
    if mentions(&text, TIMEOUT) {
        return ErrorClass::Timeout;
    }
    if mentions(&text, UPSTREAM) || matches!(http_status, Some(502..=504)) {
        return ErrorClass::UpstreamUnavailable;
    }
    if mentions_word(&text, CONTENTION) || matches!(http_status, Some(429) | Some(500..=599)) {
        return ErrorClass::Retryable;
    }
    ErrorClass::NonRetryable
}

/// Errors that know how to classify themselves.
pub trait Classify {
    fn classify(&self) -> ErrorClass;
}

impl Classify for Error {
    fn classify(&self) -> ErrorClass {
        classify_error(&self.to_string(), self.code(), self.http_status())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_wins_over_everything() {
        assert_eq!(
            classify_error("schema validation failed after timeout", None, Some(503)),
            ErrorClass::NonRetryable
        );
    }

    #[test]
    fn lock_timeout_is_contention() {
        let err = Error::LockTimeout {
            path: "events/writer.lock".into(),
            attempts: 50,
        };
        assert_eq!(err.classify(), ErrorClass::Retryable);
    }

    #[test]
    fn contention_needs_a_whole_word() {
        for message in ["rule blocked: asset not approved", "clock skew detected", "unlock refused"] {
            assert_eq!(classify_error(message, None, None), ErrorClass::NonRetryable, "{message}");
        }
        assert_eq!(classify_error("file is locked", None, None), ErrorClass::Retryable);
        assert_eq!(classify_error("open failed", Some("EBUSY"), None), ErrorClass::Retryable);
    }

    #[test]
    fn backend_status_is_used() {
        let err = Error::Backend {
            status: Some(504),
            message: "gateway".into(),
        };
        assert_eq!(err.classify(), ErrorClass::UpstreamUnavailable);

        let err = Error::Backend {
            status: Some(500),
            message: "oops".into(),
        };
        assert_eq!(err.classify(), ErrorClass::Retryable);
    }
}
