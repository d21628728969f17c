//! HTTP status and transport error classification shared by the HTTP backends.

use std::time::Duration;

use pipeline::LlmError;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;

/// Longest server message carried into an [`LlmError`].
const MAX_ERROR_BODY: usize = 300;

/// Maps a non-success HTTP response to an [`LlmError`].
pub(crate) fn classify_status(status: StatusCode, headers: &HeaderMap, body: &str) -> LlmError {
    let message = truncate(body.trim(), MAX_ERROR_BODY);
    match status.as_u16() {
        401 | 403 => LlmError::Authentication(format!("status {}", status.as_u16())),
        408 => LlmError::Timeout {
            after: Duration::ZERO,
        },
        429 => LlmError::RateLimited {
            retry_after: retry_after(headers),
        },
        // 529 is Anthropic's "overloaded".
        code if code >= 500 => LlmError::Server {
            status: code,
            message,
        },
        code => LlmError::Rejected {
            status: code,
            message,
        },
    }
}

/// Maps a `reqwest` failure (no HTTP status available) to an [`LlmError`].
pub(crate) fn classify_transport(err: &reqwest::Error, timeout: Duration) -> LlmError {
    if err.is_timeout() {
        LlmError::Timeout { after: timeout }
    } else if err.is_decode() {
        LlmError::MalformedResponse(err.to_string())
    } else {
        LlmError::Transport(err.to_string())
    }
}

/// Parses `Retry-After` given in whole seconds.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(max_chars).collect();
    cut.push_str("...(truncated)");
    cut
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn rate_limit_reads_retry_after() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("12"));
        let err = classify_status(StatusCode::TOO_MANY_REQUESTS, &headers, "slow down");
        assert_eq!(
            err,
            LlmError::RateLimited {
                retry_after: Some(Duration::from_secs(12))
            }
        );
    }

    #[test]
    fn server_errors_are_classified_as_server() {
        let err = classify_status(
            StatusCode::from_u16(529).unwrap(),
            &HeaderMap::new(),
            "overloaded",
        );
        assert!(matches!(err, LlmError::Server { status: 529, .. }));
    }

    #[test]
    fn auth_errors_do_not_echo_the_body() {
        let err = classify_status(StatusCode::UNAUTHORIZED, &HeaderMap::new(), "key sk-123 bad");
        match err {
            LlmError::Authentication(msg) => assert!(!msg.contains("sk-123")),
            other => panic!("expected Authentication, got {other:?}"),
        }
    }

    #[test]
    fn other_client_errors_are_rejections() {
        let err = classify_status(StatusCode::BAD_REQUEST, &HeaderMap::new(), "bad field");
        assert!(matches!(err, LlmError::Rejected { status: 400, .. }));
    }

    #[test]
    fn long_bodies_are_truncated() {
        let body = "x".repeat(1000);
        match classify_status(StatusCode::BAD_GATEWAY, &HeaderMap::new(), &body) {
            LlmError::Server { message, .. } => assert!(message.ends_with("(truncated)")),
            other => panic!("expected Server, got {other:?}"),
        }
    }
}
