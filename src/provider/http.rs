//! Shared HTTP client, SSE parsing, and error-classification utilities for
//! adapter implementors.
//!
//! Concrete vendor clients live outside the crate; these helpers keep their
//! error mapping and stream plumbing canonical.

use std::sync::OnceLock;

use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use tokio_util::sync::CancellationToken;

use crate::error::{CanopyError, ProviderErrorKind, Result};

static SHARED_CLIENT: OnceLock<reqwest::Client> = OnceLock::new();

/// Get (or create) the shared reqwest client.
pub fn shared_client() -> &'static reqwest::Client {
    SHARED_CLIENT.get_or_init(|| {
        reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .pool_max_idle_per_host(10)
            .build()
            .expect("Failed to build HTTP client")
    })
}

/// Build default headers for a Bearer-token API.
pub fn bearer_headers(api_key: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    if let Ok(val) = HeaderValue::from_str(&format!("Bearer {api_key}")) {
        headers.insert(AUTHORIZATION, val);
    }
    headers
}

/// Build key-header style headers (`x-api-key`).
pub fn api_key_headers(api_key: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    if let Ok(val) = HeaderValue::from_str(api_key) {
        headers.insert("x-api-key", val);
    }
    headers
}

/// Parse an SSE "data:" line, returning None for "[DONE]".
pub fn parse_sse_data(line: &str) -> Option<&str> {
    let data = line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:"))?;
    let data = data.trim_start();
    if data == "[DONE]" {
        return None;
    }
    Some(data)
}

/// Map an HTTP status to a canonical provider error.
pub fn status_to_error(status: u16, body: &str) -> CanopyError {
    match status {
        401 | 403 => CanopyError::provider(ProviderErrorKind::Auth, body.to_string()),
        429 => CanopyError::rate_limited(body.to_string(), extract_retry_after(body)),
        400..=499 => CanopyError::provider(ProviderErrorKind::InvalidRequest, body.to_string()),
        500..=599 => CanopyError::provider(ProviderErrorKind::ServerError, body.to_string()),
        _ => CanopyError::provider(
            ProviderErrorKind::ServerError,
            format!("unexpected status {status}: {body}"),
        ),
    }
}

/// Map a transport failure to the canonical `network` kind, preserving the
/// original cause in the message.
pub fn transport_to_error(err: reqwest::Error) -> CanopyError {
    if let Some(status) = err.status() {
        return status_to_error(status.as_u16(), &err.to_string());
    }
    CanopyError::provider(ProviderErrorKind::Network, err.to_string())
}

/// Turn a streaming HTTP response into a stream of SSE `data:` payloads.
///
/// Splits the byte stream on newlines, skips comments and non-data fields,
/// and stops at `[DONE]`. Cancellation drops the underlying connection and
/// ends the stream; transport failures surface as canonical `network`
/// errors. Vendor adapters parse each yielded payload into canonical
/// [`super::StreamEvent`]s.
pub fn sse_data_stream(
    response: reqwest::Response,
    cancel: CancellationToken,
) -> BoxStream<'static, Result<String>> {
    let byte_stream = response.bytes_stream();
    Box::pin(async_stream::stream! {
        let mut buffer = String::new();
        futures::pin_mut!(byte_stream);

        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => break,
                chunk = byte_stream.next() => chunk,
            };
            let chunk = match chunk {
                Some(Ok(chunk)) => chunk,
                Some(Err(e)) => {
                    yield Err(transport_to_error(e));
                    break;
                }
                None => break,
            };

            buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(line_end) = buffer.find('\n') {
                let line = buffer[..line_end].trim().to_string();
                buffer = buffer[line_end + 1..].to_string();

                if line.is_empty() || line.starts_with(':') {
                    continue;
                }
                match parse_sse_data(&line) {
                    Some(data) => yield Ok(data.to_string()),
                    None if line.starts_with("data") => return, // [DONE]
                    None => continue,
                }
            }
        }
    })
}

fn extract_retry_after(body: &str) -> Option<u64> {
    // Try to parse retry-after from a JSON error body
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .and_then(|e| e.get("retry_after"))
                .and_then(|r| r.as_f64())
                .map(|s| (s * 1000.0) as u64)
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sse_data_lines_are_parsed() {
        assert_eq!(parse_sse_data("data: {\"a\":1}"), Some("{\"a\":1}"));
        assert_eq!(parse_sse_data("data:{\"a\":1}"), Some("{\"a\":1}"));
        assert_eq!(parse_sse_data("data: [DONE]"), None);
        assert_eq!(parse_sse_data("event: ping"), None);
    }

    #[test]
    fn statuses_map_to_canonical_kinds() {
        assert_eq!(
            status_to_error(401, "no").provider_kind(),
            Some(ProviderErrorKind::Auth)
        );
        assert_eq!(
            status_to_error(403, "no").provider_kind(),
            Some(ProviderErrorKind::Auth)
        );
        assert_eq!(
            status_to_error(429, "slow").provider_kind(),
            Some(ProviderErrorKind::RateLimit)
        );
        assert_eq!(
            status_to_error(400, "bad").provider_kind(),
            Some(ProviderErrorKind::InvalidRequest)
        );
        assert_eq!(
            status_to_error(503, "down").provider_kind(),
            Some(ProviderErrorKind::ServerError)
        );
    }

    #[test]
    fn retry_after_is_extracted_from_error_body() {
        let err = status_to_error(429, r#"{"error": {"retry_after": 1.5}}"#);
        match err {
            CanopyError::Provider { retry_after_ms, .. } => {
                assert_eq!(retry_after_ms, Some(1500));
            }
            other => panic!("expected provider error, got {other:?}"),
        }
    }
}
