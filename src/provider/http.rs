//! HTTP plumbing shared by the four provider clients.
//!
//! Every client speaks JSON over one pooled connection set and maps
//! non-success responses through the gateway error taxonomy here, so the
//! clients themselves only build bodies and parse replies.

use std::sync::OnceLock;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE, RETRY_AFTER};
use serde_json::Value;

use crate::error::{Result, SibylError};

static SHARED_CLIENT: OnceLock<reqwest::Client> = OnceLock::new();

/// How a provider authenticates its requests.
#[derive(Clone, Copy)]
pub enum AuthScheme<'a> {
    /// `Authorization: Bearer <key>` (OpenAI, xAI).
    Bearer(&'a str),
    /// `x-api-key` plus a pinned `anthropic-version` (Anthropic).
    AnthropicKey { key: &'a str, version: &'a str },
    /// `x-goog-api-key` (Gemini).
    GoogleKey(&'a str),
}

/// POST a JSON body, returning the parsed JSON reply.
pub async fn post_json(url: &str, auth: AuthScheme<'_>, body: &Value) -> Result<Value> {
    let resp = client()
        .post(url)
        .headers(headers_for(auth))
        .json(body)
        .send()
        .await?;
    read_json(resp).await
}

/// GET a JSON resource (deferred-job polling).
pub async fn get_json(url: &str, auth: AuthScheme<'_>) -> Result<Value> {
    let resp = client().get(url).headers(headers_for(auth)).send().await?;
    read_json(resp).await
}

fn client() -> &'static reqwest::Client {
    SHARED_CLIENT.get_or_init(|| {
        // Hard upper bound only; per-call deadlines come from the engine
        // timeout table.
        reqwest::Client::builder()
            .timeout(Duration::from_secs(300))
            .pool_max_idle_per_host(10)
            .build()
            .expect("Failed to build HTTP client")
    })
}

fn headers_for(auth: AuthScheme<'_>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    match auth {
        AuthScheme::Bearer(key) => {
            if let Ok(val) = HeaderValue::from_str(&format!("Bearer {key}")) {
                headers.insert(AUTHORIZATION, val);
            }
        }
        AuthScheme::AnthropicKey { key, version } => {
            if let Ok(val) = HeaderValue::from_str(key) {
                headers.insert("x-api-key", val);
            }
            if let Ok(val) = HeaderValue::from_str(version) {
                headers.insert("anthropic-version", val);
            }
        }
        AuthScheme::GoogleKey(key) => {
            if let Ok(val) = HeaderValue::from_str(key) {
                headers.insert("x-goog-api-key", val);
            }
        }
    }
    headers
}

async fn read_json(resp: reqwest::Response) -> Result<Value> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp.json().await?);
    }
    let retry_after = resp
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<f64>().ok())
        .map(|secs| (secs * 1000.0) as u64);
    let body = resp.text().await.unwrap_or_default();
    Err(map_status(status.as_u16(), retry_after, &body))
}

/// Map a non-success status to the taxonomy. Auth failures are recognized
/// by status or by an "API key" signal in the body (some providers answer
/// key problems with a generic 4xx); 429 carries the server's retry hint,
/// preferring the Retry-After header over a body field.
pub(crate) fn map_status(status: u16, retry_after_header: Option<u64>, body: &str) -> SibylError {
    match status {
        401 | 403 => SibylError::Authentication(body.to_string()),
        429 => SibylError::RateLimited {
            retry_after_ms: retry_after_header.or_else(|| body_retry_after(body)),
        },
        _ if mentions_api_key(body) => SibylError::Authentication(body.to_string()),
        _ => SibylError::api(status, body),
    }
}

fn mentions_api_key(body: &str) -> bool {
    let lower = body.to_ascii_lowercase();
    lower.contains("api key") || lower.contains("api_key")
}

fn body_retry_after(body: &str) -> Option<u64> {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.pointer("/error/retry_after").and_then(Value::as_f64))
        .map(|secs| (secs * 1000.0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_statuses_map_to_authentication() {
        assert!(matches!(
            map_status(401, None, "bad key"),
            SibylError::Authentication(_)
        ));
        assert!(matches!(
            map_status(403, None, "forbidden"),
            SibylError::Authentication(_)
        ));
    }

    #[test]
    fn api_key_signal_in_body_maps_to_authentication() {
        let body = r#"{"error": {"message": "Incorrect API key provided"}}"#;
        assert!(matches!(
            map_status(400, None, body),
            SibylError::Authentication(_)
        ));
        assert!(matches!(
            map_status(400, None, "plain bad request"),
            SibylError::Api { status: 400, .. }
        ));
    }

    #[test]
    fn rate_limit_prefers_header_over_body() {
        let body = r#"{"error": {"retry_after": 3.5}}"#;
        match map_status(429, Some(1000), body) {
            SibylError::RateLimited { retry_after_ms } => assert_eq!(retry_after_ms, Some(1000)),
            other => panic!("unexpected: {other:?}"),
        }
        match map_status(429, None, body) {
            SibylError::RateLimited { retry_after_ms } => assert_eq!(retry_after_ms, Some(3500)),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn other_statuses_map_to_api_error() {
        match map_status(503, None, "overloaded") {
            SibylError::Api { status, message } => {
                assert_eq!(status, 503);
                assert_eq!(message, "overloaded");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn headers_carry_the_scheme() {
        let bearer = headers_for(AuthScheme::Bearer("k1"));
        assert_eq!(bearer.get(AUTHORIZATION).unwrap(), "Bearer k1");

        let anthropic = headers_for(AuthScheme::AnthropicKey {
            key: "k2",
            version: "2023-06-01",
        });
        assert_eq!(anthropic.get("x-api-key").unwrap(), "k2");
        assert_eq!(anthropic.get("anthropic-version").unwrap(), "2023-06-01");

        let google = headers_for(AuthScheme::GoogleKey("k3"));
        assert_eq!(google.get("x-goog-api-key").unwrap(), "k3");
        assert!(google.get(AUTHORIZATION).is_none());
    }
}
