//! Blocking HTTP plumbing shared by the backends
//!
//! Every call carries the per-request timeout from [`HttpConfig`]; there is
//! no whole-operation deadline. Responses are classified once here so the
//! backends only deal with successful bodies and domain errors.

use std::time::Duration;

use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::config::HttpConfig;

use super::{Backend, RepositoryError, RepositoryResult};

/// Longest response body echoed into an error message.
const MAX_ERROR_BODY_CHARS: usize = 512;

/// Authenticated blocking client for one backend
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
}

impl HttpClient {
    pub fn new(config: &HttpConfig, token: &str, backend: Backend) -> RepositoryResult<Self> {
        let scheme = match backend {
            Backend::Zenodo => "Bearer",
            Backend::Figshare => "token",
        };
        let mut auth = HeaderValue::from_str(&format!("{} {}", scheme, token))
            .map_err(|_| RepositoryError::Authentication("token contains invalid characters".to_string()))?;
        auth.set_sensitive(true);

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, auth);

        let client = Client::builder()
            .default_headers(headers)
            .user_agent(config.user_agent.as_str())
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .connect_timeout(Duration::from_secs(config.connect_timeout_seconds))
            // The token header must never follow a redirect.
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| RepositoryError::Protocol(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    pub fn get(&self, url: &str) -> RepositoryResult<Response> {
        self.execute("GET", url, self.client.get(url))
    }

    pub fn get_json<T: DeserializeOwned>(&self, url: &str) -> RepositoryResult<T> {
        read_json(self.get(url)?)
    }

    pub fn post_json(&self, url: &str, body: &Value) -> RepositoryResult<Response> {
        self.execute("POST", url, self.client.post(url).json(body))
    }

    pub fn post_empty(&self, url: &str) -> RepositoryResult<Response> {
        self.execute("POST", url, self.client.post(url))
    }

    pub fn put_bytes(&self, url: &str, body: Vec<u8>) -> RepositoryResult<Response> {
        let request = self
            .client
            .put(url)
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(body);
        self.execute("PUT", url, request)
    }

    pub fn delete(&self, url: &str) -> RepositoryResult<Response> {
        self.execute("DELETE", url, self.client.delete(url))
    }

    /// Send without classifying the status; transport failures are still
    /// mapped. Used where non-2xx statuses carry protocol meaning.
    pub fn send_raw(&self, request: RequestBuilder) -> RepositoryResult<Response> {
        request.send().map_err(map_transport_error)
    }

    pub fn raw(&self) -> &Client {
        &self.client
    }

    fn execute(&self, method: &str, url: &str, request: RequestBuilder) -> RepositoryResult<Response> {
        debug!(method, url, "repository request");
        let response = request.send().map_err(map_transport_error)?;
        check_status(response)
    }
}

fn map_transport_error(e: reqwest::Error) -> RepositoryError {
    // Anything that never produced a response is worth retrying.
    RepositoryError::Transient(e.to_string())
}

/// Pass through successes; map every other status to an error.
pub fn check_status(response: Response) -> RepositoryResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().unwrap_or_default();
    Err(classify_status(status, &body))
}

/// Map an HTTP error status to a repository error.
pub fn classify_status(status: StatusCode, body: &str) -> RepositoryError {
    let message = truncate(body);
    match status.as_u16() {
        401 | 403 => RepositoryError::Authentication(format!("{}: {}", status, message)),
        404 | 410 => RepositoryError::RecordNotFound(message),
        408 | 429 => RepositoryError::Transient(format!("{}: {}", status, message)),
        s if s >= 500 => RepositoryError::Transient(format!("{}: {}", status, message)),
        s => RepositoryError::Rejected { status: s, message },
    }
}

pub fn read_json<T: DeserializeOwned>(response: Response) -> RepositoryResult<T> {
    let text = response.text().map_err(map_transport_error)?;
    serde_json::from_str(&text)
        .map_err(|e| RepositoryError::Protocol(format!("invalid JSON response: {}: {}", e, truncate(&text))))
}

fn truncate(body: &str) -> String {
    let body = body.trim();
    if body.chars().count() <= MAX_ERROR_BODY_CHARS {
        return body.to_string();
    }
    let cut: String = body.chars().take(MAX_ERROR_BODY_CHARS).collect();
    format!("{}...", cut)
}

/// String or number JSON id as a string.
pub fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_status() {
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, ""),
            RepositoryError::Authentication(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::FORBIDDEN, "no scope"),
            RepositoryError::Authentication(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::NOT_FOUND, ""),
            RepositoryError::RecordNotFound(_)
        ));
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, "").is_transient());
        assert!(classify_status(StatusCode::BAD_GATEWAY, "").is_transient());
        assert_eq!(
            classify_status(StatusCode::BAD_REQUEST, " bad "),
            RepositoryError::Rejected {
                status: 400,
                message: "bad".to_string()
            }
        );
    }

    #[test]
    fn test_truncate_long_body() {
        let body = "x".repeat(2000);
        let t = truncate(&body);
        assert!(t.ends_with("..."));
        assert_eq!(t.chars().count(), MAX_ERROR_BODY_CHARS + 3);
    }

    #[test]
    fn test_id_string() {
        assert_eq!(id_string(&serde_json::json!(123)), Some("123".to_string()));
        assert_eq!(id_string(&serde_json::json!("abc")), Some("abc".to_string()));
        assert_eq!(id_string(&serde_json::json!(null)), None);
    }

    #[test]
    fn test_invalid_token_header() {
        let err = HttpClient::new(&HttpConfig::default(), "bad\ntoken", Backend::Zenodo).unwrap_err();
        assert!(matches!(err, RepositoryError::Authentication(_)));
    }
}
