//! Authenticated JSON round trips.
//!
//! One request per call, bearer token in the `Authorization` header, a fixed
//! timeout, no retries. Anything but a 2xx answer is an error carrying the
//! status and the remote's error text.

use async_trait::async_trait;
use cirrus_error::{CirrusError, ErrorCode, ErrorContext, Result};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use secrecy::{ExposeSecret, SecretString};
use std::time::{Duration, Instant};
use url::Url;

use super::response::first_error_message;

#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    /// POSTs a JSON body and returns the raw response text.
    async fn post(&self, url: &Url, token: &SecretString, body: &serde_json::Value)
        -> Result<String>;

    /// GETs a URL and returns the raw response text.
    async fn get(&self, url: &Url, token: &SecretString) -> Result<String>;
}

#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            // Pooled connections are bound to the runtime that opened them, and
            // planning-time calls run on short-lived runtimes.
            .pool_max_idle_per_host(0)
            .build()
            .map_err(CirrusError::from)?;
        Ok(Self { client })
    }

    fn headers(token: &SecretString) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        let mut auth = HeaderValue::from_str(&format!("Bearer {}", token.expose_secret()))
            .map_err(|_| {
                CirrusError::new(
                    ErrorCode::MissingCredential,
                    "API token contains characters not allowed in an HTTP header",
                )
            })?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }

    async fn send(&self, method: &str, request: reqwest::RequestBuilder, url: &Url) -> Result<String> {
        let started = Instant::now();
        let response = request.send().await.map_err(|e| {
            CirrusError::from(e).with_context(request_context(method, url, None))
        })?;
        let status = response.status();
        let body = response.text().await.map_err(|e| {
            CirrusError::from(e).with_context(request_context(method, url, Some(status.as_u16())))
        })?;

        tracing::debug!(
            target: "remote",
            method,
            path = url.path(),
            status = status.as_u16(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Remote round trip"
        );

        if !status.is_success() {
            let detail = first_error_message(&body).unwrap_or_else(|| body.clone());
            return Err(CirrusError::new(
                ErrorCode::HttpStatus,
                format!("HTTP {}: {}", status.as_u16(), detail),
            )
            .with_context(request_context(method, url, Some(status.as_u16()))));
        }
        Ok(body)
    }
}

fn request_context(method: &str, url: &Url, status: Option<u16>) -> ErrorContext {
    ErrorContext::Request {
        method: method.to_string(),
        url: url.to_string(),
        status,
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn post(
        &self,
        url: &Url,
        token: &SecretString,
        body: &serde_json::Value,
    ) -> Result<String> {
        let request = self
            .client
            .post(url.clone())
            .headers(Self::headers(token)?)
            .json(body);
        self.send("POST", request, url).await
    }

    async fn get(&self, url: &Url, token: &SecretString) -> Result<String> {
        let request = self.client.get(url.clone()).headers(Self::headers(token)?);
        self.send("GET", request, url).await
    }
}

/// Appends path segments to a base URL, percent-encoding each one.
pub(crate) fn endpoint(base: &Url, segments: &[&str]) -> Result<Url> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| {
            CirrusError::new(
                ErrorCode::InvalidConfig,
                format!("API base '{}' cannot carry a path", base),
            )
        })?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

pub(crate) fn parse_base(base: &str) -> Result<Url> {
    Url::parse(base).map_err(|e| {
        CirrusError::new(
            ErrorCode::InvalidConfig,
            format!("Invalid API base '{}': {}", base, e),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn token() -> SecretString {
        SecretString::from("tok-123".to_string())
    }

    #[test]
    fn test_endpoint_joins_and_encodes() {
        let base = parse_base("https://api.example.com/client/v4").unwrap();
        let url = endpoint(&base, &["accounts", "a b", "d1", "database"]).unwrap();
        assert_eq!(
            url.as_str(),
            "https://api.example.com/client/v4/accounts/a%20b/d1/database"
        );

        let base = parse_base("http://127.0.0.1:9000/").unwrap();
        let url = endpoint(&base, &["accounts", "x"]).unwrap();
        assert_eq!(url.as_str(), "http://127.0.0.1:9000/accounts/x");
    }

    #[tokio::test]
    async fn test_post_sends_bearer_and_json() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/query"))
            .and(header("authorization", "Bearer tok-123"))
            .and(body_json(serde_json::json!({"sql": "SELECT 1"})))
            .respond_with(ResponseTemplate::new(200).set_body_string("{\"success\":true}"))
            .expect(1)
            .mount(&server)
            .await;

        let transport = HttpTransport::new(Duration::from_secs(5)).unwrap();
        let url = Url::parse(&format!("{}/query", server.uri())).unwrap();
        let body = transport
            .post(&url, &token(), &serde_json::json!({"sql": "SELECT 1"}))
            .await
            .unwrap();
        assert_eq!(body, "{\"success\":true}");
    }

    #[tokio::test]
    async fn test_non_2xx_carries_status_and_remote_text() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/list"))
            .respond_with(ResponseTemplate::new(403).set_body_json(serde_json::json!({
                "success": false,
                "errors": [{"code": 10000, "message": "Authentication error"}]
            })))
            .mount(&server)
            .await;

        let transport = HttpTransport::new(Duration::from_secs(5)).unwrap();
        let url = Url::parse(&format!("{}/list", server.uri())).unwrap();
        let err = transport.get(&url, &token()).await.unwrap_err();

        assert_eq!(err.code, ErrorCode::HttpStatus);
        assert_eq!(err.message, "HTTP 403: Authentication error");
        match err.context {
            Some(ErrorContext::Request { status, .. }) => assert_eq!(status, Some(403)),
            other => panic!("unexpected context {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_timeout_is_a_transport_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
            .mount(&server)
            .await;

        let transport = HttpTransport::new(Duration::from_millis(200)).unwrap();
        let url = Url::parse(&server.uri()).unwrap();
        let err = transport.get(&url, &token()).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::ConnectionTimeout);
    }

    #[tokio::test]
    async fn test_unreachable_host_is_a_transport_error() {
        let transport = HttpTransport::new(Duration::from_secs(2)).unwrap();
        let url = Url::parse("http://127.0.0.1:1/").unwrap();
        let err = transport.get(&url, &token()).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::ConnectionFailed);
    }
}
