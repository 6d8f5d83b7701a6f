use std::time::Duration;

use reqwest::Client;
use tracing::debug;

use crate::acme::types::{Problem, StepError};

const CONTENT_TYPE_JOSE_JSON: &str = "application/jose+json";
const HEADER_REPLAY_NONCE: &str = "replay-nonce";
const HEADER_LOCATION: &str = "location";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepMethod {
    Get,
    Head,
    Post,
}

/// One ACME exchange as the state machine describes it: a method, an opaque
/// URL, and (for POSTs) an already-signed JWS body.
#[derive(Debug, Clone)]
pub struct StepRequest {
    pub method: StepMethod,
    pub url: String,
    pub body: Option<String>,
}

impl StepRequest {
    pub fn get(url: &str) -> Self {
        Self {
            method: StepMethod::Get,
            url: url.to_string(),
            body: None,
        }
    }

    pub fn head(url: &str) -> Self {
        Self {
            method: StepMethod::Head,
            url: url.to_string(),
            body: None,
        }
    }

    pub fn post(url: &str, body: String) -> Self {
        Self {
            method: StepMethod::Post,
            url: url.to_string(),
            body: Some(body),
        }
    }
}

/// A completed exchange. Headers the protocol cares about are harvested
/// before any status classification so a failing response still rotates the
/// nonce.
#[derive(Debug, Clone)]
pub struct StepResponse {
    pub status: u16,
    pub nonce: Option<String>,
    pub location: Option<String>,
    pub body: Vec<u8>,
}

impl StepResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Parses the body as JSON, attributing failures to the given step.
    ///
    /// # Errors
    /// Returns `StepError::Body` if the body does not deserialize.
    pub fn json<T: serde::de::DeserializeOwned>(&self, what: &'static str) -> Result<T, StepError> {
        serde_json::from_slice(&self.body).map_err(|source| StepError::Body { what, source })
    }

    /// The problem document of an error response, if the body carries one.
    pub fn problem(&self) -> Option<Problem> {
        serde_json::from_slice(&self.body).ok()
    }

    /// Classifies a non-2xx response as the step failure for `what`.
    pub fn status_error(&self, what: &'static str) -> StepError {
        StepError::Status {
            status: self.status,
            what,
            problem: self.problem(),
        }
    }
}

/// Thin wrapper around the async HTTP client: issue one request, suspend
/// the calling task until the response is complete, hand back headers and
/// body. All protocol interpretation stays with the caller.
#[derive(Clone)]
pub struct HttpStep {
    client: Client,
}

impl HttpStep {
    /// Builds the underlying HTTP client.
    ///
    /// # Errors
    /// Returns an error if the TLS backend cannot be initialized.
    pub fn new() -> anyhow::Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("edgecert/", env!("CARGO_PKG_VERSION")))
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self { client })
    }

    /// Issues one request. Non-2xx statuses are not errors here; the driver
    /// classifies them after harvesting headers.
    ///
    /// # Errors
    /// Returns `StepError::Transport` on connection, TLS, or timeout
    /// failures.
    pub async fn issue(
        &self,
        request: &StepRequest,
        what: &'static str,
    ) -> Result<StepResponse, StepError> {
        let builder = match request.method {
            StepMethod::Get => self.client.get(&request.url),
            StepMethod::Head => self.client.head(&request.url),
            StepMethod::Post => self
                .client
                .post(&request.url)
                .header(reqwest::header::CONTENT_TYPE, CONTENT_TYPE_JOSE_JSON)
                .body(request.body.clone().unwrap_or_default()),
        };

        let response = builder
            .send()
            .await
            .map_err(|source| StepError::Transport { what, source })?;

        let status = response.status().as_u16();
        let nonce = header_value(&response, HEADER_REPLAY_NONCE);
        let location = header_value(&response, HEADER_LOCATION);
        let body = response
            .bytes()
            .await
            .map_err(|source| StepError::Transport { what, source })?
            .to_vec();

        debug!(
            method = ?request.method,
            url = %request.url,
            status,
            body_len = body.len(),
            "ACME exchange complete"
        );

        Ok(StepResponse {
            status,
            nonce,
            location,
            body,
        })
    }
}

fn header_value(response: &reqwest::Response, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(ToString::to_string)
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    #[tokio::test]
    async fn test_issue_harvests_replay_nonce_and_location() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/acme/new-account"))
            .and(header("content-type", CONTENT_TYPE_JOSE_JSON))
            .respond_with(
                ResponseTemplate::new(201)
                    .insert_header("replay-nonce", "nonce-abc")
                    .insert_header("location", "https://ca.example/acct/1")
                    .set_body_json(serde_json::json!({ "status": "valid" })),
            )
            .mount(&server)
            .await;

        let http = HttpStep::new().unwrap();
        let request = StepRequest::post(
            &format!("{}/acme/new-account", server.uri()),
            "{}".to_string(),
        );
        let response = http.issue(&request, "creating the account").await.unwrap();

        assert_eq!(response.status, 201);
        assert!(response.is_success());
        assert_eq!(response.nonce.as_deref(), Some("nonce-abc"));
        assert_eq!(response.location.as_deref(), Some("https://ca.example/acct/1"));
    }

    #[tokio::test]
    async fn test_non_2xx_is_a_response_not_a_transport_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/acme/new-order"))
            .respond_with(
                ResponseTemplate::new(400)
                    .insert_header("replay-nonce", "nonce-after-failure")
                    .set_body_json(serde_json::json!({
                        "type": "urn:ietf:params:acme:error:badNonce",
                        "detail": "bad nonce"
                    })),
            )
            .mount(&server)
            .await;

        let http = HttpStep::new().unwrap();
        let request = StepRequest::post(
            &format!("{}/acme/new-order", server.uri()),
            "{}".to_string(),
        );
        let response = http.issue(&request, "creating the order").await.unwrap();

        // The nonce of an error response must still be usable.
        assert_eq!(response.nonce.as_deref(), Some("nonce-after-failure"));
        let err = response.status_error("getting the newOrder URL");
        assert!(err.to_string().contains("invalid HTTP status code 400"));
        assert!(err.to_string().contains("badNonce"));
    }

    #[tokio::test]
    async fn test_head_request_for_new_nonce() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/acme/new-nonce"))
            .respond_with(ResponseTemplate::new(200).insert_header("replay-nonce", "first-nonce"))
            .mount(&server)
            .await;

        let http = HttpStep::new().unwrap();
        let request = StepRequest::head(&format!("{}/acme/new-nonce", server.uri()));
        let response = http.issue(&request, "getting a new nonce").await.unwrap();
        assert_eq!(response.nonce.as_deref(), Some("first-nonce"));
    }
}
