//! Ephemeral realtime session credentials and WebRTC SDP exchange.

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failures talking to the realtime service.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Missing or invalid relay settings.
    #[error("invalid relay configuration: {0}")]
    Config(String),
    /// The request did not complete.
    #[error("{operation} request failed: {source}")]
    Transport {
        /// `start session` or `sdp exchange`.
        operation: &'static str,
        /// Underlying client error.
        #[source]
        source: reqwest::Error,
    },
    /// The service answered with a non-success status.
    #[error("{operation} rejected with {status}: {body}")]
    Upstream {
        /// `start session` or `sdp exchange`.
        operation: &'static str,
        /// HTTP status code.
        status: u16,
        /// Response body, for diagnostics.
        body: String,
    },
    /// The service answered 2xx with an unusable body.
    #[error("malformed {operation} response: {reason}")]
    Malformed {
        /// `start session` or `sdp exchange`.
        operation: &'static str,
        /// What was missing or wrong.
        reason: String,
    },
}

/// Realtime service endpoints and credentials.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    /// Sessions endpoint issuing ephemeral keys.
    pub sessions_url: String,
    /// WebRTC endpoint receiving SDP offers.
    pub webrtc_url: String,
    /// Long-lived API key; never sent to the browser.
    pub api_key: String,
    /// Realtime model deployment.
    pub deployment: String,
    /// Assistant voice.
    pub voice: String,
    /// Per-request timeout.
    pub timeout: Duration,
}

/// Session id and the short-lived key the browser uses for WebRTC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionCredentials {
    /// Realtime session id.
    pub session_id: String,
    /// Ephemeral client secret.
    pub ephemeral_key: String,
}

#[derive(Serialize)]
struct StartSessionRequest<'a> {
    model: &'a str,
    voice: &'a str,
}

#[derive(Deserialize)]
struct SessionResponse {
    id: Option<String>,
    client_secret: Option<ClientSecret>,
}

#[derive(Deserialize)]
struct ClientSecret {
    value: Option<String>,
}

/// Thin client for the realtime sessions and WebRTC endpoints.
#[derive(Clone)]
pub struct SessionRelay {
    client: Client,
    settings: RelaySettings,
}

impl SessionRelay {
    /// Validates `settings` and builds the HTTP client.
    pub fn new(settings: RelaySettings) -> Result<Self, RelayError> {
        for (name, value) in [
            ("sessions url", &settings.sessions_url),
            ("webrtc url", &settings.webrtc_url),
            ("api key", &settings.api_key),
            ("deployment", &settings.deployment),
            ("voice", &settings.voice),
        ] {
            if value.trim().is_empty() {
                return Err(RelayError::Config(format!("missing {name}")));
            }
        }
        let client = Client::builder()
            .timeout(settings.timeout)
            .build()
            .map_err(|err| RelayError::Config(format!("failed to build HTTP client: {err}")))?;
        Ok(Self { client, settings })
    }

    /// URL SDP offers are posted to.
    pub fn webrtc_endpoint(&self) -> String {
        format!("{}?model={}", self.settings.webrtc_url, self.settings.deployment)
    }

    /// Starts a realtime session and returns its ephemeral credentials.
    pub async fn start_session(&self) -> Result<SessionCredentials, RelayError> {
        const OPERATION: &str = "start session";
        let mut headers = HeaderMap::new();
        headers.insert(
            "api-key",
            HeaderValue::from_str(self.settings.api_key.trim())
                .map_err(|_| RelayError::Config("invalid api key".into()))?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let response = self
            .client
            .post(&self.settings.sessions_url)
            .headers(headers)
            .json(&StartSessionRequest {
                model: &self.settings.deployment,
                voice: &self.settings.voice,
            })
            .send()
            .await
            .map_err(|source| RelayError::Transport {
                operation: OPERATION,
                source,
            })?;
        let status = response.status();
        let body = response.text().await.map_err(|source| RelayError::Transport {
            operation: OPERATION,
            source,
        })?;
        if !status.is_success() {
            tracing::error!(status = status.as_u16(), body = %body, "session start rejected");
            return Err(RelayError::Upstream {
                operation: OPERATION,
                status: status.as_u16(),
                body,
            });
        }
        let credentials = parse_session(&body)?;
        tracing::info!(session_id = %credentials.session_id, "realtime session started");
        Ok(credentials)
    }

    /// Forwards a WebRTC SDP offer and returns the answer SDP.
    pub async fn exchange_sdp(&self, ephemeral_key: &str, offer_sdp: &str) -> Result<String, RelayError> {
        const OPERATION: &str = "sdp exchange";
        if offer_sdp.trim().is_empty() {
            return Err(RelayError::Config("empty SDP offer".into()));
        }
        let bearer = HeaderValue::from_str(&format!("Bearer {}", ephemeral_key.trim()))
            .map_err(|_| RelayError::Config("invalid ephemeral key".into()))?;
        let response = self
            .client
            .post(self.webrtc_endpoint())
            .header(AUTHORIZATION, bearer)
            .header(CONTENT_TYPE, "application/sdp")
            .body(offer_sdp.to_string())
            .send()
            .await
            .map_err(|source| RelayError::Transport {
                operation: OPERATION,
                source,
            })?;
        let status = response.status();
        let body = response.text().await.map_err(|source| RelayError::Transport {
            operation: OPERATION,
            source,
        })?;
        if !status.is_success() {
            tracing::error!(status = status.as_u16(), body = %body, "sdp exchange rejected");
            return Err(RelayError::Upstream {
                operation: OPERATION,
                status: status.as_u16(),
                body,
            });
        }
        if body.trim().is_empty() {
            return Err(RelayError::Malformed {
                operation: OPERATION,
                reason: "empty answer SDP".into(),
            });
        }
        Ok(body)
    }
}

fn parse_session(body: &str) -> Result<SessionCredentials, RelayError> {
    let malformed = |reason: String| RelayError::Malformed {
        operation: "start session",
        reason,
    };
    let response: SessionResponse =
        serde_json::from_str(body).map_err(|err| malformed(err.to_string()))?;
    let session_id = response
        .id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| malformed("missing `id`".into()))?;
    let ephemeral_key = response
        .client_secret
        .and_then(|secret| secret.value)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| malformed("missing `client_secret.value`".into()))?;
    Ok(SessionCredentials {
        session_id,
        ephemeral_key,
    })
}
