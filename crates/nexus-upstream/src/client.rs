//! Outbound HTTP call to the upstream LLM API (spec §4.5, component C5).
//!
//! The request body is forwarded unchanged — only the auth header is
//! injected — since the wire format the proxy accepts at ingress already
//! matches what upstream expects (spec §9's "dynamic, schema-free request
//! bodies" note).

use nexus_credentials::Credential;
use reqwest::StatusCode;
use std::time::Duration;
use tracing::{debug, warn};

const API_VERSION: &str = "2023-06-01";
const OAUTH_BETA: &str = "oauth-2025-04-20";

/// Classification of an upstream call outcome (spec §4.5).
pub enum UpstreamOutcome {
    Ok(reqwest::Response),
    RateLimited { retry_after_ms: u64 },
    AuthExpired,
    UpstreamError { status: u16, body: String },
    Timeout,
    Network(String),
}

pub struct UpstreamClient {
    http: reqwest::Client,
    base_url: String,
    ttfb_timeout: Duration,
}

impl UpstreamClient {
    pub fn new(base_url: impl Into<String>, ttfb_timeout: Duration, total_timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(total_timeout)
            .build()
            .expect("reqwest client builds with static config");
        Self {
            http,
            base_url: base_url.into(),
            ttfb_timeout,
        }
    }

    fn apply_auth(&self, builder: reqwest::RequestBuilder, credential: &Credential) -> reqwest::RequestBuilder {
        if credential.is_oauth() {
            builder
                .header("Authorization", format!("Bearer {}", credential.auth_value()))
                .header("anthropic-beta", OAUTH_BETA)
        } else {
            builder.header("x-api-key", credential.auth_value())
        }
    }

    /// Sends `body` to `/v1/messages` unchanged, swapping in `credential`'s
    /// auth header. Streaming vs non-streaming is decided by the caller via
    /// the `stream` field already present in `body`.
    pub async fn send(&self, body: &[u8], credential: &Credential) -> UpstreamOutcome {
        let url = format!("{}/v1/messages", self.base_url);
        debug!(url = %url, "sending request upstream");

        let builder = self
            .http
            .post(&url)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .body(body.to_vec());

        // `send()`'s future resolves once the response status/headers arrive,
        // before the body is read, so this bounds actual time-to-first-byte
        // rather than just TCP/TLS connect (the two-tier timeout of spec §4.5
        // only collapses into one if this is left to `total_timeout` alone).
        let sent = tokio::time::timeout(self.ttfb_timeout, self.apply_auth(builder, credential).send()).await;
        let resp = match sent {
            Ok(Ok(resp)) => resp,
            Ok(Err(e)) if e.is_timeout() => return UpstreamOutcome::Timeout,
            Ok(Err(e)) if e.is_connect() => return UpstreamOutcome::Network(e.to_string()),
            Ok(Err(e)) => return UpstreamOutcome::Network(e.to_string()),
            Err(_elapsed) => return UpstreamOutcome::Timeout,
        };

        self.classify(resp).await
    }

    async fn classify(&self, resp: reqwest::Response) -> UpstreamOutcome {
        let status = resp.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after_ms = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(|secs| secs * 1000)
                .unwrap_or(5000);
            return UpstreamOutcome::RateLimited { retry_after_ms };
        }

        if status == StatusCode::UNAUTHORIZED {
            let body = resp.text().await.unwrap_or_default();
            if body.contains("invalid_token") || body.contains("expired") {
                return UpstreamOutcome::AuthExpired;
            }
            return UpstreamOutcome::UpstreamError {
                status: status.as_u16(),
                body,
            };
        }

        if !status.is_success() {
            let status_code = status.as_u16();
            let body = resp.text().await.unwrap_or_default();
            warn!(status = status_code, "upstream returned an error");
            return UpstreamOutcome::UpstreamError {
                status: status_code,
                body,
            };
        }

        UpstreamOutcome::Ok(resp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oauth_credential_uses_bearer_and_beta_header() {
        let client = UpstreamClient::new(
            "https://api.anthropic.com",
            Duration::from_secs(1),
            Duration::from_secs(1),
        );
        let credential = Credential::OAuth {
            access_token: "sk-ant-oat01-xyz".to_string(),
            refresh_token: "r".to_string(),
            expires_at: chrono::Utc::now(),
            token_url: None,
            client_id: None,
        };
        let req = client.http.post("https://api.anthropic.com/v1/messages");
        let req = client.apply_auth(req, &credential).build().unwrap();
        assert!(req.headers().contains_key("anthropic-beta"));
    }

    #[test]
    fn api_key_credential_uses_x_api_key_header() {
        let client = UpstreamClient::new(
            "https://api.anthropic.com",
            Duration::from_secs(1),
            Duration::from_secs(1),
        );
        let credential = Credential::ApiKey {
            key: "sk-test".to_string(),
        };
        let req = client.http.post("https://api.anthropic.com/v1/messages");
        let req = client.apply_auth(req, &credential).build().unwrap();
        assert!(req.headers().contains_key("x-api-key"));
        assert!(!req.headers().contains_key("anthropic-beta"));
    }
}
