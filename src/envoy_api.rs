use std::sync::Arc;

use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{Error, Result};
use crate::readings::{normalize_snapshot, MeterDirectory, RawMeter, RawMeterReading, Reading};
use crate::token_manager::TokenManager;

pub const METERS_PATH: &str = "/ivp/meters";
pub const READINGS_PATH: &str = "/ivp/meters/readings";
pub const INFO_PATH: &str = "/info.xml";

/// Authenticated HTTP access to one Envoy. The underlying client is owned
/// by the caller and shared with the streaming path.
pub struct EnvoyApi {
    base_url: String,
    tokens: Arc<TokenManager>,
    directory: Mutex<Option<MeterDirectory>>,
}

impl EnvoyApi {
    pub fn new(base_url: impl Into<String>, tokens: Arc<TokenManager>) -> Self {
        Self {
            base_url: base_url.into(),
            tokens,
            directory: Mutex::new(None),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn tokens(&self) -> &Arc<TokenManager> {
        &self.tokens
    }

    /// GET with the current bearer token. A 401 forces one token renewal
    /// and one retry; a second 401 is surfaced as an auth failure rather
    /// than retried again.
    async fn fetch(&self, session: &reqwest::Client, url: &str) -> Result<reqwest::Response> {
        let mut renewed = false;
        loop {
            let mut request = session.get(url);
            if let Some(credential) = self.tokens.current().await {
                request = request.bearer_auth(credential.token());
            }
            debug!(url, "HTTP GET");
            let response = request.send().await?;
            let status = response.status();

            if status == StatusCode::UNAUTHORIZED {
                if renewed {
                    return Err(Error::Auth {
                        url: url.to_string(),
                    });
                }
                debug!(url, "device rejected bearer token, renewing");
                self.tokens.invalidate().await;
                self.tokens.ensure_valid(session).await?;
                renewed = true;
                continue;
            }
            if !status.is_success() {
                return Err(Error::Http {
                    status,
                    url: url.to_string(),
                });
            }
            return Ok(response);
        }
    }

    pub async fn fetch_json<T: DeserializeOwned>(
        &self,
        session: &reqwest::Client,
        path: &str,
    ) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let response = self.fetch(session, &url).await?;
        response
            .json()
            .await
            .map_err(|err| Error::decode("device json payload", err))
    }

    pub async fn fetch_text(&self, session: &reqwest::Client, path: &str) -> Result<String> {
        let url = format!("{}{}", self.base_url, path);
        Ok(self.fetch(session, &url).await?.text().await?)
    }

    /// The meter directory for this session. Fetched once and memoized;
    /// later calls return the cached copy without a network round trip.
    pub async fn meter_directory(&self, session: &reqwest::Client) -> Result<MeterDirectory> {
        let mut cached = self.directory.lock().await;
        if let Some(directory) = cached.as_ref() {
            return Ok(directory.clone());
        }

        self.tokens.ensure_valid(session).await?;
        let rows: Vec<RawMeter> = self.fetch_json(session, METERS_PATH).await?;
        let directory = MeterDirectory::from_meters(rows);
        debug!(
            meters = directory.len(),
            phases = directory.phase_count(),
            "loaded meter directory"
        );
        *cached = Some(directory.clone());
        Ok(directory)
    }

    /// The device serial number from the static info document. Works
    /// without a credential, which makes it usable during initial pairing.
    pub async fn serial_number(&self, session: &reqwest::Client) -> Result<String> {
        let text = self.fetch_text(session, INFO_PATH).await?;
        let document = roxmltree::Document::parse(&text)
            .map_err(|err| Error::decode("device info document", err))?;
        document
            .descendants()
            .find(|node| {
                node.has_tag_name("sn")
                    && node.parent().is_some_and(|parent| parent.has_tag_name("device"))
            })
            .and_then(|node| node.text())
            .map(|serial| serial.trim().to_string())
            .ok_or_else(|| Error::Decode("serial number missing from info document".to_string()))
    }

    /// One normalized snapshot of the live readings document.
    pub async fn readings_snapshot(&self, session: &reqwest::Client) -> Result<Reading> {
        self.tokens.ensure_valid(session).await?;
        let directory = self.meter_directory(session).await?;
        let rows: Vec<RawMeterReading> = self.fetch_json(session, READINGS_PATH).await?;
        normalize_snapshot(&directory, &rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EnvoyConfig;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine as _;
    use chrono::Utc;

    fn make_token(exp: i64) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"ES256","typ":"JWT"}"#);
        let payload =
            URL_SAFE_NO_PAD.encode(serde_json::json!({ "exp": exp }).to_string().as_bytes());
        format!("{header}.{payload}.sig")
    }

    fn api_for(server: &mockito::Server, token: Option<String>) -> EnvoyApi {
        let config = EnvoyConfig {
            host: server.url(),
            username: "user@example.com".to_string(),
            password: "hunter2".to_string(),
            serial_number: "122300001234".to_string(),
            token,
            poll_interval: std::time::Duration::from_secs(2),
        };
        let tokens = Arc::new(TokenManager::with_endpoints(
            format!("{}/login/login.json", server.url()),
            format!("{}/tokens", server.url()),
            &config,
        ));
        EnvoyApi::new(server.url(), tokens)
    }

    const METERS_BODY: &str = r#"[
        {"eid": 704643328, "measurementType": "production", "phaseCount": 3},
        {"eid": 704643584, "measurementType": "net-consumption", "phaseCount": 3}
    ]"#;

    #[tokio::test]
    async fn test_meter_directory_is_memoized() {
        let mut server = mockito::Server::new_async().await;
        let token = make_token(Utc::now().timestamp() + 3600);
        let meters_mock = server
            .mock("GET", METERS_PATH)
            .match_header("authorization", format!("Bearer {token}").as_str())
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(METERS_BODY)
            .expect(1)
            .create_async()
            .await;

        let api = api_for(&server, Some(token));
        let session = reqwest::Client::new();

        let first = api.meter_directory(&session).await.unwrap();
        let second = api.meter_directory(&session).await.unwrap();

        assert_eq!(first.len(), 2);
        assert_eq!(second.phase_count(), 3);
        meters_mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_401_renews_token_and_retries_once() {
        let mut server = mockito::Server::new_async().await;
        let stale = make_token(Utc::now().timestamp() + 3600);
        let fresh = make_token(Utc::now().timestamp() + 7200);
        assert_ne!(stale, fresh);

        // The device revoked the held token: requests carrying it 401.
        let rejected_mock = server
            .mock("GET", METERS_PATH)
            .match_header("authorization", format!("Bearer {stale}").as_str())
            .with_status(401)
            .expect(1)
            .create_async()
            .await;
        let accepted_mock = server
            .mock("GET", METERS_PATH)
            .match_header("authorization", format!("Bearer {fresh}").as_str())
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(METERS_BODY)
            .expect(1)
            .create_async()
            .await;
        server
            .mock("POST", "/login/login.json")
            .with_status(200)
            .with_body(r#"{"session_id": "sess-9"}"#)
            .create_async()
            .await;
        let token_mock = server
            .mock("POST", "/tokens")
            .with_status(200)
            .with_body(&fresh)
            .expect(1)
            .create_async()
            .await;

        let api = api_for(&server, Some(stale));
        let session = reqwest::Client::new();

        let directory = api.meter_directory(&session).await.unwrap();

        assert_eq!(directory.len(), 2);
        rejected_mock.assert_async().await;
        accepted_mock.assert_async().await;
        token_mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_second_401_surfaces_auth_error_without_third_request() {
        let mut server = mockito::Server::new_async().await;
        let stale = make_token(Utc::now().timestamp() + 3600);
        let fresh = make_token(Utc::now().timestamp() + 7200);

        let meters_mock = server
            .mock("GET", METERS_PATH)
            .with_status(401)
            .expect(2)
            .create_async()
            .await;
        server
            .mock("POST", "/login/login.json")
            .with_status(200)
            .with_body(r#"{"session_id": "sess-10"}"#)
            .create_async()
            .await;
        let token_mock = server
            .mock("POST", "/tokens")
            .with_status(200)
            .with_body(&fresh)
            .expect(1)
            .create_async()
            .await;

        let api = api_for(&server, Some(stale));
        let session = reqwest::Client::new();

        let err = api.meter_directory(&session).await.unwrap_err();

        assert!(matches!(err, Error::Auth { .. }), "got {err:?}");
        meters_mock.assert_async().await;
        token_mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_serial_number_without_credentials() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", INFO_PATH)
            .with_status(200)
            .with_header("content-type", "text/xml")
            .with_body(
                r#"<?xml version="1.0" encoding="UTF-8"?>
                <envoy_info>
                  <time>1700000000</time>
                  <device>
                    <sn>122333444555</sn>
                    <pn>800-00654-r08</pn>
                    <software>D7.0.88</software>
                  </device>
                </envoy_info>"#,
            )
            .create_async()
            .await;

        let api = api_for(&server, None);
        let session = reqwest::Client::new();

        let serial = api.serial_number(&session).await.unwrap();
        assert_eq!(serial, "122333444555");
    }

    #[tokio::test]
    async fn test_non_401_status_propagates_as_http_error() {
        let mut server = mockito::Server::new_async().await;
        let token = make_token(Utc::now().timestamp() + 3600);
        server
            .mock("GET", METERS_PATH)
            .with_status(503)
            .create_async()
            .await;

        let api = api_for(&server, Some(token));
        let session = reqwest::Client::new();

        let err = api.meter_directory(&session).await.unwrap_err();
        match err {
            Error::Http { status, .. } => assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE),
            other => panic!("expected http error, got {other:?}"),
        }
    }
}
