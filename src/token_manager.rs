use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::StatusCode;
use serde_derive::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::EnvoyConfig;
use crate::error::{Error, Result};

pub const LOGIN_URL: &str = "https://enlighten.enphaseenergy.com/login/login.json";
pub const TOKEN_URL: &str = "https://entrez.enphaseenergy.com/tokens";

/// A bearer token plus the expiry claim decoded from it. Replaced
/// wholesale on renewal, never edited in place.
#[derive(Debug, Clone)]
pub struct Credential {
    token: String,
    expires_at: DateTime<Utc>,
}

impl Credential {
    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// A token expiring in the current instant is already expired; never
    /// hand out a credential that could lapse mid-request.
    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    session_id: String,
}

#[derive(Debug, Deserialize)]
struct TokenClaims {
    exp: i64,
}

/// Owns the Enlighten credential shared by the polling and streaming
/// paths. Renewal happens under the lock, so concurrent callers see either
/// the old or the new credential, never a half-written one.
pub struct TokenManager {
    login_url: String,
    token_url: String,
    username: String,
    password: String,
    serial_number: String,
    credential: Mutex<Option<Credential>>,
}

impl TokenManager {
    pub fn new(config: &EnvoyConfig) -> Self {
        Self::with_endpoints(LOGIN_URL, TOKEN_URL, config)
    }

    /// Same as [`TokenManager::new`] with the Enlighten endpoints
    /// overridden, for pointing the login flow at a test server.
    pub fn with_endpoints(
        login_url: impl Into<String>,
        token_url: impl Into<String>,
        config: &EnvoyConfig,
    ) -> Self {
        let credential = config.token.as_deref().and_then(|token| {
            match decode_expiry(token) {
                Ok(expires_at) => Some(Credential {
                    token: token.to_string(),
                    expires_at,
                }),
                Err(err) => {
                    warn!(%err, "discarding pre-seeded token that failed to decode");
                    None
                }
            }
        });

        Self {
            login_url: login_url.into(),
            token_url: token_url.into(),
            username: config.username.clone(),
            password: config.password.clone(),
            serial_number: config.serial_number.clone(),
            credential: Mutex::new(credential),
        }
    }

    /// Returns the held credential, logging in first if none is held or the
    /// held one has expired.
    pub async fn ensure_valid(&self, session: &reqwest::Client) -> Result<Credential> {
        let mut held = self.credential.lock().await;
        if let Some(credential) = held.as_ref() {
            if !credential.is_expired() {
                return Ok(credential.clone());
            }
            debug!(expires_at = %credential.expires_at, "bearer token expired, renewing");
        }

        let credential = self.login(session).await?;
        *held = Some(credential.clone());
        Ok(credential)
    }

    /// Drops the held credential so the next `ensure_valid` performs a full
    /// login. Used after the device rejects a token the clock still trusts.
    pub async fn invalidate(&self) {
        *self.credential.lock().await = None;
    }

    /// The held credential, if any, without triggering a renewal.
    pub async fn current(&self) -> Option<Credential> {
        self.credential.lock().await.clone()
    }

    async fn login(&self, session: &reqwest::Client) -> Result<Credential> {
        let session_id = self.fetch_session_id(session).await?;
        let token = self.fetch_token(session, &session_id).await?;
        let expires_at = decode_expiry(&token)?;
        info!(%expires_at, "obtained enlighten bearer token");
        Ok(Credential { token, expires_at })
    }

    async fn fetch_session_id(&self, session: &reqwest::Client) -> Result<String> {
        debug!(url = self.login_url, "requesting enlighten session id");
        let response = session
            .post(&self.login_url)
            .form(&[
                ("user[email]", self.username.as_str()),
                ("user[password]", self.password.as_str()),
            ])
            .send()
            .await?;
        let response = check_status(response, &self.login_url)?;
        let login: LoginResponse = response
            .json()
            .await
            .map_err(|err| Error::decode("login response", err))?;
        Ok(login.session_id)
    }

    async fn fetch_token(&self, session: &reqwest::Client, session_id: &str) -> Result<String> {
        debug!(url = self.token_url, "requesting long-term token");
        let body = serde_json::json!({
            "session_id": session_id,
            "serial_num": self.serial_number,
            "username": self.username,
        });
        let response = session.post(&self.token_url).json(&body).send().await?;
        let response = check_status(response, &self.token_url)?;
        Ok(response.text().await?.trim().to_string())
    }
}

fn check_status(response: reqwest::Response, url: &str) -> Result<reqwest::Response> {
    let status = response.status();
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(Error::Auth {
            url: url.to_string(),
        });
    }
    if !status.is_success() {
        return Err(Error::Http {
            status,
            url: url.to_string(),
        });
    }
    Ok(response)
}

/// Pulls the `exp` claim out of the token's payload segment. The token is
/// only a bearer credential for the local device, so the signature is not
/// verified here.
fn decode_expiry(token: &str) -> Result<DateTime<Utc>> {
    let payload = token
        .split('.')
        .nth(1)
        .ok_or_else(|| Error::Decode("bearer token has no claims segment".to_string()))?;
    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|err| Error::decode("bearer token claims", err))?;
    let claims: TokenClaims = serde_json::from_slice(&bytes)
        .map_err(|err| Error::decode("bearer token claims", err))?;
    Utc.timestamp_opt(claims.exp, 0)
        .single()
        .ok_or_else(|| Error::Decode(format!("bearer token expiry {} out of range", claims.exp)))
}
