use crate::{
    error::CredentialError,
    http::{HttpRequest, HttpTransport},
};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::RwLock;
use serde::Deserialize;
use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tracing::{debug, info, warn};

pub const ACCESS_COOKIE: &str = "auth-access-token";
pub const REFRESH_COOKIE: &str = "auth-refresh-token";

const REFRESH_TIMEOUT: Duration = Duration::from_secs(10);

/// Bearer credential pair used for the feed handshake and market-data calls.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: String,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("expires_at", &self.expires_at())
            .finish_non_exhaustive()
    }
}

impl Credential {
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
        }
    }

    /// `Cookie` header value carrying both tokens.
    pub fn cookie_header(&self) -> String {
        format!(
            "{ACCESS_COOKIE}={}; {REFRESH_COOKIE}={}",
            self.access_token, self.refresh_token
        )
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        token_expiry(&self.access_token)
    }

    /// Attach both tokens as cookies to an outbound request.
    pub fn authorize(&self, request: HttpRequest) -> HttpRequest {
        request
            .with_cookie(ACCESS_COOKIE, self.access_token.as_str())
            .with_cookie(REFRESH_COOKIE, self.refresh_token.as_str())
    }
}

#[derive(Deserialize)]
struct Claims {
    exp: Option<f64>,
}

/// Decode the `exp` claim of a JWT without verifying its signature.
pub fn token_expiry(token: &str) -> Option<DateTime<Utc>> {
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims = serde_json::from_slice::<Claims>(&bytes).ok()?;
    DateTime::from_timestamp(claims.exp? as i64, 0)
}

/// A token is expired iff `now >= exp - leeway`. Tokens without a decodable `exp` claim
/// are treated as expired.
pub fn is_expired(token: &str, leeway: Duration) -> bool {
    let leeway = TimeDelta::from_std(leeway).unwrap_or(TimeDelta::zero());
    match token_expiry(token) {
        Some(expiry) => Utc::now() >= expiry - leeway,
        None => true,
    }
}

#[derive(Deserialize)]
struct AuthFile {
    tokens: AuthTokens,
}

#[derive(Deserialize)]
struct AuthTokens {
    #[serde(rename = "auth-access-token")]
    access_token: String,
    #[serde(rename = "auth-refresh-token")]
    refresh_token: String,
}

#[derive(Deserialize)]
struct RefreshBody {
    #[serde(rename = "accessToken", alias = "auth-access-token")]
    access_token: Option<String>,
    #[serde(rename = "refreshToken", alias = "auth-refresh-token")]
    refresh_token: Option<String>,
}

/// Owner of the current [`Credential`].
///
/// Reads are cheap clones under a read lock. Refreshes are serialised: a caller whose
/// observed access token has already been replaced by a concurrent refresh gets the new
/// credential without another network round trip.
pub struct CredentialStore {
    path: Option<PathBuf>,
    refresh_url: String,
    origin: String,
    leeway: Duration,
    transport: Arc<dyn HttpTransport>,
    current: RwLock<Credential>,
    refresh_lock: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialStore")
            .field("path", &self.path)
            .field("refresh_url", &self.refresh_url)
            .field("current", &*self.current.read())
            .finish_non_exhaustive()
    }
}

impl CredentialStore {
    pub fn new(
        credential: Credential,
        refresh_url: impl Into<String>,
        origin: impl Into<String>,
        transport: Arc<dyn HttpTransport>,
    ) -> Self {
        Self {
            path: None,
            refresh_url: refresh_url.into(),
            origin: origin.into(),
            leeway: Duration::from_secs(10),
            transport,
            current: RwLock::new(credential),
            refresh_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Load the credential pair from `{"tokens": {"auth-access-token", "auth-refresh-token"}}`.
    ///
    /// Refreshed pairs are persisted back to the same file.
    pub fn load(
        path: impl AsRef<Path>,
        refresh_url: impl Into<String>,
        origin: impl Into<String>,
        transport: Arc<dyn HttpTransport>,
    ) -> Result<Self, CredentialError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|error| CredentialError::Read {
            path: path.display().to_string(),
            reason: error.to_string(),
        })?;

        let AuthFile { tokens } = serde_json::from_str::<AuthFile>(&contents)
            .map_err(|error| CredentialError::Malformed(error.to_string()))?;

        let credential = Credential::new(tokens.access_token, tokens.refresh_token);
        info!(path = %path.display(), expires_at = ?credential.expires_at(), "loaded credentials");

        Ok(Self::new(credential, refresh_url, origin, transport).with_path(path))
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_leeway(mut self, leeway: Duration) -> Self {
        self.leeway = leeway;
        self
    }

    pub fn current(&self) -> Credential {
        self.current.read().clone()
    }

    pub fn is_expired(&self) -> bool {
        is_expired(&self.current.read().access_token, self.leeway)
    }

    /// Return the current credential, refreshing it first if the access token is expired.
    pub async fn ensure_fresh(&self) -> Result<Credential, CredentialError> {
        let current = self.current();
        if is_expired(&current.access_token, self.leeway) {
            debug!("access token expired, refreshing");
            self.refresh_if_current(&current.access_token).await
        } else {
            Ok(current)
        }
    }

    pub async fn refresh(&self) -> Result<Credential, CredentialError> {
        let observed = self.current.read().access_token.clone();
        self.refresh_if_current(&observed).await
    }

    /// Refresh the pair unless `observed` access token has already been replaced.
    ///
    /// On success both tokens are swapped under one write lock and persisted. On failure
    /// the current pair is left untouched.
    pub async fn refresh_if_current(&self, observed: &str) -> Result<Credential, CredentialError> {
        let _guard = self.refresh_lock.lock().await;

        let current = self.current();
        if current.access_token != observed {
            debug!("credential already refreshed by a concurrent caller");
            return Ok(current);
        }

        let request = HttpRequest::post(self.refresh_url.as_str())
            .with_cookie(REFRESH_COOKIE, current.refresh_token.as_str())
            .with_header("Origin", self.origin.as_str())
            .with_timeout(REFRESH_TIMEOUT);

        let response = self.transport.send(&request).await?;
        if !response.is_success() {
            warn!(status = response.status, "credential refresh rejected");
            return Err(CredentialError::RefreshRejected(response.status));
        }

        let body = serde_json::from_str::<RefreshBody>(&response.body).ok();

        let access_token = response
            .set_cookie(ACCESS_COOKIE)
            .map(str::to_string)
            .or_else(|| body.as_ref().and_then(|body| body.access_token.clone()))
            .filter(|token| !token.is_empty())
            .ok_or(CredentialError::MissingAccessToken)?;

        let refresh_token = response
            .set_cookie(REFRESH_COOKIE)
            .map(str::to_string)
            .or_else(|| body.and_then(|body| body.refresh_token))
            .filter(|token| !token.is_empty())
            .unwrap_or(current.refresh_token);

        let refreshed = Credential::new(access_token, refresh_token);
        *self.current.write() = refreshed.clone();
        info!(expires_at = ?refreshed.expires_at(), "credential refreshed");

        if let Err(error) = self.persist(&refreshed) {
            warn!(%error, "refreshed credential kept in memory only");
        }

        Ok(refreshed)
    }

    /// Write the pair to the credential file via write-to-temp-then-rename, preserving any
    /// unrelated fields already present in the file.
    fn persist(&self, credential: &Credential) -> Result<(), CredentialError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let mut document = std::fs::read_to_string(path)
            .ok()
            .and_then(|contents| serde_json::from_str::<serde_json::Value>(&contents).ok())
            .filter(serde_json::Value::is_object)
            .unwrap_or_else(|| serde_json::json!({}));

        document["tokens"] = serde_json::json!({
            ACCESS_COOKIE: credential.access_token,
            REFRESH_COOKIE: credential.refresh_token,
        });

        let contents = serde_json::to_string_pretty(&document)
            .map_err(|error| CredentialError::Persist(error.to_string()))?;

        let mut temp = path.clone().into_os_string();
        temp.push(".tmp");
        let temp = PathBuf::from(temp);

        std::fs::write(&temp, contents)
            .and_then(|()| std::fs::rename(&temp, path))
            .map_err(|error| CredentialError::Persist(error.to_string()))
    }
}
