//! Ambient Google credentials: discovery at startup, access tokens on demand.
//!
//! Discovery order mirrors application default credentials:
//! 1. an explicit access token from configuration
//! 2. the file named by `GOOGLE_APPLICATION_CREDENTIALS`
//! 3. gcloud's well-known ADC file, when present
//! 4. the GCE metadata server

use crate::config::BigQueryConfig;
use crate::error::{InitError, QueryError};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub const BIGQUERY_SCOPE: &str = "https://www.googleapis.com/auth/bigquery";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const METADATA_TIMEOUT: Duration = Duration::from_secs(2);
// Tokens are refreshed this long before they expire.
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);
const JWT_LIFETIME_SECS: u64 = 3600;

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
    pub project_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthorizedUser {
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
    pub quota_project_id: Option<String>,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum CredentialsFile {
    ServiceAccount(ServiceAccountKey),
    AuthorizedUser(AuthorizedUser),
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

#[derive(Debug, Clone)]
pub enum Credentials {
    AccessToken(String),
    ServiceAccount(ServiceAccountKey),
    AuthorizedUser(AuthorizedUser),
    Metadata { host: String },
}

impl Credentials {
    pub fn kind(&self) -> &'static str {
        match self {
            Credentials::AccessToken(_) => "access token",
            Credentials::ServiceAccount(_) => "service account",
            Credentials::AuthorizedUser(_) => "authorized user",
            Credentials::Metadata { .. } => "metadata server",
        }
    }

    fn project_hint(&self) -> Option<String> {
        match self {
            Credentials::ServiceAccount(key) => key.project_id.clone(),
            Credentials::AuthorizedUser(user) => user.quota_project_id.clone(),
            _ => None,
        }
    }
}

fn read_credentials_file(path: &Path) -> Result<Credentials, InitError> {
    let display = path.display().to_string();
    let raw = fs::read_to_string(path).map_err(|source| InitError::CredentialsFile {
        path: display.clone(),
        source,
    })?;
    let parsed: CredentialsFile =
        serde_json::from_str(&raw).map_err(|e| InitError::InvalidCredentials {
            path: display,
            reason: e.to_string(),
        })?;
    Ok(match parsed {
        CredentialsFile::ServiceAccount(key) => Credentials::ServiceAccount(key),
        CredentialsFile::AuthorizedUser(user) => Credentials::AuthorizedUser(user),
    })
}

fn metadata_request(http: &Client, host: &str, path: &str) -> reqwest::RequestBuilder {
    http.get(format!("http://{}/computeMetadata/v1/{}", host, path))
        .header("Metadata-Flavor", "Google")
}

async fn metadata_project(http: &Client, host: &str) -> Result<String, reqwest::Error> {
    let resp = metadata_request(http, host, "project/project-id")
        .timeout(METADATA_TIMEOUT)
        .send()
        .await?
        .error_for_status()?;
    Ok(resp.text().await?.trim().to_string())
}

/// Resolves credentials and the billing project from configuration and the
/// ambient environment. Runs once, at startup.
pub async fn discover(
    cfg: &BigQueryConfig,
    http: &Client,
) -> Result<(Credentials, String), InitError> {
    let credentials = if let Some(token) = &cfg.access_token {
        Credentials::AccessToken(token.clone())
    } else if let Some(path) = &cfg.credentials_file {
        read_credentials_file(path)?
    } else if let Some(path) = cfg.adc_file.as_deref().filter(|p| p.exists()) {
        read_credentials_file(path)?
    } else {
        Credentials::Metadata {
            host: cfg.metadata_host.clone(),
        }
    };
    info!("Using {} credentials", credentials.kind());

    if let Some(project) = cfg.project.clone().or_else(|| credentials.project_hint()) {
        return Ok((credentials, project));
    }

    match metadata_project(http, &cfg.metadata_host).await {
        Ok(project) if !project.is_empty() => {
            debug!("Project '{}' resolved from metadata server", project);
            Ok((credentials, project))
        }
        Ok(_) => Err(InitError::NoProject),
        Err(e) => {
            warn!("Metadata server at {} unreachable: {}", cfg.metadata_host, e);
            match credentials {
                Credentials::Metadata { .. } => Err(InitError::NoCredentials(format!(
                    "none configured and metadata server unreachable ({})",
                    e
                ))),
                _ => Err(InitError::NoProject),
            }
        }
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: Option<u64>,
}

#[derive(Serialize)]
struct JwtClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: u64,
    exp: u64,
}

struct CachedToken {
    value: String,
    expires_at: Option<Instant>,
}

impl CachedToken {
    fn is_fresh(&self) -> bool {
        match self.expires_at {
            Some(at) => Instant::now() + EXPIRY_MARGIN < at,
            None => true,
        }
    }
}

/// Mints OAuth2 access tokens for the discovered credentials and caches them
/// until shortly before they expire.
pub struct TokenProvider {
    credentials: Credentials,
    http: Client,
    cached: Mutex<Option<CachedToken>>,
}

impl TokenProvider {
    pub fn new(credentials: Credentials, http: Client) -> Self {
        TokenProvider {
            credentials,
            http,
            cached: Mutex::new(None),
        }
    }

    pub async fn token(&self) -> Result<String, QueryError> {
        if let Credentials::AccessToken(token) = &self.credentials {
            return Ok(token.clone());
        }

        // Held across the refresh so concurrent requests mint only once.
        let mut cached = self.cached.lock().await;
        if let Some(tok) = cached.as_ref().filter(|t| t.is_fresh()) {
            return Ok(tok.value.clone());
        }

        debug!("Refreshing {} access token", self.credentials.kind());
        let fresh = self.fetch().await?;
        let value = fresh.access_token.clone();
        *cached = Some(CachedToken {
            value: fresh.access_token,
            expires_at: fresh
                .expires_in
                .map(|secs| Instant::now() + Duration::from_secs(secs)),
        });
        Ok(value)
    }

    async fn fetch(&self) -> Result<TokenResponse, QueryError> {
        let request = match &self.credentials {
            Credentials::AccessToken(_) => {
                return Err(QueryError::Auth("static tokens are never refreshed".into()))
            }
            Credentials::ServiceAccount(key) => {
                let assertion = sign_assertion(key)?;
                self.http.post(&key.token_uri).form(&[
                    ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                    ("assertion", assertion.as_str()),
                ])
            }
            Credentials::AuthorizedUser(user) => self.http.post(&user.token_uri).form(&[
                ("grant_type", "refresh_token"),
                ("client_id", user.client_id.as_str()),
                ("client_secret", user.client_secret.as_str()),
                ("refresh_token", user.refresh_token.as_str()),
            ]),
            Credentials::Metadata { host } => metadata_request(
                &self.http,
                host,
                "instance/service-accounts/default/token",
            ),
        };

        let resp = request
            .send()
            .await
            .map_err(|e| QueryError::Auth(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(QueryError::Auth(format!(
                "token endpoint returned {}: {}",
                status,
                body.trim()
            )));
        }
        resp.json::<TokenResponse>()
            .await
            .map_err(|e| QueryError::Auth(format!("malformed token response: {}", e)))
    }
}

fn sign_assertion(key: &ServiceAccountKey) -> Result<String, QueryError> {
    let iat = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| QueryError::Auth(e.to_string()))?
        .as_secs();
    let claims = JwtClaims {
        iss: &key.client_email,
        scope: BIGQUERY_SCOPE,
        aud: &key.token_uri,
        iat,
        exp: iat + JWT_LIFETIME_SECS,
    };
    let encoding_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())
        .map_err(|e| QueryError::Auth(format!("invalid service account key: {}", e)))?;
    encode(&Header::new(Algorithm::RS256), &claims, &encoding_key)
        .map_err(|e| QueryError::Auth(format!("failed to sign token request: {}", e)))
}
