//! Google Sheets backend over the v4 REST API.
//!
//! Authenticates as a service account: a self-signed RS256 assertion is
//! exchanged for an access token, which is cached until shortly before it
//! expires.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{SheetBackend, StoreError};
use crate::config::GoogleConfig;

const SHEETS_API: &str = "https://sheets.googleapis.com/v4/spreadsheets";
const SHEETS_SCOPE: &str = "https://www.googleapis.com/auth/spreadsheets";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const TOKEN_LIFETIME_SECS: i64 = 3600;
/// Refresh this long before the cached token runs out
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

/// The fields we need from a service account key file
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

impl ServiceAccountKey {
    pub fn load(path: &Path) -> Result<Self, StoreError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            StoreError::Config(format!(
                "cannot read credentials {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, StoreError> {
        serde_json::from_str(content)
            .map_err(|e| StoreError::Config(format!("invalid service account key: {}", e)))
    }
}

#[derive(Debug, Serialize)]
struct Claims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    TOKEN_LIFETIME_SECS as u64
}

struct AccessToken {
    value: String,
    expires_at: Instant,
}

#[derive(Debug, Default, Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct Spreadsheet {
    #[serde(default)]
    sheets: Vec<SheetEntry>,
}

#[derive(Debug, Deserialize)]
struct SheetEntry {
    properties: SheetProperties,
}

#[derive(Debug, Deserialize)]
struct SheetProperties {
    title: String,
}

pub struct GoogleSheet {
    client: reqwest::Client,
    key: ServiceAccountKey,
    signing_key: EncodingKey,
    spreadsheet_id: String,
    worksheet: String,
    token: Mutex<Option<AccessToken>>,
    /// Set once the worksheet is known to exist
    worksheet_ready: AtomicBool,
}

impl GoogleSheet {
    pub fn from_config(config: &GoogleConfig) -> Result<Self, StoreError> {
        let key = ServiceAccountKey::load(&config.credentials_path)?;
        Self::new(key, &config.spreadsheet_id, &config.worksheet)
    }

    pub fn new(
        key: ServiceAccountKey,
        spreadsheet_id: &str,
        worksheet: &str,
    ) -> Result<Self, StoreError> {
        let signing_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())
            .map_err(|e| StoreError::Config(format!("invalid service account private key: {}", e)))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| StoreError::Config(e.to_string()))?;

        info!(
            "Google sheet backend: spreadsheet {} worksheet '{}' as {}",
            spreadsheet_id, worksheet, key.client_email
        );
        Ok(Self {
            client,
            key,
            signing_key,
            spreadsheet_id: spreadsheet_id.to_string(),
            worksheet: worksheet.to_string(),
            token: Mutex::new(None),
            worksheet_ready: AtomicBool::new(false),
        })
    }

    async fn access_token(&self) -> Result<String, StoreError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() + TOKEN_REFRESH_MARGIN < token.expires_at {
                return Ok(token.value.clone());
            }
        }

        let iat = chrono::Utc::now().timestamp();
        let claims = Claims {
            iss: &self.key.client_email,
            scope: SHEETS_SCOPE,
            aud: &self.key.token_uri,
            iat,
            exp: iat + TOKEN_LIFETIME_SECS,
        };
        let assertion = encode(&Header::new(Algorithm::RS256), &claims, &self.signing_key)
            .map_err(|e| StoreError::Config(format!("failed to sign token request: {}", e)))?;

        let response = self
            .client
            .post(&self.key.token_uri)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", assertion.as_str()),
            ])
            .send()
            .await
            .map_err(request_error)?;
        let token: TokenResponse = read_json(response).await?;

        debug!("Fetched Google access token, valid for {}s", token.expires_in);
        let value = token.access_token.clone();
        *cached = Some(AccessToken {
            value: token.access_token,
            expires_at: Instant::now() + Duration::from_secs(token.expires_in),
        });
        Ok(value)
    }

    fn url(&self, segments: &[&str]) -> Result<Url, StoreError> {
        let mut url = Url::parse(SHEETS_API).map_err(|e| StoreError::Config(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| StoreError::Config("sheets API url cannot have a path".to_string()))?
            .push(&self.spreadsheet_id)
            .extend(segments);
        Ok(url)
    }

    fn values_url(&self, range: &str, suffix: &str) -> Result<Url, StoreError> {
        let target = format!("{}{}", range, suffix);
        self.url(&["values", target.as_str()])
    }

    async fn get_values(&self, range: &str) -> Result<Vec<Vec<String>>, StoreError> {
        let token = self.access_token().await?;
        let response = self
            .client
            .get(self.values_url(range, "")?)
            .bearer_auth(token)
            .send()
            .await
            .map_err(request_error)?;
        let range: ValueRange = read_json(response).await?;
        Ok(range.values)
    }

    /// Create the worksheet tab if the spreadsheet doesn't have it yet
    async fn ensure_worksheet(&self) -> Result<(), StoreError> {
        if self.worksheet_ready.load(Ordering::Acquire) {
            return Ok(());
        }

        let token = self.access_token().await?;
        let response = self
            .client
            .get(self.url(&[])?)
            .query(&[("fields", "sheets.properties.title")])
            .bearer_auth(&token)
            .send()
            .await
            .map_err(request_error)?;
        let spreadsheet: Spreadsheet = read_json(response).await?;

        let exists = spreadsheet
            .sheets
            .iter()
            .any(|s| s.properties.title == self.worksheet);
        if !exists {
            warn!("Worksheet '{}' not found, creating it", self.worksheet);
            let mut url = self.url(&[])?;
            let path = format!("{}:batchUpdate", url.path());
            url.set_path(&path);
            let body = json!({
                "requests": [{ "addSheet": { "properties": { "title": self.worksheet } } }]
            });
            let response = self
                .client
                .post(url)
                .bearer_auth(&token)
                .json(&body)
                .send()
                .await
                .map_err(request_error)?;
            let _: serde_json::Value = read_json(response).await?;
        }

        self.worksheet_ready.store(true, Ordering::Release);
        Ok(())
    }
}

#[async_trait]
impl SheetBackend for GoogleSheet {
    async fn read_header(&self) -> Result<Vec<String>, StoreError> {
        self.ensure_worksheet().await?;
        let first_row = self.get_values(&header_range(&self.worksheet)).await?;
        Ok(first_row.into_iter().next().unwrap_or_default())
    }

    async fn write_header(&self, header: &[String]) -> Result<(), StoreError> {
        info!("Writing header row to worksheet '{}'", self.worksheet);
        let token = self.access_token().await?;
        let response = self
            .client
            .put(self.values_url(&header_range(&self.worksheet), "")?)
            .query(&[("valueInputOption", "RAW")])
            .bearer_auth(token)
            .json(&json!({ "values": [header] }))
            .send()
            .await
            .map_err(request_error)?;
        let _: serde_json::Value = read_json(response).await?;
        Ok(())
    }

    async fn append_row(&self, row: &[String]) -> Result<(), StoreError> {
        let token = self.access_token().await?;
        let response = self
            .client
            .post(self.values_url(&sheet_range(&self.worksheet), ":append")?)
            .query(&[
                ("valueInputOption", "RAW"),
                ("insertDataOption", "INSERT_ROWS"),
            ])
            .bearer_auth(token)
            .json(&json!({ "values": [row] }))
            .send()
            .await
            .map_err(request_error)?;
        let _: serde_json::Value = read_json(response).await?;
        Ok(())
    }

    async fn read_all(&self) -> Result<Vec<Vec<String>>, StoreError> {
        self.ensure_worksheet().await?;
        self.get_values(&sheet_range(&self.worksheet)).await
    }

    fn dashboard_url(&self) -> Option<String> {
        Some(format!(
            "https://docs.google.com/spreadsheets/d/{}",
            self.spreadsheet_id
        ))
    }
}

/// A1 reference to the whole worksheet, quoted for names with spaces
fn sheet_range(worksheet: &str) -> String {
    format!("'{}'", worksheet.replace('\'', "''"))
}

fn header_range(worksheet: &str) -> String {
    format!("{}!1:1", sheet_range(worksheet))
}

async fn read_json<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, StoreError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(status_error(status, &body));
    }
    response
        .json()
        .await
        .map_err(|e| StoreError::Malformed(format!("could not decode sheets response: {}", e)))
}

/// Classify a failed HTTP response
fn status_error(status: StatusCode, body: &str) -> StoreError {
    let detail = format!("HTTP {}: {}", status, body.trim());
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => StoreError::Permission(detail),
        StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => {
            StoreError::Transient(detail)
        }
        StatusCode::NOT_FOUND => StoreError::Config(detail),
        s if s.is_server_error() => StoreError::Transient(detail),
        _ => StoreError::Malformed(detail),
    }
}

fn request_error(e: reqwest::Error) -> StoreError {
    if e.is_builder() {
        StoreError::Config(e.to_string())
    } else if e.is_decode() {
        StoreError::Malformed(e.to_string())
    } else {
        // connect, timeout and mid-body failures
        StoreError::Transient(e.to_string())
    }
}
