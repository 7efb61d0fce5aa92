//! Thin HTTP client for the state agency portal.
//!
//! The scraping/automation internals live behind this seam; the worker only
//! sees record lookups that either return a parsed record or a classified
//! [`OperationError`]. Rate-limit responses surface the server's
//! `Retry-After` hint so the retry executor can honor it.

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::Config;
use crate::retry::OperationError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// A contractor license record as reported by the portal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LicenseRecord {
    pub license_number: String,
    pub status: String,
    pub employer_name: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Portal-side state of a wage case.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseRecord {
    pub case_id: Uuid,
    pub stage: String,
    pub last_activity_at: Option<DateTime<Utc>>,
}

pub struct PortalClient {
    http: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
}

impl PortalClient {
    pub fn new(config: &Config) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Failed to build portal HTTP client")?;

        Ok(Self {
            http,
            base_url: config.portal_base_url.trim_end_matches('/').to_string(),
            username: config.portal_username.clone(),
            password: config.portal_password.clone(),
        })
    }

    pub async fn fetch_license(&self, license_number: &str) -> Result<LicenseRecord, OperationError> {
        self.get_json(&format!("api/licenses/{}", license_number)).await
    }

    pub async fn fetch_case(&self, case_id: Uuid) -> Result<CaseRecord, OperationError> {
        self.get_json(&format!("api/cases/{}", case_id)).await
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, OperationError> {
        let url = format!("{}/{}", self.base_url, path);
        let response = self
            .http
            .get(&url)
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let mut error = OperationError::new(format!("portal returned {} for {}", status, path))
                .with_status(status.as_u16());
            if let Some(retry_after) = parse_retry_after(response.headers()) {
                error = error.with_retry_after(retry_after);
            }
            return Err(error);
        }

        Ok(response.json().await?)
    }
}

/// Parse a `Retry-After` header: whole seconds, or an HTTP date.
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?;

    if let Ok(seconds) = value.trim().parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }

    let at = DateTime::parse_from_rfc2822(value).ok()?;
    (at.with_timezone(&Utc) - Utc::now()).to_std().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn retry_after_parses_whole_seconds() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("120"));
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(120)));
    }

    #[test]
    fn retry_after_parses_http_dates() {
        let future = (Utc::now() + chrono::Duration::seconds(90)).to_rfc2822();
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_str(&future).unwrap());

        let parsed = parse_retry_after(&headers).unwrap();
        assert!(parsed <= Duration::from_secs(90));
        assert!(parsed >= Duration::from_secs(85));
    }

    #[test]
    fn retry_after_ignores_garbage() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("soon"));
        assert_eq!(parse_retry_after(&headers), None);

        assert_eq!(parse_retry_after(&HeaderMap::new()), None);
    }
}
