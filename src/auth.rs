use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use time::OffsetDateTime;
use tracing::error;

/// Request header carrying the API key of the forwarding front-end.
pub const API_KEY_HEADER: &str = "x-appsec-api-key";
/// Request header carrying the original client IP as seen by the front-end.
pub const CLIENT_IP_HEADER: &str = "x-appsec-real-ip";

const PROBE_TIMEOUT: Duration = Duration::from_millis(200);
const DECISIONS_ENDPOINT: &str = "v1/decisions/stream";

/// Time-bounded positive cache of API-key validations. Only successful probes
/// are recorded; expired entries are ignored lazily, never swept.
#[derive(Debug, Default)]
pub struct AuthCache {
    api_keys: RwLock<HashMap<String, OffsetDateTime>>,
}

impl AuthCache {
    pub fn new() -> Self {
        Self {
            api_keys: RwLock::new(HashMap::new()),
        }
    }

    pub fn set(&self, api_key: &str, expiration: OffsetDateTime) {
        self.api_keys
            .write()
            .insert(api_key.to_string(), expiration);
    }

    pub fn get(&self, api_key: &str) -> Option<OffsetDateTime> {
        self.api_keys.read().get(api_key).copied()
    }

    /// True when a cached validation for `api_key` is still within its TTL.
    pub fn is_fresh(&self, api_key: &str, now: OffsetDateTime) -> bool {
        match self.get(api_key) {
            Some(expiration) => now <= expiration,
            None => false,
        }
    }
}

/// Single-shot validation of an API key against the upstream decision service.
#[derive(Debug, Clone)]
pub struct AuthProbe {
    client: reqwest::Client,
    url: String,
}

impl AuthProbe {
    pub fn new(lapi_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(PROBE_TIMEOUT)
            .build()
            .context("failed to build auth probe client")?;
        let base = lapi_url.trim_end_matches('/');
        Ok(Self {
            client,
            url: format!("{base}/{DECISIONS_ENDPOINT}"),
        })
    }

    /// Issues a HEAD to the decision service. Any transport error, timeout, or
    /// non-200 status degrades to `false`; failures are logged, never surfaced.
    pub async fn is_valid(&self, api_key: &str) -> bool {
        let response = self
            .client
            .head(&self.url)
            .header(API_KEY_HEADER, api_key)
            .send()
            .await;
        match response {
            Ok(response) => response.status() == reqwest::StatusCode::OK,
            Err(err) => {
                error!(error = %err, url = %self.url, "auth probe request failed");
                false
            }
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}
