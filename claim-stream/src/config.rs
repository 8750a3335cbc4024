use std::path::PathBuf;
use std::time::Duration;

use reqwest::Url;

use crate::error::{Result, StreamError};

pub const DEFAULT_BASE_URL: &str = "http://localhost:8000";
pub const BASE_URL_ENV: &str = "CLAIM_API_BASE_URL";
pub const TIMEOUT_ENV: &str = "CLAIM_API_TIMEOUT_SECS";
pub const HISTORY_DIR_ENV: &str = "CLAIM_HISTORY_DIR";

/// Connection settings shared by the claim, file and chat endpoints
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    /// Applies to connecting only; streamed bodies may stay open for as long as the pipeline runs
    pub connect_timeout: Option<Duration>,
    pub history_dir: PathBuf,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            connect_timeout: None,
            history_dir: PathBuf::from(".claim-history"),
        }
    }
}

impl ClientConfig {
    /// Build a config for `base_url` with default everything else
    pub fn with_base_url(base_url: impl AsRef<str>) -> Result<Self> {
        Ok(Self {
            base_url: normalize_base_url(base_url.as_ref())?,
            ..Self::default()
        })
    }

    /// Read settings from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(url) = lookup(BASE_URL_ENV) {
            config.base_url = normalize_base_url(&url)?;
        }

        if let Some(secs) = lookup(TIMEOUT_ENV) {
            let secs = secs.trim().parse::<u64>().map_err(|_| {
                StreamError::Config(format!("{TIMEOUT_ENV} must be a number of seconds, got {secs:?}"))
            })?;
            config.connect_timeout = Some(Duration::from_secs(secs));
        }

        if let Some(dir) = lookup(HISTORY_DIR_ENV) {
            config.history_dir = PathBuf::from(dir);
        }

        Ok(config)
    }

    /// Absolute URL of an endpoint path such as `chat-stream/`
    pub fn endpoint(&self, path: &str) -> Result<Url> {
        // the trailing slash keeps any base path, e.g. `/api/`, when joining
        let base = Url::parse(&format!("{}/", self.base_url))
            .map_err(|e| StreamError::Config(format!("invalid base URL {:?}: {e}", self.base_url)))?;
        base.join(path.trim_start_matches('/'))
            .map_err(|e| StreamError::Config(format!("invalid endpoint path {path:?}: {e}")))
    }
}

fn normalize_base_url(raw: &str) -> Result<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(StreamError::Config("base URL is empty".to_string()));
    }
    let mut url = Url::parse(raw)
        .map_err(|e| StreamError::Config(format!("invalid base URL {raw:?}: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(StreamError::Config(format!(
            "base URL must use http or https, got {raw:?}"
        )));
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(StreamError::Config(format!("base URL has no host: {raw:?}")));
    }
    url.set_query(None);
    url.set_fragment(None);
    Ok(url.as_str().trim_end_matches('/').to_string())
}
