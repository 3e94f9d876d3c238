//! Client configuration for metadata loading.

use policyengine_schema::CountryProfile;

pub const DEFAULT_API_URL: &str = "https://api.policyengine.org";

// ============================================================================
// Configuration
// ============================================================================

/// Where metadata comes from and how hard to try.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Base URL; resources are fetched from `{api_url}/{resource}`.
    pub api_url: String,
    pub timeout_secs: u64,
    /// Retries per resource after the first attempt.
    pub max_retries: u32,
    /// Backoff before retry `n` is `n * retry_backoff_ms`.
    pub retry_backoff_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            timeout_secs: 30,
            max_retries: 2,
            retry_backoff_ms: 250,
        }
    }
}

impl ClientConfig {
    /// Load from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an explicit variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(url) = lookup("POLICYENGINE_API_URL") {
            config = config.with_api_url(url)?;
        }
        if let Some(raw) = lookup("POLICYENGINE_TIMEOUT_SECS") {
            config.timeout_secs = parse_var("POLICYENGINE_TIMEOUT_SECS", &raw)?;
        }
        if let Some(raw) = lookup("POLICYENGINE_MAX_RETRIES") {
            config.max_retries = parse_var("POLICYENGINE_MAX_RETRIES", &raw)?;
        }
        Ok(config)
    }

    /// Default config pointed at the profile's API, when it names one.
    pub fn for_profile(profile: &CountryProfile) -> Result<Self, ConfigError> {
        match &profile.api_url {
            Some(url) => Self::default().with_api_url(url.clone()),
            None => Ok(Self::default()),
        }
    }

    pub fn with_api_url(mut self, url: impl Into<String>) -> Result<Self, ConfigError> {
        let url = url.into();
        let parsed = url::Url::parse(&url)
            .map_err(|e| ConfigError::Invalid(format!("api url `{}`: {}", url, e)))?;
        if parsed.cannot_be_a_base() {
            return Err(ConfigError::Invalid(format!(
                "api url `{}` cannot carry resource paths",
                url
            )));
        }
        self.api_url = url.trim_end_matches('/').to_string();
        Ok(self)
    }

    pub fn with_retries(mut self, max_retries: u32, backoff_ms: u64) -> Self {
        self.max_retries = max_retries;
        self.retry_backoff_ms = backoff_ms;
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn resource_url(&self, resource: &str) -> String {
        format!("{}/{}", self.api_url, resource)
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| ConfigError::Invalid(format!("{}={:?}: {}", name, raw, e)))
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
