//! Metadata sources: where the four resources come from.

use async_trait::async_trait;
use policyengine_schema::Resource;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

// ============================================================================
// Source Interface
// ============================================================================

/// Anything that can produce the raw JSON payload of a resource.
#[async_trait]
pub trait MetadataSource: Send + Sync {
    async fn fetch(&self, resource: Resource) -> Result<Value, FetchError>;
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FetchError {
    #[error("Network error: {0}")]
    Network(String),
    #[error("HTTP {status} from {url}")]
    Status { status: u16, url: String },
    #[error("Invalid payload: {0}")]
    Decode(String),
    #[error("Timed out after {0:?}")]
    Timeout(Duration),
}

impl FetchError {
    /// Whether another attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Network(_) | FetchError::Timeout(_) => true,
            FetchError::Status { status, .. } => *status == 429 || *status >= 500,
            FetchError::Decode(_) => false,
        }
    }
}

// ============================================================================
// In-memory Source
// ============================================================================

enum Behaviour {
    Serve {
        payload: Value,
        delay: Duration,
        /// Fail with `error` this many times before serving.
        failures_left: AtomicU32,
        error: FetchError,
    },
    Fail(FetchError),
    Pending,
}

/// Serves canned payloads; used for offline runs and tests.
///
/// Resources never configured fail with a 404, like the real API would.
#[derive(Default)]
pub struct StaticMetadataSource {
    resources: HashMap<Resource, Behaviour>,
    attempts: [AtomicU32; Resource::ALL.len()],
}

impl StaticMetadataSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_payload(self, resource: Resource, payload: Value) -> Self {
        self.with_delayed_payload(resource, payload, Duration::ZERO)
    }

    pub fn with_delayed_payload(mut self, resource: Resource, payload: Value, delay: Duration) -> Self {
        self.resources.insert(
            resource,
            Behaviour::Serve {
                payload,
                delay,
                failures_left: AtomicU32::new(0),
                error: FetchError::Network(String::new()),
            },
        );
        self
    }

    /// Serve `payload`, but only after failing `times` attempts with `error`.
    pub fn with_flaky_payload(
        mut self,
        resource: Resource,
        payload: Value,
        times: u32,
        error: FetchError,
    ) -> Self {
        self.resources.insert(
            resource,
            Behaviour::Serve {
                payload,
                delay: Duration::ZERO,
                failures_left: AtomicU32::new(times),
                error,
            },
        );
        self
    }

    pub fn with_failure(mut self, resource: Resource, error: FetchError) -> Self {
        self.resources.insert(resource, Behaviour::Fail(error));
        self
    }

    /// The fetch for `resource` never resolves.
    pub fn with_pending(mut self, resource: Resource) -> Self {
        self.resources.insert(resource, Behaviour::Pending);
        self
    }

    /// How many times `resource` has been requested.
    pub fn attempts(&self, resource: Resource) -> u32 {
        self.attempts[resource as usize].load(Ordering::SeqCst)
    }

    /// Build from a directory holding `parameters.json`, `variables.json`,
    /// `entities.json` and optionally `endpoint-runtimes.json`.
    pub fn from_dir(dir: impl AsRef<std::path::Path>) -> std::io::Result<Self> {
        let dir = dir.as_ref();
        let mut source = Self::new();
        for resource in Resource::ALL {
            let path = dir.join(format!("{}.json", resource.name()));
            if !resource.is_required() && !path.exists() {
                continue;
            }
            let text = std::fs::read_to_string(&path)?;
            let payload: Value = serde_json::from_str(&text).map_err(|e| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("{}: {}", path.display(), e),
                )
            })?;
            source = source.with_payload(resource, payload);
        }
        Ok(source)
    }
}

#[async_trait]
impl MetadataSource for StaticMetadataSource {
    async fn fetch(&self, resource: Resource) -> Result<Value, FetchError> {
        self.attempts[resource as usize].fetch_add(1, Ordering::SeqCst);
        match self.resources.get(&resource) {
            Some(Behaviour::Serve {
                payload,
                delay,
                failures_left,
                error,
            }) => {
                let failing = failures_left
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
                if failing {
                    return Err(error.clone());
                }
                if !delay.is_zero() {
                    tokio::time::sleep(*delay).await;
                }
                Ok(payload.clone())
            }
            Some(Behaviour::Fail(error)) => Err(error.clone()),
            Some(Behaviour::Pending) => std::future::pending().await,
            None => Err(FetchError::Status {
                status: 404,
                url: resource.name().to_string(),
            }),
        }
    }
}

// ============================================================================
// HTTP Source
// ============================================================================

#[cfg(feature = "http")]
pub use http::HttpMetadataSource;

#[cfg(feature = "http")]
mod http {
    use super::*;
    use crate::config::ClientConfig;
    use reqwest::Client;

    /// GETs `{api_url}/{resource}` and parses the body as JSON.
    pub struct HttpMetadataSource {
        client: Client,
        config: ClientConfig,
    }

    impl HttpMetadataSource {
        pub fn new(config: ClientConfig) -> Result<Self, FetchError> {
            let mut builder = Client::builder();
            if config.timeout_secs > 0 {
                builder = builder.timeout(Duration::from_secs(config.timeout_secs));
            }
            let client = builder
                .build()
                .map_err(|e| FetchError::Network(e.to_string()))?;
            Ok(Self { client, config })
        }
    }

    #[async_trait]
    impl MetadataSource for HttpMetadataSource {
        async fn fetch(&self, resource: Resource) -> Result<Value, FetchError> {
            let url = self.config.resource_url(resource.name());
            let response = self.client.get(&url).send().await.map_err(|e| {
                if e.is_timeout() {
                    FetchError::Timeout(Duration::from_secs(self.config.timeout_secs))
                } else {
                    FetchError::Network(e.to_string())
                }
            })?;

            if !response.status().is_success() {
                return Err(FetchError::Status {
                    status: response.status().as_u16(),
                    url,
                });
            }

            response
                .json()
                .await
                .map_err(|e| FetchError::Decode(e.to_string()))
        }
    }
}
