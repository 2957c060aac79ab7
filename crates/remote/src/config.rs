//! Configuration types for the remote cache client

use crate::cas::BatchLimits;
use crate::error::{RemoteError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration for the remote cache client
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemoteConfig {
    /// Remote cache endpoint (e.g., "grpcs://cache.example.com:443" or "localhost:8980")
    pub endpoint: String,

    /// Maximum chunk size in bytes for streamed blobs
    #[serde(default = "default_max_chunk_size_bytes")]
    pub max_chunk_size_bytes: usize,

    /// Maximum number of blobs started in one upload batch
    #[serde(default = "default_max_batch_inputs")]
    pub max_batch_inputs: usize,

    /// Maximum cumulative bytes of one upload batch
    #[serde(default = "default_max_batch_size_bytes")]
    pub max_batch_size_bytes: u64,

    /// How long an upload waits for its batches, in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// TLS settings; plaintext when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsConfig>,

    /// Authentication configuration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthConfig>,

    /// Use results found in the action result cache
    #[serde(default = "default_true")]
    pub accept_cached: bool,

    /// Let the caller execute locally when remote execution is unavailable
    #[serde(default = "default_true")]
    pub allow_local_fallback: bool,

    /// Store results of locally executed actions in the remote cache
    #[serde(default = "default_true")]
    pub upload_local_results: bool,

    /// Retry configuration; a single attempt when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryConfig>,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            max_chunk_size_bytes: default_max_chunk_size_bytes(),
            max_batch_inputs: default_max_batch_inputs(),
            max_batch_size_bytes: default_max_batch_size_bytes(),
            timeout_secs: default_timeout_secs(),
            tls: None,
            auth: None,
            accept_cached: true,
            allow_local_fallback: true,
            upload_local_results: true,
            retry: None,
        }
    }
}

impl RemoteConfig {
    /// Configuration for `endpoint` with every other value at its default
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Default::default()
        }
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| RemoteError::config_error(format!("invalid remote config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| RemoteError::io("read config", path, e))?;
        Self::from_toml_str(&content)
    }

    /// Reject values the client cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.endpoint.trim().is_empty() {
            return Err(RemoteError::config_error("endpoint must not be empty"));
        }
        if self.max_chunk_size_bytes == 0 {
            return Err(RemoteError::config_error(
                "max_chunk_size_bytes must be positive",
            ));
        }
        if self.max_batch_inputs == 0 {
            return Err(RemoteError::config_error("max_batch_inputs must be positive"));
        }
        if self.max_batch_size_bytes == 0 {
            return Err(RemoteError::config_error(
                "max_batch_size_bytes must be positive",
            ));
        }
        if self.timeout_secs == 0 {
            return Err(RemoteError::config_error("timeout_secs must be positive"));
        }
        if let Some(retry) = &self.retry {
            if retry.max_attempts == 0 {
                return Err(RemoteError::config_error(
                    "retry.max_attempts must be positive",
                ));
            }
        }
        Ok(())
    }

    /// Upload batch limits
    pub fn batch_limits(&self) -> BatchLimits {
        BatchLimits {
            max_inputs: self.max_batch_inputs,
            max_bytes: self.max_batch_size_bytes,
        }
    }

    /// Upload wait timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Whether the channel uses TLS
    pub fn tls_enabled(&self) -> bool {
        self.tls.as_ref().is_some_and(|tls| tls.enabled)
    }
}

/// TLS settings for the channel
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TlsConfig {
    /// Use TLS for bare `host:port` endpoints
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// PEM file with the CA certificate to trust instead of the system roots
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_cert: Option<PathBuf>,

    /// PEM client certificate for mutual TLS
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_cert: Option<PathBuf>,

    /// PEM client key for mutual TLS
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_key: Option<PathBuf>,

    /// Domain name to verify the server certificate against
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authority_override: Option<String>,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ca_cert: None,
            client_cert: None,
            client_key: None,
            authority_override: None,
        }
    }
}

/// Authentication configuration (resolved, ready to use)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AuthConfig {
    /// Bearer token authentication (Authorization: Bearer <token>)
    Bearer { token: String },
}

/// Retry configuration with exponential backoff
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,

    /// Initial backoff duration in milliseconds
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Maximum backoff duration in milliseconds
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Backoff multiplier
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_max_chunk_size_bytes() -> usize {
    crate::chunker::DEFAULT_CHUNK_SIZE
}

fn default_max_batch_inputs() -> usize {
    100
}

fn default_max_batch_size_bytes() -> u64 {
    10 * 1024 * 1024
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_max_attempts() -> usize {
    3
}

fn default_initial_backoff_ms() -> u64 {
    100
}

fn default_max_backoff_ms() -> u64 {
    10000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}
