//! gRPC channel management for the remote cache endpoint

use crate::config::{AuthConfig, RemoteConfig, TlsConfig};
use crate::error::{RemoteError, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tonic::metadata::{AsciiMetadataValue, MetadataMap};
use tonic::service::Interceptor;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint, Identity};
use tracing::{debug, info};

/// Shared gRPC channel for both cache services
#[derive(Clone)]
pub struct GrpcChannel {
    inner: Channel,
    config: Arc<RemoteConfig>,
}

impl GrpcChannel {
    /// Create a new gRPC channel from configuration
    pub async fn connect(config: &RemoteConfig) -> Result<Self> {
        let endpoint = create_endpoint(config)?;

        info!(endpoint = %config.endpoint, "Connecting to remote cache");

        let channel = endpoint
            .connect()
            .await
            .map_err(|e| RemoteError::connection_failed(&config.endpoint, e.to_string()))?;

        debug!("Successfully connected to remote cache");

        Ok(Self {
            inner: channel,
            config: Arc::new(config.clone()),
        })
    }

    /// Create a channel that connects on first use
    pub fn connect_lazy(config: &RemoteConfig) -> Result<Self> {
        let endpoint = create_endpoint(config)?;
        Ok(Self {
            inner: endpoint.connect_lazy(),
            config: Arc::new(config.clone()),
        })
    }

    /// Get the raw channel for creating service clients
    pub fn channel(&self) -> Channel {
        self.inner.clone()
    }

    /// Create an interceptor with auth headers for this channel
    pub fn auth_interceptor(&self) -> AuthInterceptor {
        AuthInterceptor::new(&self.config)
    }
}

/// Interceptor that adds the authorization header to requests
#[derive(Clone)]
pub struct AuthInterceptor {
    bearer: Option<AsciiMetadataValue>,
}

impl AuthInterceptor {
    /// Create a new auth interceptor from config
    pub fn new(config: &RemoteConfig) -> Self {
        let bearer = config.auth.as_ref().and_then(|auth| match auth {
            AuthConfig::Bearer { token } => {
                match AsciiMetadataValue::try_from(&format!("Bearer {token}")) {
                    Ok(value) => Some(value),
                    Err(e) => {
                        tracing::error!(
                            error = %e,
                            "Bearer token contains invalid characters, proceeding without auth"
                        );
                        None
                    }
                }
            }
        });

        Self { bearer }
    }

    /// Apply auth headers to a metadata map
    pub fn apply_to_metadata(&self, metadata: &mut MetadataMap) {
        if let Some(header) = &self.bearer {
            metadata.insert("authorization", header.clone());
        }
    }
}

impl Interceptor for AuthInterceptor {
    fn call(
        &mut self,
        mut request: tonic::Request<()>,
    ) -> std::result::Result<tonic::Request<()>, tonic::Status> {
        self.apply_to_metadata(request.metadata_mut());
        Ok(request)
    }
}

/// Normalize the configured endpoint to an `http(s)://` URI.
///
/// `grpcs://` and `grpc://` map to `https://` and `http://`; a bare
/// `host:port` uses TLS only when TLS is enabled.
fn normalize_endpoint(config: &RemoteConfig) -> String {
    let endpoint = config.endpoint.trim();
    if let Some(rest) = endpoint.strip_prefix("grpcs://") {
        format!("https://{rest}")
    } else if let Some(rest) = endpoint.strip_prefix("grpc://") {
        format!("http://{rest}")
    } else if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        endpoint.to_string()
    } else if config.tls_enabled() {
        format!("https://{endpoint}")
    } else {
        format!("http://{endpoint}")
    }
}

/// Create a tonic Endpoint from RemoteConfig
fn create_endpoint(config: &RemoteConfig) -> Result<Endpoint> {
    let uri = normalize_endpoint(config);

    debug!(original = %config.endpoint, normalized = %uri, "Normalizing endpoint URL");

    let mut endpoint = Endpoint::from_shared(uri.clone()).map_err(|e| {
        RemoteError::config_error(format!("Invalid endpoint '{}': {}", config.endpoint, e))
    })?;

    // Unary calls and whole streams are bounded by the configured timeout
    endpoint = endpoint
        .timeout(config.timeout())
        .connect_timeout(Duration::from_secs(30));

    if uri.starts_with("https://") {
        let default_tls = TlsConfig::default();
        let tls = tls_config(config.tls.as_ref().unwrap_or(&default_tls))?;
        endpoint = endpoint
            .tls_config(tls)
            .map_err(|e| RemoteError::config_error(format!("TLS configuration error: {}", e)))?;
    }

    // Configure keep-alive for long-running connections
    endpoint = endpoint
        .http2_keep_alive_interval(Duration::from_secs(30))
        .keep_alive_timeout(Duration::from_secs(10))
        .keep_alive_while_idle(true);

    Ok(endpoint)
}

fn tls_config(tls: &TlsConfig) -> Result<ClientTlsConfig> {
    let mut config = match &tls.ca_cert {
        Some(path) => ClientTlsConfig::new().ca_certificate(Certificate::from_pem(read_pem(path)?)),
        None => ClientTlsConfig::new().with_native_roots(),
    };

    match (&tls.client_cert, &tls.client_key) {
        (Some(cert), Some(key)) => {
            config = config.identity(Identity::from_pem(read_pem(cert)?, read_pem(key)?));
        }
        (None, None) => {}
        _ => {
            return Err(RemoteError::config_error(
                "tls.client_cert and tls.client_key must be set together",
            ));
        }
    }

    if let Some(authority) = &tls.authority_override {
        config = config.domain_name(authority.clone());
    }
    Ok(config)
}

fn read_pem(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|e| RemoteError::io("read TLS material", path, e))
}
