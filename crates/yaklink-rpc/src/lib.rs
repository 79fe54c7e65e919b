//! gRPC transport to the yak engine's control interface.
//!
//! The supervisor only needs one call from the engine's large API surface:
//! the echo round-trip the watchdog uses for liveness. [`EngineRpc`] is the
//! seam — the watchdog depends on the trait, tests substitute a mock, and
//! [`GrpcEngineRpc`] is the tonic-backed production implementation.

pub mod proto;

use async_trait::async_trait;
use thiserror::Error;
use tonic::metadata::MetadataValue;
use tonic::transport::{Certificate, Channel, ClientTlsConfig};
use tracing::debug;
use yaklink_core::EngineCredential;

use proto::yak_client::YakClient;
use proto::EchoRequest;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("invalid engine address: {0}")]
    InvalidAddress(String),

    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("engine returned status: {0}")]
    Status(#[from] tonic::Status),

    #[error("secret contains characters not representable in gRPC metadata")]
    InvalidSecret,
}

/// The engine call surface the supervisor depends on.
#[async_trait]
pub trait EngineRpc: Send + Sync {
    /// Send `text` and return whatever the engine echoes back. Transport
    /// failures and non-OK statuses are both errors; comparing the reply
    /// against the sent text is the caller's job.
    async fn echo(&self, text: &str) -> Result<String, RpcError>;
}

/// tonic-backed [`EngineRpc`] over a lazily connected channel.
///
/// Connection establishment is deferred to the first call so construction
/// never blocks; every echo therefore surfaces transport failures
/// individually, which is exactly what the watchdog counts.
pub struct GrpcEngineRpc {
    channel: Channel,
    auth: Option<MetadataValue<tonic::metadata::Ascii>>,
}

impl GrpcEngineRpc {
    pub fn new(credential: &EngineCredential) -> Result<Self, RpcError> {
        let scheme = if credential.tls { "https" } else { "http" };
        let uri = format!("{}://{}", scheme, credential.addr());

        let mut endpoint = Channel::from_shared(uri.clone())
            .map_err(|_| RpcError::InvalidAddress(uri.clone()))?;

        if credential.tls {
            let mut tls = ClientTlsConfig::new().domain_name(credential.host.clone());
            if let Some(pem) = &credential.ca_pem {
                tls = tls.ca_certificate(Certificate::from_pem(pem));
            }
            endpoint = endpoint.tls_config(tls)?;
        }

        let auth = if credential.secret.is_empty() {
            None
        } else {
            let value = MetadataValue::try_from(format!("bearer {}", credential.secret))
                .map_err(|_| RpcError::InvalidSecret)?;
            Some(value)
        };

        debug!(addr = %credential.addr(), tls = credential.tls, "engine rpc channel prepared");
        Ok(Self {
            channel: endpoint.connect_lazy(),
            auth,
        })
    }
}

#[async_trait]
impl EngineRpc for GrpcEngineRpc {
    async fn echo(&self, text: &str) -> Result<String, RpcError> {
        let mut client = YakClient::new(self.channel.clone());
        let mut request = tonic::Request::new(EchoRequest {
            text: text.to_string(),
        });
        if let Some(auth) = &self.auth {
            request.metadata_mut().insert("authorization", auth.clone());
        }
        let response = client.echo(request).await?;
        Ok(response.into_inner().result)
    }
}
