//! Connection Seam
//!
//! The gateway and worker are written against plain duplex byte streams so
//! tests can run them over in-memory pipes while deployments use TCP.

use async_trait::async_trait;
use mesh_runtime::{Result, RuntimeError};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

/// A duplex byte stream carrying envelope frames.
pub trait MeshStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> MeshStream for T {}

pub type BoxedStream = Box<dyn MeshStream>;

/// Produces one fresh connection to a gateway per call. The worker invokes
/// this again after every connection fault.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<BoxedStream>;
}

/// TCP connector for real deployments.
pub struct TcpConnector {
    address: String,
}

impl TcpConnector {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> Result<BoxedStream> {
        let stream = TcpStream::connect(&self.address).await.map_err(|e| {
            RuntimeError::transport_with_source(format!("connect to {} failed", self.address), e)
        })?;
        stream
            .set_nodelay(true)
            .map_err(|e| RuntimeError::transport_with_source("set_nodelay failed", e))?;
        debug!(address = %self.address, "Connected to gateway");
        Ok(Box::new(stream))
    }
}
