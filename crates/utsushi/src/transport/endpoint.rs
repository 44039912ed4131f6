//! Iroh endpoint wrapper for utsushi

use anyhow::Result;
use iroh::endpoint::{Connection, Endpoint, RelayMode};
use iroh::EndpointAddr;
use tracing::warn;

use crate::identity::Identity;
use crate::peer::PeerId;
use crate::protocol::ALPN;

/// Wrapper around an iroh [`Endpoint`] speaking the utsushi ALPN
pub struct SessionEndpoint {
    endpoint: Endpoint,
}

impl SessionEndpoint {
    pub async fn bind(identity: &Identity, relay_mode: RelayMode) -> Result<Self> {
        let endpoint = Endpoint::builder()
            .secret_key(identity.secret_key().clone())
            .relay_mode(relay_mode)
            .alpns(vec![ALPN.to_vec()])
            .bind()
            .await?;

        Ok(Self { endpoint })
    }

    pub fn peer_id(&self) -> PeerId {
        PeerId::from(self.endpoint.secret_key().public())
    }

    /// Addressing information a remote needs to dial this endpoint
    pub fn addr(&self) -> EndpointAddr {
        self.endpoint.addr()
    }

    /// Connect to a remote endpoint.
    ///
    /// A bare id is resolved through iroh's discovery services.
    pub async fn connect(&self, addr: EndpointAddr) -> Result<Connection> {
        let conn = self.endpoint.connect(addr, ALPN).await?;
        Ok(conn)
    }

    /// Accept an incoming connection
    ///
    /// Returns None only if the endpoint is closed.
    /// Transient handshake failures are logged and retried.
    pub async fn accept(&self) -> Option<Connection> {
        loop {
            let incoming = self.endpoint.accept().await?;
            match incoming.await {
                Ok(conn) => return Some(conn),
                Err(e) => {
                    warn!("Incoming connection handshake failed: {e}");
                    continue;
                }
            }
        }
    }

    pub async fn close(&self) {
        self.endpoint.close().await;
    }
}
