use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bitcoin::secp256k1::PublicKey;
use fedimint_tonic_lnd::lnrpc::{GetInfoRequest, SignMessageRequest};
use fedimint_tonic_lnd::Client;
use log::debug;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::interceptor;
use crate::core::provider::{
    MessageSigner, NodeConnector, NodeCredentials, NodeIdentity, NodeSession,
};
use crate::core::subscription::{ForwardSubscription, DEFAULT_SUBSCRIPTION_BUFFER};
use crate::primitives::Signature;

const CERT_FILE: &str = "tls.cert";
const MACAROON_FILE: &str = "admin.macaroon";

/// Prefixes `https://` unless the socket already names a scheme.
fn grpc_address(socket: &str) -> String {
    if socket.contains("://") {
        socket.to_string()
    } else {
        format!("https://{}", socket)
    }
}

fn write_secret(dir: &Path, name: &str, contents: &[u8]) -> Result<std::path::PathBuf> {
    let path = dir.join(name);
    std::fs::write(&path, contents)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(path)
}

// ============================================================================
// Connector
// ============================================================================

/// Opens gRPC connections to LND.
///
/// The client library loads credentials from files, so the decoded
/// certificate and macaroon are written to a private temporary directory
/// that only lives for the duration of the handshake.
#[derive(Debug, Clone, Default)]
pub struct LndConnector;

impl LndConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl NodeConnector for LndConnector {
    async fn connect(&self, credentials: &NodeCredentials) -> Result<Arc<dyn NodeSession>> {
        let cert = credentials
            .cert
            .as_deref()
            .ok_or_else(|| anyhow!("LND requires a TLS certificate"))?;

        let dir = tempfile::Builder::new()
            .prefix("ghost-forwarder-")
            .tempdir()
            .context("failed to create credentials directory")?;
        let cert_path = write_secret(dir.path(), CERT_FILE, cert)?;
        let macaroon_path = write_secret(dir.path(), MACAROON_FILE, &credentials.macaroon)?;

        let address = grpc_address(&credentials.socket);
        debug!("Connecting to LND at {}", address);
        let client = fedimint_tonic_lnd::connect(address.clone(), cert_path, macaroon_path)
            .await
            .map_err(|e| anyhow!("failed to connect to {}: {}", address, e))?;

        Ok(Arc::new(LndSession::new(client)))
    }

    // The client pins the node certificate it is given and has no
    // system-roots fallback.
    fn requires_certificate(&self) -> bool {
        true
    }
}

// ============================================================================
// Session
// ============================================================================

#[derive(Clone)]
pub struct LndSession {
    client: Client,
}

impl LndSession {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl NodeSession for LndSession {
    async fn get_identity(&self) -> Result<NodeIdentity> {
        let mut client = self.client.clone();
        let info = client
            .lightning()
            .get_info(GetInfoRequest {})
            .await
            .context("getinfo failed")?
            .into_inner();

        let pubkey: PublicKey = info
            .identity_pubkey
            .parse()
            .with_context(|| format!("invalid identity pubkey '{}'", info.identity_pubkey))?;

        Ok(NodeIdentity {
            alias: info.alias,
            pubkey,
        })
    }

    fn signer(&self) -> Arc<dyn MessageSigner> {
        Arc::new(LndSigner {
            client: self.client.clone(),
        })
    }

    async fn subscribe_forward_requests(&self) -> Result<ForwardSubscription> {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let mut client = self.client.clone();
        let intercepted = client
            .router()
            .htlc_interceptor(UnboundedReceiverStream::new(outbound_rx))
            .await
            .context("failed to open HTLC interceptor")?
            .into_inner();

        let (feed, subscription) = ForwardSubscription::channel(DEFAULT_SUBSCRIPTION_BUFFER);
        tokio::spawn(interceptor::pump(intercepted, feed, outbound));

        Ok(subscription)
    }
}

// ============================================================================
// Signer
// ============================================================================

/// Signs with the node identity key via `SignMessage`.
#[derive(Clone)]
pub struct LndSigner {
    client: Client,
}

#[async_trait]
impl MessageSigner for LndSigner {
    async fn sign_message(&self, message: &[u8]) -> Result<Signature> {
        let mut client = self.client.clone();
        let response = client
            .lightning()
            .sign_message(SignMessageRequest {
                msg: message.to_vec(),
                ..Default::default()
            })
            .await
            .context("signmessage failed")?
            .into_inner();

        Ok(Signature(response.signature))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grpc_address() {
        assert_eq!(grpc_address("127.0.0.1:10009"), "https://127.0.0.1:10009");
        assert_eq!(grpc_address("https://lnd:10009"), "https://lnd:10009");
    }

    #[tokio::test]
    async fn test_connect_requires_cert() {
        let credentials = NodeCredentials {
            socket: "127.0.0.1:1".to_string(),
            macaroon: vec![1, 2, 3],
            cert: None,
        };
        let connector = LndConnector::new();
        assert!(connector.requires_certificate());
        let result = connector.connect(&credentials).await;
        assert!(result.is_err());
    }

    #[test]
    fn test_write_secret() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_secret(dir.path(), MACAROON_FILE, b"abc").unwrap();
        assert_eq!(std::fs::read(path).unwrap(), b"abc");
    }
}
