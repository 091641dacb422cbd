use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bitcoin::secp256k1::PublicKey;

use crate::core::subscription::ForwardSubscription;
use crate::core::supervisor::SupervisorEvent;
use crate::primitives::{Msat, PaymentHash, Preimage, ShortChannelId, Signature};

// ============================================================================
// Settings
// ============================================================================

/// Credentials needed to open an authenticated node connection.
#[derive(Clone, PartialEq, Eq)]
pub struct NodeCredentials {
    /// `host:port` of the node's gRPC interface.
    pub socket: String,
    /// Raw macaroon bytes.
    pub macaroon: Vec<u8>,
    /// PEM encoded TLS certificate, when the node needs one pinned.
    pub cert: Option<Vec<u8>>,
}

impl std::fmt::Debug for NodeCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeCredentials")
            .field("socket", &self.socket)
            .field("macaroon", &"<redacted>")
            .field("cert", &self.cert.as_ref().map(|c| c.len()))
            .finish()
    }
}

/// Everything read at the start of a connection attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub credentials: NodeCredentials,
    /// Forwards to this channel are ghost payments.
    pub target_channel: ShortChannelId,
}

/// Source of [`ConnectionSettings`]. Consulted on every attempt, never
/// cached across reconnects.
pub trait SettingsSource: Send + Sync {
    fn load(&self) -> Result<ConnectionSettings>;
}

// ============================================================================
// Node Client
// ============================================================================

/// Identity of the connected node, for observability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeIdentity {
    pub alias: String,
    pub pubkey: PublicKey,
}

#[async_trait]
pub trait NodeConnector: Send + Sync {
    /// Opens an authenticated session with the node.
    async fn connect(&self, credentials: &NodeCredentials) -> Result<Arc<dyn NodeSession>>;

    /// Whether `connect` can only succeed with a TLS certificate.
    fn requires_certificate(&self) -> bool {
        false
    }
}

/// Signs arbitrary messages with the node key.
#[async_trait]
pub trait MessageSigner: Send + Sync {
    async fn sign_message(&self, message: &[u8]) -> Result<Signature>;
}

/// One live, authenticated node connection.
#[async_trait]
pub trait NodeSession: Send + Sync {
    async fn get_identity(&self) -> Result<NodeIdentity>;

    /// The signing capability bound to this session.
    fn signer(&self) -> Arc<dyn MessageSigner>;

    /// Opens the forward request stream. Dropping the returned handle
    /// closes it.
    async fn subscribe_forward_requests(&self) -> Result<ForwardSubscription>;
}

// ============================================================================
// Authorization Client
// ============================================================================

/// Authorization for settling one ghost payment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationRecord {
    /// `None` when the service answered without a preimage.
    pub preimage: Option<Preimage>,
    /// Minimum amount the forward must carry.
    pub payment_amount: Msat,
}

#[async_trait]
pub trait Authorizer: Send + Sync {
    /// Looks up the authorization for `payment_hash`.
    ///
    /// Transport and service errors are logged and reported as `None`.
    async fn authorize(
        &self,
        payment_hash: &PaymentHash,
        signature: &Signature,
    ) -> Option<AuthorizationRecord>;
}

// ============================================================================
// Time
// ============================================================================

/// Delay abstraction so backoff can be driven without real time in tests.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Sleeps on the tokio timer.
#[derive(Debug, Clone, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

// ============================================================================
// Supervisor Events
// ============================================================================

/// Trait for observing supervisor transitions (telemetry, tests).
///
/// Implementations should be fast and non-blocking.
#[async_trait]
pub trait SupervisorEventEmitter: Send + Sync {
    async fn emit(&self, event: SupervisorEvent);
}

/// No-op event emitter that discards all events.
#[derive(Debug, Clone, Default)]
pub struct NoOpEventEmitter;

#[async_trait]
impl SupervisorEventEmitter for NoOpEventEmitter {
    async fn emit(&self, _event: SupervisorEvent) {}
}
