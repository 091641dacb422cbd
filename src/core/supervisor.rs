//! Connection Supervisor
//!
//! Keeps exactly one forward request subscription alive and feeds it to a
//! [`DecisionEngine`].
//!
//! # States
//!
//! ```text
//! Idle -> Connecting -> Connected -> Error -> Backoff -> Connecting ...
//!                                         \-> Terminated
//! ```
//!
//! Every failure (bad settings, unreachable node, stream error, stream end)
//! tears the session down completely, marks the node disconnected and counts
//! one attempt. The delay before the next attempt is `base * attempt^2`; at
//! the attempt ceiling the supervisor terminates and stays disconnected.
//! A successful connection resets the counter.
//!
//! # Usage
//!
//! ```ignore
//! let supervisor = Supervisor::new(settings, connector, authorizer)
//!     .with_shutdown(shutdown.clone());
//! let connectivity = supervisor.connectivity();
//! let handle = supervisor.spawn();
//! ```

use std::sync::Arc;
use std::time::Duration;

use bitcoin::secp256k1::PublicKey;
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use tokio::task::JoinHandle;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::connectivity::{ConnectivityHandle, ConnectivityState};
use super::decision::{Decision, DecisionEngine};
use super::error::SupervisorError;
use super::provider::{
    Authorizer, NodeConnector, NodeIdentity, NodeSession, NoOpEventEmitter, SettingsSource,
    Sleeper, SupervisorEventEmitter, TokioSleeper,
};
use super::retry::{BackoffDecision, RetryPolicy, RetryState};
use crate::primitives::ShortChannelId;

// ============================================================================
// Phases and Events
// ============================================================================

/// Which state the supervisor is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorPhase {
    Idle,
    Connecting,
    Connected,
    Error,
    Backoff,
    Terminated,
}

impl SupervisorPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SupervisorPhase::Terminated)
    }
}

impl std::fmt::Display for SupervisorPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SupervisorPhase::Idle => write!(f, "idle"),
            SupervisorPhase::Connecting => write!(f, "connecting"),
            SupervisorPhase::Connected => write!(f, "connected"),
            SupervisorPhase::Error => write!(f, "error"),
            SupervisorPhase::Backoff => write!(f, "backoff"),
            SupervisorPhase::Terminated => write!(f, "terminated"),
        }
    }
}

/// Transitions emitted for observability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    Connecting {
        attempt: u32,
    },
    Connected {
        alias: String,
        pubkey: PublicKey,
    },
    SubscriptionOpened {
        target_channel: ShortChannelId,
    },
    /// No session was established (settings, connect or identity).
    ConnectFailed {
        error: String,
    },
    /// The session was torn down; no listener of it is left.
    SessionClosed {
        error: String,
    },
    Backoff {
        attempt: u32,
        delay: Duration,
    },
    Terminated {
        attempts: u32,
    },
    Stopped,
}

// ============================================================================
// Session
// ============================================================================

/// One connected node session, before its subscription is opened.
struct NodeLink {
    session: Arc<dyn NodeSession>,
    identity: NodeIdentity,
    target_channel: ShortChannelId,
    created_at: DateTime<Utc>,
}

// ============================================================================
// Supervisor
// ============================================================================

pub struct Supervisor {
    settings: Arc<dyn SettingsSource>,
    connector: Arc<dyn NodeConnector>,
    authorizer: Arc<dyn Authorizer>,
    sleeper: Arc<dyn Sleeper>,
    event_emitter: Arc<dyn SupervisorEventEmitter>,
    policy: RetryPolicy,
    retry: RetryState,
    phase: SupervisorPhase,
    connectivity: ConnectivityState,
    shutdown: CancellationToken,
}

impl Supervisor {
    /// Creates a supervisor with the default retry policy, the tokio timer
    /// and no event emitter.
    pub fn new(
        settings: Arc<dyn SettingsSource>,
        connector: Arc<dyn NodeConnector>,
        authorizer: Arc<dyn Authorizer>,
    ) -> Self {
        Self {
            settings,
            connector,
            authorizer,
            sleeper: Arc::new(TokioSleeper),
            event_emitter: Arc::new(NoOpEventEmitter),
            policy: RetryPolicy::default(),
            retry: RetryState::new(),
            phase: SupervisorPhase::Idle,
            connectivity: ConnectivityState::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_event_emitter(mut self, event_emitter: Arc<dyn SupervisorEventEmitter>) -> Self {
        self.event_emitter = event_emitter;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Cancelling `shutdown` tears down the active session and makes
    /// [`Supervisor::run`] return `Ok(())`.
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Read-only view of the connectivity flag, for health checks.
    pub fn connectivity(&self) -> ConnectivityHandle {
        self.connectivity.handle()
    }

    pub fn phase(&self) -> SupervisorPhase {
        self.phase
    }

    pub fn retry_state(&self) -> &RetryState {
        &self.retry
    }

    /// Runs the supervisor as a background task.
    pub fn spawn(self) -> JoinHandle<Result<(), SupervisorError>> {
        tokio::spawn(self.run())
    }

    /// Drives the state machine until shutdown or retry exhaustion.
    pub async fn run(mut self) -> Result<(), SupervisorError> {
        debug!(
            "Supervisor started (base_delay={:?}, max_attempts={})",
            self.policy.base_delay, self.policy.max_attempts
        );

        loop {
            self.transition(SupervisorPhase::Connecting);
            self.event_emitter
                .emit(SupervisorEvent::Connecting {
                    attempt: self.retry.attempt(),
                })
                .await;

            let connected = tokio::select! {
                _ = self.shutdown.cancelled() => return self.stop().await,
                connected = self.connect() => connected,
            };

            match connected {
                Ok(link) => {
                    self.connectivity.set_connected(true);
                    self.retry.reset();
                    self.transition(SupervisorPhase::Connected);
                    self.event_emitter
                        .emit(SupervisorEvent::Connected {
                            alias: link.identity.alias.clone(),
                            pubkey: link.identity.pubkey,
                        })
                        .await;

                    // `serve` only returns after the subscription is dropped
                    // and its tasks are gone.
                    if let Err(error) = self.serve(link).await {
                        self.connectivity.set_connected(false);
                        self.transition(SupervisorPhase::Error);
                        error!("Forward request session failed: {}", error);
                        self.event_emitter
                            .emit(SupervisorEvent::SessionClosed {
                                error: error.to_string(),
                            })
                            .await;
                    } else {
                        return self.stop().await;
                    }
                }
                Err(error) => {
                    self.connectivity.set_connected(false);
                    self.transition(SupervisorPhase::Error);
                    error!("Connection attempt failed: {}", error);
                    self.event_emitter
                        .emit(SupervisorEvent::ConnectFailed {
                            error: error.to_string(),
                        })
                        .await;
                }
            }

            match self.retry.record_failure(&self.policy) {
                BackoffDecision::Retry { attempt, delay } => {
                    self.transition(SupervisorPhase::Backoff);
                    warn!(
                        "Restarting subscription (Retry: {}) after {} ms",
                        attempt,
                        delay.as_millis()
                    );
                    self.event_emitter
                        .emit(SupervisorEvent::Backoff { attempt, delay })
                        .await;

                    tokio::select! {
                        _ = self.shutdown.cancelled() => return self.stop().await,
                        _ = self.sleeper.sleep(delay) => {}
                    }
                    warn!("Restarting...");
                }
                BackoffDecision::Exhausted { attempts } => {
                    self.transition(SupervisorPhase::Terminated);
                    self.connectivity.set_terminated();
                    error!(
                        "Subscriptions failed: giving up after {} consecutive failures",
                        attempts
                    );
                    self.event_emitter
                        .emit(SupervisorEvent::Terminated { attempts })
                        .await;
                    return Err(SupervisorError::RetryExhausted { attempts });
                }
            }
        }
    }

    /// Reads settings, connects and fetches the node identity.
    async fn connect(&self) -> Result<NodeLink, SupervisorError> {
        let settings = self.settings.load().map_err(|e| {
            error!("Unable to load node settings: {:#}", e);
            SupervisorError::Configuration(format!("{:#}", e))
        })?;

        if settings.credentials.cert.is_none() {
            if self.connector.requires_certificate() {
                error!("No certificate provided and the node client cannot connect without one");
                return Err(SupervisorError::Configuration(
                    "no TLS certificate configured; this node client requires one".to_string(),
                ));
            }
            warn!("No certificate provided. Make sure you dont need it to connect to your node.");
        }

        let socket = settings.credentials.socket.clone();
        let session = self
            .connector
            .connect(&settings.credentials)
            .await
            .map_err(|e| {
                error!("Error connecting to node at {}: {:#}", socket, e);
                SupervisorError::Connection(format!("{:#}", e))
            })?;

        let identity = session.get_identity().await.map_err(|e| {
            error!("Error fetching node identity from {}: {:#}", socket, e);
            SupervisorError::Connection(format!("{:#}", e))
        })?;

        info!(
            "Successfully connected to node {} ({})",
            identity.alias, identity.pubkey
        );

        Ok(NodeLink {
            session,
            identity,
            target_channel: settings.target_channel,
            created_at: Utc::now(),
        })
    }

    /// Consumes forward requests until the stream fails, ends, or shutdown
    /// is requested. Returns `Ok(())` only for shutdown.
    ///
    /// The subscription and every decision task of this session are gone
    /// when this returns, on all paths.
    async fn serve(&self, link: NodeLink) -> Result<(), SupervisorError> {
        let mut subscription = link
            .session
            .subscribe_forward_requests()
            .await
            .map_err(|e| SupervisorError::Stream(format!("subscribe failed: {:#}", e)))?;

        let engine = Arc::new(DecisionEngine::new(
            link.target_channel,
            link.session.signer(),
            Arc::clone(&self.authorizer),
        ));

        info!(
            "Listening for forward requests to {} on {}",
            link.target_channel, link.identity.alias
        );
        self.event_emitter
            .emit(SupervisorEvent::SubscriptionOpened {
                target_channel: link.target_channel,
            })
            .await;

        let mut tasks: JoinSet<Decision> = JoinSet::new();
        let outcome = loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break Ok(()),
                item = subscription.next() => match item {
                    Some(Ok(request)) => {
                        let engine = Arc::clone(&engine);
                        tasks.spawn(async move { engine.handle(request).await });
                    }
                    Some(Err(e)) => {
                        error!("Error in forward request subscription: {:#}", e);
                        break Err(SupervisorError::Stream(format!("{:#}", e)));
                    }
                    None => {
                        error!("Forward request subscription ended");
                        break Err(SupervisorError::Stream(
                            "forward request stream ended".to_string(),
                        ));
                    }
                },
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!("Forward decision task failed: {}", e);
                    }
                }
            }
        };

        // Abort whatever is still deciding while the stream is open, so the
        // rejects of aborted decisions still reach the node. Then detach.
        let in_flight = tasks.len();
        tasks.shutdown().await;
        subscription.close();
        debug!(
            "Session with {} closed after {}s, {} decisions aborted",
            link.identity.alias,
            (Utc::now() - link.created_at).num_seconds(),
            in_flight
        );
        drop(link);

        outcome
    }

    async fn stop(&mut self) -> Result<(), SupervisorError> {
        info!("Supervisor shutting down");
        self.connectivity.set_connected(false);
        self.transition(SupervisorPhase::Idle);
        self.event_emitter.emit(SupervisorEvent::Stopped).await;
        Ok(())
    }

    fn transition(&mut self, phase: SupervisorPhase) {
        debug!("Supervisor {} -> {}", self.phase, phase);
        self.phase = phase;
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::provider::{
        AuthorizationRecord, ConnectionSettings, MessageSigner, NodeCredentials,
    };
    use crate::core::subscription::ForwardSubscription;
    use crate::primitives::{PaymentHash, Signature};
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    // ========================================================================
    // Mocks
    // ========================================================================

    fn test_pubkey() -> PublicKey {
        "0279be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798"
            .parse()
            .unwrap()
    }

    struct StaticSettings(Option<ConnectionSettings>);

    impl SettingsSource for StaticSettings {
        fn load(&self) -> Result<ConnectionSettings> {
            self.0.clone().ok_or_else(|| anyhow!("macaroon missing"))
        }
    }

    fn good_settings() -> StaticSettings {
        StaticSettings(Some(ConnectionSettings {
            credentials: NodeCredentials {
                socket: "127.0.0.1:10009".to_string(),
                macaroon: vec![1, 2, 3],
                cert: None,
            },
            target_channel: "1052673x257x257".parse().unwrap(),
        }))
    }

    struct NullSigner;

    #[async_trait]
    impl MessageSigner for NullSigner {
        async fn sign_message(&self, _message: &[u8]) -> Result<Signature> {
            Ok(Signature("sig".to_string()))
        }
    }

    /// Session whose subscription fails immediately.
    struct FailingStreamSession;

    #[async_trait]
    impl NodeSession for FailingStreamSession {
        async fn get_identity(&self) -> Result<NodeIdentity> {
            Ok(NodeIdentity {
                alias: "alice".to_string(),
                pubkey: test_pubkey(),
            })
        }

        fn signer(&self) -> Arc<dyn MessageSigner> {
            Arc::new(NullSigner)
        }

        async fn subscribe_forward_requests(&self) -> Result<ForwardSubscription> {
            let (feed, subscription) = ForwardSubscription::channel(1);
            feed.fail(anyhow!("stream reset")).await;
            Ok(subscription)
        }
    }

    struct MockConnector {
        attempts: AtomicU32,
        succeed: bool,
    }

    #[async_trait]
    impl NodeConnector for MockConnector {
        async fn connect(&self, _credentials: &NodeCredentials) -> Result<Arc<dyn NodeSession>> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.succeed {
                Ok(Arc::new(FailingStreamSession))
            } else {
                Err(anyhow!("connection refused"))
            }
        }
    }

    struct NeverAuthorizes;

    #[async_trait]
    impl Authorizer for NeverAuthorizes {
        async fn authorize(&self, _: &PaymentHash, _: &Signature) -> Option<AuthorizationRecord> {
            None
        }
    }

    #[derive(Default)]
    struct RecordingSleeper {
        delays: Mutex<Vec<Duration>>,
    }

    #[async_trait]
    impl Sleeper for RecordingSleeper {
        async fn sleep(&self, duration: Duration) {
            self.delays.lock().unwrap().push(duration);
            tokio::task::yield_now().await;
        }
    }

    fn supervisor(
        settings: StaticSettings,
        connector: Arc<MockConnector>,
        sleeper: Arc<RecordingSleeper>,
    ) -> Supervisor {
        Supervisor::new(Arc::new(settings), connector, Arc::new(NeverAuthorizes))
            .with_sleeper(sleeper)
    }

    // ========================================================================
    // Tests
    // ========================================================================

    #[test]
    fn test_new_supervisor_is_idle_and_disconnected() {
        let connector = Arc::new(MockConnector {
            attempts: AtomicU32::new(0),
            succeed: true,
        });
        let sup = supervisor(good_settings(), connector, Arc::default());

        assert_eq!(sup.phase(), SupervisorPhase::Idle);
        assert!(!sup.connectivity().is_connected());
        assert_eq!(sup.retry_state().attempt(), 0);
    }

    #[tokio::test]
    async fn test_connection_failures_exhaust_after_six_attempts() {
        let connector = Arc::new(MockConnector {
            attempts: AtomicU32::new(0),
            succeed: false,
        });
        let sleeper = Arc::new(RecordingSleeper::default());
        let sup = supervisor(good_settings(), connector.clone(), sleeper.clone());
        let connectivity = sup.connectivity();

        let result = sup.run().await;

        assert!(matches!(
            result,
            Err(SupervisorError::RetryExhausted { attempts: 6 })
        ));
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 6);
        assert_eq!(
            *sleeper.delays.lock().unwrap(),
            vec![
                Duration::from_secs(5),
                Duration::from_secs(20),
                Duration::from_secs(45),
                Duration::from_secs(80),
                Duration::from_secs(125),
            ]
        );
        assert!(!connectivity.is_connected());
        assert!(connectivity.is_terminated());
    }

    #[tokio::test]
    async fn test_missing_settings_count_as_failures() {
        let connector = Arc::new(MockConnector {
            attempts: AtomicU32::new(0),
            succeed: true,
        });
        let sleeper = Arc::new(RecordingSleeper::default());
        let sup = supervisor(StaticSettings(None), connector.clone(), sleeper.clone());

        let result = sup.run().await;

        assert!(matches!(
            result,
            Err(SupervisorError::RetryExhausted { attempts: 6 })
        ));
        // Never got as far as the node.
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 0);
        // Same backoff as any other failure.
        assert_eq!(sleeper.delays.lock().unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_missing_certificate_fails_before_connecting() {
        struct CertOnlyConnector {
            attempts: AtomicU32,
        }

        #[async_trait]
        impl NodeConnector for CertOnlyConnector {
            async fn connect(
                &self,
                _credentials: &NodeCredentials,
            ) -> Result<Arc<dyn NodeSession>> {
                self.attempts.fetch_add(1, Ordering::SeqCst);
                Ok(Arc::new(FailingStreamSession))
            }

            fn requires_certificate(&self) -> bool {
                true
            }
        }

        let connector = Arc::new(CertOnlyConnector {
            attempts: AtomicU32::new(0),
        });
        let sleeper = Arc::new(RecordingSleeper::default());
        // good_settings() carries no certificate.
        let sup = Supervisor::new(
            Arc::new(good_settings()),
            connector.clone(),
            Arc::new(NeverAuthorizes),
        )
        .with_sleeper(sleeper.clone());

        let result = sup.run().await;

        assert!(matches!(
            result,
            Err(SupervisorError::RetryExhausted { attempts: 6 })
        ));
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 0);
        assert_eq!(sleeper.delays.lock().unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_successful_connections_reset_the_counter() {
        // Every connection succeeds and its stream fails right away, so the
        // counter never climbs past one and the ceiling is never reached.
        let connector = Arc::new(MockConnector {
            attempts: AtomicU32::new(0),
            succeed: true,
        });
        let sleeper = Arc::new(RecordingSleeper::default());
        let shutdown = CancellationToken::new();
        let sup = supervisor(good_settings(), connector.clone(), sleeper.clone())
            .with_shutdown(shutdown.clone());

        let handle = sup.spawn();
        while connector.attempts.load(Ordering::SeqCst) < 10 {
            tokio::task::yield_now().await;
        }
        shutdown.cancel();

        assert!(handle.await.unwrap().is_ok());
        let delays = sleeper.delays.lock().unwrap();
        assert!(delays.len() >= 9);
        assert!(delays.iter().all(|d| *d == Duration::from_secs(5)));
    }

    #[tokio::test]
    async fn test_shutdown_during_backoff_stops_cleanly() {
        struct BlockingSleeper;

        #[async_trait]
        impl Sleeper for BlockingSleeper {
            async fn sleep(&self, _duration: Duration) {
                std::future::pending::<()>().await;
            }
        }

        let connector = Arc::new(MockConnector {
            attempts: AtomicU32::new(0),
            succeed: false,
        });
        let shutdown = CancellationToken::new();
        let sup = Supervisor::new(
            Arc::new(good_settings()),
            connector.clone(),
            Arc::new(NeverAuthorizes),
        )
        .with_sleeper(Arc::new(BlockingSleeper))
        .with_shutdown(shutdown.clone());
        let connectivity = sup.connectivity();

        let handle = sup.spawn();
        while connector.attempts.load(Ordering::SeqCst) < 1 {
            tokio::task::yield_now().await;
        }
        shutdown.cancel();

        assert!(handle.await.unwrap().is_ok());
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 1);
        assert!(!connectivity.is_connected());
        assert!(!connectivity.is_terminated());
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(SupervisorPhase::Backoff.to_string(), "backoff");
        assert!(SupervisorPhase::Terminated.is_terminal());
        assert!(!SupervisorPhase::Error.is_terminal());
    }
}
