//! Per-forward decision protocol.
//!
//! Forwards to any channel other than the target pass through. Forwards to
//! the target channel are ghost payments: the node signs the payment hash,
//! the authorization service is asked for the preimage, and the forward is
//! settled only if the service vouches for at most the forwarded amount and
//! hands out a preimage that actually unlocks the hash. Everything else is
//! rejected.

use std::sync::Arc;

use log::{debug, error, info};

use crate::core::error::RejectReason;
use crate::core::forward::{ForwardRequest, ForwardRequestEvent, ForwardResolution};
use crate::core::provider::{AuthorizationRecord, Authorizer, MessageSigner};
use crate::primitives::{Preimage, ShortChannelId};

/// Outcome of deciding one forward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Not a ghost payment.
    Accept,
    /// Authorized ghost payment.
    Settle(Preimage),
    Reject(RejectReason),
}

impl Decision {
    pub fn resolution(&self) -> ForwardResolution {
        match self {
            Decision::Accept => ForwardResolution::Accept,
            Decision::Settle(preimage) => ForwardResolution::Settle {
                preimage: *preimage,
            },
            Decision::Reject(_) => ForwardResolution::Reject,
        }
    }
}

/// Decides forwards for one node session.
///
/// Holds no per-event state, so any number of forwards can be decided
/// concurrently through a shared `Arc<DecisionEngine>`.
pub struct DecisionEngine {
    target_channel: ShortChannelId,
    signer: Arc<dyn MessageSigner>,
    authorizer: Arc<dyn Authorizer>,
}

impl DecisionEngine {
    pub fn new(
        target_channel: ShortChannelId,
        signer: Arc<dyn MessageSigner>,
        authorizer: Arc<dyn Authorizer>,
    ) -> Self {
        Self {
            target_channel,
            signer,
            authorizer,
        }
    }

    pub fn is_ghost(&self, event: &ForwardRequestEvent) -> bool {
        event.out_channel == self.target_channel
    }

    /// Decides and resolves `request`. The request is resolved exactly once
    /// on every path.
    pub async fn handle(&self, request: ForwardRequest) -> Decision {
        let event = request.event();
        debug!(
            "New forward request: amount={}, fee={}, in_channel={}, out_channel={}, payment_hash={}",
            event.amount_msat, event.fee_msat, event.in_channel, event.out_channel, event.payment_hash
        );

        let decision = self.decide(event).await;
        let payment_hash = event.payment_hash;

        match &decision {
            Decision::Accept => debug!("Accepting non ghost forward request"),
            Decision::Settle(_) => info!("Settled ghost payment {}", payment_hash),
            Decision::Reject(reason) => {
                error!("Rejecting ghost payment {}: {}", payment_hash, reason)
            }
        }

        if !request.resolve(decision.resolution()) {
            debug!(
                "Subscription closed before {} for {} could be delivered",
                decision.resolution().name(),
                payment_hash
            );
        }
        decision
    }

    /// Runs the decision protocol without resolving anything.
    pub async fn decide(&self, event: &ForwardRequestEvent) -> Decision {
        if !self.is_ghost(event) {
            return Decision::Accept;
        }

        info!(
            "Ghost payment candidate {} for {}",
            event.payment_hash, event.amount_msat
        );

        let payment_hash_hex = event.payment_hash.to_hex();
        let signature = match self.signer.sign_message(payment_hash_hex.as_bytes()).await {
            Ok(signature) => signature,
            Err(e) => return Decision::Reject(RejectReason::SigningFailed(e.to_string())),
        };

        let Some(record) = self.authorizer.authorize(&event.payment_hash, &signature).await
        else {
            return Decision::Reject(RejectReason::AuthorizationAbsent);
        };

        evaluate(event, &record)
    }
}

/// Checks an authorization record against the forward it was issued for.
pub fn evaluate(event: &ForwardRequestEvent, record: &AuthorizationRecord) -> Decision {
    if record.payment_amount > event.amount_msat {
        return Decision::Reject(RejectReason::Underpayment {
            expected: record.payment_amount,
            received: event.amount_msat,
        });
    }

    match record.preimage {
        Some(preimage) if preimage.unlocks(&event.payment_hash) => Decision::Settle(preimage),
        Some(_) => {
            error!(
                "Authorization preimage does not match payment hash {}",
                event.payment_hash
            );
            Decision::Reject(RejectReason::MissingPreimage)
        }
        None => Decision::Reject(RejectReason::MissingPreimage),
    }
}
