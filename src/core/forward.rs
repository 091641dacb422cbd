//! Forward requests and their exactly-once resolution.
//!
//! A node adapter turns every intercepted HTLC into a [`ForwardRequest`]
//! carrying the immutable [`ForwardRequestEvent`] and a responder back to the
//! node. Resolving consumes the request, so a second resolution does not
//! type-check. A request that is dropped unresolved (an aborted decision
//! task, a panic) rejects itself, so the HTLC is never left hanging.

use log::warn;
use tokio::sync::mpsc;

use crate::primitives::{Msat, PaymentHash, Preimage, ShortChannelId};

/// Identifies an incoming HTLC on the node: incoming channel plus HTLC id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CircuitKey {
    pub chan_id: u64,
    pub htlc_id: u64,
}

impl std::fmt::Display for CircuitKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", ShortChannelId::from(self.chan_id), self.htlc_id)
    }
}

/// A single HTLC forward attempt as reported by the node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardRequestEvent {
    pub circuit_key: CircuitKey,
    pub in_channel: ShortChannelId,
    pub out_channel: ShortChannelId,
    pub payment_hash: PaymentHash,
    /// Amount that would be forwarded on the outgoing channel.
    pub amount_msat: Msat,
    /// Incoming minus outgoing amount.
    pub fee_msat: Msat,
}

/// The terminal action taken on a forward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardResolution {
    /// Let the node forward the HTLC as usual.
    Accept,
    /// Fail the HTLC back upstream.
    Reject,
    /// Settle the HTLC locally with the given preimage.
    Settle { preimage: Preimage },
}

impl ForwardResolution {
    pub fn name(&self) -> &'static str {
        match self {
            ForwardResolution::Accept => "accept",
            ForwardResolution::Reject => "reject",
            ForwardResolution::Settle { .. } => "settle",
        }
    }
}

/// What travels back to the node adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardResponse {
    pub circuit_key: CircuitKey,
    pub resolution: ForwardResolution,
}

/// Sending half handed to every request of one subscription.
pub type ForwardResponder = mpsc::UnboundedSender<ForwardResponse>;

/// A forward waiting for its resolution.
pub struct ForwardRequest {
    event: ForwardRequestEvent,
    /// `None` once resolved.
    responder: Option<ForwardResponder>,
}

impl ForwardRequest {
    pub fn new(event: ForwardRequestEvent, responder: ForwardResponder) -> Self {
        Self {
            event,
            responder: Some(responder),
        }
    }

    pub fn event(&self) -> &ForwardRequestEvent {
        &self.event
    }

    pub fn accept(self) -> bool {
        self.resolve(ForwardResolution::Accept)
    }

    pub fn reject(self) -> bool {
        self.resolve(ForwardResolution::Reject)
    }

    pub fn settle(self, preimage: Preimage) -> bool {
        self.resolve(ForwardResolution::Settle { preimage })
    }

    /// Sends the resolution and consumes the request.
    ///
    /// Returns `false` if the subscription is already gone; the node then
    /// replays the HTLC to the next interceptor.
    pub fn resolve(mut self, resolution: ForwardResolution) -> bool {
        self.send(resolution)
    }

    fn send(&mut self, resolution: ForwardResolution) -> bool {
        let Some(responder) = self.responder.take() else {
            return false;
        };
        responder
            .send(ForwardResponse {
                circuit_key: self.event.circuit_key,
                resolution,
            })
            .is_ok()
    }
}

impl Drop for ForwardRequest {
    fn drop(&mut self) {
        if self.responder.is_some() {
            warn!(
                "Forward {} dropped without a resolution, rejecting",
                self.event.circuit_key
            );
            let _ = self.send(ForwardResolution::Reject);
        }
    }
}

impl std::fmt::Debug for ForwardRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForwardRequest")
            .field("event", &self.event)
            .field("resolved", &self.responder.is_none())
            .finish()
    }
}
