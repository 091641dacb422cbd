//! Bridges LND's `HtlcInterceptor` stream to [`ForwardSubscription`].
//!
//! The pump task owns both directions of the bidirectional gRPC stream:
//! intercepted HTLCs go out through a [`SubscriptionFeed`], resolutions come
//! back on an mpsc channel and are written to LND. It stops when the
//! subscription is dropped, when LND closes the stream, or on a stream
//! error (which is forwarded to the subscriber first).

use anyhow::{anyhow, Result};
use fedimint_tonic_lnd::routerrpc::{
    CircuitKey as LndCircuitKey, ForwardHtlcInterceptRequest, ForwardHtlcInterceptResponse,
    ResolveHoldForwardAction,
};
use log::{debug, warn};
use tokio::sync::mpsc;
use tokio_stream::{Stream, StreamExt};

use crate::core::forward::{
    CircuitKey, ForwardRequest, ForwardRequestEvent, ForwardResolution, ForwardResponder,
    ForwardResponse,
};
use crate::core::subscription::SubscriptionFeed;
use crate::primitives::{Msat, PaymentHash, ShortChannelId};

/// Maps an intercepted HTLC to a forward event.
pub fn to_forward_event(raw: &ForwardHtlcInterceptRequest) -> Result<ForwardRequestEvent> {
    let key = raw
        .incoming_circuit_key
        .as_ref()
        .ok_or_else(|| anyhow!("intercepted HTLC without circuit key"))?;
    let payment_hash = PaymentHash::from_slice(&raw.payment_hash).ok_or_else(|| {
        anyhow!(
            "payment hash must be 32 bytes, got {}",
            raw.payment_hash.len()
        )
    })?;

    Ok(ForwardRequestEvent {
        circuit_key: CircuitKey {
            chan_id: key.chan_id,
            htlc_id: key.htlc_id,
        },
        in_channel: ShortChannelId::from(key.chan_id),
        out_channel: ShortChannelId::from(raw.outgoing_requested_chan_id),
        payment_hash,
        amount_msat: Msat(raw.outgoing_amount_msat),
        fee_msat: Msat(
            raw.incoming_amount_msat
                .saturating_sub(raw.outgoing_amount_msat),
        ),
    })
}

/// Maps a resolution to the message LND expects on the interceptor stream.
pub fn to_intercept_response(response: ForwardResponse) -> ForwardHtlcInterceptResponse {
    let (action, preimage) = match response.resolution {
        ForwardResolution::Accept => (ResolveHoldForwardAction::Resume, Vec::new()),
        ForwardResolution::Reject => (ResolveHoldForwardAction::Fail, Vec::new()),
        ForwardResolution::Settle { preimage } => {
            (ResolveHoldForwardAction::Settle, preimage.as_bytes().to_vec())
        }
    };

    ForwardHtlcInterceptResponse {
        incoming_circuit_key: Some(LndCircuitKey {
            chan_id: response.circuit_key.chan_id,
            htlc_id: response.circuit_key.htlc_id,
        }),
        action: action as i32,
        preimage,
        ..Default::default()
    }
}

/// Runs until the subscription goes away or the stream ends or fails.
pub async fn pump<S, E>(
    mut intercepted: S,
    feed: SubscriptionFeed,
    outbound: mpsc::UnboundedSender<ForwardHtlcInterceptResponse>,
) where
    S: Stream<Item = std::result::Result<ForwardHtlcInterceptRequest, E>> + Unpin,
    E: std::fmt::Display,
{
    let (responder, mut responses): (ForwardResponder, _) = mpsc::unbounded_channel();

    loop {
        tokio::select! {
            _ = feed.cancelled() => {
                debug!("Interceptor subscription dropped, closing stream");
                break;
            }
            Some(response) = responses.recv() => {
                debug!(
                    "Resolving HTLC {} with {}",
                    response.circuit_key,
                    response.resolution.name()
                );
                if outbound.send(to_intercept_response(response)).is_err() {
                    feed.fail(anyhow!("interceptor stream closed by node")).await;
                    break;
                }
            }
            message = intercepted.next() => match message {
                Some(Ok(raw)) => match to_forward_event(&raw) {
                    Ok(event) => {
                        let request = ForwardRequest::new(event, responder.clone());
                        if !feed.deliver(request).await {
                            break;
                        }
                    }
                    Err(e) => {
                        // Without a usable event there is nothing to decide;
                        // hand the HTLC back to LND untouched.
                        warn!("Resuming unreadable intercepted HTLC: {:#}", e);
                        if let Some(key) = raw.incoming_circuit_key {
                            let _ = outbound.send(ForwardHtlcInterceptResponse {
                                incoming_circuit_key: Some(key),
                                action: ResolveHoldForwardAction::Resume as i32,
                                ..Default::default()
                            });
                        }
                    }
                },
                Some(Err(e)) => {
                    feed.fail(anyhow!("interceptor stream error: {}", e)).await;
                    break;
                }
                None => {
                    debug!("Interceptor stream ended");
                    break;
                }
            }
        }
    }

    // Flush resolutions that raced the shutdown; LND drops them if the
    // stream is already gone.
    drop(responder);
    while let Ok(response) = responses.try_recv() {
        let _ = outbound.send(to_intercept_response(response));
    }
}
