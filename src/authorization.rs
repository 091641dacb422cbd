//! GraphQL client for the ghost payment authorization service.
//!
//! One POST per ghost forward:
//!
//! ```text
//! query GetGhostPayment($input: GhostPaymentInput!) {
//!   getGhostPayment(input: $input) { preimage payment_amount }
//! }
//! ```
//!
//! with `{"input": {"payment_hash": <hex>, "signature": <node signature>}}`.
//! Anything other than a `getGhostPayment` object without errors is treated
//! as "no authorization".

use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::core::provider::{AuthorizationRecord, Authorizer};
use crate::primitives::{Msat, PaymentHash, Preimage, Signature};

pub const DEFAULT_ENDPOINT: &str = "https://api.amboss.space/graphql";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

const CLIENT_NAME: &str = "ghost-client";
const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

const GET_GHOST_PAYMENT: &str = "query GetGhostPayment($input: GhostPaymentInput!) {
  getGhostPayment(input: $input) {
    preimage
    payment_amount
  }
}";

#[derive(Debug, Error)]
pub enum AuthorizationError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("service returned status {0}")]
    Status(reqwest::StatusCode),

    #[error("service returned an error: {0}")]
    Service(String),

    #[error("malformed response: {0}")]
    Malformed(String),
}

/// Where and how to reach the authorization service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizerConfig {
    pub endpoint: String,
    /// Bounds the whole round-trip; a timeout counts as "no authorization".
    pub timeout: Duration,
}

impl Default for AuthorizerConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl AuthorizerConfig {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            timeout,
        }
    }
}

// ============================================================================
// Wire Types
// ============================================================================

#[derive(Debug, Serialize)]
struct GraphqlRequest<'a> {
    query: &'a str,
    variables: GhostPaymentVariables<'a>,
}

#[derive(Debug, Serialize)]
struct GhostPaymentVariables<'a> {
    input: GhostPaymentInput<'a>,
}

#[derive(Debug, Serialize)]
struct GhostPaymentInput<'a> {
    payment_hash: &'a str,
    signature: &'a str,
}

#[derive(Debug, Deserialize)]
struct GraphqlResponse {
    data: Option<GhostPaymentData>,
    #[serde(default)]
    errors: Vec<GraphqlError>,
}

#[derive(Debug, Deserialize)]
struct GraphqlError {
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GhostPaymentData {
    get_ghost_payment: Option<GhostPayment>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GhostPayment {
    #[serde(default)]
    pub preimage: Option<String>,
    /// Integer msat; some GraphQL servers send large integers as strings.
    pub payment_amount: Value,
}

impl GhostPayment {
    /// Converts the raw answer into a record. An amount that is not a
    /// non-negative integer makes the whole record unusable; a bad
    /// preimage only drops the preimage.
    pub fn into_record(self) -> Result<AuthorizationRecord, AuthorizationError> {
        let payment_amount = match &self.payment_amount {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse::<u64>().ok(),
            _ => None,
        }
        .map(Msat)
        .ok_or_else(|| {
            AuthorizationError::Malformed(format!(
                "payment_amount is not an msat amount: {}",
                self.payment_amount
            ))
        })?;

        let preimage = match self.preimage.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(raw) => match raw.parse::<Preimage>() {
                Ok(preimage) => Some(preimage),
                Err(e) => {
                    warn!("Ignoring unusable preimage in authorization: {}", e);
                    None
                }
            },
        };

        Ok(AuthorizationRecord {
            preimage,
            payment_amount,
        })
    }
}

/// Interprets a GraphQL response body. `Ok(None)` means the service had no
/// ghost payment for this hash.
fn parse_response(body: GraphqlResponse) -> Result<Option<GhostPayment>, AuthorizationError> {
    if let Some(first) = body.errors.first() {
        return Err(AuthorizationError::Service(first.message.clone()));
    }
    Ok(body.data.and_then(|d| d.get_ghost_payment))
}

// ============================================================================
// Client
// ============================================================================

#[derive(Debug, Clone)]
pub struct GraphqlAuthorizer {
    endpoint: String,
    client: reqwest::Client,
}

impl GraphqlAuthorizer {
    pub fn new(config: AuthorizerConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("ghost-forwarder/", env!("CARGO_PKG_VERSION")))
            .timeout(config.timeout)
            .build()?;

        Ok(Self {
            endpoint: config.endpoint,
            client,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Performs the GraphQL round-trip.
    pub async fn get_ghost_payment(
        &self,
        payment_hash: &PaymentHash,
        signature: &Signature,
    ) -> Result<Option<GhostPayment>, AuthorizationError> {
        let payment_hash = payment_hash.to_hex();
        let request = GraphqlRequest {
            query: GET_GHOST_PAYMENT,
            variables: GhostPaymentVariables {
                input: GhostPaymentInput {
                    payment_hash: &payment_hash,
                    signature: signature.as_str(),
                },
            },
        };

        debug!("Requesting ghost payment {} from {}", payment_hash, self.endpoint);

        let response = self
            .client
            .post(&self.endpoint)
            .header("Accept", "application/json")
            .header("apollographql-client-name", CLIENT_NAME)
            .header("apollographql-client-version", CLIENT_VERSION)
            .json(&request)
            .send()
            .await?;

        // GraphQL servers report most failures in the body, so a non-2xx
        // status only matters when there is no JSON to read.
        let status = response.status();
        let body = response.text().await?;
        let parsed: GraphqlResponse = match serde_json::from_str(&body) {
            Ok(parsed) => parsed,
            Err(_) if !status.is_success() => return Err(AuthorizationError::Status(status)),
            Err(e) => return Err(AuthorizationError::Malformed(e.to_string())),
        };

        parse_response(parsed)
    }
}

#[async_trait]
impl Authorizer for GraphqlAuthorizer {
    async fn authorize(
        &self,
        payment_hash: &PaymentHash,
        signature: &Signature,
    ) -> Option<AuthorizationRecord> {
        match self.get_ghost_payment(payment_hash, signature).await {
            Ok(Some(payment)) => match payment.into_record() {
                Ok(record) => Some(record),
                Err(e) => {
                    error!("Error getting ghost payment info for {}: {}", payment_hash, e);
                    None
                }
            },
            Ok(None) => {
                error!(
                    "Error getting ghost payment info for {}: no ghost payment returned",
                    payment_hash
                );
                None
            }
            Err(e) => {
                error!("Error getting ghost payment info for {}: {}", payment_hash, e);
                None
            }
        }
    }
}
