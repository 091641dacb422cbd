//! Process configuration.
//!
//! Static options (listen address, authorization endpoint, retry tuning)
//! come from the command line or environment once at startup. Node
//! credentials and the ghost channel are read from the environment on every
//! connection attempt through [`EnvSettingsSource`], so a fixed environment
//! is picked up by the next retry.

use std::net::SocketAddr;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use clap::Parser;
use thiserror::Error;

use crate::authorization::{AuthorizerConfig, DEFAULT_ENDPOINT};
use crate::core::provider::{ConnectionSettings, NodeCredentials, SettingsSource};
use crate::core::retry::RetryPolicy;
use crate::primitives::ShortChannelId;

pub const ENV_NODE_SOCKET: &str = "LND_NODE_SOCKET";
pub const ENV_NODE_MACAROON: &str = "LND_NODE_MACAROON";
pub const ENV_NODE_CERT: &str = "LND_NODE_CERT";
pub const ENV_TARGET_CHANNEL: &str = "GHOST_TARGET_CHANNEL";

/// Outgoing channel that marks a forward as a ghost payment.
pub const DEFAULT_TARGET_CHANNEL: &str = "1052673x257x257";

/// Intercepts forwards to the ghost channel and settles them against the
/// authorization service.
#[derive(Parser, Debug, Clone)]
#[command(name = "ghost-forwarder")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Address the health endpoint listens on.
    #[arg(long, default_value = "0.0.0.0:3000", env = "GHOST_HEALTH_ADDR")]
    pub health_addr: SocketAddr,

    /// GraphQL endpoint of the authorization service.
    #[arg(long, default_value = DEFAULT_ENDPOINT, env = "GHOST_AUTH_ENDPOINT")]
    pub auth_endpoint: String,

    /// Timeout for one authorization round-trip, in seconds.
    #[arg(long, default_value = "30", env = "GHOST_AUTH_TIMEOUT_SECS")]
    pub auth_timeout_secs: u64,

    /// Base reconnect delay in seconds; attempt n waits base * n^2.
    #[arg(long, default_value = "5", env = "GHOST_RETRY_BASE_SECS")]
    pub retry_base_secs: u64,

    /// Consecutive failures after which the process gives up.
    #[arg(long, default_value = "6", env = "GHOST_MAX_ATTEMPTS")]
    pub max_attempts: u32,

    /// Log filter, e.g. `info` or `ghost_forwarder=debug`.
    #[arg(long, default_value = "info", env = "RUST_LOG")]
    pub log_level: String,
}

impl Cli {
    pub fn authorizer_config(&self) -> AuthorizerConfig {
        AuthorizerConfig::new(
            self.auth_endpoint.clone(),
            Duration::from_secs(self.auth_timeout_secs),
        )
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(Duration::from_secs(self.retry_base_secs), self.max_attempts)
    }
}

// ============================================================================
// Node Settings
// ============================================================================

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SettingsError {
    #[error("{0} is not set")]
    Missing(&'static str),

    #[error("{name} is invalid: {reason}")]
    Invalid { name: &'static str, reason: String },
}

fn env_lookup(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

/// Reads [`ConnectionSettings`] from environment variables.
///
/// | Variable | Content |
/// |----------|---------|
/// | `LND_NODE_SOCKET` | `host:port` of the gRPC interface |
/// | `LND_NODE_MACAROON` | macaroon, hex or base64 |
/// | `LND_NODE_CERT` | TLS cert, PEM or base64 of PEM (optional) |
/// | `GHOST_TARGET_CHANNEL` | ghost scid (default `1052673x257x257`) |
pub struct EnvSettingsSource<F = fn(&str) -> Option<String>> {
    lookup: F,
}

impl EnvSettingsSource {
    pub fn from_env() -> Self {
        Self { lookup: env_lookup }
    }
}

impl Default for EnvSettingsSource {
    fn default() -> Self {
        Self::from_env()
    }
}

impl<F> EnvSettingsSource<F>
where
    F: Fn(&str) -> Option<String> + Send + Sync,
{
    /// Uses `lookup` instead of the process environment.
    pub fn with_lookup(lookup: F) -> Self {
        Self { lookup }
    }

    fn var(&self, name: &'static str) -> Option<String> {
        (self.lookup)(name)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn required(&self, name: &'static str) -> Result<String, SettingsError> {
        self.var(name).ok_or(SettingsError::Missing(name))
    }

    pub fn read(&self) -> Result<ConnectionSettings, SettingsError> {
        let socket = self.required(ENV_NODE_SOCKET)?;
        let macaroon = decode_macaroon(&self.required(ENV_NODE_MACAROON)?)?;
        let cert = self.var(ENV_NODE_CERT).map(|c| decode_cert(&c)).transpose()?;

        let target_channel = self
            .var(ENV_TARGET_CHANNEL)
            .unwrap_or_else(|| DEFAULT_TARGET_CHANNEL.to_string())
            .parse::<ShortChannelId>()
            .map_err(|e| SettingsError::Invalid {
                name: ENV_TARGET_CHANNEL,
                reason: e.to_string(),
            })?;

        Ok(ConnectionSettings {
            credentials: NodeCredentials {
                socket,
                macaroon,
                cert,
            },
            target_channel,
        })
    }
}

impl<F> SettingsSource for EnvSettingsSource<F>
where
    F: Fn(&str) -> Option<String> + Send + Sync,
{
    fn load(&self) -> anyhow::Result<ConnectionSettings> {
        Ok(self.read()?)
    }
}

/// Hex first, since a hex string is also valid base64.
fn decode_macaroon(raw: &str) -> Result<Vec<u8>, SettingsError> {
    if let Ok(bytes) = hex::decode(raw) {
        return Ok(bytes);
    }
    BASE64
        .decode(raw)
        .map_err(|_| SettingsError::Invalid {
            name: ENV_NODE_MACAROON,
            reason: "expected hex or base64".to_string(),
        })
}

const PEM_MARKER: &str = "-----BEGIN";

fn decode_cert(raw: &str) -> Result<Vec<u8>, SettingsError> {
    if raw.starts_with(PEM_MARKER) {
        return Ok(raw.as_bytes().to_vec());
    }
    let invalid = |reason: &str| SettingsError::Invalid {
        name: ENV_NODE_CERT,
        reason: reason.to_string(),
    };
    let decoded = BASE64
        .decode(raw)
        .map_err(|_| invalid("expected PEM or base64 encoded PEM"))?;
    if !decoded.starts_with(PEM_MARKER.as_bytes()) {
        return Err(invalid("base64 content is not a PEM certificate"));
    }
    Ok(decoded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const PEM: &str = "-----BEGIN CERTIFICATE-----\nMIIB\n-----END CERTIFICATE-----\n";

    fn source(
        vars: &[(&str, &str)],
    ) -> EnvSettingsSource<impl Fn(&str) -> Option<String> + Send + Sync> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        EnvSettingsSource::with_lookup(move |key: &str| vars.get(key).cloned())
    }

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::try_parse_from(["ghost-forwarder"]).unwrap();
        assert_eq!(cli.health_addr, "0.0.0.0:3000".parse().unwrap());
        assert_eq!(cli.auth_endpoint, DEFAULT_ENDPOINT);
        assert_eq!(cli.retry_policy(), RetryPolicy::default());
        assert_eq!(cli.authorizer_config(), AuthorizerConfig::default());
    }

    #[test]
    fn test_cli_overrides() {
        let cli = Cli::try_parse_from([
            "ghost-forwarder",
            "--health-addr",
            "127.0.0.1:8080",
            "--retry-base-secs",
            "1",
            "--max-attempts",
            "3",
        ])
        .unwrap();
        assert_eq!(cli.health_addr.port(), 8080);
        assert_eq!(
            cli.retry_policy(),
            RetryPolicy::new(Duration::from_secs(1), 3)
        );
    }

    #[test]
    fn test_reads_hex_macaroon_and_default_channel() {
        let settings = source(&[
            (ENV_NODE_SOCKET, "127.0.0.1:10009"),
            (ENV_NODE_MACAROON, "0201036c6e64"),
        ])
        .read()
        .unwrap();

        assert_eq!(settings.credentials.socket, "127.0.0.1:10009");
        assert_eq!(settings.credentials.macaroon, vec![0x02, 0x01, 0x03, 0x6c, 0x6e, 0x64]);
        assert_eq!(settings.credentials.cert, None);
        assert_eq!(settings.target_channel.to_string(), DEFAULT_TARGET_CHANNEL);
    }

    #[test]
    fn test_reads_base64_macaroon_and_cert() {
        let settings = source(&[
            (ENV_NODE_SOCKET, "node:10009"),
            (ENV_NODE_MACAROON, &BASE64.encode(b"mac-bytes!")),
            (ENV_NODE_CERT, &BASE64.encode(PEM)),
            (ENV_TARGET_CHANNEL, "700000x1x0"),
        ])
        .read()
        .unwrap();

        assert_eq!(settings.credentials.macaroon, b"mac-bytes!".to_vec());
        assert_eq!(settings.credentials.cert, Some(PEM.as_bytes().to_vec()));
        assert_eq!(settings.target_channel.to_string(), "700000x1x0");
    }

    #[test]
    fn test_plain_pem_cert() {
        let settings = source(&[
            (ENV_NODE_SOCKET, "node:10009"),
            (ENV_NODE_MACAROON, "00"),
            (ENV_NODE_CERT, PEM),
        ])
        .read()
        .unwrap();
        assert_eq!(settings.credentials.cert, Some(PEM.trim().as_bytes().to_vec()));
    }

    #[test]
    fn test_missing_values() {
        assert_eq!(
            source(&[]).read().unwrap_err(),
            SettingsError::Missing(ENV_NODE_SOCKET)
        );
        assert_eq!(
            source(&[(ENV_NODE_SOCKET, "node:10009"), (ENV_NODE_MACAROON, "  ")])
                .read()
                .unwrap_err(),
            SettingsError::Missing(ENV_NODE_MACAROON)
        );
    }

    #[test]
    fn test_invalid_values() {
        let bad_cert = source(&[
            (ENV_NODE_SOCKET, "node:10009"),
            (ENV_NODE_MACAROON, "00"),
            (ENV_NODE_CERT, &BASE64.encode(b"not a pem")),
        ]);
        assert!(matches!(
            bad_cert.read(),
            Err(SettingsError::Invalid { name: ENV_NODE_CERT, .. })
        ));

        let bad_channel = source(&[
            (ENV_NODE_SOCKET, "node:10009"),
            (ENV_NODE_MACAROON, "00"),
            (ENV_TARGET_CHANNEL, "not-a-scid"),
        ]);
        assert!(matches!(
            bad_channel.read(),
            Err(SettingsError::Invalid { name: ENV_TARGET_CHANNEL, .. })
        ));
    }

    #[test]
    fn test_load_is_reread_each_time() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;

        let present = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&present);
        let source = EnvSettingsSource::with_lookup(move |key: &str| match key {
            ENV_NODE_SOCKET => Some("node:10009".to_string()),
            ENV_NODE_MACAROON if flag.load(Ordering::SeqCst) => Some("00".to_string()),
            _ => None,
        });

        assert!(source.load().is_err());
        present.store(true, Ordering::SeqCst);
        assert!(source.load().is_ok());
    }
}
