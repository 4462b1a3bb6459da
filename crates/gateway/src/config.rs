//! Gateway configuration from environment variables.

use crate::error::{GatewayError, Result};
use crate::session::SessionSettings;
use crate::transport::QuicSettings;
use crate::ws_server::DEFAULT_SERVICE_NAME;
use std::fmt::Display;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_HTTP_PORT: u16 = 8085;
pub const DEFAULT_METRICS_PORT: u16 = 9095;
pub const DEFAULT_NATS_URL: &str = "nats://localhost:4222";
pub const DEFAULT_AUDIENCE: &str = "edu-platform";
pub const DEFAULT_ISSUER: &str = "auth-service";
/// Upper bound for `PING_INTERVAL_SECS` (one day).
pub const MAX_PING_INTERVAL_SECS: u64 = 86_400;
/// Upper bound for `SEND_TIMEOUT_MS` (one minute).
pub const MAX_SEND_TIMEOUT_MS: u64 = 60_000;

/// Where the token verification key comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySource {
    /// PEM text given inline (`JWT_PUBLIC_KEY`).
    Inline(String),
    /// Path to a PEM file (`JWT_PUBLIC_KEY_PATH`).
    File(PathBuf),
}

impl KeySource {
    /// Read the PEM bytes.
    pub fn load(&self) -> Result<Vec<u8>> {
        match self {
            // Literal "\n" sequences let the key fit on one env line
            KeySource::Inline(pem) => Ok(pem.replace("\\n", "\n").into_bytes()),
            KeySource::File(path) => std::fs::read(path).map_err(|e| {
                GatewayError::VerificationKey(format!("cannot read {}: {e}", path.display()))
            }),
        }
    }
}

/// Full gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub http_port: u16,
    pub metrics_port: u16,
    pub nats_url: String,
    pub key_source: KeySource,
    pub audience: String,
    pub issuer: String,
    pub session: SessionSettings,
    /// Set only when port, certificate and key are all configured.
    pub quic: Option<QuicSettings>,
    pub access_service_url: Option<String>,
    pub service_name: String,
}

impl GatewayConfig {
    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read configuration through `lookup`; unset and empty values are
    /// treated alike.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let key_source = match (get("JWT_PUBLIC_KEY"), get("JWT_PUBLIC_KEY_PATH")) {
            (Some(pem), _) => KeySource::Inline(pem),
            (None, Some(path)) => KeySource::File(PathBuf::from(path)),
            (None, None) => {
                return Err(GatewayError::Config(
                    "JWT_PUBLIC_KEY or JWT_PUBLIC_KEY_PATH must be set".to_string(),
                ))
            }
        };

        let ping_secs: u64 = parse_or(&get, "PING_INTERVAL_SECS", 30)?;
        let send_timeout_ms: u64 = parse_or(&get, "SEND_TIMEOUT_MS", 5000)?;
        let buffer_size: usize = parse_or(&get, "CLIENT_BUFFER_SIZE", SessionSettings::default().buffer_size)?;
        if ping_secs == 0 || send_timeout_ms == 0 || buffer_size == 0 {
            return Err(GatewayError::Config(
                "PING_INTERVAL_SECS, SEND_TIMEOUT_MS and CLIENT_BUFFER_SIZE must be positive"
                    .to_string(),
            ));
        }
        if ping_secs > MAX_PING_INTERVAL_SECS || send_timeout_ms > MAX_SEND_TIMEOUT_MS {
            return Err(GatewayError::Config(format!(
                "PING_INTERVAL_SECS must be at most {MAX_PING_INTERVAL_SECS} and \
                 SEND_TIMEOUT_MS at most {MAX_SEND_TIMEOUT_MS}"
            )));
        }

        let quic = match (get("QUIC_PORT"), get("QUIC_CERT_PATH"), get("QUIC_KEY_PATH")) {
            (Some(port), Some(cert), Some(key)) => Some(QuicSettings {
                addr: SocketAddr::from(([0, 0, 0, 0], parse("QUIC_PORT", &port)?)),
                cert_path: PathBuf::from(cert),
                key_path: PathBuf::from(key),
            }),
            _ => None,
        };

        Ok(Self {
            http_port: parse_or(&get, "HTTP_PORT", DEFAULT_HTTP_PORT)?,
            metrics_port: parse_or(&get, "METRICS_PORT", DEFAULT_METRICS_PORT)?,
            nats_url: get("NATS_URL").unwrap_or_else(|| DEFAULT_NATS_URL.to_string()),
            key_source,
            audience: get("JWT_AUDIENCE").unwrap_or_else(|| DEFAULT_AUDIENCE.to_string()),
            issuer: get("JWT_ISSUER").unwrap_or_else(|| DEFAULT_ISSUER.to_string()),
            session: SessionSettings {
                ping_interval: Duration::from_secs(ping_secs),
                send_timeout: Duration::from_millis(send_timeout_ms),
                buffer_size,
            },
            quic,
            access_service_url: get("ACCESS_SERVICE_URL"),
            service_name: get("SERVICE_NAME").unwrap_or_else(|| DEFAULT_SERVICE_NAME.to_string()),
        })
    }
}

fn parse<T>(name: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    raw.parse()
        .map_err(|e| GatewayError::Config(format!("{name} must be a number: {e}")))
}

fn parse_or<T, G>(get: &G, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
    G: Fn(&str) -> Option<String>,
{
    match get(name) {
        Some(raw) => parse(name, &raw),
        None => Ok(default),
    }
}
