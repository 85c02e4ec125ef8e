use relay_core::{
    limits::{AUTH_TIMEOUT, MAX_FRAME_SIZE, MAX_HISTORY_SIZE, RATE_LIMIT_REQUESTS, RATE_LIMIT_WINDOW},
    llm_client::GEMINI_OPENAI_API_BASE,
};
use secrecy::SecretString;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
///
/// The protocol limits are plain fields so tests can shrink them; `from_env`
/// always fills them from [`relay_core::limits`].
#[derive(Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    /// Shared secret clients must present. `None` runs the server open.
    pub server_token: Option<SecretString>,
    /// Backend credential. `None` disables generation.
    pub gemini_api_key: Option<SecretString>,
    pub gemini_model: String,
    pub gemini_api_base: String,
    pub tls_cert_path: PathBuf,
    pub tls_key_path: PathBuf,
    pub log_level: Level,
    pub auth_timeout: Duration,
    pub rate_limit_requests: usize,
    pub rate_limit_window: Duration,
    pub max_history_size: usize,
    pub max_frame_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([0, 0, 0, 0], 8080)),
            server_token: None,
            gemini_api_key: None,
            gemini_model: "gemini-2.0-flash".to_string(),
            gemini_api_base: GEMINI_OPENAI_API_BASE.to_string(),
            tls_cert_path: PathBuf::from("certs/cert.pem"),
            tls_key_path: PathBuf::from("certs/key.pem"),
            log_level: Level::INFO,
            auth_timeout: AUTH_TIMEOUT,
            rate_limit_requests: RATE_LIMIT_REQUESTS,
            rate_limit_window: RATE_LIMIT_WINDOW,
            max_history_size: MAX_HISTORY_SIZE,
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }
        let defaults = Self::default();

        let bind_address = match std::env::var("BIND_ADDRESS") {
            Ok(s) => s
                .parse::<SocketAddr>()
                .map_err(|e| ConfigError::InvalidValue("BIND_ADDRESS".to_string(), e.to_string()))?,
            Err(_) => defaults.bind_address,
        };

        let server_token = non_empty_var("MCP_SERVER_TOKEN").map(SecretString::from);
        let gemini_api_key = non_empty_var("GEMINI_API_KEY").map(SecretString::from);

        let gemini_model = non_empty_var("GEMINI_MODEL").unwrap_or(defaults.gemini_model);
        let gemini_api_base =
            non_empty_var("GEMINI_API_BASE").unwrap_or(defaults.gemini_api_base);

        let tls_cert_path = std::env::var("TLS_CERT_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.tls_cert_path);
        let tls_key_path = std::env::var("TLS_KEY_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.tls_key_path);

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        Ok(Self {
            bind_address,
            server_token,
            gemini_api_key,
            gemini_model,
            gemini_api_base,
            tls_cert_path,
            tls_key_path,
            log_level,
            ..defaults
        })
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}
