//! Configuration management
//!
//! Loads configuration from:
//! 1. Default values
//! 2. Configuration files (config/default.toml, config/local.toml)
//! 3. Environment variables (override)

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub federation: FederationConfig,
    pub delivery: DeliveryConfig,
    pub admin: AdminConfig,
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Port number (e.g., 8080)
    pub port: u16,
    /// Public domain (e.g., "social.example.com", may carry a port)
    pub domain: String,
    /// Protocol ("http" or "https")
    pub protocol: String,
}

impl ServerConfig {
    /// Get the base URL for the instance
    ///
    /// # Returns
    /// Full URL like "https://social.example.com"
    pub fn base_url(&self) -> String {
        format!("{}://{}", self.protocol, self.domain)
    }

    /// URI of a local actor.
    pub fn actor_uri(&self, username: &str) -> String {
        format!("{}/users/{}", self.base_url(), username)
    }
}

/// Database configuration (SQLite only)
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file
    pub path: PathBuf,
    /// Maximum pooled connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    8
}

/// What the inbox answers when a request signature does not verify.
///
/// `Accepted` keeps probing senders from learning which keys or signatures
/// are valid, at the cost of hiding clock skew or key rotation problems from
/// well-behaved peers. The rejected body is never processed either way.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SignatureFailureResponse {
    #[default]
    Accepted,
    Reject,
}

/// Federation configuration
#[derive(Debug, Clone, Deserialize)]
pub struct FederationConfig {
    /// Timeout applied to every outbound request
    pub request_timeout_secs: u64,
    /// Maximum number of reply ancestors resolved for one status
    pub max_reply_depth: usize,
    /// Allowed clock skew for the signed Date header
    pub signature_max_skew_secs: i64,
    /// Allow outbound requests to loopback/private addresses
    #[serde(default)]
    pub allow_private_addresses: bool,
    /// Inbox response on signature failure
    #[serde(default)]
    pub signature_failure_response: SignatureFailureResponse,
    /// Maximum accepted inbox body size
    pub max_inbox_bytes: usize,
    /// RSA modulus size for newly provisioned accounts
    pub key_bits: usize,
}

impl FederationConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 10,
            max_reply_depth: 10,
            signature_max_skew_secs: 300,
            allow_private_addresses: false,
            signature_failure_response: SignatureFailureResponse::Accepted,
            max_inbox_bytes: 1024 * 1024,
            key_bits: 2048,
        }
    }
}

/// Delivery worker pool configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    /// Number of delivery workers (inboxes are sharded across them)
    pub workers: usize,
    /// Bounded channel capacity per worker
    pub queue_capacity: usize,
    /// Attempts before a job is dead-lettered
    pub max_attempts: u32,
    /// First retry delay; doubled on every further attempt
    pub base_backoff_ms: u64,
    /// Upper bound for the retry delay
    pub max_backoff_secs: u64,
    /// How long shutdown waits for queued jobs before cancelling them
    pub drain_timeout_secs: u64,
}

impl DeliveryConfig {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 1024,
            max_attempts: 8,
            base_backoff_ms: 500,
            max_backoff_secs: 300,
            drain_timeout_secs: 10,
        }
    }
}

/// Local account provisioned at startup
#[derive(Debug, Clone, Deserialize)]
pub struct AdminConfig {
    /// Admin username (default: "admin")
    #[serde(default = "default_admin_username")]
    pub username: String,
    /// Admin display name (default: "Admin")
    #[serde(default = "default_admin_display_name")]
    pub display_name: String,
    /// Admin bio/note
    pub note: Option<String>,
    /// Admin email
    pub email: Option<String>,
}

fn default_admin_username() -> String {
    "admin".to_string()
}

fn default_admin_display_name() -> String {
    "Admin".to_string()
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Log format: "pretty" or "json"
    pub format: String,
}

impl AppConfig {
    /// Load configuration from file and environment
    ///
    /// # Loading Order
    /// 1. Default values
    /// 2. config/default.toml (if exists)
    /// 3. config/local.toml (if exists)
    /// 4. Environment variables (RUSTPUB__*)
    ///
    /// # Errors
    /// Returns error if configuration is invalid
    pub fn load() -> Result<Self, crate::error::AppError> {
        use config::{Config, Environment, File};

        let config = Config::builder()
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8080)?
            .set_default("server.protocol", "http")?
            .set_default("database.path", "data/rustpub.db")?
            .set_default("database.max_connections", 8)?
            .set_default("federation.request_timeout_secs", 10)?
            .set_default("federation.max_reply_depth", 10)?
            .set_default("federation.signature_max_skew_secs", 300)?
            .set_default("federation.allow_private_addresses", false)?
            .set_default("federation.signature_failure_response", "accepted")?
            .set_default("federation.max_inbox_bytes", 1024 * 1024)?
            .set_default("federation.key_bits", 2048)?
            .set_default("delivery.workers", 4)?
            .set_default("delivery.queue_capacity", 1024)?
            .set_default("delivery.max_attempts", 8)?
            .set_default("delivery.base_backoff_ms", 500)?
            .set_default("delivery.max_backoff_secs", 300)?
            .set_default("delivery.drain_timeout_secs", 10)?
            .set_default("admin.username", "admin")?
            .set_default("admin.display_name", "Admin")?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(
                Environment::with_prefix("RUSTPUB")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;

        let app_config: Self = config
            .try_deserialize()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;
        app_config.validate()?;
        Ok(app_config)
    }

    pub(crate) fn validate(&self) -> Result<(), crate::error::AppError> {
        use crate::error::AppError;

        if !self.server.protocol.eq_ignore_ascii_case("https")
            && !self.server.protocol.eq_ignore_ascii_case("http")
        {
            return Err(AppError::Config(format!(
                "server.protocol must be http or https, got {}",
                self.server.protocol
            )));
        }

        if self.server.domain.trim().is_empty() {
            return Err(AppError::Config(
                "server.domain must not be empty".to_string(),
            ));
        }

        if self.delivery.workers == 0 {
            return Err(AppError::Config(
                "delivery.workers must be greater than 0".to_string(),
            ));
        }

        if self.delivery.queue_capacity == 0 {
            return Err(AppError::Config(
                "delivery.queue_capacity must be greater than 0".to_string(),
            ));
        }

        if self.delivery.max_attempts == 0 {
            return Err(AppError::Config(
                "delivery.max_attempts must be greater than 0".to_string(),
            ));
        }

        if self.federation.request_timeout_secs == 0 {
            return Err(AppError::Config(
                "federation.request_timeout_secs must be greater than 0".to_string(),
            ));
        }

        if self.federation.key_bits < 1024 {
            return Err(AppError::Config(
                "federation.key_bits must be at least 1024".to_string(),
            ));
        }

        Ok(())
    }
}
