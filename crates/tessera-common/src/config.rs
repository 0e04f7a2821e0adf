//! Application configuration loaded from environment variables and config files.
//!
//! Supports `.env` files for development and environment variables for production.
//! Config precedence: env vars > .env file > config file > defaults

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::models::room_version::RoomVersion;

/// Load the configuration.
///
/// `config_path` names an explicit config file (required when given). Without it an
/// optional `config.toml` in the working directory is read.
pub fn init(config_path: Option<&str>) -> Result<AppConfig, config::ConfigError> {
    // Load .env file if present (development)
    let _ = dotenvy::dotenv();

    let file = match config_path {
        Some(path) => config::File::with_name(path).required(true),
        None => config::File::with_name("config").required(false),
    };

    let cfg = with_defaults(config::Config::builder())?
        .add_source(file)
        // Environment variables (TESSERA__SERVER__NAME, TESSERA__DATABASE__URL, etc.)
        .add_source(
            config::Environment::with_prefix("TESSERA")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    cfg.try_deserialize()
}

/// Build a configuration from an in-memory TOML document layered over the defaults.
pub fn from_toml_str(toml: &str) -> Result<AppConfig, config::ConfigError> {
    with_defaults(config::Config::builder())?
        .add_source(config::File::from_str(toml, config::FileFormat::Toml))
        .build()?
        .try_deserialize()
}

fn with_defaults(
    builder: config::ConfigBuilder<config::builder::DefaultState>,
) -> Result<config::ConfigBuilder<config::builder::DefaultState>, config::ConfigError> {
    builder
        .set_default("server.name", "localhost")?
        .set_default("server.host", "127.0.0.1")?
        .set_default("server.internal_api_port", 7770)?
        .set_default("database.url", "sqlite://tessera.db")?
        .set_default("database.max_connections", 10)?
        .set_default("room_server.default_room_version", RoomVersion::DEFAULT)?
        .set_default("room_server.room_version_cache_capacity", 10_000)?
        .set_default("federation.pending_batch_limit", 50)
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub room_server: RoomServerConfig,
    pub federation: FederationConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Public server name used for federation (e.g. "tessera.example.com").
    /// Never banned by a room's server ACL.
    pub name: String,
    pub host: String,
    /// Port of the internal room server API.
    pub internal_api_port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    /// SQLite connection URL, e.g. `sqlite://tessera.db`
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RoomServerConfig {
    /// Version assigned to rooms created without an explicit one.
    pub default_room_version: RoomVersion,
    pub room_version_cache_capacity: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FederationConfig {
    /// Maximum age per EDU type, in seconds. Types not listed never expire.
    #[serde(default = "default_edu_ttls")]
    pub edu_ttl_secs: BTreeMap<String, u64>,
    /// Upper bound on items handed to the delivery scheduler per poll.
    pub pending_batch_limit: u32,
}

fn default_edu_ttls() -> BTreeMap<String, u64> {
    BTreeMap::from([
        ("m.typing".to_string(), 60),
        ("m.presence".to_string(), 86_400),
        ("m.receipt".to_string(), 86_400),
        ("m.direct_to_device".to_string(), 7 * 86_400),
    ])
}

/// Every problem found by [`AppConfig::verify`].
#[derive(Debug, thiserror::Error)]
#[error("invalid configuration: {}", .0.join("; "))]
pub struct ConfigErrors(pub Vec<String>);

impl AppConfig {
    /// Check the loaded values, reporting all problems at once.
    pub fn verify(&self) -> Result<(), ConfigErrors> {
        let mut problems = Vec::new();

        if self.server.name.trim().is_empty() {
            problems.push("server.name must not be empty".to_string());
        }
        if self.database.url.trim().is_empty() {
            problems.push("database.url must not be empty".to_string());
        }
        if self.database.max_connections == 0 {
            problems.push("database.max_connections must be positive".to_string());
        }
        if !self.room_server.default_room_version.is_supported() {
            problems.push(format!(
                "room_server.default_room_version {} is not supported",
                self.room_server.default_room_version
            ));
        }
        if self.room_server.room_version_cache_capacity == 0 {
            problems.push("room_server.room_version_cache_capacity must be positive".to_string());
        }
        if self.federation.pending_batch_limit == 0 {
            problems.push("federation.pending_batch_limit must be positive".to_string());
        }

        if problems.is_empty() { Ok(()) } else { Err(ConfigErrors(problems)) }
    }
}
