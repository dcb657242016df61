use anyhow::Context;
use serde::Deserialize;
use std::path::Path;
use tracing::info;

use crate::engine::registry::DEFAULT_QUEUE_CAPACITY;
use crate::engine::router::{GroupPostPolicy, RouterOptions};
use crate::engine::validation::DEFAULT_MAX_MESSAGE_LEN;

/// Default config file looked up in the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "parley.toml";

/// Top-level server configuration, loaded from parley.toml.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    pub server: ServerSection,
    pub database: DatabaseSection,
    pub routing: RoutingSection,
    pub auth: AuthSection,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub address: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            address: "0.0.0.0:50051".into(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DatabaseSection {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            url: "sqlite:parley.db?mode=rwc".into(),
            max_connections: 5,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RoutingSection {
    pub outbound_queue_capacity: usize,
    pub max_message_len: usize,
    pub group_post_policy: GroupPostPolicy,
}

impl Default for RoutingSection {
    fn default() -> Self {
        Self {
            outbound_queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_message_len: DEFAULT_MAX_MESSAGE_LEN,
            group_post_policy: GroupPostPolicy::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct AuthSection {
    /// Refuse handshakes from identities with no account.
    pub require_registered_user: bool,
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            require_registered_user: true,
        }
    }
}

impl ServerConfig {
    /// Load config from a TOML file. Falls back to defaults if the file doesn't exist.
    /// Environment variables override TOML values.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let mut config = if Path::new(path).exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {}", path))?;
            Self::from_toml(&contents)
                .with_context(|| format!("failed to parse config file {}", path))?
        } else {
            info!("No config file found at {}, using defaults", path);
            Self::default()
        };

        config.apply_env_overrides();
        config.normalize();
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("BIND_ADDRESS") {
            self.server.address = v;
        }
        if let Ok(v) = std::env::var("DATABASE_URL") {
            self.database.url = v;
        }
        if let Ok(v) = std::env::var("DATABASE_MAX_CONNECTIONS")
            && let Ok(n) = v.parse()
        {
            self.database.max_connections = n;
        }
        if let Ok(v) = std::env::var("OUTBOUND_QUEUE_CAPACITY")
            && let Ok(n) = v.parse()
        {
            self.routing.outbound_queue_capacity = n;
        }
        if let Ok(v) = std::env::var("MAX_MESSAGE_LEN")
            && let Ok(n) = v.parse()
        {
            self.routing.max_message_len = n;
        }
        if let Ok(v) = std::env::var("GROUP_POST_POLICY")
            && let Ok(policy) = v.parse()
        {
            self.routing.group_post_policy = policy;
        }
        if let Ok(v) = std::env::var("REQUIRE_REGISTERED_USER")
            && let Ok(flag) = v.parse()
        {
            self.auth.require_registered_user = flag;
        }
    }

    fn normalize(&mut self) {
        self.routing.outbound_queue_capacity = self.routing.outbound_queue_capacity.max(1);
        self.database.max_connections = self.database.max_connections.max(1);
    }

    pub fn router_options(&self) -> RouterOptions {
        RouterOptions {
            max_message_len: self.routing.max_message_len,
            group_post_policy: self.routing.group_post_policy,
        }
    }
}
