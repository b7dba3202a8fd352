//! Server configuration data structures for Atrium.
//!
//! These types map directly to TOML (also JSON / YAML) configuration files. They are
//! serde‑friendly and carry defaults so that a minimal config only needs the pieces
//! that differ. Per-application routing is not configured here: it lives in the JSON
//! definition files under `webapps_dir` and is hot-reloaded independently.
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

fn default_listen_addr() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_webapps_dir() -> String {
    "./webapps".to_string()
}

fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024
}

/// Process-wide routes that exist regardless of any application definition.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ReservedRoutesConfig {
    /// File served for `/favicon.ico`; a 404 is returned when unset
    pub favicon: Option<String>,
    /// Directory of shared resources served under `resources_prefix`
    pub resources_dir: Option<String>,
    /// URL prefix for shared resources (e.g., "/_static")
    pub resources_prefix: String,
    /// JSON status endpoint listing the published applications
    pub status_path: String,
}

impl Default for ReservedRoutesConfig {
    fn default() -> Self {
        Self {
            favicon: None,
            resources_dir: None,
            resources_prefix: "/_static".to_string(),
            status_path: "/_status".to_string(),
        }
    }
}

/// Caching policy for files served through static rules.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct StaticsConfig {
    pub max_age_secs: u64,
}

impl Default for StaticsConfig {
    fn default() -> Self {
        Self {
            max_age_secs: 86_400,
        }
    }
}

/// Session cookie and idle expiry settings.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SessionConfig {
    pub cookie_name: String,
    /// Sessions idle for longer than this are expired and invalidated everywhere
    pub idle_timeout_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cookie_name: "ATRIUMSESSIONID".to_string(),
            idle_timeout_secs: 1800,
            sweep_interval_secs: 60,
        }
    }
}

/// Limits applied to every interpreted controller.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ScriptConfig {
    /// File extension (without dot) identifying script controllers
    pub extension: String,
    pub max_operations: u64,
    pub max_call_levels: usize,
    pub max_string_size: usize,
    pub max_array_size: usize,
    pub max_map_size: usize,
}

impl Default for ScriptConfig {
    fn default() -> Self {
        Self {
            extension: "rhai".to_string(),
            max_operations: 1_000_000,
            max_call_levels: 64,
            max_string_size: 4 * 1024 * 1024,
            max_array_size: 100_000,
            max_map_size: 100_000,
        }
    }
}

/// Hot reload of application definition files.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ReloadConfig {
    pub enabled: bool,
    /// Quiet period used to coalesce bursts of file events
    pub debounce_ms: u64,
}

impl Default for ReloadConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            debounce_ms: 250,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Root directory holding one sub-directory per application
    #[serde(default = "default_webapps_dir")]
    pub webapps_dir: String,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    #[serde(default)]
    pub reserved: ReservedRoutesConfig,
    #[serde(default)]
    pub statics: StaticsConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub scripts: ScriptConfig,
    #[serde(default)]
    pub reload: ReloadConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Named values published to controllers through the tool registry
    #[serde(default)]
    pub tools: HashMap<String, serde_json::Value>,
}

impl ServerConfig {
    /// Create a new server configuration builder
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::default()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            webapps_dir: default_webapps_dir(),
            max_body_bytes: default_max_body_bytes(),
            reserved: ReservedRoutesConfig::default(),
            statics: StaticsConfig::default(),
            session: SessionConfig::default(),
            scripts: ScriptConfig::default(),
            reload: ReloadConfig::default(),
            logging: LoggingConfig::default(),
            tools: HashMap::new(),
        }
    }
}

/// Builder for ServerConfig, mostly used when embedding or in tests
#[derive(Default)]
pub struct ServerConfigBuilder {
    config: ServerConfig,
}

impl ServerConfigBuilder {
    pub fn listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.listen_addr = addr.into();
        self
    }

    pub fn webapps_dir(mut self, dir: impl Into<String>) -> Self {
        self.config.webapps_dir = dir.into();
        self
    }

    pub fn max_body_bytes(mut self, limit: usize) -> Self {
        self.config.max_body_bytes = limit;
        self
    }

    pub fn reserved(mut self, reserved: ReservedRoutesConfig) -> Self {
        self.config.reserved = reserved;
        self
    }

    pub fn session(mut self, session: SessionConfig) -> Self {
        self.config.session = session;
        self
    }

    pub fn scripts(mut self, scripts: ScriptConfig) -> Self {
        self.config.scripts = scripts;
        self
    }

    pub fn reload(mut self, reload: ReloadConfig) -> Self {
        self.config.reload = reload;
        self
    }

    /// Publish a named value to controllers
    pub fn tool(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.config.tools.insert(name.into(), value);
        self
    }

    pub fn build(self) -> ServerConfig {
        self.config
    }
}
