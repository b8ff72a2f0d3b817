//! Configuration parsing module
//!
//! Handles the node host's JSON5 configuration file with environment
//! variable substitution, and exposes a typed [`NodeHostConfig`] view with
//! production defaults for every missing field.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;
use thiserror::Error;

use crate::exec::approval_client::DEFAULT_APPROVAL_TIMEOUT_MS;
use crate::exec::approvals::EXEC_APPROVALS_FILE_NAME;
use crate::exec::output::{DEFAULT_EVENT_TAIL_CHARS, DEFAULT_OUTPUT_CAP_CHARS};
use crate::logging::targets;
use crate::skills::DEFAULT_SKILL_BINS_TTL_MS;
use crate::tls::TlsClientOptions;

pub const CONFIG_PATH_ENV: &str = "CARAPACE_NODE_CONFIG_PATH";
pub const STATE_DIR_ENV: &str = "CARAPACE_NODE_STATE_DIR";
pub const STATE_DIR_NAME: &str = ".carapace-node";
pub const NODE_STATE_FILE_NAME: &str = "node.json";

pub const DEFAULT_GATEWAY_HOST: &str = "127.0.0.1";
pub const DEFAULT_GATEWAY_PORT: u16 = 18790;
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 1500;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to parse JSON5 at {path}: {message}")]
    ParseError { path: String, message: String },

    #[error("Failed to read config file {path}: {message}")]
    ReadError { path: String, message: String },

    #[error("Missing environment variable: {var}")]
    MissingEnvVar { var: String },

    #[error("Invalid configuration at {path}: {message}")]
    ValidationError { path: String, message: String },
}

/// Directory holding node state, the approvals file, and the default config.
/// Priority: CARAPACE_NODE_STATE_DIR > ~/.carapace-node
pub fn state_dir() -> PathBuf {
    if let Ok(dir) = env::var(STATE_DIR_ENV) {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(STATE_DIR_NAME)
}

/// Get the config file path.
/// Priority: CARAPACE_NODE_CONFIG_PATH > CARAPACE_NODE_STATE_DIR/config.json5 > ~/.carapace-node/config.json5
/// Falls back to .json extension if the .json5 file doesn't exist.
pub fn get_config_path() -> PathBuf {
    if let Ok(path) = env::var(CONFIG_PATH_ENV) {
        return PathBuf::from(path);
    }

    let dir = state_dir();
    let json5 = dir.join("config.json5");
    if json5.exists() {
        return json5;
    }
    dir.join("config.json")
}

/// Load and parse a config file into a JSON value.
/// Returns an empty object if the file doesn't exist.
pub fn load_config_value(path: &Path) -> Result<Value, ConfigError> {
    if !path.exists() {
        return Ok(Value::Object(serde_json::Map::new()));
    }

    let content = fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;

    let mut value = parse_json5(&content, path)?;
    substitute_env_vars(&mut value)?;

    if !value.is_object() {
        return Err(ConfigError::ValidationError {
            path: ".".to_string(),
            message: "config root must be an object".to_string(),
        });
    }
    Ok(value)
}

/// Parse JSON5 content
fn parse_json5(content: &str, path: &Path) -> Result<Value, ConfigError> {
    json5::from_str(content).map_err(|e| ConfigError::ParseError {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}

/// Substitute environment variables in string values.
/// Pattern: ${VAR} where VAR matches [A-Z_][A-Z0-9_]*
/// Escape with $${VAR} to get literal ${VAR}
fn substitute_env_vars(value: &mut Value) -> Result<(), ConfigError> {
    match value {
        Value::String(s) => {
            *s = substitute_env_in_string(s)?;
        }
        Value::Object(obj) => {
            for (_, v) in obj.iter_mut() {
                substitute_env_vars(v)?;
            }
        }
        Value::Array(arr) => {
            for item in arr.iter_mut() {
                substitute_env_vars(item)?;
            }
        }
        _ => {}
    }
    Ok(())
}

fn substitute_env_in_string(s: &str) -> Result<String, ConfigError> {
    static ENV_VAR_PATTERN: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\$\$?\{([A-Z_][A-Z0-9_]*)\}").unwrap());

    let mut result = String::with_capacity(s.len());
    let mut last_end = 0;

    for caps in ENV_VAR_PATTERN.captures_iter(s) {
        let (Some(full_match), Some(var)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let var_name = var.as_str();

        result.push_str(&s[last_end..full_match.start()]);

        if full_match.as_str().starts_with("$$") {
            result.push_str(&format!("${{{}}}", var_name));
        } else {
            let value = env::var(var_name).map_err(|_| ConfigError::MissingEnvVar {
                var: var_name.to_string(),
            })?;
            result.push_str(&value);
        }

        last_end = full_match.end();
    }

    result.push_str(&s[last_end..]);
    Ok(result)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GatewayTlsConfig {
    pub enabled: bool,
    /// SHA-256 pin of the gateway's leaf certificate.
    pub fingerprint: Option<String>,
    /// Extra PEM roots trusted alongside the webpki set.
    pub ca_path: Option<PathBuf>,
    pub server_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    pub tls: GatewayTlsConfig,
    pub reconnect_delay_ms: u64,
    /// 0 waits indefinitely.
    pub handshake_timeout_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_GATEWAY_HOST.to_string(),
            port: DEFAULT_GATEWAY_PORT,
            tls: GatewayTlsConfig::default(),
            reconnect_delay_ms: DEFAULT_RECONNECT_DELAY_MS,
            handshake_timeout_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeSection {
    pub id: Option<String>,
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecConfig {
    pub output_cap_chars: usize,
    pub event_tail_chars: usize,
    pub approval_timeout_ms: u64,
    pub skill_bins_ttl_ms: u64,
    pub approvals_path: Option<PathBuf>,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            output_cap_chars: DEFAULT_OUTPUT_CAP_CHARS,
            event_tail_chars: DEFAULT_EVENT_TAIL_CHARS,
            approval_timeout_ms: DEFAULT_APPROVAL_TIMEOUT_MS,
            skill_bins_ttl_ms: DEFAULT_SKILL_BINS_TTL_MS,
            approvals_path: None,
        }
    }
}

/// Typed node host configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeHostConfig {
    pub gateway: GatewayConfig,
    pub node: NodeSection,
    pub exec: ExecConfig,
    pub permissions: HashMap<String, bool>,
    #[serde(skip)]
    pub state_dir: PathBuf,
}

impl Default for NodeHostConfig {
    fn default() -> Self {
        Self {
            gateway: GatewayConfig::default(),
            node: NodeSection::default(),
            exec: ExecConfig::default(),
            permissions: HashMap::new(),
            state_dir: state_dir(),
        }
    }
}

impl NodeHostConfig {
    /// Load from the default location.
    pub fn load() -> Result<Self, ConfigError> {
        let path = get_config_path();
        tracing::debug!(target: targets::CONFIG, path = %path.display(), "loading config");
        let value = load_config_value(&path)?;
        Self::from_value(value, state_dir())
    }

    pub fn from_value(value: Value, state_dir: PathBuf) -> Result<Self, ConfigError> {
        let mut config: Self =
            serde_json::from_value(value).map_err(|e| ConfigError::ValidationError {
                path: ".".to_string(),
                message: e.to_string(),
            })?;
        config.state_dir = state_dir;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.gateway.host.trim().is_empty() {
            return Err(ConfigError::ValidationError {
                path: ".gateway.host".to_string(),
                message: "host must not be empty".to_string(),
            });
        }
        if self.gateway.port == 0 {
            return Err(ConfigError::ValidationError {
                path: ".gateway.port".to_string(),
                message: "port must be between 1 and 65535".to_string(),
            });
        }
        if self.exec.output_cap_chars == 0 {
            return Err(ConfigError::ValidationError {
                path: ".exec.outputCapChars".to_string(),
                message: "outputCapChars must be positive".to_string(),
            });
        }
        Ok(())
    }

    pub fn node_state_path(&self) -> PathBuf {
        self.state_dir.join(NODE_STATE_FILE_NAME)
    }

    pub fn approvals_path(&self) -> PathBuf {
        self.exec
            .approvals_path
            .clone()
            .unwrap_or_else(|| self.state_dir.join(EXEC_APPROVALS_FILE_NAME))
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.gateway.reconnect_delay_ms)
    }

    pub fn handshake_timeout(&self) -> Option<Duration> {
        match self.gateway.handshake_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    pub fn approval_timeout(&self) -> Duration {
        Duration::from_millis(self.exec.approval_timeout_ms)
    }

    pub fn skill_bins_ttl(&self) -> Duration {
        Duration::from_millis(self.exec.skill_bins_ttl_ms)
    }

    /// TLS settings, or `None` for a plain TCP connection. A configured pin
    /// turns TLS on.
    pub fn tls_options(&self) -> Option<TlsClientOptions> {
        let tls = &self.gateway.tls;
        let pinned = tls
            .fingerprint
            .as_deref()
            .is_some_and(|f| !f.trim().is_empty());
        if !tls.enabled && !pinned {
            return None;
        }
        Some(TlsClientOptions {
            fingerprint: tls.fingerprint.clone().filter(|f| !f.trim().is_empty()),
            ca_path: tls.ca_path.clone(),
            server_name: tls.server_name.clone(),
        })
    }
}
