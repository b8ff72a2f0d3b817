//! CLI subcommand definitions and handlers.
//!
//! Uses clap derive to define the subcommand hierarchy:
//! - `run` (default) -- connect to the gateway and serve invokes
//! - `which <bins...>` -- resolve executables the way `system.which` does
//! - `config show|path` -- inspect configuration
//! - `version` -- print build/version info

use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::config::{self, NodeHostConfig};
use crate::exec::which::which_bins;
use crate::logging::redact::redact_json_value;

/// Carapace node host.
#[derive(Parser, Debug)]
#[command(
    name = "carapace-node",
    version = env!("CARGO_PKG_VERSION"),
    about = "Carapace node host: runs commands on behalf of a carapace gateway"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Connect to the gateway and serve (default when no subcommand is given).
    Run(RunArgs),

    /// Resolve executables on PATH and print them as JSON.
    Which {
        /// Executable names to look up.
        #[arg(required = true)]
        bins: Vec<String>,
    },

    /// Inspect configuration.
    #[command(subcommand)]
    Config(ConfigCommand),

    /// Print version and platform information.
    Version,
}

/// Overrides for the `run` command; each wins over the config file.
#[derive(Args, Debug, Default, Clone, PartialEq)]
pub struct RunArgs {
    /// Gateway host.
    #[arg(long)]
    pub host: Option<String>,

    /// Gateway port.
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Connect with TLS.
    #[arg(long)]
    pub tls: bool,

    /// Pin the gateway certificate by SHA-256 fingerprint (implies --tls).
    #[arg(long)]
    pub tls_fingerprint: Option<String>,

    /// Display name announced to the gateway.
    #[arg(long)]
    pub display_name: Option<String>,

    /// Node id to announce instead of the stored one.
    #[arg(long)]
    pub node_id: Option<String>,
}

impl RunArgs {
    pub fn apply(&self, config: &mut NodeHostConfig) {
        if let Some(host) = &self.host {
            config.gateway.host = host.clone();
        }
        if let Some(port) = self.port {
            config.gateway.port = port;
        }
        if self.tls {
            config.gateway.tls.enabled = true;
        }
        if let Some(fingerprint) = &self.tls_fingerprint {
            config.gateway.tls.enabled = true;
            config.gateway.tls.fingerprint = Some(fingerprint.clone());
        }
        if let Some(name) = &self.display_name {
            config.node.display_name = Some(name.clone());
        }
        if let Some(id) = &self.node_id {
            config.node.id = Some(id.clone());
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Print the effective configuration with secrets redacted.
    Show,
    /// Print the config file path.
    Path,
}

/// Run the `which` subcommand.
pub fn handle_which(bins: &[String]) -> Result<(), Box<dyn std::error::Error>> {
    let path_var = std::env::var_os("PATH");
    let found: BTreeMap<String, String> = which_bins(bins, path_var.as_ref());
    println!("{}", serde_json::to_string_pretty(&found)?);
    Ok(())
}

/// Run the `config show` subcommand.
pub fn handle_config_show() -> Result<(), Box<dyn std::error::Error>> {
    let cfg = NodeHostConfig::load()?;
    println!("{}", serde_json::to_string_pretty(&effective_config(&cfg)?)?);
    Ok(())
}

/// Effective configuration as JSON, secrets masked, with the resolved paths.
fn effective_config(cfg: &NodeHostConfig) -> Result<Value, serde_json::Error> {
    let mut value = serde_json::to_value(cfg)?;
    redact_json_value(&mut value);
    if let Value::Object(map) = &mut value {
        map.insert(
            "stateDir".to_string(),
            Value::String(cfg.state_dir.display().to_string()),
        );
        if let Some(Value::Object(exec)) = map.get_mut("exec") {
            exec.insert(
                "approvalsPath".to_string(),
                Value::String(cfg.approvals_path().display().to_string()),
            );
        }
    }
    Ok(value)
}

/// Run the `config path` subcommand.
pub fn handle_config_path() {
    println!("{}", config::get_config_path().display());
}

/// Run the `version` subcommand.
pub fn handle_version() {
    println!("carapace-node {}", env!("CARGO_PKG_VERSION"));
    println!(
        "  Platform:   {} ({})",
        std::env::consts::OS,
        std::env::consts::ARCH
    );
}
