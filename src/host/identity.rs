//! Persisted node identity: node id, pairing token, last gateway.
//!
//! Stored as `node.json` in the state directory. A file that fails to parse
//! is moved aside (`node.corrupt.<ts>.json`) and a fresh identity is minted;
//! the gateway will then ask for pairing again.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write as IoWrite;
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

use crate::exec::now_ms;

const STATE_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Gateway the node last connected to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayHint {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub tls: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeState {
    pub version: u32,
    pub node_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<GatewayHint>,
}

impl std::fmt::Debug for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeState")
            .field("version", &self.version)
            .field("node_id", &self.node_id)
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .field("display_name", &self.display_name)
            .field("gateway", &self.gateway)
            .finish()
    }
}

impl NodeState {
    fn fresh(node_id: Option<&str>) -> Self {
        Self {
            version: STATE_VERSION,
            node_id: node_id
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            token: None,
            display_name: None,
            gateway: None,
        }
    }
}

/// Thread-safe identity store with write-through persistence.
pub struct IdentityStore {
    path: PathBuf,
    state: RwLock<NodeState>,
}

impl std::fmt::Debug for IdentityStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityStore")
            .field("path", &self.path)
            .field("state", &*self.state.read())
            .finish()
    }
}

impl IdentityStore {
    /// Load the identity at `path`, creating (and saving) one if needed.
    ///
    /// `node_id` overrides the stored id; changing it drops the stored token
    /// since tokens are issued per node id.
    pub fn load_or_create(
        path: impl Into<PathBuf>,
        node_id: Option<&str>,
    ) -> Result<Self, IdentityError> {
        let path = path.into();
        let mut state = match Self::read_state(&path)? {
            Some(state) => state,
            None => NodeState::fresh(node_id),
        };

        if let Some(wanted) = node_id.map(str::trim).filter(|id| !id.is_empty()) {
            if wanted != state.node_id {
                tracing::info!(
                    previous = %state.node_id,
                    node_id = %wanted,
                    "node id changed, discarding pairing token"
                );
                state.node_id = wanted.to_string();
                state.token = None;
            }
        }
        state.version = STATE_VERSION;

        let store = Self {
            path,
            state: RwLock::new(state),
        };
        store.save()?;
        Ok(store)
    }

    fn read_state(path: &Path) -> Result<Option<NodeState>, IdentityError> {
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path).map_err(|source| IdentityError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        match serde_json::from_str::<NodeState>(&content) {
            Ok(state) if !state.node_id.trim().is_empty() => Ok(Some(state)),
            Ok(_) => {
                backup_corrupt(path, "missing nodeId");
                Ok(None)
            }
            Err(e) => {
                backup_corrupt(path, &e.to_string());
                Ok(None)
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> NodeState {
        self.state.read().clone()
    }

    pub fn node_id(&self) -> String {
        self.state.read().node_id.clone()
    }

    pub fn token(&self) -> Option<String> {
        self.state.read().token.clone()
    }

    pub fn set_token(&self, token: Option<String>) -> Result<(), IdentityError> {
        self.state.write().token = token;
        self.save()
    }

    pub fn set_display_name(&self, name: Option<String>) -> Result<(), IdentityError> {
        let mut state = self.state.write();
        if state.display_name == name {
            return Ok(());
        }
        state.display_name = name;
        drop(state);
        self.save()
    }

    pub fn set_gateway(&self, gateway: GatewayHint) -> Result<(), IdentityError> {
        let mut state = self.state.write();
        if state.gateway.as_ref() == Some(&gateway) {
            return Ok(());
        }
        state.gateway = Some(gateway);
        drop(state);
        self.save()
    }

    fn save(&self) -> Result<(), IdentityError> {
        let io_err = |source| IdentityError::Io {
            path: self.path.clone(),
            source,
        };

        let content = serde_json::to_string_pretty(&*self.state.read())?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }

        let temp_path = self.path.with_extension("json.tmp");
        let mut file = File::create(&temp_path).map_err(io_err)?;
        IoWrite::write_all(&mut file, content.as_bytes()).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
        drop(file);
        restrict_permissions(&temp_path);
        fs::rename(&temp_path, &self.path).map_err(io_err)?;
        Ok(())
    }
}

fn backup_corrupt(path: &Path, reason: &str) {
    let backup = path.with_extension(format!("corrupt.{}.json", now_ms()));
    if let Err(err) = fs::rename(path, &backup) {
        tracing::warn!(
            path = %path.display(),
            backup = %backup.display(),
            error = %err,
            "failed to backup corrupted node state"
        );
    } else {
        tracing::warn!(
            path = %path.display(),
            backup = %backup.display(),
            reason = %reason,
            "backed up corrupted node state"
        );
    }
}

/// The pairing token is a bearer secret.
#[cfg(unix)]
fn restrict_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(0o600)) {
        tracing::debug!(error = %e, "could not restrict node state file mode");
    }
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) {}
