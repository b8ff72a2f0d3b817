//! Exec approvals file: per-agent policy and learned allowlists.
//!
//! The file lives next to the node state (`exec-approvals.json`) and is
//! shared by every connection the host makes. Writes are atomic
//! (tmp + fsync + rename) and return the SHA-256 of the bytes written so
//! remote editors can use it as an optimistic-concurrency token.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

use crate::logging::targets;

use super::now_ms;
use super::policy::{
    normalize_agent_id, pattern_matches, ExecPolicy, PolicyOverrides, WILDCARD_AGENT_ID,
};

pub const EXEC_APPROVALS_FILE_NAME: &str = "exec-approvals.json";
pub const EXEC_APPROVALS_SOCKET_NAME: &str = "exec-approvals.sock";
const FILE_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum ApprovalsError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid exec approvals file: {0}")]
    Invalid(String),

    #[error("baseHash required; re-read the approvals file and retry")]
    BaseHashRequired,

    #[error("exec approvals changed since last load; re-read and retry")]
    BaseHashMismatch,
}

/// Approval socket settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocketConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// A learned allowlist pattern. The owning agent is the map key it sits
/// under in [`ExecApprovalsFile::agents`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllowlistEntry {
    #[serde(default = "new_entry_id")]
    pub id: String,
    pub pattern: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<u64>,
    #[serde(default)]
    pub use_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used_command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_resolved_path: Option<String>,
}

impl AllowlistEntry {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            id: new_entry_id(),
            pattern: pattern.into(),
            last_used_at: None,
            use_count: 0,
            last_used_command: None,
            last_resolved_path: None,
        }
    }
}

fn new_entry_id() -> String {
    Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentApprovals {
    #[serde(flatten)]
    pub policy: PolicyOverrides,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowlist: Vec<AllowlistEntry>,
}

/// On-disk shape of `exec-approvals.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecApprovalsFile {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket: Option<SocketConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub defaults: Option<PolicyOverrides>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub agents: BTreeMap<String, AgentApprovals>,
}

fn default_version() -> u32 {
    FILE_VERSION
}

impl Default for ExecApprovalsFile {
    fn default() -> Self {
        Self {
            version: FILE_VERSION,
            socket: None,
            defaults: None,
            agents: BTreeMap::new(),
        }
    }
}

impl ExecApprovalsFile {
    /// Effective policy for `agent_id`: built-in defaults, then the file
    /// defaults, then the agent's own entry.
    pub fn resolve_policy(&self, agent_id: Option<&str>) -> ExecPolicy {
        let agent = normalize_agent_id(agent_id);
        ExecPolicy::default()
            .apply(self.defaults.as_ref())
            .apply(self.agents.get(&agent).map(|a| &a.policy))
    }

    /// Copy without the socket token, for handing to remote readers.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if let Some(socket) = copy.socket.as_mut() {
            socket.token = None;
        }
        copy
    }

    /// First allowlist entry matching the command, searching the agent's own
    /// list before the wildcard list.
    pub fn find_allowlist_match(
        &self,
        agent_id: Option<&str>,
        resolved_path: Option<&str>,
        raw_executable: &str,
    ) -> Option<AllowlistMatch> {
        let agent = normalize_agent_id(agent_id);
        let mut owners = vec![agent];
        if owners[0] != WILDCARD_AGENT_ID {
            owners.push(WILDCARD_AGENT_ID.to_string());
        }
        owners.into_iter().find_map(|owner| {
            self.agents.get(&owner).and_then(|approvals| {
                approvals
                    .allowlist
                    .iter()
                    .find(|e| pattern_matches(&e.pattern, resolved_path, raw_executable))
                    .map(|e| AllowlistMatch {
                        agent_key: owner.clone(),
                        entry_id: e.id.clone(),
                        pattern: e.pattern.clone(),
                    })
            })
        })
    }
}

/// Which entry approved a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllowlistMatch {
    pub agent_key: String,
    pub entry_id: String,
    pub pattern: String,
}

/// Result of reading the approvals file for a remote client.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApprovalsSnapshot {
    pub path: String,
    pub exists: bool,
    pub hash: Option<String>,
    pub file: ExecApprovalsFile,
}

/// Shared handle on the approvals file.
///
/// Every read goes to disk so edits made by other tools are picked up; the
/// mutex serializes read-modify-write cycles within this process.
#[derive(Debug)]
pub struct ApprovalsStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl ApprovalsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Approval socket path: the configured one, else next to the file.
    pub fn socket_path(&self, file: &ExecApprovalsFile) -> PathBuf {
        file.socket
            .as_ref()
            .and_then(|s| s.path.as_deref())
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                self.path
                    .parent()
                    .map(|dir| dir.join(EXEC_APPROVALS_SOCKET_NAME))
                    .unwrap_or_else(|| PathBuf::from(EXEC_APPROVALS_SOCKET_NAME))
            })
    }

    /// Read and parse the file. A missing file yields defaults.
    pub fn load(&self) -> Result<ExecApprovalsFile, ApprovalsError> {
        match self.read_raw()? {
            Some(raw) => parse_file(&raw),
            None => Ok(ExecApprovalsFile::default()),
        }
    }

    /// Like [`load`](Self::load), but an unreadable or corrupt file degrades
    /// to defaults (security=deny) with a warning.
    pub fn load_or_default(&self) -> ExecApprovalsFile {
        match self.load() {
            Ok(file) => file,
            Err(e) => {
                tracing::warn!(
                    target: targets::APPROVALS,
                    path = %self.path.display(),
                    error = %e,
                    "exec approvals unreadable, using defaults"
                );
                ExecApprovalsFile::default()
            }
        }
    }

    /// Current file for remote display: token stripped, hash of the raw bytes.
    pub fn snapshot(&self) -> Result<ApprovalsSnapshot, ApprovalsError> {
        let path = self.path.display().to_string();
        match self.read_raw()? {
            None => Ok(ApprovalsSnapshot {
                path,
                exists: false,
                hash: None,
                file: ExecApprovalsFile::default(),
            }),
            Some(raw) => {
                let file = parse_file(&raw).unwrap_or_else(|e| {
                    tracing::warn!(
                        target: targets::APPROVALS,
                        error = %e,
                        "exec approvals corrupt"
                    );
                    ExecApprovalsFile::default()
                });
                Ok(ApprovalsSnapshot {
                    path,
                    exists: true,
                    hash: Some(sha256_hex(raw.as_bytes())),
                    file: file.redacted(),
                })
            }
        }
    }

    /// Replace the file with a remotely edited version.
    ///
    /// When the file already exists `base_hash` must equal its current hash.
    /// A socket token missing from `incoming` is carried over from disk.
    pub fn replace(
        &self,
        incoming: &Value,
        base_hash: Option<&str>,
    ) -> Result<ApprovalsSnapshot, ApprovalsError> {
        if !incoming.is_object() {
            return Err(ApprovalsError::Invalid("file must be an object".to_string()));
        }
        let mut next: ExecApprovalsFile = serde_json::from_value(incoming.clone())
            .map_err(|e| ApprovalsError::Invalid(e.to_string()))?;

        let _guard = self.write_lock.lock();
        let current_raw = self.read_raw()?;
        let mut current = None;
        if let Some(raw) = &current_raw {
            let base_hash = base_hash
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .ok_or(ApprovalsError::BaseHashRequired)?;
            if base_hash != sha256_hex(raw.as_bytes()) {
                return Err(ApprovalsError::BaseHashMismatch);
            }
            current = parse_file(raw).ok();
        }

        if let Some(existing) = current.as_ref().and_then(|f| f.socket.as_ref()) {
            let socket = next.socket.get_or_insert_with(SocketConfig::default);
            if socket.token.is_none() {
                socket.token = existing.token.clone();
            }
            if socket.path.is_none() {
                socket.path = existing.path.clone();
            }
        }
        next.version = FILE_VERSION;

        let hash = self.write_file(&next)?;
        tracing::info!(
            target: targets::APPROVALS,
            path = %self.path.display(),
            "exec approvals replaced"
        );
        Ok(ApprovalsSnapshot {
            path: self.path.display().to_string(),
            exists: true,
            hash: Some(hash),
            file: next.redacted(),
        })
    }

    /// Persist a new allowlist pattern for `agent_id` (allow-always).
    /// Patterns already present are not duplicated.
    pub fn add_allowlist_entry(
        &self,
        agent_id: Option<&str>,
        pattern: &str,
    ) -> Result<(), ApprovalsError> {
        let pattern = pattern.trim();
        if pattern.is_empty() {
            return Ok(());
        }
        let agent = normalize_agent_id(agent_id);
        self.mutate(|file| {
            let approvals = file.agents.entry(agent.clone()).or_default();
            if approvals.allowlist.iter().any(|e| e.pattern == pattern) {
                return false;
            }
            approvals.allowlist.push(AllowlistEntry::new(pattern));
            true
        })?;
        tracing::info!(
            target: targets::APPROVALS,
            agent = %agent,
            pattern = %pattern,
            "allowlist entry added"
        );
        Ok(())
    }

    /// Record that an allowlist entry approved a command.
    pub fn record_use(
        &self,
        matched: &AllowlistMatch,
        command: &str,
        resolved_path: Option<&str>,
    ) -> Result<(), ApprovalsError> {
        self.mutate(|file| {
            let Some(entry) = file
                .agents
                .get_mut(&matched.agent_key)
                .and_then(|a| a.allowlist.iter_mut().find(|e| e.id == matched.entry_id))
            else {
                return false;
            };
            entry.use_count = entry.use_count.saturating_add(1);
            entry.last_used_at = Some(now_ms());
            entry.last_used_command = Some(command.to_string());
            entry.last_resolved_path = resolved_path.map(str::to_string);
            true
        })
    }

    /// Load, apply `f`, and write back if it reports a change.
    fn mutate<F>(&self, f: F) -> Result<(), ApprovalsError>
    where
        F: FnOnce(&mut ExecApprovalsFile) -> bool,
    {
        let _guard = self.write_lock.lock();
        let mut file = self.load()?;
        if f(&mut file) {
            self.write_file(&file)?;
        }
        Ok(())
    }

    fn read_raw(&self) -> Result<Option<String>, ApprovalsError> {
        match fs::read_to_string(&self.path) {
            Ok(raw) => Ok(Some(raw)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(ApprovalsError::Read {
                path: self.path.clone(),
                source,
            }),
        }
    }

    /// Atomically write the file. Returns the hash of the written bytes.
    fn write_file(&self, file: &ExecApprovalsFile) -> Result<String, ApprovalsError> {
        let write_err = |source| ApprovalsError::Write {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(write_err)?;
        }
        let mut content = serde_json::to_string_pretty(file)
            .map_err(|e| ApprovalsError::Invalid(e.to_string()))?;
        content.push('\n');

        let tmp_path = self.path.with_extension("json.tmp");
        {
            let mut tmp = fs::File::create(&tmp_path).map_err(write_err)?;
            tmp.write_all(content.as_bytes()).map_err(write_err)?;
            tmp.sync_all().map_err(write_err)?;
        }
        restrict_permissions(&tmp_path);
        fs::rename(&tmp_path, &self.path).map_err(write_err)?;

        Ok(sha256_hex(content.as_bytes()))
    }
}

fn parse_file(raw: &str) -> Result<ExecApprovalsFile, ApprovalsError> {
    if raw.trim().is_empty() {
        return Ok(ExecApprovalsFile::default());
    }
    serde_json::from_str(raw).map_err(|e| ApprovalsError::Invalid(e.to_string()))
}

/// The socket token is a secret; keep the file owner-only.
#[cfg(unix)]
fn restrict_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(0o600)) {
        tracing::debug!(
            target: targets::APPROVALS,
            error = %e,
            "could not restrict approvals file mode"
        );
    }
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) {}

/// Lowercase hex SHA-256.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}
