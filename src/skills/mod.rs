//! Skill executables cache.
//!
//! Skills registered with the gateway declare the executables they ship.
//! Those names may be auto-allowed; the set is fetched lazily and kept for
//! a TTL. A failed refresh keeps the last good set.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::logging::targets;

/// Default cache lifetime (90 seconds).
pub const DEFAULT_SKILL_BINS_TTL_MS: u64 = 90_000;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SkillsError {
    #[error("skill bins lookup failed: {0}")]
    Lookup(String),
}

/// Where the trusted executable names come from.
#[async_trait]
pub trait SkillBinsSource: Send + Sync {
    async fn fetch_bins(&self) -> Result<Vec<String>, SkillsError>;
}

#[derive(Debug, Default)]
struct CacheState {
    bins: HashSet<String>,
    refreshed_at: Option<Instant>,
}

pub struct SkillBinsCache {
    source: Arc<dyn SkillBinsSource>,
    ttl: Duration,
    state: Mutex<CacheState>,
}

impl std::fmt::Debug for SkillBinsCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SkillBinsCache")
            .field("ttl", &self.ttl)
            .field("source", &"<source>")
            .finish()
    }
}

impl SkillBinsCache {
    pub fn new(source: Arc<dyn SkillBinsSource>, ttl: Duration) -> Self {
        Self {
            source,
            ttl,
            state: Mutex::new(CacheState::default()),
        }
    }

    /// Current set of skill executable names, refreshing when stale or
    /// when `force` is set.
    pub async fn current(&self, force: bool) -> HashSet<String> {
        let mut state = self.state.lock().await;
        let stale = match state.refreshed_at {
            Some(at) => at.elapsed() >= self.ttl,
            None => true,
        };
        if force || stale {
            match self.source.fetch_bins().await {
                Ok(bins) => {
                    state.bins = bins.iter().filter_map(|b| normalize_bin(b)).collect();
                    state.refreshed_at = Some(Instant::now());
                    tracing::debug!(
                        target: targets::SKILLS,
                        count = state.bins.len(),
                        "skill bins refreshed"
                    );
                }
                Err(e) => {
                    // Keep the previous set; retry on the next call.
                    tracing::warn!(
                        target: targets::SKILLS,
                        error = %e,
                        kept = state.bins.len(),
                        "skill bins refresh failed"
                    );
                }
            }
        }
        state.bins.clone()
    }

    /// Whether `executable` (a path or bare name) is a skill binary.
    pub async fn contains(&self, executable: &str) -> bool {
        let Some(name) = normalize_bin(executable) else {
            return false;
        };
        self.current(false).await.contains(&name)
    }
}

/// File name of a bin, lowercased on Windows.
fn normalize_bin(raw: &str) -> Option<String> {
    let name = crate::exec::which::executable_name(raw);
    if name.is_empty() {
        return None;
    }
    if cfg!(windows) {
        Some(name.to_ascii_lowercase())
    } else {
        Some(name)
    }
}
