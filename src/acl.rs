//! Operator access control.
//!
//! `GLOBAL_SUDO` user ids are hashed at startup so plain ids never sit in
//! memory or logs; sudo checks compare hashes. An optional rules file adds
//! finer-grained allow/deny entries and is hot-reloaded: a watcher task
//! polls the file's modification time and swaps in a fresh snapshot, so
//! evaluation never blocks on I/O.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::error::{CoreError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AclAction {
    Allow,
    Deny,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AclRule {
    pub action: AclAction,
    pub matcher: AclMatcher,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AclMatcher {
    Wildcard,
    UserId { user_id: String },
    Platform { platform: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AclFileConfig {
    #[serde(default = "AclFileConfig::default_action")]
    pub default_action: AclAction,
    #[serde(default)]
    pub rules: Vec<AclRule>,
}

impl AclFileConfig {
    fn default_action() -> AclAction {
        AclAction::Allow
    }
}

impl Default for AclFileConfig {
    fn default() -> Self {
        Self {
            default_action: AclAction::Allow,
            rules: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
struct AclSnapshot {
    config: AclFileConfig,
}

impl AclSnapshot {
    fn evaluate(&self, platform: &str, user_id: &str) -> AclAction {
        for rule in &self.config.rules {
            let hit = match &rule.matcher {
                AclMatcher::Wildcard => true,
                AclMatcher::UserId { user_id: id } => id == user_id,
                AclMatcher::Platform { platform: p } => p.eq_ignore_ascii_case(platform),
            };
            if hit {
                return rule.action;
            }
        }
        self.config.default_action
    }
}

pub struct Acl {
    sudo_hashes: HashSet<String>,
    snapshot: RwLock<Arc<AclSnapshot>>,
    path: Option<PathBuf>,
}

fn hash_id(user_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(user_id.trim().as_bytes());
    hex::encode(hasher.finalize())
}

impl Acl {
    /// Build from the `GLOBAL_SUDO` list and an optional rules file.
    pub fn new(global_sudo: Option<&str>, acl_path: Option<&str>) -> Result<Self> {
        let sudo_hashes = global_sudo
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|id| !id.is_empty())
                    .map(hash_id)
                    .collect()
            })
            .unwrap_or_default();

        let path = acl_path.map(PathBuf::from);
        let snapshot = match &path {
            Some(path) => Arc::new(AclSnapshot {
                config: load_rules(path)?,
            }),
            None => Arc::new(AclSnapshot::default()),
        };

        Ok(Self {
            sudo_hashes,
            snapshot: RwLock::new(snapshot),
            path,
        })
    }

    pub fn is_sudo(&self, user_id: &str) -> bool {
        self.sudo_hashes.contains(&hash_id(user_id))
    }

    pub fn evaluate(&self, platform: &str, user_id: &str) -> AclAction {
        self.snapshot
            .read()
            .expect("acl lock")
            .evaluate(platform, user_id)
    }

    /// Spawn the file watcher; swaps a fresh snapshot in when the rules file
    /// changes. No-op without a configured path.
    pub fn spawn_watcher(self: Arc<Self>, poll_interval: Duration) {
        let Some(path) = self.path.clone() else {
            return;
        };
        let acl = self;
        tokio::spawn(async move {
            let mut last_modified = modified_at(&path);
            let mut ticker = tokio::time::interval(poll_interval);
            loop {
                ticker.tick().await;
                let current = modified_at(&path);
                if current == last_modified {
                    continue;
                }
                last_modified = current;
                match load_rules(&path) {
                    Ok(config) => {
                        let rules = config.rules.len();
                        *acl.snapshot.write().expect("acl lock") =
                            Arc::new(AclSnapshot { config });
                        info!(path = %path.display(), rules, "ACL rules reloaded");
                    }
                    Err(err) => {
                        warn!(path = %path.display(), error = %err, "Keeping previous ACL snapshot");
                    }
                }
            }
        });
    }
}

// mtime alone misses rapid rewrites on coarse-granularity filesystems, so
// the size is part of the change signature.
fn modified_at(path: &PathBuf) -> Option<(SystemTime, u64)> {
    std::fs::metadata(path)
        .ok()
        .and_then(|m| m.modified().ok().map(|t| (t, m.len())))
}

fn load_rules(path: &PathBuf) -> Result<AclFileConfig> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| CoreError::InvalidConfig(format!("read {}: {e}", path.display())))?;
    toml::from_str(&raw)
        .map_err(|e| CoreError::InvalidConfig(format!("parse {}: {e}", path.display())))
}
