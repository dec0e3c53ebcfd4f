//! Persistent topology store.
//!
//! Bridges, channel links and a small KV table live in a single embedded
//! SQLite file with WAL journaling and foreign keys on. The
//! `(platform, native_id)` unique index enforces that a native channel
//! belongs to at most one bridge; deleting a bridge cascades to its links.
//! Single writer, concurrent readers; SQLite's own journaling carries that
//! discipline, the mutex here only serializes statement use.

use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::error::{CoreError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BridgeStatus {
    On,
    Off,
    Paused,
}

impl BridgeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::On => "on",
            Self::Off => "off",
            Self::Paused => "paused",
        }
    }
}

impl std::str::FromStr for BridgeStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "on" => Ok(Self::On),
            "off" => Ok(Self::Off),
            "paused" => Ok(Self::Paused),
            other => Err(CoreError::Repository(format!(
                "unknown bridge status `{other}`"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Bridge {
    pub id: String,
    pub name: String,
    pub status: BridgeStatus,
    pub created_at: i64,
}

/// Resolution of a source channel: which bridge it feeds and whether that
/// bridge is live.
#[derive(Debug, Clone)]
pub struct ChannelLink {
    pub bridge_id: String,
    pub status: BridgeStatus,
}

/// One destination inside a bridge topology.
#[derive(Debug, Clone)]
pub struct ChannelTarget {
    pub platform: String,
    pub native_id: String,
    pub config: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct LinkRequest {
    pub bridge_id: String,
    pub platform: String,
    pub native_id: String,
    pub config: serde_json::Value,
}

pub struct Repository {
    conn: Arc<Mutex<Connection>>,
}

impl Repository {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| CoreError::Repository(format!("create {parent:?}: {e}")))?;
            }
        }

        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Self::init_schema(&conn)?;

        info!(path = %path.display(), "Topology repository ready");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory store for tests and ephemeral nodes.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS bridges (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                status TEXT DEFAULT 'on' CHECK(status IN ('on','off','paused')),
                created_at INTEGER
            );
            CREATE TABLE IF NOT EXISTS channels (
                id TEXT PRIMARY KEY,
                bridge_id TEXT NOT NULL REFERENCES bridges(id) ON DELETE CASCADE,
                platform TEXT NOT NULL,
                native_id TEXT NOT NULL,
                config TEXT DEFAULT '{}',
                added_at INTEGER,
                UNIQUE(platform, native_id)
            );
            CREATE TABLE IF NOT EXISTS kv_store (
                key TEXT PRIMARY KEY,
                value TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_channels_bridge ON channels(bridge_id);",
        )
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| CoreError::Repository("connection lock poisoned".into()))
    }

    /// Resolve the bridge a native channel belongs to. Hot path: a single
    /// prepared lookup over the unique index.
    pub fn channel_link(&self, platform: &str, native_id: &str) -> Result<Option<ChannelLink>> {
        let platform = platform.trim().to_lowercase();
        let native_id = native_id.trim().to_lowercase();

        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(
            "SELECT c.bridge_id, b.status
             FROM channels c JOIN bridges b ON b.id = c.bridge_id
             WHERE c.platform = ?1 AND c.native_id = ?2",
        )?;
        let link = stmt
            .query_row(params![platform, native_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .optional()?;

        match link {
            Some((bridge_id, status)) => Ok(Some(ChannelLink {
                bridge_id,
                status: status.parse()?,
            })),
            None => Ok(None),
        }
    }

    /// All member channels of a bridge, in stable insertion order. Hot path.
    pub fn bridge_topology(&self, bridge_id: &str) -> Result<Vec<ChannelTarget>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(
            "SELECT platform, native_id, config FROM channels
             WHERE bridge_id = ?1 ORDER BY added_at, id",
        )?;
        let rows = stmt.query_map(params![bridge_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut targets = Vec::new();
        for row in rows {
            let (platform, native_id, config) = row?;
            targets.push(ChannelTarget {
                platform,
                native_id,
                config: serde_json::from_str(&config).unwrap_or(serde_json::Value::Null),
            });
        }
        Ok(targets)
    }

    pub fn create_bridge(&self, name: &str) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO bridges (id, name, status, created_at) VALUES (?1, ?2, 'on', ?3)",
            params![id, name, chrono::Utc::now().timestamp_millis()],
        )?;
        info!(bridge_id = %id, name, "Created bridge");
        Ok(id)
    }

    /// Upsert a channel into a bridge. Re-linking an existing
    /// `(platform, native_id)` moves the channel to the new bridge.
    pub fn link_channel(&self, request: &LinkRequest) -> Result<()> {
        let platform = request.platform.trim().to_lowercase();
        let native_id = request.native_id.trim().to_lowercase();
        let config = serde_json::to_string(&request.config)?;

        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO channels (id, bridge_id, platform, native_id, config, added_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(platform, native_id) DO UPDATE SET
                bridge_id = excluded.bridge_id,
                config = excluded.config",
            params![
                Uuid::new_v4().to_string(),
                request.bridge_id,
                platform,
                native_id,
                config,
                chrono::Utc::now().timestamp_millis()
            ],
        )?;
        Ok(())
    }

    pub fn unlink_channel(&self, platform: &str, native_id: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "DELETE FROM channels WHERE platform = ?1 AND native_id = ?2",
            params![platform.trim().to_lowercase(), native_id.trim().to_lowercase()],
        )?;
        Ok(())
    }

    pub fn update_bridge_status(&self, bridge_id: &str, status: BridgeStatus) -> Result<()> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE bridges SET status = ?1 WHERE id = ?2",
            params![status.as_str(), bridge_id],
        )?;
        if changed == 0 {
            return Err(CoreError::Repository(format!(
                "bridge `{bridge_id}` not found"
            )));
        }
        Ok(())
    }

    /// Remove a bridge; member channels go with it via the FK cascade.
    pub fn delete_bridge(&self, bridge_id: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM bridges WHERE id = ?1", params![bridge_id])?;
        Ok(())
    }

    pub fn list_bridges(&self) -> Result<Vec<Bridge>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(
            "SELECT id, name, status, created_at FROM bridges ORDER BY created_at",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<i64>>(3)?,
            ))
        })?;

        let mut bridges = Vec::new();
        for row in rows {
            let (id, name, status, created_at) = row?;
            bridges.push(Bridge {
                id,
                name,
                status: status.parse()?,
                created_at: created_at.unwrap_or_default(),
            });
        }
        Ok(bridges)
    }

    /// Native ids of every channel linked for one platform, regardless of
    /// bridge. Ingress pollers use this to know what to watch.
    pub fn platform_channels(&self, platform: &str) -> Result<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(
            "SELECT native_id FROM channels WHERE platform = ?1 ORDER BY added_at, id",
        )?;
        let rows = stmt.query_map(params![platform.trim().to_lowercase()], |row| {
            row.get::<_, String>(0)
        })?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }

    pub fn kv_get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached("SELECT value FROM kv_store WHERE key = ?1")?;
        Ok(stmt
            .query_row(params![key], |row| row.get::<_, String>(0))
            .optional()?)
    }

    pub fn kv_set(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO kv_store (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn kv_delete(&self, key: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM kv_store WHERE key = ?1", params![key])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo() -> Repository {
        Repository::open_in_memory().unwrap()
    }

    fn link(repo: &Repository, bridge_id: &str, platform: &str, native_id: &str) {
        repo.link_channel(&LinkRequest {
            bridge_id: bridge_id.to_string(),
            platform: platform.to_string(),
            native_id: native_id.to_string(),
            config: serde_json::json!({}),
        })
        .unwrap();
    }

    #[test]
    fn link_and_resolve() {
        let repo = repo();
        let bridge = repo.create_bridge("general").unwrap();
        link(&repo, &bridge, "Discord", " C1 ");

        let resolved = repo.channel_link("discord", "c1").unwrap().unwrap();
        assert_eq!(resolved.bridge_id, bridge);
        assert_eq!(resolved.status, BridgeStatus::On);
        assert!(repo.channel_link("discord", "other").unwrap().is_none());
    }

    #[test]
    fn topology_is_stable_and_complete() {
        let repo = repo();
        let bridge = repo.create_bridge("general").unwrap();
        link(&repo, &bridge, "discord", "c1");
        link(&repo, &bridge, "telegram", "t1");
        link(&repo, &bridge, "whatsapp", "w1");

        let targets = repo.bridge_topology(&bridge).unwrap();
        let tokens: Vec<String> = targets
            .iter()
            .map(|t| format!("{}:{}", t.platform, t.native_id))
            .collect();
        assert_eq!(tokens, vec!["discord:c1", "telegram:t1", "whatsapp:w1"]);
    }

    #[test]
    fn upsert_moves_channel_between_bridges() {
        let repo = repo();
        let b1 = repo.create_bridge("one").unwrap();
        let b2 = repo.create_bridge("two").unwrap();
        link(&repo, &b1, "discord", "c1");
        link(&repo, &b2, "discord", "c1");

        let resolved = repo.channel_link("discord", "c1").unwrap().unwrap();
        assert_eq!(resolved.bridge_id, b2);
        assert!(repo.bridge_topology(&b1).unwrap().is_empty());
        assert_eq!(repo.bridge_topology(&b2).unwrap().len(), 1);
    }

    #[test]
    fn status_update_gates_resolution() {
        let repo = repo();
        let bridge = repo.create_bridge("general").unwrap();
        link(&repo, &bridge, "discord", "c1");

        repo.update_bridge_status(&bridge, BridgeStatus::Paused)
            .unwrap();
        let resolved = repo.channel_link("discord", "c1").unwrap().unwrap();
        assert_eq!(resolved.status, BridgeStatus::Paused);

        assert!(repo
            .update_bridge_status("missing", BridgeStatus::Off)
            .is_err());
    }

    #[test]
    fn delete_bridge_cascades() {
        let repo = repo();
        let bridge = repo.create_bridge("general").unwrap();
        link(&repo, &bridge, "discord", "c1");

        repo.delete_bridge(&bridge).unwrap();
        assert!(repo.channel_link("discord", "c1").unwrap().is_none());
    }

    #[test]
    fn platform_channels_lists_native_ids() {
        let repo = repo();
        let b1 = repo.create_bridge("one").unwrap();
        let b2 = repo.create_bridge("two").unwrap();
        link(&repo, &b1, "stoat", "s1");
        link(&repo, &b2, "stoat", "s2");
        link(&repo, &b1, "discord", "c1");

        assert_eq!(
            repo.platform_channels("stoat").unwrap(),
            vec!["s1".to_string(), "s2".to_string()]
        );
        assert!(repo.platform_channels("matrix").unwrap().is_empty());
    }

    #[test]
    fn kv_round_trip() {
        let repo = repo();
        assert!(repo.kv_get("webhook:discord:c1").unwrap().is_none());
        repo.kv_set("webhook:discord:c1", "{\"id\":\"w\"}").unwrap();
        assert_eq!(
            repo.kv_get("webhook:discord:c1").unwrap().unwrap(),
            "{\"id\":\"w\"}"
        );
        repo.kv_set("webhook:discord:c1", "{}").unwrap();
        assert_eq!(repo.kv_get("webhook:discord:c1").unwrap().unwrap(), "{}");
        repo.kv_delete("webhook:discord:c1").unwrap();
        assert!(repo.kv_get("webhook:discord:c1").unwrap().is_none());
    }

    #[test]
    fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("core.db");
        {
            let repo = Repository::open(&path).unwrap();
            let bridge = repo.create_bridge("general").unwrap();
            link(&repo, &bridge, "discord", "c1");
        }
        let repo = Repository::open(&path).unwrap();
        assert!(repo.channel_link("discord", "c1").unwrap().is_some());
    }
}
