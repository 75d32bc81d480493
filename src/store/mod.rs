pub mod secrets;

pub use secrets::SecretBox;

use crate::config::{MirrorAuth, MirrorSpec};
use crate::error::ProxyError;
use crate::traffic::{Outcome, TrafficRecord};
use crate::upstream::Health;
use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS mirrors (
    id                   INTEGER PRIMARY KEY AUTOINCREMENT,
    prefix               TEXT NOT NULL,
    upstream_url         TEXT NOT NULL,
    upstream_host        TEXT,
    auth_kind            TEXT NOT NULL DEFAULT 'none',
    auth_user            TEXT,
    auth_pass_encrypted  TEXT,
    enabled              INTEGER NOT NULL DEFAULT 1,
    health               TEXT NOT NULL DEFAULT 'unknown',
    latency_ms           INTEGER,
    consecutive_failures INTEGER NOT NULL DEFAULT 0,
    last_probe_at        INTEGER
);

CREATE TABLE IF NOT EXISTS traffic (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    ts              INTEGER NOT NULL,
    client_ip       TEXT NOT NULL,
    method          TEXT NOT NULL,
    path            TEXT NOT NULL,
    mirror_id       INTEGER,
    upstream_status INTEGER NOT NULL,
    bytes_out       INTEGER NOT NULL,
    duration_ms     INTEGER NOT NULL,
    image_ref       TEXT,
    outcome         TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_traffic_ts ON traffic (ts);
"#;

/// A mirror as persisted, with runtime health columns and decrypted
/// credentials. Only ever held in memory — admin responses are redacted.
#[derive(Debug, Clone)]
pub struct StoredMirror {
    pub id: i64,
    pub spec: MirrorSpec,
    pub health: Health,
    pub latency_ms: Option<u64>,
    pub consecutive_failures: u32,
    pub last_probe_at: Option<u64>,
}

/// Partial update body for `PATCH /mirrors/{id}`. Health fields are not
/// patchable — the prober owns them.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct MirrorPatch {
    pub prefix: Option<String>,
    pub upstream_url: Option<String>,
    pub upstream_host: Option<String>,
    pub auth: Option<MirrorAuth>,
    pub enabled: Option<bool>,
}

impl MirrorPatch {
    /// The spec that would result from applying this patch.
    pub fn apply(&self, current: &MirrorSpec) -> MirrorSpec {
        let mut spec = current.clone();
        if let Some(ref prefix) = self.prefix {
            spec.prefix = prefix.clone();
        }
        if let Some(ref url) = self.upstream_url {
            spec.upstream_url = url.clone();
        }
        if let Some(ref host) = self.upstream_host {
            spec.upstream_host = Some(host.clone());
        }
        if let Some(ref auth) = self.auth {
            spec.auth = auth.clone();
        }
        if let Some(enabled) = self.enabled {
            spec.enabled = enabled;
        }
        spec
    }
}

#[derive(Debug, Serialize)]
pub struct StatsSummary {
    pub total_requests: u64,
    pub total_bytes: u64,
    pub per_mirror: Vec<MirrorStats>,
}

#[derive(Debug, Serialize)]
pub struct MirrorStats {
    pub id: i64,
    pub requests: u64,
    pub bytes: u64,
}

#[derive(Debug, Serialize)]
pub struct HistoryEntry {
    pub id: i64,
    #[serde(flatten)]
    pub record: TrafficRecord,
}

/// Embedded SQLite store. All methods are synchronous; async callers go
/// through `spawn_blocking`. The connection mutex is held only for the
/// duration of a statement or batch, never across network I/O.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
    secrets: SecretBox,
}

impl Store {
    pub fn open(data_dir: &Path, auth_secret: Option<&str>) -> Result<Self> {
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("creating data dir {}", data_dir.display()))?;
        let secrets = match auth_secret {
            Some(secret) => SecretBox::from_secret(secret),
            None => SecretBox::load_or_generate(data_dir)?,
        };
        let path = data_dir.join("mirrorgate.db");
        let conn = Connection::open(&path)
            .with_context(|| format!("opening store at {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            secrets,
        })
    }

    /// Ephemeral store for tests and dry runs.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            secrets: SecretBox::from_secret("test"),
        })
    }

    // ---- Mirror config (admin writer) ----

    pub fn list_mirrors(&self) -> Result<Vec<StoredMirror>, ProxyError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, prefix, upstream_url, upstream_host, auth_kind, auth_user,
                    auth_pass_encrypted, enabled, health, latency_ms,
                    consecutive_failures, last_probe_at
             FROM mirrors ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| self.mirror_from_row(row))?;
        let mut mirrors = Vec::new();
        for row in rows {
            mirrors.push(row?);
        }
        Ok(mirrors)
    }

    pub fn get_mirror(&self, id: i64) -> Result<Option<StoredMirror>, ProxyError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, prefix, upstream_url, upstream_host, auth_kind, auth_user,
                    auth_pass_encrypted, enabled, health, latency_ms,
                    consecutive_failures, last_probe_at
             FROM mirrors WHERE id = ?1",
        )?;
        Ok(stmt
            .query_row(params![id], |row| self.mirror_from_row(row))
            .optional()?)
    }

    pub fn insert_mirror(&self, spec: &MirrorSpec) -> Result<StoredMirror, ProxyError> {
        let (auth_user, auth_pass) = self.seal_auth(&spec.auth);
        let id = {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO mirrors (prefix, upstream_url, upstream_host, auth_kind,
                                      auth_user, auth_pass_encrypted, enabled)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    spec.prefix,
                    spec.upstream_url,
                    spec.upstream_host,
                    spec.auth.kind(),
                    auth_user,
                    auth_pass,
                    spec.enabled,
                ],
            )?;
            conn.last_insert_rowid()
        };
        self.get_mirror(id)?
            .ok_or_else(|| ProxyError::Store("inserted mirror vanished".to_string()))
    }

    /// Apply a partial update. Returns the updated mirror, or `None` when the
    /// id does not exist. Identical patches yield identical state; health
    /// columns are untouched.
    pub fn update_mirror(&self, id: i64, patch: &MirrorPatch) -> Result<Option<StoredMirror>, ProxyError> {
        let Some(current) = self.get_mirror(id)? else {
            return Ok(None);
        };
        let spec = patch.apply(&current.spec);

        let (auth_user, auth_pass) = self.seal_auth(&spec.auth);
        {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "UPDATE mirrors SET prefix = ?2, upstream_url = ?3, upstream_host = ?4,
                                    auth_kind = ?5, auth_user = ?6, auth_pass_encrypted = ?7,
                                    enabled = ?8
                 WHERE id = ?1",
                params![
                    id,
                    spec.prefix,
                    spec.upstream_url,
                    spec.upstream_host,
                    spec.auth.kind(),
                    auth_user,
                    auth_pass,
                    spec.enabled,
                ],
            )?;
        }
        self.get_mirror(id)
    }

    pub fn delete_mirror(&self, id: i64) -> Result<bool, ProxyError> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute("DELETE FROM mirrors WHERE id = ?1", params![id])?;
        Ok(n > 0)
    }

    pub fn toggle_mirror(&self, id: i64) -> Result<Option<StoredMirror>, ProxyError> {
        {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "UPDATE mirrors SET enabled = NOT enabled WHERE id = ?1",
                params![id],
            )?;
        }
        self.get_mirror(id)
    }

    // ---- Probe results (prober writer) ----

    pub fn record_probe(
        &self,
        id: i64,
        health: Health,
        latency_ms: Option<u64>,
        consecutive_failures: u32,
        last_probe_at: u64,
    ) -> Result<(), ProxyError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE mirrors SET health = ?2, latency_ms = ?3,
                                consecutive_failures = ?4, last_probe_at = ?5
             WHERE id = ?1",
            params![
                id,
                health.as_str(),
                latency_ms.map(|v| v as i64),
                consecutive_failures,
                last_probe_at as i64,
            ],
        )?;
        Ok(())
    }

    // ---- Traffic (accounting consumer writer) ----

    pub fn insert_traffic(&self, records: &[TrafficRecord]) -> Result<(), ProxyError> {
        if records.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO traffic (ts, client_ip, method, path, mirror_id,
                                      upstream_status, bytes_out, duration_ms,
                                      image_ref, outcome)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            )?;
            for r in records {
                stmt.execute(params![
                    r.ts as i64,
                    r.client_ip,
                    r.method,
                    r.path,
                    r.mirror_id,
                    r.upstream_status,
                    r.bytes_out as i64,
                    r.duration_ms as i64,
                    r.image_ref,
                    r.outcome.as_str(),
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn stats(&self) -> Result<StatsSummary, ProxyError> {
        let conn = self.conn.lock().unwrap();
        let (total_requests, total_bytes): (i64, i64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(bytes_out), 0) FROM traffic",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        let mut stmt = conn.prepare(
            "SELECT mirror_id, COUNT(*), COALESCE(SUM(bytes_out), 0)
             FROM traffic WHERE mirror_id IS NOT NULL
             GROUP BY mirror_id ORDER BY mirror_id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(MirrorStats {
                id: row.get(0)?,
                requests: row.get::<_, i64>(1)? as u64,
                bytes: row.get::<_, i64>(2)? as u64,
            })
        })?;
        let mut per_mirror = Vec::new();
        for row in rows {
            per_mirror.push(row?);
        }

        Ok(StatsSummary {
            total_requests: total_requests as u64,
            total_bytes: total_bytes as u64,
            per_mirror,
        })
    }

    pub fn history(&self, limit: usize) -> Result<Vec<HistoryEntry>, ProxyError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, ts, client_ip, method, path, mirror_id, upstream_status,
                    bytes_out, duration_ms, image_ref, outcome
             FROM traffic ORDER BY ts DESC, id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(HistoryEntry {
                id: row.get(0)?,
                record: TrafficRecord {
                    ts: row.get::<_, i64>(1)? as u64,
                    client_ip: row.get(2)?,
                    method: row.get(3)?,
                    path: row.get(4)?,
                    mirror_id: row.get(5)?,
                    upstream_status: row.get(6)?,
                    bytes_out: row.get::<_, i64>(7)? as u64,
                    duration_ms: row.get::<_, i64>(8)? as u64,
                    image_ref: row.get(9)?,
                    outcome: Outcome::parse(&row.get::<_, String>(10)?),
                },
            })
        })?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    // ---- Row mapping ----

    fn seal_auth(&self, auth: &MirrorAuth) -> (Option<String>, Option<String>) {
        match auth {
            MirrorAuth::Basic { username, password } => {
                (Some(username.clone()), Some(self.secrets.seal(password)))
            }
            _ => (None, None),
        }
    }

    fn mirror_from_row(&self, row: &Row<'_>) -> rusqlite::Result<StoredMirror> {
        let auth_kind: String = row.get(4)?;
        let auth_user: Option<String> = row.get(5)?;
        let auth_pass: Option<String> = row.get(6)?;

        let auth = match auth_kind.as_str() {
            "basic" => {
                let username = auth_user.unwrap_or_default();
                let password = match auth_pass {
                    Some(sealed) => self.secrets.open(&sealed).map_err(|e| {
                        rusqlite::Error::FromSqlConversionFailure(
                            6,
                            rusqlite::types::Type::Text,
                            e.into(),
                        )
                    })?,
                    None => String::new(),
                };
                MirrorAuth::Basic { username, password }
            }
            "bearer-delegated" => MirrorAuth::BearerDelegated,
            _ => MirrorAuth::None,
        };

        Ok(StoredMirror {
            id: row.get(0)?,
            spec: MirrorSpec {
                prefix: row.get(1)?,
                upstream_url: row.get(2)?,
                upstream_host: row.get(3)?,
                auth,
                enabled: row.get(7)?,
            },
            health: Health::parse(&row.get::<_, String>(8)?),
            latency_ms: row.get::<_, Option<i64>>(9)?.map(|v| v as u64),
            consecutive_failures: row.get(10)?,
            last_probe_at: row.get::<_, Option<i64>>(11)?.map(|v| v as u64),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traffic::Outcome;

    fn spec(prefix: &str) -> MirrorSpec {
        MirrorSpec {
            prefix: prefix.to_string(),
            upstream_url: format!("https://{prefix}.example"),
            upstream_host: None,
            auth: MirrorAuth::None,
            enabled: true,
        }
    }

    fn record(mirror_id: Option<i64>, bytes: u64) -> TrafficRecord {
        TrafficRecord {
            ts: 1_700_000_000_000,
            client_ip: "10.0.0.1".to_string(),
            method: "GET".to_string(),
            path: "/v2/library/nginx/manifests/latest".to_string(),
            mirror_id,
            upstream_status: 200,
            bytes_out: bytes,
            duration_ms: 12,
            image_ref: Some("library/nginx:latest".to_string()),
            outcome: Outcome::Complete,
        }
    }

    #[test]
    fn mirror_crud_round_trip() {
        let store = Store::open_in_memory().unwrap();
        let created = store
            .insert_mirror(&MirrorSpec {
                auth: MirrorAuth::Basic {
                    username: "alice".to_string(),
                    password: "s3cret".to_string(),
                },
                ..spec("harbor")
            })
            .unwrap();
        assert_eq!(created.spec.prefix, "harbor");
        assert_eq!(created.health, Health::Unknown);

        // Credentials survive the encrypt/decrypt round trip.
        match &created.spec.auth {
            MirrorAuth::Basic { username, password } => {
                assert_eq!(username, "alice");
                assert_eq!(password, "s3cret");
            }
            other => panic!("expected basic auth, got {:?}", other),
        }

        // Password is not stored in cleartext.
        let raw: String = {
            let conn = store.conn.lock().unwrap();
            conn.query_row(
                "SELECT auth_pass_encrypted FROM mirrors WHERE id = ?1",
                params![created.id],
                |row| row.get(0),
            )
            .unwrap()
        };
        assert!(!raw.contains("s3cret"));

        let updated = store
            .update_mirror(
                created.id,
                &MirrorPatch {
                    upstream_url: Some("https://harbor2.example".to_string()),
                    ..MirrorPatch::default()
                },
            )
            .unwrap()
            .unwrap();
        assert_eq!(updated.spec.upstream_url, "https://harbor2.example");
        assert_eq!(updated.spec.prefix, "harbor");

        assert!(store.delete_mirror(created.id).unwrap());
        assert!(!store.delete_mirror(created.id).unwrap());
    }

    #[test]
    fn patch_is_idempotent_and_preserves_health() {
        let store = Store::open_in_memory().unwrap();
        let m = store.insert_mirror(&spec("ghcr")).unwrap();
        store
            .record_probe(m.id, Health::Healthy, Some(42), 0, 1_700_000_000_000)
            .unwrap();

        let patch = MirrorPatch {
            upstream_host: Some("ghcr.io".to_string()),
            ..MirrorPatch::default()
        };
        let first = store.update_mirror(m.id, &patch).unwrap().unwrap();
        let second = store.update_mirror(m.id, &patch).unwrap().unwrap();

        assert_eq!(first.spec, second.spec);
        assert_eq!(second.health, Health::Healthy);
        assert_eq!(second.latency_ms, Some(42));
    }

    #[test]
    fn toggle_flips_enabled() {
        let store = Store::open_in_memory().unwrap();
        let m = store.insert_mirror(&spec("quay")).unwrap();
        let off = store.toggle_mirror(m.id).unwrap().unwrap();
        assert!(!off.spec.enabled);
        let on = store.toggle_mirror(m.id).unwrap().unwrap();
        assert!(on.spec.enabled);
    }

    #[test]
    fn prefixes_are_routing_keys_not_identities() {
        // Several mirrors may serve one prefix; selection orders them.
        let store = Store::open_in_memory().unwrap();
        let a = store.insert_mirror(&spec("dockerhub")).unwrap();
        let b = store
            .insert_mirror(&MirrorSpec {
                upstream_url: "https://mirror-b.example".to_string(),
                ..spec("dockerhub")
            })
            .unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(store.list_mirrors().unwrap().len(), 2);
    }

    #[test]
    fn stats_and_history() {
        let store = Store::open_in_memory().unwrap();
        let a = store.insert_mirror(&spec("a")).unwrap();
        let b = store.insert_mirror(&spec("b")).unwrap();

        store
            .insert_traffic(&[
                record(Some(a.id), 100),
                record(Some(a.id), 50),
                record(Some(b.id), 10),
                record(None, 5),
            ])
            .unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.total_requests, 4);
        assert_eq!(stats.total_bytes, 165);
        assert_eq!(stats.per_mirror.len(), 2);
        assert_eq!(stats.per_mirror[0].requests, 2);
        assert_eq!(stats.per_mirror[0].bytes, 150);

        let history = store.history(2).unwrap();
        assert_eq!(history.len(), 2);
        // Newest first: highest rowid wins the tie on equal ts.
        assert!(history[0].id > history[1].id);
    }
}
