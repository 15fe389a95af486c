//! Persistent store for bindings and command-execution history.
//!
//! Backed by a local sqlite database. The schema is created on open; the
//! connection sits behind a mutex, which is sufficient for the gateway's
//! write volume.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::Mutex;
use ulid::Ulid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingStatus {
    Pending,
    Active,
    Revoked,
}

impl BindingStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Revoked => "revoked",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(Self::Pending),
            "active" => Some(Self::Active),
            "revoked" => Some(Self::Revoked),
            _ => None,
        }
    }
}

/// Durable link between one channel identity and one internal identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingRecord {
    pub id: String,
    pub channel: String,
    pub channel_user_id: String,
    pub user_id: String,
    pub tenant_id: Option<String>,
    pub status: BindingStatus,
    pub created_at: DateTime<Utc>,
    pub bound_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub revoke_reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ExecutionRecord {
    pub audit_id: String,
    pub envelope_id: String,
    pub channel: String,
    pub user_id: String,
    pub command: String,
    pub success: bool,
    pub classification: Option<String>,
    pub filtered: bool,
    pub elapsed_ms: u64,
}

pub struct GatewayStore {
    conn: Mutex<Connection>,
}

impl GatewayStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create data dir {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("open gateway store {}", path.display()))?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory().context("open in-memory store")?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS bindings (
                id TEXT PRIMARY KEY,
                channel TEXT NOT NULL,
                channel_user_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                tenant_id TEXT,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                bound_at TEXT,
                revoked_at TEXT,
                revoke_reason TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_bindings_key
                ON bindings (channel, channel_user_id, status);
            CREATE TABLE IF NOT EXISTS command_log (
                audit_id TEXT PRIMARY KEY,
                envelope_id TEXT NOT NULL,
                channel TEXT NOT NULL,
                user_id TEXT NOT NULL,
                command TEXT NOT NULL,
                success INTEGER NOT NULL,
                classification TEXT,
                filtered INTEGER NOT NULL,
                elapsed_ms INTEGER NOT NULL,
                created_at TEXT NOT NULL
            );",
        )
        .context("create gateway store schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Inserts a fresh active binding and returns its id.
    pub fn insert_active_binding(
        &self,
        channel: &str,
        channel_user_id: &str,
        user_id: &str,
        tenant_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<String> {
        let id = Ulid::new().to_string();
        self.lock()
            .execute(
                "INSERT INTO bindings
                    (id, channel, channel_user_id, user_id, tenant_id, status,
                     created_at, bound_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'active', ?6, ?6)",
                params![
                    id,
                    channel,
                    channel_user_id,
                    user_id,
                    tenant_id,
                    now.to_rfc3339()
                ],
            )
            .context("insert binding")?;
        Ok(id)
    }

    /// The active binding for a channel identity, if one exists. Pending and
    /// revoked rows are invisible to this lookup.
    pub fn active_binding(&self, channel: &str, channel_user_id: &str) -> Result<Option<BindingRecord>> {
        self.lock()
            .query_row(
                &format!(
                    "SELECT {BINDING_COLUMNS} FROM bindings
                     WHERE channel = ?1 AND channel_user_id = ?2 AND status = 'active'
                     ORDER BY created_at DESC LIMIT 1"
                ),
                params![channel, channel_user_id],
                row_to_binding,
            )
            .optional()
            .context("query active binding")
    }

    pub fn binding_by_id(&self, id: &str) -> Result<Option<BindingRecord>> {
        self.lock()
            .query_row(
                &format!("SELECT {BINDING_COLUMNS} FROM bindings WHERE id = ?1"),
                params![id],
                row_to_binding,
            )
            .optional()
            .context("query binding by id")
    }

    /// Transitions an active binding to revoked. Returns false without
    /// touching timestamps when the binding is absent or already revoked.
    pub fn revoke_binding(&self, id: &str, reason: &str, now: DateTime<Utc>) -> Result<bool> {
        let changed = self
            .lock()
            .execute(
                "UPDATE bindings
                 SET status = 'revoked', revoked_at = ?2, revoke_reason = ?3
                 WHERE id = ?1 AND status = 'active'",
                params![id, now.to_rfc3339(), reason],
            )
            .context("revoke binding")?;
        Ok(changed > 0)
    }

    pub fn list_bindings(
        &self,
        channel: Option<&str>,
        status: Option<BindingStatus>,
    ) -> Result<Vec<BindingRecord>> {
        let conn = self.lock();
        let mut query = format!(
            "SELECT {BINDING_COLUMNS} FROM bindings WHERE 1 = 1"
        );
        let mut args: Vec<String> = Vec::new();
        if let Some(channel) = channel {
            query.push_str(" AND channel = ?");
            args.push(channel.to_string());
        }
        if let Some(status) = status {
            query.push_str(" AND status = ?");
            args.push(status.as_str().to_string());
        }
        query.push_str(" ORDER BY created_at DESC");

        let mut stmt = conn.prepare(&query).context("prepare binding listing")?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(args.iter()), row_to_binding)
            .context("query binding listing")?;
        let mut bindings = Vec::new();
        for row in rows {
            bindings.push(row.context("read binding row")?);
        }
        Ok(bindings)
    }

    pub fn record_execution(&self, record: &ExecutionRecord, now: DateTime<Utc>) -> Result<()> {
        self.lock()
            .execute(
                "INSERT INTO command_log
                    (audit_id, envelope_id, channel, user_id, command, success,
                     classification, filtered, elapsed_ms, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    record.audit_id,
                    record.envelope_id,
                    record.channel,
                    record.user_id,
                    record.command,
                    record.success,
                    record.classification,
                    record.filtered,
                    record.elapsed_ms as i64,
                    now.to_rfc3339()
                ],
            )
            .context("record execution")?;
        Ok(())
    }

    pub fn execution_count(&self) -> Result<u64> {
        let count: i64 = self
            .lock()
            .query_row("SELECT COUNT(*) FROM command_log", [], |row| row.get(0))
            .context("count command log")?;
        Ok(count as u64)
    }
}

const BINDING_COLUMNS: &str =
    "id, channel, channel_user_id, user_id, tenant_id, status, created_at, bound_at, revoked_at, revoke_reason";

fn row_to_binding(row: &rusqlite::Row<'_>) -> rusqlite::Result<BindingRecord> {
    let status_raw: String = row.get(5)?;
    let status = BindingStatus::parse(&status_raw).unwrap_or(BindingStatus::Revoked);
    Ok(BindingRecord {
        id: row.get(0)?,
        channel: row.get(1)?,
        channel_user_id: row.get(2)?,
        user_id: row.get(3)?,
        tenant_id: row.get(4)?,
        status,
        created_at: parse_timestamp(row.get::<_, String>(6)?),
        bound_at: row.get::<_, Option<String>>(7)?.map(parse_timestamp),
        revoked_at: row.get::<_, Option<String>>(8)?.map(parse_timestamp),
        revoke_reason: row.get(9)?,
    })
}

fn parse_timestamp(raw: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|parsed| parsed.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::{BindingStatus, ExecutionRecord, GatewayStore};
    use chrono::Utc;

    #[test]
    fn active_binding_lookup_ignores_revoked_rows() {
        let store = GatewayStore::open_in_memory().expect("store");
        let now = Utc::now();
        let id = store
            .insert_active_binding("slack", "U1", "user-1", None, now)
            .expect("insert");
        assert!(store.revoke_binding(&id, "offboarded", now).expect("revoke"));
        assert!(
            store
                .active_binding("slack", "U1")
                .expect("lookup")
                .is_none()
        );

        let replacement = store
            .insert_active_binding("slack", "U1", "user-1", None, now)
            .expect("insert replacement");
        let active = store
            .active_binding("slack", "U1")
            .expect("lookup")
            .expect("active binding");
        assert_eq!(active.id, replacement);
        assert_eq!(active.status, BindingStatus::Active);
    }

    #[test]
    fn revoke_is_idempotent_and_preserves_history() {
        let store = GatewayStore::open_in_memory().expect("store");
        let now = Utc::now();
        let id = store
            .insert_active_binding("internal", "u-9", "user-9", Some("tenant-a"), now)
            .expect("insert");
        assert!(store.revoke_binding(&id, "first", now).expect("revoke"));
        assert!(!store.revoke_binding(&id, "second", now).expect("no-op"));

        let record = store
            .binding_by_id(&id)
            .expect("lookup")
            .expect("binding exists");
        assert_eq!(record.status, BindingStatus::Revoked);
        assert_eq!(record.revoke_reason.as_deref(), Some("first"));
        assert!(!store.revoke_binding("missing", "x", now).expect("no-op"));
    }

    #[test]
    fn list_bindings_filters_by_channel_and_status() {
        let store = GatewayStore::open_in_memory().expect("store");
        let now = Utc::now();
        store
            .insert_active_binding("slack", "U1", "user-1", None, now)
            .expect("insert");
        let revoked = store
            .insert_active_binding("internal", "u-2", "user-2", None, now)
            .expect("insert");
        store.revoke_binding(&revoked, "test", now).expect("revoke");

        assert_eq!(store.list_bindings(None, None).expect("list").len(), 2);
        assert_eq!(
            store
                .list_bindings(Some("slack"), None)
                .expect("list")
                .len(),
            1
        );
        let revoked_rows = store
            .list_bindings(None, Some(BindingStatus::Revoked))
            .expect("list");
        assert_eq!(revoked_rows.len(), 1);
        assert_eq!(revoked_rows[0].channel, "internal");
    }

    #[test]
    fn execution_records_accumulate_in_command_log() {
        let store = GatewayStore::open_in_memory().expect("store");
        let record = ExecutionRecord {
            audit_id: "audit-1".to_string(),
            envelope_id: "env-1".to_string(),
            channel: "internal".to_string(),
            user_id: "user-1".to_string(),
            command: "platform-status".to_string(),
            success: true,
            classification: Some("internal".to_string()),
            filtered: false,
            elapsed_ms: 42,
        };
        store.record_execution(&record, Utc::now()).expect("record");
        assert_eq!(store.execution_count().expect("count"), 1);
    }
}
