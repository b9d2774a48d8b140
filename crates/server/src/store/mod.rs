//! Persistence layer: repository traits and their SQLite implementation.
//!
//! The traits are what the rest of the server programs against, so tests
//! can substitute in-process doubles. [`SqliteStore`] implements all of
//! them over a single bundled-SQLite connection; statements are small and
//! serialise through one mutex.

mod bindings;
mod groups;
mod nodes;
mod policies;

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::Connection;

use bor_domain::model::{
    ComplianceReport, Node, NodeGroup, NodeStatus, Policy, PolicyBinding, PolicyKind,
};
use bor_domain::{Error, Result};
use bor_protocol::NodeFacts;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Repository traits
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub trait PolicyRepo: Send + Sync {
    fn create(&self, policy: &Policy) -> Result<()>;
    fn get(&self, id: &str) -> Result<Policy>;
    fn get_by_name(&self, name: &str) -> Result<Option<Policy>>;
    fn list(&self, kind: Option<PolicyKind>) -> Result<Vec<Policy>>;
    fn update(&self, policy: &Policy) -> Result<()>;
    fn delete(&self, id: &str) -> Result<()>;
}

pub trait BindingRepo: Send + Sync {
    fn create(&self, binding: &PolicyBinding) -> Result<()>;
    fn get(&self, id: &str) -> Result<PolicyBinding>;
    fn update(&self, binding: &PolicyBinding) -> Result<()>;
    fn delete(&self, id: &str) -> Result<()>;
    fn for_policy(&self, policy_id: &str) -> Result<Vec<PolicyBinding>>;
    fn for_groups(&self, group_ids: &[String]) -> Result<Vec<PolicyBinding>>;
    fn enabled_count_for_policy(&self, policy_id: &str) -> Result<i64>;
    /// Remove every binding of a policy (used when the policy is deleted).
    fn delete_for_policy(&self, policy_id: &str) -> Result<()>;
}

pub trait GroupRepo: Send + Sync {
    fn create(&self, group: &NodeGroup) -> Result<()>;
    fn get(&self, id: &str) -> Result<NodeGroup>;
    fn list(&self) -> Result<Vec<NodeGroup>>;
    fn delete(&self, id: &str) -> Result<()>;
    fn add_member(&self, group_id: &str, node_id: &str) -> Result<()>;
    fn remove_member(&self, group_id: &str, node_id: &str) -> Result<()>;
    fn groups_for_node(&self, node_id: &str) -> Result<Vec<NodeGroup>>;
}

pub trait NodeRepo: Send + Sync {
    fn create(&self, node: &Node) -> Result<()>;
    fn get(&self, id: &str) -> Result<Node>;
    fn get_by_name(&self, name: &str) -> Result<Option<Node>>;
    fn list(&self) -> Result<Vec<Node>>;
    fn set_status(&self, id: &str, status: NodeStatus) -> Result<()>;
    /// Merge heartbeat facts into the record. Empty values never
    /// overwrite stored ones.
    fn apply_facts(&self, id: &str, facts: &NodeFacts) -> Result<()>;
    fn record_compliance(&self, report: &ComplianceReport) -> Result<()>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SQLite store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS policies (
    id                  TEXT PRIMARY KEY,
    name                TEXT NOT NULL UNIQUE,
    kind                TEXT NOT NULL,
    content             TEXT NOT NULL,
    version             INTEGER NOT NULL,
    state               TEXT NOT NULL,
    deprecated_at       TEXT,
    deprecation_message TEXT,
    superseded_by       TEXT,
    created_by          TEXT NOT NULL,
    created_at          TEXT NOT NULL,
    updated_at          TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_policies_state ON policies(state);

CREATE TABLE IF NOT EXISTS node_groups (
    id          TEXT PRIMARY KEY,
    name        TEXT NOT NULL UNIQUE,
    description TEXT NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS nodes (
    id            TEXT PRIMARY KEY,
    name          TEXT NOT NULL UNIQUE,
    machine_id    TEXT,
    address       TEXT,
    os_name       TEXT,
    os_version    TEXT,
    desktop_envs  TEXT NOT NULL DEFAULT '[]',
    agent_version TEXT,
    status        TEXT NOT NULL,
    last_seen     TEXT,
    created_at    TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_nodes_last_seen ON nodes(last_seen);

CREATE TABLE IF NOT EXISTS node_group_members (
    node_id  TEXT NOT NULL REFERENCES nodes(id) ON DELETE CASCADE,
    group_id TEXT NOT NULL REFERENCES node_groups(id) ON DELETE CASCADE,
    PRIMARY KEY (node_id, group_id)
);

CREATE TABLE IF NOT EXISTS policy_bindings (
    id         TEXT PRIMARY KEY,
    policy_id  TEXT NOT NULL REFERENCES policies(id) ON DELETE CASCADE,
    group_id   TEXT NOT NULL REFERENCES node_groups(id) ON DELETE CASCADE,
    state      TEXT NOT NULL,
    priority   INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    UNIQUE (policy_id, group_id)
);
CREATE INDEX IF NOT EXISTS idx_bindings_state ON policy_bindings(state);

CREATE TABLE IF NOT EXISTS compliance_reports (
    node_id     TEXT NOT NULL REFERENCES nodes(id) ON DELETE CASCADE,
    policy_id   TEXT NOT NULL,
    compliant   INTEGER NOT NULL,
    message     TEXT NOT NULL DEFAULT '',
    reported_at TEXT NOT NULL,
    PRIMARY KEY (node_id, policy_id)
);
"#;

impl SqliteStore {
    /// Open (creating the schema if needed) at the given path.
    pub fn open(path: &Path) -> Result<Arc<Self>> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)
            .map_err(|e| Error::Storage(format!("opening {}: {e}", path.display())))?;
        Self::init(conn)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Arc<Self>> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Storage(format!("opening in-memory db: {e}")))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Arc<Self>> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(|e| Error::Storage(format!("enabling foreign keys: {e}")))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| Error::Storage(format!("creating schema: {e}")))?;
        Ok(Arc::new(Self {
            conn: Mutex::new(conn),
        }))
    }

    pub(crate) fn with_conn<T>(
        &self,
        op: &'static str,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T> {
        let conn = self.conn.lock();
        f(&conn).map_err(|e| map_sql_error(op, e))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Row helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub(crate) fn map_sql_error(op: &'static str, e: rusqlite::Error) -> Error {
    if let rusqlite::Error::SqliteFailure(err, _) = &e {
        if err.code == rusqlite::ErrorCode::ConstraintViolation {
            return Error::InvalidInput(format!("{op}: {e}"));
        }
    }
    Error::Storage(format!("{op}: {e}"))
}

pub(crate) fn ts_to_sql(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

pub(crate) fn ts_from_sql(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })
}

pub(crate) fn opt_ts_from_sql(raw: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.as_deref().map(ts_from_sql).transpose()
}

pub(crate) fn parse_enum<T: std::str::FromStr<Err = Error>>(raw: &str) -> rusqlite::Result<T> {
    raw.parse().map_err(|e: Error| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            e.to_string().into(),
        )
    })
}
