//! Node repository over SQLite.

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};

use bor_domain::model::{ComplianceReport, Node, NodeStatus};
use bor_domain::{Error, Result};
use bor_protocol::NodeFacts;

use super::{opt_ts_from_sql, parse_enum, ts_from_sql, ts_to_sql, NodeRepo, SqliteStore};

fn row_to_node(row: &Row<'_>) -> rusqlite::Result<Node> {
    let desktop_envs: String = row.get("desktop_envs")?;
    Ok(Node {
        id: row.get("id")?,
        name: row.get("name")?,
        machine_id: row.get("machine_id")?,
        address: row.get("address")?,
        os_name: row.get("os_name")?,
        os_version: row.get("os_version")?,
        desktop_envs: serde_json::from_str(&desktop_envs).unwrap_or_default(),
        agent_version: row.get("agent_version")?,
        status: parse_enum(&row.get::<_, String>("status")?)?,
        last_seen: opt_ts_from_sql(row.get("last_seen")?)?,
        created_at: ts_from_sql(&row.get::<_, String>("created_at")?)?,
    })
}

const SELECT: &str = "SELECT id, name, machine_id, address, os_name, os_version, \
     desktop_envs, agent_version, status, last_seen, created_at FROM nodes";

impl NodeRepo for SqliteStore {
    fn create(&self, node: &Node) -> Result<()> {
        self.with_conn("creating node", |conn| {
            conn.execute(
                "INSERT INTO nodes (id, name, machine_id, address, os_name, os_version, \
                 desktop_envs, agent_version, status, last_seen, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    node.id,
                    node.name,
                    node.machine_id,
                    node.address,
                    node.os_name,
                    node.os_version,
                    serde_json::to_string(&node.desktop_envs).unwrap_or_else(|_| "[]".into()),
                    node.agent_version,
                    node.status.as_str(),
                    node.last_seen.as_ref().map(ts_to_sql),
                    ts_to_sql(&node.created_at),
                ],
            )?;
            Ok(())
        })
    }

    fn get(&self, id: &str) -> Result<Node> {
        self.with_conn("loading node", |conn| {
            conn.query_row(&format!("{SELECT} WHERE id = ?1"), params![id], row_to_node)
                .optional()
        })?
        .ok_or_else(|| Error::not_found("node", id))
    }

    fn get_by_name(&self, name: &str) -> Result<Option<Node>> {
        self.with_conn("loading node by name", |conn| {
            conn.query_row(
                &format!("{SELECT} WHERE name = ?1"),
                params![name],
                row_to_node,
            )
            .optional()
        })
    }

    fn list(&self) -> Result<Vec<Node>> {
        self.with_conn("listing nodes", |conn| {
            let mut stmt = conn.prepare(&format!("{SELECT} ORDER BY name"))?;
            let rows = stmt.query_map([], row_to_node)?;
            rows.collect()
        })
    }

    fn set_status(&self, id: &str, status: NodeStatus) -> Result<()> {
        let changed = self.with_conn("updating node status", |conn| {
            conn.execute(
                "UPDATE nodes SET status = ?2, last_seen = ?3 WHERE id = ?1",
                params![id, status.as_str(), ts_to_sql(&Utc::now())],
            )
        })?;
        if changed == 0 {
            return Err(Error::not_found("node", id));
        }
        Ok(())
    }

    fn apply_facts(&self, id: &str, facts: &NodeFacts) -> Result<()> {
        // COALESCE(NULLIF(new, ''), old): blank heartbeat values never
        // overwrite what we already know.
        let changed = self.with_conn("applying node facts", |conn| {
            conn.execute(
                "UPDATE nodes SET \
                 machine_id    = COALESCE(NULLIF(?2, ''), machine_id), \
                 address       = COALESCE(NULLIF(?3, ''), address), \
                 os_name       = COALESCE(NULLIF(?4, ''), os_name), \
                 os_version    = COALESCE(NULLIF(?5, ''), os_version), \
                 desktop_envs  = CASE WHEN ?6 = '[]' THEN desktop_envs ELSE ?6 END, \
                 agent_version = COALESCE(NULLIF(?7, ''), agent_version), \
                 last_seen     = ?8 \
                 WHERE id = ?1",
                params![
                    id,
                    facts.machine_id,
                    facts.ip_address,
                    facts.os_name,
                    facts.os_version,
                    serde_json::to_string(&facts.desktop_envs).unwrap_or_else(|_| "[]".into()),
                    facts.agent_version,
                    ts_to_sql(&Utc::now()),
                ],
            )
        })?;
        if changed == 0 {
            return Err(Error::not_found("node", id));
        }
        Ok(())
    }

    fn record_compliance(&self, report: &ComplianceReport) -> Result<()> {
        self.with_conn("recording compliance report", |conn| {
            conn.execute(
                "INSERT INTO compliance_reports (node_id, policy_id, compliant, message, reported_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5) \
                 ON CONFLICT (node_id, policy_id) DO UPDATE SET \
                 compliant = excluded.compliant, message = excluded.message, \
                 reported_at = excluded.reported_at",
                params![
                    report.node_id,
                    report.policy_id,
                    report.compliant,
                    report.message,
                    ts_to_sql(&report.reported_at),
                ],
            )?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, name: &str) -> Node {
        Node {
            id: id.into(),
            name: name.into(),
            machine_id: None,
            address: None,
            os_name: None,
            os_version: None,
            desktop_envs: Vec::new(),
            agent_version: None,
            status: NodeStatus::Unknown,
            last_seen: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn facts_never_blank_existing_values() {
        let store = SqliteStore::open_in_memory().unwrap();
        NodeRepo::create(&*store, &node("n1", "ws-01")).unwrap();

        store
            .apply_facts(
                "n1",
                &NodeFacts {
                    os_name: "openSUSE".into(),
                    os_version: "15.6".into(),
                    agent_version: "0.1.0".into(),
                    ..Default::default()
                },
            )
            .unwrap();

        // A later heartbeat with blanks keeps the earlier facts.
        store
            .apply_facts(
                "n1",
                &NodeFacts {
                    ip_address: "192.0.2.7".into(),
                    ..Default::default()
                },
            )
            .unwrap();

        let loaded = NodeRepo::get(&*store, "n1").unwrap();
        assert_eq!(loaded.os_name.as_deref(), Some("openSUSE"));
        assert_eq!(loaded.address.as_deref(), Some("192.0.2.7"));
        assert!(loaded.last_seen.is_some());
    }

    #[test]
    fn status_transitions_touch_last_seen() {
        let store = SqliteStore::open_in_memory().unwrap();
        NodeRepo::create(&*store, &node("n1", "ws-01")).unwrap();
        store.set_status("n1", NodeStatus::Online).unwrap();
        let loaded = NodeRepo::get(&*store, "n1").unwrap();
        assert_eq!(loaded.status, NodeStatus::Online);
        assert!(loaded.last_seen.is_some());

        store.set_status("n1", NodeStatus::Offline).unwrap();
        assert_eq!(NodeRepo::get(&*store, "n1").unwrap().status, NodeStatus::Offline);
    }

    #[test]
    fn compliance_upserts_per_node_policy_pair() {
        let store = SqliteStore::open_in_memory().unwrap();
        NodeRepo::create(&*store, &node("n1", "ws-01")).unwrap();

        let mut report = ComplianceReport {
            node_id: "n1".into(),
            policy_id: "p1".into(),
            compliant: false,
            message: "first attempt failed".into(),
            reported_at: Utc::now(),
        };
        store.record_compliance(&report).unwrap();
        report.compliant = true;
        report.message = String::new();
        store.record_compliance(&report).unwrap();

        let count: i64 = store
            .with_conn("test", |conn| {
                conn.query_row("SELECT COUNT(*) FROM compliance_reports", [], |r| r.get(0))
            })
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn unknown_node_is_not_found() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(matches!(
            NodeRepo::get(&*store, "missing"),
            Err(Error::NotFound { .. })
        ));
        assert!(NodeRepo::get_by_name(&*store, "missing").unwrap().is_none());
    }
}
