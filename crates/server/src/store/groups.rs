//! Node-group repository over SQLite.

use rusqlite::{params, OptionalExtension, Row};

use bor_domain::model::NodeGroup;
use bor_domain::{Error, Result};

use super::{GroupRepo, SqliteStore};

fn row_to_group(row: &Row<'_>) -> rusqlite::Result<NodeGroup> {
    Ok(NodeGroup {
        id: row.get("id")?,
        name: row.get("name")?,
        description: row.get("description")?,
    })
}

impl GroupRepo for SqliteStore {
    fn create(&self, group: &NodeGroup) -> Result<()> {
        self.with_conn("creating node group", |conn| {
            conn.execute(
                "INSERT INTO node_groups (id, name, description) VALUES (?1, ?2, ?3)",
                params![group.id, group.name, group.description],
            )?;
            Ok(())
        })
    }

    fn get(&self, id: &str) -> Result<NodeGroup> {
        self.with_conn("loading node group", |conn| {
            conn.query_row(
                "SELECT id, name, description FROM node_groups WHERE id = ?1",
                params![id],
                row_to_group,
            )
            .optional()
        })?
        .ok_or_else(|| Error::not_found("node group", id))
    }

    fn list(&self) -> Result<Vec<NodeGroup>> {
        self.with_conn("listing node groups", |conn| {
            let mut stmt =
                conn.prepare("SELECT id, name, description FROM node_groups ORDER BY name")?;
            let rows = stmt.query_map([], row_to_group)?;
            rows.collect()
        })
    }

    fn delete(&self, id: &str) -> Result<()> {
        let changed = self.with_conn("deleting node group", |conn| {
            conn.execute("DELETE FROM node_groups WHERE id = ?1", params![id])
        })?;
        if changed == 0 {
            return Err(Error::not_found("node group", id));
        }
        Ok(())
    }

    fn add_member(&self, group_id: &str, node_id: &str) -> Result<()> {
        self.with_conn("adding group member", |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO node_group_members (node_id, group_id) VALUES (?1, ?2)",
                params![node_id, group_id],
            )?;
            Ok(())
        })
    }

    fn remove_member(&self, group_id: &str, node_id: &str) -> Result<()> {
        self.with_conn("removing group member", |conn| {
            conn.execute(
                "DELETE FROM node_group_members WHERE node_id = ?1 AND group_id = ?2",
                params![node_id, group_id],
            )?;
            Ok(())
        })
    }

    fn groups_for_node(&self, node_id: &str) -> Result<Vec<NodeGroup>> {
        self.with_conn("listing groups for node", |conn| {
            let mut stmt = conn.prepare(
                "SELECT g.id, g.name, g.description FROM node_groups g \
                 JOIN node_group_members m ON m.group_id = g.id \
                 WHERE m.node_id = ?1 ORDER BY g.name",
            )?;
            let rows = stmt.query_map(params![node_id], row_to_group)?;
            rows.collect()
        })
    }
}
