//! Policy-binding repository over SQLite.

use rusqlite::{params, OptionalExtension, Row};

use bor_domain::model::PolicyBinding;
use bor_domain::{Error, Result};

use super::{parse_enum, ts_from_sql, ts_to_sql, BindingRepo, SqliteStore};

fn row_to_binding(row: &Row<'_>) -> rusqlite::Result<PolicyBinding> {
    Ok(PolicyBinding {
        id: row.get("id")?,
        policy_id: row.get("policy_id")?,
        group_id: row.get("group_id")?,
        state: parse_enum(&row.get::<_, String>("state")?)?,
        priority: row.get("priority")?,
        created_at: ts_from_sql(&row.get::<_, String>("created_at")?)?,
    })
}

const SELECT: &str =
    "SELECT id, policy_id, group_id, state, priority, created_at FROM policy_bindings";

impl BindingRepo for SqliteStore {
    fn create(&self, binding: &PolicyBinding) -> Result<()> {
        self.with_conn("creating binding", |conn| {
            conn.execute(
                "INSERT INTO policy_bindings (id, policy_id, group_id, state, priority, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    binding.id,
                    binding.policy_id,
                    binding.group_id,
                    binding.state.as_str(),
                    binding.priority,
                    ts_to_sql(&binding.created_at),
                ],
            )?;
            Ok(())
        })
    }

    fn get(&self, id: &str) -> Result<PolicyBinding> {
        self.with_conn("loading binding", |conn| {
            conn.query_row(
                &format!("{SELECT} WHERE id = ?1"),
                params![id],
                row_to_binding,
            )
            .optional()
        })?
        .ok_or_else(|| Error::not_found("binding", id))
    }

    fn update(&self, binding: &PolicyBinding) -> Result<()> {
        let changed = self.with_conn("updating binding", |conn| {
            conn.execute(
                "UPDATE policy_bindings SET state = ?2, priority = ?3 WHERE id = ?1",
                params![binding.id, binding.state.as_str(), binding.priority],
            )
        })?;
        if changed == 0 {
            return Err(Error::not_found("binding", &binding.id));
        }
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<()> {
        let changed = self.with_conn("deleting binding", |conn| {
            conn.execute("DELETE FROM policy_bindings WHERE id = ?1", params![id])
        })?;
        if changed == 0 {
            return Err(Error::not_found("binding", id));
        }
        Ok(())
    }

    fn for_policy(&self, policy_id: &str) -> Result<Vec<PolicyBinding>> {
        self.with_conn("listing bindings for policy", |conn| {
            let mut stmt =
                conn.prepare(&format!("{SELECT} WHERE policy_id = ?1 ORDER BY id"))?;
            let rows = stmt.query_map(params![policy_id], row_to_binding)?;
            rows.collect()
        })
    }

    fn for_groups(&self, group_ids: &[String]) -> Result<Vec<PolicyBinding>> {
        if group_ids.is_empty() {
            return Ok(Vec::new());
        }
        self.with_conn("listing bindings for groups", |conn| {
            // rusqlite has no array binding; build the placeholder list.
            let placeholders = vec!["?"; group_ids.len()].join(", ");
            let mut stmt = conn.prepare(&format!(
                "{SELECT} WHERE group_id IN ({placeholders}) ORDER BY id"
            ))?;
            let rows = stmt.query_map(
                rusqlite::params_from_iter(group_ids.iter()),
                row_to_binding,
            )?;
            rows.collect()
        })
    }

    fn enabled_count_for_policy(&self, policy_id: &str) -> Result<i64> {
        self.with_conn("counting enabled bindings", |conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM policy_bindings WHERE policy_id = ?1 AND state = 'enabled'",
                params![policy_id],
                |row| row.get(0),
            )
        })
    }

    fn delete_for_policy(&self, policy_id: &str) -> Result<()> {
        self.with_conn("deleting bindings for policy", |conn| {
            conn.execute(
                "DELETE FROM policy_bindings WHERE policy_id = ?1",
                params![policy_id],
            )?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{GroupRepo, PolicyRepo};
    use bor_domain::model::{BindingState, NodeGroup, Policy, PolicyKind, PolicyState};
    use chrono::Utc;

    fn seed(store: &SqliteStore, policy: &str, group: &str) {
        PolicyRepo::create(
            store,
            &Policy {
                id: policy.into(),
                name: format!("policy-{policy}"),
                kind: PolicyKind::Firefox,
                content: "{}".into(),
                version: 1,
                state: PolicyState::Released,
                deprecated_at: None,
                deprecation_message: None,
                superseded_by: None,
                created_by: "admin".into(),
                created_at: Utc::now(),
                updated_at: Utc::now(),
            },
        )
        .unwrap();
        GroupRepo::create(
            store,
            &NodeGroup {
                id: group.into(),
                name: format!("group-{group}"),
                description: String::new(),
            },
        )
        .unwrap();
    }

    fn binding(id: &str, policy: &str, group: &str, state: BindingState) -> PolicyBinding {
        PolicyBinding {
            id: id.into(),
            policy_id: policy.into(),
            group_id: group.into(),
            state,
            priority: 0,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn one_binding_per_policy_group_pair() {
        let store = SqliteStore::open_in_memory().unwrap();
        seed(&store, "p1", "g1");
        BindingRepo::create(&*store, &binding("b1", "p1", "g1", BindingState::Enabled)).unwrap();
        let err = BindingRepo::create(&*store, &binding("b2", "p1", "g1", BindingState::Disabled))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn enabled_count_only_counts_enabled() {
        let store = SqliteStore::open_in_memory().unwrap();
        seed(&store, "p1", "g1");
        seed(&store, "p2", "g2");
        BindingRepo::create(&*store, &binding("b1", "p1", "g1", BindingState::Enabled)).unwrap();
        BindingRepo::create(&*store, &binding("b2", "p1", "g2", BindingState::Disabled)).unwrap();

        assert_eq!(store.enabled_count_for_policy("p1").unwrap(), 1);

        let mut b = BindingRepo::get(&*store, "b1").unwrap();
        b.state = BindingState::Disabled;
        BindingRepo::update(&*store, &b).unwrap();
        assert_eq!(store.enabled_count_for_policy("p1").unwrap(), 0);
    }

    #[test]
    fn for_groups_spans_the_requested_set() {
        let store = SqliteStore::open_in_memory().unwrap();
        seed(&store, "p1", "g1");
        seed(&store, "p2", "g2");
        seed(&store, "p3", "g3");
        BindingRepo::create(&*store, &binding("b1", "p1", "g1", BindingState::Enabled)).unwrap();
        BindingRepo::create(&*store, &binding("b2", "p2", "g2", BindingState::Enabled)).unwrap();
        BindingRepo::create(&*store, &binding("b3", "p3", "g3", BindingState::Enabled)).unwrap();

        let found = store
            .for_groups(&["g1".to_string(), "g3".to_string()])
            .unwrap();
        assert_eq!(found.len(), 2);
        assert!(found.iter().all(|b| b.group_id != "g2"));
        assert!(store.for_groups(&[]).unwrap().is_empty());
    }
}
