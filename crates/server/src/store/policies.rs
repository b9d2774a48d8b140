//! Policy repository over SQLite.

use rusqlite::{params, OptionalExtension, Row};

use bor_domain::model::{Policy, PolicyKind};
use bor_domain::{Error, Result};

use super::{opt_ts_from_sql, parse_enum, ts_from_sql, ts_to_sql, PolicyRepo, SqliteStore};

fn row_to_policy(row: &Row<'_>) -> rusqlite::Result<Policy> {
    Ok(Policy {
        id: row.get("id")?,
        name: row.get("name")?,
        kind: parse_enum(&row.get::<_, String>("kind")?)?,
        content: row.get("content")?,
        version: row.get("version")?,
        state: parse_enum(&row.get::<_, String>("state")?)?,
        deprecated_at: opt_ts_from_sql(row.get("deprecated_at")?)?,
        deprecation_message: row.get("deprecation_message")?,
        superseded_by: row.get("superseded_by")?,
        created_by: row.get("created_by")?,
        created_at: ts_from_sql(&row.get::<_, String>("created_at")?)?,
        updated_at: ts_from_sql(&row.get::<_, String>("updated_at")?)?,
    })
}

const SELECT: &str = "SELECT id, name, kind, content, version, state, deprecated_at, \
     deprecation_message, superseded_by, created_by, created_at, updated_at FROM policies";

impl PolicyRepo for SqliteStore {
    fn create(&self, policy: &Policy) -> Result<()> {
        self.with_conn("creating policy", |conn| {
            conn.execute(
                "INSERT INTO policies (id, name, kind, content, version, state, deprecated_at, \
                 deprecation_message, superseded_by, created_by, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    policy.id,
                    policy.name,
                    policy.kind.as_str(),
                    policy.content,
                    policy.version,
                    policy.state.as_str(),
                    policy.deprecated_at.as_ref().map(ts_to_sql),
                    policy.deprecation_message,
                    policy.superseded_by,
                    policy.created_by,
                    ts_to_sql(&policy.created_at),
                    ts_to_sql(&policy.updated_at),
                ],
            )?;
            Ok(())
        })
    }

    fn get(&self, id: &str) -> Result<Policy> {
        self.with_conn("loading policy", |conn| {
            conn.query_row(
                &format!("{SELECT} WHERE id = ?1"),
                params![id],
                row_to_policy,
            )
            .optional()
        })?
        .ok_or_else(|| Error::not_found("policy", id))
    }

    fn get_by_name(&self, name: &str) -> Result<Option<Policy>> {
        self.with_conn("loading policy by name", |conn| {
            conn.query_row(
                &format!("{SELECT} WHERE name = ?1"),
                params![name],
                row_to_policy,
            )
            .optional()
        })
    }

    fn list(&self, kind: Option<PolicyKind>) -> Result<Vec<Policy>> {
        self.with_conn("listing policies", |conn| {
            match kind {
                Some(kind) => {
                    let mut stmt =
                        conn.prepare(&format!("{SELECT} WHERE kind = ?1 ORDER BY name"))?;
                    let rows = stmt.query_map(params![kind.as_str()], row_to_policy)?;
                    rows.collect()
                }
                None => {
                    let mut stmt = conn.prepare(&format!("{SELECT} ORDER BY name"))?;
                    let rows = stmt.query_map([], row_to_policy)?;
                    rows.collect()
                }
            }
        })
    }

    fn update(&self, policy: &Policy) -> Result<()> {
        let changed = self.with_conn("updating policy", |conn| {
            conn.execute(
                "UPDATE policies SET name = ?2, kind = ?3, content = ?4, version = ?5, \
                 state = ?6, deprecated_at = ?7, deprecation_message = ?8, superseded_by = ?9, \
                 updated_at = ?10 WHERE id = ?1",
                params![
                    policy.id,
                    policy.name,
                    policy.kind.as_str(),
                    policy.content,
                    policy.version,
                    policy.state.as_str(),
                    policy.deprecated_at.as_ref().map(ts_to_sql),
                    policy.deprecation_message,
                    policy.superseded_by,
                    ts_to_sql(&policy.updated_at),
                ],
            )
        })?;
        if changed == 0 {
            return Err(Error::not_found("policy", &policy.id));
        }
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<()> {
        let changed =
            self.with_conn("deleting policy", |conn| {
                conn.execute("DELETE FROM policies WHERE id = ?1", params![id])
            })?;
        if changed == 0 {
            return Err(Error::not_found("policy", id));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bor_domain::model::PolicyState;
    use chrono::Utc;

    fn sample(name: &str, kind: PolicyKind) -> Policy {
        Policy {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            kind,
            content: "{}".into(),
            version: 1,
            state: PolicyState::Draft,
            deprecated_at: None,
            deprecation_message: None,
            superseded_by: None,
            created_by: "admin".into(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn create_get_update_delete() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut policy = sample("homepage", PolicyKind::Firefox);
        store.create(&policy).unwrap();

        let loaded = PolicyRepo::get(&*store, &policy.id).unwrap();
        assert_eq!(loaded.name, "homepage");
        assert_eq!(loaded.state, PolicyState::Draft);

        policy.content = r#"{"DisableTelemetry":true}"#.into();
        policy.version += 1;
        store.update(&policy).unwrap();
        let loaded = PolicyRepo::get(&*store, &policy.id).unwrap();
        assert_eq!(loaded.version, 2);

        PolicyRepo::delete(&*store, &policy.id).unwrap();
        assert!(PolicyRepo::get(&*store, &policy.id).is_err());
    }

    #[test]
    fn names_are_unique() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.create(&sample("dup", PolicyKind::Firefox)).unwrap();
        let err = store
            .create(&sample("dup", PolicyKind::Chromium))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)), "{err}");
    }

    #[test]
    fn list_filters_by_kind() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.create(&sample("a", PolicyKind::Firefox)).unwrap();
        store.create(&sample("b", PolicyKind::Kconfig)).unwrap();
        store.create(&sample("c", PolicyKind::Firefox)).unwrap();

        assert_eq!(store.list(None).unwrap().len(), 3);
        let firefox = store.list(Some(PolicyKind::Firefox)).unwrap();
        assert_eq!(firefox.len(), 2);
        assert_eq!(firefox[0].name, "a");
    }

    #[test]
    fn deprecation_fields_round_trip() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut policy = sample("old", PolicyKind::Firefox);
        policy.deprecated_at = Some(Utc::now());
        policy.deprecation_message = Some("superseded".into());
        policy.superseded_by = Some("new-id".into());
        store.create(&policy).unwrap();

        let loaded = PolicyRepo::get(&*store, &policy.id).unwrap();
        assert!(loaded.deprecated_at.is_some());
        assert_eq!(loaded.superseded_by.as_deref(), Some("new-id"));
    }
}
