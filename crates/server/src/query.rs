//! Resolves "the policies currently applicable to these node groups".

use std::collections::HashMap;
use std::sync::Arc;

use bor_domain::model::{BindingState, Policy, PolicyState};
use bor_domain::Result;

use crate::store::{BindingRepo, PolicyRepo};

/// One applicable policy with the binding that won it.
#[derive(Debug, Clone)]
pub struct ApplicablePolicy {
    pub policy: Policy,
    /// Maximum priority across the bindings reaching the policy.
    pub priority: i64,
    pub binding_id: String,
}

pub struct PolicyQueryService {
    policies: Arc<dyn PolicyRepo>,
    bindings: Arc<dyn BindingRepo>,
}

impl PolicyQueryService {
    pub fn new(policies: Arc<dyn PolicyRepo>, bindings: Arc<dyn BindingRepo>) -> Self {
        Self { policies, bindings }
    }

    pub fn get(&self, policy_id: &str) -> Result<Policy> {
        self.policies.get(policy_id)
    }

    /// Released policies with at least one enabled binding in any of the
    /// given groups. Each policy appears once, carrying the maximum
    /// priority across its bindings; the order is priority descending,
    /// then policy name, then binding id.
    pub fn applicable_for_groups(&self, group_ids: &[String]) -> Result<Vec<ApplicablePolicy>> {
        let mut candidates: Vec<ApplicablePolicy> = Vec::new();
        let mut policy_cache: HashMap<String, Option<Policy>> = HashMap::new();

        for binding in self.bindings.for_groups(group_ids)? {
            if binding.state != BindingState::Enabled {
                continue;
            }
            let policy = match policy_cache.get(&binding.policy_id) {
                Some(cached) => cached.clone(),
                None => {
                    let loaded = self.policies.get(&binding.policy_id).ok();
                    policy_cache.insert(binding.policy_id.clone(), loaded.clone());
                    loaded
                }
            };
            let Some(policy) = policy else { continue };
            if policy.state != PolicyState::Released {
                continue;
            }
            candidates.push(ApplicablePolicy {
                policy,
                priority: binding.priority,
                binding_id: binding.id,
            });
        }

        candidates.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.policy.name.cmp(&b.policy.name))
                .then_with(|| a.binding_id.cmp(&b.binding_id))
        });

        // After the sort the first occurrence of a policy carries its
        // maximum priority, so dedupe keeps exactly that one.
        let mut seen = std::collections::HashSet::new();
        candidates.retain(|c| seen.insert(c.policy.id.clone()));
        Ok(candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{GroupRepo, SqliteStore};
    use bor_domain::model::{NodeGroup, PolicyBinding, PolicyKind};
    use chrono::Utc;

    fn fixture() -> (Arc<SqliteStore>, PolicyQueryService) {
        let store = SqliteStore::open_in_memory().unwrap();
        let service = PolicyQueryService::new(store.clone(), store.clone());
        (store, service)
    }

    fn add_policy(store: &SqliteStore, id: &str, name: &str, state: PolicyState) {
        PolicyRepo::create(
            store,
            &Policy {
                id: id.into(),
                name: name.into(),
                kind: PolicyKind::Firefox,
                content: "{}".into(),
                version: 1,
                state,
                deprecated_at: None,
                deprecation_message: None,
                superseded_by: None,
                created_by: "admin".into(),
                created_at: Utc::now(),
                updated_at: Utc::now(),
            },
        )
        .unwrap();
    }

    fn add_group(store: &SqliteStore, id: &str) {
        GroupRepo::create(
            store,
            &NodeGroup {
                id: id.into(),
                name: format!("group-{id}"),
                description: String::new(),
            },
        )
        .unwrap();
    }

    fn bind(
        store: &SqliteStore,
        id: &str,
        policy: &str,
        group: &str,
        state: BindingState,
        priority: i64,
    ) {
        BindingRepo::create(
            store,
            &PolicyBinding {
                id: id.into(),
                policy_id: policy.into(),
                group_id: group.into(),
                state,
                priority,
                created_at: Utc::now(),
            },
        )
        .unwrap();
    }

    #[test]
    fn only_released_policies_with_enabled_bindings_apply() {
        let (store, service) = fixture();
        add_group(&store, "g1");
        add_policy(&store, "p-released", "released", PolicyState::Released);
        add_policy(&store, "p-draft", "draft", PolicyState::Draft);
        add_policy(&store, "p-disabled", "disabled-binding", PolicyState::Released);
        bind(&store, "b1", "p-released", "g1", BindingState::Enabled, 0);
        bind(&store, "b2", "p-draft", "g1", BindingState::Enabled, 0);
        bind(&store, "b3", "p-disabled", "g1", BindingState::Disabled, 0);

        let found = service
            .applicable_for_groups(&["g1".to_string()])
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].policy.id, "p-released");
    }

    #[test]
    fn max_priority_wins_across_groups() {
        let (store, service) = fixture();
        add_group(&store, "g1");
        add_group(&store, "g2");
        add_policy(&store, "p1", "shared", PolicyState::Released);
        bind(&store, "b-low", "p1", "g1", BindingState::Enabled, 5);
        bind(&store, "b-high", "p1", "g2", BindingState::Enabled, 20);

        let found = service
            .applicable_for_groups(&["g1".to_string(), "g2".to_string()])
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].priority, 20);
        assert_eq!(found[0].binding_id, "b-high");
    }

    #[test]
    fn order_is_priority_then_name_then_binding() {
        let (store, service) = fixture();
        add_group(&store, "g1");
        add_policy(&store, "p-a", "alpha", PolicyState::Released);
        add_policy(&store, "p-b", "beta", PolicyState::Released);
        add_policy(&store, "p-c", "gamma", PolicyState::Released);
        bind(&store, "b1", "p-b", "g1", BindingState::Enabled, 10);
        bind(&store, "b2", "p-a", "g1", BindingState::Enabled, 10);
        bind(&store, "b3", "p-c", "g1", BindingState::Enabled, 50);

        let found = service
            .applicable_for_groups(&["g1".to_string()])
            .unwrap();
        let names: Vec<&str> = found.iter().map(|a| a.policy.name.as_str()).collect();
        assert_eq!(names, vec!["gamma", "alpha", "beta"]);
    }

    #[test]
    fn no_groups_means_no_policies() {
        let (_store, service) = fixture();
        assert!(service.applicable_for_groups(&[]).unwrap().is_empty());
    }
}
