//! Policy lifecycle and binding administration.
//!
//! Every mutation that changes what agents should see ends with a hub
//! publish: policy-level changes map to concrete events, binding and
//! membership changes to the resync sentinel (they change per-client
//! applicable sets, which the event log cannot express).

use std::sync::Arc;

use chrono::Utc;

use bor_domain::model::{
    BindingState, NodeGroup, Policy, PolicyBinding, PolicyKind, PolicyState,
};
use bor_domain::{Error, Result};
use bor_protocol::UpdateKind;

use crate::hub::PolicyHub;
use crate::store::{BindingRepo, GroupRepo, NodeRepo, PolicyRepo};
use crate::validate::validate_policy_content;

pub struct PolicyService {
    policies: Arc<dyn PolicyRepo>,
    bindings: Arc<dyn BindingRepo>,
    groups: Arc<dyn GroupRepo>,
    nodes: Arc<dyn NodeRepo>,
    hub: Arc<PolicyHub>,
}

impl PolicyService {
    pub fn new(
        policies: Arc<dyn PolicyRepo>,
        bindings: Arc<dyn BindingRepo>,
        groups: Arc<dyn GroupRepo>,
        nodes: Arc<dyn NodeRepo>,
        hub: Arc<PolicyHub>,
    ) -> Self {
        Self {
            policies,
            bindings,
            groups,
            nodes,
            hub,
        }
    }

    // ── Policies ────────────────────────────────────────────────────

    pub fn create_policy(
        &self,
        name: &str,
        kind: PolicyKind,
        content: &serde_json::Value,
        created_by: &str,
    ) -> Result<Policy> {
        if name.is_empty() {
            return Err(Error::InvalidInput("policy name must not be empty".into()));
        }
        validate_policy_content(kind, content)?;
        let now = Utc::now();
        let policy = Policy {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_owned(),
            kind,
            content: serde_json::to_string(content)?,
            version: 1,
            state: PolicyState::Draft,
            deprecated_at: None,
            deprecation_message: None,
            superseded_by: None,
            created_by: if created_by.is_empty() {
                "admin".into()
            } else {
                created_by.to_owned()
            },
            created_at: now,
            updated_at: now,
        };
        self.policies.create(&policy)?;
        tracing::info!(policy = %policy.name, kind = %kind, "policy created");
        Ok(policy)
    }

    pub fn update_policy(
        &self,
        id: &str,
        name: Option<&str>,
        content: Option<&serde_json::Value>,
    ) -> Result<Policy> {
        let mut policy = self.policies.get(id)?;
        if policy.state != PolicyState::Draft {
            return Err(Error::StateViolation(format!(
                "policy {} is {}; only draft policies can be edited",
                policy.name, policy.state
            )));
        }
        if let Some(name) = name {
            if name.is_empty() {
                return Err(Error::InvalidInput("policy name must not be empty".into()));
            }
            policy.name = name.to_owned();
        }
        if let Some(content) = content {
            validate_policy_content(policy.kind, content)?;
            policy.content = serde_json::to_string(content)?;
        }
        policy.version += 1;
        policy.updated_at = Utc::now();
        self.policies.update(&policy)?;
        Ok(policy)
    }

    /// Drive the lifecycle state machine. Publishing a policy makes it
    /// visible to agents; unpublishing or archiving withdraws it.
    pub fn set_state(&self, id: &str, new_state: PolicyState) -> Result<Policy> {
        let mut policy = self.policies.get(id)?;
        if policy.state == new_state {
            return Ok(policy);
        }

        match (policy.state, new_state) {
            (PolicyState::Draft, PolicyState::Released) => {
                let content = policy.content.trim();
                if content.is_empty() || content == "{}" || content == "[]" || content == "null" {
                    return Err(Error::StateViolation(format!(
                        "policy {} has no content to release",
                        policy.name
                    )));
                }
            }
            (PolicyState::Released, PolicyState::Draft)
            | (PolicyState::Released, PolicyState::Archived) => {
                let enabled = self.bindings.enabled_count_for_policy(id)?;
                if enabled > 0 {
                    return Err(Error::StateViolation(format!(
                        "policy {} still has {enabled} enabled binding(s)",
                        policy.name
                    )));
                }
            }
            (from, to) => {
                return Err(Error::StateViolation(format!(
                    "policy {} cannot move from {from} to {to}",
                    policy.name
                )));
            }
        }

        let was_released = policy.state == PolicyState::Released;
        policy.state = new_state;
        policy.updated_at = Utc::now();
        self.policies.update(&policy)?;

        match (was_released, new_state) {
            (_, PolicyState::Released) => {
                self.hub
                    .publish(UpdateKind::Created, Some(Arc::new(policy.clone())));
            }
            (true, _) => {
                self.hub
                    .publish(UpdateKind::Deleted, Some(Arc::new(policy.clone())));
            }
            _ => {}
        }
        tracing::info!(policy = %policy.name, state = %new_state, "policy state changed");
        Ok(policy)
    }

    /// Record deprecation metadata. Live policies broadcast the change so
    /// administrators' replacement pointers reach agents promptly.
    pub fn deprecate_policy(
        &self,
        id: &str,
        message: &str,
        superseded_by: Option<&str>,
    ) -> Result<Policy> {
        let mut policy = self.policies.get(id)?;
        if policy.state == PolicyState::Archived {
            return Err(Error::StateViolation(format!(
                "policy {} is archived",
                policy.name
            )));
        }
        if let Some(replacement) = superseded_by {
            // The replacement must exist.
            self.policies.get(replacement)?;
        }
        policy.deprecated_at = Some(Utc::now());
        policy.deprecation_message = Some(message.to_owned());
        policy.superseded_by = superseded_by.map(str::to_owned);
        policy.updated_at = Utc::now();
        self.policies.update(&policy)?;

        if policy.state == PolicyState::Released {
            self.hub
                .publish(UpdateKind::Updated, Some(Arc::new(policy.clone())));
        }
        Ok(policy)
    }

    pub fn delete_policy(&self, id: &str) -> Result<()> {
        let policy = self.policies.get(id)?;
        let enabled = self.bindings.enabled_count_for_policy(id)?;
        if enabled > 0 {
            return Err(Error::StateViolation(format!(
                "policy {} still has {enabled} enabled binding(s)",
                policy.name
            )));
        }
        // Disabled bindings go with the policy.
        self.bindings.delete_for_policy(id)?;
        self.policies.delete(id)?;
        if policy.state == PolicyState::Released {
            self.hub
                .publish(UpdateKind::Deleted, Some(Arc::new(policy.clone())));
        }
        tracing::info!(policy = %policy.name, "policy deleted");
        Ok(())
    }

    // ── Bindings ────────────────────────────────────────────────────

    pub fn create_binding(
        &self,
        policy_id: &str,
        group_id: &str,
        state: BindingState,
        priority: i64,
    ) -> Result<PolicyBinding> {
        if priority < 0 {
            return Err(Error::InvalidInput(
                "binding priority must be non-negative".into(),
            ));
        }
        let policy = self.policies.get(policy_id)?;
        self.groups.get(group_id)?;
        if state == BindingState::Enabled && policy.state != PolicyState::Released {
            return Err(Error::StateViolation(format!(
                "policy {} is {}; only released policies can be enabled",
                policy.name, policy.state
            )));
        }
        let binding = PolicyBinding {
            id: uuid::Uuid::new_v4().to_string(),
            policy_id: policy_id.to_owned(),
            group_id: group_id.to_owned(),
            state,
            priority,
            created_at: Utc::now(),
        };
        self.bindings.create(&binding)?;
        self.hub.publish_resync();
        Ok(binding)
    }

    pub fn update_binding(
        &self,
        id: &str,
        state: Option<BindingState>,
        priority: Option<i64>,
    ) -> Result<PolicyBinding> {
        let mut binding = self.bindings.get(id)?;
        if let Some(state) = state {
            if state == BindingState::Enabled {
                let policy = self.policies.get(&binding.policy_id)?;
                if policy.state != PolicyState::Released {
                    return Err(Error::StateViolation(format!(
                        "policy {} is {}; only released policies can be enabled",
                        policy.name, policy.state
                    )));
                }
            }
            binding.state = state;
        }
        if let Some(priority) = priority {
            if priority < 0 {
                return Err(Error::InvalidInput(
                    "binding priority must be non-negative".into(),
                ));
            }
            binding.priority = priority;
        }
        self.bindings.update(&binding)?;
        self.hub.publish_resync();
        Ok(binding)
    }

    pub fn delete_binding(&self, id: &str) -> Result<()> {
        self.bindings.delete(id)?;
        self.hub.publish_resync();
        Ok(())
    }

    // ── Groups and membership ───────────────────────────────────────

    pub fn create_group(&self, name: &str, description: &str) -> Result<NodeGroup> {
        if name.is_empty() {
            return Err(Error::InvalidInput("group name must not be empty".into()));
        }
        let group = NodeGroup {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_owned(),
            description: description.to_owned(),
        };
        self.groups.create(&group)?;
        Ok(group)
    }

    pub fn delete_group(&self, id: &str) -> Result<()> {
        self.groups.delete(id)?;
        self.hub.publish_resync();
        Ok(())
    }

    pub fn add_node_to_group(&self, group_id: &str, node_id: &str) -> Result<()> {
        self.groups.get(group_id)?;
        self.nodes.get(node_id)?;
        self.groups.add_member(group_id, node_id)?;
        self.hub.publish_resync();
        Ok(())
    }

    pub fn remove_node_from_group(&self, group_id: &str, node_id: &str) -> Result<()> {
        self.groups.remove_member(group_id, node_id)?;
        self.hub.publish_resync();
        Ok(())
    }
}
