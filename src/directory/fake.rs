//! In-memory directory for reconciler tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use super::models::{
    AccessReviewCycle, AccessReviewSummary, ActivationPolicy, EligibilityGrant,
    EligibilityRequest, GrantState, IdempotencyKey, Namespace, PolicyId, PolicyRule,
    RoleDefinition, RuleKind, Scope,
};
use super::DirectoryClient;
use crate::error::DirectoryError;

/// A mutating call recorded by the fake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Write {
    PolicyRule { role_id: String, kind: RuleKind },
    Eligibility { principal_id: String, role_id: String, scope: String },
    AccessReview { name: String },
}

type GrantKey = (String, String, String);

#[derive(Default)]
struct State {
    principals: HashMap<String, String>,
    roles: HashMap<(Namespace, String), RoleDefinition>,
    policies: HashMap<String, BTreeMap<RuleKind, PolicyRule>>,
    grants: Vec<EligibilityGrant>,
    hidden_grants: HashSet<GrantKey>,
    reviews: Vec<AccessReviewSummary>,
    hidden_reviews: HashSet<String>,
    throttles: HashMap<String, u32>,
    failures: HashMap<&'static str, DirectoryError>,
    writes: Vec<Write>,
    keys: Vec<IdempotencyKey>,
    calls: HashMap<&'static str, u32>,
}

/// `DirectoryClient` backed by maps, with failure injection.
#[derive(Default)]
pub struct FakeDirectory {
    state: Mutex<State>,
}

fn grant_key(principal_id: &str, role_id: &str, scope: &Scope) -> GrantKey {
    (
        principal_id.to_string(),
        role_id.to_string(),
        scope.id.to_ascii_lowercase(),
    )
}

fn rule_throttle_key(role_id: &str, kind: RuleKind) -> String {
    format!("update_policy_rule:{}:{}", role_id, kind)
}

impl FakeDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a principal reachable by `identifier` (UPN) and by its id.
    pub fn with_principal(self, identifier: &str, id: &str) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            state
                .principals
                .insert(identifier.to_ascii_lowercase(), id.to_string());
            state.principals.insert(id.to_ascii_lowercase(), id.to_string());
        }
        self
    }

    /// Register a PIM-managed role whose policy starts at the permissive default.
    pub fn with_role(self, name: &str, namespace: Namespace, id: &str) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            state.roles.insert(
                (namespace, name.to_string()),
                RoleDefinition {
                    id: id.to_string(),
                    display_name: name.to_string(),
                    namespace,
                },
            );
            let rules = ActivationPolicy::permissive(id)
                .rules()
                .into_iter()
                .map(|rule| (rule.kind(), rule))
                .collect();
            state.policies.insert(id.to_string(), rules);
        }
        self
    }

    /// Register a role that has no PIM policy.
    pub fn with_unmanaged_role(self, name: &str, namespace: Namespace, id: &str) -> Self {
        let this = self.with_role(name, namespace, id);
        this.state.lock().unwrap().policies.remove(id);
        this
    }

    /// Seed an existing eligibility.
    pub fn with_grant(self, grant: EligibilityGrant) -> Self {
        self.state.lock().unwrap().grants.push(grant);
        self
    }

    /// A grant that exists remotely but is not yet visible to reads.
    pub fn with_invisible_grant(self, principal_id: &str, role_id: &str, scope: &Scope) -> Self {
        self.state
            .lock()
            .unwrap()
            .hidden_grants
            .insert(grant_key(principal_id, role_id, scope));
        self
    }

    /// A review that exists remotely but is not yet visible to reads.
    pub fn with_invisible_review(self, name: &str) -> Self {
        self.state
            .lock()
            .unwrap()
            .hidden_reviews
            .insert(name.to_string());
        self
    }

    /// Answer the next `times` updates of one rule with `Throttled`.
    pub fn throttle_rule_update(self, role_id: &str, kind: RuleKind, times: u32) -> Self {
        self.state
            .lock()
            .unwrap()
            .throttles
            .insert(rule_throttle_key(role_id, kind), times);
        self
    }

    /// Fail every call of `operation` with `error`.
    pub fn fail_operation(self, operation: &'static str, error: DirectoryError) -> Self {
        self.state
            .lock()
            .unwrap()
            .failures
            .insert(operation, error);
        self
    }

    pub fn writes(&self) -> Vec<Write> {
        self.state.lock().unwrap().writes.clone()
    }

    pub fn idempotency_keys(&self) -> Vec<IdempotencyKey> {
        self.state.lock().unwrap().keys.clone()
    }

    pub fn calls(&self, operation: &str) -> u32 {
        self.state
            .lock()
            .unwrap()
            .calls
            .get(operation)
            .copied()
            .unwrap_or(0)
    }

    pub fn rule(&self, role_id: &str, kind: RuleKind) -> Option<PolicyRule> {
        self.state
            .lock()
            .unwrap()
            .policies
            .get(role_id)
            .and_then(|rules| rules.get(&kind).cloned())
    }

    pub fn grants(&self) -> Vec<EligibilityGrant> {
        self.state.lock().unwrap().grants.clone()
    }

    pub fn reviews(&self) -> Vec<AccessReviewSummary> {
        self.state.lock().unwrap().reviews.clone()
    }

    /// Count the call and return the injected failure, if any.
    fn enter(&self, operation: &'static str) -> Result<MutexGuard<'_, State>, DirectoryError> {
        let mut state = self.state.lock().unwrap();
        *state.calls.entry(operation).or_insert(0) += 1;
        if let Some(err) = state.failures.get(operation).cloned() {
            return Err(err);
        }
        Ok(state)
    }
}

#[async_trait]
impl DirectoryClient for FakeDirectory {
    async fn resolve_principal(&self, identifier: &str) -> Result<Option<String>, DirectoryError> {
        let state = self.enter("resolve_principal")?;
        Ok(state
            .principals
            .get(&identifier.trim().to_ascii_lowercase())
            .cloned())
    }

    async fn find_role_definition(
        &self,
        name: &str,
        namespace: Namespace,
        _scope: &Scope,
    ) -> Result<Option<RoleDefinition>, DirectoryError> {
        let state = self.enter("find_role_definition")?;
        Ok(state.roles.get(&(namespace, name.to_string())).cloned())
    }

    async fn get_policy_id(
        &self,
        role: &RoleDefinition,
        _scope: &Scope,
    ) -> Result<Option<PolicyId>, DirectoryError> {
        let state = self.enter("get_policy_id")?;
        Ok(state.policies.contains_key(&role.id).then(|| PolicyId {
            id: format!("policy-{}", role.id),
            namespace: role.namespace,
        }))
    }

    async fn get_policy_rules(&self, policy: &PolicyId) -> Result<Vec<PolicyRule>, DirectoryError> {
        let state = self.enter("get_policy_rules")?;
        let role_id = policy.id.trim_start_matches("policy-");
        state
            .policies
            .get(role_id)
            .map(|rules| rules.values().cloned().collect())
            .ok_or_else(|| DirectoryError::NotFound(policy.id.clone()))
    }

    async fn update_policy_rule(
        &self,
        policy: &PolicyId,
        rule: &PolicyRule,
    ) -> Result<(), DirectoryError> {
        let mut state = self.enter("update_policy_rule")?;
        let role_id = policy.id.trim_start_matches("policy-").to_string();

        if let Some(remaining) = state.throttles.get_mut(&rule_throttle_key(&role_id, rule.kind())) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(DirectoryError::Throttled { retry_after: None });
            }
        }

        let rules = state
            .policies
            .get_mut(&role_id)
            .ok_or_else(|| DirectoryError::NotFound(policy.id.clone()))?;
        rules.insert(rule.kind(), rule.clone());
        state.writes.push(Write::PolicyRule {
            role_id,
            kind: rule.kind(),
        });
        Ok(())
    }

    async fn list_eligibility(
        &self,
        principal_id: &str,
        role: &RoleDefinition,
        scope: &Scope,
    ) -> Result<Option<EligibilityGrant>, DirectoryError> {
        let state = self.enter("list_eligibility")?;
        let key = grant_key(principal_id, &role.id, scope);
        Ok(state
            .grants
            .iter()
            .find(|g| grant_key(&g.principal_id, &g.role_id, &g.scope) == key)
            .cloned())
    }

    async fn create_eligibility(
        &self,
        request: &EligibilityRequest,
        key: IdempotencyKey,
    ) -> Result<(), DirectoryError> {
        let mut state = self.enter("create_eligibility")?;
        state.keys.push(key);

        let target = grant_key(&request.principal_id, &request.role_id, &request.scope);
        let visible = state.grants.iter().position(|g| {
            grant_key(&g.principal_id, &g.role_id, &g.scope) == target
        });
        let live = visible
            .map(|i| state.grants[i].state_at(request.start_time) != GrantState::Expired)
            .unwrap_or(false);
        if live || state.hidden_grants.contains(&target) {
            return Err(DirectoryError::Conflict("RoleAssignmentExists".to_string()));
        }
        if let Some(i) = visible {
            state.grants.remove(i);
        }

        state.grants.push(EligibilityGrant {
            id: Some(key.to_string()),
            principal_id: request.principal_id.clone(),
            role_id: request.role_id.clone(),
            scope: request.scope.clone(),
            start_time: request.start_time,
            expiration: request.expiration,
            state: GrantState::Eligible,
        });
        state.writes.push(Write::Eligibility {
            principal_id: request.principal_id.clone(),
            role_id: request.role_id.clone(),
            scope: request.scope.id.clone(),
        });
        Ok(())
    }

    async fn list_access_review(
        &self,
        name: &str,
    ) -> Result<Option<AccessReviewSummary>, DirectoryError> {
        let state = self.enter("list_access_review")?;
        Ok(state.reviews.iter().find(|r| r.name == name).cloned())
    }

    async fn create_access_review(
        &self,
        cycle: &AccessReviewCycle,
        key: IdempotencyKey,
    ) -> Result<(), DirectoryError> {
        let mut state = self.enter("create_access_review")?;
        state.keys.push(key);

        if state.hidden_reviews.contains(&cycle.name)
            || state.reviews.iter().any(|r| r.name == cycle.name)
        {
            return Err(DirectoryError::Conflict(format!(
                "access review '{}' exists",
                cycle.name
            )));
        }

        state.reviews.push(AccessReviewSummary {
            id: key.to_string(),
            name: cycle.name.clone(),
            status: Some("NotStarted".to_string()),
        });
        state.writes.push(Write::AccessReview {
            name: cycle.name.clone(),
        });
        Ok(())
    }
}
