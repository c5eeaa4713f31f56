//! Activation policy convergence, one rule at a time.

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{
    item_failure, Batch, Catalog, Detail, EntityKind, ItemReport, Reconcile, RunContext,
};
use crate::desired::{DesiredState, RoleSpec};
use crate::directory::models::{PolicyId, PolicyRule, Scope};
use crate::directory::DirectoryClient;
use crate::error::DirectoryError;

/// Converges each role's expiration, enablement, approval and notification rules.
pub struct PolicyReconciler;

/// Report key of a role: its name, qualified by scope when not tenant-wide.
pub fn role_label(role: &RoleSpec) -> String {
    match role.scope() {
        Ok(scope) if scope == Scope::tenant() => role.name.clone(),
        Ok(scope) => format!("{}@{}", role.name, scope),
        Err(_) => role.name.clone(),
    }
}

#[async_trait]
impl Reconcile for PolicyReconciler {
    fn kind(&self) -> EntityKind {
        EntityKind::Policy
    }

    async fn reconcile(
        &self,
        directory: &dyn DirectoryClient,
        desired: &DesiredState,
        catalog: &Catalog,
        ctx: &RunContext,
    ) -> Batch<ItemReport> {
        let roles: Vec<&RoleSpec> = desired
            .roles
            .iter()
            .filter(|role| role.manages_policy())
            .collect();
        ctx.bounded_batches(
            roles
                .into_iter()
                .map(|role| reconcile_role(directory, role, catalog)),
        )
        .await
    }
}

/// Items for one role. Rules applied before a fatal error stay reported.
async fn reconcile_role(
    directory: &dyn DirectoryClient,
    role: &RoleSpec,
    catalog: &Catalog,
) -> Batch<ItemReport> {
    let mut items = Vec::with_capacity(4);
    let fatal = converge_role(directory, role, catalog, &mut items)
        .await
        .err();
    Batch { done: items, fatal }
}

async fn converge_role(
    directory: &dyn DirectoryClient,
    role: &RoleSpec,
    catalog: &Catalog,
    items: &mut Vec<ItemReport>,
) -> Result<(), DirectoryError> {
    let label = role_label(role);
    let mut failed = |reason: String| {
        warn!("Policy for {} not reconciled: {}", label, reason);
        items.push(ItemReport::failed(EntityKind::Policy, label.clone(), reason));
        Ok(())
    };

    let scope = match role.scope() {
        Ok(scope) => scope,
        Err(reason) => return failed(reason),
    };
    let definition = match catalog.role(role.namespace, &role.name, &scope) {
        Ok(definition) => definition,
        Err(reason) => return failed(reason),
    };
    let desired_policy = match role.activation_policy(&definition.id, |r| catalog.principal(r)) {
        Ok(policy) => policy,
        Err(reason) => return failed(reason),
    };

    let policy_id = match directory.get_policy_id(definition, &scope).await {
        Ok(Some(id)) => id,
        Ok(None) => {
            warn!("Skipping {}: role is not PIM-enabled at {}", label, scope);
            items.push(ItemReport::new(
                EntityKind::Policy,
                label.clone(),
                Detail::RoleNotPimEnabled,
            ));
            return Ok(());
        }
        Err(err) => return failed(item_failure(err)?),
    };

    let current = match directory.get_policy_rules(&policy_id).await {
        Ok(rules) => rules,
        Err(err) => {
            let reason = item_failure(err)?;
            warn!(
                "Could not read current rules of {} ({}), writing every rule",
                label, reason
            );
            Vec::new()
        }
    };

    for rule in desired_policy.rules() {
        let key = format!("{}/{}", label, rule.kind());
        items.push(apply_rule(directory, &policy_id, &rule, &current, key).await?);
    }
    Ok(())
}

async fn apply_rule(
    directory: &dyn DirectoryClient,
    policy_id: &PolicyId,
    rule: &PolicyRule,
    current: &[PolicyRule],
    key: String,
) -> Result<ItemReport, DirectoryError> {
    if current.contains(rule) {
        debug!("{} unchanged", key);
        return Ok(ItemReport::new(EntityKind::Policy, key, Detail::Unchanged));
    }

    match directory.update_policy_rule(policy_id, rule).await {
        Ok(()) => {
            info!("Applied {}", key);
            Ok(ItemReport::new(EntityKind::Policy, key, Detail::Applied))
        }
        Err(err) => {
            let reason = item_failure(err)?;
            warn!("Failed to apply {}: {}", key, reason);
            Ok(ItemReport::failed(EntityKind::Policy, key, reason))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::fake::{FakeDirectory, Write};
    use crate::directory::models::{Namespace, RuleKind};
    use crate::directory::RetryPolicy;
    use chrono::{Duration, Utc};

    fn ctx() -> RunContext {
        RunContext::new(RetryPolicy::immediate(3), 2, Utc::now())
    }

    async fn run(directory: &FakeDirectory, toml: &str) -> Vec<ItemReport> {
        let desired = DesiredState::parse(toml).unwrap();
        let ctx = ctx();
        let catalog = Catalog::resolve(directory, &desired, &ctx).await.unwrap();
        PolicyReconciler
            .reconcile(directory, &desired, &catalog, &ctx)
            .await
            .into_result()
            .unwrap()
    }

    fn details(items: &[ItemReport]) -> Vec<(&str, Detail)> {
        items.iter().map(|i| (i.key.as_str(), i.detail)).collect()
    }

    #[tokio::test]
    async fn test_rules_apply_in_fixed_order() {
        let directory = FakeDirectory::new().with_role("Alpha", Namespace::Directory, "role-a");
        let items = run(
            &directory,
            r#"
[[roles]]
name = "Alpha"
[roles.activation]
max_duration = "PT1H"
require_mfa = true
notify_on_activation = false
"#,
        )
        .await;

        assert_eq!(
            details(&items),
            vec![
                ("Alpha/expiration", Detail::Applied),
                ("Alpha/enablement", Detail::Applied),
                ("Alpha/approval", Detail::Unchanged),
                ("Alpha/notification", Detail::Applied),
            ]
        );
        assert_eq!(
            directory.writes(),
            vec![
                Write::PolicyRule { role_id: "role-a".into(), kind: RuleKind::Expiration },
                Write::PolicyRule { role_id: "role-a".into(), kind: RuleKind::Enablement },
                Write::PolicyRule { role_id: "role-a".into(), kind: RuleKind::Notification },
            ]
        );
        assert_eq!(
            directory.rule("role-a", RuleKind::Expiration),
            Some(PolicyRule::Expiration { max_duration: Duration::hours(1) })
        );
    }

    #[tokio::test]
    async fn test_role_without_policy_is_skipped() {
        let directory = FakeDirectory::new()
            .with_unmanaged_role("Legacy", Namespace::Directory, "role-l")
            .with_role("Alpha", Namespace::Directory, "role-a");
        let items = run(
            &directory,
            r#"
[[roles]]
name = "Legacy"
[roles.activation]
require_mfa = true

[[roles]]
name = "Alpha"
[roles.activation]
require_mfa = true
"#,
        )
        .await;

        assert_eq!(items[0].key, "Legacy");
        assert_eq!(items[0].detail, Detail::RoleNotPimEnabled);
        assert_eq!(items.len(), 5, "Alpha is still reconciled");
    }

    #[tokio::test]
    async fn test_failure_does_not_block_remaining_rules() {
        let directory = FakeDirectory::new()
            .with_role("Alpha", Namespace::Directory, "role-a")
            .throttle_rule_update("role-a", RuleKind::Expiration, 1);
        let items = run(
            &directory,
            r#"
[[roles]]
name = "Alpha"
[roles.activation]
max_duration = "PT2H"
require_justification = true
"#,
        )
        .await;

        assert_eq!(items[0].detail, Detail::Failed);
        assert!(items[0].reason.as_deref().unwrap().starts_with("Throttled"));
        assert_eq!(items[1].detail, Detail::Applied);
    }

    #[tokio::test]
    async fn test_unreadable_rules_are_all_written() {
        let directory = FakeDirectory::new()
            .with_role("Alpha", Namespace::Directory, "role-a")
            .fail_operation("get_policy_rules", DirectoryError::Transient("HTTP 503".into()));
        let items = run(
            &directory,
            "[[roles]]\nname = \"Alpha\"\nreset_policy = true\n",
        )
        .await;

        assert!(items.iter().all(|i| i.detail == Detail::Applied));
        assert_eq!(directory.writes().len(), 4);
    }

    #[tokio::test]
    async fn test_approval_without_resolvable_approver_fails_role() {
        let directory = FakeDirectory::new().with_role("Alpha", Namespace::Directory, "role-a");
        let items = run(
            &directory,
            r#"
[[roles]]
name = "Alpha"
[roles.activation]
require_approval = true
approvers = ["nobody@contoso.com"]
"#,
        )
        .await;

        assert_eq!(items.len(), 1);
        assert_eq!(items[0].detail, Detail::Failed);
        assert!(items[0].reason.as_deref().unwrap().contains("nobody@contoso.com"));
        assert!(directory.writes().is_empty());
    }

    #[test]
    fn test_role_label() {
        let state = DesiredState::parse(
            r#"
[[roles]]
name = "Alpha"
[[roles]]
name = "Owner"
namespace = "resource"
scope = "/subscriptions/sub-1"
"#,
        )
        .unwrap();
        assert_eq!(role_label(&state.roles[0]), "Alpha");
        assert_eq!(role_label(&state.roles[1]), "Owner@/subscriptions/sub-1");
    }
}
