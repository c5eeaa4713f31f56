//! Eligibility grants: create what is missing, leave live grants alone.

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{
    item_failure, Batch, Catalog, Detail, EntityKind, ItemReport, Reconcile, RunContext,
};
use crate::desired::{DesiredState, GrantSpec, RoleSpec};
use crate::directory::models::{EligibilityRequest, GrantState, RoleDefinition};
use crate::directory::DirectoryClient;
use crate::error::DirectoryError;

/// Ensures every desired (principal, role, scope) triple is eligible.
pub struct EligibilityAssigner;

/// Report key of a grant: `{principal}/{role}@{scope}`.
pub fn grant_label(role: &RoleSpec, grant: &GrantSpec) -> String {
    let scope = grant
        .scope
        .clone()
        .or_else(|| role.scope.clone())
        .unwrap_or_else(|| "/".to_string());
    format!("{}/{}@{}", grant.principal, role.name, scope)
}

#[async_trait]
impl Reconcile for EligibilityAssigner {
    fn kind(&self) -> EntityKind {
        EntityKind::Eligibility
    }

    async fn reconcile(
        &self,
        directory: &dyn DirectoryClient,
        desired: &DesiredState,
        catalog: &Catalog,
        ctx: &RunContext,
    ) -> Batch<ItemReport> {
        let mut grants: Vec<(&RoleSpec, &GrantSpec)> = Vec::new();
        for role in &desired.roles {
            grants.extend(role.grants.iter().map(|grant| (role, grant)));
        }

        let tasks: Vec<_> = grants
            .into_iter()
            .map(|(role, grant)| ensure_grant(directory, desired, catalog, ctx, role, grant))
            .collect();
        ctx.bounded(tasks).await
    }
}

async fn ensure_grant(
    directory: &dyn DirectoryClient,
    desired: &DesiredState,
    catalog: &Catalog,
    ctx: &RunContext,
    role: &RoleSpec,
    grant: &GrantSpec,
) -> Result<ItemReport, DirectoryError> {
    let key = grant_label(role, grant);
    let failed = |reason: String| {
        warn!("Grant {} not reconciled: {}", key, reason);
        Ok(ItemReport::failed(EntityKind::Eligibility, key.clone(), reason))
    };

    // Everything that can be checked locally is checked before any remote call.
    let (request, definition) = match build_request(desired, catalog, ctx, role, grant) {
        Ok(built) => built,
        Err(reason) => return failed(reason),
    };

    match directory
        .list_eligibility(&request.principal_id, definition, &request.scope)
        .await
    {
        Ok(Some(existing)) if existing.state_at(ctx.now) != GrantState::Expired => {
            debug!("{} already eligible", key);
            return Ok(ItemReport::new(
                EntityKind::Eligibility,
                key.clone(),
                Detail::AlreadyEligible,
            ));
        }
        Ok(_) => {}
        Err(err) => return failed(item_failure(err)?),
    }

    match directory
        .create_eligibility(&request, request.idempotency_key())
        .await
    {
        Ok(()) => {
            match request.end_time() {
                Some(end) => info!("Created eligibility {} until {}", key, end.to_rfc3339()),
                None => info!("Created permanent eligibility {}", key),
            }
            Ok(ItemReport::new(EntityKind::Eligibility, key.clone(), Detail::Created))
        }
        // Created earlier but not yet visible to the list call.
        Err(DirectoryError::Conflict(reason)) => {
            debug!("{} exists ({})", key, reason);
            Ok(ItemReport::new(
                EntityKind::Eligibility,
                key.clone(),
                Detail::AlreadyEligible,
            ))
        }
        Err(err) => failed(item_failure(err)?),
    }
}

fn build_request<'a>(
    desired: &DesiredState,
    catalog: &'a Catalog,
    ctx: &RunContext,
    role: &RoleSpec,
    grant: &GrantSpec,
) -> Result<(EligibilityRequest, &'a RoleDefinition), String> {
    let scope = role.grant_scope(grant)?;
    let role_scope = role.scope()?;
    let definition = catalog.role(role.namespace, &role.name, &role_scope)?;
    let principal_id = catalog
        .principal(&grant.principal)
        .ok_or_else(|| format!("principal '{}' not found", grant.principal))?;
    let expiration = desired.grant_expiration(grant)?;

    let request = EligibilityRequest::starting_at(
        principal_id,
        definition.id.clone(),
        scope,
        expiration,
        ctx.now,
        grant.justification(),
    )?;
    Ok((request, definition))
}
