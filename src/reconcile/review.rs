//! Recurring access reviews, created once by name.

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{
    item_failure, Batch, Catalog, Detail, EntityKind, ItemReport, Reconcile, RunContext,
};
use crate::desired::{DesiredState, ReviewSpec, ReviewTarget};
use crate::directory::models::{AccessFate, AccessReviewCycle, Namespace, ReviewScope, Scope};
use crate::directory::DirectoryClient;
use crate::error::DirectoryError;

/// Creates missing access review definitions.
pub struct ReviewScheduler;

#[async_trait]
impl Reconcile for ReviewScheduler {
    fn kind(&self) -> EntityKind {
        EntityKind::Review
    }

    async fn reconcile(
        &self,
        directory: &dyn DirectoryClient,
        desired: &DesiredState,
        catalog: &Catalog,
        ctx: &RunContext,
    ) -> Batch<ItemReport> {
        let tasks: Vec<_> = desired
            .reviews
            .iter()
            .map(|review| ensure_review(directory, catalog, ctx, review))
            .collect();
        ctx.bounded(tasks).await
    }
}

/// Build and validate the cycle without touching the directory.
fn build_cycle(
    catalog: &Catalog,
    ctx: &RunContext,
    review: &ReviewSpec,
) -> Result<AccessReviewCycle, String> {
    let scope = match review.target()? {
        ReviewTarget::Query(query) => ReviewScope {
            query: query.to_string(),
        },
        ReviewTarget::Role(name) => {
            let role = catalog.role(Namespace::Directory, name, &Scope::tenant())?;
            ReviewScope::role_eligibility(&role.id)
        }
    };
    review.cycle(scope, ctx.now.date_naive(), |r| catalog.principal(r))
}

async fn ensure_review(
    directory: &dyn DirectoryClient,
    catalog: &Catalog,
    ctx: &RunContext,
    review: &ReviewSpec,
) -> Result<ItemReport, DirectoryError> {
    let key = review.name.clone();
    let already_exists =
        |key: String| ItemReport::new(EntityKind::Review, key, Detail::AlreadyExists);

    let cycle = match build_cycle(catalog, ctx, review) {
        Ok(cycle) => cycle,
        Err(reason) => {
            warn!("Review '{}' rejected: {}", key, reason);
            return Ok(ItemReport::failed(EntityKind::Review, key, reason));
        }
    };

    match directory.list_access_review(&cycle.name).await {
        Ok(Some(existing)) => {
            debug!("Review '{}' exists as {}", key, existing.id);
            return Ok(already_exists(key));
        }
        Ok(None) => {}
        Err(err) => {
            let reason = item_failure(err)?;
            warn!("Failed to look up review '{}': {}", key, reason);
            return Ok(ItemReport::failed(EntityKind::Review, key, reason));
        }
    }

    match directory
        .create_access_review(&cycle, cycle.idempotency_key())
        .await
    {
        Ok(()) => {
            let unanswered = match cycle.access_after_deadline(None) {
                AccessFate::Removed => "removed",
                AccessFate::Retained => "kept",
            };
            info!(
                "Created review '{}' ({}, {} days per instance, unanswered access {})",
                key, cycle.recurrence, cycle.instance_duration_days, unanswered
            );
            Ok(ItemReport::new(EntityKind::Review, key, Detail::Created))
        }
        Err(DirectoryError::Conflict(_)) => Ok(already_exists(key)),
        Err(err) => {
            let reason = item_failure(err)?;
            warn!("Failed to create review '{}': {}", key, reason);
            Ok(ItemReport::failed(EntityKind::Review, key, reason))
        }
    }
}
