//! Runs the reconciliation stages against one directory.

use tracing::{error, info};

use super::eligibility::EligibilityAssigner;
use super::policy::PolicyReconciler;
use super::review::ReviewScheduler;
use super::{Catalog, Reconcile, RunContext, RunReport};
use crate::desired::DesiredState;
use crate::directory::{DirectoryClient, RetryingDirectory};

/// Drives one reconciliation run.
///
/// Every directory call goes through a [`RetryingDirectory`] built from the
/// run's retry policy. A fatal error aborts the run; what was done before it
/// stays in the report.
pub struct Orchestrator<C> {
    directory: RetryingDirectory<C>,
    ctx: RunContext,
}

impl<C: DirectoryClient> Orchestrator<C> {
    pub fn new(client: C, ctx: RunContext) -> Self {
        let directory = RetryingDirectory::new(client, ctx.retry.clone());
        Self { directory, ctx }
    }

    /// The undecorated client.
    pub fn directory(&self) -> &C {
        self.directory.inner()
    }

    pub async fn run(&self, desired: &DesiredState) -> RunReport {
        let mut report = RunReport::default();

        let catalog = match Catalog::resolve(&self.directory, desired, &self.ctx).await {
            Ok(catalog) => catalog,
            Err(err) => {
                error!("Aborting run while resolving references: {}", err);
                report.abort(err.to_string());
                return report;
            }
        };

        // Policies first so new grants land under the desired activation rules.
        let stages: [&dyn Reconcile; 3] =
            [&PolicyReconciler, &EligibilityAssigner, &ReviewScheduler];
        for stage in stages {
            let kind = stage.kind();
            info!(
                "Reconciling {} ({} in flight at most)",
                kind.as_str(),
                self.ctx.max_concurrency
            );
            let batch = stage
                .reconcile(&self.directory, desired, &catalog, &self.ctx)
                .await;
            report.extend(batch.done);
            if let Some(err) = batch.fatal {
                error!("Aborting run during {} stage: {}", kind.as_str(), err);
                report.abort(err.to_string());
                break;
            }
        }

        let failed = report.failed();
        if failed > 0 {
            info!("Run finished with {} failed item(s)", failed);
        } else if report.aborted.is_none() {
            info!("Run finished cleanly");
        }
        report
    }
}
