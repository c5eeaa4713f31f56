//! Declarative desired state loaded from TOML.
//!
//! The file describes privileged roles (activation requirements and eligible
//! principals) and recurring access reviews:
//!
//! ```toml
//! [tiers]
//! critical = "P30D"
//!
//! [[roles]]
//! name = "Global Administrator"
//!
//! [roles.activation]
//! max_duration = "PT1H"
//! require_mfa = true
//!
//! [[roles.grants]]
//! principal = "alice@contoso.com"
//! tier = "critical"
//!
//! [[reviews]]
//! name = "Monthly-Admin-Review"
//! role = "Global Administrator"
//! reviewers = ["security-lead@contoso.com"]
//! recurrence = { type = "monthly", day_of_month = 1 }
//! instance_duration_days = 14
//! ```
//!
//! Whole-file problems (unreadable file, malformed TOML, duplicate names) are
//! reported by [`DesiredState::load`]. Problems with a single item are only
//! found when that item is reconciled, so they fail that item alone.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, NaiveDate, Utc};
use directories::ProjectDirs;
use serde::Deserialize;
use tracing::debug;

use crate::directory::models::{
    AccessReviewCycle, ActivationPolicy, Escalation, GrantExpiration, Namespace, Recurrence,
    ReviewDecision, ReviewScope, Scope,
};
use crate::error::AppError;
use crate::iso8601;

/// Desired state file name.
const DESIRED_FILE: &str = "desired.toml";

/// Get the default path of the desired state file.
///
/// Returns `~/.config/pimgov/desired.toml` on Linux.
pub fn default_desired_path() -> Option<PathBuf> {
    ProjectDirs::from("io", "pimgov", "pimgov").map(|dirs| dirs.config_dir().join(DESIRED_FILE))
}

/// Root of the desired state file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DesiredState {
    /// Named risk tiers mapping to ISO-8601 grant durations.
    #[serde(default)]
    pub tiers: BTreeMap<String, String>,

    #[serde(default)]
    pub roles: Vec<RoleSpec>,

    #[serde(default)]
    pub reviews: Vec<ReviewSpec>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RoleSpec {
    pub name: String,

    #[serde(default = "default_namespace")]
    pub namespace: Namespace,

    /// Defaults to the tenant (`/`) for directory roles; required for resource roles.
    pub scope: Option<String>,

    /// Put the activation policy back to the permissive default.
    #[serde(default)]
    pub reset_policy: bool,

    pub activation: Option<ActivationSpec>,

    #[serde(default)]
    pub grants: Vec<GrantSpec>,
}

fn default_namespace() -> Namespace {
    Namespace::Directory
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ActivationSpec {
    #[serde(default = "default_max_duration")]
    pub max_duration: String,
    #[serde(default)]
    pub require_mfa: bool,
    #[serde(default)]
    pub require_justification: bool,
    #[serde(default)]
    pub require_ticket: bool,
    #[serde(default)]
    pub require_approval: bool,
    #[serde(default)]
    pub approvers: Vec<String>,
    #[serde(default = "default_true")]
    pub notify_on_activation: bool,
    pub escalation: Option<EscalationSpec>,
}

fn default_max_duration() -> String {
    "PT8H".to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EscalationSpec {
    pub after_minutes: u32,
    #[serde(default)]
    pub approvers: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GrantSpec {
    /// UPN or object id.
    pub principal: String,
    /// Overrides the role's scope.
    pub scope: Option<String>,
    pub duration: Option<String>,
    pub tier: Option<String>,
    /// RFC 3339 end date.
    pub until: Option<String>,
    pub justification: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReviewSpec {
    pub name: String,
    /// Directory role whose eligible assignments are reviewed.
    pub role: Option<String>,
    /// Raw Graph query selecting the reviewed items.
    pub query: Option<String>,
    #[serde(default)]
    pub reviewers: Vec<String>,
    #[serde(default)]
    pub fallback_reviewers: Vec<String>,
    pub recurrence: Recurrence,
    pub instance_duration_days: u32,
    #[serde(default)]
    pub description: String,
}

/// What a review covers, before role names are resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReviewTarget<'a> {
    Role(&'a str),
    Query(&'a str),
}

/// Justification recorded on grants that do not set their own.
pub const DEFAULT_GRANT_JUSTIFICATION: &str = "Eligibility managed by pimgov";

impl DesiredState {
    /// Load and parse a desired state file.
    pub fn load(path: &Path) -> Result<Self, AppError> {
        let content = fs::read_to_string(path).map_err(|e| {
            AppError::DesiredState(format!("failed to read {}: {}", path.display(), e))
        })?;
        let state = Self::parse(&content)
            .map_err(|e| AppError::DesiredState(format!("{}: {}", path.display(), e)))?;

        debug!(
            "Loaded desired state from {:?}: {} roles, {} reviews",
            path,
            state.roles.len(),
            state.reviews.len()
        );
        Ok(state)
    }

    /// Parse desired state from TOML text.
    pub fn parse(content: &str) -> Result<Self, String> {
        let state: Self = toml::from_str(content).map_err(|e| e.to_string())?;
        state.check_unique_names()?;
        Ok(state)
    }

    /// Report items are keyed by name, so names must be unique per kind.
    fn check_unique_names(&self) -> Result<(), String> {
        let mut roles = HashSet::new();
        for role in &self.roles {
            if !roles.insert((role.namespace, role.name.as_str(), role.scope.as_deref())) {
                return Err(format!("role '{}' is listed more than once", role.name));
            }
        }
        let mut reviews = HashSet::new();
        for review in &self.reviews {
            if !reviews.insert(review.name.as_str()) {
                return Err(format!("review '{}' is listed more than once", review.name));
            }
        }
        Ok(())
    }

    /// Resolve a grant's expiration through explicit values or a named tier.
    pub fn grant_expiration(&self, grant: &GrantSpec) -> Result<GrantExpiration, String> {
        match (&grant.duration, &grant.tier, &grant.until) {
            (Some(duration), None, None) => positive_duration(duration),
            (None, Some(tier), None) => {
                let duration = self
                    .tiers
                    .get(tier)
                    .ok_or_else(|| format!("unknown tier '{}'", tier))?;
                positive_duration(duration)
            }
            (None, None, Some(until)) => DateTime::parse_from_rfc3339(until)
                .map(|at| GrantExpiration::AtDateTime(at.with_timezone(&Utc)))
                .map_err(|e| format!("invalid until '{}': {}", until, e)),
            (None, None, None) => Err(format!(
                "grant for '{}' needs one of duration, tier or until",
                grant.principal
            )),
            _ => Err(format!(
                "grant for '{}' sets more than one of duration, tier and until",
                grant.principal
            )),
        }
    }
}

fn positive_duration(raw: &str) -> Result<GrantExpiration, String> {
    let duration = iso8601::parse_duration(raw)?;
    if duration <= Duration::zero() {
        return Err(format!("duration '{}' must be positive", raw));
    }
    Ok(GrantExpiration::AfterDuration(duration))
}

impl RoleSpec {
    /// The scope the role's policy and grants live at.
    pub fn scope(&self) -> Result<Scope, String> {
        match (&self.scope, self.namespace) {
            (Some(scope), namespace) => Scope::for_namespace(namespace, scope),
            (None, Namespace::Directory) => Ok(Scope::tenant()),
            (None, Namespace::ResourceScoped) => {
                Err(format!("resource role '{}' needs a scope", self.name))
            }
        }
    }

    /// Scope of one grant: its own override or the role's.
    pub fn grant_scope(&self, grant: &GrantSpec) -> Result<Scope, String> {
        match &grant.scope {
            Some(scope) => Scope::for_namespace(self.namespace, scope),
            None => self.scope(),
        }
    }

    /// Whether this role's activation policy is managed at all.
    pub fn manages_policy(&self) -> bool {
        self.activation.is_some() || self.reset_policy
    }

    /// Build the desired activation policy.
    ///
    /// `resolve` maps a principal reference to its object id.
    pub fn activation_policy<F>(&self, role_id: &str, resolve: F) -> Result<ActivationPolicy, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let activation = match (&self.activation, self.reset_policy) {
            (Some(_), true) => {
                return Err(format!(
                    "role '{}' sets both reset_policy and activation",
                    self.name
                ))
            }
            (None, true) => return Ok(ActivationPolicy::permissive(role_id)),
            (None, false) => {
                return Err(format!("role '{}' has no activation settings", self.name))
            }
            (Some(activation), false) => activation,
        };

        let max_duration = iso8601::parse_duration(&activation.max_duration)?;
        if max_duration <= Duration::zero() {
            return Err(format!(
                "max_duration '{}' must be positive",
                activation.max_duration
            ));
        }
        if activation.require_approval && activation.approvers.is_empty() {
            return Err(format!(
                "role '{}' requires approval but lists no approvers",
                self.name
            ));
        }

        let approver_principal_ids = if activation.require_approval {
            resolve_all(&activation.approvers, &resolve)?
        } else {
            BTreeSet::new()
        };
        let escalation = match (&activation.escalation, activation.require_approval) {
            (Some(e), true) => Some(Escalation {
                after_minutes: e.after_minutes,
                approver_ids: resolve_all(&e.approvers, &resolve)?,
            }),
            _ => None,
        };

        Ok(ActivationPolicy {
            role_id: role_id.to_string(),
            max_duration,
            require_mfa: activation.require_mfa,
            require_justification: activation.require_justification,
            require_ticket: activation.require_ticket,
            require_approval: activation.require_approval,
            approver_principal_ids,
            notify_on_activation: activation.notify_on_activation,
            escalation,
        })
    }
}

fn resolve_all<F>(refs: &[String], resolve: &F) -> Result<BTreeSet<String>, String>
where
    F: Fn(&str) -> Option<String>,
{
    refs.iter()
        .map(|r| resolve(r).ok_or_else(|| format!("principal '{}' not found", r)))
        .collect()
}

impl GrantSpec {
    pub fn justification(&self) -> &str {
        self.justification
            .as_deref()
            .unwrap_or(DEFAULT_GRANT_JUSTIFICATION)
    }
}

impl ReviewSpec {
    pub fn target(&self) -> Result<ReviewTarget<'_>, String> {
        match (&self.role, &self.query) {
            (Some(role), None) => Ok(ReviewTarget::Role(role)),
            (None, Some(query)) => Ok(ReviewTarget::Query(query)),
            _ => Err(format!(
                "review '{}' needs exactly one of role or query",
                self.name
            )),
        }
    }

    /// Build the review cycle. Decisions auto-apply and default to deny.
    pub fn cycle<F>(
        &self,
        scope: ReviewScope,
        start_date: NaiveDate,
        resolve: F,
    ) -> Result<AccessReviewCycle, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let resolve_list = |refs: &[String]| -> Result<Vec<String>, String> {
            refs.iter()
                .map(|r| resolve(r).ok_or_else(|| format!("reviewer '{}' not found", r)))
                .collect()
        };

        let cycle = AccessReviewCycle {
            name: self.name.clone(),
            description: self.description.clone(),
            scope,
            reviewer_ids: resolve_list(&self.reviewers)?,
            fallback_reviewer_ids: resolve_list(&self.fallback_reviewers)?,
            recurrence: self.recurrence.clone(),
            instance_duration_days: self.instance_duration_days,
            start_date,
            auto_apply_decisions: true,
            default_decision: ReviewDecision::Deny,
        };
        cycle.validate()?;
        Ok(cycle)
    }
}
