//! Directory data models for privileged access governance.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Which API family owns a role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Namespace {
    /// Directory-wide roles (Entra ID roles via Microsoft Graph).
    Directory,
    /// Azure resource roles (via Azure Resource Manager).
    #[serde(rename = "resource")]
    ResourceScoped,
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Directory => f.write_str("directory"),
            Self::ResourceScoped => f.write_str("resource"),
        }
    }
}

/// The kind of target a scope identifier names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeKind {
    Directory,
    Resource,
}

/// Where a role applies.
///
/// Directory scopes look like `/` or `/administrativeUnits/{id}`; resource
/// scopes are ARM paths such as `/subscriptions/{id}/resourceGroups/{rg}`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Scope {
    pub kind: ScopeKind,
    pub id: String,
}

impl Scope {
    /// The tenant-wide directory scope.
    pub fn tenant() -> Self {
        Self {
            kind: ScopeKind::Directory,
            id: "/".to_string(),
        }
    }

    /// Build a scope for a role in `namespace`, checking the identifier shape.
    pub fn for_namespace(namespace: Namespace, id: &str) -> Result<Self, String> {
        let id = id.trim();
        if !id.starts_with('/') {
            return Err(format!("scope '{}' must start with '/'", id));
        }
        match namespace {
            Namespace::Directory => {
                if id.starts_with("/subscriptions/") || id.starts_with("/providers/") {
                    return Err(format!(
                        "scope '{}' is an Azure resource path but the role is a directory role",
                        id
                    ));
                }
                Ok(Self {
                    kind: ScopeKind::Directory,
                    id: id.to_string(),
                })
            }
            Namespace::ResourceScoped => {
                if !(id.starts_with("/subscriptions/")
                    || id.starts_with("/providers/Microsoft.Management/managementGroups/"))
                {
                    return Err(format!(
                        "scope '{}' is not an Azure resource path but the role is a resource role",
                        id
                    ));
                }
                Ok(Self {
                    kind: ScopeKind::Resource,
                    id: id.trim_end_matches('/').to_string(),
                })
            }
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

/// A role as known to the remote directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleDefinition {
    /// Opaque identifier. A GUID for directory roles, a full ARM path
    /// (`/subscriptions/{sub}/providers/Microsoft.Authorization/roleDefinitions/{id}`)
    /// for resource roles.
    pub id: String,

    /// Human-readable role name (e.g. "Global Administrator", "Owner").
    pub display_name: String,

    pub namespace: Namespace,
}

/// Identifier of the activation policy attached to a role at a scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PolicyId {
    pub id: String,
    pub namespace: Namespace,
}

/// The four rule kinds of an activation policy, in reconciliation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleKind {
    Expiration,
    Enablement,
    Approval,
    Notification,
}

impl RuleKind {
    /// Fixed order in which rules are applied and reported.
    pub const ORDER: [RuleKind; 4] = [
        RuleKind::Expiration,
        RuleKind::Enablement,
        RuleKind::Approval,
        RuleKind::Notification,
    ];

    /// Rule identifier used by both Graph and ARM policy APIs.
    pub fn rule_id(self) -> &'static str {
        match self {
            Self::Expiration => "Expiration_EndUser_Assignment",
            Self::Enablement => "Enablement_EndUser_Assignment",
            Self::Approval => "Approval_EndUser_Assignment",
            Self::Notification => "Notification_Admin_EndUser_Assignment",
        }
    }

    pub fn from_rule_id(id: &str) -> Option<Self> {
        Self::ORDER.into_iter().find(|kind| kind.rule_id() == id)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Expiration => "expiration",
            Self::Enablement => "enablement",
            Self::Approval => "approval",
            Self::Notification => "notification",
        }
    }
}

impl fmt::Display for RuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Approval escalation: who gets the request when primary approvers do not act.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Escalation {
    pub after_minutes: u32,
    pub approver_ids: BTreeSet<String>,
}

/// Approval stage settings of the approval rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovalSetting {
    pub required: bool,
    pub approver_ids: BTreeSet<String>,
    pub stage_timeout_days: u32,
    pub approver_justification_required: bool,
    /// `None` means escalation is disabled (zero minutes, flag off).
    pub escalation: Option<Escalation>,
}

/// Single-stage approvals time out after one day.
pub const APPROVAL_STAGE_TIMEOUT_DAYS: u32 = 1;

impl ApprovalSetting {
    /// Approval turned off. Stage details are irrelevant and normalized away.
    pub fn disabled() -> Self {
        Self {
            required: false,
            approver_ids: BTreeSet::new(),
            stage_timeout_days: APPROVAL_STAGE_TIMEOUT_DAYS,
            approver_justification_required: false,
            escalation: None,
        }
    }

    /// One approval stage with a one-day timeout and approver justification.
    pub fn single_stage(approver_ids: BTreeSet<String>, escalation: Option<Escalation>) -> Self {
        Self {
            required: true,
            approver_ids,
            stage_timeout_days: APPROVAL_STAGE_TIMEOUT_DAYS,
            approver_justification_required: true,
            escalation,
        }
    }

    /// Build from values read back from the directory, normalizing a disabled rule.
    pub fn from_remote(
        required: bool,
        approver_ids: BTreeSet<String>,
        stage_timeout_days: u32,
        approver_justification_required: bool,
        escalation: Option<Escalation>,
    ) -> Self {
        if !required {
            return Self::disabled();
        }
        Self {
            required,
            approver_ids,
            stage_timeout_days,
            approver_justification_required,
            escalation,
        }
    }
}

/// One rule of an activation policy, carrying normalized values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyRule {
    Expiration {
        max_duration: Duration,
    },
    Enablement {
        mfa: bool,
        justification: bool,
        ticketing: bool,
    },
    Approval(ApprovalSetting),
    Notification {
        enabled: bool,
    },
}

impl PolicyRule {
    pub fn kind(&self) -> RuleKind {
        match self {
            Self::Expiration { .. } => RuleKind::Expiration,
            Self::Enablement { .. } => RuleKind::Enablement,
            Self::Approval(_) => RuleKind::Approval,
            Self::Notification { .. } => RuleKind::Notification,
        }
    }
}

/// Desired activation requirements for one role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivationPolicy {
    pub role_id: String,
    pub max_duration: Duration,
    pub require_mfa: bool,
    pub require_justification: bool,
    pub require_ticket: bool,
    pub require_approval: bool,
    pub approver_principal_ids: BTreeSet<String>,
    pub notify_on_activation: bool,
    pub escalation: Option<Escalation>,
}

/// Activation window the directory uses when nothing stricter is configured.
pub const DEFAULT_MAX_ACTIVATION_HOURS: i64 = 8;

impl ActivationPolicy {
    /// The permissive default a role is reset to when its policy is "removed".
    pub fn permissive(role_id: impl Into<String>) -> Self {
        Self {
            role_id: role_id.into(),
            max_duration: Duration::hours(DEFAULT_MAX_ACTIVATION_HOURS),
            require_mfa: false,
            require_justification: false,
            require_ticket: false,
            require_approval: false,
            approver_principal_ids: BTreeSet::new(),
            notify_on_activation: true,
            escalation: None,
        }
    }

    /// The four rules this policy maps to, in reconciliation order.
    pub fn rules(&self) -> [PolicyRule; 4] {
        let approval = if self.require_approval {
            ApprovalSetting::single_stage(
                self.approver_principal_ids.clone(),
                self.escalation.clone(),
            )
        } else {
            ApprovalSetting::disabled()
        };

        [
            PolicyRule::Expiration {
                max_duration: self.max_duration,
            },
            PolicyRule::Enablement {
                mfa: self.require_mfa,
                justification: self.require_justification,
                ticketing: self.require_ticket,
            },
            PolicyRule::Approval(approval),
            PolicyRule::Notification {
                enabled: self.notify_on_activation,
            },
        ]
    }
}

/// How an eligibility ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantExpiration {
    AfterDuration(Duration),
    AtDateTime(DateTime<Utc>),
    Never,
}

impl GrantExpiration {
    /// End time for a schedule starting at `start`.
    ///
    /// `None` for grants that never end, and for durations whose end falls
    /// outside the representable date range.
    pub fn end_time(&self, start: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::AfterDuration(d) => start.checked_add_signed(*d),
            Self::AtDateTime(at) => Some(*at),
            Self::Never => None,
        }
    }
}

/// Lifecycle state of an eligibility grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GrantState {
    Eligible,
    Active,
    Expired,
}

/// An eligible assignment of a role to a principal at a scope.
#[derive(Debug, Clone, PartialEq)]
pub struct EligibilityGrant {
    /// Remote schedule id, when known.
    pub id: Option<String>,
    pub principal_id: String,
    pub role_id: String,
    pub scope: Scope,
    pub start_time: DateTime<Utc>,
    pub expiration: GrantExpiration,
    pub state: GrantState,
}

impl EligibilityGrant {
    /// Effective state at `now`. Expiry happens by time, never by mutation.
    ///
    /// An end beyond the representable range never expires.
    pub fn state_at(&self, now: DateTime<Utc>) -> GrantState {
        match self.expiration.end_time(self.start_time) {
            Some(end) if end <= now => GrantState::Expired,
            _ => self.state,
        }
    }
}

/// A request to create an eligibility grant.
#[derive(Debug, Clone, PartialEq)]
pub struct EligibilityRequest {
    pub principal_id: String,
    pub role_id: String,
    pub scope: Scope,
    pub start_time: DateTime<Utc>,
    pub expiration: GrantExpiration,
    pub justification: String,
}

impl EligibilityRequest {
    /// Build a request starting at `now`. The computed end must lie strictly in the future.
    pub fn starting_at(
        principal_id: impl Into<String>,
        role_id: impl Into<String>,
        scope: Scope,
        expiration: GrantExpiration,
        now: DateTime<Utc>,
        justification: impl Into<String>,
    ) -> Result<Self, String> {
        match expiration {
            GrantExpiration::AfterDuration(d) if d <= Duration::zero() => {
                return Err("grant duration must be positive".to_string())
            }
            GrantExpiration::AfterDuration(d) if now.checked_add_signed(d).is_none() => {
                return Err(format!(
                    "grant duration of {} days ends past the supported date range",
                    d.num_days()
                ))
            }
            GrantExpiration::AtDateTime(at) if at <= now => {
                return Err(format!("grant end {} is not in the future", at.to_rfc3339()))
            }
            _ => {}
        }

        Ok(Self {
            principal_id: principal_id.into(),
            role_id: role_id.into(),
            scope,
            start_time: now,
            expiration,
            justification: justification.into(),
        })
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.expiration.end_time(self.start_time)
    }

    /// Deterministic key for retried creates of this (principal, role, scope).
    pub fn idempotency_key(&self) -> IdempotencyKey {
        IdempotencyKey::derive(
            "eligibility",
            &[&self.principal_id, &self.role_id, &self.scope.id],
        )
    }
}

/// What an access review decides for a reviewed item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReviewDecision {
    Allow,
    Deny,
}

/// Whether a reviewed assignment survives an instance of a review.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessFate {
    Retained,
    Removed,
}

/// Recurrence of an access review.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Recurrence {
    Weekly {
        #[serde(default = "default_interval")]
        interval: u32,
    },
    Monthly {
        #[serde(default = "default_interval")]
        interval: u32,
        day_of_month: u32,
    },
}

fn default_interval() -> u32 {
    1
}

/// Largest accepted recurrence interval, in weeks or months.
pub const MAX_RECURRENCE_INTERVAL: u32 = 52;

impl Recurrence {
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Self::Weekly { interval } | Self::Monthly { interval, .. } if *interval == 0 => {
                Err("recurrence interval must be at least 1".to_string())
            }
            Self::Weekly { interval } | Self::Monthly { interval, .. }
                if *interval > MAX_RECURRENCE_INTERVAL =>
            {
                Err(format!(
                    "recurrence interval {} exceeds {}",
                    interval, MAX_RECURRENCE_INTERVAL
                ))
            }
            Self::Monthly { day_of_month, .. } if !(1..=31).contains(day_of_month) => Err(
                format!("day_of_month {} is outside 1..=31", day_of_month),
            ),
            _ => Ok(()),
        }
    }

    /// Length of one recurrence period in days, rounded down for months.
    pub fn min_period_days(&self) -> u32 {
        match self {
            Self::Weekly { interval } => interval.saturating_mul(7),
            Self::Monthly { interval, .. } => interval.saturating_mul(28),
        }
    }
}

impl fmt::Display for Recurrence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Weekly { interval: 1 } => f.write_str("weekly"),
            Self::Weekly { interval } => write!(f, "every {} weeks", interval),
            Self::Monthly {
                interval: 1,
                day_of_month,
            } => write!(f, "monthly, day {}", day_of_month),
            Self::Monthly {
                interval,
                day_of_month,
            } => write!(f, "every {} months, day {}", interval, day_of_month),
        }
    }
}

/// Which assignments a review covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewScope {
    /// Graph query selecting the reviewed principal/role pairs.
    pub query: String,
}

impl ReviewScope {
    /// Review the eligible assignments of one directory role.
    pub fn role_eligibility(role_id: &str) -> Self {
        Self {
            query: format!(
                "/roleManagement/directory/roleEligibilitySchedules?$expand=principal&$filter=(roleDefinitionId eq '{}')",
                role_id
            ),
        }
    }
}

/// A recurring access review definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessReviewCycle {
    pub name: String,
    pub description: String,
    pub scope: ReviewScope,
    pub reviewer_ids: Vec<String>,
    pub fallback_reviewer_ids: Vec<String>,
    pub recurrence: Recurrence,
    pub instance_duration_days: u32,
    pub start_date: NaiveDate,
    pub auto_apply_decisions: bool,
    pub default_decision: ReviewDecision,
}

impl AccessReviewCycle {
    /// Check the definition before anything is sent to the directory.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("review name must not be empty".to_string());
        }
        if self.reviewer_ids.is_empty() && self.fallback_reviewer_ids.is_empty() {
            return Err(format!(
                "review '{}' has no reviewers and no fallback reviewers",
                self.name
            ));
        }
        if self.instance_duration_days == 0 {
            return Err(format!(
                "review '{}' instance duration must be at least 1 day",
                self.name
            ));
        }
        self.recurrence.validate()?;
        if self.instance_duration_days > self.recurrence.min_period_days() {
            return Err(format!(
                "review '{}' instance duration of {} days overlaps the next {} instance",
                self.name, self.instance_duration_days, self.recurrence
            ));
        }
        Ok(())
    }

    /// What happens to a reviewed assignment when an instance closes.
    pub fn access_after_deadline(&self, decision: Option<ReviewDecision>) -> AccessFate {
        let effective = match decision {
            Some(d) => Some(d),
            None if self.auto_apply_decisions => Some(self.default_decision),
            None => None,
        };
        match effective {
            Some(ReviewDecision::Deny) if self.auto_apply_decisions => AccessFate::Removed,
            _ => AccessFate::Retained,
        }
    }

    pub fn idempotency_key(&self) -> IdempotencyKey {
        IdempotencyKey::derive("access-review", &[&self.name])
    }
}

/// Minimal view of an existing review definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessReviewSummary {
    pub id: String,
    pub name: String,
    pub status: Option<String>,
}

/// Namespace for deterministic idempotency keys.
const IDEMPOTENCY_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_2a3e_8d4b_4f7a_9c55_0e21_b7d3_a914);

/// Deterministic key derived from an entity kind and its target identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IdempotencyKey(Uuid);

impl IdempotencyKey {
    pub fn derive(kind: &str, parts: &[&str]) -> Self {
        let mut name = String::from(kind);
        for part in parts {
            name.push('|');
            name.push_str(&part.to_ascii_lowercase());
        }
        Self(Uuid::new_v5(&IDEMPOTENCY_NAMESPACE, name.as_bytes()))
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}
