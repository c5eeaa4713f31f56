//! Activation request lifecycle.
//!
//! A principal holding an eligible grant activates it by submitting a request:
//! `Pending -> {Approved -> Active -> Expired ; Denied}`. A denied request is
//! finished; the grant stays eligible and a new request starts over.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

use crate::directory::models::{ActivationPolicy, EligibilityGrant, GrantState};
use crate::iso8601;

/// Status of one activation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationStatus {
    /// Submitted, waiting for an approver (or for activation when none is needed).
    Pending,
    Approved,
    /// Rejected by an approver. Terminal for this attempt.
    Denied,
    Active,
    Expired,
}

impl ActivationStatus {
    /// Check if no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Denied | Self::Expired)
    }
}

impl fmt::Display for ActivationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Denied => "denied",
            Self::Active => "active",
            Self::Expired => "expired",
        };
        f.write_str(s)
    }
}

/// Rejected submissions and illegal transitions.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("grant is not eligible for activation")]
    GrantNotEligible,

    #[error("multi-factor authentication is required")]
    MfaRequired,

    #[error("a justification is required")]
    JustificationRequired,

    #[error("a ticket reference is required")]
    TicketRequired,

    #[error("requested {requested} exceeds the maximum activation of {max}")]
    DurationExceeded { requested: String, max: String },

    #[error("activation requires an approved decision")]
    ApprovalRequired,

    #[error("cannot {action} a {from} request")]
    Illegal {
        from: ActivationStatus,
        action: &'static str,
    },
}

/// What the principal presents when asking to activate.
#[derive(Debug, Clone)]
pub struct ActivationAttempt {
    pub duration: Duration,
    pub mfa_satisfied: bool,
    pub justification: Option<String>,
    pub ticket_ref: Option<String>,
}

/// One attempt to turn an eligible grant into an active one.
#[derive(Debug, Clone)]
pub struct ActivationRequest {
    pub grant_id: Option<String>,
    pub requested_at: DateTime<Utc>,
    pub justification: Option<String>,
    pub ticket_ref: Option<String>,
    pub duration: Duration,
    pub requires_approval: bool,
    status: ActivationStatus,
    active_until: Option<DateTime<Utc>>,
}

fn present(value: &Option<String>) -> bool {
    value.as_deref().map(|v| !v.trim().is_empty()).unwrap_or(false)
}

impl ActivationRequest {
    /// Submit an attempt against `grant`, checking the proofs `policy` requires.
    pub fn submit(
        grant: &EligibilityGrant,
        policy: &ActivationPolicy,
        attempt: ActivationAttempt,
        now: DateTime<Utc>,
    ) -> Result<Self, TransitionError> {
        if grant.state_at(now) != GrantState::Eligible {
            return Err(TransitionError::GrantNotEligible);
        }
        if policy.require_mfa && !attempt.mfa_satisfied {
            return Err(TransitionError::MfaRequired);
        }
        if policy.require_justification && !present(&attempt.justification) {
            return Err(TransitionError::JustificationRequired);
        }
        if policy.require_ticket && !present(&attempt.ticket_ref) {
            return Err(TransitionError::TicketRequired);
        }
        if attempt.duration > policy.max_duration {
            return Err(TransitionError::DurationExceeded {
                requested: iso8601::humanize(attempt.duration),
                max: iso8601::humanize(policy.max_duration),
            });
        }

        Ok(Self {
            grant_id: grant.id.clone(),
            requested_at: now,
            justification: attempt.justification,
            ticket_ref: attempt.ticket_ref,
            duration: attempt.duration,
            requires_approval: policy.require_approval,
            status: ActivationStatus::Pending,
            active_until: None,
        })
    }

    /// Status at `now`; an active request past its end reads as expired.
    pub fn status_at(&self, now: DateTime<Utc>) -> ActivationStatus {
        match (self.status, self.active_until) {
            (ActivationStatus::Active, Some(until)) if until <= now => ActivationStatus::Expired,
            (status, _) => status,
        }
    }

    pub fn active_until(&self) -> Option<DateTime<Utc>> {
        self.active_until
    }

    pub fn approve(&mut self) -> Result<(), TransitionError> {
        self.decide(ActivationStatus::Approved, "approve")
    }

    pub fn deny(&mut self) -> Result<(), TransitionError> {
        self.decide(ActivationStatus::Denied, "deny")
    }

    fn decide(&mut self, to: ActivationStatus, action: &'static str) -> Result<(), TransitionError> {
        if self.status != ActivationStatus::Pending || !self.requires_approval {
            return Err(TransitionError::Illegal {
                from: self.status,
                action,
            });
        }
        self.status = to;
        Ok(())
    }

    /// Start the activation window.
    ///
    /// A pending request may go straight to active only when the policy does
    /// not require approval.
    pub fn activate(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        match self.status {
            ActivationStatus::Approved => {}
            ActivationStatus::Pending if !self.requires_approval => {}
            ActivationStatus::Pending => return Err(TransitionError::ApprovalRequired),
            from => {
                return Err(TransitionError::Illegal {
                    from,
                    action: "activate",
                })
            }
        }
        self.status = ActivationStatus::Active;
        self.active_until = Some(now + self.duration);
        Ok(())
    }
}
