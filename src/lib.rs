//! Privileged access governance: activation policies, eligibility grants and
//! access reviews reconciled against Azure AD and Azure RBAC.
//!
//! The `pimgov` binary is a thin CLI over [`reconcile::Orchestrator`].

#![deny(clippy::all)]

pub mod approval;
pub mod auth;
pub mod config;
pub mod desired;
pub mod directory;
pub mod error;
pub mod iso8601;
pub mod reconcile;
