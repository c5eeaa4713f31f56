//! Run report: per-item outcomes, per-kind counts, console and JSON rendering.

use std::collections::BTreeMap;
use std::fmt;
use std::fmt::Write as _;

use serde::Serialize;

/// Entity kind an item belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Policy,
    Eligibility,
    Review,
}

impl EntityKind {
    pub const ALL: [EntityKind; 3] = [Self::Policy, Self::Eligibility, Self::Review];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Policy => "policy",
            Self::Eligibility => "eligibility",
            Self::Review => "review",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Count bucket of an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Created,
    Unchanged,
    Skipped,
    Failed,
}

/// What happened to one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Detail {
    /// A policy rule was written.
    Applied,
    /// Remote state already matched.
    Unchanged,
    /// A grant or review was created.
    Created,
    AlreadyEligible,
    AlreadyExists,
    RoleNotPimEnabled,
    Failed,
}

impl Detail {
    pub fn outcome(self) -> Outcome {
        match self {
            Self::Applied | Self::Created => Outcome::Created,
            Self::Unchanged | Self::AlreadyEligible => Outcome::Unchanged,
            Self::AlreadyExists | Self::RoleNotPimEnabled => Outcome::Skipped,
            Self::Failed => Outcome::Failed,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::Unchanged => "unchanged",
            Self::Created => "created",
            Self::AlreadyEligible => "already eligible",
            Self::AlreadyExists => "already exists",
            Self::RoleNotPimEnabled => "role not PIM-enabled",
            Self::Failed => "failed",
        }
    }
}

/// Outcome of one reconciled item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemReport {
    pub kind: EntityKind,
    pub key: String,
    pub outcome: Outcome,
    pub detail: Detail,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ItemReport {
    pub fn new(kind: EntityKind, key: impl Into<String>, detail: Detail) -> Self {
        Self {
            kind,
            key: key.into(),
            outcome: detail.outcome(),
            detail,
            reason: None,
        }
    }

    pub fn failed(kind: EntityKind, key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
            ..Self::new(kind, key, Detail::Failed)
        }
    }
}

/// Per-kind totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Counts {
    pub created: usize,
    pub unchanged: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl Counts {
    fn add(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Created => self.created += 1,
            Outcome::Unchanged => self.unchanged += 1,
            Outcome::Skipped => self.skipped += 1,
            Outcome::Failed => self.failed += 1,
        }
    }
}

/// Everything a run did, in input order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    /// Why the run stopped early, if it did.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aborted: Option<String>,
    pub summary: BTreeMap<EntityKind, Counts>,
    pub items: Vec<ItemReport>,
}

impl RunReport {
    pub fn push(&mut self, item: ItemReport) {
        self.summary.entry(item.kind).or_default().add(item.outcome);
        self.items.push(item);
    }

    pub fn extend(&mut self, items: impl IntoIterator<Item = ItemReport>) {
        for item in items {
            self.push(item);
        }
    }

    pub fn abort(&mut self, reason: impl Into<String>) {
        self.aborted = Some(reason.into());
    }

    pub fn counts(&self, kind: EntityKind) -> Counts {
        self.summary.get(&kind).copied().unwrap_or_default()
    }

    pub fn failed(&self) -> usize {
        self.summary.values().map(|c| c.failed).sum()
    }

    /// Items of one kind, in input order.
    pub fn items_of(&self, kind: EntityKind) -> impl Iterator<Item = &ItemReport> {
        self.items.iter().filter(move |i| i.kind == kind)
    }

    pub fn find(&self, kind: EntityKind, key: &str) -> Option<&ItemReport> {
        self.items.iter().find(|i| i.kind == kind && i.key == key)
    }

    /// 0 when clean, 1 when any item failed, 2 when the run was aborted.
    pub fn exit_code(&self) -> i32 {
        if self.aborted.is_some() {
            2
        } else if self.failed() > 0 {
            1
        } else {
            0
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Render a plain-text table for the console.
    pub fn render_table(&self) -> String {
        let key_width = self
            .items
            .iter()
            .map(|i| i.key.len())
            .max()
            .unwrap_or(0)
            .max("KEY".len());

        let mut out = String::new();
        let _ = writeln!(
            out,
            "{:<12} {:<kw$} {:<10} {:<21} REASON",
            "KIND",
            "KEY",
            "OUTCOME",
            "DETAIL",
            kw = key_width
        );
        for item in &self.items {
            let _ = writeln!(
                out,
                "{:<12} {:<kw$} {:<10} {:<21} {}",
                item.kind.as_str(),
                item.key,
                format!("{:?}", item.outcome).to_lowercase(),
                item.detail.label(),
                item.reason.as_deref().unwrap_or(""),
                kw = key_width
            );
        }

        let _ = writeln!(out);
        let _ = writeln!(
            out,
            "{:<12} {:>8} {:>10} {:>8} {:>7}",
            "SUMMARY", "created", "unchanged", "skipped", "failed"
        );
        for kind in EntityKind::ALL {
            let c = self.counts(kind);
            let _ = writeln!(
                out,
                "{:<12} {:>8} {:>10} {:>8} {:>7}",
                kind.as_str(),
                c.created,
                c.unchanged,
                c.skipped,
                c.failed
            );
        }

        if let Some(reason) = &self.aborted {
            let _ = writeln!(out);
            let _ = writeln!(out, "Run aborted: {}", reason);
        }
        out
    }
}
