//! Stale-resource garbage collection shared by every connector.
//!
//! Connectors list their VMs and volumes, translate them into
//! [`StaleCandidate`] values, and hand them to a [`Janitor`]. The janitor
//! keeps only resources that carry the configured name prefix, are not marked
//! for keeping (`k-` prefix), and are at least `max_retention_hours` old.
//! Each deletion is attempted once and a failure never stops the pass.

use std::future::Future;

use chrono::{DateTime, NaiveDateTime, Utc};
use tracing::{info, warn};

use crate::exec::{ExecError, FailureKind};

/// Resources whose name starts with this prefix are never reclaimed.
pub const KEEP_PREFIX: &str = "k-";

/// Kind of cloud resource considered by a sweep.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum ResourceKind {
    /// Virtual machine.
    Vm,
    /// Block-storage volume or disk.
    Volume,
}

/// A resource listed by a provider.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StaleCandidate {
    /// Provider identifier used for deletion.
    pub id: String,
    /// Display name, matched against the prefix.
    pub name: String,
    /// VM or volume.
    pub kind: ResourceKind,
    /// Creation time reported by the provider.
    pub created: DateTime<Utc>,
}

/// Summary of a garbage-collection pass.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SweepSummary {
    /// Number of VMs deleted.
    pub deleted_vms: usize,
    /// Number of volumes or disks deleted.
    pub deleted_volumes: usize,
    /// Number of deletions that failed.
    pub failures: usize,
}

impl SweepSummary {
    /// Adds the counts of `other` to this summary.
    #[must_use]
    pub const fn merge(self, other: Self) -> Self {
        Self {
            deleted_vms: self.deleted_vms + other.deleted_vms,
            deleted_volumes: self.deleted_volumes + other.deleted_volumes,
            failures: self.failures + other.failures,
        }
    }
}

/// Returns `true` for names following the keep convention.
#[must_use]
pub fn is_protected(name: &str) -> bool {
    name.get(..KEEP_PREFIX.len())
        .is_some_and(|head| head.eq_ignore_ascii_case(KEEP_PREFIX))
}

/// Parses the creation timestamps emitted by the supported vendor CLIs.
///
/// Accepts RFC 3339 with any offset, and naive ISO 8601 timestamps (with or
/// without fractional seconds), which are taken as UTC.
#[must_use]
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let trimmed = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(parsed.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(trimmed, format).ok())
        .map(|naive| naive.and_utc())
}

/// Selection rules of a sweep.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SweepPolicy {
    /// Prefix identifying resources created by this tool.
    pub name_prefix: String,
    /// Minimum age, in whole hours, of a reclaimed resource.
    pub max_retention_hours: u64,
    /// Reference time for age computation.
    pub now: DateTime<Utc>,
}

impl SweepPolicy {
    /// Policy evaluated against the current time.
    #[must_use]
    pub fn new(name_prefix: impl Into<String>, max_retention_hours: u64) -> Self {
        Self {
            name_prefix: name_prefix.into(),
            max_retention_hours,
            now: Utc::now(),
        }
    }

    /// Replaces the reference time.
    #[must_use]
    pub fn at(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }

    /// Whole hours elapsed since `created`; zero for future timestamps.
    #[must_use]
    pub fn age_hours(&self, created: DateTime<Utc>) -> u64 {
        u64::try_from(self.now.signed_duration_since(created).num_hours()).unwrap_or(0)
    }

    /// Returns `true` when `candidate` should be deleted.
    #[must_use]
    pub fn is_stale(&self, candidate: &StaleCandidate) -> bool {
        candidate.name.starts_with(&self.name_prefix)
            && !is_protected(&candidate.name)
            && self.age_hours(candidate.created) >= self.max_retention_hours
    }
}

/// Applies a [`SweepPolicy`] to listed resources.
#[derive(Clone, Debug)]
pub struct Janitor {
    policy: SweepPolicy,
}

impl Janitor {
    /// Creates a janitor for `policy`.
    #[must_use]
    pub const fn new(policy: SweepPolicy) -> Self {
        Self { policy }
    }

    /// Selection rules in effect.
    #[must_use]
    pub const fn policy(&self) -> &SweepPolicy {
        &self.policy
    }

    /// Resources `policy` selects for deletion, VMs first.
    #[must_use]
    pub fn select(&self, candidates: Vec<StaleCandidate>) -> Vec<StaleCandidate> {
        let mut stale: Vec<StaleCandidate> = candidates
            .into_iter()
            .filter(|candidate| self.policy.is_stale(candidate))
            .collect();
        stale.sort_by_key(|candidate| candidate.kind);
        stale
    }

    /// Deletes every stale candidate with `delete`, one attempt each.
    ///
    /// A resource that has already disappeared counts as deleted.
    pub async fn sweep<F, Fut>(&self, candidates: Vec<StaleCandidate>, mut delete: F) -> SweepSummary
    where
        F: FnMut(StaleCandidate) -> Fut,
        Fut: Future<Output = Result<(), ExecError>>,
    {
        let mut summary = SweepSummary::default();
        for candidate in self.select(candidates) {
            let name = candidate.name.clone();
            let kind = candidate.kind;
            let age_hours = self.policy.age_hours(candidate.created);
            info!(name = %name, age_hours, "Deleting stale resource");

            let result = match delete(candidate).await {
                Err(err) if err.kind() == FailureKind::NotFound => Ok(()),
                other => other,
            };
            match (result, kind) {
                (Ok(()), ResourceKind::Vm) => summary.deleted_vms += 1,
                (Ok(()), ResourceKind::Volume) => summary.deleted_volumes += 1,
                (Err(err), _) => {
                    warn!(name = %name, error = %err, "Failed to delete stale resource");
                    summary.failures += 1;
                }
            }
        }
        info!(
            deleted_vms = summary.deleted_vms,
            deleted_volumes = summary.deleted_volumes,
            failures = summary.failures,
            "Garbage collection finished"
        );
        summary
    }
}

#[cfg(test)]
mod tests;
