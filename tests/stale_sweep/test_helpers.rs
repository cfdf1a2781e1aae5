//! Shared fixtures for stale-sweep BDD scenarios.

use std::sync::{Arc, Mutex, MutexGuard};

use benchvm::exec::{ExecError, FailureKind};
use benchvm::janitor::{ResourceKind, StaleCandidate, SweepSummary};
use chrono::{DateTime, Duration, TimeZone, Utc};
use rstest::fixture;

/// Listing, scripted outcomes, and results of one scenario.
#[derive(Debug, Default)]
pub struct SweepState {
    pub candidates: Vec<StaleCandidate>,
    pub failing: Vec<String>,
    pub missing: Vec<String>,
    pub attempted: Vec<String>,
    pub summary: Option<SweepSummary>,
}

#[derive(Clone, Debug)]
pub struct SweepContext {
    pub now: DateTime<Utc>,
    state: Arc<Mutex<SweepState>>,
}

impl SweepContext {
    pub fn state(&self) -> MutexGuard<'_, SweepState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn add(&self, name: &str, kind: ResourceKind, hours: i64) {
        let created = self.now - Duration::hours(hours);
        self.state().candidates.push(StaleCandidate {
            id: format!("id-{name}"),
            name: name.to_owned(),
            kind,
            created,
        });
    }

    /// Records the attempt and returns the scripted outcome of deleting
    /// `name`.
    pub fn delete(&self, name: &str) -> Result<(), ExecError> {
        let mut state = self.state();
        state.attempted.push(name.to_owned());
        let failure = |stderr: &str, kind: FailureKind| ExecError::Failed {
            command: format!("delete {name}"),
            code: Some(1),
            stderr: stderr.to_owned(),
            kind,
        };
        if state.failing.iter().any(|failing| failing == name) {
            Err(failure("Internal error", FailureKind::Transient))
        } else if state.missing.iter().any(|missing| missing == name) {
            Err(failure("resource was not found", FailureKind::NotFound))
        } else {
            Ok(())
        }
    }
}

#[fixture]
pub fn sweep_context() -> SweepContext {
    let now = Utc
        .with_ymd_and_hms(2024, 3, 1, 12, 0, 0)
        .single()
        .unwrap_or_else(|| panic!("reference time should be valid"));
    SweepContext {
        now,
        state: Arc::new(Mutex::new(SweepState::default())),
    }
}
