//! BDD scenarios for the stale-resource sweep.

use rstest_bdd_macros::scenario;

use super::test_helpers::{SweepContext, sweep_context};

#[scenario(
    path = "tests/features/stale_sweep.feature",
    name = "Reclaim resources at or beyond the retention period"
)]
fn scenario_retention_boundary(sweep_context: SweepContext) {
    drop(sweep_context);
}

#[scenario(
    path = "tests/features/stale_sweep.feature",
    name = "Leave kept and foreign resources alone"
)]
fn scenario_protected_resources(sweep_context: SweepContext) {
    drop(sweep_context);
}

#[scenario(
    path = "tests/features/stale_sweep.feature",
    name = "Delete virtual machines before their volumes"
)]
fn scenario_vms_first(sweep_context: SweepContext) {
    drop(sweep_context);
}

#[scenario(
    path = "tests/features/stale_sweep.feature",
    name = "Keep sweeping after a failed deletion"
)]
fn scenario_failures_contained(sweep_context: SweepContext) {
    drop(sweep_context);
}
