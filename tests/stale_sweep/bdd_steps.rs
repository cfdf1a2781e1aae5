//! BDD step definitions for the stale-resource sweep.

use benchvm::janitor::{Janitor, ResourceKind, SweepPolicy};
use rstest_bdd_macros::{given, then, when};
use tokio::runtime::Runtime;

use super::test_helpers::SweepContext;

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("assertion failed: {0}")]
    Assertion(String),
}

#[given("a virtual machine \"{name}\" created {hours} hours ago")]
fn vm_created(sweep_context: SweepContext, name: String, hours: i64) -> SweepContext {
    sweep_context.add(&name, ResourceKind::Vm, hours);
    sweep_context
}

#[given("a volume \"{name}\" created {hours} hours ago")]
fn volume_created(sweep_context: SweepContext, name: String, hours: i64) -> SweepContext {
    sweep_context.add(&name, ResourceKind::Volume, hours);
    sweep_context
}

#[given("deleting \"{name}\" fails")]
fn deletion_fails(sweep_context: SweepContext, name: String) -> SweepContext {
    sweep_context.state().failing.push(name);
    sweep_context
}

#[given("deleting \"{name}\" reports that it is already gone")]
fn deletion_not_found(sweep_context: SweepContext, name: String) -> SweepContext {
    sweep_context.state().missing.push(name);
    sweep_context
}

#[when("the janitor sweeps prefix \"{prefix}\" with a retention of {hours} hours")]
fn sweep(sweep_context: SweepContext, prefix: String, hours: u64) -> Result<SweepContext, StepError> {
    let runtime = Runtime::new().map_err(|err| StepError::Assertion(err.to_string()))?;
    let janitor = Janitor::new(SweepPolicy::new(prefix, hours).at(sweep_context.now));
    let candidates = sweep_context.state().candidates.clone();

    let context = sweep_context.clone();
    let summary = runtime.block_on(janitor.sweep(candidates, move |candidate| {
        let result = context.delete(&candidate.name);
        async move { result }
    }));
    sweep_context.state().summary = Some(summary);
    Ok(sweep_context)
}

#[then("the janitor reports {vms} virtual machines and {volumes} volumes deleted")]
fn deleted_counts(sweep_context: &SweepContext, vms: usize, volumes: usize) -> Result<(), StepError> {
    let summary = sweep_context
        .state()
        .summary
        .ok_or_else(|| StepError::Assertion(String::from("sweep did not run")))?;
    if (summary.deleted_vms, summary.deleted_volumes) == (vms, volumes) {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected {vms} VMs and {volumes} volumes deleted, got {summary:?}"
        )))
    }
}

#[then("the janitor reports {failures} failed deletions")]
fn failed_count(sweep_context: &SweepContext, failures: usize) -> Result<(), StepError> {
    let summary = sweep_context
        .state()
        .summary
        .ok_or_else(|| StepError::Assertion(String::from("sweep did not run")))?;
    if summary.failures == failures {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected {failures} failures, got {}",
            summary.failures
        )))
    }
}

#[then("\"{name}\" is kept")]
fn resource_kept(sweep_context: &SweepContext, name: String) -> Result<(), StepError> {
    if sweep_context.state().attempted.contains(&name) {
        Err(StepError::Assertion(format!("{name} should not be deleted")))
    } else {
        Ok(())
    }
}

#[then("\"{name}\" is deleted")]
fn resource_deleted(sweep_context: &SweepContext, name: String) -> Result<(), StepError> {
    if sweep_context.state().attempted.contains(&name) {
        Ok(())
    } else {
        Err(StepError::Assertion(format!("{name} should be deleted")))
    }
}

#[then("\"{first}\" is deleted before \"{second}\"")]
fn deletion_order(
    sweep_context: &SweepContext,
    first: String,
    second: String,
) -> Result<(), StepError> {
    let state = sweep_context.state();
    let position = |name: &String| state.attempted.iter().position(|item| item == name);
    match (position(&first), position(&second)) {
        (Some(before), Some(after)) if before < after => Ok(()),
        _ => Err(StepError::Assertion(format!(
            "expected {first} before {second}, got {:?}",
            state.attempted
        ))),
    }
}
