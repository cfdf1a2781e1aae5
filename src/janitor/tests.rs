//! Unit tests for stale-resource selection and sweeping.

use std::sync::{Arc, Mutex};

use chrono::{Duration, TimeZone};
use rstest::{fixture, rstest};

use super::*;

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0)
        .single()
        .expect("valid timestamp")
}

fn candidate(name: &str, kind: ResourceKind, age_hours: i64) -> StaleCandidate {
    StaleCandidate {
        id: format!("id-{name}"),
        name: name.to_owned(),
        kind,
        created: now() - Duration::hours(age_hours) - Duration::minutes(5),
    }
}

#[fixture]
fn janitor() -> Janitor {
    Janitor::new(SweepPolicy::new("bench", 24).at(now()))
}

fn aged_vms() -> Vec<StaleCandidate> {
    [1, 10, 24, 25, 100]
        .into_iter()
        .map(|age| candidate(&format!("bench-{age}h"), ResourceKind::Vm, age))
        .collect()
}

fn failed() -> ExecError {
    ExecError::Failed {
        command: String::from("delete"),
        code: Some(1),
        stderr: String::from("internal error"),
        kind: FailureKind::Transient,
    }
}

#[rstest]
fn select_keeps_resources_at_or_past_retention(janitor: Janitor) {
    let names: Vec<String> = janitor
        .select(aged_vms())
        .into_iter()
        .map(|found| found.name)
        .collect();

    assert_eq!(names, vec!["bench-24h", "bench-25h", "bench-100h"]);
}

#[rstest]
fn select_skips_kept_and_foreign_resources(janitor: Janitor) {
    let candidates = vec![
        candidate("k-bench-1", ResourceKind::Vm, 200),
        candidate("K-bench-2", ResourceKind::Vm, 200),
        candidate("other-1", ResourceKind::Vm, 200),
        candidate("bench-1-volume", ResourceKind::Volume, 200),
        candidate("bench-1", ResourceKind::Vm, 200),
    ];

    let selected = janitor.select(candidates);

    assert_eq!(selected.len(), 2);
    assert_eq!(selected.first().map(|found| found.kind), Some(ResourceKind::Vm));
    assert_eq!(
        selected.get(1).map(|found| found.name.as_str()),
        Some("bench-1-volume")
    );
}

#[rstest]
#[tokio::test]
async fn sweep_deletes_every_stale_resource(janitor: Janitor) {
    let deleted = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&deleted);

    let summary = janitor
        .sweep(aged_vms(), move |found| {
            seen.lock().expect("lock").push(found.name);
            async { Ok(()) }
        })
        .await;

    assert_eq!(summary.deleted_vms, 3);
    assert_eq!(summary.failures, 0);
    assert_eq!(
        *deleted.lock().expect("lock"),
        vec!["bench-24h", "bench-25h", "bench-100h"]
    );
}

#[rstest]
#[tokio::test]
async fn sweep_continues_after_a_failure(janitor: Janitor) {
    let summary = janitor
        .sweep(aged_vms(), |found| async move {
            if found.name == "bench-25h" {
                Err(failed())
            } else {
                Ok(())
            }
        })
        .await;

    assert_eq!(
        summary,
        SweepSummary {
            deleted_vms: 2,
            deleted_volumes: 0,
            failures: 1,
        }
    );
}

#[rstest]
#[tokio::test]
async fn sweep_counts_vanished_resources_as_deleted(janitor: Janitor) {
    let volumes = vec![candidate("bench-1-volume", ResourceKind::Volume, 48)];

    let summary = janitor
        .sweep(volumes, |_| async {
            Err(ExecError::Failed {
                command: String::from("delete"),
                code: Some(1),
                stderr: String::from("No volume with a name or ID of 'x' exists."),
                kind: FailureKind::NotFound,
            })
        })
        .await;

    assert_eq!(summary.deleted_volumes, 1);
    assert_eq!(summary.failures, 0);
}

#[rstest]
#[case("2024-05-01T10:00:00Z")]
#[case("2024-05-01T10:00:00.1234567+00:00")]
#[case("2024-05-01T03:00:00.000-07:00")]
#[case("2024-05-01T10:00:00.000000")]
#[case("2024-05-01T10:00:00")]
fn parse_timestamp_accepts_vendor_formats(#[case] raw: &str) {
    let parsed = parse_timestamp(raw).expect("timestamp parses");
    assert_eq!(
        parsed,
        Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0)
            .single()
            .expect("valid timestamp")
    );
}

#[rstest]
fn age_is_floored_to_whole_hours(janitor: Janitor) {
    let created = now() - Duration::minutes(23 * 60 + 59);
    assert_eq!(janitor.policy().age_hours(created), 23);
}
