//! Unit tests for compute and batch configuration.

use std::time::Duration;

use camino::Utf8PathBuf;
use rstest::rstest;

use super::*;

const REQUIRED: &[RequiredKey] = &[
    RequiredKey::new("vm_name", "VM name prefix"),
    RequiredKey::new("image_name", "image"),
    RequiredKey::new("flavor_name", "instance type"),
];

#[rstest]
fn json_values_are_normalised() {
    let config = ComputeConfig::from_json(
        r#"{"vm_name":"bench","use_volume":true,"retries":3,"network_name":["a","b"],"floating_ip":null}"#,
    )
    .expect("valid json");

    assert_eq!(config.get("vm_name"), Some("bench"));
    assert!(config.flag("use_volume"));
    assert_eq!(config.get("retries"), Some("3"));
    assert_eq!(config.list("network_name"), vec!["a", "b"]);
    assert_eq!(config.get("floating_ip"), None);
}

#[rstest]
#[case("true", true)]
#[case("Yes", true)]
#[case("1", true)]
#[case("on", true)]
#[case("false", false)]
#[case("no", false)]
fn flags_accept_common_spellings(#[case] raw: &str, #[case] expected: bool) {
    let config: ComputeConfig = [("use_tmp_volume", raw)].into_iter().collect();
    assert_eq!(config.flag("use_tmp_volume"), expected);
}

#[rstest]
fn blank_values_count_as_missing() {
    let config: ComputeConfig = [("vm_name", "  ")].into_iter().collect();
    assert_eq!(config.get("vm_name"), None);
    assert!(config.require("vm_name").is_err());
}

#[rstest]
fn validate_reports_every_missing_key() {
    let config: ComputeConfig = [("image_name", "ubuntu")].into_iter().collect();

    let err = config.validate(REQUIRED).expect_err("two keys are missing");

    assert_eq!(
        err,
        ConfigError::MissingKeys(vec![String::from("vm_name"), String::from("flavor_name")])
    );
    assert_eq!(
        err.to_string(),
        "missing configuration keys: vm_name, flavor_name"
    );
}

#[rstest]
fn aliases_fill_absent_keys_only() {
    let mut config: ComputeConfig = [("auth_file", "/keys/sa.json"), ("project_id", "p1")]
        .into_iter()
        .collect();
    config.fill_from_aliases("account_file", &["auth_file"]);
    config.fill_from_aliases("project_id", &["project_name"]);

    assert_eq!(config.get("account_file"), Some("/keys/sa.json"));
    assert_eq!(config.get("project_id"), Some("p1"));
}

#[rstest]
fn provider_defaults_do_not_override_compute_values() {
    let mut config: ComputeConfig = [("region_name", "eu-west-1")].into_iter().collect();
    let defaults: ComputeConfig = [("region_name", "us-east-1"), ("remote_user", "ubuntu")]
        .into_iter()
        .collect();

    config.fill_missing_from(&defaults);

    assert_eq!(config.get("region_name"), Some("eu-west-1"));
    assert_eq!(config.get("remote_user"), Some("ubuntu"));
}

#[rstest]
fn load_reads_json_file() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = Utf8PathBuf::from_path_buf(dir.path().join("compute.json")).expect("utf8 path");
    std::fs::write(&path, r#"{"vm_name":"bench"}"#).expect("write config");

    let config = ComputeConfig::load(&path).expect("config loads");

    assert_eq!(config.get("vm_name"), Some("bench"));
}

#[rstest]
fn load_rejects_non_object() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = Utf8PathBuf::from_path_buf(dir.path().join("compute.json")).expect("utf8 path");
    std::fs::write(&path, "[1, 2]").expect("write config");

    let err = ComputeConfig::load(&path).expect_err("arrays are rejected");

    assert!(matches!(err, ConfigError::Parse { .. }));
}

fn batch_config() -> BatchConfig {
    BatchConfig {
        connect_retries: 4,
        connect_interval: 2,
        total_vm_count: 3,
        max_retention_hours: 24,
        ssh_probe_timeout: 10,
        show_secrets: false,
    }
}

#[rstest]
fn batch_config_derives_connect_settings() {
    let settings = batch_config().connect_settings();

    assert_eq!(settings.retries, 4);
    assert_eq!(settings.interval, Duration::from_secs(2));
    assert_eq!(settings.probe_timeout, Duration::from_secs(10));
}

#[rstest]
fn batch_config_rejects_zero_vm_count() {
    let config = BatchConfig {
        total_vm_count: 0,
        ..batch_config()
    };

    assert!(matches!(
        config.validate(),
        Err(BatchConfigError::Invalid {
            field: "total_vm_count",
            ..
        })
    ));
}
