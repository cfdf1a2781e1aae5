//! Unit tests for the OpenStack adapter.

use std::time::Duration;

use rstest::{fixture, rstest};
use serde_json::{Value, json};
use tokio::time::Instant;

use super::disk_script::DiskLayout;
use super::types::attachment_device;
use super::volume::DETACH_SETTLE;
use super::*;
use crate::test_support::{ScriptedRunner, hours_ago, scripted_executor};

fn config() -> ComputeConfig {
    [
        ("auth_url", "https://keystone.example.org:5000/v3"),
        ("username", "bench"),
        ("password", "os-secret"),
        ("project_name", "benchmarks"),
        ("user_domain_name", "Default"),
        ("interface", "public"),
        ("identity_api_version", "3"),
        ("vm_name", "bench"),
        ("key_name", "bench-key"),
        ("image_name", "Ubuntu 22.04"),
        ("flavor_name", "m1.large"),
        ("network_name", "private, storage"),
        ("private_key_file", "/keys/id_rsa"),
        ("remote_user", "ubuntu"),
    ]
    .into_iter()
    .collect()
}

const fn settings() -> ConnectSettings {
    ConnectSettings {
        retries: 2,
        interval: Duration::from_secs(1),
        probe_timeout: Duration::from_secs(10),
    }
}

#[fixture]
fn runner() -> ScriptedRunner {
    ScriptedRunner::new()
}

async fn connector(runner: &ScriptedRunner, config: ComputeConfig) -> OpenStackConnector {
    runner.push_json(&json!({ "id": "token-1" }));
    OpenStackConnector::initialize(scripted_executor(runner), config, settings())
        .await
        .expect("initialize should succeed")
}

fn attached_context() -> RunContext {
    let mut ctx = RunContext::new(0, "-1", "");
    ctx.vm_id = Some(String::from("srv-1"));
    ctx.volume_id = Some(String::from("vol-1"));
    ctx.volume_device = Some(String::from("/dev/vdb"));
    ctx.volume_attached = true;
    ctx
}

#[rstest]
#[tokio::test]
async fn password_is_masked_in_rendered_commands(runner: ScriptedRunner) {
    let _openstack = connector(&runner, config()).await;

    let calls = runner.invocations();
    let token = calls.first().expect("token issue call");
    assert!(token.has_arg("os-secret"));
    assert!(token.rendered.contains("--os-password xxxxxxxx"));
    assert!(!token.rendered.contains("os-secret"));
    assert!(token.has_arg("--os-project-name"));
    assert!(!token.has_arg("--os-region-name"));
}

#[rstest]
#[tokio::test]
async fn failed_token_issue_is_a_session_error(runner: ScriptedRunner) {
    runner.push_failure(1, "The request you have made requires authentication. (HTTP 401)");

    let Err(err) =
        OpenStackConnector::initialize(scripted_executor(&runner), config(), settings()).await
    else {
        panic!("initialize should fail");
    };

    assert!(matches!(err, ConnectorError::Session { provider: "openstack", .. }));
    assert_eq!(err.exit_code(), FatalCode::Configuration);
}

#[rstest]
#[tokio::test]
async fn prepare_without_floating_ip_makes_no_calls(runner: ScriptedRunner) {
    let mut openstack = connector(&runner, config()).await;

    openstack.prepare(3).await.expect("nothing to prepare");

    assert_eq!(runner.invocations().len(), 1);
}

#[rstest]
#[tokio::test]
async fn prepare_rejects_too_few_floating_ips(runner: ScriptedRunner) {
    let mut openstack = connector(&runner, config().with("floating_ip", "true")).await;
    runner.push_json(&json!([
        { "Floating IP Address": "172.24.4.10", "Fixed IP Address": null },
        { "Floating IP Address": "172.24.4.11", "Fixed IP Address": "10.0.0.7" }
    ]));

    let err = openstack.prepare(2).await.expect_err("one address only");

    assert!(matches!(
        err,
        ConnectorError::InsufficientAddresses {
            available: 1,
            needed: 2
        }
    ));
}

#[rstest]
#[tokio::test]
async fn create_binds_the_reserved_floating_ip(runner: ScriptedRunner) {
    let config = config()
        .with("floating_ip", "true")
        .with("floating_ip_network", "public");
    let mut openstack = connector(&runner, config).await;
    runner.push_json(&json!([
        { "Floating IP Address": "172.24.4.10", "Fixed IP Address": null }
    ]));
    openstack.prepare(1).await.expect("one address for one run");
    runner.push_json(&json!({ "id": "srv-1", "addresses": "private=10.0.0.5" }));
    runner.push_success();
    runner.push_success();
    let mut ctx = RunContext::new(0, "-1", "");

    let available = openstack.create_vm(&mut ctx).await.expect("created");

    assert!(available);
    assert_eq!(ctx.vm_id.as_deref(), Some("srv-1"));
    assert_eq!(ctx.public_ip_text(), "172.24.4.10");
    let calls = runner.invocations();
    assert!(calls.get(1).is_some_and(|call| {
        call.command_string().starts_with("openstack floating ip list -f json")
            && call.command_string().ends_with("--network public")
    }));
    let create = calls.get(2).expect("server create call");
    assert!(create.has_arg("--wait"));
    assert!(create.command_string().contains("--network private --network storage"));
    assert!(create.has_arg("bench-1"));
    let bind = calls.get(3).expect("floating ip call");
    assert!(bind.command_string().contains("server add floating ip srv-1 172.24.4.10"));
}

#[rstest]
#[case::legacy_string(json!("private=10.0.0.5, 172.24.4.20"), "172.24.4.20")]
#[case::mapping(json!({ "private": ["10.0.0.5", "172.24.4.21"] }), "172.24.4.21")]
#[tokio::test]
async fn create_reads_the_last_listed_address(
    runner: ScriptedRunner,
    #[case] addresses: Value,
    #[case] expected: &str,
) {
    let openstack = connector(&runner, config()).await;
    runner.push_json(&json!({ "id": "srv-1", "addresses": addresses }));
    runner.push_success();
    let mut ctx = RunContext::new(0, "-1", "m1.xlarge");

    openstack.create_vm(&mut ctx).await.expect("created");

    assert_eq!(ctx.public_ip_text(), expected);
    let calls = runner.invocations();
    assert!(calls.get(1).is_some_and(|call| call.has_arg("m1.xlarge")));
}

#[rstest]
#[tokio::test]
async fn create_without_address_is_a_creation_error(runner: ScriptedRunner) {
    let openstack = connector(&runner, config()).await;
    runner.push_json(&json!({ "id": "srv-1", "addresses": {} }));
    let mut ctx = RunContext::new(0, "-1", "");

    let err = openstack.create_vm(&mut ctx).await.expect_err("no address");

    assert!(err.to_string().starts_with("No IP address found"));
    assert_eq!(err.exit_code(), FatalCode::Creation);
    assert_eq!(ctx.vm_id.as_deref(), Some("srv-1"));
}

#[rstest]
#[tokio::test]
async fn failed_create_recovers_the_server_id(runner: ScriptedRunner) {
    let openstack = connector(&runner, config()).await;
    runner.push_failure(1, "Error creating server: bench-1 (status ERROR)");
    runner.push_json(&json!({ "id": "srv-9", "name": "bench-1" }));
    let mut ctx = RunContext::new(0, "-1", "");

    let err = openstack.create_vm(&mut ctx).await.expect_err("create fails");

    assert_eq!(err.exit_code(), FatalCode::Creation);
    assert_eq!(ctx.vm_id.as_deref(), Some("srv-9"));
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn create_provisions_and_mounts_the_main_volume(runner: ScriptedRunner) {
    let openstack = connector(&runner, config().with("use_volume", "true")).await;
    runner.push_json(&json!({ "id": "srv-1", "addresses": "private=10.0.0.5" }));
    runner.push_success();
    runner.push_json(&json!({ "id": "vol-1", "status": "creating" }));
    runner.push_json(&json!({ "id": "vol-1", "status": "creating" }));
    runner.push_json(&json!({ "id": "vol-1", "status": "available" }));
    runner.push_success();
    runner.push_json(&json!({
        "id": "vol-1",
        "status": "in-use",
        "attachments": [{ "server_id": "srv-1", "device": "/dev/vdb" }]
    }));
    runner.push_success();
    runner.push_success();
    let mut ctx = RunContext::new(0, "-1", "");
    let started = Instant::now();

    let available = openstack.create_vm(&mut ctx).await.expect("created");

    assert!(available);
    assert_eq!(started.elapsed(), Duration::from_secs(1));
    assert_eq!(ctx.volume_id.as_deref(), Some("vol-1"));
    assert_eq!(ctx.volume_device.as_deref(), Some("/dev/vdb"));
    assert!(ctx.volume_attached);
    assert!(ctx.tmp_volume_id.is_none());
    let calls = runner.invocations();
    let create = calls.get(3).expect("volume create call");
    assert!(create.command_string().contains("--size 100 bench-1-volume"));
    assert!(calls.get(6).is_some_and(|call| {
        call.command_string().contains("server add volume srv-1 vol-1")
    }));
    let copy = calls.get(8).expect("scp call");
    assert_eq!(copy.program, "scp");
    assert!(copy.has_arg("ubuntu@10.0.0.5:setup-disk.sh"));
    assert!(calls.get(9).is_some_and(|call| call.has_arg("sudo sh setup-disk.sh")));
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn failed_volume_is_reported_with_its_status(runner: ScriptedRunner) {
    let openstack = connector(&runner, config().with("use_tmp_volume", "true")).await;
    runner.push_json(&json!({ "id": "srv-1", "addresses": "private=10.0.0.5" }));
    runner.push_success();
    runner.push_json(&json!({ "id": "vol-2", "status": "creating" }));
    runner.push_json(&json!({ "id": "vol-2", "status": "error" }));
    let mut ctx = RunContext::new(0, "-1", "");

    let err = openstack.create_vm(&mut ctx).await.expect_err("volume failed");

    let ConnectorError::Operation { payload, .. } = &err else {
        panic!("expected operation failure, got {err:?}");
    };
    assert_eq!(payload, "volume status is error");
    assert_eq!(ctx.tmp_volume_id.as_deref(), Some("vol-2"));
    assert!(!ctx.tmp_volume_attached);
}

#[test]
fn disk_script_for_main_volume_only() {
    let layout = DiskLayout {
        main_device: Some(String::from("/dev/vdb")),
        tmp_device: None,
        owner: String::from("ubuntu"),
    };

    let script = layout.render();

    assert_eq!(
        script,
        "parted /dev/vdb mklabel gpt\n\
         parted /dev/vdb unit GB \n\
         parted /dev/vdb mkpart primary 0% 100%\n\
         mkfs.ext4 /dev/vdb1\n\
         mkdir /mnt/cdab-volume\n\
         mkdir /mnt/cdab-volume/test\n\
         chown ubuntu /mnt/cdab-volume/test\n\
         echo '/dev/vdb1 /mnt/cdab-volume ext4 defaults 0 2' >> /etc/fstab\n\
         mount -a\n"
    );
}

#[test]
fn disk_script_with_tmp_volume_fixes_permissions() {
    let layout = DiskLayout {
        main_device: Some(String::from("/dev/vdb")),
        tmp_device: Some(String::from("/dev/vdc")),
        owner: String::from("ubuntu"),
    };

    let script = layout.render();
    let lines: Vec<&str> = script.lines().collect();

    assert!(lines.contains(&"mkfs.ext4 /dev/vdc1"));
    assert!(lines.contains(&"mkdir /mnt/cdab-volume/tmp"));
    assert!(lines.contains(&"echo '/dev/vdc1 /tmp ext4 defaults 0 0' >> /etc/fstab"));
    assert_eq!(lines.last(), Some(&"chmod 1777 /tmp"));
    assert!(!layout.is_empty());
}

#[rstest]
#[case::structured(json!([{ "server_id": "srv-1", "device": "/dev/vdb" }]), Some("/dev/vdb"))]
#[case::other_server(json!([{ "server_id": "srv-2", "device": "/dev/vdb" }]), None)]
#[case::legacy(json!("Attached to bench-1 on /dev/vdc "), Some("/dev/vdc"))]
#[case::detached(json!([]), None)]
fn attachment_device_is_read_for_the_server(#[case] attachments: Value, #[case] expected: Option<&str>) {
    assert_eq!(attachment_device(&attachments, "srv-1").as_deref(), expected);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn delete_detaches_then_removes_volume_and_server(runner: ScriptedRunner) {
    let openstack = connector(&runner, config()).await;
    runner.push_success();
    runner.push_success();
    runner.push_success();
    let mut ctx = attached_context();
    let started = Instant::now();

    openstack.delete_vm(&mut ctx).await.expect("deleted");

    assert_eq!(started.elapsed(), DETACH_SETTLE);
    let calls = runner.invocations();
    assert!(calls.get(1).is_some_and(|call| {
        call.command_string().contains("server remove volume srv-1 vol-1")
    }));
    assert!(calls.get(2).is_some_and(|call| call.command_string().contains("volume delete vol-1")));
    assert!(calls.get(3).is_some_and(|call| call.command_string().contains("server delete srv-1")));
    assert!(ctx.vm_id.is_none());
    assert!(ctx.volume_id.is_none());
    assert!(ctx.delete_end_time.is_some());
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn volume_left_behind_is_reported_but_server_still_deleted(runner: ScriptedRunner) {
    let openstack = connector(&runner, config()).await;
    runner.push_failure(1, "Invalid volume: Volume status must be in-use");
    runner.push_failure(1, "Forbidden: policy does not allow volume:delete");
    runner.push_success();
    let mut ctx = attached_context();

    let err = openstack.delete_vm(&mut ctx).await.expect_err("volume kept");

    let ConnectorError::Deletion { resources } = &err else {
        panic!("expected deletion failure, got {err:?}");
    };
    assert_eq!(resources, &vec![String::from("volume 'vol-1'")]);
    assert_eq!(err.exit_code(), FatalCode::Deletion);
    assert_eq!(runner.invocations().len(), 4);
    assert!(openstack.executor.session().incomplete_deletion().is_raised());
    assert_eq!(ctx.volume_id.as_deref(), Some("vol-1"));
}

#[rstest]
#[tokio::test]
async fn delete_old_resources_inspects_only_prefixed_resources(runner: ScriptedRunner) {
    let openstack = connector(&runner, config()).await;
    runner.push_json(&json!([
        { "ID": "s1", "Name": "bench-1" },
        { "ID": "s2", "Name": "K-bench-2" },
        { "ID": "s3", "Name": "other-3" }
    ]));
    runner.push_json(&json!({ "id": "s1", "name": "bench-1", "created": hours_ago(30) }));
    runner.push_json(&json!([{ "ID": "v1", "Name": "bench-1-volume" }]));
    runner.push_failure(1, "Internal Server Error (HTTP 500)");
    runner.push_success();

    let summary = openstack.delete_old_resources(24).await.expect("sweep");

    assert_eq!(summary.deleted_vms, 1);
    assert_eq!(summary.deleted_volumes, 0);
    assert_eq!(summary.failures, 0);
    let calls = runner.invocations();
    assert_eq!(calls.len(), 6);
    assert!(calls.get(5).is_some_and(|call| call.command_string().contains("server delete s1")));
}
