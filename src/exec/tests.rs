//! Unit tests for command rendering and execution.

use std::sync::Arc;

use camino::Utf8PathBuf;
use rstest::{fixture, rstest};

use super::*;
use crate::test_support::{LogCapture, ScriptedRunner};

#[fixture]
fn runner() -> ScriptedRunner {
    ScriptedRunner::new()
}

fn executor(runner: &ScriptedRunner, show_secrets: bool) -> Executor {
    Executor::new(Arc::new(runner.clone()), Arc::new(Session::new(show_secrets)))
}

fn target() -> SshTarget {
    SshTarget {
        user: String::from("eouser"),
        host: String::from("203.0.113.7"),
        identity_file: Utf8PathBuf::from("/keys/id_rsa"),
    }
}

#[rstest]
fn render_masks_secrets_unless_shown() {
    let spec = CommandSpec::new("openstack")
        .arg("--os-password")
        .secret_arg("hunter2")
        .arg("server list");

    assert_eq!(
        spec.render(false),
        "openstack --os-password xxxxxxxx server\\ list"
    );
    assert_eq!(spec.render(true), "openstack --os-password hunter2 server\\ list");
}

#[rstest]
fn render_quotes_the_ssh_remote_command() {
    let spec = CommandSpec::new("ssh")
        .arg("-i")
        .arg("/keys/id rsa")
        .arg("user@host")
        .arg("echo \"it's\" done");

    assert_eq!(
        spec.render(false),
        "ssh -i /keys/id\\ rsa user@host \"echo \\\"it's\\\" done\""
    );
}

#[rstest]
fn render_masks_environment_values() {
    let spec = CommandSpec::new("aws")
        .env("AWS_SECRET_ACCESS_KEY", CommandArg::secret("s3cr3t"))
        .arg("ec2");

    assert_eq!(spec.render(false), "AWS_SECRET_ACCESS_KEY=xxxxxxxx aws ec2");
}

#[rstest]
#[case("An error occurred (AuthFailure) when calling", FailureKind::Permanent)]
#[case("ERROR: (gcloud) PERMISSION_DENIED: Request had insufficient", FailureKind::Permanent)]
#[case("QuotaExceeded: Operation could not be completed", FailureKind::Permanent)]
#[case("No server with a name or ID of 'vm-1' exists.", FailureKind::NotFound)]
#[case("(ResourceNotFound) The Resource 'vm-1' was not found", FailureKind::NotFound)]
#[case("Connection reset by peer", FailureKind::Transient)]
fn classify_recognises_vendor_payloads(#[case] stderr: &str, #[case] expected: FailureKind) {
    assert_eq!(FailureKind::classify(stderr), expected);
}

#[rstest]
#[tokio::test]
async fn execute_local_returns_stdout(runner: ScriptedRunner) {
    runner.push_stdout("hello\n");
    let exec = executor(&runner, false);

    let output = exec
        .execute_local(&CommandSpec::new("echo").arg("hello"), ExecOptions::new())
        .await
        .expect("command should succeed");

    assert_eq!(output, "hello\n");
    assert_eq!(runner.invocations().len(), 1);
}

#[rstest]
#[tokio::test]
async fn failure_reports_masked_command_and_payload(runner: ScriptedRunner) {
    runner.push_failure(1, "Unauthorized: bad credentials");
    let exec = executor(&runner, false);
    let spec = CommandSpec::new("openstack")
        .arg("--os-password")
        .secret_arg("hunter2");

    let err = exec
        .execute_local(&spec, ExecOptions::new())
        .await
        .expect_err("command should fail");

    let ExecError::Failed {
        command, code, kind, ..
    } = &err
    else {
        panic!("expected Failed, got {err:?}");
    };
    assert!(command.contains("xxxxxxxx"));
    assert!(!command.contains("hunter2"));
    assert_eq!(*code, Some(1));
    assert_eq!(*kind, FailureKind::Permanent);
    assert_eq!(err.payload(), Some("Unauthorized: bad credentials"));
    assert!(!err.to_string().contains("hunter2"));
}

#[rstest]
#[tokio::test]
async fn fatal_option_attaches_exit_code(runner: ScriptedRunner) {
    runner.push_failure(255, "ssh: connect to host");
    let exec = executor(&runner, false);

    let err = exec
        .execute_remote(
            &target(),
            "false",
            ExecOptions::new().fatal(FatalCode::RemoteCommand),
        )
        .await
        .expect_err("remote command should fail");

    assert_eq!(err.fatal_code(), Some(FatalCode::RemoteCommand));
    assert_eq!(FatalCode::RemoteCommand.code(), 12);
}

#[rstest]
#[tokio::test]
async fn execute_json_rejects_non_json(runner: ScriptedRunner) {
    runner.push_stdout("not json");
    let exec = executor(&runner, false);

    let err = exec
        .execute_json::<serde_json::Value>(&CommandSpec::new("aws"), ExecOptions::new())
        .await
        .expect_err("parsing should fail");

    assert!(matches!(err, ExecError::InvalidResponse { .. }));
    assert!(err.to_string().starts_with("Invalid response (not JSON)"));
}

#[rstest]
#[tokio::test]
async fn execute_remote_builds_ssh_invocation(runner: ScriptedRunner) {
    runner.push_success();
    let exec = executor(&runner, false);

    exec.execute_remote(&target(), "ls", ExecOptions::new().quiet())
        .await
        .expect("probe should succeed");

    let invocation = runner.invocations().remove(0);
    assert_eq!(invocation.program, "ssh");
    assert_eq!(
        invocation.args,
        vec![
            "-i",
            "/keys/id_rsa",
            "-o",
            "StrictHostKeyChecking=no",
            "-o",
            "UserKnownHostsFile=/dev/null",
            "-o",
            "IdentitiesOnly=yes",
            "eouser@203.0.113.7",
            "ls",
        ]
    );
}

#[rstest]
#[tokio::test]
async fn copy_file_orders_arguments_by_direction(runner: ScriptedRunner) {
    runner.push_success();
    runner.push_success();
    let exec = executor(&runner, false);
    let local = Utf8PathBuf::from("/tmp/out.log");

    exec.copy_file(&target(), &local, "run.log", CopyDirection::ToRemote, ExecOptions::new())
        .await
        .expect("upload should succeed");
    exec.copy_file(&target(), &local, "run.log", CopyDirection::FromRemote, ExecOptions::new())
        .await
        .expect("download should succeed");

    let calls = runner.invocations();
    let upload = calls.first().expect("upload recorded");
    let download = calls.get(1).expect("download recorded");
    assert_eq!(
        upload.args.iter().rev().take(2).collect::<Vec<_>>(),
        vec!["eouser@203.0.113.7:run.log", "/tmp/out.log"]
    );
    assert_eq!(
        download.args.iter().rev().take(2).collect::<Vec<_>>(),
        vec!["/tmp/out.log", "eouser@203.0.113.7:run.log"]
    );
}

#[rstest]
#[tokio::test]
async fn copy_file_can_ignore_failures(runner: ScriptedRunner) {
    runner.push_failure(1, "scp: No such file or directory");
    let exec = executor(&runner, false);

    let result = exec
        .copy_file(
            &target(),
            &Utf8PathBuf::from("/tmp/missing"),
            "missing",
            CopyDirection::FromRemote,
            ExecOptions::new().quiet().ignore_failure(),
        )
        .await;

    assert!(result.is_ok());
}

#[rstest]
#[tokio::test]
async fn runner_timeout_is_transient(runner: ScriptedRunner) {
    runner.push_timeout();
    let exec = executor(&runner, false);

    let err = exec
        .execute_local(&CommandSpec::new("sleep").arg("999"), ExecOptions::new().quiet())
        .await
        .expect_err("command should time out");

    assert!(matches!(err, ExecError::Timeout { .. }));
    assert_eq!(err.kind(), FailureKind::Transient);
}

#[rstest]
#[tokio::test]
async fn logs_never_contain_secrets_when_masked(runner: ScriptedRunner) {
    let capture = LogCapture::new();
    let _guard = tracing::subscriber::set_default(capture.subscriber());
    runner.push_success();
    runner.push_failure(1, "boom");
    let exec = executor(&runner, false);
    let spec = CommandSpec::new("az")
        .arg("login")
        .arg("--password")
        .secret_arg("client-secret-value");

    exec.execute_local(&spec, ExecOptions::new())
        .await
        .expect("first call should succeed");
    let _ = exec.execute_local(&spec, ExecOptions::new()).await;

    let logs = capture.contents();
    assert!(logs.contains("--password xxxxxxxx"));
    assert!(!logs.contains("client-secret-value"));
}

#[rstest]
#[tokio::test]
async fn logs_show_secrets_when_enabled(runner: ScriptedRunner) {
    let capture = LogCapture::new();
    let _guard = tracing::subscriber::set_default(capture.subscriber());
    runner.push_success();
    let exec = executor(&runner, true);
    let spec = CommandSpec::new("az").secret_arg("client-secret-value");

    exec.execute_local(&spec, ExecOptions::new())
        .await
        .expect("call should succeed");

    assert!(capture.contents().contains("client-secret-value"));
}
