//! CLI integration tests.

use assert_cmd::Command;
use predicates::prelude::*;

fn fosrun() -> Command {
    Command::cargo_bin("fosrun").expect("binary builds")
}

#[test]
fn test_help() {
    fosrun()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("FOS test automation"));
}

#[test]
fn test_check_valid_script() {
    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("ok.fos");
    std::fs::write(
        &script,
        "[FGT1]\n<expect -e \"login:\" -for QA001 -t 5>\n",
    )
    .unwrap();

    fosrun()
        .current_dir(dir.path())
        .args(["check", "ok.fos"])
        .assert()
        .success()
        .stdout(predicate::str::contains("ok (2 ops"));
}

#[test]
fn test_check_unknown_api_fails() {
    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("bad.fos");
    std::fs::write(&script, "<definitely_not_an_api -x 1>\n").unwrap();

    fosrun()
        .current_dir(dir.path())
        .args(["check", "bad.fos"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("definitely_not_an_api"));
}

#[test]
fn test_run_scripted_device_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("fos.toml"),
        r#"
[runner]
expect_poll_ms = 10

[devices.FGT1]
type = "scripted"
responses = [
    { when = "get system status", output = "Version: FortiGate-60F v7.4.1\nFGT-60F # " },
]
"#,
    )
    .unwrap();
    std::fs::write(
        dir.path().join("case.fos"),
        "[FGT1]\nget system status\n<expect -e \"FortiGate\" -for QA001 -t 5>\n<report -qaid QA001 -result pass>\n",
    )
    .unwrap();

    fosrun()
        .current_dir(dir.path())
        .args(["run", "case.fos"])
        .assert()
        .success()
        .stdout(predicate::str::contains("QA001"));
}

#[test]
fn test_run_failing_expect_exits_nonzero() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("fos.toml"),
        r#"
[runner]
expect_poll_ms = 10

[devices.FGT1]
type = "scripted"
"#,
    )
    .unwrap();
    std::fs::write(
        dir.path().join("case.fos"),
        "[FGT1]\n<expect -e \"never\" -for QA900 -t 0>\n",
    )
    .unwrap();

    fosrun()
        .current_dir(dir.path())
        .args(["run", "case.fos"])
        .assert()
        .code(1);
}

#[test]
fn test_apis_lists_builtins() {
    let dir = tempfile::tempdir().unwrap();
    fosrun()
        .current_dir(dir.path())
        .arg("apis")
        .assert()
        .success()
        .stdout(predicate::str::contains("expect"))
        .stdout(predicate::str::contains("exec_code"));
}

#[test]
fn test_init_creates_files_once() {
    let dir = tempfile::tempdir().unwrap();
    fosrun()
        .current_dir(dir.path())
        .arg("init")
        .assert()
        .success();
    assert!(dir.path().join("fos.toml").exists());
    assert!(dir.path().join("sample.fos").exists());

    fosrun()
        .current_dir(dir.path())
        .arg("init")
        .assert()
        .code(2);
}
