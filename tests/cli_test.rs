use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn invalid_tunnel_spec_exits_nonzero_with_single_line_message() {
    let output = Command::cargo_bin("tunnelward")
        .unwrap()
        .arg("not-a-valid-spec")
        .assert()
        .failure()
        .get_output()
        .clone();

    let stderr = String::from_utf8(output.stderr).unwrap();
    assert_eq!(stderr.trim_end().lines().count(), 1, "expected a single-line message, got: {stderr:?}");
    assert!(stderr.contains("invalid tunnel spec"));
}

#[test]
fn help_lists_driver_subcommands() {
    Command::cargo_bin("tunnelward")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("add").and(predicate::str::contains("stop")));
}
