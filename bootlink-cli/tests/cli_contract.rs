//! Integration tests for core CLI contract behavior.

use {predicates::prelude::*, std::fs, tempfile::tempdir};

fn cli_cmd() -> assert_cmd::Command {
    assert_cmd::cargo::cargo_bin_cmd!("bootlink")
}

#[test]
fn help_exits_zero_and_writes_stdout_only() {
    let mut cmd = cli_cmd();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("bootlink"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn version_exits_zero_and_writes_stdout_only() {
    let mut cmd = cli_cmd();
    cmd.arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("bootlink"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn flash_help_mentions_the_image_argument() {
    let mut cmd = cli_cmd();
    cmd.args(["flash", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("IMAGE"));
}

#[test]
fn flash_with_missing_file_fails_before_touching_any_port() {
    let dir = tempdir().expect("tempdir should be created");
    let nonexistent = dir.path().join("not_exists.hex");

    let mut cmd = cli_cmd();
    cmd.arg("--quiet")
        .arg("flash")
        .arg(nonexistent.as_os_str())
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to load"));
}

#[test]
fn flash_rejects_a_malformed_image() {
    let dir = tempdir().expect("tempdir should be created");
    let bogus = dir.path().join("bogus.hex");
    fs::write(&bogus, "this is not a hex file\n").expect("write bogus.hex");

    let mut cmd = cli_cmd();
    cmd.arg("--quiet")
        .arg("flash")
        .arg(bogus.as_os_str())
        .assert()
        .failure()
        .stderr(predicate::str::contains("must start with ':'"));
}

#[test]
fn unknown_subcommand_fails() {
    let mut cmd = cli_cmd();
    cmd.arg("frobnicate").assert().failure();
}
