use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::process::Command;
use tempfile::TempDir;

#[test]
fn status_reports_node_id_and_starting_revision() -> Result<(), Box<dyn std::error::Error>> {
    let dir = TempDir::new()?;

    let mut cmd = Command::cargo_bin("metastore")?;
    cmd.current_dir(dir.path())
        .arg("--config")
        .arg(dir.path().join("node.toml"))
        .arg("--node-id")
        .arg("1")
        .arg("status");

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("node_id=1"))
        .stdout(predicate::str::contains("current_revision=0"));

    Ok(())
}

#[test]
fn an_unknown_subcommand_is_rejected_by_the_argument_parser() -> Result<(), Box<dyn std::error::Error>> {
    let mut cmd = Command::cargo_bin("metastore")?;
    cmd.arg("frobnicate");

    cmd.assert().failure().stderr(predicate::str::contains("unrecognized"));

    Ok(())
}

#[test]
fn snapshot_writes_a_non_empty_file() -> Result<(), Box<dyn std::error::Error>> {
    let dir = TempDir::new()?;
    let output = dir.path().join("snap.bin");

    let mut cmd = Command::cargo_bin("metastore")?;
    cmd.current_dir(dir.path())
        .arg("--config")
        .arg(dir.path().join("node.toml"))
        .arg("snapshot")
        .arg("--output")
        .arg(&output);

    cmd.assert().success();
    assert!(output.exists());
    assert!(std::fs::metadata(&output)?.len() > 0);

    Ok(())
}
