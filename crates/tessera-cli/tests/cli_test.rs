//! Integration tests for the tessera binary

#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn tessera(state: &Path) -> Command {
    let mut cmd = Command::cargo_bin("tessera").unwrap();
    cmd.env("TESSERA_STATE_DIR", state).env("TESSERA_LOG", "warn");
    cmd
}

fn pack(state: &Path, source: &Path, out: &Path, version: &str) {
    tessera(state)
        .args(["pack", "--app", "Sugar", "--account", "acc1", "--save-folder", "{AppData}/Sugar"])
        .args(["--build-version", version, "--out"])
        .arg(out)
        .arg(source)
        .assert()
        .success()
        .stdout(predicate::str::contains("Packed"));
}

#[test]
fn test_help_lists_commands() {
    let dir = TempDir::new().unwrap();
    tessera(dir.path())
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("install"))
        .stdout(predicate::str::contains("verify"))
        .stdout(predicate::str::contains("list-installed"));
}

#[test]
fn test_list_installed_empty() {
    let dir = TempDir::new().unwrap();
    tessera(dir.path())
        .arg("list-installed")
        .assert()
        .success()
        .stdout(predicate::str::contains("No installed applications"));

    tessera(dir.path())
        .args(["list-installed", "-o", "json"])
        .assert()
        .success()
        .stdout("[]\n");
}

#[test]
fn test_verify_unknown_app_fails() {
    let dir = TempDir::new().unwrap();
    tessera(dir.path())
        .args(["verify", "Salt"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Not installed: Salt"));
}

#[test]
fn test_pack_then_info_and_diff() {
    let dir = TempDir::new().unwrap();
    let saves = dir.path().join("saves");
    std::fs::create_dir_all(saves.join("slot1")).unwrap();
    std::fs::write(saves.join("profile.sav"), b"profile").unwrap();
    std::fs::write(saves.join("slot1/world.sav"), vec![7u8; 4096]).unwrap();

    let out = dir.path().join("upload");
    pack(dir.path(), &saves, &out, "2024.05.06-07.08.09");
    let manifest = out.join("manifests/2024.05.06-07.08.09.manifest");
    assert!(manifest.exists());

    let output = tessera(dir.path())
        .args(["info", "-o", "json"])
        .arg(&manifest)
        .output()
        .unwrap();
    assert!(output.status.success());
    let info: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(info["app_name"], "Sugaracc1");
    assert_eq!(info["files"], 2);
    assert_eq!(info["chunks"], 1);
    assert_eq!(info["install_size"], 4103);
    assert_eq!(info["custom_fields"]["CloudSaveFolder"], "{AppData}/Sugar");

    std::fs::write(saves.join("profile.sav"), b"profile v2").unwrap();
    std::fs::write(saves.join("new.sav"), b"new").unwrap();
    pack(dir.path(), &saves, &out, "2024.05.07-07.08.09");

    tessera(dir.path())
        .arg("diff")
        .arg(&manifest)
        .arg(out.join("manifests/2024.05.07-07.08.09.manifest"))
        .assert()
        .success()
        .stdout(predicate::str::contains("+ new.sav"))
        .stdout(predicate::str::contains("~ profile.sav"))
        .stdout(predicate::str::contains("1 added, 0 removed, 1 changed, 1 unchanged"));
}
