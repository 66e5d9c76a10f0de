//! Integration tests for vpnctl
//!
//! Every test keeps its store and keys under a temporary root.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

/// vpnctl bound to a temporary root as user 100
fn vpnctl(root: &Path) -> Command {
    let mut cmd = Command::cargo_bin("vpnctl").unwrap();
    cmd.arg("--root").arg(root).arg("--user").arg("100");
    cmd
}

fn write_profile(dir: &Path, id: &str) -> std::path::PathBuf {
    let path = dir.join(format!("{}.json", if id.is_empty() { "anon" } else { id }));
    let profile = serde_json::json!({
        "vpn_id": id,
        "vpn_name": "Office",
        "vpn_type": 2,
        "vpn_address": "203.0.113.10",
        "user_name": "alice",
        "password": "hunter2",
        "payload": { "kind": "ipsec", "ipsec_pre_shared_key": "s3cret" }
    });
    fs::write(&path, profile.to_string()).unwrap();
    path
}

#[test]
fn test_help_command() {
    Command::cargo_bin("vpnctl")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("VPN profile tool"));
}

#[test]
fn test_default_config_is_toml() {
    let output = Command::cargo_bin("vpnctl")
        .unwrap()
        .arg("default-config")
        .output()
        .unwrap();
    assert!(output.status.success());

    let text = String::from_utf8(output.stdout).unwrap();
    let parsed: libnetvpn::ServiceConfig = toml::from_str(&text).unwrap();
    assert_eq!(parsed.limits.max_tunnels, 20);
}

#[test]
fn test_empty_list() {
    let dir = TempDir::new().unwrap();
    vpnctl(dir.path())
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("No VPN profiles for user 100"));
}

#[test]
fn test_import_list_show_delete() {
    let dir = TempDir::new().unwrap();
    let file = write_profile(dir.path(), "office");

    vpnctl(dir.path())
        .arg("import")
        .arg(&file)
        .assert()
        .success()
        .stdout(predicate::str::contains("office"));

    // secrets never hit the store in clear text
    let stored = fs::read_to_string(dir.path().join("vpn_data.json")).unwrap();
    assert!(!stored.contains("hunter2"));
    assert!(!stored.contains("s3cret"));

    vpnctl(dir.path())
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("office").and(predicate::str::contains("IKEV2_IPSEC_PSK")));

    vpnctl(dir.path())
        .arg("show")
        .arg("office")
        .assert()
        .success()
        .stdout(predicate::str::contains("203.0.113.10").and(predicate::str::contains("hunter2").not()));

    vpnctl(dir.path())
        .args(["-o", "json", "show", "office"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"vpn_name\": \"Office\""));

    vpnctl(dir.path())
        .arg("delete")
        .arg("office")
        .assert()
        .success()
        .stdout(predicate::str::contains("Deleted office"));

    vpnctl(dir.path())
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("No VPN profiles"));
}

#[test]
fn test_import_without_id_generates_one() {
    let dir = TempDir::new().unwrap();
    let file = write_profile(dir.path(), "");

    let output = vpnctl(dir.path()).arg("import").arg(&file).output().unwrap();
    assert!(output.status.success());
    let id = String::from_utf8(output.stdout).unwrap().trim().to_string();
    assert!(uuid::Uuid::parse_str(&id).is_ok());

    vpnctl(dir.path())
        .args(["-o", "json", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains(id.as_str()));
}

#[test]
fn test_delete_missing_profile_fails() {
    let dir = TempDir::new().unwrap();
    vpnctl(dir.path())
        .arg("delete")
        .arg("nope")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Error:"));
}

#[test]
fn test_import_rejects_bad_json() {
    let dir = TempDir::new().unwrap();
    let file = dir.path().join("bad.json");
    fs::write(&file, "{ not json").unwrap();
    vpnctl(dir.path())
        .arg("import")
        .arg(&file)
        .assert()
        .failure()
        .stderr(predicate::str::contains("Parse error"));
}
