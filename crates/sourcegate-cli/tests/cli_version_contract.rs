use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::process::Command;

#[test]
fn sourcegate_version_json_contract() {
    let bin = assert_cmd::cargo::cargo_bin!("sourcegate");
    let out = Command::new(bin)
        .args(["version"])
        .env_remove("SOURCEGATE_ENV_FILE")
        .output()
        .expect("run sourcegate version");

    assert!(out.status.success(), "sourcegate version failed");
    let v: serde_json::Value = serde_json::from_slice(&out.stdout).expect("version prints json");
    assert_eq!(v["schema_version"].as_u64(), Some(1));
    assert_eq!(v["kind"].as_str(), Some("version"));
    assert_eq!(v["ok"].as_bool(), Some(true));
    assert_eq!(v["name"].as_str(), Some("sourcegate"));
    assert!(v["version"].as_str().is_some_and(|s| !s.is_empty()));
}

#[test]
fn sourcegate_version_text_contract() {
    Command::cargo_bin("sourcegate")
        .unwrap()
        .args(["version", "--output", "text"])
        .env_remove("SOURCEGATE_ENV_FILE")
        .assert()
        .success()
        .stdout(predicate::str::starts_with("sourcegate "));
}
