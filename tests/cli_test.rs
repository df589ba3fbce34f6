//! Tests for the reef command line.

mod common;

use common::TestEnv;
use predicates::prelude::*;

#[test]
fn test_version_flag() {
    TestEnv::new()
        .reef()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("reef"))
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn test_help_flag() {
    TestEnv::new()
        .reef()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Usage:"))
        .stdout(predicate::str::contains("serve"))
        .stdout(predicate::str::contains("hash-password"))
        .stdout(predicate::str::contains("--data-dir"));
}

#[test]
fn test_hash_password_reads_stdin() {
    let output = TestEnv::new()
        .reef()
        .arg("hash-password")
        .write_stdin("password\n")
        .assert()
        .success()
        .stdout(predicate::str::is_match(r"^\$2[aby]\$12\$.{53}\n$").unwrap())
        .get_output()
        .stdout
        .clone();

    let hash = String::from_utf8(output).unwrap();
    assert!(bcrypt::verify("password", hash.trim_end()).unwrap());
}

#[test]
fn test_hash_password_without_input_fails() {
    TestEnv::new()
        .reef()
        .arg("hash-password")
        .write_stdin("")
        .assert()
        .failure()
        .stderr(predicate::str::contains("No password given"));
}

#[test]
fn test_config_shows_defaults() {
    let env = TestEnv::new();
    env.reef()
        .env_remove("REEF_DATA_DIR")
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("Resolved from defaults"))
        .stdout(predicate::str::is_match(r#"database-directory "?data"?"#).unwrap())
        .stdout(predicate::str::is_match(r#"bind "?localhost"? port=7651"#).unwrap());
}

#[test]
fn test_config_applies_cli_overrides() {
    let env = TestEnv::new();
    env.reef()
        .args(["config", "--data-dir", "/srv/reef", "--bind", "0.0.0.0:8080"])
        .assert()
        .success()
        .stdout(predicate::str::contains("database-directory \"/srv/reef\""))
        .stdout(predicate::str::contains("bind \"0.0.0.0\" port=8080"))
        .stdout(predicate::str::contains("7651").not());
}

#[test]
fn test_config_reads_explicit_file() {
    let env = TestEnv::new();
    let path = env.write_config(
        r#"
        ui-directory "/srv/ui"
        bind "127.0.0.1" port=9000
        auth {
            user "alice" password-bcrypt="$2b$04$abcdefghijklmnopqrstuu5Fq4Qf1aM5b0xI0Y6JtVf2xP0n8rB1K"
        }
        "#,
    );

    env.reef()
        .arg("config")
        .arg("--config")
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("ui-directory \"/srv/ui\""))
        .stdout(predicate::str::contains("port=9000"))
        .stdout(predicate::str::contains(
            "$2b$04$abcdefghijklmnopqrstuu5Fq4Qf1aM5b0xI0Y6JtVf2xP0n8rB1K",
        ));
}

#[test]
fn test_config_reads_system_file() {
    let env = TestEnv::new();
    let dir = env.config_home.path().join("reef");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("config.kdl"), "bind \"::1\" port=7000\n").unwrap();

    env.reef()
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("(system)"))
        .stdout(predicate::str::is_match(r#"bind "?::1"? port=7000"#).unwrap());
}

#[test]
fn test_missing_config_file_fails() {
    let env = TestEnv::new();
    env.reef()
        .args(["config", "--config", "does-not-exist.kdl"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Error:"))
        .stderr(predicate::str::contains("Config file not found"));
}

#[test]
fn test_invalid_bind_flag_fails() {
    let env = TestEnv::new();
    env.reef()
        .args(["config", "--bind", "nohost"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("HOST:PORT"));
}
