//! Stamps the binary with the commit it was built from and when.
//!
//! `reef --version` prints both. Reproducible builds can pin the timestamp
//! with `SOURCE_DATE_EPOCH`; builds outside a git checkout report `unknown`.

use chrono::{DateTime, Utc};
use std::process::Command;

fn main() {
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/index");
    println!("cargo:rerun-if-env-changed=SOURCE_DATE_EPOCH");

    println!(
        "cargo:rustc-env=REEF_BUILD_TIMESTAMP={}",
        build_time().format("%Y-%m-%dT%H:%M:%SZ")
    );
    println!(
        "cargo:rustc-env=REEF_GIT_COMMIT={}",
        commit().unwrap_or_else(|| "unknown".to_string())
    );
}

fn build_time() -> DateTime<Utc> {
    std::env::var("SOURCE_DATE_EPOCH")
        .ok()
        .and_then(|epoch| epoch.trim().parse::<i64>().ok())
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .unwrap_or_else(Utc::now)
}

/// Short hash of HEAD, suffixed with `-dirty` when the tree has local edits.
fn commit() -> Option<String> {
    let hash = git(&["rev-parse", "--short=12", "HEAD"])?;
    let dirty = git(&["status", "--porcelain", "--untracked-files=no"])
        .is_some_and(|status| !status.is_empty());
    Some(if dirty { format!("{}-dirty", hash) } else { hash })
}

fn git(args: &[&str]) -> Option<String> {
    let output = Command::new("git").args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    Some(String::from_utf8(output.stdout).ok()?.trim().to_string())
}
