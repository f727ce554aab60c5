//! Build script for treeway
//!
//! Embeds build-time information into the binary:
//! - Git commit hash, branch and dirty flag
//! - Build timestamp
//! - Target and host triples
//! - Rust version

use std::env;
use std::process::Command;

fn main() {
    // Rerun if git HEAD changes
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/index");

    let git_hash = git(&["rev-parse", "--short=8", "HEAD"]).unwrap_or_else(unknown);
    let git_branch = git(&["rev-parse", "--abbrev-ref", "HEAD"]).unwrap_or_else(unknown);
    let git_dirty = match git(&["status", "--porcelain"]) {
        Some(status) if !status.is_empty() => "true",
        Some(_) => "false",
        None => "unknown",
    };

    let build_timestamp = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string();
    let rustc_version = command_output("rustc", &["--version"]).unwrap_or_else(unknown);

    let vars = [
        ("TREEWAY_GIT_HASH", git_hash.clone()),
        ("TREEWAY_GIT_BRANCH", git_branch),
        ("TREEWAY_GIT_DIRTY", git_dirty.to_string()),
        ("TREEWAY_BUILD_TIMESTAMP", build_timestamp),
        ("TREEWAY_TARGET", env::var("TARGET").unwrap_or_else(|_| unknown())),
        ("TREEWAY_PROFILE", env::var("PROFILE").unwrap_or_else(|_| unknown())),
        ("TREEWAY_RUSTC_VERSION", rustc_version),
        ("TREEWAY_HOST", env::var("HOST").unwrap_or_else(|_| unknown())),
    ];
    for (key, value) in &vars {
        println!("cargo:rustc-env={}={}", key, value);
    }

    eprintln!("Building treeway {} ({})", env::var("CARGO_PKG_VERSION").unwrap_or_default(), git_hash);
}

fn unknown() -> String {
    "unknown".to_string()
}

fn git(args: &[&str]) -> Option<String> {
    command_output("git", args)
}

/// Trimmed stdout of a successful command
fn command_output(program: &str, args: &[&str]) -> Option<String> {
    let output = Command::new(program).args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8(output.stdout)
        .ok()
        .map(|s| s.trim().to_string())
}
