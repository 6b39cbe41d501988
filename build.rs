//! Build metadata for `/api/diagnostics/about`.

use std::process::Command;

fn main() {
    println!("cargo:rustc-env=BUILD_TIMESTAMP={}", build_timestamp());
    println!("cargo:rustc-env=BUILD_GIT_SHA={}", git_sha());

    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-env-changed=SOURCE_DATE_EPOCH");
}

fn run(program: &str, args: &[&str]) -> Option<String> {
    let out = Command::new(program).args(args).output().ok()?;
    if !out.status.success() {
        return None;
    }
    let text = String::from_utf8(out.stdout).ok()?;
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

/// Reproducible builds pin the clock through `SOURCE_DATE_EPOCH`.
fn build_timestamp() -> String {
    if let Ok(epoch) = std::env::var("SOURCE_DATE_EPOCH") {
        if let Some(ts) = run("date", &["-u", "-d", &format!("@{epoch}"), "+%Y-%m-%dT%H:%M:%SZ"]) {
            return ts;
        }
    }
    run("date", &["-u", "+%Y-%m-%dT%H:%M:%SZ"])
        .or_else(|| {
            run(
                "powershell",
                &[
                    "-Command",
                    "(Get-Date).ToUniversalTime().ToString('yyyy-MM-ddTHH:mm:ssZ')",
                ],
            )
        })
        .unwrap_or_else(|| "unknown".into())
}

fn git_sha() -> String {
    let Some(sha) = run("git", &["rev-parse", "--short", "HEAD"]) else {
        return "unknown".into();
    };
    let dirty = run("git", &["status", "--porcelain", "--untracked-files=no"]).is_some();
    if dirty {
        format!("{sha}-dirty")
    } else {
        sha
    }
}
