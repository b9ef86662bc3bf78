use std::process::Command;

fn main() {
    println!("cargo::rerun-if-changed=.git/HEAD");

    // Embed the commit the binary was built from, when available.  Release
    // tarballs and vendored builds have no repository; fall back gracefully.
    let hash = Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
        .ok()
        .filter(|out| out.status.success())
        .and_then(|out| String::from_utf8(out.stdout).ok())
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|| "no-git".into());

    let dirty = Command::new("git")
        .args(["diff-index", "--quiet", "HEAD"])
        .status()
        .map(|status| !status.success())
        .unwrap_or(false);

    let suffix = if dirty { "-dirty" } else { "" };
    println!(
        "cargo::rustc-env=SLUICE_BUILD_VERSION={} at {hash}{suffix}",
        env!("CARGO_PKG_VERSION")
    );
}
