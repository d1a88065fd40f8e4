use std::process::Command;

fn main() {
    let revision = std::env::var("DEX_OPERATOR_BUILD")
        .ok()
        .or_else(|| {
            Command::new("git")
                .args(["rev-parse", "--short", "HEAD"])
                .output()
                .ok()
                .filter(|output| output.status.success())
                .and_then(|output| String::from_utf8(output.stdout).ok())
                .map(|s| s.trim().to_string())
        })
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "unknown".to_string());

    println!("cargo:rustc-env=DEX_OPERATOR_BUILD={revision}");
    println!("cargo:rerun-if-env-changed=DEX_OPERATOR_BUILD");
}
