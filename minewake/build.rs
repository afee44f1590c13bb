use std::process::Command;

fn git_output(args: &[&str]) -> Option<String> {
    let output = Command::new("git").args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).to_string())
}

fn main() {
    let version = git_output(&["tag", "-l", "v*"])
        .and_then(|tags| tags.lines().find(|line| !line.is_empty()).map(str::to_string))
        .unwrap_or_else(|| "undefined".to_string());
    let hash = git_output(&["rev-parse", "--short=10", "HEAD"])
        .map(|rev| rev.trim().to_string())
        .unwrap_or_else(|| "unknown".to_string());
    println!("cargo:rustc-env=MINEWAKE_VERSION={}", version);
    println!("cargo:rustc-env=MINEWAKE_HASH={}", hash);
}
