use std::process::Command;
use std::str;

fn main() {
    let output = Command::new("git")
        .args(["describe", "--tags", "--always", "--broken"])
        .current_dir(env!("CARGO_MANIFEST_DIR"))
        .output();

    let git_tag = match output {
        Ok(output) if output.status.success() => str::from_utf8(&output.stdout)
            .expect("Invalid UTF-8 from git")
            .trim()
            .to_string(),
        // Fallback for when git isn't available or this isn't a checkout
        _ => "unknown".to_string(),
    };

    println!("cargo:rustc-env=GIT_TAG={git_tag}");
}
