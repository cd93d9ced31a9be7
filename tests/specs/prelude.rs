//! Test helpers for `sentineld` behavioral specifications.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, dead_code)]

use assert_cmd::Command;

/// A `Command` configured to run the `sentineld` binary with a clean
/// `SENTINEL_*` environment (callers add back only what each test needs).
pub fn sentineld() -> Command {
    let mut cmd = Command::cargo_bin("sentineld").unwrap();
    for (key, _) in std::env::vars() {
        if key.starts_with("SENTINEL_") {
            cmd.env_remove(key);
        }
    }
    cmd
}
