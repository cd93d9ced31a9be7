//! `sentineld --help` / `--version` and unknown-argument handling.
//!
//! None of these require configuration — they must short-circuit before
//! `config_from_env` runs.

use crate::prelude::sentineld;
use predicates::prelude::*;

#[test]
fn version_flag_prints_version_and_hash() {
    sentineld()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::starts_with("sentineld"));
}

#[test]
fn help_flag_prints_usage() {
    sentineld()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("USAGE:"))
        .stdout(predicate::str::contains("deploy|hard-update"));
}

#[test]
fn unknown_argument_is_rejected() {
    sentineld()
        .arg("bogus-mode")
        .assert()
        .failure()
        .stderr(predicate::str::contains("unexpected argument"));
}
