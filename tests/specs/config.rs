//! Configuration resolution specs: a `deploy`/`hard-update` invocation
//! without the required environment fails fast with a clear message
//! instead of panicking or hanging on a lock/network call.

use crate::prelude::sentineld;
use predicates::prelude::*;

#[test]
fn missing_deploy_dir_fails_before_touching_git_or_network() {
    sentineld()
        .assert()
        .failure()
        .stderr(predicate::str::contains("SENTINEL_DEPLOY_DIR"));
}

#[test]
fn missing_repo_dir_fails_with_its_own_variable_name() {
    sentineld()
        .env("SENTINEL_DEPLOY_DIR", "/tmp/sentineld-spec-deploy")
        .assert()
        .failure()
        .stderr(predicate::str::contains("SENTINEL_REPO_DIR"));
}
