//! Behavioral specifications for `sentineld`.
//!
//! Black-box: invoke the built binary and verify stdout, stderr, and exit
//! codes. No daemon lock is held by any of these (they exercise only the
//! argument parsing and configuration-resolution surface).

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

#[path = "specs/prelude.rs"]
mod prelude;

#[path = "specs/help.rs"]
mod help;
#[path = "specs/config.rs"]
mod config;
