// SPDX-License-Identifier: MIT

//! sentineld: thin embedding binary for `sentinel-engine`.
//!
//! No argument parsing beyond a single optional positional mode selector.
//! Configuration comes entirely from the process environment via
//! [`sentinel_daemon::config_from_env`].

use sentinel_core::SystemClock;
use sentinel_daemon::{build_git_hash, config_from_env};
use sentinel_engine::Manager;
use tracing::{error, info};

enum Mode {
    Deploy,
    HardUpdate,
}

fn parse_mode(arg: Option<&str>) -> Result<Mode, String> {
    match arg {
        None | Some("deploy") => Ok(Mode::Deploy),
        Some("hard-update") => Ok(Mode::HardUpdate),
        Some("--version") | Some("-v") | Some("-V") => {
            println!("sentineld {}+{}", env!("CARGO_PKG_VERSION"), build_git_hash());
            std::process::exit(0);
        }
        Some("--help") | Some("-h") => {
            print_help();
            std::process::exit(0);
        }
        Some(other) => Err(other.to_string()),
    }
}

fn print_help() {
    println!("sentineld {}+{}", env!("CARGO_PKG_VERSION"), build_git_hash());
    println!();
    println!("USAGE:");
    println!("    sentineld [deploy|hard-update]");
    println!();
    println!("Runs a single deployment pass against SENTINEL_* environment variables");
    println!("and exits. `deploy` (the default) only acts on detected changes;");
    println!("`hard-update` always redeploys every configured component.");
}

fn setup_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .init();
}

#[tokio::main]
async fn main() {
    let arg = std::env::args().nth(1);
    let mode = match parse_mode(arg.as_deref()) {
        Ok(mode) => mode,
        Err(unexpected) => {
            eprintln!("error: unexpected argument '{unexpected}'");
            eprintln!("Usage: sentineld [deploy|hard-update]");
            std::process::exit(1);
        }
    };

    setup_logging();

    let config = match config_from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "failed to resolve configuration");
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    };

    let clock = SystemClock;
    let manager = Manager::new(config, &clock);

    let result = match mode {
        Mode::Deploy => {
            info!("starting deploy pass");
            manager.deploy().await
        }
        Mode::HardUpdate => {
            info!("starting hard-update pass");
            manager.hard_update().await
        }
    };

    match serde_json::to_string_pretty(&result) {
        Ok(json) => println!("{json}"),
        Err(e) => error!(error = %e, "failed to serialise deployment result"),
    }

    if !result.success {
        std::process::exit(1);
    }
}
