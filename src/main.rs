//! hakurei - Entry Point
//!
//! One binary serves three roles: the privileged-side driver (default),
//! the shim (selected by the state pipe variable) and container init
//! (selected by the param pipe variable). Role dispatch happens before
//! anything else so the child processes never touch CLI parsing.

use std::path::PathBuf;

use clap::Parser;
use miette::{IntoDiagnostic, Result};
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, EnvFilter};

use hakurei::{app, config::Config, container, shim, system};

/// hakurei - unprivileged per-app Linux sandbox.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// App configuration to launch (JSON)
    config: PathBuf,

    /// Skip host requirements checks (NOT RECOMMENDED)
    #[arg(long, default_value = "false")]
    skip_checks: bool,

    /// Enable verbose logging
    #[arg(short, long, default_value = "false")]
    verbose: bool,
}

fn main() -> Result<()> {
    if container::init::is_init() {
        container::init::run();
    }
    if shim::is_shim() {
        shim::run();
    }

    let args = Args::parse();

    let filter = if args.verbose {
        EnvFilter::from_default_env().add_directive(Level::DEBUG.into())
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    if args.skip_checks {
        warn!("skipping host requirements checks (--skip-checks)");
    } else {
        match system::check_all() {
            Ok(reqs) => {
                info!(
                    "host requirements satisfied: kernel {}, Landlock ABI v{}, cgroup v2: {}, userns: {}",
                    reqs.kernel_version, reqs.landlock_abi, reqs.cgroups_v2, reqs.user_namespaces
                );
            }
            Err(e) => {
                error!("host requirements check failed");
                return Err(e).into_diagnostic();
            }
        }
    }

    let raw = std::fs::read_to_string(&args.config).into_diagnostic()?;
    let config: Config = serde_json::from_str(&raw).into_diagnostic()?;

    match app::run(&config, args.verbose) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("cannot launch app: {e}");
            Err(e).into_diagnostic()
        }
    }
}
