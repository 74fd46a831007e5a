//! Watchdog for fleets of fstests/blktests test hosts.
//!
//! Two passes share this library. The stall pass ([`stall`], rendered by
//! [`report`]) asks each host's kernel log which test it is running and
//! compares the elapsed time against that test's previous runtime. The crash
//! pass ([`crash`]) scans the same logs for panics, filesystem corruption
//! and warnings, saves what it finds under a per-host directory and resets
//! hosts that crashed.
pub mod config;
pub mod crash;
pub mod crash_report;
pub mod exec;
pub mod host;
pub mod inventory;
pub mod journal;
pub mod pool;
pub mod report;
pub mod stall;

#[cfg(test)]
mod testutil;

use tracing_subscriber::EnvFilter;

/// Install the stderr log subscriber. `RUST_LOG` wins over `verbose`.
pub fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .init();
}
