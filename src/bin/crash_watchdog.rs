use clap::{ArgAction, Parser};
use hostwatch::config::{Policy, WatchdogConfig};
use hostwatch::crash::{CheckOptions, CheckOutcome, CrashWatchdog};
use hostwatch::host::Host;
use hostwatch::inventory::Inventory;
use hostwatch::journal::{ensure_journal_group, method_needs_journal_group, LogMethod};
use hostwatch::pool::map_bounded;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

/// Detect and handle kernel crashes, filesystem corruption and kernel
/// warnings on test hosts.
///
/// Invoked as `get-console` it prints the whole kernel log of the host
/// instead, without saving warnings or resetting anything.
#[derive(Parser, Debug)]
#[command(name = "crash-watchdog", version, about)]
struct Cli {
    /// Host to check, or `all` for every host in the inventory section
    #[arg(long, default_value = "all")]
    host_name: String,

    /// Host to check (same as --host-name)
    #[arg(value_name = "HOST")]
    host: Option<String>,

    /// Directory to store crash logs in, one subdirectory per host
    /// (default: crashes/ next to .config)
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// How to collect logs
    #[arg(long, value_enum, default_value_t = LogMethod::Auto)]
    method: LogMethod,

    /// Save the full kernel log instead of only the crash context
    #[arg(long)]
    full_log: bool,

    /// Do not decode crash logs with decode_stacktrace.sh
    #[arg(long)]
    no_decode: bool,

    /// Do not reset a host even if it crashed
    #[arg(long)]
    no_reset: bool,

    /// Show all kernel log lines for one fstests test (e.g. generic/750)
    #[arg(long, value_name = "TESTID")]
    fstests_log: Option<String>,

    /// Save new kernel warnings
    #[arg(long, action = ArgAction::Set, num_args = 0..=1, default_value_t = true, default_missing_value = "true")]
    save_warnings: bool,

    /// Ansible hosts file used for `all`
    #[arg(long, default_value = "hosts")]
    hostfile: PathBuf,

    /// Inventory section used for `all`
    #[arg(long, default_value = "baseline")]
    section: String,

    /// Kconfig file
    #[arg(long, default_value = ".config")]
    config: PathBuf,

    /// Policy file (default: watchdog.toml next to .config)
    #[arg(long)]
    policy: Option<PathBuf>,

    /// Hosts checked concurrently
    #[arg(short, long, default_value_t = 1)]
    jobs: usize,

    #[arg(short, long)]
    verbose: bool,
}

fn invoked_as_get_console() -> bool {
    std::env::args_os()
        .next()
        .as_deref()
        .map(Path::new)
        .and_then(Path::file_stem)
        .map(|s| s == "get-console" || s == "get_console")
        .unwrap_or(false)
}

fn host_names(cli: &Cli) -> Result<Vec<String>, String> {
    let name = cli.host.as_deref().unwrap_or(&cli.host_name);
    if name != "all" {
        return Ok(vec![name.to_string()]);
    }
    let inventory = Inventory::load(&cli.hostfile).map_err(|e| e.to_string())?;
    let mut hosts = inventory.hosts(&cli.section).map_err(|e| e.to_string())?;
    hosts.sort();
    hosts.dedup();
    Ok(hosts)
}

fn output_dir(cli: &Cli, config: &WatchdogConfig) -> PathBuf {
    cli.output_dir.clone().unwrap_or_else(|| config.crash_dir())
}

fn log_outcome(host: &str, outcome: &CheckOutcome) {
    if outcome.skipped {
        tracing::info!(host, "another pass holds this host, skipped");
        return;
    }
    if outcome.logs_unavailable {
        tracing::warn!(host, "no log source could provide the kernel log");
    }
    if outcome.save_failed {
        tracing::error!(host, "some crash logs could not be saved");
    }
    if let Some(path) = outcome.warning_file() {
        tracing::warn!(host, file = %path.display(), "kernel warning logged");
    }
    for path in outcome.corruption_files() {
        tracing::warn!(host, file = %path.display(), "filesystem corruption detected");
    }
    for path in outcome.crash_files() {
        tracing::warn!(host, file = %path.display(), "crash detected");
    }
    if !outcome.has_crash() {
        tracing::debug!(host, "no crash detected");
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let mut cli = Cli::parse();
    let dump = invoked_as_get_console();
    if dump {
        cli.no_reset = true;
        cli.save_warnings = false;
        cli.full_log = true;
    }
    hostwatch::init_tracing(cli.verbose);
    tracing::debug!(?cli, "parsed CLI arguments");

    let config = match WatchdogConfig::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };
    let policy = match Policy::load_for(cli.policy.as_deref(), &config.topdir) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };
    let names = match host_names(&cli) {
        Ok(n) => n,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    if method_needs_journal_group(cli.method, &config) {
        if let Err(e) = ensure_journal_group(&policy.paths.journal_group) {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    }

    let options = CheckOptions {
        method: cli.method,
        full_log: cli.full_log,
        fstests_log: cli.fstests_log.clone(),
        save_warnings: cli.save_warnings,
        reset: !cli.no_reset,
        wait_after_reset: true,
        dump_log: dump,
    };
    let watchdog = match CrashWatchdog::from_config(&config, &policy, output_dir(&cli, &config), options, !cli.no_decode) {
        Ok(w) => Arc::new(w),
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    if names.len() > 1 {
        tracing::info!(count = names.len(), hosts = %names.join(", "), "checking hosts for kernel crashes");
    }

    let delivery = config.journal_delivery(false);
    let mut hosts = Vec::with_capacity(names.len());
    for name in &names {
        hosts.push(Host::resolve(name, &config, &policy, delivery).await);
    }

    let results = map_bounded(hosts.clone(), cli.jobs, |host| {
        let watchdog = watchdog.clone();
        async move { watchdog.check_and_reset_host(&host).await }
    })
    .await;

    let mut crashed = false;
    let mut failed = false;
    let mut warned = false;
    for (host, result) in hosts.iter().zip(results) {
        let outcome = match result {
            Some(Ok(outcome)) => outcome,
            Some(Err(e)) => {
                tracing::error!(host = %host.name, error = %e, "crash check failed");
                failed = true;
                continue;
            }
            None => {
                tracing::error!(host = %host.name, "crash check did not finish");
                failed = true;
                continue;
            }
        };
        log_outcome(&host.name, &outcome);
        if let Some(text) = &outcome.fstests_log {
            println!("{text}");
        }
        if let Some(log) = &outcome.log {
            println!("{log}");
        }
        crashed |= outcome.has_crash() || outcome.has_corruption();
        failed |= outcome.save_failed;
        warned |= outcome.warning_file().is_some();
    }

    if warned {
        tracing::warn!("kernel warnings detected in one or more hosts");
    }
    if crashed {
        tracing::warn!("kernel crashes or corruption detected in one or more hosts");
        ExitCode::FAILURE
    } else if failed {
        tracing::error!("crash check failed on one or more hosts");
        ExitCode::FAILURE
    } else {
        tracing::info!("no kernel crashes detected");
        ExitCode::SUCCESS
    }
}
