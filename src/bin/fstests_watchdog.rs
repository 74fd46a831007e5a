use clap::Parser;
use hostwatch::config::{Policy, WatchdogConfig};
use hostwatch::crash::{CheckOptions, CrashWatchdog};
use hostwatch::host::Host;
use hostwatch::inventory::Inventory;
use hostwatch::journal::{delivery_source, ensure_journal_group, LogMethod};
use hostwatch::report::{self, FleetContext};
use hostwatch::stall::CheckTimeBaselines;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

/// Report whether each host in an fstests section is making progress.
#[derive(Parser, Debug)]
#[command(name = "fstests-watchdog", version, about)]
struct Cli {
    /// Ansible hosts file; the `.config` next to it is read too
    #[arg(value_name = "HOSTFILE")]
    hostfile: PathBuf,

    /// Inventory section to poll
    #[arg(value_name = "HOSTSECTION")]
    hostsection: String,

    /// Print a detailed block per host instead of a table row
    #[arg(short, long)]
    verbose: bool,

    /// Read the journals hosts upload to this machine (the default when configured)
    #[arg(long)]
    use_systemd_remote: bool,

    /// Query hosts over ssh even if journal upload is configured
    #[arg(long)]
    use_ssh: bool,

    /// Test suite the hosts run
    #[arg(long, default_value = "fstests")]
    suite: String,

    /// Hosts polled concurrently
    #[arg(short, long, default_value_t = 1)]
    jobs: usize,

    /// Emit JSON instead of the table
    #[arg(long)]
    json: bool,

    /// Skip the kernel crash pass
    #[arg(long)]
    no_crash_check: bool,

    /// Never reset a crashed host
    #[arg(long)]
    no_reset: bool,

    /// Policy file (default: watchdog.toml next to .config)
    #[arg(long)]
    policy: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    hostwatch::init_tracing(false);
    tracing::debug!(?cli, "parsed CLI arguments");

    if !cli.hostfile.is_file() {
        eprintln!("{} does not exist", cli.hostfile.display());
        return ExitCode::FAILURE;
    }
    let topdir = cli
        .hostfile
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    let dotconfig = topdir.join(".config");
    if !dotconfig.is_file() {
        eprintln!("{} does not exist", dotconfig.display());
        return ExitCode::FAILURE;
    }

    let config = match WatchdogConfig::load(&dotconfig) {
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
    let names = match Inventory::load(&cli.hostfile).and_then(|inv| inv.hosts(&cli.hostsection)) {
        Ok(n) => n,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let delivery = config.journal_delivery(cli.use_ssh);
    if cli.use_systemd_remote && !config.journal_remote_enabled {
        tracing::warn!("systemd-journal-remote is not enabled in .config, using ssh");
    }
    if config.journal_remote_enabled && !cli.use_ssh {
        if let Err(e) = ensure_journal_group(&policy.paths.journal_group) {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    }

    let crash = if cli.no_crash_check {
        None
    } else {
        let options = CheckOptions {
            method: if cli.use_ssh { LogMethod::Ssh } else { LogMethod::Auto },
            reset: !cli.no_reset,
            ..CheckOptions::default()
        };
        match CrashWatchdog::from_config(&config, &policy, config.crash_dir(), options, true) {
            Ok(w) => Some(w),
            Err(e) => {
                eprintln!("{e}");
                return ExitCode::FAILURE;
            }
        }
    };

    let mut hosts = Vec::with_capacity(names.len());
    for name in &names {
        hosts.push(Host::resolve(name, &config, &policy, delivery).await);
    }

    let soak_duration_secs = config.soak_duration_secs;
    let ctx = Arc::new(FleetContext {
        source: delivery_source(delivery, &policy),
        baselines: Arc::new(CheckTimeBaselines::new(config.results_dir(&cli.suite))),
        suite: cli.suite.clone(),
        crash,
        config,
        policy,
    });

    let reports = report::poll_fleet(ctx, hosts, cli.jobs).await;
    tracing::debug!(hosts = reports.len(), attention = report::attention_count(&reports), "fleet pass done");

    if cli.json {
        match report::render_json(&reports, delivery, soak_duration_secs) {
            Ok(json) => println!("{json}"),
            Err(e) => {
                eprintln!("{e}");
                return ExitCode::FAILURE;
            }
        }
        return ExitCode::SUCCESS;
    }

    if cli.verbose {
        for r in &reports {
            println!("{}", report::render_verbose(r));
        }
    } else {
        println!("{}", report::header());
        for r in &reports {
            println!("{}", report::render_row(r));
        }
    }
    print!("{}", report::render_summary(delivery, soak_duration_secs));
    ExitCode::SUCCESS
}
