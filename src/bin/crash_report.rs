use clap::Parser;
use hostwatch::crash_report::render_report;
use std::path::PathBuf;
use std::process::ExitCode;

/// Summarize saved crash, corruption and warning logs as markdown.
#[derive(Parser, Debug)]
#[command(name = "crash-report", version, about)]
struct Cli {
    /// Directory crash-watchdog saved logs to
    #[arg(value_name = "DIR", default_value = "crashes")]
    dir: PathBuf,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    hostwatch::init_tracing(false);

    match render_report(&cli.dir) {
        Ok(report) => {
            print!("{report}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(dir = %cli.dir.display(), error = %e, "failed to read crash logs");
            ExitCode::FAILURE
        }
    }
}
