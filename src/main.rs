mod config;
mod debugger;
mod dump;
mod host;
mod report;
mod runner;
mod session;

use clap::Parser;
use config::RunnerConfig;
use report::{RecordFile, RunOutcome, RunRecord};
use runner::CrashRunner;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// Launch a target executable, supervise it to completion or timeout, and
/// on abnormal termination collect and symbolize its crash dump with gdb.
#[derive(Parser, Debug)]
#[command(name = "corehound", version, about)]
pub struct Cli {
    /// Target executable to supervise
    #[arg(value_name = "TARGET", required_unless_present = "prepare_only")]
    target: Option<PathBuf>,

    /// Arguments passed through to the target
    #[arg(value_name = "ARGS", trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,

    /// Config file path
    #[arg(short, long, default_value = "corehound.toml")]
    config: PathBuf,

    /// Timeout in seconds (overrides config)
    #[arg(short, long)]
    timeout: Option<u64>,

    /// Dump directory (overrides config)
    #[arg(long)]
    dump_dir: Option<PathBuf>,

    /// Write a JSON outcome record to this path
    #[arg(long)]
    record: Option<PathBuf>,

    /// Prepare the host (core limit, core pattern, debugger check) and exit
    #[arg(long)]
    prepare_only: bool,

    /// Terminate the target for a diagnostic dump instead of waiting
    #[arg(long)]
    force_dump: bool,

    /// Extra logging (poll attempts, signal delivery)
    #[arg(short, long)]
    verbose: bool,

    /// Only warnings and the final outcome
    #[arg(short, long)]
    quiet: bool,
}

/// Exit status for preparation failures: missing debugger, host config
/// that cannot be set. Distinguished from per-run failures (1).
const EXIT_PREPARE_FAILED: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "warn"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let mut config = match RunnerConfig::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "configuration error");
            return ExitCode::from(EXIT_PREPARE_FAILED);
        }
    };
    if let Some(timeout) = cli.timeout {
        config.run.timeout_secs = timeout;
    }
    if let Some(dump_dir) = cli.dump_dir {
        config.run.dump_dir = dump_dir;
    }

    let runner = match CrashRunner::prepare_environment(config) {
        Ok(r) => r,
        Err(e) => {
            tracing::error!(error = %e, "cannot prepare run infrastructure");
            return ExitCode::from(EXIT_PREPARE_FAILED);
        }
    };

    if cli.prepare_only {
        println!("Run infrastructure is ready.");
        return ExitCode::SUCCESS;
    }

    // clap enforces the target unless --prepare-only was given
    let Some(target) = cli.target else {
        tracing::error!("no target specified");
        return ExitCode::FAILURE;
    };
    let run = match runner.supervise(&target, &cli.args, cli.force_dump).await {
        Ok(run) => run,
        Err(e) => {
            tracing::error!(error = %e, "run failed");
            return ExitCode::FAILURE;
        }
    };

    match &run.outcome {
        RunOutcome::CleanExit { code } => {
            println!("Target exited cleanly (code {code}).");
        }
        RunOutcome::TimedOut => {
            println!(
                "Target timed out after {}s and was terminated; no dump produced.",
                runner.config().run.timeout_secs
            );
        }
        RunOutcome::Crashed { report } => {
            println!("Target crashed; backtrace follows.\n");
            println!("{report}");
        }
        RunOutcome::CrashedNoDump => {
            println!("Target terminated abnormally but no dump file was found.");
        }
    }

    if let Some(record_path) = cli.record {
        let record = RunRecord::from_run(&run);
        if let Err(e) = RecordFile::new(record_path).write(&record) {
            tracing::warn!(error = %e, "failed to write run record");
        }
    }

    ExitCode::SUCCESS
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_cli_parses_target_and_passthrough_args() {
        let cli = Cli::parse_from(["corehound", "--timeout", "5", "./app", "--app-flag", "x"]);
        assert_eq!(cli.target, Some(PathBuf::from("./app")));
        assert_eq!(cli.args, vec!["--app-flag", "x"]);
        assert_eq!(cli.timeout, Some(5));
    }

    #[test]
    fn test_cli_prepare_only_needs_no_target() {
        let cli = Cli::parse_from(["corehound", "--prepare-only"]);
        assert!(cli.prepare_only);
        assert!(cli.target.is_none());
    }

    #[test]
    fn test_cli_requires_target_otherwise() {
        assert!(Cli::try_parse_from(["corehound"]).is_err());
    }
}
