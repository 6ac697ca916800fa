mod commands;
mod config;
mod logging;
mod retry;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{
    backup::BackupCommand, init::InitCommand, ls::LsCommand, printproto::PrintProtoCommand,
    restore::RestoreCommand, validate::ValidateCommand, versions::VersionsCommand,
};
use config::Config;
use logging::LogConfig;
use tracing::{debug, error};

#[derive(Parser)]
#[command(
    name = "conserve",
    version,
    about = "A robust backup tool",
    long_about = "Conserve stores each backup as a band of an archive, with file content kept as deduplicated, content-addressed blocks"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(long, global = true, env = "CONSERVE_CONFIG", help = "Configuration file")]
    config: Option<PathBuf>,

    #[arg(short, long, global = true, help = "Enable verbose output")]
    verbose: bool,

    #[arg(short, long, global = true, conflicts_with = "verbose", help = "Enable quiet mode")]
    quiet: bool,

    #[arg(
        short = 'L',
        long,
        global = true,
        help = "Don't show timestamps, levels or targets in log messages"
    )]
    no_log_prefix: bool,
}

#[derive(Subcommand)]
enum Commands {
    #[command(name = "init-archive", about = "Create a new, empty archive")]
    InitArchive(InitCommand),

    #[command(about = "Back up a directory into a new band")]
    Backup(BackupCommand),

    #[command(about = "Decode and print archive files")]
    Printproto(PrintProtoCommand),

    #[command(about = "List the bands in an archive")]
    Versions(VersionsCommand),

    #[command(about = "List the entries of a band")]
    Ls(LsCommand),

    #[command(about = "Restore a band into a directory")]
    Restore(RestoreCommand),

    #[command(about = "Check the archive for damage")]
    Validate(ValidateCommand),
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = Config::load(cli.config.as_deref());
    let log_config = match &config {
        Ok(config) => LogConfig::new(&cli, config),
        Err(_) => LogConfig::new(&cli, &Config::default()),
    };
    if let Err(e) = logging::init_tracing(&log_config) {
        eprintln!("conserve: {:#}", e);
        return ExitCode::FAILURE;
    }

    let result = match config {
        Ok(config) => run(&cli, &config).await,
        Err(e) => Err(e),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: &Cli, config: &Config) -> Result<()> {
    debug!(?config, "Loaded configuration");
    match &cli.command {
        Commands::InitArchive(cmd) => cmd.run().await,
        Commands::Backup(cmd) => cmd.run(cli, config).await,
        Commands::Printproto(cmd) => cmd.run().await,
        Commands::Versions(cmd) => cmd.run().await,
        Commands::Ls(cmd) => cmd.run().await,
        Commands::Restore(cmd) => cmd.run(cli).await,
        Commands::Validate(cmd) => cmd.run().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_backup_with_global_flags() {
        let cli = Cli::try_parse_from([
            "conserve",
            "-L",
            "backup",
            "/src",
            "/archive",
            "--block-size",
            "4096",
            "-v",
        ])
        .unwrap();
        assert!(cli.no_log_prefix);
        assert!(cli.verbose);
        assert!(matches!(cli.command, Commands::Backup(_)));
    }

    #[test]
    fn test_printproto_needs_a_file() {
        assert!(Cli::try_parse_from(["conserve", "printproto"]).is_err());
        assert!(Cli::try_parse_from(["conserve", "printproto", "a", "b"]).is_ok());
    }

    #[test]
    fn test_verbose_and_quiet_conflict() {
        assert!(Cli::try_parse_from(["conserve", "-v", "-q", "validate", "/a"]).is_err());
    }
}
