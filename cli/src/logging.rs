use anyhow::{Context, Result};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::Cli;
use crate::config::Config;

/// How log messages are filtered and formatted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    pub level: String,
    /// Show timestamp, level and target before each message.
    pub prefix: bool,
}

impl LogConfig {
    /// Command line flags win over the configuration file.
    pub fn new(cli: &Cli, config: &Config) -> Self {
        let level = if cli.quiet {
            "warn".to_string()
        } else if cli.verbose {
            "debug".to_string()
        } else {
            config.log.level.clone().unwrap_or_else(|| "info".to_string())
        };
        LogConfig {
            level,
            prefix: config.log.prefix && !cli.no_log_prefix,
        }
    }

    /// `RUST_LOG` overrides the level, if set.
    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!(
                "conserve={level},conserve_core={level}",
                level = self.level
            ))
        })
    }
}

pub fn init_tracing(log_config: &LogConfig) -> Result<()> {
    let builder = FmtSubscriber::builder()
        .with_env_filter(log_config.filter())
        .with_writer(std::io::stderr);
    let installed = if log_config.prefix {
        tracing::subscriber::set_global_default(builder.finish())
    } else {
        tracing::subscriber::set_global_default(
            builder
                .without_time()
                .with_level(false)
                .with_target(false)
                .finish(),
        )
    };
    installed.context("Setting default subscriber failed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).unwrap()
    }

    #[test]
    fn test_flags_override_config() {
        let mut config = Config::default();
        config.log.level = Some("trace".to_string());

        let cli = parse(&["conserve", "validate", "/a"]);
        assert_eq!(LogConfig::new(&cli, &config).level, "trace");

        let cli = parse(&["conserve", "-q", "validate", "/a"]);
        assert_eq!(LogConfig::new(&cli, &config).level, "warn");

        let cli = parse(&["conserve", "--verbose", "validate", "/a"]);
        assert_eq!(LogConfig::new(&cli, &config).level, "debug");
    }

    #[test]
    fn test_prefix_suppression() {
        let config = Config::default();
        let cli = parse(&["conserve", "validate", "/a"]);
        assert!(LogConfig::new(&cli, &config).prefix);
        let cli = parse(&["conserve", "-L", "validate", "/a"]);
        assert!(!LogConfig::new(&cli, &config).prefix);
    }
}
