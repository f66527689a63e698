//! uapro - subscription client for Ubuntu hosts
//!
//! Keeps the machine's contract, entitlements, and MOTD messages in step
//! with the contract server.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::warn;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use uapro_core::config::DEFAULT_CONFIG_PATH;
use uapro_core::{RefreshTarget, UaConfig};

mod commands;

/// uapro - subscription client for Ubuntu hosts
#[derive(Parser, Debug)]
#[command(name = "uapro")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); defaults to the
    /// configured level
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Refresh configuration, contract, and MOTD messages
    Refresh {
        /// Refresh only this target
        #[arg(value_enum)]
        target: Option<TargetArg>,
    },

    /// Regenerate the MOTD contract-status message
    UpdateMessaging,

    /// Apply entitlement changes after a release upgrade
    UpgradeLtsContract,

    /// Show attachment and contract status
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum TargetArg {
    Contract,
    Config,
    Motd,
}

impl From<TargetArg> for RefreshTarget {
    fn from(arg: TargetArg) -> Self {
        match arg {
            TargetArg::Contract => Self::Contract,
            TargetArg::Config => Self::Config,
            TargetArg::Motd => Self::Motd,
        }
    }
}

fn init_logging(level: &str, log_file: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("warn"));
    let registry = tracing_subscriber::registry().with(filter);

    match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_target(false)
                        .with_ansi(false)
                        .with_writer(Mutex::new(file)),
                )
                .init();
        },
        None => {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_target(false)
                        .with_writer(std::io::stderr),
                )
                .init();
        },
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // A broken file still lets `refresh config` report the problem.
    let (config, load_error) = match UaConfig::load_or_default(&cli.config) {
        Ok(config) => (config, None),
        Err(err) => (UaConfig::default(), Some(err)),
    };

    let level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| config.client.log_level.clone());
    init_logging(&level, config.client.log_file.as_deref())?;
    if let Some(err) = load_error {
        warn!(path = %cli.config.display(), err = %err, "failed to load configuration, using defaults");
    }

    let mut ctx = commands::build_context(config, &cli.config);

    let exit_code = match cli.command {
        Commands::Refresh { target } => commands::refresh::run(&mut ctx, target.map(Into::into)),
        Commands::UpdateMessaging => commands::messaging::run(&ctx),
        Commands::UpgradeLtsContract => commands::upgrade::run(&ctx),
        Commands::Status { json } => commands::status::run(&ctx, json),
    };
    std::process::exit(i32::from(exit_code));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refresh_without_target() {
        let cli = Cli::try_parse_from(["uapro", "refresh"]).unwrap();
        assert!(matches!(cli.command, Commands::Refresh { target: None }));
        assert_eq!(cli.config, PathBuf::from(DEFAULT_CONFIG_PATH));
        assert_eq!(cli.log_level, None);
    }

    #[test]
    fn test_refresh_targets() {
        for (arg, expected) in [
            ("contract", RefreshTarget::Contract),
            ("config", RefreshTarget::Config),
            ("motd", RefreshTarget::Motd),
        ] {
            let cli = Cli::try_parse_from(["uapro", "refresh", arg]).unwrap();
            match cli.command {
                Commands::Refresh { target: Some(t) } => assert_eq!(RefreshTarget::from(t), expected),
                other => panic!("unexpected command {other:?}"),
            }
        }
    }

    #[test]
    fn test_unknown_refresh_target_is_rejected() {
        assert!(Cli::try_parse_from(["uapro", "refresh", "everything"]).is_err());
    }

    #[test]
    fn test_global_options() {
        let cli = Cli::try_parse_from([
            "uapro",
            "--config",
            "/tmp/uapro.toml",
            "--log-level",
            "debug",
            "status",
            "--json",
        ])
        .unwrap();
        assert_eq!(cli.config, PathBuf::from("/tmp/uapro.toml"));
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        assert!(matches!(cli.command, Commands::Status { json: true }));
    }

    #[test]
    fn test_kebab_case_subcommands() {
        let cli = Cli::try_parse_from(["uapro", "upgrade-lts-contract"]).unwrap();
        assert!(matches!(cli.command, Commands::UpgradeLtsContract));
        let cli = Cli::try_parse_from(["uapro", "update-messaging"]).unwrap();
        assert!(matches!(cli.command, Commands::UpdateMessaging));
    }
}
