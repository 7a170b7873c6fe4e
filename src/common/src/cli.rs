use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Common CLI arguments shared across rowttl binaries
#[derive(Parser, Debug, Clone)]
pub struct CommonArgs {
    #[arg(long, global = true, help = "Configuration file path")]
    pub config: Option<PathBuf>,

    #[arg(short, long, global = true, help = "Enable verbose logging")]
    pub verbose: bool,

    #[arg(short, long, global = true, help = "Enable quiet mode (minimal output)")]
    pub quiet: bool,
}

/// Subcommands that only inspect configuration
#[derive(Subcommand, Debug, Clone)]
pub enum CommonCommands {
    /// Show current configuration and exit
    Config {
        #[arg(long, help = "Show configuration in JSON format")]
        json: bool,
    },
    /// Validate configuration and exit
    Validate,
    /// Show version information and exit
    Version,
}

/// Utility functions for CLI operations
pub mod utils {
    use super::*;
    use crate::config::{Configuration, TTL_JOB_ENABLED_SETTING};
    use anyhow::{Context, Result};
    use tracing_subscriber::EnvFilter;

    /// Initialize logging based on CLI arguments
    ///
    /// `RUST_LOG` wins unless `--quiet` or `--verbose` was given.
    pub fn init_logging(args: &CommonArgs) {
        let filter = if args.quiet {
            EnvFilter::new("warn")
        } else if args.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
        };

        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
    }

    /// Load configuration with optional override from CLI
    pub fn load_config(config_path: Option<&PathBuf>) -> Result<Configuration> {
        match config_path {
            Some(path) => {
                log::info!("Loading configuration from: {}", path.display());
                Configuration::load_from_path(path).context("Failed to load configuration")
            }
            None => Configuration::load().context("Failed to load configuration"),
        }
    }

    /// Display configuration in human-readable or JSON format
    pub fn display_config(config: &Configuration, json: bool) -> Result<()> {
        if json {
            let json = serde_json::to_string_pretty(config)
                .context("Failed to serialize configuration to JSON")?;
            println!("{json}");
        } else {
            println!("rowttl Configuration:");
            println!("=====================");
            println!("{}: {}", TTL_JOB_ENABLED_SETTING, config.ttl.enabled);
            println!("Select batch size: {}", config.ttl.select_batch_size);
            println!("Delete batch size: {}", config.ttl.delete_batch_size);
            if config.ttl.delete_rate_limit == 0 {
                println!("Delete rate limit: unlimited");
            } else {
                println!("Delete rate limit: {} rows/s", config.ttl.delete_rate_limit);
            }
            println!("Select as of: {:?} ago", config.ttl.select_as_of);
            match config.ttl.worker_concurrency {
                Some(cap) => println!("Worker concurrency cap: {cap}"),
                None => println!("Worker concurrency cap: available parallelism"),
            }
            println!("Job registry directory: {}", config.jobs.registry_dir);
            println!("SQL instance ID: {}", config.node.sql_instance_id);
        }
        Ok(())
    }

    /// Validate configuration and report any issues
    pub fn validate_config(config: &Configuration) -> Result<()> {
        log::info!("Validating configuration...");

        config
            .ttl
            .validate()
            .context("Invalid TTL configuration")?;

        if config.jobs.registry_dir.is_empty() {
            anyhow::bail!("Job registry directory cannot be empty");
        }

        log::info!("Configuration validation passed");
        Ok(())
    }

    /// Handle commands that don't require running a job
    pub fn handle_common_command(command: &CommonCommands, config: &Configuration) -> Result<()> {
        match command {
            CommonCommands::Config { json } => display_config(config, *json),
            CommonCommands::Validate => validate_config(config),
            CommonCommands::Version => {
                println!("{}", version_info());
                Ok(())
            }
        }
    }

    /// Standard version information
    pub fn version_info() -> String {
        format!(
            "{} {} ({})",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION"),
            env!("CARGO_PKG_RUST_VERSION")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Configuration;

    #[test]
    fn test_version_info() {
        let version = utils::version_info();
        assert!(version.contains(env!("CARGO_PKG_VERSION")));
    }

    #[test]
    fn test_validate_rejects_empty_registry_dir() {
        let mut config = Configuration::default();
        assert!(utils::validate_config(&config).is_ok());

        config.jobs.registry_dir.clear();
        assert!(utils::validate_config(&config).is_err());
    }

    #[test]
    fn test_validate_rejects_invalid_ttl_section() {
        let mut config = Configuration::default();
        config.ttl.delete_batch_size = 0;
        let err = utils::validate_config(&config).unwrap_err();
        assert!(format!("{err:#}").contains("delete_batch_size"));
    }
}
