//! Command-line interface.

use std::fs;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};

use crate::config::EngineConfig;
use crate::error::{MonitorError, MonitorResult};
use crate::health::Subsystem;
use crate::{ENGINE_FULL_NAME, ENGINE_VERSION};

/// Vigil Engine CLI
#[derive(Parser, Debug)]
#[command(
    name = "vigil",
    author = "AIOps Team",
    version,
    about = "Health and performance monitoring engine for background job services",
    long_about = "Vigil samples host resources, the database pool, the queue backend \
                  and the job store on a fixed interval, and serves cached health, \
                  performance, error-trend, stuck-job and queue-wait snapshots as JSON."
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "vigil.toml", env = "VIGIL_CONFIG")]
    pub config: PathBuf,

    /// Log level override
    #[arg(short, long, env = "VIGIL_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Enable debug mode
    #[arg(short, long, env = "VIGIL_DEBUG")]
    pub debug: bool,

    /// Subcommand to run (defaults to `run`)
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the scheduler and the HTTP API
    Run,

    /// Compute every snapshot once and print it as JSON
    Check,

    /// Validate configuration file
    Validate {
        /// Show full parsed configuration
        #[arg(short, long)]
        verbose: bool,
    },

    /// Generate default configuration file
    GenerateConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show engine version and build info
    Version,
}

// ----------------------------------------------------------------------------
// Handlers
// ----------------------------------------------------------------------------

pub fn handle_validate(config_path: &Path, verbose: bool) -> MonitorResult<()> {
    println!("Validating configuration file: {}", config_path.display());

    let config = match EngineConfig::load(config_path) {
        Ok(config) => config,
        Err(e) => {
            println!("❌ Configuration validation failed!");
            println!("Error: {}", e);
            return Err(MonitorError::Config(e));
        }
    };
    println!("✅ Configuration is valid!");

    if verbose {
        println!("\n📋 Parsed configuration:");
        println!("{}", "=".repeat(60));
        match toml::to_string_pretty(&config) {
            Ok(s) => println!("{}", s),
            Err(e) => println!("Failed to serialize: {}", e),
        }
    }

    println!("\n📊 Configuration Summary:");
    println!("  • Instance name: {}", config.engine.instance_name);
    println!("  • Environment: {}", config.engine.environment);
    println!(
        "  • Poll interval: {}",
        humantime::format_duration(config.engine.poll_interval)
    );
    println!("  • Source timeout: {}", humantime::format_duration(config.sources.timeout));
    println!("  • Monitored queues: {}", config.sources.queues.join(", "));
    println!("  • Thresholds:");
    for subsystem in Subsystem::ALL {
        match config.thresholds.get(subsystem) {
            Some(t) => println!(
                "    - {}: warning {} / critical {}",
                subsystem, t.warning, t.critical
            ),
            None => println!("    - {}: not monitored", subsystem),
        }
    }
    if config.api.enabled {
        println!("  • HTTP API: {}", config.api.address);
    } else {
        println!("  • HTTP API: disabled");
    }

    Ok(())
}

pub fn handle_generate_config(output: Option<&Path>) -> MonitorResult<()> {
    let config_str = EngineConfig::generate_default_config();

    match output {
        Some(path) => {
            fs::write(path, &config_str)?;
            println!("✅ Default configuration written to: {}", path.display());
        }
        None => println!("{}", config_str),
    }

    Ok(())
}

pub fn handle_version() {
    println!("🔭 {} v{}", ENGINE_FULL_NAME, ENGINE_VERSION);
    println!();
    println!("Build Information:");
    println!("  • Target: {}", std::env::consts::ARCH);
    println!("  • OS: {}", std::env::consts::OS);
    println!("  • Family: {}", std::env::consts::FAMILY);
    println!();
    println!("Endpoints:");
    println!("  • GET  /health /resources /performance /errors /stuck-jobs /queue-prediction /status");
    println!("  • POST /ingest/outcome /ingest/error /ingest/job /ingest/queue");
    println!();
    println!("License: MIT");
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_subcommands() {
        let cli = Cli::try_parse_from(["vigil", "--config", "/etc/vigil.toml", "check"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("/etc/vigil.toml"));
        assert!(matches!(cli.command, Some(Commands::Check)));

        let cli = Cli::try_parse_from(["vigil", "validate", "--verbose"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Validate { verbose: true })));

        let cli = Cli::try_parse_from(["vigil"]).unwrap();
        assert!(cli.command.is_none());
    }

    #[test]
    fn test_generate_then_validate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vigil.toml");

        handle_generate_config(Some(&path)).unwrap();
        handle_validate(&path, false).unwrap();
    }

    #[test]
    fn test_validate_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = handle_validate(&dir.path().join("absent.toml"), false).unwrap_err();
        assert_eq!(err.category(), "config");
    }
}
