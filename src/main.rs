use std::sync::Arc;

use anyhow::{Context, Result as AnyhowResult};
use clap::Parser;
use tracing::{info, warn};

use vigil_engine::cli::{handle_generate_config, handle_validate, handle_version, Cli, Commands};
use vigil_engine::config::EngineConfig;
use vigil_engine::engine::{Collaborators, Monitor};
use vigil_engine::logging::init_logging;
use vigil_engine::source::{InMemoryBackend, SysinfoReader};
use vigil_engine::{ENGINE_FULL_NAME, ENGINE_VERSION};

#[tokio::main]
async fn main() -> AnyhowResult<()> {
    let cli = Cli::parse();

    // Subcommands that don't need the engine
    match &cli.command {
        Some(Commands::Version) => {
            handle_version();
            return Ok(());
        }
        Some(Commands::GenerateConfig { output }) => {
            handle_generate_config(output.as_deref())?;
            return Ok(());
        }
        Some(Commands::Validate { verbose }) => {
            handle_validate(&cli.config, *verbose)?;
            return Ok(());
        }
        _ => {}
    }

    let config_found = cli.config.exists();
    let config = if config_found {
        EngineConfig::load(&cli.config)
            .with_context(|| format!("Failed to load config from {}", cli.config.display()))?
    } else {
        EngineConfig::default()
    };

    let mut logging_config = config.logging.clone();
    if let Some(level) = &cli.log_level {
        logging_config.level = level.clone();
    }
    if cli.debug {
        logging_config.level = "debug".into();
    }
    init_logging(&logging_config)?;

    if !config_found {
        warn!("Config file not found at {}, using defaults", cli.config.display());
    }
    info!("🔭 {} v{}", ENGINE_FULL_NAME, ENGINE_VERSION);

    let collaborators = Collaborators::standalone(
        Arc::new(SysinfoReader::new()),
        Arc::new(InMemoryBackend::new()),
    );
    let monitor = Monitor::new(config, collaborators).context("Failed to build monitor")?;

    match cli.command {
        Some(Commands::Check) => {
            let report = monitor.run_once().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        _ => Arc::new(monitor).run().await?,
    }

    Ok(())
}
