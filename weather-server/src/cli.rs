use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::{error::Error, path::PathBuf};
use weather_core::{
    Config, ConfigLoader, Logger,
    config::{DEFAULT_CONFIG_DIR, SkippedLayer},
};

/// Top-level CLI struct.
#[derive(Debug, Parser)]
#[command(name = "weather-server", version, about = "Weather service")]
pub struct Cli {
    /// Directory holding `default.yaml` and the per-mode overrides.
    #[arg(long, default_value = DEFAULT_CONFIG_DIR)]
    pub config_dir: PathBuf,

    /// Service name attached to every log record.
    #[arg(long, default_value = "weather")]
    pub service: String,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Subcommand)]
pub enum Command {
    /// Start the service (default).
    Serve,

    /// Print the resolved configuration as YAML.
    ShowConfig,
}

impl Cli {
    pub fn run(self) -> Result<()> {
        let resolution = ConfigLoader::from_env(self.config_dir.clone())
            .resolve()
            .context("config load error")?;
        let config = &resolution.config;

        match self.command.unwrap_or(Command::Serve) {
            Command::ShowConfig => {
                for layer in &resolution.skipped {
                    println!("# skipped {}: {}", layer.path.display(), describe(&layer.error));
                }
                let yaml = serde_yaml::to_string(config)
                    .context("Failed to serialize configuration to YAML")?;
                print!("{yaml}");
                Ok(())
            }
            Command::Serve => {
                let logger = Logger::new(&config.logger, &self.service);
                logger.scope(|| {
                    report_skipped(&resolution.skipped);
                    serve(config)
                })?;
                logger.shutdown().context("Failed to flush logger")
            }
        }
    }
}

/// Surface optional layers that resolution ignored.
fn report_skipped(skipped: &[SkippedLayer]) {
    for layer in skipped {
        tracing::warn!(
            path = %layer.path.display(),
            error = %describe(&layer.error),
            "ignored unreadable mode config"
        );
    }
}

/// Error message followed by its sources, `: `-separated.
fn describe(err: &(dyn Error + 'static)) -> String {
    let mut msg = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        msg.push_str(": ");
        msg.push_str(&cause.to_string());
        source = cause.source();
    }
    msg
}

fn serve(config: &Config) -> Result<()> {
    tracing::info!(
        env = %config.env,
        host = %config.http.host,
        port = config.http.port,
        "configuration loaded"
    );

    // TODO: bind an HTTP listener on `config.http` once request handlers exist
    tracing::warn!("http server not implemented yet, exiting");

    Ok(())
}
