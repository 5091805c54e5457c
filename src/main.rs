use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use querierd::config::Config;
use querierd::logging::{Logger, Severity};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Parser, Debug, PartialEq)]
enum Command {
    /// Run the querier daemon
    Run {
        /// Path to the JSON5 configuration file
        #[arg(long, default_value = "/etc/querierd/config.json5")]
        config: PathBuf,
        /// Minimum log severity; overrides the config file
        #[arg(long)]
        log_level: Option<String>,
    },
    /// Parse and validate a configuration file, then exit
    CheckConfig {
        #[arg(long, default_value = "/etc/querierd/config.json5")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Command::Run { config, log_level } => {
            let config = Config::load_from_file(&config)
                .with_context(|| format!("loading {}", config.display()))?;
            config.validate().context("invalid configuration")?;

            let level = log_level
                .as_deref()
                .or(config.log_level.as_deref())
                .and_then(Severity::from_name)
                .unwrap_or(Severity::Info);
            let logger = Logger::stderr_json(level);

            querierd::daemon::run(config, logger).await?;
        }
        Command::CheckConfig { config } => {
            let parsed = Config::load_from_file(&config)
                .with_context(|| format!("loading {}", config.display()))?;
            parsed.validate().context("invalid configuration")?;
            println!("{} interface(s) configured", parsed.interfaces.len());
        }
    }

    Ok(())
}
