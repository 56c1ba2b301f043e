use clap::Parser;
use colored::*;
use fleetmon::cli::Cli;
use fleetmon::commands::execute_command;
use fleetmon::config::FleetConfig;
use std::process;
use tracing_subscriber::EnvFilter;

fn load_config(cli: &Cli) -> anyhow::Result<FleetConfig> {
    match &cli.config {
        Some(path) => Ok(FleetConfig::load(path)?),
        None => Ok(FleetConfig::default()),
    }
}

fn init_logging(cli: &Cli, config: &FleetConfig) {
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level))
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(!cli.no_color)
        .try_init();
}

fn main() {
    let cli = Cli::parse();

    if cli.no_color {
        colored::control::set_override(false);
    }

    let result = match load_config(&cli) {
        Ok(config) => {
            init_logging(&cli, &config);
            execute_command(cli.command, &config)
        }
        Err(e) => Err(e),
    };

    if let Err(e) = result {
        eprintln!("{} {:#}", "Error:".bright_red().bold(), e);
        process::exit(1);
    }
}
