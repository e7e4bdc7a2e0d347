//! Ringwatch CLI - runs membership simulations and manages their configuration

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use ringwatch_cli::cli::{Cli, Commands, ConfigAction};
use ringwatch_cli::config::ConfigManager;
use ringwatch_cli::simulation::{SimulationReport, run_simulation};
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .with_context(|| format!("invalid log level '{}'", cli.log_level))?;
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut manager = match &cli.config {
        Some(path) => ConfigManager::load_with_path(path)?,
        None => ConfigManager::load()?,
    };

    match cli.command {
        Commands::Simulate {
            silos,
            kill,
            transport,
        } => {
            let config = manager.config();
            let mut settings = config.simulation.clone();
            if let Some(silos) = silos {
                settings.silos = silos;
            }
            if let Some(transport) = transport {
                settings.transport = transport;
            }
            info!(config = %manager.path().display(), "running simulation");
            let report = run_simulation(&config.membership, &settings, kill).await?;
            print_report(&report);
        }
        Commands::Config { action } => match action {
            ConfigAction::Get { key } => {
                let value = manager
                    .get(&key)
                    .ok_or_else(|| anyhow!("unknown configuration key: {key}"))?;
                println!("{value}");
            }
            ConfigAction::Set { key, value } => {
                manager.set(&key, &value)?;
                manager.save()?;
                println!("{key} = {value}");
            }
            ConfigAction::List { section } => {
                print!("{}", manager.render_section(section.as_deref())?);
            }
            ConfigAction::Path => {
                println!("{}", manager.path().display());
            }
        },
    }

    Ok(())
}

fn print_report(report: &SimulationReport) {
    println!();
    println!("Transport:        {:?}", report.transport);
    println!("Killed silo:      {}", report.victim);
    println!("Declared dead in: {:.2?}", report.detection_time);
    println!("Table version:    {}", report.table_version);
    println!("Survivors:");
    for silo in &report.survivors {
        println!("  {silo}");
    }
    println!("Gateways:");
    for gateway in &report.gateways {
        println!("  {} -> {}", gateway.silo, gateway.endpoint);
    }
}
