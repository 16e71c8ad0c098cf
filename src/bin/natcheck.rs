//! natgate-check: CLI tool for validating a NAT handler config and
//! resolving sample destinations against it.

use clap::{Parser, Subcommand};
use natgate::config::Config;
use natgate::endpoint::{Endpoint, Network};
use natgate::rule_engine::RuleEngine;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "natgate-check")]
#[command(version = "0.1.0")]
#[command(about = "Validate a NAT handler config and resolve sample destinations", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a config file
    Validate {
        /// Path to the JSON config file
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Resolve a destination (host:port/network) against a config file
    Resolve {
        /// Path to the JSON config file
        #[arg(short, long)]
        config: PathBuf,

        /// Destination in host:port form
        #[arg(short, long)]
        dest: String,

        /// Transport network: tcp or udp
        #[arg(short, long, default_value = "tcp")]
        network: String,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Validate { config } => validate(&config),
        Commands::Resolve {
            config,
            dest,
            network,
        } => resolve(&config, &dest, &network),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn load_config(path: &PathBuf) -> Result<Config, Box<dyn std::error::Error>> {
    let data = fs::read_to_string(path)?;
    Ok(Config::from_json(&data)?)
}

fn validate(path: &PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(path)?;
    println!(
        "config ok: site={} ranges={} rules={} effectiveMaxSessions={}",
        config.site_id,
        config.virtual_ranges.len(),
        config.rules.len(),
        config.limits.effective_max_sessions()
    );
    Ok(())
}

fn resolve(
    path: &PathBuf,
    dest: &str,
    network: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(path)?;
    let (host, port) = dest
        .rsplit_once(':')
        .ok_or("destination must be host:port")?;
    let address = host.parse()?;
    let port: u16 = port.parse()?;
    let network = Network::parse(network).ok_or("network must be tcp or udp")?;
    let endpoint = Endpoint::new(address, port, network);

    let engine = RuleEngine::new(Arc::new(config));
    match engine.resolve(&endpoint) {
        Some(rule) => println!(
            "matched rule={} realDestination={}",
            rule.rule_id, rule.real_destination
        ),
        None => println!("no match: flow passes through untranslated"),
    }
    Ok(())
}
