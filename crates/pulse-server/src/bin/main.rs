//! Pulse server executable

use clap::{Arg, Command};
use pulse_common::{Config, Error};
use pulse_server::{Platform, Server};
use std::path::Path;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const EXIT_CONFIG: i32 = 1;
const EXIT_STORE: i32 = 2;

#[tokio::main]
async fn main() {
    let matches = Command::new("pulse-server")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Pulse - social sentiment pipeline platform")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .required(false),
        )
        .arg(
            Arg::new("bind")
                .short('b')
                .long("bind")
                .value_name("ADDRESS")
                .help("Bind address, overriding the configuration")
                .required(false),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable verbose logging")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches();

    init_tracing(matches.get_flag("verbose"));

    let config_path = matches.get_one::<String>("config").map(Path::new);
    let config = match Config::load(config_path) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "configuration error");
            std::process::exit(EXIT_CONFIG);
        }
    };

    let bind_addr = matches
        .get_one::<String>("bind")
        .cloned()
        .unwrap_or_else(|| format!("{}:{}", config.server.bind_address, config.server.port));

    info!(version = env!("CARGO_PKG_VERSION"), "starting pulse");

    let platform = match Platform::from_config(config).await {
        Ok(platform) => platform,
        Err(e) => {
            error!(error = %e, "platform initialization failed");
            let code = match e {
                Error::Store(_) => EXIT_STORE,
                _ => EXIT_CONFIG,
            };
            std::process::exit(code);
        }
    };

    // graceful shutdown on ctrl-c
    {
        let platform = platform.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
                platform.shutdown().await;
                std::process::exit(0);
            }
        });
    }

    let server = Server::new(platform);
    if let Err(e) = server.run(&bind_addr).await {
        error!(error = %e, "server terminated");
        std::process::exit(EXIT_CONFIG);
    }
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose {
        "pulse_server=debug,pulse_orchestrator=debug,pulse_inference=debug,pulse_source=debug,pulse_store=debug,info"
    } else {
        "pulse_server=info,pulse_orchestrator=info,pulse_inference=info,info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
