//! Support Gateway - agent chat proxy with a shared access-token cache

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use support_gateway::{
    chat::ChatService,
    cli::{Cli, Command},
    config::Config,
    gateway::Gateway,
    setup_tracing,
    tickets::TicketSearch,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Setup tracing
    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let config = match Config::load(cli.config.as_deref()) {
        Ok(mut config) => {
            // Apply CLI overrides
            if let Some(port) = cli.port {
                config.server.port = port;
            }
            if let Some(ref host) = cli.host {
                config.server.host = host.clone();
            }
            config
        }
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Some(Command::Token) => run_token(&config).await,
        Some(Command::Tickets { format }) => run_tickets(&config, &format).await,
        Some(Command::Serve) | None => run_server(config).await,
    }
}

/// Fetch one token through the configured flow and report its expiry
async fn run_token(config: &Config) -> ExitCode {
    let chat = match ChatService::from_config(&config.agent) {
        Ok(chat) => chat,
        Err(e) => {
            eprintln!("❌ {e}");
            return ExitCode::FAILURE;
        }
    };

    let tokens = chat.tokens();
    match tokens.acquire_token().await {
        Ok(token) => {
            println!("✅ Token acquired ({} chars, {:?} flow)", token.len(), config.agent.token_flow);
            if let Some(remaining) = tokens.remaining() {
                println!(
                    "   Valid for {}s (safety margin {}s)",
                    remaining.as_secs(),
                    config.agent.safety_margin.as_secs()
                );
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("❌ Token fetch failed: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Query the search backend once
async fn run_tickets(config: &Config, format: &str) -> ExitCode {
    let search = match TicketSearch::from_config(&config.search) {
        Ok(search) => search,
        Err(e) => {
            eprintln!("❌ {e}");
            return ExitCode::FAILURE;
        }
    };

    match search.counts().await {
        Ok(counts) => {
            if format == "json" {
                match serde_json::to_string_pretty(&counts) {
                    Ok(json) => println!("{json}"),
                    Err(e) => {
                        eprintln!("❌ Failed to serialize to JSON: {e}");
                        return ExitCode::FAILURE;
                    }
                }
            } else {
                println!("Open:     {}", counts.open_tickets);
                println!("Resolved: {}", counts.resolved_tickets);
                println!("Total:    {}", counts.total_tickets);
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("❌ Ticket query failed: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Run the gateway server
async fn run_server(config: Config) -> ExitCode {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        tickets = config.search.is_configured(),
        "Starting Support Gateway"
    );

    let gateway = match Gateway::new(config) {
        Ok(g) => g,
        Err(e) => {
            error!("Failed to create gateway: {e}");
            return ExitCode::FAILURE;
        }
    };

    // Run with graceful shutdown
    if let Err(e) = gateway.run().await {
        error!("Gateway error: {e}");
        return ExitCode::FAILURE;
    }

    info!("Gateway shutdown complete");
    ExitCode::SUCCESS
}
