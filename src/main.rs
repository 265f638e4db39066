//! tsidp - tailnet-backed OpenID Connect identity provider

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::error;

use tsidp::cli::Cli;
use tsidp::config::Config;
use tsidp::identity::LocalApiResolver;
use tsidp::server::{self, IdpServer};
use tsidp::setup_tracing;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => cli.apply(config),
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = config.validate() {
        error!(error = %e, "Invalid configuration");
        return ExitCode::FAILURE;
    }

    let resolver = match LocalApiResolver::new(&config.local_api_url, config.whois_timeout) {
        Ok(resolver) => Arc::new(resolver),
        Err(e) => {
            error!(error = %e, "Failed to create whois client");
            return ExitCode::FAILURE;
        }
    };

    let state = match IdpServer::new(config, resolver) {
        Ok(server) => Arc::new(server),
        Err(e) => {
            error!(error = %e, "Failed to initialize server");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = server::run(state).await {
        error!(error = %e, "Server failed");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
