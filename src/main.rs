//! Verigate - identity and access-control core
//!
//! Verifies bearer credentials, resolves principals and enforces role and
//! permission requirements for the document verification service.

use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};

use verigate::{
    cli::{Cli, Command},
    config::Config,
    identity::PrincipalId,
    server::{Backends, Server},
    setup_tracing,
    token::LocalTokenIssuer,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    match cli.command {
        Some(Command::IssueToken { principal, ttl }) => run_issue_token(&cli, principal, ttl),
        Some(Command::CheckConfig) => run_check_config(&cli),
        Some(Command::Serve) | None => run_server(&cli).await,
    }
}

fn load_config(cli: &Cli) -> Result<Config, ExitCode> {
    Config::load(cli.config.as_deref()).map_err(|e| {
        error!("Failed to load configuration: {e}");
        ExitCode::from(e.exit_code())
    })
}

/// Print a token for operator and development use.
fn run_issue_token(cli: &Cli, principal: u64, ttl: Option<Duration>) -> ExitCode {
    let config = match load_config(cli) {
        Ok(config) => config,
        Err(code) => return code,
    };

    let issued = LocalTokenIssuer::from_config(&config.local)
        .and_then(|issuer| issuer.issue(PrincipalId(principal), ttl));

    match issued {
        Ok(issued) => {
            match serde_json::to_string_pretty(&issued) {
                Ok(json) => println!("{json}"),
                Err(_) => println!("{}", issued.token),
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("❌ Failed to issue token: {e}");
            ExitCode::from(e.exit_code())
        }
    }
}

fn run_check_config(cli: &Cli) -> ExitCode {
    let config = match load_config(cli) {
        Ok(config) => config,
        Err(code) => return code,
    };

    println!("✅ Configuration is valid\n");
    println!("Server:       {}:{}", config.server.host, config.server.port);
    println!(
        "Local tokens: {} (issuer {}, audience {})",
        if config.local.resolve_secret().is_some() { "enabled" } else { "disabled" },
        config.local.issuer,
        config.local.audience
    );
    println!("Providers:    {}", config.providers.len());
    for provider in &config.providers {
        println!(
            "  • {} issuer={} algorithms={}",
            provider.name,
            provider.issuer,
            provider.algorithms.join(",")
        );
        println!("    jwks: {}", provider.jwks_uri());
    }
    println!("Session TTL:  {:?}", config.sessions.ttl);
    println!(
        "Roles:        {}",
        config
            .permissions
            .roles
            .iter()
            .map(|(role, level)| format!("{role}={level}"))
            .collect::<Vec<_>>()
            .join(", ")
    );
    println!("Default role: {}", config.permissions.default_role);

    ExitCode::SUCCESS
}

async fn run_server(cli: &Cli) -> ExitCode {
    let mut config = match load_config(cli) {
        Ok(config) => config,
        Err(code) => return code,
    };
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(host) = &cli.host {
        config.server.host.clone_from(host);
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        providers = config.providers.len(),
        "Starting verigate"
    );

    let backends = Backends::in_memory(&config);
    let server = match Server::new(config, backends) {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to create server: {e}");
            return ExitCode::from(e.exit_code());
        }
    };

    if let Err(e) = server.run().await {
        error!("Server error: {e}");
        return ExitCode::from(e.exit_code());
    }

    info!("Shutdown complete");
    ExitCode::SUCCESS
}
