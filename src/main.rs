use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use broker::auth::{Scope, TokenIssuer};
use broker::vault::crypto::{key_fit, KeyFit};
use broker::{api, cli, config, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| "info,broker=debug".into()),
    );
    let json = std::env::var("LOG_FORMAT").map(|v| v == "json").unwrap_or(false);
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    let cfg = config::load()?;
    let args = cli::Cli::parse();

    let result = match args.command {
        Some(cli::Commands::Serve { port }) => {
            let port = port.unwrap_or(cfg.port);
            run_server(cfg, port).await
        }
        Some(cli::Commands::Token { command }) => handle_token_command(&cfg, command),
        Some(cli::Commands::Key { command }) => handle_key_command(&cfg, command),
        None => {
            let port = cfg.port;
            run_server(cfg, port).await
        }
    };

    if let Err(ref e) = result {
        eprintln!("Error: {:?}", e);
    }
    result
}

async fn run_server(cfg: config::Config, port: u16) -> anyhow::Result<()> {
    let state = Arc::new(AppState::from_config(cfg).await.context("initializing broker state")?);
    let providers = state.registry.provider_names().await;
    tracing::info!(providers = ?providers, "tool providers ready");

    let app = api::router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    tracing::info!("credential broker listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {}", e);
    }
    tracing::info!("shutdown signal received");
}

fn handle_token_command(cfg: &config::Config, command: cli::TokenCommands) -> anyhow::Result<()> {
    let issuer = TokenIssuer::new(&cfg.jwt_secret, cfg.session_token_ttl_secs, cfg.session_token_max_ttl_secs);
    match command {
        cli::TokenCommands::Issue {
            user,
            conversation,
            sandbox,
            scope,
            ttl,
        } => {
            let scopes = scope
                .iter()
                .map(|s| Scope::parse(s).ok_or_else(|| anyhow::anyhow!("unknown scope: {}", s)))
                .collect::<anyhow::Result<Vec<_>>>()?;
            let ttl = ttl.unwrap_or_else(|| issuer.default_ttl_secs());
            let token = issuer.issue_with_ttl(&user, &conversation, &sandbox, &scopes, ttl)?;
            println!("{}", token);
        }
        cli::TokenCommands::Inspect { token } => {
            let claims = issuer.validate(&token)?;
            println!("{}", serde_json::to_string_pretty(&claims)?);
        }
    }
    Ok(())
}

fn handle_key_command(cfg: &config::Config, command: cli::KeyCommands) -> anyhow::Result<()> {
    match command {
        cli::KeyCommands::Check => match key_fit(cfg.encryption_key.as_bytes()) {
            KeyFit::Exact => println!("ENCRYPTION_KEY is exactly 32 bytes"),
            KeyFit::Padded { missing } => {
                println!("ENCRYPTION_KEY is short: zero-padded with {} bytes", missing)
            }
            KeyFit::Truncated { dropped } => {
                println!("ENCRYPTION_KEY is long: {} trailing bytes are ignored", dropped)
            }
        },
    }
    Ok(())
}
