use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod cli;

use devicelock::config::{self, Config, LogFormat, StoreBackend};
use devicelock::store::memory::MemoryStore;
use devicelock::store::postgres::PgStore;
use devicelock::store::TokenStore;
use devicelock::tokens::expiration::ExpirationInput;
use devicelock::tokens::issuance::IssueRequest;
use devicelock::tokens::validator::ValidationOutcome;
use devicelock::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = cli::Cli::parse();
    let mut cfg = config::load()?;
    init_tracing(cfg.log_format)?;

    if cfg.uses_placeholder_key() {
        tracing::warn!(
            "DEVICELOCK_MASTER_KEY is not set; using an ephemeral key. \
             Tokens issued now cannot be revealed after a restart."
        );
        cfg.master_key = devicelock::vault::crypto::generate_master_key();
    }

    let result = match args.command {
        Some(cli::Commands::Serve { port }) => run_server(cfg, port).await,
        Some(cli::Commands::Token { command }) => {
            let store = connect_store(&cfg).await?;
            let state = AppState::new(cfg, store)?;
            handle_token_command(command, &state).await
        }
        None => run_server(cfg, None).await,
    };

    if let Err(ref e) = result {
        eprintln!("Error: {:?}", e);
    }
    result
}

fn init_tracing(format: LogFormat) -> anyhow::Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_sdk::{trace as sdktrace, Resource};

    // OTLP export only when an endpoint is configured.
    let telemetry_layer = if std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok() {
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(opentelemetry_otlp::new_exporter().tonic())
            .with_trace_config(sdktrace::config().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "devicelock"),
            ])))
            .install_batch(opentelemetry_sdk::runtime::Tokio)
            .context("failed to install OpenTelemetry tracer")?;
        Some(tracing_opentelemetry::layer().with_tracer(tracer))
    } else {
        None
    };

    let (json_layer, pretty_layer) = match format {
        LogFormat::Json => (Some(tracing_subscriber::fmt::layer().json()), None),
        LogFormat::Pretty => (None, Some(tracing_subscriber::fmt::layer())),
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "devicelock=debug,tower_http=debug".into()),
        ))
        .with(json_layer)
        .with(pretty_layer)
        .with(telemetry_layer)
        .init();

    Ok(())
}

async fn connect_store(cfg: &Config) -> anyhow::Result<Arc<dyn TokenStore>> {
    match cfg.store_backend {
        StoreBackend::Postgres => {
            tracing::info!("Connecting to database...");
            let db = PgStore::connect(&cfg.database_url, cfg.db_max_connections, cfg.tx_timeout())
                .await?;

            tracing::info!("Running migrations...");
            db.migrate().await?;
            Ok(Arc::new(db))
        }
        StoreBackend::Memory => {
            tracing::warn!("Using the in-memory store; tokens are lost on exit");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

async fn run_server(cfg: Config, port: Option<u16>) -> anyhow::Result<()> {
    let port = port.unwrap_or(cfg.port);
    let store = connect_store(&cfg).await?;
    let state = Arc::new(AppState::new(cfg, store)?);

    let app = devicelock::api::app(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("devicelock listening on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("devicelock stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

async fn handle_token_command(cmd: cli::TokenCommands, state: &AppState) -> anyhow::Result<()> {
    match cmd {
        cli::TokenCommands::Issue {
            owner,
            custom_token,
            expiration,
        } => {
            let issued = state
                .issuer
                .issue(IssueRequest {
                    owner: Some(owner),
                    custom_token,
                    expiration: expiration.map(ExpirationInput::Text),
                })
                .await?;

            let expires = issued
                .expires_at
                .map(|t| t.format("%d-%m-%Y %H:%M UTC").to_string())
                .unwrap_or_else(|| "never".into());
            println!(
                "Token issued:\n  Token:   {}\n  Owner:   {}\n  Expires: {}\n  ID:      {}",
                issued.token, issued.owner, expires, issued.id
            );
        }
        cli::TokenCommands::Validate { token, device_id } => {
            match state.validator.validate(&token, device_id.as_deref()).await? {
                ValidationOutcome::Granted(grant) => {
                    println!(
                        "Access granted:\n  Owner:  {}\n  Device: {}\n  First binding: {}",
                        grant.owner,
                        grant.bound_device_id.as_deref().unwrap_or("-"),
                        grant.first_binding
                    );
                }
                ValidationOutcome::NotFound => println!("Token not found."),
                ValidationOutcome::Expired => println!("Token has expired."),
                ValidationOutcome::DeviceConflict => {
                    println!("Token is already registered to another device.")
                }
            }
        }
        cli::TokenCommands::List { owner } => {
            let tokens = state.store.list_by_owner(&owner).await?;
            if tokens.is_empty() {
                println!("No tokens found.");
            } else {
                println!(
                    "{:<38} {:<24} {:<18} {:<18}",
                    "ID", "DEVICE", "EXPIRES", "LAST USED"
                );
                for t in tokens {
                    println!(
                        "{:<38} {:<24} {:<18} {:<18}",
                        t.id,
                        t.bound_device_id.as_deref().unwrap_or("-"),
                        t.expires_at
                            .map(|d| d.format("%Y-%m-%d %H:%M").to_string())
                            .unwrap_or_else(|| "never".into()),
                        t.last_used_at
                            .map(|d| d.format("%Y-%m-%d %H:%M").to_string())
                            .unwrap_or_else(|| "-".into()),
                    );
                }
            }
        }
        cli::TokenCommands::Reveal { id } => {
            let id = uuid::Uuid::parse_str(&id).context("Invalid token ID")?;
            let record = state
                .store
                .find_by_id(id)
                .await?
                .ok_or_else(|| anyhow::anyhow!("Token not found: {}", id))?;
            let plaintext = state
                .crypto
                .decrypt(&record.encrypted_value, &record.encryption_nonce)
                .context("stored token could not be decrypted with the configured key")?;
            println!("{}", plaintext);
        }
    }
    Ok(())
}
