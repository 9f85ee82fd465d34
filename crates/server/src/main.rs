use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use debridfs_core::{
    load_or_create, validate_config, ContentSource, DebridClient, Engine, EngineSettings,
    HttpContentSource, RealDebridClient,
};
use debridfs_server::{api::create_router, state::AppState};

/// Environment variable naming the config directory or file.
const CONFIG_ENV: &str = "DEBRIDFS_CONFIG";

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        // Logging may not be initialized yet if the config failed to load.
        eprintln!("Fatal error: {:#}", e);
        error!("Fatal error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    // Determine config location
    let config_path = std::env::var(CONFIG_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config"));

    // Load configuration before logging so its level can seed the filter
    let config = load_or_create(&config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("{},tower_http=info", config.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Configuration loaded from {:?}", config.json_file());

    // Validate configuration
    validate_config(&config).context("Configuration validation failed")?;

    // Create provider clients
    let settings = EngineSettings::resolve(&config).context("Failed to resolve settings")?;
    let mut clients: Vec<Arc<dyn DebridClient>> = Vec::with_capacity(settings.providers.len());
    for provider in &settings.providers {
        let client = RealDebridClient::new(provider)
            .with_context(|| format!("Failed to create client for {}", provider.name))?;
        info!("Initialized provider {}", provider.name);
        clients.push(Arc::new(client));
    }
    let content: Arc<dyn ContentSource> =
        Arc::new(HttpContentSource::new().context("Failed to create content source")?);

    // Create and start the engine
    let addr: SocketAddr = format!("{}:{}", config.bind_address, config.port)
        .parse()
        .with_context(|| format!("Invalid bind address {}", config.bind_address))?;
    let engine = Arc::new(Engine::new(config, clients, content).context("Failed to create engine")?);
    engine.start().await;
    info!("Engine started");

    // Create router
    let state = Arc::new(AppState::new(Arc::clone(&engine)));
    let app = create_router(state);

    // Start server
    info!("Starting server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    // Run server with graceful shutdown
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error");

    info!("Stopping engine...");
    engine.stop().await;
    info!("Engine stopped");

    served
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
