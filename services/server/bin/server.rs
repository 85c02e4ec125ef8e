//! Main Entrypoint for the Relay Server
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment.
//! 2. Initializing the backend client, if a credential is configured.
//! 3. Constructing the Axum router and the shared rate limiter.
//! 4. Serving `wss` when TLS material is present, plain `ws` otherwise.
//! 5. Handling graceful shutdown.

use anyhow::Context;
use relay_core::llm_client::{LLMClient, OpenAICompatibleClient};
use relay_server::{
    config::Config,
    router::create_router,
    state::AppState,
    tls::{PeerAddr, TlsListener, load_tls_acceptor},
};
use secrecy::ExposeSecret;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Listens for the `Ctrl+C` signal to gracefully shut down the server.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to install Ctrl+C handler.");
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal. Shutting down gracefully...");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- 1. Load Configuration ---
    let config = Config::from_env().context("Failed to load configuration")?;

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();
    info!("Configuration loaded. Initializing application state...");

    if config.server_token.is_none() {
        warn!("MCP_SERVER_TOKEN is not set. Clients will not be authenticated.");
    }

    // --- 3. Initialize the Backend ---
    let llm_client: Option<Arc<dyn LLMClient>> = match &config.gemini_api_key {
        Some(api_key) => {
            info!(model = %config.gemini_model, "Using Gemini backend.");
            Some(Arc::new(OpenAICompatibleClient::gemini(
                api_key.expose_secret(),
                &config.gemini_api_base,
                config.gemini_model.clone(),
            )))
        }
        None => {
            warn!("GEMINI_API_KEY is not set. Prompts will be answered with an error.");
            None
        }
    };

    let tls_acceptor = load_tls_acceptor(&config.tls_cert_path, &config.tls_key_path)
        .context("Failed to load TLS certificate or key")?;
    let bind_address = config.bind_address;
    let sweep_every = config.rate_limit_window;

    let app_state = Arc::new(AppState::new(config, llm_client));
    let _sweeper = app_state.spawn_limiter_sweeper(sweep_every);

    // --- 4. Create Router ---
    let app = create_router(app_state).into_make_service_with_connect_info::<PeerAddr>();

    // --- 5. Start Server ---
    let listener = tokio::net::TcpListener::bind(bind_address)
        .await
        .with_context(|| format!("Failed to bind {bind_address}"))?;

    match tls_acceptor {
        Some(acceptor) => {
            info!(%bind_address, "Serving secure WebSocket (wss).");
            let listener = TlsListener::new(listener, acceptor)?;
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown_signal())
                .await?;
        }
        None => {
            warn!(%bind_address, "TLS certificate or key not found. Serving plaintext WebSocket (ws).");
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown_signal())
                .await?;
        }
    }

    info!("Server has shut down.");
    Ok(())
}
