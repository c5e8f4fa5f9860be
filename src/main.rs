mod auth;
mod config;
mod routes;
mod state;
mod store;
mod ws;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;

use config::{generate_config_template, Config};
use store::{ChatMembership, MemoryChatDirectory, MemoryPresence, PresenceStore};
use ws::hub::Hub;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load config with layered precedence: defaults < TOML < env < CLI
    let config = Config::load()?;

    // Handle --generate-config: print template and exit
    if config.generate_config {
        print!("{}", generate_config_template());
        return Ok(());
    }

    // Initialize tracing/logging
    if config.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "messenger_server=info".parse().unwrap()),
            )
            .init();
    } else {
        tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "messenger_server=info".parse().unwrap()),
            )
            .init();
    }

    tracing::info!("messenger server v{} starting", env!("CARGO_PKG_VERSION"));

    // Load or generate JWT signing key (256-bit random, stored in data_dir)
    let jwt_secret = auth::load_or_generate_jwt_secret(&config.data_dir)?;

    // Collaborator stores. In-memory defaults; a deployment backed by a
    // relational store swaps these behind the same traits.
    let presence: Arc<dyn PresenceStore> = Arc::new(MemoryPresence::new());
    let membership: Arc<dyn ChatMembership> = Arc::new(MemoryChatDirectory::new());

    // The hub spawns its own control loop and lives for the process lifetime
    let hub = Hub::new(presence, membership);

    let app_state = state::AppState {
        hub,
        auth: Arc::new(auth::JwtAuthenticator::new(&jwt_secret)),
    };

    // Build router
    let app = routes::build_router(app_state);

    // Bind and serve
    let addr = format!("{}:{}", config.bind_address, config.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
