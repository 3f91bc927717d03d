use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use huddle_server::chat::Dispatcher;
use huddle_server::config::{generate_config_template, Config};
use huddle_server::store::{Authenticator, MembershipLookup, MemoryStore, MessageStore, SqliteStore};
use huddle_server::ws::{ConnectionRegistry, ScopeIndex};
use huddle_server::{routes, state};

struct Stores {
    messages: Arc<dyn MessageStore>,
    membership: Arc<dyn MembershipLookup>,
    auth: Arc<dyn Authenticator>,
}

fn open_stores(config: &Config) -> Result<Stores, Box<dyn std::error::Error>> {
    match &config.database {
        Some(path) => {
            let store = Arc::new(SqliteStore::open(path)?);
            Ok(Stores {
                messages: store.clone(),
                membership: store.clone(),
                auth: store,
            })
        }
        None => {
            let store = Arc::new(MemoryStore::demo());
            tracing::warn!("No database configured, using in-memory demo store");
            for (token, user_id) in store.tokens() {
                tracing::info!(user_id = user_id, token = %token, "Demo login token");
            }
            Ok(Stores {
                messages: store.clone(),
                membership: store.clone(),
                auth: store,
            })
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load config with layered precedence: defaults < TOML < env < CLI
    let config = Config::load()?;

    if config.generate_config {
        print!("{}", generate_config_template());
        return Ok(());
    }

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new("huddle_server=info,tower_http=info"))?;
    if config.json_logs {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().pretty().with_env_filter(filter).init();
    }

    tracing::info!("Huddle server v{} starting", env!("CARGO_PKG_VERSION"));

    let stores = open_stores(&config)?;
    let realtime = config.realtime();

    let (registry, intake) = ConnectionRegistry::new(
        realtime.session_settings(),
        realtime.intake_capacity,
        ScopeIndex::new(),
    );

    let shutdown = CancellationToken::new();
    let dispatcher = Dispatcher::new(registry.clone(), stores.messages);
    let dispatcher_task = tokio::spawn(dispatcher.run(intake, shutdown.clone()));

    let app_state = state::AppState {
        registry: registry.clone(),
        membership: stores.membership,
        auth: stores.auth,
    };
    let app = routes::build_router(app_state);

    let addr = format!("{}:{}", config.bind_address, config.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    let shutdown_registry = registry.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
            tracing::info!("Shutdown signal received");
            // Upgraded sockets are not drained by axum; close them here.
            shutdown_registry.close_all().await;
        })
        .await?;

    shutdown.cancel();
    dispatcher_task.await?;

    tracing::info!("Huddle server stopped");
    Ok(())
}
