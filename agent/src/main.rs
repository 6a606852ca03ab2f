//! Stockroom Agent - offline-first inventory sync with a local control API.

use std::sync::Arc;

use stockroom_agent::auth::{SessionAuth, User};
use stockroom_agent::config::Config;
use stockroom_agent::context::SyncContext;
use stockroom_agent::remote::{FirestoreStore, SharedRemoteStore};
use stockroom_agent::{app, storage, AppState};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stockroom_agent=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    tracing::info!("Starting Stockroom Agent on {}:{}", config.host, config.port);

    // Open the durable store (runs migrations for SQLite)
    let storage = storage::open(&config.storage_url).await?;

    let remote: Option<SharedRemoteStore> = match (config.remote_enabled, &config.firestore_project_id) {
        (true, Some(project)) => {
            tracing::info!(project = %project, "Remote store enabled");
            Some(Arc::new(FirestoreStore::new(
                project,
                config.firestore_id_token.clone(),
                config.sync.remote_timeout,
            )))
        }
        _ => {
            tracing::info!("Remote store disabled, running local-only");
            None
        }
    };

    let user = config.owner_id.clone().map(|id| {
        let user = User::new(id);
        match config.owner_email.clone() {
            Some(email) => user.with_email(email),
            None => user,
        }
    });
    if user.is_none() {
        tracing::warn!("OWNER_ID not set, sync stays idle until a user signs in");
    }
    let auth = Arc::new(SessionAuth::new(user));

    let ctx = Arc::new(SyncContext::new(storage, remote, auth, config.sync.clone()));
    let scheduler = ctx.spawn_scheduler();

    let state = AppState {
        ctx,
        config: Arc::new(config.clone()),
    };

    // Start server
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Control API listening on {}", addr);

    axum::serve(listener, app(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    if let Some(scheduler) = scheduler {
        scheduler.shutdown().await;
    }
    Ok(())
}
