use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, Router};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use axum::http::HeaderValue;

mod broker;
mod clock;
mod config;
mod db;
mod error;
mod protocol;
mod routes;
mod services;

use broker::QueueBroker;
use clock::Clock;
use config::Config;
use services::channels::{ChannelAdapter, InAppAdapter, MailAdapter, PushAdapter, SmsAdapter};
use services::dispatcher::NotificationDispatcher;
use services::external::{HttpDeviceTokenStore, HttpEntryStore, HttpUserDirectory};
use services::init;
use services::registry::ConnectionRegistry;
use services::sync::SyncEngine;
use services::templates::TemplateRenderer;

pub struct AppState {
    pub db: sqlx::SqlitePool,
    pub config: Config,
    pub registry: Arc<ConnectionRegistry>,
    pub broker: QueueBroker,
    pub sync: Arc<SyncEngine>,
    pub dispatcher: Arc<NotificationDispatcher>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "journal_realtime=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    tracing::info!("Starting journal realtime core");

    // Initialize database
    let pool = init::init_db(&config).await?;

    // Core components
    let clock = Arc::new(Clock::new());
    let registry = Arc::new(ConnectionRegistry::new());
    let renderer = Arc::new(TemplateRenderer::with_defaults());
    let broker = QueueBroker::new(pool.clone(), config.broker.clone());

    // Consumed external services
    let entries = Arc::new(HttpEntryStore::new(&config.upstream.entry_service_url));
    let directory = Arc::new(HttpUserDirectory::new(&config.upstream.user_directory_url));
    let device_tokens = Arc::new(HttpDeviceTokenStore::new(&config.upstream.device_token_url));

    // Channel adapters
    let adapters: Vec<Arc<dyn ChannelAdapter>> = vec![
        Arc::new(InAppAdapter::new(registry.clone(), renderer.clone())),
        Arc::new(MailAdapter::new(
            &config.providers.mail_url,
            &config.notifications.mail_from,
            Duration::from_secs(config.providers.mail_timeout_seconds),
            directory,
            renderer.clone(),
        )),
        Arc::new(PushAdapter::new(
            &config.providers.push_url,
            Duration::from_secs(config.providers.push_timeout_seconds),
            device_tokens,
            renderer.clone(),
        )),
        Arc::new(SmsAdapter::new(
            &config.providers.sms_url,
            Duration::from_secs(config.providers.sms_timeout_seconds),
            renderer.clone(),
        )),
    ];

    let dispatcher = Arc::new(NotificationDispatcher::new(
        pool.clone(),
        broker.clone(),
        registry.clone(),
        adapters,
    ));
    let sync = Arc::new(SyncEngine::new(
        pool.clone(),
        clock.clone(),
        registry.clone(),
        entries,
    ));

    let app_state = Arc::new(AppState {
        db: pool,
        config: config.clone(),
        registry,
        broker,
        sync,
        dispatcher,
    });

    // Spawn background workers with a shutdown broadcast channel
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);
    let worker_handles = init::spawn_background_workers(app_state.clone(), shutdown_tx.clone());

    // Build router
    let app = Router::new()
        // Health check
        .route("/health", get(routes::health::health_check))
        // Live transport upgrade
        .route(&config.server.live_session_path, get(routes::live::live_handler))
        // Notification log + dispatch entry points
        .nest("/api/notifications", routes::notifications::router())
        // Per-user delivery preferences
        .nest("/api/preferences", routes::preferences::router())
        // CRUD services publish accepted mutations here
        .nest("/internal", routes::changes::router())
        // Add shared state
        .with_state(app_state.clone())
        // Add middleware
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(
                    config
                        .server
                        .frontend_url
                        .parse::<HeaderValue>()
                        .expect("Invalid FRONTEND_URL for CORS"),
                )
                .allow_methods([
                    axum::http::Method::GET,
                    axum::http::Method::POST,
                    axum::http::Method::PUT,
                    axum::http::Method::OPTIONS,
                ])
                .allow_headers([
                    axum::http::header::CONTENT_TYPE,
                    axum::http::header::AUTHORIZATION,
                ]),
        );

    // Start server
    let addr = format!("{}:{}", config.server.host, config.server.port);
    tracing::info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;

    let graceful_state = app_state.clone();
    let graceful_tx = shutdown_tx.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("Shutdown signal received; closing sessions");
        graceful_state.registry.shutdown_all();
        let _ = graceful_tx.send(());
    })
    .await?;

    // Give workers a bounded window to drain before exit.
    let grace = Duration::from_secs(config.session.shutdown_grace_seconds);
    if tokio::time::timeout(grace, futures::future::join_all(worker_handles))
        .await
        .is_err()
    {
        tracing::warn!("Workers did not drain within the grace period");
    }

    Ok(())
}
