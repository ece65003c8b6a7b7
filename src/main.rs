use std::sync::{Arc, Mutex};

use axum::routing::{get, post};
use axum::Router;
use chrono::{Duration, Utc};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use servicebook::config::AppConfig;
use servicebook::db;
use servicebook::handlers;
use servicebook::models::Catalog;
use servicebook::services::ai::ollama::OllamaProvider;
use servicebook::services::messaging::twilio::TwilioWhatsAppProvider;
use servicebook::state::AppState;
use servicebook::store::SqliteStore;

static DEFAULT_CATALOG: &str = include_str!("../data/catalog.json");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = AppConfig::from_env();

    let conn = db::init_db(&config.database_url)?;

    let catalog = match std::fs::read_to_string(&config.catalog_path) {
        Ok(raw) => Catalog::from_json(&raw)?,
        Err(e) => {
            tracing::warn!(path = %config.catalog_path, error = %e, "catalog file unavailable, using built-in catalog");
            Catalog::from_json(DEFAULT_CATALOG)?
        }
    };
    tracing::info!(cities = catalog.cities.len(), "catalog loaded");

    tracing::info!("using Ollama LLM provider (url: {})", config.ollama_url);
    let llm = OllamaProvider::new(config.ollama_url.clone(), config.ollama_model.clone());
    let messaging = TwilioWhatsAppProvider::new(
        config.twilio_account_sid.clone(),
        config.twilio_auth_token.clone(),
        config.twilio_whatsapp_number.clone(),
    );
    let store = Arc::new(SqliteStore::new(Arc::new(Mutex::new(conn))));

    let state = Arc::new(AppState::new(
        config.clone(),
        store,
        catalog,
        Box::new(llm),
        Box::new(messaging),
    ));

    // Periodic purge of idle conversations.
    {
        let state = state.clone();
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(std::time::Duration::from_secs(state.config.sweep_interval_secs));
            ticker.tick().await; // first tick fires immediately, skip it
            loop {
                ticker.tick().await;
                let cutoff = Utc::now().naive_utc() - Duration::days(state.config.context_ttl_days);
                match state.store.sweep(cutoff) {
                    Ok(purged) if purged > 0 => {
                        tracing::info!(purged, "swept idle conversations")
                    }
                    Ok(_) => {}
                    Err(e) => tracing::error!(error = %e, "context sweep failed"),
                }
                let stale_locks = state.prune_user_locks();
                if stale_locks > 0 {
                    tracing::debug!(stale_locks, "pruned idle user locks");
                }
            }
        });
    }

    let app = Router::new()
        .route("/health", get(handlers::health::health))
        .route("/webhook/whatsapp", post(handlers::webhook::whatsapp_webhook))
        .route("/api/chat", post(handlers::chat::chat))
        .route("/api/context/:user_id", get(handlers::chat::get_context))
        .route(
            "/api/context/:user_id/reset",
            post(handlers::chat::reset_context),
        )
        .route("/api/admin/cleanup", post(handlers::admin::cleanup))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = format!("0.0.0.0:{}", config.port);
    tracing::info!("starting server on {addr}");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
