/**
 * TOOLCRIB KERNEL - Point d'entrée du serveur
 *
 * RÔLE : bootstrap complet : .env, logs, config, store sur disque,
 * relais MQTT optionnel, API HTTP.
 *
 * UTILITÉ : source de vérité du stock d'outils, les agents y poussent et
 * tirent le snapshot.
 */

use anyhow::Context;
use std::sync::Arc;
use tokio::net::TcpListener;
use toolcrib_core::{JsonFileBackend, Store};
use toolcrib_kernel::config::{api_key_from_env, load_config};
use toolcrib_kernel::events::{connect_mqtt, spawn_change_forwarder};
use toolcrib_kernel::{build_router, AppState, HealthTracker};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Charger les variables d'environnement depuis .env (si présent)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = load_config().await;

    let backend = JsonFileBackend::new(&cfg.data_file);
    let store = Store::open(Box::new(backend), cfg.store_options())
        .with_context(|| format!("failed to open store at {}", cfg.data_file.display()))?;
    let store = Arc::new(store);
    info!("[kernel] store prêt (révision {})", store.revision());

    let health_tracker = HealthTracker::new();

    // MQTT optionnel : relaie chaque sauvegarde
    match &cfg.mqtt {
        Some(mqtt) => {
            let sink = connect_mqtt(mqtt, health_tracker.clone());
            spawn_change_forwarder(store.subscribe(), sink);
        }
        None => info!("[kernel] MQTT non configuré, pas de notifications"),
    }

    let api_key = api_key_from_env();
    if api_key.is_none() {
        warn!("[kernel] TOOLCRIB_API_KEY non défini, API ouverte");
    }

    let app = build_router(AppState::new(store, health_tracker, api_key));

    let listener = TcpListener::bind(&cfg.listen)
        .await
        .with_context(|| format!("failed to bind {}", cfg.listen))?;
    info!("[kernel] listening on http://{}", cfg.listen);
    axum::serve(listener, app).await.context("HTTP server failed")?;
    Ok(())
}
