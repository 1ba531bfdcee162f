/**
 * TOOLCRIB KERNEL - Bibliothèque du serveur
 *
 * RÔLE : router HTTP, config, health et relais MQTT, réutilisés par le
 * binaire et par les tests (agent + tests d'intégration).
 */

pub mod admin_api;
pub mod config;
pub mod events;
pub mod health;
pub mod http;
pub mod state;

pub use config::KernelConfig;
pub use health::HealthTracker;
pub use http::{build_router, AppState};
