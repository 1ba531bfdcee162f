/*!
Test Harness Toolcrib

- Logs de test (env_logger)
- Répertoire temporaire détruit en fin de test
- Lancement d'un router axum sur un port éphémère
- Sink MQTT mock partagé
*/

use crate::mqtt_stub::MockMqttClient;
use anyhow::{Context, Result};
use axum::Router;
use std::net::SocketAddr;
use std::path::PathBuf;
use tempfile::TempDir;

pub struct TestHarness {
    pub mqtt_client: MockMqttClient,
    temp_dir: TempDir,
}

impl TestHarness {
    pub fn new() -> Result<Self> {
        env_logger::try_init().ok(); // Init logging pour tests
        Ok(Self {
            mqtt_client: MockMqttClient::new(),
            temp_dir: TempDir::new().context("failed to create temp dir")?,
        })
    }

    /// Chemin dans le répertoire temporaire du test
    pub fn path(&self, name: &str) -> PathBuf {
        self.temp_dir.path().join(name)
    }

    /// Sert `router` sur 127.0.0.1:0 en tâche de fond, renvoie l'adresse
    pub async fn spawn_router(&self, router: Router) -> Result<SocketAddr> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .context("bind ephemeral port")?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router).await {
                log::error!("test server stopped: {}", e);
            }
        });
        log::info!("🚀 test server on http://{}", addr);
        Ok(addr)
    }

    pub fn base_url(addr: SocketAddr) -> String {
        format!("http://{}", addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;

    #[tokio::test]
    async fn test_spawned_router_answers() {
        let harness = TestHarness::new().unwrap();
        let addr = harness
            .spawn_router(Router::new().route("/ping", get(|| async { "pong" })))
            .await
            .unwrap();

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        stream
            .write_all(b"GET /ping HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.ends_with("pong"));
        assert!(harness.path("x.json").is_absolute());
    }
}
