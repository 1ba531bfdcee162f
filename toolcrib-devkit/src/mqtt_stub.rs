/*!
Mock MQTT pour tests sans broker

Implémente `ChangeSink` : enregistre chaque publication au lieu de l'envoyer,
et peut simuler un broker en panne.
*/

use anyhow::Result;
use rumqttc::QoS;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use toolcrib_core::ChangeSink;

#[derive(Debug, Clone)]
pub struct MockMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

#[derive(Clone, Default)]
pub struct MockMqttClient {
    published_messages: Arc<Mutex<Vec<MockMessage>>>,
    failing: Arc<AtomicBool>,
}

impl MockMqttClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publications suivantes en erreur (broker injoignable)
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    /// Récupère tous les messages publiés (pour assertions de tests)
    pub fn get_published_messages(&self) -> Vec<MockMessage> {
        self.published_messages.lock().unwrap().clone()
    }

    pub fn find_messages_by_topic(&self, topic: &str) -> Vec<MockMessage> {
        self.published_messages
            .lock()
            .unwrap()
            .iter()
            .filter(|msg| msg.topic == topic)
            .cloned()
            .collect()
    }

    /// Parse le dernier message d'un topic en JSON
    pub fn get_last_json_message<T>(&self, topic: &str) -> Result<Option<T>>
    where
        T: for<'de> serde::Deserialize<'de>,
    {
        match self.find_messages_by_topic(topic).last() {
            Some(last) => Ok(Some(serde_json::from_slice(&last.payload)?)),
            None => Ok(None),
        }
    }

    /// Attend au moins `count` messages sur `topic`, renvoie ce qui a été vu
    pub async fn wait_for_messages(&self, topic: &str, count: usize, timeout_ms: u64) -> Vec<MockMessage> {
        let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            let messages = self.find_messages_by_topic(topic);
            if messages.len() >= count || tokio::time::Instant::now() >= deadline {
                if messages.len() < count {
                    log::warn!("⏰ [MOCK] {} message(s) sur {} au lieu de {}", messages.len(), topic, count);
                }
                return messages;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    pub fn clear(&self) {
        self.published_messages.lock().unwrap().clear();
    }
}

impl ChangeSink for MockMqttClient {
    async fn publish(&self, topic: String, payload: Vec<u8>) -> Result<()> {
        if self.failing.load(Ordering::Relaxed) {
            anyhow::bail!("mock broker unreachable");
        }
        log::info!("📤 [MOCK] Published to {}: {} bytes", topic, payload.len());
        self.published_messages.lock().unwrap().push(MockMessage {
            topic,
            payload,
            qos: QoS::AtLeastOnce,
            retain: false,
        });
        Ok(())
    }
}
