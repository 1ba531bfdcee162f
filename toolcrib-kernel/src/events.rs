/**
 * ÉVÉNEMENTS STORE → MQTT
 *
 * RÔLE : chaque sauvegarde du store produit un StoreEvent (broadcast tokio).
 * Le forwarder le sérialise en JSON et le publie sur toolcrib/store/changed@v1
 * pour que les autres process re-rendent sans poller.
 *
 * FONCTIONNEMENT :
 * - connect_mqtt : client rumqttc + tâche qui pompe l'eventloop et met à jour
 *   le HealthTracker (connected / reconnecting)
 * - spawn_change_forwarder : générique sur ChangeSink (MqttSink en prod,
 *   MockMqttClient du devkit en test)
 * - Broker absent = erreurs loggées, le kernel continue de servir HTTP
 */

use crate::config::MqttConf;
use crate::health::HealthTracker;
use rumqttc::{AsyncClient, Event, MqttOptions, QoS};
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::{self, JoinHandle};
use toolcrib_core::{ChangeSink, StoreEvent};
use tracing::{debug, error, info, warn};

pub const STORE_CHANGED_TOPIC: &str = "toolcrib/store/changed@v1";

#[derive(Clone)]
pub struct MqttSink {
    client: AsyncClient,
}

impl ChangeSink for MqttSink {
    async fn publish(&self, topic: String, payload: Vec<u8>) -> anyhow::Result<()> {
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await?;
        Ok(())
    }
}

/// Crée le client MQTT et lance la boucle réseau en tâche de fond
pub fn connect_mqtt(conf: &MqttConf, health: HealthTracker) -> MqttSink {
    let client_id = format!("toolcrib-kernel-{}", uuid::Uuid::new_v4().simple());
    let mut opts = MqttOptions::new(client_id, &conf.host, conf.port);
    opts.set_keep_alive(Duration::from_secs(15));
    let (client, mut eventloop) = AsyncClient::new(opts, 10);

    health.mark_mqtt_connecting();
    info!("[kernel] MQTT vers {}:{}", conf.host, conf.port);

    task::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(rumqttc::Incoming::ConnAck(_))) => {
                    info!("[kernel] MQTT connecté");
                    health.mark_mqtt_connected();
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("[kernel] MQTT erreur: {e:?}");
                    health.increment_reconnects();
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });

    MqttSink { client }
}

/// Relaie chaque StoreEvent vers le sink jusqu'à fermeture du store
pub fn spawn_change_forwarder<S: ChangeSink>(mut rx: broadcast::Receiver<StoreEvent>, sink: S) -> JoinHandle<()> {
    task::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let payload = match serde_json::to_vec(&event) {
                        Ok(p) => p,
                        Err(e) => {
                            error!("[kernel] event non sérialisable: {e}");
                            continue;
                        }
                    };
                    match sink.publish(STORE_CHANGED_TOPIC.to_string(), payload).await {
                        Ok(()) => debug!("[kernel] published revision {}", event.revision),
                        Err(e) => warn!("[kernel] publish revision {} failed: {e}", event.revision),
                    }
                }
                // les pollers HTTP rattrapent via /api/changes
                Err(RecvError::Lagged(n)) => warn!("[kernel] forwarder en retard, {n} events sautés"),
                Err(RecvError::Closed) => break,
            }
        }
    })
}
