/*!
# Toolcrib DevKit - Outils de test

Bibliothèque partagée par les tests du kernel et de l'agent :
- Stub MQTT (sink de changements sans broker)
- Fixtures de snapshot et stores pré-remplis
- Harness : répertoires temporaires, serveur HTTP sur port éphémère
*/

pub mod fixtures;
pub mod mqtt_stub;
pub mod test_utils;

pub use fixtures::{seeded_store, standard_tool_type_count, SnapshotBuilder};
pub use mqtt_stub::MockMqttClient;
pub use test_utils::TestHarness;
