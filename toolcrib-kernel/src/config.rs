/**
 * CONFIG KERNEL - Chargement de kernel.yaml
 *
 * RÔLE : adresse d'écoute, fichier de données, broker MQTT optionnel,
 * taille du journal de changements.
 *
 * FONCTIONNEMENT : chemin via TOOLCRIB_KERNEL_CONFIG (défaut kernel.yaml).
 * Fichier absent, vide ou invalide = config par défaut + warning.
 * La clé API vient de l'environnement (TOOLCRIB_API_KEY), jamais du YAML.
 */

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use toolcrib_core::events::DEFAULT_JOURNAL_SIZE;
use toolcrib_core::StoreOptions;
use tracing::{info, warn};

pub const CONFIG_ENV: &str = "TOOLCRIB_KERNEL_CONFIG";
pub const API_KEY_ENV: &str = "TOOLCRIB_API_KEY";

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct KernelConfig {
    pub listen: String,
    pub data_file: PathBuf,
    pub mqtt: Option<MqttConf>,
    pub change_journal_size: usize,
    pub seed_standard_tool_types: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MqttConf {
    pub host: String,
    pub port: u16,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8000".into(),
            data_file: PathBuf::from("./data/toolcrib.json"),
            mqtt: None,
            change_journal_size: DEFAULT_JOURNAL_SIZE,
            seed_standard_tool_types: true,
        }
    }
}

impl KernelConfig {
    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            seed_tool_types: self.seed_standard_tool_types,
            journal_size: self.change_journal_size,
        }
    }
}

pub fn parse_config(txt: &str) -> KernelConfig {
    if txt.trim().is_empty() {
        return KernelConfig::default();
    }
    serde_yaml::from_str(txt).unwrap_or_else(|e| {
        warn!("[kernel] config invalide: {e}");
        KernelConfig::default()
    })
}

pub async fn load_config() -> KernelConfig {
    let path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| "kernel.yaml".into());
    if Path::new(&path).exists() {
        let txt = fs::read_to_string(&path).await.unwrap_or_default();
        info!("[kernel] config chargée depuis {path}");
        parse_config(&txt)
    } else {
        warn!("[kernel] pas de {path}, usage config par défaut");
        KernelConfig::default()
    }
}

/// None = API ouverte
pub fn api_key_from_env() -> Option<String> {
    std::env::var(API_KEY_ENV).ok().filter(|k| !k.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let cfg = parse_config("listen: 127.0.0.1:9000\nmqtt:\n  host: broker\n  port: 1884\n");
        assert_eq!(cfg.listen, "127.0.0.1:9000");
        assert_eq!(cfg.mqtt.as_ref().map(|m| m.port), Some(1884));
        assert_eq!(cfg.change_journal_size, DEFAULT_JOURNAL_SIZE);
        assert!(cfg.seed_standard_tool_types);
    }

    #[test]
    fn test_invalid_yaml_falls_back() {
        let cfg = parse_config("listen: [unterminated");
        assert_eq!(cfg.listen, "0.0.0.0:8000");
        assert!(cfg.mqtt.is_none());
    }
}
