use std::net::Ipv4Addr;
use std::path::Path;
use std::path::PathBuf;

use anyhow::Context;
use serde::Deserialize;

fn default_address() -> Ipv4Addr {
    Ipv4Addr::LOCALHOST
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ListenConfig {
    #[serde(default = "default_address")]
    pub address: Ipv4Addr,
    pub port: u16,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct EndpointConfig {
    pub listen: ListenConfig,
    /// Address handed to clients for cross-endpoint handoff. Defaults to
    /// the listen address.
    pub advertise: Option<ListenConfig>,
}

impl EndpointConfig {
    fn with_port(port: u16) -> Self {
        Self {
            listen: ListenConfig {
                address: default_address(),
                port,
            },
            advertise: None,
        }
    }

    pub fn advertised(&self) -> ListenConfig {
        self.advertise.unwrap_or(self.listen)
    }
}

fn default_lobby() -> EndpointConfig {
    EndpointConfig::with_port(10030)
}

fn default_ranch() -> EndpointConfig {
    EndpointConfig::with_port(10031)
}

fn default_race() -> EndpointConfig {
    EndpointConfig::with_port(10032)
}

fn default_relay() -> ListenConfig {
    ListenConfig {
        address: default_address(),
        port: 10500,
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("records")
}

fn default_notice_template() -> String {
    "Welcome! {players_online} players online.".to_string()
}

fn default_fallback_map_block_id() -> u16 {
    1
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_lobby")]
    pub lobby: EndpointConfig,
    #[serde(default = "default_ranch")]
    pub ranch: EndpointConfig,
    #[serde(default = "default_race")]
    pub race: EndpointConfig,
    #[serde(default = "default_relay")]
    pub relay: ListenConfig,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_notice_template")]
    pub notice_template: String,
    #[serde(default = "default_fallback_map_block_id")]
    pub fallback_map_block_id: u16,
    /// Overrides for the embedded content tables.
    #[serde(default)]
    pub registry_dir: Option<PathBuf>,
    #[serde(default)]
    pub blocked_words: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("default config")
    }
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        serde_yaml::from_str(&raw).with_context(|| format!("parse config {}", path.display()))
    }

    /// Loads from `CANTERD_CONFIG` (default `config.yaml`); a missing file
    /// yields the localhost defaults.
    pub fn load_default() -> anyhow::Result<Self> {
        let path = std::env::var("CANTERD_CONFIG").unwrap_or_else(|_| "config.yaml".to_string());
        let path = Path::new(&path);
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_yields_defaults() {
        let config = Config::default();
        assert_eq!(config.lobby.listen.port, 10030);
        assert_eq!(config.ranch.listen.port, 10031);
        assert_eq!(config.race.listen.port, 10032);
        assert_eq!(config.relay.port, 10500);
        assert!(config.notice_template.contains("{players_online}"));
        assert_eq!(config.fallback_map_block_id, 1);
    }

    #[test]
    fn advertise_falls_back_to_listen() {
        let config = Config::default();
        let advertised = config.race.advertised();
        assert_eq!(advertised.port, config.race.listen.port);
    }

    #[test]
    fn partial_config_parses() {
        let config: Config = serde_yaml::from_str(
            "lobby:\n  listen: { address: 0.0.0.0, port: 20030 }\n  advertise: { address: 203.0.113.9, port: 20030 }\n",
        )
        .unwrap();
        assert_eq!(config.lobby.listen.port, 20030);
        assert_eq!(
            config.lobby.advertised().address,
            "203.0.113.9".parse::<Ipv4Addr>().unwrap()
        );
        assert_eq!(config.race.listen.port, 10032);
    }
}
