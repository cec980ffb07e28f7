use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    // display name shown to other members, 1-18 chars
    #[serde(default = "default_display_name")]
    pub display_name: String,

    // port used by both the TCP control listener and the UDP audio socket
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    // answer CONNECT requests arriving directly at this node
    #[serde(default = "default_accept_join")]
    pub accept_direct_join: bool,

    // vote yes when another member proposes a candidate
    #[serde(default = "default_accept_join")]
    pub accept_indirect_join: bool,

    // socket timeout applied to every control read and write
    #[serde(default = "default_control_timeout_secs")]
    pub control_timeout_secs: u64,
}

fn default_display_name() -> String {
    "guest".to_string()
}

fn default_listen_port() -> u16 {
    8421
}

fn default_accept_join() -> bool {
    true
}

fn default_control_timeout_secs() -> u64 {
    5
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            display_name: default_display_name(),
            listen_port: default_listen_port(),
            accept_direct_join: default_accept_join(),
            accept_indirect_join: default_accept_join(),
            control_timeout_secs: default_control_timeout_secs(),
        }
    }
}

impl NodeConfig {
    pub fn control_timeout(&self) -> Duration {
        Duration::from_secs(self.control_timeout_secs)
    }
}

pub fn load(path: &str) -> anyhow::Result<NodeConfig> {
    use anyhow::Context;

    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path))?;
    let config: NodeConfig = toml::from_str(&content)?;
    Ok(config)
}
