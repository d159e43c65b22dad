use std::time::Duration;

use tickwire::net::{DEFAULT_TIMEOUT, HostConfig};
use tickwire::PacketLossSimulation;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub send_rate: u32,
    pub max_clients: usize,
    pub timeout: Duration,
    pub event_log_size: usize,
    pub packet_loss: Option<PacketLossSimulation>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let host = HostConfig::default();
        Self {
            send_rate: host.send_rate,
            max_clients: host.max_clients,
            timeout: DEFAULT_TIMEOUT,
            event_log_size: 200,
            packet_loss: None,
        }
    }
}

impl ServerConfig {
    pub fn host_config(&self) -> HostConfig {
        HostConfig {
            send_rate: self.send_rate.max(1),
            max_clients: self.max_clients,
            timeout: self.timeout,
        }
    }
}
