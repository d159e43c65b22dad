use tickwire::{PacketLossSimulation, SessionConfig};

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server: String,
    pub session: SessionConfig,
    /// Sent in order once the session is in game.
    pub messages: Vec<String>,
    pub critical: bool,
    pub packet_loss: Option<PacketLossSimulation>,
    pub max_ticks: Option<u64>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: format!("127.0.0.1:{}", tickwire::DEFAULT_PORT),
            session: SessionConfig::default(),
            messages: Vec::new(),
            critical: true,
            packet_loss: None,
            max_ticks: None,
        }
    }
}
