mod client;
mod config;

use std::time::Instant;

use clap::Parser;
use tickwire::{PacketLossSimulation, SessionConfig};

use client::TickwireClient;
use config::ClientConfig;

#[derive(Parser)]
#[command(name = "tickwire-client")]
#[command(about = "Tickwire reliable UDP client")]
struct Args {
    #[arg(
        short,
        long,
        default_value = "127.0.0.1:30000",
        help = "Server address to connect to"
    )]
    server: String,

    #[arg(short, long, default_value = "anonymous")]
    user: String,

    #[arg(short, long, default_value = "1234")]
    password: String,

    #[arg(short, long, default_value_t = 32, help = "Packets per second")]
    rate: u32,

    #[arg(short, long = "message", help = "Text to send once in game (repeatable)")]
    messages: Vec<String>,

    #[arg(long, help = "Send messages without delivery guarantee")]
    unreliable: bool,

    #[arg(long, default_value_t = 0.0, help = "Outbound packet loss percentage (0-100)")]
    loss_percent: f32,

    #[arg(long, help = "Stop after this many ticks")]
    ticks: Option<u64>,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let packet_loss = (args.loss_percent > 0.0)
        .then(|| PacketLossSimulation::with_loss(args.loss_percent.min(100.0)));

    let config = ClientConfig {
        server: args.server,
        session: SessionConfig {
            send_rate: args.rate,
            user: args.user,
            password: args.password,
            ..Default::default()
        },
        messages: args.messages,
        critical: !args.unreliable,
        packet_loss,
        max_ticks: args.ticks,
    };

    log::info!("Connecting to {} as {:?}", config.server, config.session.user);
    let mut client = TickwireClient::connect(config, Instant::now())?;
    client.run();

    if client.session().is_rejected() {
        anyhow::bail!("server rejected the credentials");
    }

    Ok(())
}
