mod config;
mod server;
mod tui;

use std::io;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::Parser;
use crossterm::event::{self, Event, KeyCode, KeyEventKind};
use crossterm::terminal::{self, EnterAlternateScreen, LeaveAlternateScreen};
use crossterm::{cursor, execute};
use ratatui::Terminal;
use ratatui::backend::CrosstermBackend;
use tickwire::{PacketLossSimulation, TickPacer};

use config::ServerConfig;
use server::{TickwireServer, describe_event};
use tui::TuiState;

#[derive(Parser)]
#[command(name = "tickwire-server")]
#[command(about = "Tickwire reliable UDP server")]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: String,

    #[arg(short, long, default_value_t = tickwire::DEFAULT_PORT)]
    port: u16,

    #[arg(short, long, default_value_t = 10, help = "Packets per second sent to each peer")]
    send_rate: u32,

    #[arg(short, long, default_value_t = 192)]
    max_clients: usize,

    #[arg(long, default_value_t = 5, help = "Seconds of silence before a peer is dropped")]
    timeout: u64,

    #[arg(long)]
    headless: bool,

    #[arg(long, help = "Enable outbound packet loss simulation")]
    simulate_packet_loss: bool,

    #[arg(long, default_value_t = 0.0, help = "Packet loss percentage (0-100)")]
    loss_percent: f32,

    #[arg(long, default_value_t = 0, help = "Minimum latency in ms")]
    min_latency: u32,

    #[arg(long, default_value_t = 0, help = "Maximum latency in ms")]
    max_latency: u32,

    #[arg(long, default_value_t = 0, help = "Jitter in ms")]
    jitter: u32,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let bind_addr = format!("{}:{}", args.bind, args.port);

    let packet_loss = if args.simulate_packet_loss {
        Some(PacketLossSimulation {
            enabled: true,
            loss_percent: args.loss_percent.clamp(0.0, 100.0),
            min_latency_ms: args.min_latency,
            max_latency_ms: args.max_latency.max(args.min_latency),
            jitter_ms: args.jitter,
        })
    } else {
        None
    };

    let config = ServerConfig {
        send_rate: args.send_rate,
        max_clients: args.max_clients,
        timeout: Duration::from_secs(args.timeout),
        packet_loss,
        ..Default::default()
    };

    let mut server = TickwireServer::new(&bind_addr, config)?;

    if args.headless {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
        log::info!("Server started on {}", server.local_addr()?);
        server.run();
        log::info!("Server shutting down");
    } else {
        run_with_tui(&mut server)?;
    }

    Ok(())
}

fn run_with_tui(server: &mut TickwireServer) -> io::Result<()> {
    terminal::enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, cursor::Hide)?;

    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let running = server.running();
    let mut tui_state = TuiState::new(server.config().event_log_size);
    let mut pacer = TickPacer::new(server.config().send_rate, Instant::now());

    tui_state.log_info(format!("Server started on {}", server.local_addr()?));

    while running.load(Ordering::SeqCst) {
        let now = Instant::now();
        if pacer.is_due(now) {
            pacer.advance(now);
            server.tick_once(now);

            for event in server.drain_events() {
                let (level, text) = describe_event(&event);
                if level <= log::Level::Info {
                    tui_state.push(level, text);
                }
            }

            let stats = server.stats();
            let clients = server.client_infos();
            terminal.draw(|frame| {
                tui::render(frame, &tui_state, &stats, &clients);
            })?;
        }

        let wait = pacer.remaining(Instant::now()).max(Duration::from_millis(1));
        if event::poll(wait)?
            && let Event::Key(key) = event::read()?
            && key.kind == KeyEventKind::Press
            && matches!(key.code, KeyCode::Char('q') | KeyCode::Esc)
        {
            running.store(false, Ordering::SeqCst);
        }
    }

    terminal::disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen, cursor::Show)?;

    Ok(())
}
