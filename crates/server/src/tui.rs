use std::collections::VecDeque;

use ratatui::Frame;
use ratatui::layout::{Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Cell, Gauge, List, ListItem, Paragraph, Row, Table};
use tickwire::ConnectionState;

use crate::server::{ClientInfo, ServerStats};

#[derive(Debug, Clone)]
pub struct LogEntry {
    pub level: log::Level,
    pub text: String,
}

/// Scrollback of server events shown under the connection table.
#[derive(Debug)]
pub struct TuiState {
    log: VecDeque<LogEntry>,
    capacity: usize,
}

impl TuiState {
    pub fn new(capacity: usize) -> Self {
        Self {
            log: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, level: log::Level, text: impl Into<String>) {
        if self.log.len() == self.capacity {
            self.log.pop_front();
        }
        self.log.push_back(LogEntry {
            level,
            text: text.into(),
        });
    }

    pub fn log_info(&mut self, text: impl Into<String>) {
        self.push(log::Level::Info, text);
    }

    pub fn entries(&self) -> impl DoubleEndedIterator<Item = &LogEntry> {
        self.log.iter()
    }

    pub fn len(&self) -> usize {
        self.log.len()
    }
}

pub fn render(frame: &mut Frame, state: &TuiState, stats: &ServerStats, clients: &[ClientInfo]) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .margin(1)
        .constraints([
            Constraint::Length(3),
            Constraint::Length(3),
            Constraint::Length(6),
            Constraint::Min(6),
            Constraint::Length(10),
            Constraint::Length(3),
        ])
        .split(frame.area());

    render_header(frame, chunks[0], stats);
    render_status(frame, chunks[1], stats);
    render_network(frame, chunks[2], stats);
    render_connections(frame, chunks[3], clients);
    render_log(frame, chunks[4], state);
    render_help(frame, chunks[5]);
}

fn render_header(frame: &mut Frame, area: Rect, stats: &ServerStats) {
    let uptime = format_duration(stats.uptime_secs);
    let title = format!(" Tickwire Server - Uptime: {} ", uptime);

    let block = Block::default()
        .title(title)
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Cyan));

    let text = format!(
        "Tick: {}  |  Peers: {}  |  In game: {}",
        stats.tick, stats.client_count, stats.in_game_count
    );

    let paragraph = Paragraph::new(text)
        .block(block)
        .style(Style::default().fg(Color::White));

    frame.render_widget(paragraph, area);
}

fn render_status(frame: &mut Frame, area: Rect, stats: &ServerStats) {
    let block = Block::default()
        .title(" Status ")
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Green));

    let max = stats.max_clients.max(1);
    let client_ratio = stats.client_count as f64 / max as f64;
    let gauge = Gauge::default()
        .block(block)
        .gauge_style(Style::default().fg(Color::Green))
        .ratio(client_ratio.min(1.0))
        .label(format!("{}/{} clients", stats.client_count, stats.max_clients));

    frame.render_widget(gauge, area);
}

fn render_network(frame: &mut Frame, area: Rect, stats: &ServerStats) {
    let block = Block::default()
        .title(" Network ")
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Yellow));

    let net = &stats.network_stats;
    let lines = vec![
        Line::from(vec![
            Span::styled("Packets: ", Style::default().fg(Color::Gray)),
            Span::styled(
                format!(
                    "{} sent / {} recv / {} malformed",
                    net.packets_sent, net.packets_received, net.packets_malformed
                ),
                Style::default().fg(Color::White),
            ),
        ]),
        Line::from(vec![
            Span::styled("Bytes: ", Style::default().fg(Color::Gray)),
            Span::styled(
                format!(
                    "{} sent / {} recv",
                    format_bytes(net.bytes_sent),
                    format_bytes(net.bytes_received)
                ),
                Style::default().fg(Color::White),
            ),
        ]),
        Line::from(vec![
            Span::styled("Messages: ", Style::default().fg(Color::Gray)),
            Span::styled(
                format!(
                    "{} delivered / {} requeued / {} dropped",
                    net.messages_delivered, net.messages_requeued, net.messages_dropped
                ),
                Style::default().fg(Color::White),
            ),
        ]),
        Line::from(vec![
            Span::styled("Packet Loss: ", Style::default().fg(Color::Gray)),
            Span::styled(
                format!("{:.1}%", net.packet_loss_percent),
                Style::default().fg(loss_color(net.packet_loss_percent)),
            ),
        ]),
    ];

    let paragraph = Paragraph::new(lines).block(block);
    frame.render_widget(paragraph, area);
}

fn render_connections(frame: &mut Frame, area: Rect, clients: &[ClientInfo]) {
    let block = Block::default()
        .title(" Connections ")
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Magenta));

    let header = Row::new(["Address", "State", "Seq", "Remote", "Queue", "Loss", "RTT", "Up"])
        .style(
            Style::default()
                .fg(Color::Gray)
                .add_modifier(Modifier::BOLD),
        );

    let rows = clients.iter().map(|client| {
        Row::new(vec![
            Cell::from(client.addr.clone()),
            Cell::from(client.state.as_str()).style(Style::default().fg(state_color(client.state))),
            Cell::from(client.local_sequence.to_string()),
            Cell::from(client.remote_sequence.to_string()),
            Cell::from(format!("{} ({})", client.queue_len, client.in_flight)),
            Cell::from(format!("{:.1}%", client.loss_percent))
                .style(Style::default().fg(loss_color(client.loss_percent))),
            Cell::from(format!("{:.0}ms", client.rtt_ms)),
            Cell::from(format_duration(client.connected_secs)),
        ])
    });

    let widths = [
        Constraint::Min(21),
        Constraint::Length(11),
        Constraint::Length(10),
        Constraint::Length(10),
        Constraint::Length(8),
        Constraint::Length(7),
        Constraint::Length(7),
        Constraint::Length(9),
    ];

    let table = Table::new(rows, widths).header(header).block(block);
    frame.render_widget(table, area);
}

fn render_log(frame: &mut Frame, area: Rect, state: &TuiState) {
    let block = Block::default()
        .title(" Events ")
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Blue));

    let visible = area.height.saturating_sub(2) as usize;
    let mut items: Vec<ListItem> = state
        .entries()
        .rev()
        .take(visible)
        .map(|entry| {
            ListItem::new(Line::from(Span::styled(
                entry.text.as_str(),
                Style::default().fg(level_color(entry.level)),
            )))
        })
        .collect();
    items.reverse();

    frame.render_widget(List::new(items).block(block), area);
}

fn render_help(frame: &mut Frame, area: Rect) {
    let block = Block::default()
        .title(" Controls ")
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::DarkGray));

    let text = Paragraph::new("Press 'q' or ESC to quit")
        .block(block)
        .style(
            Style::default()
                .fg(Color::DarkGray)
                .add_modifier(Modifier::ITALIC),
        );

    frame.render_widget(text, area);
}

fn state_color(state: ConnectionState) -> Color {
    match state {
        ConnectionState::None => Color::DarkGray,
        ConnectionState::TryingAuth => Color::Yellow,
        ConnectionState::Auth => Color::Cyan,
        ConnectionState::InGame => Color::Green,
    }
}

fn level_color(level: log::Level) -> Color {
    match level {
        log::Level::Error => Color::Red,
        log::Level::Warn => Color::Yellow,
        log::Level::Info => Color::White,
        log::Level::Debug | log::Level::Trace => Color::DarkGray,
    }
}

fn loss_color(percent: f32) -> Color {
    if percent > 5.0 { Color::Red } else { Color::White }
}

fn format_duration(secs: u64) -> String {
    let hours = secs / 3600;
    let mins = (secs % 3600) / 60;
    let secs = secs % 60;
    format!("{:02}:{:02}:{:02}", hours, mins, secs)
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{}B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1}KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1}MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.1}GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(0), "00:00:00");
        assert_eq!(format_duration(3725), "01:02:05");
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512B");
        assert_eq!(format_bytes(1536), "1.5KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.0MB");
    }

    #[test]
    fn test_log_is_bounded() {
        let mut state = TuiState::new(3);
        for i in 0..5 {
            state.log_info(format!("event {}", i));
        }
        assert_eq!(state.len(), 3);
        let texts: Vec<&str> = state.entries().map(|e| e.text.as_str()).collect();
        assert_eq!(texts, vec!["event 2", "event 3", "event 4"]);
    }
}
