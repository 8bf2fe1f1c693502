use std::time::Duration;

use drift::{DisconnectReason, EntityView, Position, SyncState};
use ratatui::Frame;
use ratatui::layout::{Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::symbols::Marker;
use ratatui::text::{Line, Span};
use ratatui::widgets::canvas::{Canvas, Points};
use ratatui::widgets::{Block, Borders, Paragraph};

/// World units from the origin to each arena edge.
pub const ARENA_HALF_EXTENT: f64 = 50.0;

pub struct Status<'a> {
    pub identifier: &'a str,
    pub transport: &'a str,
    pub state: SyncState,
    pub position: Position,
    pub rtt: Option<Duration>,
    pub disconnect_reason: Option<&'a DisconnectReason>,
}

pub fn render(frame: &mut Frame, entities: &[EntityView], status: &Status) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Min(8),
            Constraint::Length(3),
        ])
        .split(frame.area());

    render_status(frame, chunks[0], entities.len(), status);
    render_arena(frame, chunks[1], entities);
    render_help(frame, chunks[2]);
}

fn render_status(frame: &mut Frame, area: Rect, entity_count: usize, status: &Status) {
    let state_color = match status.state {
        SyncState::Synchronized => Color::Green,
        SyncState::Connecting | SyncState::Introducing => Color::Yellow,
        SyncState::Disconnected => Color::Red,
    };

    let mut spans = vec![
        Span::styled(status.identifier.to_string(), Style::default().fg(Color::Cyan)),
        Span::raw(format!(" via {}  |  ", status.transport.to_uppercase())),
        Span::styled(status.state.as_str(), Style::default().fg(state_color)),
        Span::raw(format!(
            "  |  ({:.1}, {:.1})  |  RTT {}  |  Players {}",
            status.position.x,
            status.position.y,
            format_rtt(status.rtt),
            entity_count
        )),
    ];
    if let Some(reason) = status.disconnect_reason {
        spans.push(Span::styled(
            format!("  |  {}", reason),
            Style::default().fg(Color::Red),
        ));
    }

    let block = Block::default()
        .title(" Drift ")
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Cyan));

    frame.render_widget(Paragraph::new(Line::from(spans)).block(block), area);
}

fn render_arena(frame: &mut Frame, area: Rect, entities: &[EntityView]) {
    let canvas = Canvas::default()
        .block(
            Block::default()
                .title(" Arena ")
                .borders(Borders::ALL)
                .border_style(Style::default().fg(Color::Blue)),
        )
        .marker(Marker::Braille)
        .x_bounds([-ARENA_HALF_EXTENT, ARENA_HALF_EXTENT])
        .y_bounds([-ARENA_HALF_EXTENT, ARENA_HALF_EXTENT])
        .paint(|ctx| {
            for entity in entities {
                let x = entity.position.x as f64;
                let y = entity.position.y as f64;
                let color = if entity.local { Color::Green } else { Color::Magenta };
                ctx.draw(&Points {
                    coords: &[(x, y)],
                    color,
                });
                ctx.print(
                    x,
                    y,
                    Line::from(Span::styled(
                        entity.identifier.to_string(),
                        Style::default().fg(color),
                    )),
                );
            }
        });

    frame.render_widget(canvas, area);
}

fn render_help(frame: &mut Frame, area: Rect) {
    let block = Block::default()
        .title(" Controls ")
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::DarkGray));

    let text = Paragraph::new("Arrows/WASD move  |  q/ESC leave")
        .block(block)
        .style(
            Style::default()
                .fg(Color::DarkGray)
                .add_modifier(Modifier::ITALIC),
        );

    frame.render_widget(text, area);
}

fn format_rtt(rtt: Option<Duration>) -> String {
    match rtt {
        Some(rtt) => format!("{}ms", rtt.as_millis()),
        None => "-".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use drift::EntityId;
    use ratatui::Terminal;
    use ratatui::backend::TestBackend;

    use super::*;

    #[test]
    fn test_format_rtt() {
        assert_eq!(format_rtt(None), "-");
        assert_eq!(format_rtt(Some(Duration::from_millis(42))), "42ms");
    }

    #[test]
    fn test_render_shows_state_and_players() {
        let mut terminal = Terminal::new(TestBackend::new(100, 30)).unwrap();
        let entities = vec![
            EntityView {
                identifier: EntityId::new("player-a").unwrap(),
                position: Position::new(0.0, 0.0),
                local: true,
            },
            EntityView {
                identifier: EntityId::new("player-b").unwrap(),
                position: Position::new(10.0, -5.0),
                local: false,
            },
        ];
        let status = Status {
            identifier: "player-a",
            transport: "udp",
            state: SyncState::Synchronized,
            position: Position::ZERO,
            rtt: Some(Duration::from_millis(3)),
            disconnect_reason: None,
        };

        terminal
            .draw(|frame| render(frame, &entities, &status))
            .unwrap();

        let text: String = terminal
            .backend()
            .buffer()
            .content()
            .iter()
            .map(|cell| cell.symbol())
            .collect();
        assert!(text.contains("synchronized"));
        assert!(text.contains("Players 2"));
        assert!(text.contains("player-b"));
    }
}
