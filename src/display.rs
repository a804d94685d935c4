//! Live terminal dashboard.
//!
//! A read-only view over the [`StatusBoard`]: repaint the latest snapshot
//! on a fixed cadence, never touch engine state.  `q`, `Esc` or ctrl-c
//! request shutdown through the shared handle.

use std::io::{self, Stdout};
use std::panic;
use std::time::Duration;

use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use log::error;
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, List, ListItem, Paragraph},
    Frame, Terminal,
};

use crate::engine::ShutdownHandle;
use crate::status::StatusBoard;
use crate::types::{AppRuntimeState, GatewayState, StatusSnapshot};

const TICK: Duration = Duration::from_millis(500);

pub struct Dashboard {
    terminal: Terminal<CrosstermBackend<Stdout>>,
}

impl Dashboard {
    /// Enter raw mode and the alternate screen; install a panic hook that
    /// restores the terminal first.
    pub fn new() -> io::Result<Self> {
        let original_hook = panic::take_hook();
        panic::set_hook(Box::new(move |panic_info| {
            let _ = disable_raw_mode();
            let _ = execute!(io::stdout(), LeaveAlternateScreen);
            original_hook(panic_info);
        }));

        enable_raw_mode()?;
        let mut stdout = io::stdout();
        execute!(stdout, EnterAlternateScreen)?;
        let terminal = Terminal::new(CrosstermBackend::new(stdout))?;
        Ok(Self { terminal })
    }

    pub fn restore(&mut self) -> io::Result<()> {
        disable_raw_mode()?;
        execute!(self.terminal.backend_mut(), LeaveAlternateScreen)?;
        self.terminal.show_cursor()?;
        Ok(())
    }

    /// Repaint loop: poll the board, draw, handle keys, until shutdown.
    pub async fn run(&mut self, board: StatusBoard, shutdown: ShutdownHandle) -> io::Result<()> {
        let shutdown_rx = shutdown.subscribe();
        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            let snapshot = board.snapshot();
            self.terminal.draw(|frame| render(frame, &snapshot))?;

            if event::poll(TICK)? {
                if let Event::Key(key) = event::read()? {
                    if key.kind != KeyEventKind::Press {
                        continue;
                    }
                    let quit = matches!(key.code, KeyCode::Char('q') | KeyCode::Esc)
                        || (key.code == KeyCode::Char('c')
                            && key.modifiers.contains(KeyModifiers::CONTROL));
                    if quit {
                        shutdown.shutdown();
                        break;
                    }
                }
            }
        }
        Ok(())
    }
}

impl Drop for Dashboard {
    fn drop(&mut self) {
        if let Err(e) = self.restore() {
            error!("Failed to restore terminal: {}", e);
        }
    }
}

fn render(frame: &mut Frame, snapshot: &StatusSnapshot) {
    let vertical = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(6),
            Constraint::Min(3),
            Constraint::Length(1),
        ])
        .split(frame.size());

    frame.render_widget(gateway_panel(snapshot), vertical[0]);
    frame.render_widget(apps_panel(snapshot), vertical[1]);
    frame.render_widget(footer(), vertical[2]);
}

fn gateway_panel(snapshot: &StatusSnapshot) -> Paragraph<'_> {
    let label = Style::default().fg(Color::DarkGray);
    let gateway = match snapshot.gateway {
        GatewayState::Reachable => Span::styled("reachable", Style::default().fg(Color::Green)),
        GatewayState::Unreachable => Span::styled(
            "unreachable",
            Style::default().fg(Color::Red).add_modifier(Modifier::BOLD),
        ),
    };
    let port = match snapshot.mapping.port {
        Some(p) => Span::styled(
            p.to_string(),
            Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD),
        ),
        None => Span::styled("none", Style::default().fg(Color::DarkGray)),
    };
    let acquired = snapshot
        .mapping
        .acquired_at
        .map(|at| at.format("%H:%M:%S UTC").to_string())
        .unwrap_or_else(|| "-".to_string());

    let mut lines = vec![
        Line::from(vec![Span::styled("Gateway  ", label), gateway]),
        Line::from(vec![Span::styled("Port     ", label), port]),
        Line::from(vec![
            Span::styled("Acquired ", label),
            Span::raw(acquired),
            Span::styled("   changes ", label),
            Span::raw(snapshot.mapping.change_count.to_string()),
        ]),
    ];
    if let Some(detail) = &snapshot.gateway_detail {
        lines.push(Line::from(Span::styled(
            detail.clone(),
            Style::default().fg(Color::Red),
        )));
    }

    Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title(" portglue "))
}

fn apps_panel(snapshot: &StatusSnapshot) -> List<'_> {
    let items: Vec<ListItem> = snapshot
        .apps
        .iter()
        .map(|app| {
            let state = match app.state {
                AppRuntimeState::Running => {
                    Span::styled("running   ", Style::default().fg(Color::Green))
                }
                AppRuntimeState::Stopped => {
                    Span::styled("stopped   ", Style::default().fg(Color::DarkGray))
                }
                AppRuntimeState::Restarting => Span::styled(
                    "restarting",
                    Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD),
                ),
            };
            let flag = if app.config.gateway_required {
                Span::styled(" [vpn]", Style::default().fg(Color::Magenta))
            } else {
                Span::raw("")
            };
            ListItem::new(Line::from(vec![
                Span::styled(
                    format!("{:<14}", app.config.id),
                    Style::default().add_modifier(Modifier::BOLD),
                ),
                state,
                flag,
                Span::raw(" "),
                Span::styled(app.detail.clone(), Style::default().fg(Color::Gray)),
            ]))
        })
        .collect();

    List::new(items).block(
        Block::default()
            .borders(Borders::ALL)
            .title(format!(" Apps ({}) ", snapshot.apps.len())),
    )
}

fn footer() -> Paragraph<'static> {
    let key_style = Style::default()
        .fg(Color::Black)
        .bg(Color::Cyan)
        .add_modifier(Modifier::BOLD);
    Paragraph::new(Line::from(vec![
        Span::styled(" q ", key_style),
        Span::raw(" Quit"),
    ]))
}
