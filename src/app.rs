use std::collections::VecDeque;

use anyhow::Result;
use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};
use ratatui::{
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Clear, Paragraph},
    Frame,
};

use crate::actions::Action;
use crate::commands::{self, CommandContext, Operation, Setting, HELP};
use crate::config::Config;
use crate::server::{Event, Phase, ResourceSample, ServerStateView};

const PAGE: usize = 10;

/// Theme colors
pub struct Theme {
    pub fg: Color,
    pub accent: Color,
    pub dim: Color,
    pub success: Color,
    pub warning: Color,
    pub error: Color,
}

impl Default for Theme {
    fn default() -> Self {
        Self {
            fg: Color::Rgb(220, 220, 220),
            accent: Color::Rgb(98, 168, 76), // grass green
            dim: Color::Rgb(100, 100, 100),
            success: Color::Rgb(80, 200, 120),
            warning: Color::Rgb(255, 193, 7),
            error: Color::Rgb(220, 53, 69),
        }
    }
}

impl Theme {
    fn phase(&self, phase: Phase) -> Color {
        match phase {
            Phase::Running => self.success,
            Phase::Starting | Phase::Stopping => self.warning,
            Phase::Crashed => self.error,
            Phase::Unknown | Phase::Stopped => self.dim,
        }
    }
}

/// Where a console line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    /// Server output that matched no rule
    Output,
    /// Server output that produced an event
    Event,
    /// Echo of a command we sent
    Sent,
    Info,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsoleLine {
    pub kind: LineKind,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusMessage {
    Info(String),
    Error(String),
}

/// Main application state
pub struct App {
    /// tmux session we attach to
    pub session_name: String,
    /// Whether an update stream is currently live
    pub attached: bool,
    /// Counts attachments so a stale stream end is ignored
    pub attachment: u64,
    /// Latest server state
    pub state: ServerStateView,
    pub resources: Option<ResourceSample>,
    /// Console scrollback, oldest first
    pub console: VecDeque<ConsoleLine>,
    pub history_size: usize,
    /// Lines scrolled up from the bottom
    pub scroll: usize,
    /// Prompt input buffer
    pub input: String,
    /// Submitted inputs, oldest first
    pub history: Vec<String>,
    history_index: Option<usize>,
    /// Status line message (info or error)
    pub message: Option<StatusMessage>,
    /// Working copy of the config; `player` and `namedpos` edit it
    pub settings: Config,
    pub theme: Theme,
    /// Pending action queue
    pub pending_actions: Vec<Action>,
}

impl App {
    pub fn new(config: &Config) -> Self {
        Self {
            session_name: config.session_name.clone(),
            attached: false,
            attachment: 0,
            state: ServerStateView::default(),
            resources: None,
            console: VecDeque::new(),
            history_size: config.history_size.max(1),
            scroll: 0,
            input: String::new(),
            history: Vec::new(),
            history_index: None,
            message: None,
            settings: config.clone(),
            theme: Theme::default(),
            pending_actions: Vec::new(),
        }
    }

    /// Take pending actions (drains the queue)
    pub fn take_pending_actions(&mut self) -> Vec<Action> {
        std::mem::take(&mut self.pending_actions)
    }

    /// Append a console line, dropping the oldest past `history_size`
    pub fn push_line(&mut self, kind: LineKind, text: impl Into<String>) {
        self.console.push_back(ConsoleLine { kind, text: text.into() });
        while self.console.len() > self.history_size {
            self.console.pop_front();
        }
    }

    /// Plain-text console contents, for the clipboard
    pub fn console_text(&self) -> String {
        self.console
            .iter()
            .map(|line| line.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Handle an action and return whether to quit
    pub fn handle_action(&mut self, action: Action) -> Result<bool> {
        match action {
            Action::KeyPress(key) => return self.handle_key(key),
            Action::Update(update) => {
                let kind = match update.event {
                    Event::Unrecognized { .. } => LineKind::Output,
                    _ => LineKind::Event,
                };
                self.state = update.state;
                self.push_line(kind, update.line.text);
            }
            Action::StateChanged(state) => self.state = state,
            Action::StreamEnded(attachment) if attachment == self.attachment => {
                self.attached = false;
                self.push_line(LineKind::Info, "Output stream ended. Press Ctrl-R to reattach.");
            }
            Action::Resources(sample) => self.resources = sample,
            Action::Info(msg) => self.message = Some(StatusMessage::Info(msg)),
            Action::Error(msg) => {
                self.push_line(LineKind::Error, msg.clone());
                self.message = Some(StatusMessage::Error(msg));
            }
            Action::StreamEnded(_)
            | Action::Submit(_)
            | Action::Reattach
            | Action::CopyConsole(_)
            | Action::SaveConfig(_) => {}
        }
        Ok(false)
    }

    fn handle_key(&mut self, key: KeyEvent) -> Result<bool> {
        let ctrl = key.modifiers.contains(KeyModifiers::CONTROL);
        match key.code {
            KeyCode::Esc => return Ok(true),
            KeyCode::Char('c') if ctrl => return Ok(true),
            KeyCode::Char('r') if ctrl => self.pending_actions.push(Action::Reattach),
            KeyCode::Char('y') if ctrl => self.pending_actions.push(Action::CopyConsole(self.console_text())),
            KeyCode::Char('l') if ctrl => self.console.clear(),
            KeyCode::Char(c) if !ctrl => {
                self.message = None;
                self.input.push(c);
            }
            KeyCode::Backspace => {
                self.input.pop();
            }
            KeyCode::Enter => return Ok(self.submit_input()),
            KeyCode::Up => self.history_previous(),
            KeyCode::Down => self.history_next(),
            KeyCode::PageUp => {
                self.scroll = (self.scroll + PAGE).min(self.console.len().saturating_sub(1));
            }
            KeyCode::PageDown => self.scroll = self.scroll.saturating_sub(PAGE),
            _ => {}
        }
        Ok(false)
    }

    /// Run the prompt line; returns whether to quit
    fn submit_input(&mut self) -> bool {
        let input = std::mem::take(&mut self.input);
        self.history_index = None;
        self.scroll = 0;
        if !input.trim().is_empty() && self.history.last() != Some(&input) {
            self.history.push(input.clone());
            if self.history.len() > self.history_size {
                self.history.remove(0);
            }
        }

        let parsed = {
            let ctx = CommandContext {
                default_player: self.settings.default_player.as_deref(),
                named_positions: &self.settings.named_positions,
            };
            commands::parse(&input, &ctx)
        };

        match parsed {
            Ok(None) => {}
            Ok(Some(Operation::Send(line))) => {
                self.push_line(LineKind::Sent, format!("> {line}"));
                self.pending_actions.push(Action::Submit(line));
            }
            Ok(Some(Operation::Help)) => {
                self.push_line(LineKind::Info, "Available commands:");
                for (usage, description) in HELP {
                    self.push_line(LineKind::Info, format!("  {usage:<54} {description}"));
                }
            }
            Ok(Some(Operation::Exit)) => return true,
            Ok(Some(Operation::Reattach)) => self.pending_actions.push(Action::Reattach),
            Ok(Some(Operation::Clear)) => self.console.clear(),
            Ok(Some(Operation::Copy)) => self.pending_actions.push(Action::CopyConsole(self.console_text())),
            Ok(Some(Operation::Setting(setting))) => self.apply_setting(&setting),
            Err(e) => self.push_line(LineKind::Error, e.to_string()),
        }
        false
    }

    fn apply_setting(&mut self, setting: &Setting) {
        match setting.apply(&mut self.settings) {
            Ok(applied) => {
                for line in applied.lines {
                    self.push_line(LineKind::Info, line);
                }
                if applied.changed {
                    self.pending_actions.push(Action::SaveConfig(self.settings.clone()));
                }
            }
            Err(e) => self.push_line(LineKind::Error, e.to_string()),
        }
    }

    fn history_previous(&mut self) {
        if self.history.is_empty() {
            return;
        }
        let i = match self.history_index {
            Some(0) => 0,
            Some(i) => i - 1,
            None => self.history.len() - 1,
        };
        self.history_index = Some(i);
        self.input = self.history[i].clone();
    }

    fn history_next(&mut self) {
        match self.history_index {
            Some(i) if i + 1 < self.history.len() => {
                self.history_index = Some(i + 1);
                self.input = self.history[i + 1].clone();
            }
            Some(_) => {
                self.history_index = None;
                self.input.clear();
            }
            None => {}
        }
    }

    pub fn render(&mut self, frame: &mut Frame) {
        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .constraints([
                Constraint::Length(3), // Header
                Constraint::Min(0),    // Console and state
                Constraint::Length(3), // Prompt
                Constraint::Length(1), // Status line
            ])
            .split(frame.area());

        self.render_header(frame, chunks[0]);
        self.render_main(frame, chunks[1]);
        self.render_prompt(frame, chunks[2]);
        self.render_footer(frame, chunks[3]);

        if !self.attached && self.console.is_empty() {
            self.render_detached_dialog(frame);
        }
    }

    fn render_header(&self, frame: &mut Frame, area: Rect) {
        let link = if self.attached { "attached" } else { "detached" };
        let title = Paragraph::new(Line::from(vec![
            Span::styled(
                " mc-console-ctrl ",
                Style::default().fg(self.theme.accent).add_modifier(Modifier::BOLD),
            ),
            Span::styled(
                format!("│ {} ({}) │ ", self.session_name, link),
                Style::default().fg(self.theme.dim),
            ),
            Span::styled(
                self.state.phase.to_string(),
                Style::default()
                    .fg(self.theme.phase(self.state.phase))
                    .add_modifier(Modifier::BOLD),
            ),
        ]))
        .block(
            Block::default()
                .borders(Borders::ALL)
                .border_style(Style::default().fg(self.theme.dim)),
        );
        frame.render_widget(title, area);
    }

    fn render_main(&self, frame: &mut Frame, area: Rect) {
        let chunks = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([
                Constraint::Percentage(72), // Console
                Constraint::Percentage(28), // State panel
            ])
            .split(area);

        self.render_console(frame, chunks[0]);
        self.render_state_panel(frame, chunks[1]);
    }

    fn render_console(&self, frame: &mut Frame, area: Rect) {
        let height = area.height.saturating_sub(2) as usize;
        let end = self.console.len() - self.scroll.min(self.console.len());
        let start = end.saturating_sub(height);

        let lines: Vec<Line> = self
            .console
            .range(start..end)
            .map(|line| {
                let style = match line.kind {
                    LineKind::Output => Style::default().fg(self.theme.fg),
                    LineKind::Event => Style::default().fg(self.theme.accent),
                    LineKind::Sent => Style::default().fg(self.theme.warning),
                    LineKind::Info => Style::default().fg(self.theme.dim),
                    LineKind::Error => Style::default().fg(self.theme.error),
                };
                Line::from(Span::styled(line.text.as_str(), style))
            })
            .collect();

        let title = if self.scroll > 0 {
            format!(" Console (+{}) ", self.scroll)
        } else {
            " Console ".to_string()
        };
        let console = Paragraph::new(lines).block(
            Block::default()
                .title(title)
                .borders(Borders::ALL)
                .border_style(Style::default().fg(self.theme.dim)),
        );
        frame.render_widget(console, area);
    }

    fn render_state_panel(&self, frame: &mut Frame, area: Rect) {
        let label = |text: &'static str| Span::styled(text, Style::default().fg(self.theme.dim));
        let value = |text: String| Span::styled(text, Style::default().fg(self.theme.fg));

        let (cpu, memory) = match &self.resources {
            Some(sample) => (
                sample
                    .cpu_percent
                    .map(|c| format!("{c:.1}%"))
                    .unwrap_or_else(|| "...".to_string()),
                format_bytes(sample.memory_bytes),
            ),
            None => ("n/a".to_string(), "n/a".to_string()),
        };

        let mut content = vec![
            Line::from(vec![
                label("Phase: "),
                Span::styled(
                    self.state.phase.to_string(),
                    Style::default().fg(self.theme.phase(self.state.phase)),
                ),
            ]),
            Line::from(vec![label("CPU: "), value(cpu)]),
            Line::from(vec![label("Memory: "), value(memory)]),
            Line::from(vec![
                label("Unrecognized: "),
                value(self.state.unrecognized_since_event.to_string()),
            ]),
            Line::from(vec![label("Anomalies: "), value(self.state.anomalous_events.to_string())]),
            Line::from(vec![label("Gaps: "), value(self.state.gaps.to_string())]),
        ];
        if self.state.phase.is_terminal() {
            content.push(Line::from(Span::styled(
                "Ctrl-R to reattach",
                Style::default().fg(self.theme.warning),
            )));
        }
        content.extend([
            Line::from(""),
            Line::from(vec![label("Players: "), value(self.state.players.len().to_string())]),
        ]);
        content.extend(
            self.state
                .players
                .iter()
                .map(|p| Line::from(Span::styled(format!("  {p}"), Style::default().fg(self.theme.success)))),
        );

        let panel = Paragraph::new(content).block(
            Block::default()
                .title(" Server ")
                .borders(Borders::ALL)
                .border_style(Style::default().fg(self.theme.dim)),
        );
        frame.render_widget(panel, area);
    }

    fn render_prompt(&self, frame: &mut Frame, area: Rect) {
        let prompt = Paragraph::new(Line::from(vec![
            Span::styled("▶ ", Style::default().fg(self.theme.accent)),
            Span::styled(self.input.as_str(), Style::default().fg(self.theme.fg)),
        ]))
        .block(
            Block::default()
                .title(" Command ")
                .borders(Borders::ALL)
                .border_style(Style::default().fg(self.theme.accent)),
        );
        frame.render_widget(prompt, area);
        frame.set_cursor_position((area.x + 3 + self.input.chars().count() as u16, area.y + 1));
    }

    fn render_footer(&self, frame: &mut Frame, area: Rect) {
        let content = match &self.message {
            Some(StatusMessage::Info(msg)) => {
                Line::from(Span::styled(format!(" {msg} "), Style::default().fg(self.theme.success)))
            }
            Some(StatusMessage::Error(msg)) => {
                Line::from(Span::styled(format!(" {msg} "), Style::default().fg(self.theme.error)))
            }
            None => Line::from(Span::styled(
                " Enter: Send │ ↑/↓: History │ PgUp/PgDn: Scroll │ Ctrl-R: Reattach │ Ctrl-Y: Copy │ Esc: Quit ",
                Style::default().fg(self.theme.dim),
            )),
        };
        frame.render_widget(Paragraph::new(content), area);
    }

    fn render_detached_dialog(&self, frame: &mut Frame) {
        let area = centered_rect(50, 20, frame.area());

        frame.render_widget(Clear, area);

        let block = Block::default()
            .title(" Not Attached ")
            .borders(Borders::ALL)
            .border_style(Style::default().fg(self.theme.warning));

        let inner = block.inner(area);
        frame.render_widget(block, area);

        let text = vec![
            Line::from(""),
            Line::from(Span::styled(
                format!("No live attachment to tmux session '{}'.", self.session_name),
                Style::default().fg(self.theme.fg),
            )),
            Line::from(""),
            Line::from(Span::styled(
                "Press Ctrl-R to reattach, Esc to quit",
                Style::default().fg(self.theme.dim),
            )),
        ];

        frame.render_widget(Paragraph::new(text), inner);
    }
}

fn format_bytes(bytes: u64) -> String {
    const MIB: f64 = 1024.0 * 1024.0;
    let mib = bytes as f64 / MIB;
    if mib >= 1024.0 {
        format!("{:.2} GiB", mib / 1024.0)
    } else {
        format!("{mib:.1} MiB")
    }
}

/// Helper function to create a centered rectangle
fn centered_rect(percent_x: u16, percent_y: u16, r: Rect) -> Rect {
    let popup_layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage((100 - percent_y) / 2),
            Constraint::Percentage(percent_y),
            Constraint::Percentage((100 - percent_y) / 2),
        ])
        .split(r);

    Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100 - percent_x) / 2),
            Constraint::Percentage(percent_x),
            Constraint::Percentage((100 - percent_x) / 2),
        ])
        .split(popup_layout[1])[1]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{Event, StateUpdate};
    use crate::transport::RawLine;

    fn app() -> App {
        let config = Config {
            default_player: Some("Steve".into()),
            history_size: 3,
            ..Config::default()
        };
        App::new(&config)
    }

    fn key(code: KeyCode) -> Action {
        Action::KeyPress(KeyEvent::new(code, KeyModifiers::NONE))
    }

    fn ctrl(c: char) -> Action {
        Action::KeyPress(KeyEvent::new(KeyCode::Char(c), KeyModifiers::CONTROL))
    }

    fn type_line(app: &mut App, text: &str) -> bool {
        for c in text.chars() {
            app.handle_action(key(KeyCode::Char(c))).unwrap();
        }
        app.handle_action(key(KeyCode::Enter)).unwrap()
    }

    fn update(seq: u64, text: &str, event: Event) -> Action {
        Action::Update(StateUpdate {
            line: RawLine::new(seq, text),
            event,
            state: ServerStateView::default(),
        })
    }

    #[test]
    fn test_enter_submits_server_command() {
        let mut app = app();
        assert!(!type_line(&mut app, "qg torch 4"));
        assert!(app.input.is_empty());
        assert!(matches!(
            app.take_pending_actions().as_slice(),
            [Action::Submit(line)] if line == "give Steve torch 4"
        ));
        assert_eq!(app.console.back().unwrap().kind, LineKind::Sent);
    }

    #[test]
    fn test_usage_error_is_shown_not_sent() {
        let mut app = app();
        type_line(&mut app, "tp Alex nowhere");
        assert!(app.take_pending_actions().is_empty());
        assert_eq!(app.console.back().unwrap().kind, LineKind::Error);
    }

    #[test]
    fn test_exit_and_escape_quit() {
        let mut app = app();
        assert!(type_line(&mut app, "exit"));
        assert!(app.handle_action(key(KeyCode::Esc)).unwrap());
        assert!(app.handle_action(ctrl('c')).unwrap());
    }

    #[test]
    fn test_history_recall() {
        let mut app = app();
        type_line(&mut app, "sc list");
        type_line(&mut app, "sc time query daytime");

        app.handle_action(key(KeyCode::Up)).unwrap();
        assert_eq!(app.input, "sc time query daytime");
        app.handle_action(key(KeyCode::Up)).unwrap();
        assert_eq!(app.input, "sc list");
        app.handle_action(key(KeyCode::Up)).unwrap();
        assert_eq!(app.input, "sc list");
        app.handle_action(key(KeyCode::Down)).unwrap();
        assert_eq!(app.input, "sc time query daytime");
        app.handle_action(key(KeyCode::Down)).unwrap();
        assert!(app.input.is_empty());
    }

    #[test]
    fn test_console_is_capped() {
        let mut app = app();
        for i in 0..5 {
            app.handle_action(update(i, &format!("line {i}"), Event::Unrecognized { raw: String::new() }))
                .unwrap();
        }
        assert_eq!(app.console.len(), 3);
        assert_eq!(app.console.front().unwrap().text, "line 2");
        assert_eq!(app.console_text(), "line 2\nline 3\nline 4");
    }

    #[test]
    fn test_recognized_lines_are_marked() {
        let mut app = app();
        app.handle_action(update(0, "Server started.", Event::ServerStarted)).unwrap();
        assert_eq!(app.console.back().unwrap().kind, LineKind::Event);
    }

    #[test]
    fn test_control_keys_queue_actions() {
        let mut app = app();
        app.push_line(LineKind::Output, "hello");
        app.handle_action(ctrl('r')).unwrap();
        app.handle_action(ctrl('y')).unwrap();
        let pending = app.take_pending_actions();
        assert!(matches!(pending[0], Action::Reattach));
        assert!(matches!(&pending[1], Action::CopyConsole(text) if text == "hello"));

        type_line(&mut app, "clear");
        assert!(app.console.is_empty());
    }

    #[test]
    fn test_player_add_sets_default_and_saves() {
        let mut app = App::new(&Config::default());
        type_line(&mut app, "qg torch");
        assert_eq!(app.console.back().unwrap().kind, LineKind::Error);

        type_line(&mut app, "player add Alex");
        let saved = match app.take_pending_actions().as_slice() {
            [Action::SaveConfig(config)] => config.clone(),
            other => panic!("expected a save, got {other:?}"),
        };
        assert_eq!(saved.default_player.as_deref(), Some("Alex"));
        assert!(saved.players.contains("Alex"));

        type_line(&mut app, "qg torch");
        assert!(matches!(
            app.take_pending_actions().as_slice(),
            [Action::Submit(line)] if line == "give Alex torch 1"
        ));

        // listing and rejected changes do not save
        type_line(&mut app, "player list");
        type_line(&mut app, "player add Alex");
        assert!(app.take_pending_actions().is_empty());
        assert_eq!(app.console.back().unwrap().kind, LineKind::Error);
    }

    #[test]
    fn test_stream_end_marks_detached() {
        let mut app = app();
        app.attached = true;
        app.attachment = 2;
        app.handle_action(Action::StreamEnded(1)).unwrap();
        assert!(app.attached);
        app.handle_action(Action::StreamEnded(2)).unwrap();
        assert!(!app.attached);
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512 * 1024 * 1024), "512.0 MiB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.00 GiB");
    }
}
