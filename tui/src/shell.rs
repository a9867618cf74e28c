//! Shell state and rendering: header, log pane, hint entry, footer.
//!
//! The shell itself owns no terminal; the display driver calls [`Shell::draw`]
//! with a ratatui frame. State is mutex-guarded so the event consumer and the
//! input router can drive it concurrently.

use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use obi_core::session::SessionEvent;
use obi_core::session::SessionState;
use ratatui::Frame;
use ratatui::layout::Constraint;
use ratatui::layout::Layout;
use ratatui::style::Stylize;
use ratatui::text::Line;
use ratatui::text::Span;
use ratatui::widgets::Paragraph;

use crate::logpane::DEFAULT_MAX_LOGS;
use crate::logpane::LogPane;

const DEFAULT_HEADER: &str = "Obi Interactive Session";

const HELP_OVERLAY_LINES: [&str; 6] = [
    "Help:",
    "p - Pause/resume log output",
    "h - Enter hint mode",
    "s - Request soft stop",
    "q - Abort agent session",
    "? - Toggle this overlay",
];

/// Token metrics shown in the header. Unset values render as `--`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenUsage {
    pub used: Option<u64>,
    pub limit: Option<u64>,
}

impl TokenUsage {
    fn summary(&self) -> String {
        let used = self
            .used
            .map(|v| v.to_string())
            .unwrap_or_else(|| "--".to_string());
        let limit = self
            .limit
            .map(|v| v.to_string())
            .unwrap_or_else(|| "--".to_string());
        format!("{used}/{limit}")
    }
}

/// Metadata rendered in the shell header.
#[derive(Debug, Clone, Default)]
pub struct StatusLine {
    pub epic_alias: String,
    pub epic_id: String,
    pub bead_id: String,
    pub bead_title: String,
    pub run_status: String,
    pub started_at: Option<Instant>,
    pub tokens: TokenUsage,
}

impl StatusLine {
    fn bead_summary(&self) -> String {
        let id = self.bead_id.trim();
        let title = self.bead_title.trim();
        match (id.is_empty(), title.is_empty()) {
            (true, true) => "pending selection".to_string(),
            (true, false) => title.to_string(),
            (false, true) => id.to_string(),
            (false, false) => format!("{id} - {title}"),
        }
    }

    fn elapsed(&self, now: Instant) -> String {
        match self.started_at {
            Some(started) if now >= started => format_elapsed(now - started),
            _ => "00:00".to_string(),
        }
    }
}

fn format_elapsed(elapsed: Duration) -> String {
    let seconds = elapsed.as_secs();
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;
    if hours > 0 {
        format!("{hours}:{minutes:02}:{secs:02}")
    } else {
        format!("{minutes:02}:{secs:02}")
    }
}

struct ShellState {
    header: String,
    footer: Vec<String>,
    pane: LogPane,
    session: SessionState,
    exit_label: String,
    paused: bool,
    help: bool,
    hint_active: bool,
    hint_text: String,
    status: StatusLine,
}

/// Raw-mode session view. Rendering is idempotent and driven by events, the
/// one-second tick, and explicit render requests.
pub struct Shell {
    state: Mutex<ShellState>,
    render_notify: tokio::sync::Notify,
}

impl Shell {
    pub fn new(header: &str, footer_hints: Vec<String>) -> Self {
        let header = if header.is_empty() {
            DEFAULT_HEADER.to_string()
        } else {
            header.to_string()
        };
        Self {
            state: Mutex::new(ShellState {
                header,
                footer: footer_hints,
                pane: LogPane::new(DEFAULT_MAX_LOGS),
                session: SessionState::Starting,
                exit_label: String::new(),
                paused: false,
                help: false,
                hint_active: false,
                hint_text: String::new(),
                status: StatusLine {
                    run_status: SessionState::Starting.to_string(),
                    ..StatusLine::default()
                },
            }),
            render_notify: tokio::sync::Notify::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ShellState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Applies a session event to the view state.
    pub fn handle_event(&self, event: &SessionEvent) {
        let mut state = self.lock();
        match event {
            SessionEvent::LogChunk { chunk, .. } => state.pane.append(chunk),
            SessionEvent::StateChange { state: next, .. } => state.session = *next,
            SessionEvent::Exit {
                exit_code, error, ..
            } => {
                state.pane.flush_partial();
                state.exit_label = match error {
                    Some(err) => format!("exit {exit_code} ({err})"),
                    None => format!("exit {exit_code}"),
                };
                state.session = SessionState::Exited;
            }
        }
    }

    /// Appends an out-of-band line to the log pane (operator event mirror).
    pub fn append_chunk(&self, chunk: &str) {
        self.lock().pane.append(chunk);
        self.request_render();
    }

    pub fn flush_pending(&self) {
        self.lock().pane.flush_partial();
    }

    /// Positive deltas scroll toward older history.
    pub fn scroll(&self, delta: isize) {
        self.lock().pane.scroll_by(delta);
        self.request_render();
    }

    pub fn toggle_pause(&self) -> bool {
        let mut state = self.lock();
        let target = !state.paused;
        set_paused_locked(&mut state, target)
    }

    pub fn set_paused(&self, paused: bool) -> bool {
        let mut state = self.lock();
        set_paused_locked(&mut state, paused)
    }

    pub fn paused(&self) -> bool {
        self.lock().paused
    }

    /// Toggles hint-entry mode and updates the visible text.
    pub fn set_hint_input(&self, active: bool, text: &str) {
        let mut state = self.lock();
        state.hint_active = active;
        state.hint_text = if active { text.to_string() } else { String::new() };
        drop(state);
        self.request_render();
    }

    pub fn hint_input(&self) -> (String, bool) {
        let state = self.lock();
        (state.hint_text.clone(), state.hint_active)
    }

    pub fn toggle_help(&self) -> bool {
        let mut state = self.lock();
        state.help = !state.help;
        let visible = state.help;
        drop(state);
        self.request_render();
        visible
    }

    pub fn help_visible(&self) -> bool {
        self.lock().help
    }

    /// Mutates the header metadata and schedules a refresh.
    pub fn update_status(&self, update: impl FnOnce(&mut StatusLine)) {
        let mut state = self.lock();
        update(&mut state.status);
        drop(state);
        self.request_render();
    }

    /// Schedules a refresh even when no session events are flowing.
    pub fn request_render(&self) {
        self.render_notify.notify_one();
    }

    pub(crate) async fn render_requested(&self) {
        self.render_notify.notified().await;
    }

    /// Renders the full layout into the frame.
    pub fn draw(&self, frame: &mut Frame) {
        let state = self.lock();
        let area = frame.area();

        let hint_height = u16::from(state.hint_active);
        let footer_height = footer_line_count(&state).max(1) as u16;
        let [header_area, _, log_area, hint_area, _, footer_area] = Layout::vertical([
            Constraint::Length(3),
            Constraint::Length(1),
            Constraint::Min(1),
            Constraint::Length(hint_height),
            Constraint::Length(1),
            Constraint::Length(footer_height),
        ])
        .areas(area);

        frame.render_widget(Paragraph::new(header_lines(&state)), header_area);

        let visible = state.pane.visible(log_area.height as usize);
        let log_lines: Vec<Line> = visible.into_iter().map(Line::from).collect();
        frame.render_widget(Paragraph::new(log_lines), log_area);

        if state.hint_active {
            let hint = format!("Hint (Enter=send, Esc=cancel): {}", state.hint_text);
            frame.render_widget(Paragraph::new(hint), hint_area);
        }

        frame.render_widget(Paragraph::new(footer_lines(&state)), footer_area);
    }
}

fn set_paused_locked(state: &mut ShellState, target: bool) -> bool {
    let paused = state.pane.set_paused(target);
    if !paused {
        state.pane.reset_scroll();
    }
    state.paused = paused;
    paused
}

fn header_lines(state: &ShellState) -> Vec<Line<'static>> {
    let alias = state.status.epic_alias.trim();
    let alias = if alias.is_empty() { "n/a" } else { alias };
    let epic_id = state.status.epic_id.trim();
    let epic_id = if epic_id.is_empty() { "-" } else { epic_id };
    let epic_line = format!(
        "Epic: {alias} ({epic_id}) | Bead: {}",
        state.status.bead_summary()
    );

    let status_text = state.status.run_status.trim();
    let status_text = if status_text.is_empty() {
        state.session.to_string()
    } else {
        status_text.to_string()
    };
    let mut segments = vec![status_text];
    if !state.exit_label.is_empty() {
        segments.push(state.exit_label.clone());
    }
    if state.paused {
        segments.push("PAUSED".to_string());
    }
    let status_line = format!(
        "Status: {} | Elapsed: {} | Tokens: {}",
        segments.join("  *  "),
        state.status.elapsed(Instant::now()),
        state.status.tokens.summary()
    );

    vec![
        Line::from(Span::from(state.header.clone()).bold()),
        Line::from(epic_line),
        Line::from(status_line),
    ]
}

fn footer_lines(state: &ShellState) -> Vec<Line<'static>> {
    let mut lines = Vec::new();
    if !state.footer.is_empty() {
        lines.push(Line::from(
            Span::from(format!("Hotkeys: {}", state.footer.join("  *  "))).dim(),
        ));
    }
    if state.help {
        for help in HELP_OVERLAY_LINES {
            lines.push(Line::from(help));
        }
    }
    if lines.is_empty() {
        lines.push(Line::from(""));
    }
    lines
}

fn footer_line_count(state: &ShellState) -> usize {
    let mut count = 0;
    if !state.footer.is_empty() {
        count += 1;
    }
    if state.help {
        count += HELP_OVERLAY_LINES.len();
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn shell() -> Shell {
        Shell::new("Test Session", vec!["p: pause".to_string()])
    }

    fn log_event(chunk: &str) -> SessionEvent {
        SessionEvent::LogChunk {
            time: Utc::now(),
            chunk: chunk.to_string(),
        }
    }

    #[test]
    fn handles_the_event_lifecycle() {
        let shell = shell();
        shell.handle_event(&SessionEvent::StateChange {
            time: Utc::now(),
            state: SessionState::Running,
        });
        shell.handle_event(&log_event("working\npartial"));
        shell.handle_event(&SessionEvent::Exit {
            time: Utc::now(),
            exit_code: 0,
            error: None,
        });

        let state = shell.lock();
        assert_eq!(state.session, SessionState::Exited);
        assert_eq!(state.exit_label, "exit 0");
        // Exit flushes the pending partial line.
        assert_eq!(state.pane.visible(10), vec!["working", "partial"]);
    }

    #[test]
    fn exit_with_error_is_labelled() {
        let shell = shell();
        shell.handle_event(&SessionEvent::Exit {
            time: Utc::now(),
            exit_code: 1,
            error: Some("stream agent output: broken pipe".to_string()),
        });
        assert_eq!(
            shell.lock().exit_label,
            "exit 1 (stream agent output: broken pipe)"
        );
    }

    #[test]
    fn pause_toggle_round_trips() {
        let shell = shell();
        shell.handle_event(&log_event("a\nb\n"));
        assert!(shell.toggle_pause());
        shell.handle_event(&log_event("c\n"));
        {
            let state = shell.lock();
            assert_eq!(state.pane.visible(10), vec!["a", "b"]);
        }
        assert!(!shell.toggle_pause());
        let state = shell.lock();
        assert_eq!(state.pane.visible(10), vec!["a", "b", "c"]);
    }

    #[test]
    fn hint_input_round_trips() {
        let shell = shell();
        shell.set_hint_input(true, "half a hint");
        assert_eq!(shell.hint_input(), ("half a hint".to_string(), true));
        shell.set_hint_input(false, "ignored");
        assert_eq!(shell.hint_input(), (String::new(), false));
    }

    #[test]
    fn help_overlay_toggles() {
        let shell = shell();
        assert!(shell.toggle_help());
        assert!(shell.help_visible());
        assert!(!shell.toggle_help());
    }

    #[test]
    fn bead_summary_prefers_id_and_title() {
        let mut status = StatusLine::default();
        assert_eq!(status.bead_summary(), "pending selection");
        status.bead_id = "proj-1.a".to_string();
        assert_eq!(status.bead_summary(), "proj-1.a");
        status.bead_title = "Wire it up".to_string();
        assert_eq!(status.bead_summary(), "proj-1.a - Wire it up");
    }

    #[test]
    fn elapsed_formats_minutes_and_hours() {
        assert_eq!(format_elapsed(Duration::from_secs(0)), "00:00");
        assert_eq!(format_elapsed(Duration::from_secs(65)), "01:05");
        assert_eq!(format_elapsed(Duration::from_secs(3_700)), "1:01:40");
    }

    #[test]
    fn tokens_render_with_placeholders() {
        let tokens = TokenUsage::default();
        assert_eq!(tokens.summary(), "--/--");
        let tokens = TokenUsage {
            used: Some(1200),
            limit: Some(8000),
        };
        assert_eq!(tokens.summary(), "1200/8000");
    }

    #[test]
    fn draw_renders_into_a_test_backend() {
        use ratatui::Terminal;
        use ratatui::backend::TestBackend;

        let shell = shell();
        shell.update_status(|status| {
            status.epic_alias = "pay".to_string();
            status.epic_id = "pay-7-payments".to_string();
        });
        shell.handle_event(&log_event("hello pane\n"));
        shell.set_hint_input(true, "typed");

        let mut terminal = Terminal::new(TestBackend::new(60, 16)).unwrap();
        terminal.draw(|frame| shell.draw(frame)).unwrap();
        let buffer = terminal.backend().buffer();
        let mut rendered = String::new();
        for y in 0..buffer.area.height {
            for x in 0..buffer.area.width {
                rendered.push_str(buffer[(x, y)].symbol());
            }
            rendered.push('\n');
        }
        assert!(rendered.contains("Test Session"));
        assert!(rendered.contains("Epic: pay (pay-7-payments)"));
        assert!(rendered.contains("hello pane"));
        assert!(rendered.contains("Hint (Enter=send, Esc=cancel): typed"));
        assert!(rendered.contains("Hotkeys: p: pause"));
    }
}
