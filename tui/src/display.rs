//! Ties the shell to a live terminal: raw mode, the render loop, the input
//! reader, and the one-second elapsed tick.

use std::io::Stdout;
use std::sync::Arc;
use std::time::Duration;

use crossterm::cursor;
use crossterm::event::Event;
use crossterm::event::EventStream;
use crossterm::event::KeyEventKind;
use crossterm::execute;
use crossterm::terminal::EnterAlternateScreen;
use crossterm::terminal::LeaveAlternateScreen;
use crossterm::terminal::disable_raw_mode;
use crossterm::terminal::enable_raw_mode;
use futures::StreamExt;
use obi_core::session::SessionEvent;
use ratatui::Terminal;
use ratatui::backend::CrosstermBackend;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tracing::debug;

use crate::input::InputRouter;
use crate::input::SessionControls;
use crate::shell::Shell;
use crate::shell::StatusLine;

#[derive(Debug, Error)]
pub enum TuiError {
    #[error("enable raw mode: {0}")]
    RawMode(#[source] std::io::Error),
    #[error("prepare terminal: {0}")]
    Terminal(#[source] std::io::Error),
}

/// Restores the terminal on every exit path, including panics inside the
/// render task.
struct TerminalGuard;

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
        let _ = execute!(std::io::stdout(), LeaveAlternateScreen, cursor::Show);
    }
}

pub struct DisplayOptions {
    pub header: String,
    pub footer_hints: Vec<String>,
    pub status: StatusLine,
}

/// Runs the shell against the real terminal for the duration of one session.
pub struct SessionDisplay {
    shell: Arc<Shell>,
    stop_tx: watch::Sender<bool>,
    render_task: Option<tokio::task::JoinHandle<()>>,
    input_task: Option<tokio::task::JoinHandle<()>>,
}

impl SessionDisplay {
    /// Enters raw mode synchronously (so failures surface before the session
    /// proceeds), then spawns the render and input tasks.
    pub fn start<C: SessionControls + 'static>(
        events: mpsc::Receiver<SessionEvent>,
        controls: Arc<C>,
        opts: DisplayOptions,
    ) -> Result<Self, TuiError> {
        let shell = Arc::new(Shell::new(&opts.header, opts.footer_hints));
        let status = opts.status;
        shell.update_status(move |line| *line = status);

        enable_raw_mode().map_err(TuiError::RawMode)?;
        let guard = TerminalGuard;
        let mut stdout = std::io::stdout();
        execute!(stdout, EnterAlternateScreen, cursor::Hide).map_err(TuiError::Terminal)?;
        let terminal = Terminal::new(CrosstermBackend::new(stdout)).map_err(TuiError::Terminal)?;

        let (stop_tx, stop_rx) = watch::channel(false);

        let render_task = Some(tokio::spawn(render_loop(
            Arc::clone(&shell),
            events,
            terminal,
            guard,
            stop_rx.clone(),
        )));
        let input_task = Some(tokio::spawn(input_loop(
            Arc::clone(&shell),
            controls,
            stop_rx,
        )));

        Ok(Self {
            shell,
            stop_tx,
            render_task,
            input_task,
        })
    }

    pub fn shell(&self) -> Arc<Shell> {
        Arc::clone(&self.shell)
    }

    pub fn update_status(&self, update: impl FnOnce(&mut StatusLine)) {
        self.shell.update_status(update);
    }

    /// Mirrors an operator event into the log pane.
    pub fn notify_operator_event(&self, label: &str, message: &str) {
        let message = message.trim();
        if message.is_empty() {
            return;
        }
        self.shell.append_chunk(&format!("\n[obi {label}] {message}\n"));
    }

    /// Stops both tasks and restores the terminal. Idempotent.
    pub async fn stop(&mut self) {
        let _ = self.stop_tx.send(true);
        if let Some(task) = self.input_task.take() {
            let _ = task.await;
        }
        if let Some(task) = self.render_task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for SessionDisplay {
    fn drop(&mut self) {
        // stop() is the orderly path; this covers early returns.
        let _ = self.stop_tx.send(true);
    }
}

async fn render_loop(
    shell: Arc<Shell>,
    mut events: mpsc::Receiver<SessionEvent>,
    mut terminal: Terminal<CrosstermBackend<Stdout>>,
    guard: TerminalGuard,
    mut stop_rx: watch::Receiver<bool>,
) {
    let _guard = guard;
    let mut events_open = true;
    let mut tick = tokio::time::interval(Duration::from_secs(1));
    let _ = terminal.draw(|frame| shell.draw(frame));

    loop {
        tokio::select! {
            changed = stop_rx.changed() => {
                if changed.is_err() || *stop_rx.borrow() {
                    break;
                }
            }
            maybe = events.recv(), if events_open => {
                match maybe {
                    Some(event) => shell.handle_event(&event),
                    None => {
                        // Session is done; keep rendering until stop so the
                        // operator sees the final state.
                        events_open = false;
                        shell.flush_pending();
                    }
                }
            }
            _ = tick.tick() => {}
            _ = shell.render_requested() => {}
        }
        let _ = terminal.draw(|frame| shell.draw(frame));
    }
    let _ = terminal.draw(|frame| shell.draw(frame));
}

async fn input_loop<C: SessionControls + 'static>(
    shell: Arc<Shell>,
    controls: Arc<C>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut stream = EventStream::new();
    let mut router = InputRouter::new(controls, shell);
    loop {
        tokio::select! {
            changed = stop_rx.changed() => {
                if changed.is_err() || *stop_rx.borrow() {
                    break;
                }
            }
            maybe = stream.next() => {
                match maybe {
                    Some(Ok(Event::Key(key))) if key.kind == KeyEventKind::Press => {
                        // A closed tty after exit is expected; routing errors
                        // never tear down the display.
                        if let Err(err) = router.handle_key(key).await {
                            debug!(error = %err, "input routing failed");
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        debug!(error = %err, "terminal input stream failed");
                        break;
                    }
                    None => break,
                }
            }
        }
    }
}
