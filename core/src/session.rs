//! PTY session runner.
//!
//! Owns the agent process and its PTY from spawn until exit, surfaces
//! lifecycle events, tees redacted output, and exposes the operator controls
//! (soft stop, abort, hint, raw input). One session means one process, one
//! output copier, one wait watcher, and exactly one `Exit` event before the
//! event channel closes.

use std::io::Read;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::LockedWriter;
use crate::codex::Invocation;
use crate::launcher;
use crate::launcher::LaunchError;
use crate::launcher::LaunchedProcess;
use crate::launcher::Launcher;
use crate::redact::Redactor;

/// Marker sent to the agent when operators request an orderly shutdown.
pub const SOFT_STOP_MARKER: &str = "[[OBI:SOFT_STOP]]";
/// Marker preceding operator hints injected into the agent.
pub const HUMAN_HINT_MARKER: &str = "[[OBI:HUMAN_HINT]]";

const EVENT_BUFFER_SIZE: usize = 64;
const READ_BUF_SIZE: usize = 8192;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invocation binary is required")]
    MissingBinary,
    #[error("session id is required")]
    MissingSessionId,
    #[error("prompt is required")]
    MissingPrompt,
    #[error(transparent)]
    Launch(#[from] LaunchError),
    #[error("stream agent output: {0}")]
    StreamCopy(#[source] std::io::Error),
    #[error("agent run failed: {0}")]
    RunFailed(String),
    #[error("tty closed")]
    TtyClosed,
    #[error("write soft stop: {0}")]
    WriteSoftStop(#[source] std::io::Error),
    #[error("write hint: {0}")]
    WriteHint(#[source] std::io::Error),
    #[error("write input: {0}")]
    WriteInput(#[source] std::io::Error),
    #[error("abort session: {0}")]
    Abort(#[source] std::io::Error),
    #[error("session result already consumed")]
    AlreadyWaited,
}

/// High-level lifecycle phases of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Starting,
    Running,
    Stopping,
    Exited,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Starting => "starting",
            SessionState::Running => "running",
            SessionState::Stopping => "stopping",
            SessionState::Exited => "exited",
        };
        f.write_str(name)
    }
}

/// Events surfaced to the shell and other consumers. The stream is finite:
/// state changes in lifecycle order, interleaved log chunks, then one `Exit`
/// followed by channel closure.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    LogChunk {
        time: DateTime<Utc>,
        chunk: String,
    },
    StateChange {
        time: DateTime<Utc>,
        state: SessionState,
    },
    Exit {
        time: DateTime<Utc>,
        exit_code: i32,
        error: Option<String>,
    },
}

/// Final prompt text plus the session UUID embedded in it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedPrompt {
    pub session_id: String,
    pub text: String,
}

/// Structured outcome of one agent session.
#[derive(Debug, Clone)]
pub struct SessionResult {
    pub session_id: String,
    pub prompt: String,
    pub invocation: Invocation,
    /// Cumulative output with secrets redacted.
    pub output: String,
    /// Whether redaction changed any output chunk.
    pub redacted: bool,
    pub exit_code: i32,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

/// Options for [`SessionRunner::start`].
pub struct StartOptions {
    pub session_id: String,
    pub prompt: String,
    pub invocation: Invocation,
    /// Live operator stream; written verbatim, never redacted.
    pub stdout: Option<Box<dyn Write + Send>>,
    /// Transcript tee; receives the redacted stream.
    pub tee: Option<LockedWriter>,
    pub secrets: Vec<String>,
    pub dir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl StartOptions {
    pub fn new(session_id: String, prompt: String, invocation: Invocation) -> Self {
        Self {
            session_id,
            prompt,
            invocation,
            stdout: None,
            tee: None,
            secrets: Vec::new(),
            dir: None,
            env: Vec::new(),
        }
    }
}

/// Launches agent sessions inside a PTY and hands back lifecycle handles.
pub struct SessionRunner {
    launcher: Arc<dyn Launcher>,
    preflight: fn() -> Result<(), LaunchError>,
}

impl Default for SessionRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRunner {
    pub fn new() -> Self {
        Self {
            launcher: launcher::default_launcher(),
            preflight: launcher::preflight,
        }
    }

    /// Injects a specific launcher and skips the host PTY preflight (used by
    /// tests).
    pub fn with_launcher(launcher: Arc<dyn Launcher>) -> Self {
        Self {
            launcher,
            preflight: || Ok(()),
        }
    }

    /// Appends the fenced-report instructions (keyed on a fresh session UUID)
    /// and the legacy footer request to the prompt body.
    pub fn prepare_prompt(&self, body: &str) -> PreparedPrompt {
        let session_id = Uuid::new_v4().to_string();
        let body = body.trim();
        let instructions = fenced_report_instructions(&session_id);
        let text = if body.is_empty() {
            instructions
        } else {
            format!("{body}\n\n{instructions}")
        };
        PreparedPrompt { session_id, text }
    }

    /// Spawns the agent and returns a handle once the PTY is attached.
    /// `Starting` and `Running` transitions are emitted on the event channel.
    pub async fn start(&self, opts: StartOptions) -> Result<SessionHandle, SessionError> {
        if opts.invocation.binary.is_empty() {
            return Err(SessionError::MissingBinary);
        }
        if opts.session_id.trim().is_empty() {
            return Err(SessionError::MissingSessionId);
        }
        if opts.prompt.trim().is_empty() {
            return Err(SessionError::MissingPrompt);
        }

        (self.preflight)()?;

        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER_SIZE);
        emit_state(&event_tx, SessionState::Starting).await;

        let started_at = Utc::now();
        let launcher = Arc::clone(&self.launcher);
        let invocation = opts.invocation.clone();
        let dir = opts.dir.clone();
        let env = opts.env.clone();
        let launched = tokio::task::spawn_blocking(move || {
            launcher.launch(&invocation, dir.as_deref(), &env)
        })
        .await
        .map_err(|err| SessionError::RunFailed(err.to_string()))??;

        emit_state(&event_tx, SessionState::Running).await;

        let LaunchedProcess {
            reader,
            writer,
            waiter,
            interrupter,
            killer,
        } = launched;

        let shared = Arc::new(SessionShared {
            session_id: opts.session_id.clone(),
            writer: Mutex::new(Some(writer)),
            interrupter,
            killer,
            soft_stop_issued: Mutex::new(false),
            abort_issued: AtomicBool::new(false),
            events_tx: Mutex::new(Some(event_tx.clone())),
        });

        let redactor = Redactor::new(opts.secrets.clone());
        let copier = spawn_output_copier(reader, opts.stdout, opts.tee, redactor, event_tx);

        let (outcome_tx, outcome_rx) = oneshot::channel();
        let supervisor_shared = Arc::clone(&shared);
        let session_id = opts.session_id.clone();
        let prompt = opts.prompt.clone();
        let invocation = opts.invocation.clone();
        tokio::spawn(async move {
            supervise(
                supervisor_shared,
                copier,
                waiter,
                session_id,
                prompt,
                invocation,
                started_at,
                outcome_tx,
            )
            .await;
        });

        Ok(SessionHandle {
            inner: Arc::new(SessionInner {
                shared,
                events_rx: Mutex::new(Some(event_rx)),
                outcome_rx: Mutex::new(Some(outcome_rx)),
            }),
        })
    }
}

/// Lifecycle controls plus result waiting for a running session.
#[derive(Clone)]
pub struct SessionHandle {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    shared: Arc<SessionShared>,
    events_rx: Mutex<Option<mpsc::Receiver<SessionEvent>>>,
    outcome_rx: Mutex<Option<oneshot::Receiver<(SessionResult, Option<SessionError>)>>>,
}

struct SessionShared {
    session_id: String,
    /// Write side of the PTY; `None` once the session has exited.
    writer: Mutex<Option<Box<dyn Write + Send>>>,
    interrupter: Box<dyn Fn() -> std::io::Result<()> + Send + Sync>,
    killer: Box<dyn Fn() -> std::io::Result<()> + Send + Sync>,
    soft_stop_issued: Mutex<bool>,
    abort_issued: AtomicBool,
    events_tx: Mutex<Option<mpsc::Sender<SessionEvent>>>,
}

impl SessionShared {
    /// Delivers a state transition reliably. The sender is cloned out so no
    /// lock is held across the await.
    async fn emit_state(&self, state: SessionState) {
        let tx = self
            .events_tx
            .lock()
            .ok()
            .and_then(|guard| guard.as_ref().cloned());
        if let Some(tx) = tx {
            emit_state(&tx, state).await;
        }
    }
}

impl SessionHandle {
    /// Takes the event stream. The channel closes after the `Exit` event;
    /// only the first caller receives it.
    pub fn events(&self) -> Option<mpsc::Receiver<SessionEvent>> {
        self.inner.events_rx.lock().ok().and_then(|mut g| g.take())
    }

    /// Writes the soft-stop marker once; later calls are no-ops. The
    /// `Stopping` transition is delivered before this returns.
    pub async fn soft_stop(&self, reason: &str) -> Result<(), SessionError> {
        let shared = &self.inner.shared;
        {
            let mut issued = shared
                .soft_stop_issued
                .lock()
                .map_err(|_| SessionError::TtyClosed)?;
            if *issued {
                return Ok(());
            }
            let message = format_soft_stop_message(&shared.session_id, reason);
            let mut guard = shared.writer.lock().map_err(|_| SessionError::TtyClosed)?;
            let writer = guard.as_mut().ok_or(SessionError::TtyClosed)?;
            writer
                .write_all(message.as_bytes())
                .and_then(|()| writer.flush())
                .map_err(SessionError::WriteSoftStop)?;
            *issued = true;
        }
        shared.emit_state(SessionState::Stopping).await;
        Ok(())
    }

    /// Interrupts the agent. Idempotent: only the first call signals.
    pub async fn abort(&self) -> Result<(), SessionError> {
        let shared = &self.inner.shared;
        if shared.abort_issued.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Err(interrupt_err) = (shared.interrupter)() {
            if let Err(kill_err) = (shared.killer)() {
                tracing::warn!(error = %kill_err, "kill after failed interrupt also failed");
                return Err(SessionError::Abort(interrupt_err));
            }
        }
        shared.emit_state(SessionState::Stopping).await;
        Ok(())
    }

    /// Injects an operator hint as an indented YAML block.
    pub fn submit_hint(&self, text: &str) -> Result<(), SessionError> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Ok(());
        }
        let shared = &self.inner.shared;
        let message = format_hint_message(&shared.session_id, trimmed);
        let mut guard = shared.writer.lock().map_err(|_| SessionError::TtyClosed)?;
        let writer = guard.as_mut().ok_or(SessionError::TtyClosed)?;
        writer
            .write_all(message.as_bytes())
            .and_then(|()| writer.flush())
            .map_err(SessionError::WriteHint)
    }

    /// Forwards raw bytes to the agent PTY.
    pub fn write_input(&self, data: &[u8]) -> Result<(), SessionError> {
        if data.is_empty() {
            return Ok(());
        }
        let shared = &self.inner.shared;
        let mut guard = shared.writer.lock().map_err(|_| SessionError::TtyClosed)?;
        let writer = guard.as_mut().ok_or(SessionError::TtyClosed)?;
        writer
            .write_all(data)
            .and_then(|()| writer.flush())
            .map_err(SessionError::WriteInput)
    }

    /// Blocks until the agent exits and returns the session result. Only the
    /// first caller receives it.
    pub async fn wait(&self) -> Result<SessionResult, SessionError> {
        let rx = self
            .inner
            .outcome_rx
            .lock()
            .ok()
            .and_then(|mut g| g.take())
            .ok_or(SessionError::AlreadyWaited)?;
        let (result, err) = rx
            .await
            .map_err(|_| SessionError::RunFailed("session supervisor terminated".to_string()))?;
        match err {
            Some(err) => Err(err),
            None => Ok(result),
        }
    }
}

struct CopierOutcome {
    output: String,
    redacted: bool,
    copy_error: Option<std::io::Error>,
}

/// Reads the PTY master and drives the output pipeline: live stream verbatim,
/// redact, cumulative buffer, tee, lossy `LogChunk` event.
fn spawn_output_copier(
    mut reader: Box<dyn Read + Send>,
    mut live: Option<Box<dyn Write + Send>>,
    tee: Option<LockedWriter>,
    redactor: Redactor,
    events: mpsc::Sender<SessionEvent>,
) -> tokio::task::JoinHandle<CopierOutcome> {
    tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; READ_BUF_SIZE];
        let mut output = String::new();
        let mut any_redacted = false;
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    let chunk = String::from_utf8_lossy(&buf[..n]).into_owned();
                    if let Some(live) = live.as_mut()
                        && let Err(err) = live
                            .write_all(chunk.as_bytes())
                            .and_then(|()| live.flush())
                    {
                        return CopierOutcome {
                            output,
                            redacted: any_redacted,
                            copy_error: Some(err),
                        };
                    }
                    let (redacted, changed) = redactor.redact(&chunk);
                    any_redacted |= changed;
                    output.push_str(&redacted);
                    if let Some(tee) = &tee
                        && let Err(err) = tee.write_str(&redacted)
                    {
                        return CopierOutcome {
                            output,
                            redacted: any_redacted,
                            copy_error: Some(err),
                        };
                    }
                    // A blocked consumer loses the event, never the
                    // cumulative buffer.
                    let _ = events.try_send(SessionEvent::LogChunk {
                        time: Utc::now(),
                        chunk: redacted,
                    });
                }
                Err(ref err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(5));
                    continue;
                }
                // PTY masters report EIO once the child side closes; treat
                // any read failure as end of stream.
                Err(_) => break,
            }
        }
        CopierOutcome {
            output,
            redacted: any_redacted,
            copy_error: None,
        }
    })
}

#[allow(clippy::too_many_arguments)]
async fn supervise(
    shared: Arc<SessionShared>,
    copier: tokio::task::JoinHandle<CopierOutcome>,
    waiter: Box<dyn FnOnce() -> std::io::Result<i32> + Send>,
    session_id: String,
    prompt: String,
    invocation: Invocation,
    started_at: DateTime<Utc>,
    outcome_tx: oneshot::Sender<(SessionResult, Option<SessionError>)>,
) {
    let wait_res = tokio::task::spawn_blocking(waiter).await;
    let copier_out = copier.await.unwrap_or_else(|err| CopierOutcome {
        output: String::new(),
        redacted: false,
        copy_error: Some(std::io::Error::other(err.to_string())),
    });

    // Close the PTY write side; handle operations report "tty closed" from
    // here on.
    if let Ok(mut guard) = shared.writer.lock() {
        guard.take();
    }

    let completed_at = Utc::now();
    let mut exit_code = 0;
    let mut run_err: Option<SessionError> = None;

    if let Some(err) = copier_out.copy_error {
        run_err = Some(SessionError::StreamCopy(err));
    } else {
        match wait_res {
            Ok(Ok(code)) => exit_code = code,
            Ok(Err(err)) => run_err = Some(SessionError::RunFailed(err.to_string())),
            Err(err) => run_err = Some(SessionError::RunFailed(err.to_string())),
        }
    }

    if run_err.is_some() && exit_code == 0 {
        exit_code = 1;
    }

    let error_label = run_err.as_ref().map(|err| err.to_string());

    // Final transitions are delivered reliably; the copier has drained, so
    // the only other sender is the handle's, which is cleared before closing.
    let events_tx = shared.events_tx.lock().ok().and_then(|mut g| g.take());
    if let Some(tx) = events_tx {
        if error_label.is_some() {
            emit_state(&tx, SessionState::Stopping).await;
        }
        emit_state(&tx, SessionState::Exited).await;
        let _ = tx
            .send(SessionEvent::Exit {
                time: Utc::now(),
                exit_code,
                error: error_label,
            })
            .await;
    }

    let result = SessionResult {
        session_id,
        prompt,
        invocation,
        output: copier_out.output,
        redacted: copier_out.redacted,
        exit_code,
        started_at,
        completed_at,
    };
    let _ = outcome_tx.send((result, run_err));
}

/// Reliable `StateChange` delivery. `LogChunk` is the only event allowed to
/// drop under back-pressure.
async fn emit_state(tx: &mpsc::Sender<SessionEvent>, state: SessionState) {
    let _ = tx
        .send(SessionEvent::StateChange {
            time: Utc::now(),
            state,
        })
        .await;
}

fn format_soft_stop_message(session_id: &str, reason: &str) -> String {
    let mut message = format!("\n\n{SOFT_STOP_MARKER} {session_id}\n");
    let reason = reason.trim();
    if !reason.is_empty() {
        message.push_str("Reason: ");
        message.push_str(reason);
        message.push('\n');
    }
    message.push_str("Please wrap up immediately and emit your fenced report.\n\n");
    message
}

fn format_hint_message(session_id: &str, hint: &str) -> String {
    let mut message = format!("\n\n{HUMAN_HINT_MARKER} {session_id}\nHint: |\n");
    for line in hint.trim().replace("\r\n", "\n").split('\n') {
        message.push_str("  ");
        message.push_str(line);
        message.push('\n');
    }
    message.push('\n');
    message
}

fn fenced_report_instructions(session_id: &str) -> String {
    format!(
        "When you finish the bead, emit a fenced report Obi can parse:\n\n\
         ```obi:{session_id}\n\
         status: success|needs_help\n\
         commit_msg: <single-line imperative summary>\n\
         details: |\n  <multi-line explanation of everything you changed>\n\
         escalation: <reason>  # required when status=needs_help\n\
         ```\n\n\
         If you receive a line containing {SOFT_STOP_MARKER}, finish your current action and emit the fenced report immediately.\n\n\
         After the fenced report, also output the legacy footer so older tooling continues to work:\n\
         STATUS: success|needs_help\n\
         COMMIT_MSG:\n\
         <same multi-line summary as above>\n\
         ESCALATION: <reason>  # only if status=needs_help"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::PipeLauncher;
    use std::sync::Mutex as StdMutex;

    fn sh_invocation(script: &str) -> Invocation {
        Invocation {
            binary: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
        }
    }

    fn runner() -> SessionRunner {
        SessionRunner::with_launcher(Arc::new(PipeLauncher))
    }

    fn options(script: &str) -> StartOptions {
        StartOptions::new(
            "test-session".to_string(),
            "prompt body".to_string(),
            sh_invocation(script),
        )
    }

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<StdMutex<Vec<u8>>>);

    impl SharedBuf {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn prepare_prompt_embeds_session_id_and_footer_request() {
        let prepared = runner().prepare_prompt("do the thing");
        assert!(prepared.text.starts_with("do the thing\n\n"));
        assert!(prepared
            .text
            .contains(&format!("```obi:{}", prepared.session_id)));
        assert!(prepared.text.contains("STATUS: success|needs_help"));
        assert!(prepared.text.contains(SOFT_STOP_MARKER));
        assert_eq!(prepared.session_id.len(), 36);
    }

    #[test]
    fn prepare_prompt_with_empty_body_is_instructions_only() {
        let prepared = runner().prepare_prompt("   ");
        assert!(prepared.text.starts_with("When you finish the bead"));
    }

    #[test]
    fn prepared_session_ids_are_unique() {
        let runner = runner();
        let a = runner.prepare_prompt("x");
        let b = runner.prepare_prompt("x");
        assert_ne!(a.session_id, b.session_id);
    }

    #[tokio::test]
    async fn start_rejects_missing_fields() {
        let runner = runner();
        let mut opts = options("true");
        opts.invocation.binary = String::new();
        assert!(matches!(
            runner.start(opts).await,
            Err(SessionError::MissingBinary)
        ));

        let mut opts = options("true");
        opts.session_id = "  ".to_string();
        assert!(matches!(
            runner.start(opts).await,
            Err(SessionError::MissingSessionId)
        ));

        let mut opts = options("true");
        opts.prompt = String::new();
        assert!(matches!(
            runner.start(opts).await,
            Err(SessionError::MissingPrompt)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn emits_lifecycle_events_in_order() {
        let runner = runner();
        let handle = runner
            .start(options("echo one; echo two"))
            .await
            .expect("start");
        let mut events = handle.events().expect("events");

        let mut states = Vec::new();
        let mut exits = 0;
        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::StateChange { state, .. } => states.push(state),
                SessionEvent::Exit { exit_code, error, .. } => {
                    exits += 1;
                    assert_eq!(exit_code, 0);
                    assert!(error.is_none());
                }
                SessionEvent::LogChunk { .. } => {}
            }
        }
        assert_eq!(exits, 1, "exactly one exit event");
        assert_eq!(
            states,
            vec![
                SessionState::Starting,
                SessionState::Running,
                SessionState::Exited
            ]
        );

        let result = handle.wait().await.expect("wait");
        assert!(result.output.contains("one"));
        assert!(result.output.contains("two"));
        assert_eq!(result.exit_code, 0);
        assert!(result.completed_at >= result.started_at);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn nonzero_exit_is_recorded_not_failed() {
        let handle = runner()
            .start(options("echo boom; exit 3"))
            .await
            .expect("start");
        let result = handle.wait().await.expect("wait");
        assert_eq!(result.exit_code, 3);
        assert!(result.output.contains("boom"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn output_is_redacted_everywhere_but_live_stream() {
        let live = SharedBuf::default();
        let tee = SharedBuf::default();
        let mut opts = options("echo leaking SECRET_TOKEN now");
        opts.stdout = Some(Box::new(live.clone()));
        opts.tee = Some(LockedWriter::new(Box::new(tee.clone())));
        opts.secrets = vec!["SECRET_TOKEN".to_string()];

        let handle = runner().start(opts).await.expect("start");
        let result = handle.wait().await.expect("wait");

        assert!(live.contents().contains("SECRET_TOKEN"));
        assert!(!result.output.contains("SECRET_TOKEN"));
        assert!(result.output.contains("[REDACTED]"));
        assert!(result.redacted);
        assert!(!tee.contents().contains("SECRET_TOKEN"));
        assert!(tee.contents().contains("[REDACTED]"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn soft_stop_writes_marker_once() {
        let handle = runner()
            .start(options("read a; read b; read c; read d; echo \"seen:$c|$d\""))
            .await
            .expect("start");
        handle.soft_stop("wrap it up").await.expect("soft stop");
        // Second call is a no-op.
        handle.soft_stop("ignored").await.expect("soft stop again");

        let result = handle.wait().await.expect("wait");
        assert!(result
            .output
            .contains(&format!("seen:{SOFT_STOP_MARKER} test-session|Reason: wrap it up")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn hint_is_injected_as_indented_block() {
        let handle = runner()
            .start(options(
                "read a; read b; read c; read d; read e; echo \"m:$c\"; echo \"hint:$e\"",
            ))
            .await
            .expect("start");
        handle.submit_hint("try the other branch").expect("hint");

        let result = handle.wait().await.expect("wait");
        assert!(result
            .output
            .contains(&format!("m:{HUMAN_HINT_MARKER} test-session")));
        assert!(result.output.contains("hint:try the other branch"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn write_input_reaches_the_agent() {
        let handle = runner()
            .start(options("read line; echo \"got:$line\""))
            .await
            .expect("start");
        handle.write_input(b"typed text\n").expect("write input");
        let result = handle.wait().await.expect("wait");
        assert!(result.output.contains("got:typed text"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn abort_interrupts_a_long_run() {
        let handle = runner()
            .start(options("trap 'exit 130' INT; sleep 30 & wait $!"))
            .await
            .expect("start");
        tokio::time::sleep(Duration::from_millis(200)).await;
        handle.abort().await.expect("abort");
        handle.abort().await.expect("abort is idempotent");
        let result = handle.wait().await.expect("wait");
        assert_ne!(result.exit_code, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn wait_can_only_be_consumed_once() {
        let handle = runner().start(options("true")).await.expect("start");
        handle.wait().await.expect("first wait");
        assert!(matches!(
            handle.wait().await,
            Err(SessionError::AlreadyWaited)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn controls_after_exit_report_tty_closed() {
        let handle = runner().start(options("true")).await.expect("start");
        handle.wait().await.expect("wait");
        assert!(matches!(
            handle.write_input(b"late"),
            Err(SessionError::TtyClosed)
        ));
        assert!(matches!(
            handle.submit_hint("late hint"),
            Err(SessionError::TtyClosed)
        ));
    }

    #[test]
    fn soft_stop_message_shape() {
        let message = format_soft_stop_message("abc", "because");
        assert_eq!(
            message,
            "\n\n[[OBI:SOFT_STOP]] abc\nReason: because\nPlease wrap up immediately and emit your fenced report.\n\n"
        );
        let bare = format_soft_stop_message("abc", "  ");
        assert!(!bare.contains("Reason:"));
    }

    #[test]
    fn hint_message_indents_every_line() {
        let message = format_hint_message("abc", "first\nsecond");
        assert_eq!(
            message,
            "\n\n[[OBI:HUMAN_HINT]] abc\nHint: |\n  first\n  second\n\n"
        );
    }
}
