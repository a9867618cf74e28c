//! Maps host signals onto session controls.
//!
//! First interrupt asks the agent to wrap up, a second interrupt aborts, and
//! terminate/hangup abort immediately. Relay failures are logged and
//! swallowed: signals are best-effort.

use std::future::Future;
use std::io::Write;

use tokio::sync::watch;
use tracing::warn;

use crate::session::SessionError;
use crate::session::SessionHandle;

const INTERRUPT_SOFT_STOP_REASON: &str = "Operator pressed Ctrl+C";

/// The session operations the relay drives. Implemented by
/// [`SessionHandle`]; tests substitute recorders. The futures are `Send` so
/// the listener task can await them.
pub trait SignalSession: Send + Sync {
    fn soft_stop(&self, reason: &str) -> impl Future<Output = Result<(), SessionError>> + Send;
    fn abort(&self) -> impl Future<Output = Result<(), SessionError>> + Send;
}

impl SignalSession for SessionHandle {
    async fn soft_stop(&self, reason: &str) -> Result<(), SessionError> {
        SessionHandle::soft_stop(self, reason).await
    }

    async fn abort(&self) -> Result<(), SessionError> {
        SessionHandle::abort(self).await
    }
}

/// Host signals the relay understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelaySignal {
    Interrupt,
    Terminate,
    Hangup,
}

/// Signal-to-control state machine, separated from the listener task so the
/// escalation policy is testable without delivering real signals.
pub struct SignalRelay<S> {
    handle: S,
    out: Option<Box<dyn Write + Send>>,
    soft_stop_sent: bool,
}

impl<S: SignalSession> SignalRelay<S> {
    pub fn new(handle: S, out: Option<Box<dyn Write + Send>>) -> Self {
        Self {
            handle,
            out,
            soft_stop_sent: false,
        }
    }

    pub async fn handle_signal(&mut self, signal: RelaySignal) {
        match signal {
            RelaySignal::Interrupt => {
                if !self.soft_stop_sent {
                    self.soft_stop_sent = true;
                    self.print("\nCtrl+C received – requesting soft stop...\n");
                    let result = self.handle.soft_stop(INTERRUPT_SOFT_STOP_REASON).await;
                    if let Err(err) = result {
                        warn!(error = %err, "soft stop failed");
                        self.print(&format!("Soft stop failed: {err}\n"));
                    }
                    return;
                }
                self.print("\nSecond Ctrl+C detected – aborting session.\n");
                let result = self.handle.abort().await;
                if let Err(err) = result {
                    warn!(error = %err, "abort failed");
                    self.print(&format!("Abort failed: {err}\n"));
                }
            }
            RelaySignal::Terminate | RelaySignal::Hangup => {
                let name = match signal {
                    RelaySignal::Terminate => "SIGTERM",
                    _ => "SIGHUP",
                };
                self.print(&format!("\nReceived {name} – aborting session immediately.\n"));
                let result = self.handle.abort().await;
                if let Err(err) = result {
                    warn!(error = %err, "abort failed");
                    self.print(&format!("Abort failed: {err}\n"));
                }
            }
        }
    }

    fn print(&mut self, text: &str) {
        if let Some(out) = self.out.as_mut() {
            let _ = out.write_all(text.as_bytes());
            let _ = out.flush();
        }
    }
}

/// Stops the listener task when dropped. The surrounding run holds this for
/// the lifetime of one session.
pub struct RelayGuard {
    stop: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

impl Drop for RelayGuard {
    fn drop(&mut self) {
        let _ = self.stop.send(true);
        self.task.abort();
    }
}

/// Spawns the listener for SIGINT, SIGTERM, and SIGHUP.
pub fn spawn<S>(handle: S, out: Option<Box<dyn Write + Send>>) -> RelayGuard
where
    S: SignalSession + 'static,
{
    let (stop_tx, mut stop_rx) = watch::channel(false);
    let task = tokio::spawn(async move {
        use tokio::signal::unix::SignalKind;
        use tokio::signal::unix::signal;

        let mut relay = SignalRelay::new(handle, out);
        let (mut interrupt, mut terminate, mut hangup) = match (
            signal(SignalKind::interrupt()),
            signal(SignalKind::terminate()),
            signal(SignalKind::hangup()),
        ) {
            (Ok(i), Ok(t), Ok(h)) => (i, t, h),
            _ => {
                warn!("failed to install signal handlers; relay disabled");
                return;
            }
        };

        loop {
            tokio::select! {
                _ = stop_rx.changed() => break,
                Some(()) = interrupt.recv() => relay.handle_signal(RelaySignal::Interrupt).await,
                Some(()) = terminate.recv() => relay.handle_signal(RelaySignal::Terminate).await,
                Some(()) = hangup.recv() => relay.handle_signal(RelaySignal::Hangup).await,
            }
        }
    });
    RelayGuard {
        stop: stop_tx,
        task,
    }
}
