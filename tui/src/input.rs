//! Keystroke router: hotkeys, hint capture, and pass-through writes.

use std::future::Future;
use std::sync::Arc;

use crossterm::event::KeyCode;
use crossterm::event::KeyEvent;
use crossterm::event::KeyModifiers;
use obi_core::session::SessionError;

use crate::shell::Shell;

/// Reason attached to soft stops triggered by the `s` hotkey.
pub const SOFT_STOP_REASON_DEFAULT: &str = "Operator requested soft stop (hotkey 's')";

/// Session operations the router needs. The CLI implements this over the
/// session handle so operator events can be logged alongside. Soft stop and
/// abort deliver a lifecycle transition, so they are async with `Send`
/// futures; the router is generic over the implementation.
pub trait SessionControls: Send + Sync {
    fn write_input(&self, data: &[u8]) -> Result<(), SessionError>;
    fn soft_stop(&self, reason: &str) -> impl Future<Output = Result<(), SessionError>> + Send;
    fn abort(&self) -> impl Future<Output = Result<(), SessionError>> + Send;
    fn submit_hint(&self, text: &str) -> Result<(), SessionError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputMode {
    /// Keys go to the agent, except for the hotkeys.
    Passthrough,
    /// Characters accumulate in the inline hint entry.
    HintCapture,
}

/// Interprets keystrokes, triggering hotkeys or forwarding bytes.
pub struct InputRouter<C: SessionControls> {
    controls: Arc<C>,
    shell: Arc<Shell>,
    mode: InputMode,
    hint_buf: String,
    soft_stop_reason: String,
}

impl<C: SessionControls> InputRouter<C> {
    pub fn new(controls: Arc<C>, shell: Arc<Shell>) -> Self {
        Self {
            controls,
            shell,
            mode: InputMode::Passthrough,
            hint_buf: String::new(),
            soft_stop_reason: SOFT_STOP_REASON_DEFAULT.to_string(),
        }
    }

    /// Overrides the default soft-stop reason; blank reasons are ignored.
    pub fn with_soft_stop_reason(mut self, reason: &str) -> Self {
        if !reason.trim().is_empty() {
            self.soft_stop_reason = reason.to_string();
        }
        self
    }

    pub fn mode(&self) -> InputMode {
        self.mode
    }

    pub fn hint_text(&self) -> &str {
        &self.hint_buf
    }

    pub async fn handle_key(&mut self, key: KeyEvent) -> Result<(), SessionError> {
        match self.mode {
            InputMode::HintCapture => self.handle_hint_key(key),
            InputMode::Passthrough => self.handle_passthrough_key(key).await,
        }
    }

    async fn handle_passthrough_key(&mut self, key: KeyEvent) -> Result<(), SessionError> {
        if let KeyCode::Char(c) = key.code {
            if key.modifiers.contains(KeyModifiers::CONTROL) {
                if let Some(byte) = control_byte(c) {
                    return self.controls.write_input(&[byte]);
                }
                return Ok(());
            }
            match c.to_ascii_lowercase() {
                'p' => {
                    self.shell.toggle_pause();
                    return Ok(());
                }
                'h' => {
                    self.start_hint_capture();
                    return Ok(());
                }
                's' => return self.controls.soft_stop(&self.soft_stop_reason).await,
                'q' => return self.controls.abort().await,
                '?' => {
                    self.shell.toggle_help();
                    return Ok(());
                }
                _ => {}
            }
        }
        match passthrough_bytes(key.code) {
            Some(bytes) => self.controls.write_input(&bytes),
            None => Ok(()),
        }
    }

    fn handle_hint_key(&mut self, key: KeyEvent) -> Result<(), SessionError> {
        match key.code {
            KeyCode::Esc => {
                self.exit_hint_capture();
                Ok(())
            }
            KeyCode::Enter => self.finalize_hint(),
            KeyCode::Backspace => {
                self.hint_buf.pop();
                self.sync_hint_ui();
                Ok(())
            }
            KeyCode::Char(c) if !key.modifiers.contains(KeyModifiers::CONTROL) => {
                self.hint_buf.push(c);
                self.sync_hint_ui();
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn start_hint_capture(&mut self) {
        self.mode = InputMode::HintCapture;
        self.hint_buf.clear();
        self.sync_hint_ui();
    }

    fn exit_hint_capture(&mut self) {
        self.mode = InputMode::Passthrough;
        self.hint_buf.clear();
        self.shell.set_hint_input(false, "");
    }

    fn finalize_hint(&mut self) -> Result<(), SessionError> {
        let text = self.hint_buf.clone();
        if !text.trim().is_empty() {
            self.controls.submit_hint(&text)?;
        }
        self.exit_hint_capture();
        Ok(())
    }

    fn sync_hint_ui(&self) {
        self.shell.set_hint_input(true, &self.hint_buf);
    }
}

fn control_byte(c: char) -> Option<u8> {
    let c = c.to_ascii_lowercase();
    if c.is_ascii_lowercase() {
        Some((c as u8) & 0x1f)
    } else {
        None
    }
}

fn passthrough_bytes(code: KeyCode) -> Option<Vec<u8>> {
    match code {
        KeyCode::Char(c) => {
            let mut buf = [0u8; 4];
            Some(c.encode_utf8(&mut buf).as_bytes().to_vec())
        }
        KeyCode::Enter => Some(vec![b'\r']),
        KeyCode::Tab => Some(vec![b'\t']),
        KeyCode::Backspace => Some(vec![0x7f]),
        KeyCode::Esc => Some(vec![0x1b]),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl SessionControls for Recorder {
        fn write_input(&self, data: &[u8]) -> Result<(), SessionError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("write:{}", String::from_utf8_lossy(data)));
            Ok(())
        }
        async fn soft_stop(&self, reason: &str) -> Result<(), SessionError> {
            self.calls.lock().unwrap().push(format!("soft_stop:{reason}"));
            Ok(())
        }
        async fn abort(&self) -> Result<(), SessionError> {
            self.calls.lock().unwrap().push("abort".to_string());
            Ok(())
        }
        fn submit_hint(&self, text: &str) -> Result<(), SessionError> {
            self.calls.lock().unwrap().push(format!("hint:{text}"));
            Ok(())
        }
    }

    fn router() -> (InputRouter<Recorder>, Arc<Recorder>, Arc<Shell>) {
        let recorder = Arc::new(Recorder::default());
        let shell = Arc::new(Shell::new("test", Vec::new()));
        let router = InputRouter::new(recorder.clone(), shell.clone());
        (router, recorder, shell)
    }

    fn key(code: KeyCode) -> KeyEvent {
        KeyEvent::new(code, KeyModifiers::NONE)
    }

    #[tokio::test]
    async fn hotkeys_route_to_shell_and_session() {
        let (mut router, recorder, shell) = router();

        router.handle_key(key(KeyCode::Char('p'))).await.unwrap();
        assert!(shell.paused());

        router.handle_key(key(KeyCode::Char('?'))).await.unwrap();
        assert!(shell.help_visible());

        router.handle_key(key(KeyCode::Char('S'))).await.unwrap();
        router.handle_key(key(KeyCode::Char('q'))).await.unwrap();
        assert_eq!(
            recorder.calls(),
            vec![
                format!("soft_stop:{SOFT_STOP_REASON_DEFAULT}"),
                "abort".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn unbound_keys_pass_through_verbatim() {
        let (mut router, recorder, _) = router();
        router.handle_key(key(KeyCode::Char('x'))).await.unwrap();
        router.handle_key(key(KeyCode::Enter)).await.unwrap();
        router.handle_key(key(KeyCode::Backspace)).await.unwrap();
        assert_eq!(
            recorder.calls(),
            vec!["write:x", "write:\r", "write:\u{7f}"]
        );
    }

    #[tokio::test]
    async fn control_chars_pass_through_as_bytes() {
        let (mut router, recorder, _) = router();
        router
            .handle_key(KeyEvent::new(KeyCode::Char('c'), KeyModifiers::CONTROL))
            .await
            .unwrap();
        assert_eq!(recorder.calls(), vec!["write:\u{3}"]);
    }

    #[tokio::test]
    async fn hint_capture_finalizes_on_enter() {
        let (mut router, recorder, shell) = router();
        router.handle_key(key(KeyCode::Char('h'))).await.unwrap();
        assert_eq!(router.mode(), InputMode::HintCapture);
        assert!(shell.hint_input().1);

        for c in "try x".chars() {
            router.handle_key(key(KeyCode::Char(c))).await.unwrap();
        }
        assert_eq!(router.hint_text(), "try x");
        assert_eq!(shell.hint_input().0, "try x");

        router.handle_key(key(KeyCode::Enter)).await.unwrap();
        assert_eq!(recorder.calls(), vec!["hint:try x"]);
        assert_eq!(router.mode(), InputMode::Passthrough);
        assert!(!shell.hint_input().1);
    }

    #[tokio::test]
    async fn hint_capture_backspace_and_escape() {
        let (mut router, recorder, shell) = router();
        router.handle_key(key(KeyCode::Char('h'))).await.unwrap();
        for c in "ab".chars() {
            router.handle_key(key(KeyCode::Char(c))).await.unwrap();
        }
        router.handle_key(key(KeyCode::Backspace)).await.unwrap();
        assert_eq!(router.hint_text(), "a");

        router.handle_key(key(KeyCode::Esc)).await.unwrap();
        assert_eq!(router.mode(), InputMode::Passthrough);
        assert!(!shell.hint_input().1);
        assert!(recorder.calls().is_empty(), "cancelled hints are dropped");
    }

    #[tokio::test]
    async fn empty_hint_is_not_submitted() {
        let (mut router, recorder, _) = router();
        router.handle_key(key(KeyCode::Char('h'))).await.unwrap();
        router.handle_key(key(KeyCode::Char(' '))).await.unwrap();
        router.handle_key(key(KeyCode::Enter)).await.unwrap();
        assert!(recorder.calls().is_empty());
        assert_eq!(router.mode(), InputMode::Passthrough);
    }
}
