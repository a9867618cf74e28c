//! Captures operator interventions (hints, soft stops) during a session so
//! they can be mirrored into the transcript and persisted in the ledger.

use std::sync::Mutex;

use chrono::DateTime;
use chrono::Utc;
use obi_core::LockedWriter;
use obi_core::ledger::OperatorEventKind;
use obi_core::ledger::OperatorLedgerEvent;
use obi_core::redact::Redactor;

#[derive(Debug, Clone)]
pub struct OperatorEvent {
    pub kind: OperatorEventKind,
    pub message: String,
    pub time: DateTime<Utc>,
}

/// Thread-safe intervention log with an optional transcript mirror.
pub struct OperatorLog {
    entries: Mutex<Vec<OperatorEvent>>,
    mirror: Option<LockedWriter>,
}

impl OperatorLog {
    pub fn new(mirror: Option<LockedWriter>) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            mirror,
        }
    }

    /// Records one intervention; blank messages are dropped.
    pub fn record(&self, kind: OperatorEventKind, message: &str) {
        let message = message.trim();
        if message.is_empty() {
            return;
        }
        if let Ok(mut entries) = self.entries.lock() {
            entries.push(OperatorEvent {
                kind,
                message: message.to_string(),
                time: Utc::now(),
            });
        }
        self.write_mirror(kind, message);
    }

    pub fn events(&self) -> Vec<OperatorEvent> {
        self.entries
            .lock()
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }

    /// Redacted copies for the ledger entry.
    pub fn ledger_events(&self, redactor: &Redactor) -> Vec<OperatorLedgerEvent> {
        self.events()
            .into_iter()
            .map(|event| {
                let (message, _) = redactor.redact(&event.message);
                OperatorLedgerEvent {
                    kind: event.kind,
                    message,
                    time: event.time,
                }
            })
            .collect()
    }

    fn write_mirror(&self, kind: OperatorEventKind, message: &str) {
        let Some(mirror) = &self.mirror else {
            return;
        };
        let label = match kind {
            OperatorEventKind::Hint => "operator hint",
            OperatorEventKind::SoftStop => "operator soft-stop",
        };
        let _ = mirror.write_str(&format!("\n[obi {label}] {message}\n"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

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
    fn records_and_mirrors_events() {
        let buf = SharedBuf::default();
        let log = OperatorLog::new(Some(LockedWriter::new(Box::new(buf.clone()))));
        log.record(OperatorEventKind::Hint, "  check the tests  ");
        log.record(OperatorEventKind::SoftStop, "wrap up");
        log.record(OperatorEventKind::Hint, "   ");

        let events = log.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].message, "check the tests");

        let mirrored = String::from_utf8(buf.0.lock().unwrap().clone()).unwrap();
        assert!(mirrored.contains("[obi operator hint] check the tests"));
        assert!(mirrored.contains("[obi operator soft-stop] wrap up"));
    }

    #[test]
    fn ledger_events_are_redacted() {
        let log = OperatorLog::new(None);
        log.record(OperatorEventKind::Hint, "token is sk-123");
        let events = log.ledger_events(&Redactor::new(["sk-123"]));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].message, "token is [REDACTED]");
        assert_eq!(events[0].kind, OperatorEventKind::Hint);
    }
}
