//! Streaming parser for the fenced end-of-session report.
//!
//! The agent closes every session with a block of the form:
//!
//! ```text
//! ```obi:<session-uuid>
//! status: success|needs_help
//! commit_msg: <single line>
//! details: |
//!   <indented body>
//! escalation: <reason>
//! ```
//! ```
//!
//! The parser consumes arbitrarily-split output chunks and yields at most one
//! report, validating it against the session id it was bound to.

use thiserror::Error;

use crate::footer::STATUS_NEEDS_HELP;
use crate::footer::STATUS_SUCCESS;

const FENCE_PREFIX: &str = "```obi:";
const CLOSING_FENCE: &str = "```";

/// Structured data carried by a fenced report.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FencedReport {
    pub session_id: String,
    pub status: String,
    pub commit_msg: String,
    pub details: String,
    pub escalation: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FencedError {
    #[error("fence missing session id")]
    MissingSessionId,
    #[error("fence session id {observed} does not match expected {expected}")]
    SessionMismatch { observed: String, expected: String },
    #[error("malformed line inside fenced report: {0:?}")]
    MalformedLine(String),
    #[error("status field is empty")]
    EmptyStatus,
    #[error("invalid status {0:?}")]
    InvalidStatus(String),
    #[error("commit_msg field is empty")]
    EmptyCommitMsg,
    #[error("details field specified multiple times")]
    DuplicateDetails,
    #[error("details field is empty")]
    EmptyDetails,
    #[error("details block must include content")]
    EmptyDetailsBlock,
    #[error("unknown field {0:?} in fenced report")]
    UnknownField(String),
    #[error("fenced report missing status line")]
    MissingStatus,
    #[error("fenced report missing commit_msg line")]
    MissingCommitMsg,
    #[error("fenced report missing details block")]
    MissingDetails,
    #[error("status={STATUS_NEEDS_HELP} requires escalation")]
    MissingEscalation,
    #[error("fenced report not found")]
    NotFound,
    #[error("fenced report did not close before stream ended")]
    Unterminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParserState {
    Seeking,
    InBody,
    Finished,
}

/// Incremental line machine over the three states `Seeking`, `InBody`,
/// `Finished`. Tolerates any noise before the opening fence and across chunk
/// boundaries; once finished, further feeds return the cached report.
#[derive(Debug)]
pub struct FencedParser {
    expected_id: String,
    state: ParserState,
    hold: String,
    report: FencedReport,
    collecting_details: bool,
    details: String,
}

impl FencedParser {
    /// Binds the parser to the session UUID it expects in the opening fence.
    pub fn new(session_id: &str) -> Self {
        Self {
            expected_id: session_id.trim().to_string(),
            state: ParserState::Seeking,
            hold: String::new(),
            report: FencedReport::default(),
            collecting_details: false,
            details: String::new(),
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == ParserState::Finished
    }

    /// Ingests a streamed chunk, returning the report once the fence closes.
    pub fn feed(&mut self, chunk: &str) -> Result<Option<FencedReport>, FencedError> {
        if self.state == ParserState::Finished {
            return Ok(Some(self.report.clone()));
        }
        if chunk.is_empty() {
            return Ok(None);
        }
        let normalized = chunk.replace("\r\n", "\n").replace('\r', "\n");
        self.hold.push_str(&normalized);

        while let Some(idx) = self.hold.find('\n') {
            let line = self.hold[..idx].to_string();
            self.hold.drain(..=idx);
            self.handle_line(&line)?;
            if self.state == ParserState::Finished {
                return Ok(Some(self.report.clone()));
            }
        }
        Ok(None)
    }

    /// Flushes buffered text once the stream ends. A report still open at
    /// this point is an error.
    pub fn finalize(&mut self) -> Result<FencedReport, FencedError> {
        if self.state == ParserState::Finished {
            return Ok(self.report.clone());
        }
        if !self.hold.is_empty() {
            let line = std::mem::take(&mut self.hold);
            self.handle_line(&line)?;
        }
        match self.state {
            ParserState::Finished => Ok(self.report.clone()),
            ParserState::Seeking => Err(FencedError::NotFound),
            ParserState::InBody => Err(FencedError::Unterminated),
        }
    }

    fn handle_line(&mut self, line: &str) -> Result<(), FencedError> {
        let trimmed = line.trim();
        match self.state {
            ParserState::Seeking => {
                if trimmed.to_lowercase().starts_with(FENCE_PREFIX) {
                    let session_id = trimmed[FENCE_PREFIX.len()..].trim();
                    if session_id.is_empty() {
                        return Err(FencedError::MissingSessionId);
                    }
                    if !self.expected_id.is_empty() && session_id != self.expected_id {
                        return Err(FencedError::SessionMismatch {
                            observed: session_id.to_string(),
                            expected: self.expected_id.clone(),
                        });
                    }
                    self.state = ParserState::InBody;
                    self.report = FencedReport {
                        session_id: session_id.to_string(),
                        ..FencedReport::default()
                    };
                }
                Ok(())
            }
            ParserState::InBody => {
                if trimmed == CLOSING_FENCE {
                    if self.collecting_details {
                        self.finish_details()?;
                        self.collecting_details = false;
                    }
                    self.close()?;
                    return Ok(());
                }
                if self.collecting_details {
                    if self.consume_detail_line(line)? {
                        return Ok(());
                    }
                    // A new unindented field ended the block; reprocess.
                }
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    return Ok(());
                }
                self.process_field(trimmed)
            }
            ParserState::Finished => Ok(()),
        }
    }

    fn close(&mut self) -> Result<(), FencedError> {
        self.validate()?;
        self.state = ParserState::Finished;
        Ok(())
    }

    fn process_field(&mut self, line: &str) -> Result<(), FencedError> {
        let Some(idx) = line.find(':') else {
            return Err(FencedError::MalformedLine(line.to_string()));
        };
        let key = line[..idx].trim().to_lowercase();
        let value = line[idx + 1..].trim();

        match key.as_str() {
            "status" => {
                if value.is_empty() {
                    return Err(FencedError::EmptyStatus);
                }
                let lower = value.to_lowercase();
                if lower != STATUS_SUCCESS && lower != STATUS_NEEDS_HELP {
                    return Err(FencedError::InvalidStatus(value.to_string()));
                }
                self.report.status = lower;
            }
            "commit_msg" => {
                if value.is_empty() {
                    return Err(FencedError::EmptyCommitMsg);
                }
                self.report.commit_msg = value.to_string();
            }
            "details" => {
                if !self.report.details.is_empty() || self.collecting_details {
                    return Err(FencedError::DuplicateDetails);
                }
                if value.is_empty() {
                    return Err(FencedError::EmptyDetails);
                }
                if value == "|" {
                    self.collecting_details = true;
                    self.details.clear();
                } else {
                    self.report.details = value.to_string();
                }
            }
            "escalation" => {
                self.report.escalation = value.to_string();
            }
            other => return Err(FencedError::UnknownField(other.to_string())),
        }
        Ok(())
    }

    /// Appends block content. Returns false when the caller should reprocess
    /// the same line because a new unindented field began.
    fn consume_detail_line(&mut self, line: &str) -> Result<bool, FencedError> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            self.details.push('\n');
            return Ok(true);
        }
        if trimmed == CLOSING_FENCE {
            self.finish_details()?;
            self.collecting_details = false;
            self.close()?;
            return Ok(true);
        }
        if !starts_indented(line) && is_field_line(trimmed) {
            self.finish_details()?;
            self.collecting_details = false;
            return Ok(false);
        }
        self.details.push_str(strip_indent(line));
        self.details.push('\n');
        Ok(true)
    }

    fn finish_details(&mut self) -> Result<(), FencedError> {
        let text = self.details.trim_end_matches('\n');
        if text.trim().is_empty() {
            return Err(FencedError::EmptyDetailsBlock);
        }
        self.report.details = text.to_string();
        Ok(())
    }

    fn validate(&self) -> Result<(), FencedError> {
        if self.report.session_id.is_empty() {
            return Err(FencedError::MissingSessionId);
        }
        if self.report.status.is_empty() {
            return Err(FencedError::MissingStatus);
        }
        if self.report.commit_msg.is_empty() {
            return Err(FencedError::MissingCommitMsg);
        }
        if self.report.details.is_empty() {
            return Err(FencedError::MissingDetails);
        }
        if self.report.status == STATUS_NEEDS_HELP && self.report.escalation.trim().is_empty() {
            return Err(FencedError::MissingEscalation);
        }
        Ok(())
    }
}

/// Parses a complete output capture in one shot.
pub fn parse_report(session_id: &str, output: &str) -> Result<FencedReport, FencedError> {
    let mut parser = FencedParser::new(session_id);
    if let Some(report) = parser.feed(output)? {
        return Ok(report);
    }
    parser.finalize()
}

fn is_field_line(line: &str) -> bool {
    !line.is_empty() && !line.starts_with('`') && line.contains(':')
}

fn strip_indent(line: &str) -> &str {
    if let Some(rest) = line.strip_prefix('\t') {
        rest
    } else if let Some(rest) = line.strip_prefix("  ") {
        rest
    } else if let Some(rest) = line.strip_prefix(' ') {
        rest
    } else {
        line
    }
}

fn starts_indented(line: &str) -> bool {
    line.starts_with(' ') || line.starts_with('\t')
}
