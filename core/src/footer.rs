//! Legacy plain-text footer parser.
//!
//! Older tooling reads a `STATUS:` / `COMMIT_MSG:` / `ESCALATION:` footer
//! instead of the fenced report. Obi still parses it, but only to cross-check
//! the fenced report for drift.

use thiserror::Error;

pub const STATUS_PREFIX: &str = "STATUS:";
pub const COMMIT_PREFIX: &str = "COMMIT_MSG:";
pub const ESCALATION_PREFIX: &str = "ESCALATION:";

/// Status recorded when the bead finished successfully.
pub const STATUS_SUCCESS: &str = "success";
/// Status recorded when the bead needs human intervention.
pub const STATUS_NEEDS_HELP: &str = "needs_help";

/// Structured footer emitted at the tail of the agent output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LegacyFooter {
    pub status: String,
    pub commit_msg: String,
    pub escalation: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FooterError {
    #[error("missing {STATUS_PREFIX} line")]
    MissingStatus,
    #[error("missing {COMMIT_PREFIX} line")]
    MissingCommitMsg,
    #[error("status={STATUS_NEEDS_HELP} requires {ESCALATION_PREFIX} line")]
    MissingEscalation,
}

/// Scans the final output for the footer markers. `COMMIT_MSG` captures every
/// subsequent line until the next recognized prefix or end of text.
pub fn parse(output: &str) -> Result<LegacyFooter, FooterError> {
    let mut footer = LegacyFooter::default();
    let mut collecting_commit = false;

    for line in output.split('\n') {
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix(STATUS_PREFIX) {
            footer.status = rest.trim().to_string();
            collecting_commit = false;
        } else if let Some(rest) = trimmed.strip_prefix(COMMIT_PREFIX) {
            footer.commit_msg = rest.trim().to_string();
            collecting_commit = true;
        } else if let Some(rest) = trimmed.strip_prefix(ESCALATION_PREFIX) {
            footer.escalation = rest.trim().to_string();
            collecting_commit = false;
        } else if collecting_commit {
            if !footer.commit_msg.is_empty() {
                footer.commit_msg.push('\n');
            }
            footer.commit_msg.push_str(trimmed);
        }
    }

    if footer.status.is_empty() {
        return Err(FooterError::MissingStatus);
    }
    if footer.commit_msg.is_empty() {
        return Err(FooterError::MissingCommitMsg);
    }
    if footer.status == STATUS_NEEDS_HELP && footer.escalation.is_empty() {
        return Err(FooterError::MissingEscalation);
    }
    Ok(footer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_multi_line_commit_body() {
        let output = "noise\nSTATUS: success\nCOMMIT_MSG:\nAdd widget\nwith details\nESCALATION:\n";
        let footer = parse(output).expect("parse");
        assert_eq!(footer.status, "success");
        assert_eq!(footer.commit_msg, "Add widget\nwith details");
        assert_eq!(footer.escalation, "");
    }

    #[test]
    fn commit_on_same_line_is_kept() {
        let footer = parse("STATUS: success\nCOMMIT_MSG: inline summary\n").expect("parse");
        assert_eq!(footer.commit_msg, "inline summary");
    }

    #[test]
    fn missing_status_errors() {
        let err = parse("COMMIT_MSG:\nwork\n").expect_err("missing status");
        assert_eq!(err, FooterError::MissingStatus);
    }

    #[test]
    fn missing_commit_errors() {
        let err = parse("STATUS: success\n").expect_err("missing commit");
        assert_eq!(err, FooterError::MissingCommitMsg);
    }

    #[test]
    fn needs_help_requires_escalation() {
        let err =
            parse("STATUS: needs_help\nCOMMIT_MSG:\nstuck\n").expect_err("missing escalation");
        assert_eq!(err, FooterError::MissingEscalation);

        let footer = parse("STATUS: needs_help\nCOMMIT_MSG:\nstuck\nESCALATION: help me\n")
            .expect("parse");
        assert_eq!(footer.escalation, "help me");
    }

    #[test]
    fn escalation_stops_commit_capture() {
        let footer =
            parse("STATUS: success\nCOMMIT_MSG:\nline\nESCALATION: none needed\ntail\n")
                .expect("parse");
        assert_eq!(footer.commit_msg, "line");
    }
}
