//! Loads and chunks ledger entries for the omnibus summarizer session.

use std::path::Path;

use chrono::DateTime;
use chrono::Utc;
use thiserror::Error;

use crate::footer::STATUS_NEEDS_HELP;
use crate::footer::STATUS_SUCCESS;
use crate::ledger;
use crate::ledger::LedgerError;

#[derive(Debug, Error)]
pub enum SummaryError {
    #[error("results log {path} not found; cannot produce omnibus summary")]
    LedgerMissing { path: String },
    #[error(transparent)]
    Ledger(LedgerError),
    #[error(
        "session {session_id} ended with status={STATUS_NEEDS_HELP}; resolve blockers before running the omnibus summary"
    )]
    NeedsHelp { session_id: String },
}

/// One completed bead as it appears in the summary prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryEntry {
    pub bead_id: String,
    pub commit_summary: String,
    pub commit_details: String,
    pub completed_at: DateTime<Utc>,
}

/// A group of entries rendered as one `Chunk <i>:` section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryChunk {
    pub index: usize,
    pub entries: Vec<SummaryEntry>,
}

/// Collects success entries for the epic, sorted by completion time (stable,
/// keeping file order on ties) and truncated to the most recent
/// `max_commits`. Returns the kept entries plus the pre-truncation total.
pub fn load_summary_entries(
    path: &Path,
    epic_id: &str,
    max_commits: usize,
) -> Result<(Vec<SummaryEntry>, usize), SummaryError> {
    let raw = ledger::entries_for_epic(path, epic_id).map_err(|err| match err {
        LedgerError::NotFound { path } => SummaryError::LedgerMissing {
            path: path.display().to_string(),
        },
        other => SummaryError::Ledger(other),
    })?;

    let mut filtered = Vec::new();
    for entry in raw {
        let status = entry.status.trim().to_lowercase();
        match status.as_str() {
            "" => continue,
            STATUS_SUCCESS => {
                let summary = entry.commit_summary.trim().to_string();
                let mut details = entry.commit_details.trim().to_string();
                if details.is_empty() {
                    details = summary.clone();
                }
                if summary.is_empty() && details.is_empty() {
                    continue;
                }
                filtered.push(SummaryEntry {
                    bead_id: entry.bead_id.trim().to_string(),
                    commit_summary: summary,
                    commit_details: details,
                    completed_at: entry.completed_at,
                });
            }
            STATUS_NEEDS_HELP => {
                return Err(SummaryError::NeedsHelp {
                    session_id: entry.session_id,
                });
            }
            _ => continue,
        }
    }

    filtered.sort_by(|a, b| a.completed_at.cmp(&b.completed_at));

    let total = filtered.len();
    if max_commits > 0 && total > max_commits {
        filtered.drain(..total - max_commits);
    }
    Ok((filtered, total))
}

/// Splits entries into chunks of `chunk_size` (minimum 1, default 5).
pub fn chunk_entries(entries: Vec<SummaryEntry>, chunk_size: usize) -> Vec<SummaryChunk> {
    let chunk_size = if chunk_size == 0 {
        crate::config::DEFAULT_SUMMARY_CHUNK_SIZE
    } else {
        chunk_size
    };
    let mut chunks = Vec::new();
    let mut entries = entries.into_iter().peekable();
    while entries.peek().is_some() {
        let batch: Vec<SummaryEntry> = entries.by_ref().take(chunk_size).collect();
        chunks.push(SummaryChunk {
            index: chunks.len() + 1,
            entries: batch,
        });
    }
    chunks
}
