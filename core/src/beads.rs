//! Client for the external bead tracker plus the ready-work guardrails the
//! orchestrator runs before each session.

use serde::Deserialize;
use thiserror::Error;

use crate::plan::SessionPlan;

/// Upper bound passed to `bd ready -n`.
pub const READY_FETCH_LIMIT: &str = "200";

const BD_BINARY: &str = "bd";

#[derive(Debug, Error)]
pub enum BeadsError {
    #[error("bd ready: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("bd ready: {status}: {detail}")]
    CommandFailed { status: String, detail: String },
    #[error("parse bd ready output: {0}")]
    Parse(#[source] serde_json::Error),
    #[error("preflight ready check: {0}")]
    Preflight(Box<BeadsError>),
    #[error(
        "no ready beads with prefix {epic_id} were returned by `bd ready --json -n {READY_FETCH_LIMIT}`. Rename or recreate tasks as {epic_id}.<suffix> before rerunning."
    )]
    NoReadyBeads { epic_id: String },
    #[error(
        "resume requested but every ready bead for {epic_id} is already logged as completed; create new beads or rerun without --resume"
    )]
    ResumeExhausted { epic_id: String },
}

/// One ready bead as reported by `bd ready --json`.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct ReadyIssue {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub issue_type: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
}

/// Runs `bd ready --json -n 200` and parses the result.
pub fn fetch_ready_issues() -> Result<Vec<ReadyIssue>, BeadsError> {
    let output = std::process::Command::new(BD_BINARY)
        .args(["ready", "--json", "-n", READY_FETCH_LIMIT])
        .output()
        .map_err(BeadsError::Spawn)?;
    if !output.status.success() {
        return Err(BeadsError::CommandFailed {
            status: output.status.to_string(),
            detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    parse_ready_issues(&output.stdout)
}

pub fn parse_ready_issues(data: &[u8]) -> Result<Vec<ReadyIssue>, BeadsError> {
    serde_json::from_slice(data).map_err(BeadsError::Parse)
}

/// A bead belongs to an epic when its id starts with `<epic_id>.`.
pub fn issue_belongs_to_epic(issue_id: &str, epic_id: &str) -> bool {
    if epic_id.is_empty() || epic_id == crate::plan::LOOSE_ISSUES_ID {
        return false;
    }
    parent_epic_id(issue_id) == Some(epic_id)
}

pub fn parent_epic_id(issue_id: &str) -> Option<&str> {
    issue_id.split_once('.').map(|(parent, _)| parent)
}

/// Fails when an epic-scoped plan has no ready work left.
pub fn ensure_ready_work(plan: &SessionPlan) -> Result<(), BeadsError> {
    if ready_work_available(plan)? {
        return Ok(());
    }
    if plan.is_loose() {
        return Ok(());
    }
    Err(BeadsError::NoReadyBeads {
        epic_id: plan.epic_id.clone(),
    })
}

/// Whether at least one ready bead remains for the plan. Loose plans always
/// report work available.
pub fn ready_work_available(plan: &SessionPlan) -> Result<bool, BeadsError> {
    if plan.is_loose() {
        return Ok(true);
    }
    let issues =
        fetch_ready_issues().map_err(|err| BeadsError::Preflight(Box::new(err)))?;
    has_ready_issue_for_plan(plan, &issues)
}

/// Pure matching over an already-fetched ready list; resume-skipped beads do
/// not count, and an exhausted resume set is its own error.
pub fn has_ready_issue_for_plan(
    plan: &SessionPlan,
    issues: &[ReadyIssue],
) -> Result<bool, BeadsError> {
    if plan.is_loose() {
        return Ok(true);
    }

    let skip = plan.resume_skip_set();
    let mut skipped_matches = 0;

    for issue in issues {
        if issue.issue_type.eq_ignore_ascii_case("epic") {
            continue;
        }
        if issue_belongs_to_epic(&issue.id, &plan.epic_id) {
            if let Some(skip) = &skip
                && skip.contains(&issue.id.to_lowercase())
            {
                skipped_matches += 1;
                continue;
            }
            return Ok(true);
        }
    }

    if plan.resume_enabled && skip.is_some() && skipped_matches > 0 {
        return Err(BeadsError::ResumeExhausted {
            epic_id: plan.epic_id.clone(),
        });
    }

    Ok(false)
}
