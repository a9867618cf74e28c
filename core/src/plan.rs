//! The resolved intent for one agent session.

use std::collections::HashSet;

use crate::config::CodexConfig;
use crate::config::Config;
use crate::config::ConfigError;
use crate::summary::SummaryChunk;

/// Epic id of the sentinel plan targeting work outside any epic.
pub const LOOSE_ISSUES_ID: &str = "issues";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionMode {
    #[default]
    Work,
    Summary,
}

/// Everything the orchestrator needs to run one session. Immutable after
/// construction except for the resume set, which the epic loop extends
/// between iterations.
#[derive(Debug, Clone, Default)]
pub struct SessionPlan {
    pub epic_key: String,
    pub epic_name: String,
    pub alias: String,
    pub epic_id: String,
    pub tool: String,
    pub epic_prompt: String,
    pub base_prompt: String,
    pub codex: CodexConfig,
    pub resume_enabled: bool,
    pub resume_completed_beads: Vec<String>,
    pub repo_root: String,
    pub config_digest: String,
    pub mode: SessionMode,
    pub summary_prompt: String,
    pub summary_chunks: Vec<SummaryChunk>,
    pub summary_included: usize,
    pub summary_total: usize,
    pub bead_id_override: String,
}

impl SessionPlan {
    /// True for the sentinel plan that is not scoped to an epic.
    pub fn is_loose(&self) -> bool {
        self.epic_id.is_empty() || self.epic_id == LOOSE_ISSUES_ID
    }

    /// Lowercased resume set for skip checks. `None` when resume carries no
    /// completed beads.
    pub fn resume_skip_set(&self) -> Option<HashSet<String>> {
        if self.resume_completed_beads.is_empty() {
            return None;
        }
        let set: HashSet<String> = self
            .resume_completed_beads
            .iter()
            .map(|bead| bead.trim().to_lowercase())
            .filter(|bead| !bead.is_empty())
            .collect();
        Some(set)
    }
}

/// Resolves a requested alias/id/key into a work-mode plan.
pub fn prepare_session(cfg: &Config, requested: &str) -> Result<SessionPlan, ConfigError> {
    let (key, epic) = cfg.epic(requested)?;
    let alias = epic_alias_handle(&key, &epic.alias);
    Ok(SessionPlan {
        epic_key: key.clone(),
        epic_name: epic.name.clone(),
        alias,
        epic_id: epic.id.clone(),
        tool: epic.tool.clone(),
        epic_prompt: epic.prompt.clone(),
        base_prompt: cfg.base_prompt.clone(),
        codex: cfg.effective_codex(epic),
        ..SessionPlan::default()
    })
}

/// Builds the sentinel plan for issues outside epics. Callers must have
/// checked that the config carries an issues section.
pub fn plan_from_issues(cfg: &Config) -> SessionPlan {
    let prompt = cfg
        .issues
        .as_ref()
        .map(|issues| issues.prompt.clone())
        .unwrap_or_default();
    SessionPlan {
        epic_key: "issues-outside-epics".to_string(),
        epic_name: "Issues Outside Epics".to_string(),
        alias: LOOSE_ISSUES_ID.to_string(),
        epic_id: LOOSE_ISSUES_ID.to_string(),
        epic_prompt: prompt,
        base_prompt: cfg.base_prompt.clone(),
        codex: cfg.codex.clone(),
        ..SessionPlan::default()
    }
}

/// Lowercased alias, falling back to the epic key.
pub fn epic_alias_handle(key: &str, alias: &str) -> String {
    let alias = alias.trim().to_lowercase();
    if alias.is_empty() {
        key.trim().to_lowercase()
    } else {
        alias
    }
}
