//! Assembles the prompt body for work and summary sessions.
//!
//! The session runner later appends the fenced-report instructions and mints
//! the session UUID; this module only produces the body the operator
//! previews.

use crate::plan::SessionMode;
use crate::plan::SessionPlan;
use crate::summary::SummaryChunk;

/// Directive closing every summary prompt.
const SUMMARY_DIRECTIVE: &str =
    "Return a single omnibus commit message summarizing every chunk above.";

/// Merges base prompt, epic prompt, metadata, resume guidance, and the
/// completion contract into the session prompt body.
pub fn build_prompt(plan: &SessionPlan) -> String {
    if plan.mode == SessionMode::Summary {
        return build_summary_prompt(plan);
    }

    let mut sections: Vec<String> = Vec::new();

    let base = plan.base_prompt.trim();
    if !base.is_empty() {
        sections.push(base.to_string());
    }
    let epic = plan.epic_prompt.trim();
    if !epic.is_empty() {
        sections.push(epic.to_string());
    }

    let mut meta_lines = vec![format!("Epic ID: {}", plan.epic_id)];
    if !plan.tool.is_empty() {
        meta_lines.push(format!("Tool: {}", plan.tool));
    }
    sections.push(meta_lines.join("\n"));

    if let Some(instructions) = resume_instructions(plan) {
        sections.push(instructions);
    }

    sections.push(completion_contract(plan));

    sections.join("\n\n").trim().to_string()
}

fn completion_contract(plan: &SessionPlan) -> String {
    if plan.is_loose() {
        return loose_issues_contract();
    }
    let name = plan.epic_name.trim();
    let name = if name.is_empty() {
        plan.epic_id.as_str()
    } else {
        name
    };
    let id = &plan.epic_id;
    format!(
        "Epic completion contract for {name} ({id}):\n\
         - Use \"bd ready --json\" and pick a bead whose ID starts with \"{id}.\"\n\
         - If \"bd ready --json\" returns no beads whose IDs start with \"{id},\" run \"bd show {id} --json\" to confirm the epic exists and emit STATUS: needs_help with ESCALATION describing which bead IDs you did find so humans can rename them.\n\
         - Claim it before coding: bd update <id> --status in_progress --json.\n\
         - When done and tests pass, close it via bd close <id> --reason \"Completed\" --json (or bd update <id> --status completed --json).\n\
         - Only emit STATUS: success after the bead is closed. Otherwise emit STATUS: needs_help with ESCALATION explaining the blocker."
    )
}

fn loose_issues_contract() -> String {
    "Loose-issue contract:\n\
     - Use \"bd ready --json\" and pick a bead that is not part of any epic.\n\
     - Claim it before coding: bd update <id> --status in_progress --json.\n\
     - When done and tests pass, close it via bd close <id> --reason \"Completed\" --json (or bd update <id> --status completed --json).\n\
     - Only emit STATUS: success after the bead is closed. Otherwise emit STATUS: needs_help with ESCALATION explaining the blocker."
        .to_string()
}

fn resume_instructions(plan: &SessionPlan) -> Option<String> {
    if !plan.resume_enabled {
        return None;
    }
    if plan.resume_completed_beads.is_empty() {
        return Some("Resume mode: continue working through ready beads for this epic.".to_string());
    }
    let mut lines =
        vec!["Resume mode is active – skip the beads already finished during this run:".to_string()];
    for bead in &plan.resume_completed_beads {
        lines.push(format!("- {bead}"));
    }
    Some(lines.join("\n"))
}

fn build_summary_prompt(plan: &SessionPlan) -> String {
    let mut sections: Vec<String> = Vec::new();

    let intro = plan.summary_prompt.trim();
    if !intro.is_empty() {
        sections.push(intro.to_string());
    }

    let mut meta_lines = vec![format!("Epic ID: {}", plan.epic_id)];
    if plan.summary_included > 0 {
        if plan.summary_total > plan.summary_included {
            meta_lines.push(format!(
                "Showing the most recent {} of {} commits recorded for this epic.",
                plan.summary_included, plan.summary_total
            ));
        } else {
            meta_lines.push(format!("Commits included: {}", plan.summary_included));
        }
    }
    sections.push(meta_lines.join("\n"));

    for chunk in &plan.summary_chunks {
        if let Some(text) = format_summary_chunk(chunk) {
            sections.push(text);
        }
    }

    sections.push(SUMMARY_DIRECTIVE.to_string());

    sections.join("\n\n").trim().to_string()
}

fn format_summary_chunk(chunk: &SummaryChunk) -> Option<String> {
    if chunk.entries.is_empty() {
        return None;
    }
    let mut lines = vec![format!("Chunk {}:", chunk.index)];
    for entry in &chunk.entries {
        let bead = entry.bead_id.trim();
        let bead = if bead.is_empty() {
            "(unidentified bead)"
        } else {
            bead
        };
        let summary = entry.commit_summary.trim();
        let summary = if summary.is_empty() {
            "(no commit summary captured)"
        } else {
            summary
        };
        lines.push(format!("- {bead} — {summary}"));
        if let Some(details) = indent_multiline(entry.commit_details.trim(), "    ") {
            lines.push(details);
        }
    }
    Some(lines.join("\n"))
}

fn indent_multiline(text: &str, prefix: &str) -> Option<String> {
    if text.trim().is_empty() {
        return None;
    }
    let normalized = text.replace("\r\n", "\n").replace('\r', "\n");
    let indented: Vec<String> = normalized
        .split('\n')
        .map(|line| format!("{prefix}{line}"))
        .collect();
    Some(indented.join("\n"))
}
