//! The `go` command: resolve a target, run agent sessions until the epic has
//! no ready beads left, then run the omnibus summarizer.

use std::io::BufRead;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Instant;

use anyhow::Context;
use anyhow::anyhow;
use anyhow::bail;
use obi_core::LockedWriter;
use obi_core::beads;
use obi_core::codex::Invocation;
use obi_core::config;
use obi_core::config::Config;
use obi_core::fenced;
use obi_core::fenced::FencedReport;
use obi_core::footer;
use obi_core::footer::LegacyFooter;
use obi_core::footer::STATUS_NEEDS_HELP;
use obi_core::ledger;
use obi_core::ledger::LedgerEntry;
use obi_core::ledger::LedgerError;
use obi_core::ledger::OperatorEventKind;
use obi_core::plan;
use obi_core::plan::SessionMode;
use obi_core::plan::SessionPlan;
use obi_core::prompt::build_prompt;
use obi_core::redact::Redactor;
use obi_core::redact::split_secrets;
use obi_core::session::SessionError;
use obi_core::session::SessionHandle;
use obi_core::session::SessionRunner;
use obi_core::session::SessionState;
use obi_core::session::StartOptions;
use obi_core::signal_relay;
use obi_core::summary;
use obi_tui::DisplayOptions;
use obi_tui::SessionDisplay;
use obi_tui::Shell;
use obi_tui::StatusLine;
use regex_lite::Regex;
use sha2::Digest;
use sha2::Sha256;

/// Environment variable carrying the redaction secret set.
pub const REDACTION_ENV: &str = "OBI_REDACT";

/// Resolved `obi go` options.
#[derive(Debug, Clone, Default)]
pub struct GoOptions {
    pub config_path: Option<String>,
    pub target: Option<String>,
    pub out_path: Option<String>,
    pub resume: bool,
    pub no_tui: bool,
}

/// What one session produced. An empty status means the operator cancelled
/// at the confirmation prompt.
#[derive(Debug, Clone, Default)]
pub struct SessionOutcome {
    pub status: String,
    pub bead_id: String,
}

/// Entry point for `obi go`.
pub async fn run(opts: GoOptions) -> anyhow::Result<()> {
    let resolved_path = config::resolve_path(opts.config_path.as_deref())?;
    let cfg = Config::load(&resolved_path)?;

    let repo_root = repo_root_for_config(&resolved_path);
    let cfg_digest = config_digest(&resolved_path);
    let log_path = cfg.results_log_path()?;

    let target = opts.target.as_deref().unwrap_or("").trim().to_string();
    let mut plan = if target.is_empty() {
        if cfg.issues.is_none() {
            print_missing_issues_message(&cfg);
            return Ok(());
        }
        plan::plan_from_issues(&cfg)
    } else {
        plan::prepare_session(&cfg, &target)?
    };

    plan.repo_root = repo_root;
    plan.config_digest = cfg_digest;

    if opts.resume {
        enable_resume(&mut plan, &log_path)?;
    }

    if plan.is_loose() {
        beads::ensure_ready_work(&plan)?;
        let confirm = cfg.confirm_before_run();
        execute_session(&plan, &opts, &log_path, confirm, !confirm).await?;
        return Ok(());
    }

    run_epic_loop(plan, &opts, &cfg, &log_path).await
}

/// Runs sessions while ready beads remain, then hands off to the summarizer.
pub async fn run_epic_loop(
    mut plan: SessionPlan,
    opts: &GoOptions,
    cfg: &Config,
    log_path: &Path,
) -> anyhow::Result<()> {
    let confirm_first = cfg.confirm_before_run();
    let auto_confirm_notice = !confirm_first;
    let mut session_count = 0usize;

    loop {
        if session_count == 0 {
            beads::ensure_ready_work(&plan)?;
        } else {
            let has_work = beads::ready_work_available(&plan)?;
            if !has_work {
                println!(
                    "No ready beads remain for {} ({}). All done.",
                    plan.epic_name, plan.epic_id
                );
                maybe_run_summarizer(&plan, opts, cfg, log_path).await?;
                return Ok(());
            }
            println!(
                "\nReady beads remain for {} ({}); launching next session.\n",
                plan.epic_name, plan.epic_id
            );
        }

        println!("=== Agent session #{} ===\n", session_count + 1);

        let outcome = execute_session(
            &plan,
            opts,
            log_path,
            confirm_first && session_count == 0,
            auto_confirm_notice && session_count == 0,
        )
        .await?;
        if outcome.status.is_empty() {
            return Ok(());
        }
        let bead = outcome.bead_id.trim();
        if !bead.is_empty() {
            plan.resume_completed_beads.push(bead.to_string());
        }
        session_count += 1;
    }
}

/// Runs exactly one agent session end to end: prompt, confirmation,
/// transcript, PTY session, dual parse, ledger append.
pub async fn execute_session(
    plan: &SessionPlan,
    opts: &GoOptions,
    log_path: &Path,
    require_confirmation: bool,
    auto_confirm_notice: bool,
) -> anyhow::Result<SessionOutcome> {
    let prompt_body = build_prompt(plan);
    let runner = SessionRunner::new();
    let prepared = runner.prepare_prompt(&prompt_body);

    print_preview(plan, &prepared.text);

    if plan.resume_enabled {
        print_resume_summary(plan);
        println!();
    }

    if require_confirmation {
        if !prompt_for_confirmation()? {
            println!("Run cancelled.");
            return Ok(SessionOutcome::default());
        }
    } else if auto_confirm_notice {
        println!("confirm_before_run=false; continuing without prompt.");
    }

    let invocation = Invocation::build(&plan.codex, &prepared.text)?;
    println!("\nLaunching agent: {invocation}");

    let (transcript, transcript_path) =
        open_transcript_writer(log_path, opts.out_path.as_deref(), &prepared.session_id)?;

    let secrets = redaction_secrets();
    let op_log = Arc::new(crate::operator_log::OperatorLog::new(Some(
        transcript.clone(),
    )));
    let use_tui = !opts.no_tui;

    let mut start_opts = StartOptions::new(
        prepared.session_id.clone(),
        prepared.text.clone(),
        invocation.clone(),
    );
    start_opts.tee = Some(transcript);
    start_opts.secrets = secrets.clone();
    if !use_tui {
        start_opts.stdout = Some(Box::new(std::io::stdout()));
    }

    let handle = runner.start(start_opts).await?;

    let mut display: Option<SessionDisplay> = None;
    if use_tui {
        let events = handle
            .events()
            .context("session event stream unavailable")?;
        let controls = Arc::new(TuiSessionControls {
            handle: handle.clone(),
            log: Arc::clone(&op_log),
            shell: OnceLock::new(),
        });
        let started = SessionDisplay::start(
            events,
            controls.clone(),
            DisplayOptions {
                header: format!("Obi session · {} ({})", plan.epic_name, plan.epic_id),
                footer_hints: vec![
                    "p: pause".to_string(),
                    "h: hint".to_string(),
                    "s: soft stop".to_string(),
                    "q: abort".to_string(),
                ],
                status: StatusLine {
                    epic_alias: if plan.alias.trim().is_empty() {
                        plan.epic_name.clone()
                    } else {
                        plan.alias.clone()
                    },
                    epic_id: plan.epic_id.clone(),
                    run_status: SessionState::Starting.to_string(),
                    started_at: Some(Instant::now()),
                    ..StatusLine::default()
                },
            },
        )?;
        let _ = controls.shell.set(started.shell());
        started.update_status(|line| {
            line.run_status = SessionState::Running.to_string();
        });
        display = Some(started);
    } else {
        // No consumer in plain mode; closing the channel keeps the runner's
        // event sends from backing up.
        drop(handle.events());
    }

    let relay_out: Option<Box<dyn Write + Send>> = if use_tui {
        None
    } else {
        Some(Box::new(std::io::stdout()))
    };
    let _relay = signal_relay::spawn(handle.clone(), relay_out);

    let run_res = match handle.wait().await {
        Ok(result) => result,
        Err(err) => {
            finish_display(&mut display).await;
            return Err(err.into());
        }
    };

    let reconciled = reconcile_reports(&prepared.session_id, &run_res.output);
    let (fenced_res, footer_res) = match reconciled {
        Ok(parsed) => parsed,
        Err(err) => {
            finish_display(&mut display).await;
            return Err(err);
        }
    };

    let bead_id = {
        let detected = detect_bead_id(
            plan,
            &[
                run_res.output.as_str(),
                fenced_res.details.as_str(),
                fenced_res.commit_msg.as_str(),
                footer_res.commit_msg.as_str(),
            ],
        );
        if plan.bead_id_override.is_empty() {
            detected
        } else {
            plan.bead_id_override.clone()
        }
    };

    if let Some(display) = display.as_mut() {
        let status_text = fenced_res.status.trim().to_string();
        let bead = bead_id.clone();
        display.update_status(move |line| {
            line.run_status = status_text;
            line.bead_id = bead;
        });
    }
    finish_display(&mut display).await;

    println!("\nAgent status: {}", fenced_res.status);
    println!("Commit summary: {}", fenced_res.commit_msg);
    println!("Details:\n{}", fenced_res.details);
    if !fenced_res.escalation.is_empty() {
        println!("Escalation: {}", fenced_res.escalation);
    }

    let redactor = Redactor::new(secrets.clone());
    let (redacted_summary, summary_redacted) = redactor.redact(&fenced_res.commit_msg);
    let (redacted_details, details_redacted) = redactor.redact(&fenced_res.details);
    let (redacted_escalation, escalation_redacted) =
        redactor.redact(fenced_res.escalation.trim());
    // Fields parsed from the (already redacted) cumulative output rarely
    // change again here, so fold in the stream-level redaction flag.
    let redactions_applied =
        summary_redacted || details_redacted || escalation_redacted || run_res.redacted;

    let entry = LedgerEntry {
        run_id: prepared.session_id.clone(),
        session_id: prepared.session_id.clone(),
        repo_root: plan.repo_root.clone(),
        epic_id: plan.epic_id.clone(),
        epic_key: plan.epic_key.clone(),
        epic_name: plan.epic_name.clone(),
        alias: plan.alias.clone(),
        status: fenced_res.status.clone(),
        commit_summary: redacted_summary,
        commit_details: redacted_details,
        escalation: redacted_escalation,
        started_at: run_res.started_at,
        completed_at: run_res.completed_at,
        exit_code: run_res.exit_code,
        transcript_path: transcript_path.clone(),
        bead_id: bead_id.clone(),
        codex_binary: invocation.binary.clone(),
        codex_model: plan.codex.model.clone(),
        codex_sandbox: plan.codex.sandbox.clone(),
        codex_approval: plan.codex.approval.clone(),
        codex_extra_args: plan.codex.extra_args.clone(),
        config_digest: plan.config_digest.clone(),
        prompt_hash: prompt_hash(&prepared.text),
        redacted: redactions_applied,
        operator_events: op_log.ledger_events(&redactor),
        ..LedgerEntry::default()
    };
    ledger::append_entry(log_path, entry)?;

    if footer_res.status == STATUS_NEEDS_HELP {
        bail!("Agent requested escalation; stopping.");
    }
    if run_res.exit_code != 0 {
        bail!("agent exited with status {}", run_res.exit_code);
    }

    Ok(SessionOutcome {
        status: fenced_res.status,
        bead_id,
    })
}

async fn finish_display(display: &mut Option<SessionDisplay>) {
    if let Some(mut display) = display.take() {
        display.stop().await;
    }
}

/// Parses the fenced report (authoritative) and the legacy footer
/// (cross-check) and fails on any drift between them.
fn reconcile_reports(
    session_id: &str,
    output: &str,
) -> anyhow::Result<(FencedReport, LegacyFooter)> {
    let fenced_res = fenced::parse_report(session_id, output)
        .map_err(|err| anyhow!("parse fenced report: {err}"))?;
    let footer_res = footer::parse(output).map_err(|err| anyhow!("parse footer: {err}"))?;

    if !fenced_res.status.eq_ignore_ascii_case(&footer_res.status) {
        bail!("fenced report status does not match legacy footer");
    }
    if normalize_multiline(&fenced_res.details) != normalize_multiline(&footer_res.commit_msg) {
        bail!("fenced report details do not match legacy footer commit body");
    }
    if fenced_res.escalation.trim() != footer_res.escalation.trim() {
        bail!("fenced report escalation does not match legacy footer");
    }
    Ok((fenced_res, footer_res))
}

/// Runs the omnibus summarizer over the epic's ledger entries.
pub async fn maybe_run_summarizer(
    plan: &SessionPlan,
    opts: &GoOptions,
    cfg: &Config,
    log_path: &Path,
) -> anyhow::Result<()> {
    let summary_cfg = cfg.summary_config();
    if summary_cfg.max_commits == 0 || summary_cfg.prompt.trim().is_empty() {
        println!("Omnibus summarizer disabled via config; skipping.");
        return Ok(());
    }

    let (entries, total) =
        summary::load_summary_entries(log_path, &plan.epic_id, summary_cfg.max_commits)?;
    if entries.is_empty() {
        println!("No completed beads found in the ledger; skipping omnibus summary.");
        return Ok(());
    }

    let included = entries.len();
    let chunks = summary::chunk_entries(entries, summary_cfg.chunk_size);

    let mut summary_plan = plan.clone();
    summary_plan.mode = SessionMode::Summary;
    summary_plan.base_prompt.clear();
    summary_plan.epic_prompt.clear();
    summary_plan.summary_prompt = summary_cfg.prompt;
    summary_plan.summary_chunks = chunks;
    summary_plan.summary_included = included;
    summary_plan.summary_total = total;
    summary_plan.resume_enabled = false;
    summary_plan.resume_completed_beads.clear();
    summary_plan.bead_id_override = format!("{}.omnibus-summary", plan.epic_id);
    summary_plan.epic_name = format!("{} – Omnibus Summary", plan.epic_name);

    println!(
        "Launching omnibus summarizer with {included} commit(s) ({total} total recorded).\n"
    );
    let outcome = execute_session(&summary_plan, opts, log_path, false, false).await?;
    if outcome.status.is_empty() {
        println!("Summarizer cancelled by operator.");
        return Ok(());
    }
    println!("Omnibus summary recorded.");
    Ok(())
}

fn enable_resume(plan: &mut SessionPlan, log_path: &Path) -> anyhow::Result<()> {
    if plan.is_loose() {
        bail!(
            "--resume requires targeting a specific epic, but plan id is {:?}",
            plan.epic_id
        );
    }
    if log_path.as_os_str().is_empty() {
        bail!("results log path required for --resume");
    }
    let completed = ledger::completed_beads(log_path, &plan.epic_id).map_err(|err| match err {
        LedgerError::NotFound { path } => anyhow!(
            "results log {} not found; run at least once before using --resume",
            path.display()
        ),
        other => anyhow!(other),
    })?;
    plan.resume_enabled = true;
    plan.resume_completed_beads = completed;
    Ok(())
}

/// Session controls wrapper that records operator interventions and mirrors
/// them into the shell's log pane.
struct TuiSessionControls {
    handle: SessionHandle,
    log: Arc<crate::operator_log::OperatorLog>,
    shell: OnceLock<Arc<Shell>>,
}

impl TuiSessionControls {
    fn notify(&self, kind: OperatorEventKind, text: &str) {
        if let Some(shell) = self.shell.get() {
            shell.append_chunk(&format!("\n[obi {kind}] {text}\n"));
        }
    }
}

impl obi_tui::SessionControls for TuiSessionControls {
    fn write_input(&self, data: &[u8]) -> Result<(), SessionError> {
        self.handle.write_input(data)
    }

    async fn soft_stop(&self, reason: &str) -> Result<(), SessionError> {
        self.handle.soft_stop(reason).await?;
        self.log.record(OperatorEventKind::SoftStop, reason);
        self.notify(
            OperatorEventKind::SoftStop,
            &format!("Soft stop requested: {reason}"),
        );
        Ok(())
    }

    async fn abort(&self) -> Result<(), SessionError> {
        self.handle.abort().await
    }

    fn submit_hint(&self, text: &str) -> Result<(), SessionError> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Ok(());
        }
        self.handle.submit_hint(trimmed)?;
        self.log.record(OperatorEventKind::Hint, trimmed);
        self.notify(OperatorEventKind::Hint, &format!("Hint sent: {trimmed}"));
        Ok(())
    }
}

fn print_missing_issues_message(cfg: &Config) {
    println!(
        "No \"issues outside epics\" section found in obi.toml, so `obi go` needs an explicit epic alias or ID."
    );
    if cfg.epics.is_empty() {
        println!(
            "Tip: add the section to obi.toml or run `obi refresh` after creating your first epic."
        );
        return;
    }
    println!("Available epics:");
    for (key, epic) in &cfg.epics {
        let alias = plan::epic_alias_handle(key, &epic.alias);
        println!("  - {} (alias: {}, id: {})", epic.name, alias, epic.id);
    }
    println!("Run `obi go <alias-or-epic-id>` to work on one of these epics.");
}

fn print_preview(plan: &SessionPlan, prompt: &str) {
    println!("Preparing to have the agent work on this:");
    print!("{}", format_preview_table(plan));
    println!();
    println!("Prompt for the agent:");
    println!("{}", indent_prompt(prompt));
    println!();
}

fn format_preview_table(plan: &SessionPlan) -> String {
    const ALIAS_WIDTH: usize = 18;
    const NAME_WIDTH: usize = 30;
    const ID_WIDTH: usize = 27;
    let row = |alias: &str, name: &str, id: &str| {
        format!(
            "  {alias:<aw$}  {name:<nw$}  {id:<iw$}\n",
            aw = ALIAS_WIDTH,
            nw = NAME_WIDTH,
            iw = ID_WIDTH
        )
    };
    let mut table = String::new();
    table.push_str(&row("Alias", "Name", "Epic ID"));
    table.push_str(&row(
        &"-".repeat(ALIAS_WIDTH),
        &"-".repeat(NAME_WIDTH),
        &"-".repeat(ID_WIDTH),
    ));
    table.push_str(&row(&plan.alias, &plan.epic_name, &plan.epic_id));
    table
}

fn indent_prompt(prompt: &str) -> String {
    prompt
        .trim()
        .split('\n')
        .map(|line| format!("    {line}"))
        .collect::<Vec<_>>()
        .join("\n")
}

fn print_resume_summary(plan: &SessionPlan) {
    println!("Resume mode enabled.");
    if plan.resume_completed_beads.is_empty() {
        println!("  No completed beads recorded; starting fresh.");
        return;
    }
    println!("Completed beads already logged for this epic (will be skipped):");
    for bead in &plan.resume_completed_beads {
        println!("  - {bead}");
    }
}

fn prompt_for_confirmation() -> anyhow::Result<bool> {
    let stdin = std::io::stdin();
    loop {
        print!("Proceed? [Y/n]: ");
        std::io::stdout().flush().ok();
        let mut input = String::new();
        let read = stdin
            .lock()
            .read_line(&mut input)
            .context("read confirmation")?;
        if read == 0 {
            return Ok(false);
        }
        match input.trim().to_lowercase().as_str() {
            "" | "y" => return Ok(true),
            "n" => return Ok(false),
            _ => println!("Please respond with Y or n."),
        }
    }
}

/// Opens the transcript file: the explicit override, or
/// `<dirname(results_log)>/transcripts/<sanitized-session-id>.log`.
fn open_transcript_writer(
    log_path: &Path,
    override_path: Option<&str>,
    session_id: &str,
) -> anyhow::Result<(LockedWriter, String)> {
    let target = match override_path.map(str::trim).filter(|p| !p.is_empty()) {
        Some(path) => PathBuf::from(path),
        None => {
            if log_path.as_os_str().is_empty() {
                bail!("transcript storage requires results log path or explicit --out target");
            }
            if session_id.trim().is_empty() {
                bail!("session id required to name transcript");
            }
            let base = log_path.parent().unwrap_or_else(|| Path::new("."));
            base.join("transcripts")
                .join(format!("{}.log", sanitize_filename(session_id)))
        }
    };

    if let Some(parent) = target.parent()
        && !parent.as_os_str().is_empty()
    {
        ensure_transcript_dir(parent)?;
    }
    let file = open_private_truncated(&target).context("open transcript")?;
    Ok((
        LockedWriter::new(Box::new(file)),
        target.display().to_string(),
    ))
}

fn ensure_transcript_dir(path: &Path) -> anyhow::Result<()> {
    create_private_dir(path).context("ensure transcript dir")
}

#[cfg(unix)]
fn create_private_dir(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(path)
}

#[cfg(not(unix))]
fn create_private_dir(path: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(path)
}

#[cfg(unix)]
fn open_private_truncated(path: &Path) -> std::io::Result<std::fs::File> {
    use std::os::unix::fs::OpenOptionsExt;
    std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
}

#[cfg(not(unix))]
fn open_private_truncated(path: &Path) -> std::io::Result<std::fs::File> {
    std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
}

fn sanitize_filename(input: &str) -> String {
    if input.is_empty() {
        return "transcript".to_string();
    }
    input
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => c,
            _ => '_',
        })
        .collect()
}

fn redaction_secrets() -> Vec<String> {
    split_secrets(&std::env::var(REDACTION_ENV).unwrap_or_default())
}

fn config_digest(path: &Path) -> String {
    match std::fs::read(path) {
        Ok(data) => hex_digest(&data),
        Err(_) => String::new(),
    }
}

fn prompt_hash(prompt: &str) -> String {
    hex_digest(prompt.as_bytes())
}

fn hex_digest(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let digest = hasher.finalize();
    digest.iter().map(|byte| format!("{byte:02x}")).collect()
}

fn repo_root_for_config(config_path: &Path) -> String {
    let dir = config_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();
    let output = std::process::Command::new("git")
        .args(["rev-parse", "--show-toplevel"])
        .current_dir(&dir)
        .output();
    if let Ok(output) = output
        && output.status.success()
    {
        let root = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if !root.is_empty() {
            return root;
        }
    }
    dir.display().to_string()
}

/// Looks for a `<epic_root>-<suffix>` token in the given texts, where the
/// epic root is the epic id with its trailing `-<slug>` segment stripped.
/// The plan's override wins over detection.
fn detect_bead_id(plan: &SessionPlan, texts: &[&str]) -> String {
    let mut root = plan.epic_id.trim().to_lowercase();
    if root.is_empty() {
        return String::new();
    }
    if let Some(idx) = root.rfind('-')
        && idx > 0
    {
        root.truncate(idx);
    }
    if root.is_empty() {
        root = plan.epic_id.to_lowercase();
    }
    let pattern = format!("{}-[a-z0-9][a-z0-9\\.-]*", regex_escape(&root));
    let Ok(re) = Regex::new(&pattern) else {
        return String::new();
    };
    for text in texts {
        if text.is_empty() {
            continue;
        }
        if let Some(found) = re.find(&text.to_lowercase()) {
            return found.as_str().to_string();
        }
    }
    String::new()
}

fn regex_escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(
            c,
            '.' | '+' | '*' | '?' | '(' | ')' | '|' | '[' | ']' | '{' | '}' | '^' | '$' | '\\'
        ) {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Trims trailing whitespace per line so fenced details and the footer's
/// commit body can be compared byte for byte.
fn normalize_multiline(text: &str) -> String {
    if text.trim().is_empty() {
        return String::new();
    }
    text.trim()
        .split('\n')
        .map(|line| line.trim_end_matches([' ', '\t']))
        .collect::<Vec<_>>()
        .join("\n")
}
