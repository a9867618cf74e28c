//! Obi configuration: a TOML file describing epics, agent invocation
//! defaults, and the summarizer. The core only reads the file; scaffolding
//! it is a separate tool's job.

use std::collections::BTreeMap;
use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use thiserror::Error;

/// Environment override for the config location.
pub const CONFIG_ENV: &str = "OBI_CONFIG";
const DEFAULT_CONFIG_NAME: &str = "obi.toml";

pub const DEFAULT_SUMMARY_MAX_COMMITS: usize = 20;
pub const DEFAULT_SUMMARY_CHUNK_SIZE: usize = 5;

pub const DEFAULT_SUMMARY_PROMPT: &str = "You will receive commit summaries and detailed notes for every bead completed in this epic. Your job is to write one cohesive, multi-line commit message (subject line + detailed body) that captures the entire story so humans can understand what shipped.

Guidelines:
- Highlight major functional threads (features, bugs, migrations) rather than restating every bead verbatim.
- Call out tests, docs, and follow-ups when they matter.
- If information appears truncated or missing, acknowledge the limitation rather than inventing details.";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config: {0}")]
    Read(#[source] std::io::Error),
    #[error("parse config: {0}")]
    Parse(#[source] toml::de::Error),
    #[error("config must define at least one [epic.*] section or an \"issues outside epics\" block")]
    NoTargets,
    #[error("empty path")]
    EmptyPath,
    #[error("resolve home dir")]
    NoHomeDir,
    #[error("resolve config dir")]
    NoConfigDir,
    #[error("resolve working dir: {0}")]
    WorkingDir(#[source] std::io::Error),
    #[error("resolve path: {0}")]
    Canonicalize(#[source] std::io::Error),
    #[error("could not find {DEFAULT_CONFIG_NAME} in current directory or parents")]
    NotFound,
    #[error("unknown epic {0:?}")]
    UnknownEpic(String),
    #[error("epic identifier {requested:?} is ambiguous between {first} and {second}")]
    AmbiguousEpic {
        requested: String,
        first: String,
        second: String,
    },
}

/// Root configuration stored in TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub results_log: String,
    #[serde(default)]
    pub base_prompt: String,
    #[serde(default)]
    pub codex: CodexConfig,
    #[serde(default, rename = "epic")]
    pub epics: BTreeMap<String, EpicConfig>,
    #[serde(default, rename = "issues outside epics")]
    pub issues: Option<IssuesConfig>,
    #[serde(default)]
    pub confirm_before_run: Option<bool>,
    #[serde(default)]
    pub summary: SummaryConfig,
}

/// How a specific epic should be handled.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EpicConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub tool: String,
    #[serde(default)]
    pub alias: String,
    #[serde(default)]
    pub filters: EpicFilters,
    #[serde(default, rename = "codex")]
    pub codex_override: Option<CodexConfig>,
}

/// Optional bead-tracker filters that scope ready issues.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct EpicFilters {
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub types: Vec<String>,
    #[serde(default)]
    pub priorities: Vec<i64>,
}

/// Standalone issues not attached to any epic.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IssuesConfig {
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub filters: EpicFilters,
}

/// Controls the omnibus commit summarizer.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct SummaryConfig {
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub max_commits: usize,
    #[serde(default)]
    pub chunk_size: usize,
}

/// How the agent CLI should be invoked.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct CodexConfig {
    #[serde(default)]
    pub binary: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub sandbox: String,
    #[serde(default)]
    pub approval: String,
    #[serde(default)]
    pub extra_args: Vec<String>,
}

impl Config {
    /// Reads and parses the TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let bytes = std::fs::read_to_string(path).map_err(ConfigError::Read)?;
        let cfg: Config = toml::from_str(&bytes).map_err(ConfigError::Parse)?;
        if cfg.epics.is_empty() && cfg.issues.is_none() {
            return Err(ConfigError::NoTargets);
        }
        Ok(cfg)
    }

    /// Fetches an epic by key, id, or alias (case-insensitive), failing on
    /// ambiguity.
    pub fn epic(&self, name: &str) -> Result<(String, &EpicConfig), ConfigError> {
        let requested = name.trim();
        if requested.is_empty() {
            return Err(ConfigError::UnknownEpic(String::new()));
        }
        if let Some(epic) = self.epics.get(requested) {
            return Ok((requested.to_string(), epic));
        }

        let mut matched: Option<String> = None;
        let mut set_match = |key: &str| -> Result<(), ConfigError> {
            if let Some(existing) = &matched
                && existing != key
            {
                return Err(ConfigError::AmbiguousEpic {
                    requested: requested.to_string(),
                    first: existing.clone(),
                    second: key.to_string(),
                });
            }
            matched = Some(key.to_string());
            Ok(())
        };

        for (key, epic) in &self.epics {
            if epic.id.eq_ignore_ascii_case(requested) {
                set_match(key)?;
            }
        }
        for (key, epic) in &self.epics {
            let candidate = if epic.alias.trim().is_empty() {
                key.as_str()
            } else {
                epic.alias.trim()
            };
            if candidate.eq_ignore_ascii_case(requested) {
                set_match(key)?;
            }
        }

        match matched {
            Some(key) => {
                let epic = &self.epics[&key];
                Ok((key, epic))
            }
            None => Err(ConfigError::UnknownEpic(requested.to_string())),
        }
    }

    /// Whether `obi go` should pause for confirmation before the first
    /// session. Defaults to true.
    pub fn confirm_before_run(&self) -> bool {
        self.confirm_before_run.unwrap_or(true)
    }

    /// Summary config with defaults applied.
    pub fn summary_config(&self) -> SummaryConfig {
        let mut cfg = self.summary.clone();
        if cfg.prompt.trim().is_empty() {
            cfg.prompt = DEFAULT_SUMMARY_PROMPT.to_string();
        }
        if cfg.max_commits == 0 {
            cfg.max_commits = DEFAULT_SUMMARY_MAX_COMMITS;
        }
        if cfg.chunk_size == 0 {
            cfg.chunk_size = DEFAULT_SUMMARY_CHUNK_SIZE;
        }
        cfg
    }

    /// Configured results-log location, defaulting to
    /// `<user-config-dir>/obi/results.log`.
    pub fn results_log_path(&self) -> Result<PathBuf, ConfigError> {
        if !self.results_log.is_empty() {
            return expand_path(&self.results_log);
        }
        let dir = dirs::config_dir().ok_or(ConfigError::NoConfigDir)?;
        Ok(dir.join("obi").join("results.log"))
    }

    /// Merges the base codex config with an epic's override.
    pub fn effective_codex(&self, epic: &EpicConfig) -> CodexConfig {
        match &epic.codex_override {
            None => self.codex.clone(),
            Some(over) => merge_codex(&self.codex, over),
        }
    }
}

fn merge_codex(base: &CodexConfig, over: &CodexConfig) -> CodexConfig {
    let mut merged = base.clone();
    if !over.binary.is_empty() {
        merged.binary = over.binary.clone();
    }
    if !over.model.is_empty() {
        merged.model = over.model.clone();
    }
    if !over.sandbox.is_empty() {
        merged.sandbox = over.sandbox.clone();
    }
    if !over.approval.is_empty() {
        merged.approval = over.approval.clone();
    }
    if !over.extra_args.is_empty() {
        merged.extra_args = over.extra_args.clone();
    }
    merged
}

/// Picks the config location: explicit flag, then `OBI_CONFIG`, then an
/// upward search for `obi.toml`.
pub fn resolve_path(flag_path: Option<&str>) -> Result<PathBuf, ConfigError> {
    if let Some(path) = flag_path.filter(|p| !p.is_empty()) {
        return expand_path(path);
    }
    if let Ok(env) = std::env::var(CONFIG_ENV)
        && !env.is_empty()
    {
        return expand_path(&env);
    }
    let cwd = std::env::current_dir().map_err(ConfigError::WorkingDir)?;
    search_local_config(&cwd)
}

fn expand_path(path: &str) -> Result<PathBuf, ConfigError> {
    if path.is_empty() {
        return Err(ConfigError::EmptyPath);
    }
    if let Some(rest) = path.strip_prefix('~') {
        let home = dirs::home_dir().ok_or(ConfigError::NoHomeDir)?;
        return Ok(home.join(rest.trim_start_matches('/')));
    }
    std::path::absolute(path).map_err(ConfigError::Canonicalize)
}

fn search_local_config(start: &Path) -> Result<PathBuf, ConfigError> {
    let mut dir = start;
    loop {
        let candidate = dir.join(DEFAULT_CONFIG_NAME);
        if candidate.is_file() {
            return Ok(candidate);
        }
        match dir.parent() {
            Some(parent) => dir = parent,
            None => return Err(ConfigError::NotFound),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
results_log = "/tmp/obi/results.log"
base_prompt = "Follow the house rules."
confirm_before_run = false

[codex]
binary = "codex"
model = "gpt-5"

[summary]
max_commits = 10

[epic.payments]
name = "Payments Rework"
id = "pay-7-payments"
prompt = "Focus on the billing pipeline."
alias = "pay"

[epic.search]
name = "Search"
id = "srch-2-search"

[epic.search.codex]
model = "gpt-5-mini"
extra_args = ["--color", "never"]

["issues outside epics"]
prompt = "Pick up stray issues."
"#;

    fn sample() -> Config {
        toml::from_str(SAMPLE).expect("parse sample config")
    }

    #[test]
    fn parses_all_sections() {
        let cfg = sample();
        assert_eq!(cfg.results_log, "/tmp/obi/results.log");
        assert_eq!(cfg.base_prompt, "Follow the house rules.");
        assert_eq!(cfg.confirm_before_run, Some(false));
        assert_eq!(cfg.codex.model, "gpt-5");
        assert_eq!(cfg.epics.len(), 2);
        assert_eq!(cfg.epics["payments"].alias, "pay");
        assert_eq!(
            cfg.issues.as_ref().map(|i| i.prompt.as_str()),
            Some("Pick up stray issues.")
        );
        assert_eq!(cfg.summary.max_commits, 10);
    }

    #[test]
    fn requires_at_least_one_target() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("obi.toml");
        std::fs::write(&path, "results_log = \"x\"\n").unwrap();
        assert!(matches!(
            Config::load(&path),
            Err(ConfigError::NoTargets)
        ));
    }

    #[test]
    fn epic_resolution_by_key_id_and_alias() {
        let cfg = sample();
        let (key, _) = cfg.epic("payments").expect("by key");
        assert_eq!(key, "payments");
        let (key, _) = cfg.epic("PAY-7-PAYMENTS").expect("by id");
        assert_eq!(key, "payments");
        let (key, _) = cfg.epic("pay").expect("by alias");
        assert_eq!(key, "payments");
        let (key, _) = cfg.epic("search").expect("key doubles as alias");
        assert_eq!(key, "search");
        assert!(matches!(
            cfg.epic("nope"),
            Err(ConfigError::UnknownEpic(_))
        ));
    }

    #[test]
    fn ambiguous_alias_is_rejected() {
        let mut cfg = sample();
        cfg.epics.get_mut("search").unwrap().alias = "pay".to_string();
        assert!(matches!(
            cfg.epic("pay"),
            Err(ConfigError::AmbiguousEpic { .. })
        ));
    }

    #[test]
    fn codex_override_merges_field_by_field() {
        let cfg = sample();
        let (_, epic) = cfg.epic("search").expect("search epic");
        let merged = cfg.effective_codex(epic);
        assert_eq!(merged.binary, "codex");
        assert_eq!(merged.model, "gpt-5-mini");
        assert_eq!(merged.extra_args, vec!["--color", "never"]);

        let (_, epic) = cfg.epic("payments").expect("payments epic");
        assert_eq!(cfg.effective_codex(epic), cfg.codex);
    }

    #[test]
    fn summary_defaults_apply() {
        let cfg = sample();
        let summary = cfg.summary_config();
        assert_eq!(summary.max_commits, 10);
        assert_eq!(summary.chunk_size, DEFAULT_SUMMARY_CHUNK_SIZE);
        assert_eq!(summary.prompt, DEFAULT_SUMMARY_PROMPT);
    }

    #[test]
    fn confirm_defaults_to_true() {
        let cfg = toml::from_str::<Config>("[epic.x]\nid = \"x-1\"").unwrap();
        assert!(cfg.confirm_before_run());
        assert!(!sample().confirm_before_run());
    }

    #[test]
    fn results_log_path_prefers_configured_value() {
        let cfg = sample();
        assert_eq!(
            cfg.results_log_path().unwrap(),
            PathBuf::from("/tmp/obi/results.log")
        );

        let cfg = toml::from_str::<Config>("[epic.x]\nid = \"x-1\"").unwrap();
        let path = cfg.results_log_path().unwrap();
        assert!(path.ends_with("obi/results.log"));
    }

    #[test]
    fn upward_search_finds_config() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(dir.path().join(DEFAULT_CONFIG_NAME), "[epic.x]\nid = \"x-1\"").unwrap();

        let found = search_local_config(&nested).expect("found");
        assert_eq!(found, dir.path().join(DEFAULT_CONFIG_NAME));

        let lonely = tempfile::tempdir().unwrap();
        assert!(matches!(
            search_local_config(lonely.path()),
            Err(ConfigError::NotFound)
        ));
    }

    #[test]
    fn expand_path_handles_home_prefix() {
        let home = dirs::home_dir().unwrap();
        assert_eq!(expand_path("~/x/y").unwrap(), home.join("x/y"));
    }
}
