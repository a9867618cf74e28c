//! Builds the agent CLI invocation from config plus the prepared prompt.

use std::fmt;

use thiserror::Error;

use crate::config::CodexConfig;

const DEFAULT_BINARY: &str = "codex";

/// A resolved agent command line: binary plus ordered arguments, with the
/// prompt as the final argument.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Invocation {
    pub binary: String,
    pub args: Vec<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InvocationError {
    #[error("empty prompt")]
    EmptyPrompt,
}

impl Invocation {
    /// Produces `exec [--model M] [--sandbox S] [--ask-for-approval A]
    /// [extra args…] <prompt>`.
    pub fn build(cfg: &CodexConfig, prompt: &str) -> Result<Self, InvocationError> {
        if prompt.is_empty() {
            return Err(InvocationError::EmptyPrompt);
        }
        let binary = if cfg.binary.is_empty() {
            DEFAULT_BINARY.to_string()
        } else {
            cfg.binary.clone()
        };

        let mut args = vec!["exec".to_string()];
        if !cfg.model.is_empty() {
            args.push("--model".to_string());
            args.push(cfg.model.clone());
        }
        if !cfg.sandbox.is_empty() {
            args.push("--sandbox".to_string());
            args.push(cfg.sandbox.clone());
        }
        if !cfg.approval.is_empty() {
            args.push("--ask-for-approval".to_string());
            args.push(cfg.approval.clone());
        }
        args.extend(cfg.extra_args.iter().cloned());
        args.push(prompt.to_string());

        Ok(Self { binary, args })
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:?}", self.binary, self.args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_codex_binary() {
        let inv = Invocation::build(&CodexConfig::default(), "do the work").expect("build");
        assert_eq!(inv.binary, "codex");
        assert_eq!(inv.args, vec!["exec", "do the work"]);
    }

    #[test]
    fn flags_are_ordered_and_prompt_is_last() {
        let cfg = CodexConfig {
            binary: "my-codex".to_string(),
            model: "gpt-5".to_string(),
            sandbox: "workspace-write".to_string(),
            approval: "never".to_string(),
            extra_args: vec!["--color".to_string(), "never".to_string()],
        };
        let inv = Invocation::build(&cfg, "prompt body").expect("build");
        assert_eq!(inv.binary, "my-codex");
        assert_eq!(
            inv.args,
            vec![
                "exec",
                "--model",
                "gpt-5",
                "--sandbox",
                "workspace-write",
                "--ask-for-approval",
                "never",
                "--color",
                "never",
                "prompt body",
            ]
        );
    }

    #[test]
    fn empty_prompt_is_rejected() {
        let err = Invocation::build(&CodexConfig::default(), "").expect_err("empty prompt");
        assert_eq!(err, InvocationError::EmptyPrompt);
    }
}
