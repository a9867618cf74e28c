//! Deterministic fake agent scenarios for end-to-end tests.
//!
//! The `obi-fake-agent` binary replays one of these scripts, substituting the
//! session UUID it finds in the prompt's fence instruction, so the full
//! orchestrator path can run without a real agent CLI.

use std::io::Write;
use std::time::Duration;

use regex_lite::Regex;

/// Selects the scenario replayed by the fake agent binary.
pub const SCENARIO_ENV: &str = "FAKE_AGENT_SCENARIO";

const SESSION_ID_PLACEHOLDER: &str = "{{SESSION_ID}}";

/// Metadata extracted from the prompt handed to the fake agent.
#[derive(Debug, Clone, Default)]
pub struct ScenarioContext {
    pub session_id: String,
    pub prompt: String,
}

/// A single scripted action.
#[derive(Debug, Clone)]
pub enum Step {
    Stdout { text: &'static str, repeat: usize },
    Stderr { text: &'static str, repeat: usize },
    Sleep(Duration),
}

/// One deterministic fake transcript.
#[derive(Debug, Clone)]
pub struct Scenario {
    pub name: &'static str,
    pub steps: Vec<Step>,
    pub exit_code: i32,
}

impl Scenario {
    /// Writes the scripted output to the provided streams.
    pub fn run(
        &self,
        ctx: &ScenarioContext,
        stdout: &mut dyn Write,
        stderr: &mut dyn Write,
    ) -> std::io::Result<()> {
        for step in &self.steps {
            match step {
                Step::Stdout { text, repeat } => {
                    write_repeated(stdout, &render(text, ctx), *repeat)?;
                }
                Step::Stderr { text, repeat } => {
                    write_repeated(stderr, &render(text, ctx), *repeat)?;
                }
                Step::Sleep(duration) => std::thread::sleep(*duration),
            }
        }
        Ok(())
    }
}

/// Returns the fenced-report UUID embedded in the prompt, or empty.
pub fn extract_session_id(prompt: &str) -> String {
    let pattern = Regex::new("```obi:([a-z0-9\\-]+)").expect("session pattern");
    pattern
        .captures(&prompt.to_lowercase())
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .unwrap_or_default()
}

/// Named scenario lookup, falling back to `success` for unknown names.
pub fn lookup(name: &str) -> Scenario {
    match name {
        "needs_help" => Scenario {
            name: "needs_help",
            steps: vec![
                stdout("Processing prompt for {{SESSION_ID}}\n"),
                stderr("warning: missing dependency\n"),
                stdout(
                    "```obi:{{SESSION_ID}}\nstatus: needs_help\ncommit_msg: Requires manual intervention\ndetails: |\n  Requires manual intervention\nescalation: sandbox approval required\n```\n",
                ),
                stdout(
                    "STATUS: needs_help\nCOMMIT_MSG:\nRequires manual intervention\nESCALATION: sandbox approval required\n",
                ),
            ],
            exit_code: 0,
        },
        "malformed" => Scenario {
            name: "malformed",
            steps: vec![
                stdout("Corrupting fenced report for {{SESSION_ID}}\n"),
                stdout(
                    "```obi:{{SESSION_ID}}\nstatus: success\ncommit_msg: Bad fence\ndetails: |\n  missing terminator\n",
                ),
            ],
            exit_code: 0,
        },
        "long_logs" => Scenario {
            name: "long_logs",
            steps: vec![
                Step::Stdout {
                    text: "Streaming SECRET_TOKEN output chunk\n",
                    repeat: 20,
                },
                Step::Stderr {
                    text: "stderr blip\n",
                    repeat: 10,
                },
                stdout(
                    "```obi:{{SESSION_ID}}\nstatus: success\ncommit_msg: Completed after long logs\ndetails: |\n  Completed after long logs with SECRET_TOKEN inside\nescalation:\n```\n",
                ),
                stdout(
                    "STATUS: success\nCOMMIT_MSG:\nCompleted after long logs with SECRET_TOKEN inside\nESCALATION:\n",
                ),
            ],
            exit_code: 0,
        },
        _ => Scenario {
            name: "success",
            steps: vec![
                stdout("Booting fake agent…\n"),
                stdout("Prompt received for session {{SESSION_ID}}\n"),
                stdout(
                    "```obi:{{SESSION_ID}}\nstatus: success\ncommit_msg: Completed fake run\ndetails: |\n  Completed fake run\nescalation:\n```\n",
                ),
                stdout("STATUS: success\nCOMMIT_MSG:\nCompleted fake run\nESCALATION:\n"),
            ],
            exit_code: 0,
        },
    }
}

fn stdout(text: &'static str) -> Step {
    Step::Stdout { text, repeat: 1 }
}

fn stderr(text: &'static str) -> Step {
    Step::Stderr { text, repeat: 1 }
}

fn render(body: &str, ctx: &ScenarioContext) -> String {
    body.replace(SESSION_ID_PLACEHOLDER, &ctx.session_id)
}

fn write_repeated(dst: &mut dyn Write, text: &str, repeat: usize) -> std::io::Result<()> {
    for _ in 0..repeat.max(1) {
        dst.write_all(text.as_bytes())?;
    }
    dst.flush()
}
