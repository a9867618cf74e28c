//! Deterministic stand-in for the agent CLI, used by the end-to-end tests.
//! Selects a scenario via `FAKE_AGENT_SCENARIO`, reads the prompt from the
//! final argument (or stdin), and replays the scripted transcript.

use std::io::Read;

use obi_core::fake_agent;
use obi_core::fake_agent::SCENARIO_ENV;
use obi_core::fake_agent::ScenarioContext;

fn main() {
    let name = std::env::var(SCENARIO_ENV).unwrap_or_default();
    let scenario = fake_agent::lookup(&name);

    let prompt = read_prompt();
    let ctx = ScenarioContext {
        session_id: fake_agent::extract_session_id(&prompt),
        prompt,
    };

    let mut stdout = std::io::stdout();
    let mut stderr = std::io::stderr();
    if let Err(err) = scenario.run(&ctx, &mut stdout, &mut stderr) {
        eprintln!("obi-fake-agent: {err}");
        std::process::exit(1);
    }
    std::process::exit(scenario.exit_code);
}

fn read_prompt() -> String {
    let args: Vec<String> = std::env::args().collect();
    if args.len() > 1 {
        return args[args.len() - 1].clone();
    }
    let mut prompt = String::new();
    let _ = std::io::stdin().read_to_string(&mut prompt);
    prompt
}
