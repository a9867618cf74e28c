use clap::Parser;
use clap::Subcommand;
use obi_cli::go;
use obi_cli::go::GoOptions;
use tracing_subscriber::EnvFilter;

/// Obi drives an agent CLI through scoped work units, one session at a time.
#[derive(Debug, Parser)]
#[command(name = "obi", about = "Automate agent bead execution")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Preview and run agent sessions for an epic (or loose issues)
    Go(GoArgs),
}

#[derive(Debug, clap::Args)]
struct GoArgs {
    /// Epic alias or id; omitted targets issues outside epics
    #[arg(value_name = "TARGET")]
    target: Option<String>,

    /// Path to the obi config file
    #[arg(long = "config", value_name = "PATH")]
    config: Option<String>,

    /// Tee agent stdout/stderr to this file (overwritten per run)
    #[arg(short = 'o', long = "out", value_name = "PATH")]
    out: Option<String>,

    /// Skip beads already logged as success for this epic
    #[arg(long = "resume")]
    resume: bool,

    /// Disable the interactive TUI (stream raw agent output)
    #[arg(long = "no-tui")]
    no_tui: bool,
}

impl From<GoArgs> for GoOptions {
    fn from(args: GoArgs) -> Self {
        GoOptions {
            config_path: args.config,
            target: args.target,
            out_path: args.out,
            resume: args.resume,
            no_tui: args.no_tui,
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Go(args) => go::run(args.into()).await,
    };

    if let Err(err) = result {
        eprintln!("obi: {err:#}");
        std::process::exit(1);
    }
}
