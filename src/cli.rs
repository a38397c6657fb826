use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "loadforge", version, about = "Staged HTTP load generator for correlated multi-step scenarios")]
pub struct Cli {
    /// Log at debug level (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run a test plan and exit with its verdict
    Run(RunArgs),
    /// Accept test plans over a WebSocket at /ws
    Serve(ServeArgs),
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Path to the JSON test plan
    #[arg(short, long)]
    pub plan: PathBuf,

    /// Overrides the plan's base_url
    #[arg(long, env = "BASE_URL")]
    pub base_url: Option<String>,

    /// Write the full JSON report here
    #[arg(long)]
    pub summary_export: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct ServeArgs {
    #[arg(long, env = "LOADFORGE_BIND", default_value = "127.0.0.1:8080")]
    pub bind: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_run_arguments() {
        let cli = Cli::try_parse_from([
            "loadforge",
            "run",
            "--plan",
            "demos/brokerx-workflow.json",
            "--base-url",
            "http://localhost:8080",
            "-v",
        ])
        .unwrap();
        assert!(cli.verbose);
        match cli.command {
            Command::Run(args) => {
                assert_eq!(args.plan, PathBuf::from("demos/brokerx-workflow.json"));
                assert_eq!(args.base_url.as_deref(), Some("http://localhost:8080"));
                assert!(args.summary_export.is_none());
            }
            Command::Serve(_) => panic!("expected run"),
        }
    }

    #[test]
    fn run_requires_a_plan() {
        assert!(Cli::try_parse_from(["loadforge", "run"]).is_err());
    }
}
