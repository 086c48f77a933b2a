use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use planscript_runtime::{replay_run, run_script_file, RunOptions};

use crate::config::DriverConfig;

#[derive(Debug, Parser)]
#[command(name = "psrun", about = "PlanScript workflow runner")]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a script against a project directory
    Run(RunArgs),
    /// Print the timeline of a recorded run
    Replay(ReplayArgs),
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Script to execute
    script: PathBuf,
    /// Project root the sandbox resolves against
    #[arg(long, default_value = ".")]
    project: PathBuf,
    /// Optional YAML config with llm/budget/policy defaults
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    max_steps: Option<u64>,
    #[arg(long)]
    max_time_ms: Option<u64>,
    #[arg(long)]
    max_tool_calls: Option<u64>,
    #[arg(long)]
    max_llm_calls: Option<u64>,
    #[arg(long)]
    max_tokens: Option<u64>,
    #[arg(long)]
    max_cost_usd: Option<f64>,
}

#[derive(Debug, Args)]
struct ReplayArgs {
    /// Run identifier under .ps-runs/
    run_id: String,
    #[arg(long, default_value = ".")]
    project: PathBuf,
}

impl Cli {
    pub async fn run(self) -> i32 {
        init_tracing();
        match self.command {
            Command::Run(args) => run_command(args).await,
            Command::Replay(args) => replay_command(args),
        }
    }
}

async fn run_command(args: RunArgs) -> i32 {
    let config = match &args.config {
        Some(path) => match DriverConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("psrun: {:#}", e);
                return 1;
            }
        },
        None => DriverConfig::default(),
    };

    let mut budget = config.budget_config();
    budget.max_steps = args.max_steps.or(budget.max_steps);
    budget.max_time_ms = args.max_time_ms.or(budget.max_time_ms);
    budget.max_tool_calls = args.max_tool_calls.or(budget.max_tool_calls);
    budget.max_llm_calls = args.max_llm_calls.or(budget.max_llm_calls);
    budget.max_tokens = args.max_tokens.or(budget.max_tokens);
    budget.max_cost_usd = args.max_cost_usd.or(budget.max_cost_usd);

    let options = RunOptions {
        policy: config.policy(),
        budget,
        llm: config.llm_config(),
        ..RunOptions::default()
    };

    match run_script_file(&args.project, &args.script, options).await {
        Ok(outcome) => {
            println!("[ps] run {} finished; logs at {}", outcome.run_id, outcome.logs_dir.display());
            if let Some(result) = outcome.result {
                println!("[ps] result: {}", result);
            }
            0
        }
        Err(e) => {
            eprintln!("psrun: {}", e);
            1
        }
    }
}

fn replay_command(args: ReplayArgs) -> i32 {
    match replay_run(&args.project, &args.run_id) {
        Ok(timeline) => {
            print!("{}", timeline);
            0
        }
        Err(e) => {
            eprintln!("psrun: {}", e);
            1
        }
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .compact()
        .try_init();
}
