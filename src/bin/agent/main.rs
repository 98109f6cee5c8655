use std::path::PathBuf;
use std::time::Duration;

use agentic_rpa::brain::{HeuristicParser, InstructionParser};
use agentic_rpa::config::{AgentConfig, BrowserConfig, ExecutorConfig};
use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use dotenvy::dotenv;

#[derive(Parser)]
#[command(
    name = "agent",
    about = "Turns natural-language instructions into browser automation runs",
    version,
    long_about = None
)]
struct Cli {
    /// Emit process logs as JSON
    #[arg(long, env = "RPA_LOG_JSON", global = true)]
    log_json: bool,

    #[command(flatten)]
    tuning: Tuning,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct Tuning {
    /// Show the browser window
    #[arg(long, env = "RPA_HEADED", global = true)]
    headed: bool,

    /// Chrome/Chromium binary (auto-detected when omitted)
    #[arg(long, env = "RPA_CHROME_PATH", global = true)]
    chrome_path: Option<PathBuf>,

    /// Directory snapshots are written to
    #[arg(long, env = "RPA_SNAPSHOT_DIR", global = true)]
    snapshot_dir: Option<PathBuf>,

    #[arg(long, env = "RPA_NAVIGATE_TIMEOUT_MS", default_value_t = 30_000, global = true)]
    navigate_timeout_ms: u64,

    #[arg(long, env = "RPA_ELEMENT_TIMEOUT_MS", default_value_t = 10_000, global = true)]
    element_timeout_ms: u64,

    #[arg(long, env = "RPA_VISIBLE_TIMEOUT_MS", default_value_t = 15_000, global = true)]
    visible_timeout_ms: u64,

    /// Delay between consecutive steps
    #[arg(long, env = "RPA_STEP_DELAY_MS", default_value_t = 300, global = true)]
    step_delay_ms: u64,

    /// Re-check interval for paused runs
    #[arg(long, env = "RPA_PAUSE_POLL_MS", default_value_t = 500, global = true)]
    pause_poll_ms: u64,

    /// Maximum number of steps one run may execute
    #[arg(long, env = "RPA_MAX_STEPS", default_value_t = 25, global = true)]
    max_steps: usize,

    /// Longest wait step a run may perform
    #[arg(long, env = "RPA_MAX_WAIT_MS", default_value_t = 60_000, global = true)]
    max_wait_ms: u64,

    /// Wall-clock limit for one run (unlimited when omitted)
    #[arg(long, env = "RPA_RUN_TIMEOUT_SECS", global = true)]
    run_timeout_secs: Option<u64>,

    /// Log lines returned by a status read (at least 50)
    #[arg(long, env = "RPA_LOG_TAIL", default_value_t = 50, global = true)]
    log_tail: usize,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP control surface
    Serve {
        /// Bind address
        #[arg(long, env = "RPA_BIND", default_value = "127.0.0.1:3000")]
        bind: String,
    },

    /// Print the steps an instruction parses into, without running them
    Parse { instruction: String },

    /// Execute one instruction in the foreground and print its log
    Run { instruction: String },
}

impl Tuning {
    fn into_config(self, bind: Option<String>) -> AgentConfig {
        let defaults = AgentConfig::default();
        AgentConfig {
            bind: bind.unwrap_or(defaults.bind),
            log_tail: self.log_tail,
            browser: BrowserConfig {
                headless: !self.headed,
                chrome_path: self.chrome_path,
                snapshot_dir: self
                    .snapshot_dir
                    .unwrap_or(defaults.browser.snapshot_dir),
                navigate_timeout: Duration::from_millis(self.navigate_timeout_ms),
                element_timeout: Duration::from_millis(self.element_timeout_ms),
                visible_timeout: Duration::from_millis(self.visible_timeout_ms),
                ..defaults.browser
            },
            executor: ExecutorConfig {
                step_delay: Duration::from_millis(self.step_delay_ms),
                pause_poll: Duration::from_millis(self.pause_poll_ms),
                max_steps: self.max_steps,
                max_wait: Duration::from_millis(self.max_wait_ms),
                run_timeout: self.run_timeout_secs.map(Duration::from_secs),
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    match cli.command {
        Commands::Serve { bind } => {
            let config = cli.tuning.into_config(Some(bind));
            tracing::info!(bind = %config.bind, "starting agent");
            agentic_rpa::serve(config).await?;
        }
        Commands::Parse { instruction } => {
            let steps = HeuristicParser.parse(&instruction);
            println!("{}", serde_json::to_string_pretty(&steps)?);
        }
        Commands::Run { instruction } => {
            let config = cli.tuning.into_config(None);
            run_foreground(&config, &instruction).await?;
        }
    }

    Ok(())
}

async fn run_foreground(config: &AgentConfig, instruction: &str) -> Result<()> {
    let (control, sessions) = agentic_rpa::build(config);
    let submitted = control.submit(instruction).await?;
    eprintln!("[Agent] Run {} with {} step(s)", submitted.run_id, submitted.steps.len());

    let mut printed = 0usize;
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    let view = loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                eprintln!("[Agent] Ctrl-C, stopping run");
                control.stop(&submitted.run_id).await?;
            }
        }

        let run = control
            .store()
            .get(&submitted.run_id)
            .await
            .ok_or_else(|| anyhow::anyhow!("run {} disappeared", submitted.run_id))?;
        let total = run.log_seq as usize;
        let fresh = total.saturating_sub(printed).min(run.logs.len());
        for line in run.log_tail(fresh) {
            println!("{line}");
        }
        printed = total;

        if run.status.is_terminal() && run.session_id.is_none() {
            break run.view(config.log_tail);
        }
    };

    println!("{}", serde_json::to_string_pretty(&view)?);
    sessions.shutdown().await;
    Ok(())
}
