//! Command-line surface: `run`, `daemon`, and `status`.

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};

use crate::config::Config;
use crate::daemon::{Daemon, compose};
use crate::error::ExitCode;
use crate::hooks::HookScheduler;
use crate::runner::PipelineDriver;
use crate::stage::Stage;
use crate::state::{StateStore, Terminal};
use crate::types::{CutawaySpec, FramingStyle, QueueItem, RunId, RunOptions, RunRequest};
use crate::workspace::Workspace;

#[derive(Debug, Parser)]
#[command(name = "reelsmith", version, about = "Autonomous short-form video pipeline daemon")]
pub struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose structured logging.
    #[arg(long, global = true)]
    verbose: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run one pipeline execution for a source URL.
    Run(RunArgs),
    /// Claim and process queued work until interrupted.
    Daemon,
    /// Inspect a run workspace.
    Status {
        /// Path to the run workspace.
        workspace: Utf8PathBuf,
    },
}

#[derive(Debug, clap::Args)]
struct RunArgs {
    /// Source video URL.
    url: String,

    /// The brief textual intent for the reel.
    #[arg(long)]
    message: String,

    /// Stop after this many stages.
    #[arg(long)]
    stages: Option<usize>,

    /// Per-stage timeout override, seconds.
    #[arg(long)]
    timeout: Option<u64>,

    /// Resume an existing workspace instead of starting fresh.
    #[arg(long)]
    resume: Option<Utf8PathBuf>,

    /// Skip ahead to this stage; prior artifacts must validate.
    #[arg(long, requires = "resume")]
    start_stage: Option<Stage>,

    /// Framing style.
    #[arg(long, default_value = "default")]
    style: FramingStyle,

    /// Target reel duration, seconds.
    #[arg(long)]
    target_duration: Option<u32>,

    /// Number of distinct moments to extract.
    #[arg(long)]
    moments: Option<u32>,

    /// Cutaway clips, URL@SECONDS. Repeatable.
    #[arg(long = "cutaway")]
    cutaways: Vec<CutawaySpec>,

    /// Free-form creative directives.
    #[arg(long)]
    instructions: Option<String>,

    /// Produce publishing assets in this language.
    #[arg(long)]
    publishing_language: Option<String>,
}

impl RunArgs {
    fn options(&self) -> RunOptions {
        RunOptions {
            target_duration: self.target_duration,
            style: self.style,
            moments: self.moments,
            instructions: self.instructions.clone(),
            cutaways: self.cutaways.clone(),
            publishing_language: self.publishing_language.clone(),
            resume_from: self.start_stage,
        }
    }
}

/// Parse arguments, execute, and return the process exit code.
pub async fn main() -> i32 {
    let cli = Cli::parse();
    if let Err(e) = crate::logging::init_tracing(cli.verbose) {
        eprintln!("failed to initialize logging: {e}");
    }

    match execute(cli.command).await {
        Ok(code) => code.as_i32(),
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::Validation.as_i32()
        }
    }
}

async fn execute(command: Command) -> Result<ExitCode> {
    let config = Config::load()?;
    match command {
        Command::Run(args) => run_once(config, args).await,
        Command::Daemon => {
            let caps = compose(&config);
            Daemon::new(config, caps)?.run().await?;
            Ok(ExitCode::Success)
        }
        Command::Status { workspace } => status(&workspace),
    }
}

async fn run_once(config: Config, args: RunArgs) -> Result<ExitCode> {
    let caps = compose(&config);
    let (notify_tx, mut notify_rx) = tokio::sync::mpsc::unbounded_channel();
    let driver = PipelineDriver::new(
        caps.clone(),
        config.clone(),
        HookScheduler::with_canonical_hooks(),
        notify_tx,
    )
    .with_stage_limit(args.stages)
    .with_timeout_override(args.timeout.map(std::time::Duration::from_secs));

    // Forward run notifications to the console messenger.
    let messenger = caps.messenger.clone();
    let forwarder = tokio::spawn(async move {
        while let Some(message) = notify_rx.recv().await {
            messenger.notify(&message).await.ok();
        }
    });

    let request = RunRequest {
        url: args.url.clone(),
        message: args.message.clone(),
        options: args.options(),
    };

    let terminal = match &args.resume {
        Some(path) => {
            let workspace = Workspace::open(path)
                .with_context(|| format!("not a resumable workspace: {path}"))?;
            driver
                .resume_run(workspace, &request, args.start_stage)
                .await?
        }
        None => {
            let run_id = RunId::mint(caps.clock.now());
            let workspace = Workspace::create(&config.paths.runs_root, run_id.clone())?;
            tracing::info!(workspace = %workspace.root(), "starting run");
            let item = QueueItem {
                item_id: format!("cli-{run_id}"),
                enqueued_at: caps.clock.now(),
                payload: request.clone(),
            };
            driver.execute_item(&item, workspace).await?
        }
    };

    forwarder.abort();
    Ok(match terminal {
        Terminal::Done => ExitCode::Success,
        Terminal::Escalated => ExitCode::Escalated,
        Terminal::Failed => ExitCode::FatalResource,
    })
}

fn status(workspace_dir: &Utf8PathBuf) -> Result<ExitCode> {
    let workspace =
        Workspace::open(workspace_dir).with_context(|| format!("not a workspace: {workspace_dir}"))?;
    let state = StateStore::new(workspace.root()).load()?;

    println!("run:        {}", state.run_id);
    println!("cursor:     {}", state.current_stage);
    println!("attempt:    {}", state.attempt);
    println!(
        "completed:  [{}]",
        state
            .completed_stages
            .iter()
            .map(|s| s.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );
    println!("last event: {}", state.last_event_id);
    println!("updated:    {}", state.updated_at.to_rfc3339());

    for stage in Stage::sequence() {
        for output in stage.descriptor().outputs {
            if workspace.has_artifact(output) {
                let path = workspace.artifact_path(output)?;
                let bytes = std::fs::read(path.as_std_path())?;
                let digest = crate::artifact::content_hash(&bytes);
                println!("artifact:   {output} {}", &digest[..8]);
            }
        }
    }
    Ok(ExitCode::Success)
}
