//! Margin CLI - replay scripted conversations and inspect native-messaging frames

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use console::style;
use tokio::io::AsyncRead;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use margin_cli::{JsonFilePersistence, ReplayReport, Scenario, default_conversations_dir, frames};
use margin_core::session::{ChatMessage, Role};
use margin_core::ConfigManager;

#[derive(Parser)]
#[command(name = "margin")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Document-side assistant session host", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to the user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Also write logs to daily files in this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a scripted conversation against a live session
    Replay {
        /// Scenario JSON file
        script: PathBuf,

        /// Directory for the saved conversation
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Convert native-messaging frames
    #[command(subcommand)]
    Frames(FrameCommands),

    /// Show configuration
    Config,
}

#[derive(Subcommand)]
enum FrameCommands {
    /// Frames to JSON lines
    Decode {
        /// Input file (stdin when omitted)
        file: Option<PathBuf>,
    },

    /// JSON lines to frames
    Encode {
        /// Input file (stdin when omitted)
        file: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Keep the guard alive so buffered file logs are flushed on exit
    let _log_guard = init_logging(cli.verbose, cli.log_dir.as_deref());

    let manager = match &cli.config {
        Some(path) => ConfigManager::with_path(path.clone())?,
        None => ConfigManager::new()?,
    };

    match cli.command {
        Commands::Replay { script, out } => run_replay(&manager, &script, out).await?,
        Commands::Frames(FrameCommands::Decode { file }) => {
            let count = frames::decode(open_input(file.as_deref()).await?, tokio::io::stdout()).await?;
            tracing::info!(count, "Decoded frames");
        }
        Commands::Frames(FrameCommands::Encode { file }) => {
            let count = frames::encode(open_input(file.as_deref()).await?, tokio::io::stdout()).await?;
            tracing::info!(count, "Encoded frames");
        }
        Commands::Config => show_config(&manager)?,
    }

    Ok(())
}

// Logs go to stderr so frame output on stdout stays clean
fn init_logging(
    verbose: bool,
    log_dir: Option<&Path>,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = || {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(if verbose { "info,margin_core=debug" } else { "warn" })
        })
    };
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(filter());

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "margin.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file_layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer)
                .with_filter(filter());
            tracing_subscriber::registry()
                .with(stderr_layer)
                .with(file_layer)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(stderr_layer).init();
            None
        }
    }
}

async fn open_input(file: Option<&Path>) -> anyhow::Result<Box<dyn AsyncRead + Unpin + Send + Sync>> {
    Ok(match file {
        Some(path) => Box::new(tokio::fs::File::open(path).await?),
        None => Box::new(tokio::io::stdin()),
    })
}

async fn run_replay(manager: &ConfigManager, script: &Path, out: Option<PathBuf>) -> anyhow::Result<()> {
    let scenario = Scenario::load(script)?;
    let dir = match out {
        Some(dir) => dir,
        None => default_conversations_dir()?,
    };
    let persistence = Arc::new(JsonFilePersistence::new(dir));
    let history = persistence
        .load(&scenario.conversation_id)?
        .map(|saved| saved.into_state());
    let conversation_id = scenario.conversation_id.clone();

    let report = margin_cli::run_scenario(
        scenario,
        manager.config().clone(),
        persistence.clone(),
        history,
    )
    .await?;

    print_report(&report);
    println!();
    println!(
        "  Saved to: {}",
        style(persistence.path_for(&conversation_id).display()).dim()
    );
    Ok(())
}

fn print_report(report: &ReplayReport) {
    println!("{}", style("Transcript:").bold());
    for message in &report.snapshot.messages {
        print_message(message);
    }

    println!();
    println!("{}", style("Document:").bold());
    for line in report.document.lines() {
        println!("  {}", line);
    }

    println!();
    println!(
        "  {} job(s) created, {} tool response(s) sent",
        report.jobs_created, report.tool_responses
    );
    if report.unused_jobs > 0 {
        println!();
        println!(
            "{}",
            style(format!("{} scripted job(s) were never used", report.unused_jobs)).yellow()
        );
    }
}

fn print_message(message: &ChatMessage) {
    if let Some(review) = &message.patch {
        println!(
            "  {} {:?} ({:?}, rev {})",
            style("patch").magenta(),
            review.kind,
            review.status,
            review.revision
        );
        for line in review.text.lines() {
            println!("    {}", style(line).dim());
        }
        if let Some(error) = &review.error {
            println!("    {}", style(error).red());
        }
        return;
    }

    let label = match message.role {
        Role::User => style("you").cyan(),
        Role::Assistant => style("assistant").green(),
        Role::System => style("system").red(),
    };
    println!("  {}: {}", label, message.content);
    if let Some(status) = &message.status_line {
        println!("    {}", style(status).dim());
    }
}

fn show_config(manager: &ConfigManager) -> anyhow::Result<()> {
    println!("{}", style("Configuration:").bold());
    println!("  Path: {}", style(manager.path().display()).dim());
    println!();
    print!("{}", toml::to_string_pretty(manager.config())?);
    Ok(())
}
