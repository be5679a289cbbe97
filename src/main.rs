// src/main.rs

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use taskdl::logging;
use taskdl::prelude::*;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "taskdl", version, about = "Download files with a bounded number of parallel transfers")]
struct Cli {
    /// Preference database [default: $XDG_CONFIG_HOME/taskdl/preferences.db]
    #[arg(long, global = true)]
    prefs: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Download one or more URLs.
    ///
    /// While running, type `p ID`, `r ID` or `c ID` to pause, resume or
    /// cancel a download, `pa`, `ra` or `ca` for all of them, `ls` to list.
    Get {
        #[arg(required = true)]
        sources: Vec<String>,
        /// Parallel downloads, overriding the stored preference.
        #[arg(short, long)]
        concurrency: Option<usize>,
        /// Output directory [default: $XDG_DATA_HOME/taskdl/downloads]
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Print events as JSON lines.
        #[arg(long)]
        json: bool,
    },
    /// Show or change stored preferences.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Debug, Subcommand)]
enum ConfigAction {
    Show,
    SetConcurrency { limit: usize },
}

#[tokio::main]
async fn main() -> Result<()> {
    if logging::init_logging().is_err() {
        logging::init_logging_stderr();
    }
    let cli = Cli::parse();

    let prefs_path = match cli.prefs {
        Some(path) => path,
        None => xdg::BaseDirectories::with_prefix("taskdl")?.place_config_file("preferences.db")?,
    };
    let prefs = SqlitePreferences::open(&prefs_path)
        .await
        .with_context(|| format!("opening preferences at {}", prefs_path.display()))?;

    match cli.command {
        Command::Config { action: ConfigAction::Show } => {
            println!("preferences: {}", prefs_path.display());
            println!("max-parallel-download: {}", prefs.concurrency_limit().await?);
        }
        Command::Config { action: ConfigAction::SetConcurrency { limit } } => {
            prefs.set_concurrency_limit(limit).await?;
            println!("max-parallel-download set to {limit}");
        }
        Command::Get { sources, concurrency, output, json } => {
            let output = match output {
                Some(dir) => dir,
                None => xdg::BaseDirectories::with_prefix("taskdl")?.create_data_directory("downloads")?,
            };
            let resolver = Arc::new(HttpResolver::new(&output)?);
            let (manager, events) = match concurrency {
                Some(0) => bail!("--concurrency must be at least 1"),
                Some(limit) => DownloadManager::from_preferences(resolver, &StaticPreferences(limit)).await?,
                None => DownloadManager::from_preferences(resolver, &prefs).await?,
            };
            info!(output = %output.display(), limit = manager.limit(), "starting downloads");
            run_downloads(manager, events, sources, json).await?;
        }
    }
    Ok(())
}

async fn run_downloads(
    manager: DownloadManager,
    mut events: RelayStream,
    sources: Vec<String>,
    json: bool,
) -> Result<()> {
    let requests: Vec<Request> = sources.iter().map(|s| Request::from_url(s)).collect();
    let titles: HashMap<TaskId, String> = {
        let ids = manager.enqueue(requests.clone()).await?;
        ids.into_iter().zip(requests.into_iter().map(|r| r.title)).collect()
    };
    let mut remaining: HashSet<TaskId> = titles.keys().copied().collect();
    manager.submit_all().await;

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut failed = 0usize;

    while !remaining.is_empty() {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                render(&event, &titles, json)?;
                if let Some(state) = event.terminal_state() {
                    remaining.remove(&event.task_id);
                    if state == TaskState::Failed {
                        failed += 1;
                    }
                }
            }
            line = stdin.next_line(), if stdin_open => match line {
                Ok(Some(line)) => {
                    if let Err(e) = handle_command(&manager, line.trim()).await {
                        eprintln!("{e}");
                    }
                }
                _ => stdin_open = false,
            },
            _ = tokio::signal::ctrl_c() => {
                eprintln!("interrupted, cancelling downloads");
                manager.cancel_all().await;
            }
        }
    }

    if failed > 0 {
        bail!("{failed} download(s) failed");
    }
    Ok(())
}

async fn handle_command(manager: &DownloadManager, line: &str) -> Result<()> {
    let mut parts = line.split_whitespace();
    let Some(cmd) = parts.next() else {
        return Ok(());
    };
    let id = parts
        .next()
        .map(|raw| raw.parse::<u64>().map(TaskId))
        .transpose()
        .context("task id must be a number")?;

    match (cmd, id) {
        ("p", Some(id)) => manager.pause(id).await?,
        ("r", Some(id)) => manager.resume(id).await?,
        ("c", Some(id)) => manager.cancel(id).await?,
        ("pa", None) => {
            manager.pause_all().await;
        }
        ("ra", None) => {
            manager.resume_all().await;
        }
        ("ca", None) => {
            manager.cancel_all().await;
        }
        ("ls", None) => {
            for task in manager.snapshots().await {
                println!(
                    "{:>4}  {:<10} {:>5.1}%  {}",
                    task.id.to_string(),
                    task.state.to_string(),
                    task.progress.percent,
                    task.request.title
                );
            }
        }
        _ => bail!("unknown command {line:?}; try p/r/c ID, pa, ra, ca or ls"),
    }
    Ok(())
}

fn render(event: &TaskEvent, titles: &HashMap<TaskId, String>, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(event)?);
        return Ok(());
    }
    let title = titles.get(&event.task_id).map(String::as_str).unwrap_or("?");
    let id = event.task_id;
    match &event.kind {
        EventKind::BinariesAcquiring => println!("[{id}] {title}: preparing tools"),
        EventKind::BinariesAcquired => println!("[{id}] {title}: tools ready"),
        EventKind::Progress { percent, transferred, total } => match total {
            Some(total) => println!("[{id}] {title}: {percent:.0}% ({transferred}/{total} bytes)"),
            None => println!("[{id}] {title}: {transferred} bytes"),
        },
        EventKind::Error { cause, failure } => match failure {
            FailureKind::ResourceExhausted => eprintln!("[{id}] {title}: not enough space: {cause}"),
            FailureKind::Resolution => eprintln!("[{id}] {title}: error: {cause}"),
        },
        EventKind::StateChanged { state } => println!("[{id}] {title}: {state}"),
    }
    Ok(())
}
