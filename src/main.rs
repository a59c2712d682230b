//! CLI entry point for the harvester tool.

use std::io::{self, IsTerminal};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use harvester_core::{
    DocumentFormat, Harvester, HarvesterConfig, ProgressSnapshot, RuleRegistry, TaskId, TaskStatus, TextSink,
};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use tracing::{debug, info, warn};

mod app_config;
mod cli;

use app_config::{FileConfig, VerbositySetting, load_config};
use cli::{CacheAction, Cli, Command, DownloadArgs};

const POLL_INTERVAL: Duration = Duration::from_millis(200);

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let cli = Cli::parse();
    let loaded = load_config(cli.config.as_deref())?;
    let file_config = loaded.config.unwrap_or_default();

    init_tracing(&cli, file_config.verbosity);
    debug!(?cli, config = ?loaded.path, "CLI arguments parsed");

    let mut config = HarvesterConfig::default();
    file_config.apply(&mut config);
    if let Command::Download(args) = &cli.command {
        apply_download_flags(&mut config, args);
    }

    let rules = load_rules(&cli, &file_config)?;
    let output_dir = output_dir(&cli, &file_config);
    let harvester = Harvester::new(config, rules, Arc::new(TextSink::new(output_dir)))
        .context("Invalid harvester configuration")?;

    let result = run(&harvester, cli.command, !cli.quiet).await;
    harvester.shutdown().await;
    result
}

/// Priority: `RUST_LOG` > `--quiet` > `-v` count > config verbosity > warn.
/// Logs go to stderr so stdout stays valid JSON.
fn init_tracing(cli: &Cli, file_verbosity: Option<VerbositySetting>) {
    let default_level = if cli.quiet {
        "error"
    } else {
        match cli.verbose {
            0 => file_verbosity.map_or("warn", VerbositySetting::log_level),
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn load_rules(cli: &Cli, file_config: &FileConfig) -> Result<RuleRegistry> {
    let path = cli.rules.clone().or_else(|| file_config.rules_path.clone());
    match path {
        Some(path) => RuleRegistry::load(&path)
            .with_context(|| format!("Failed to load source rules from '{}'", path.display())),
        None if matches!(cli.command, Command::Cache { .. }) => Ok(RuleRegistry::from_records(&[])?),
        None => bail!("No source rules configured: pass --rules or set `rules_path` in the config file"),
    }
}

fn output_dir(cli: &Cli, file_config: &FileConfig) -> PathBuf {
    let flag = match &cli.command {
        Command::Download(args) => args.output.clone(),
        _ => None,
    };
    flag.or_else(|| file_config.output_dir.clone())
        .unwrap_or_else(|| PathBuf::from("."))
}

fn apply_download_flags(config: &mut HarvesterConfig, args: &DownloadArgs) {
    if let Some(batch_size) = args.batch_size {
        config.download.batch_size = usize::from(batch_size);
    }
    if let Some(retries) = args.retries {
        config.download.retry_times = u32::from(retries);
    }
    config.download.start_chapter = args.start;
    config.download.end_chapter = args.end;
}

async fn run(harvester: &Harvester, command: Command, show_progress: bool) -> Result<ExitCode> {
    match command {
        Command::Search { keyword, max } => {
            print_json(&harvester.search(&keyword, usize::from(max)).await)?;
        }
        Command::Detail(target) => {
            print_json(&harvester.get_detail(&target.url, &target.source).await?)?;
        }
        Command::Toc { target, start, end } => {
            print_json(&harvester.get_toc(&target.url, &target.source, start, end).await?)?;
        }
        Command::Chapter(target) => {
            print_json(&harvester.get_chapter(&target.url, &target.source).await?)?;
        }
        Command::Download(args) => return download(harvester, &args, show_progress).await,
        Command::Sources => print_json(&harvester.sources())?,
        Command::Cache { action } => {
            let cache = harvester.cache();
            match action {
                CacheAction::Sweep => print_json(&serde_json::json!({ "removed": cache.sweep_expired().await }))?,
                CacheAction::Invalidate { pattern } => {
                    print_json(&serde_json::json!({ "removed": cache.invalidate(&pattern).await }))?;
                }
                CacheAction::Stats => print_json(&cache.stats())?,
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn download(harvester: &Harvester, args: &DownloadArgs, show_progress: bool) -> Result<ExitCode> {
    let format: DocumentFormat = args.format.parse()?;
    let task_id = harvester.start_download(&args.target.url, &args.target.source, format, None)?;
    info!(task_id = %task_id, "Download started");

    let spinner = (show_progress && io::stderr().is_terminal()).then(new_spinner);
    let snapshot = tokio::select! {
        snapshot = wait_for_task(harvester, &task_id, spinner.as_ref()) => snapshot?,
        _ = tokio::signal::ctrl_c() => {
            warn!(task_id = %task_id, "Interrupted, cancelling download");
            harvester.cancel_download(&task_id)?;
            harvester.get_progress(&task_id)?
        }
    };
    if let Some(spinner) = spinner {
        spinner.finish_and_clear();
    }

    print_json(&snapshot)?;
    Ok(if snapshot.status == TaskStatus::Completed {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn new_spinner() -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::with_template("{spinner} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner
}

async fn wait_for_task(
    harvester: &Harvester,
    task_id: &TaskId,
    spinner: Option<&ProgressBar>,
) -> Result<ProgressSnapshot> {
    loop {
        let snapshot = harvester.get_progress(task_id)?;
        if snapshot.status.is_terminal() {
            return Ok(snapshot);
        }
        if let Some(spinner) = spinner {
            spinner.set_message(format!(
                "[{}/{}] {:.0}% {}",
                snapshot.completed_chapters + snapshot.failed_chapters,
                snapshot.total_chapters,
                snapshot.progress_percentage,
                snapshot.current_chapter.as_deref().unwrap_or("")
            ));
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value).context("Failed to render JSON output")?;
    println!("{rendered}");
    Ok(())
}
