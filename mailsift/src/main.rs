use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

use mailsift::adapters::imap::ImapMailSource;
use mailsift::config::{self, AppConfig, CodesConfig};
use mailsift::embedding;
use mailsift::error::MailsiftError;
use mailsift::logging;
use mailsift::services::message_service;
use mailsift::services::search::{SearchFilters, SearchHit, SearchService};
use mailsift::services::sync::{run_sync, SyncContext, SyncOptions};
use mailsift::state::{LocalState, OpenMode, StateOptions};
use mailsift::types::RemoteId;

#[derive(Parser, Debug)]
#[command(name = "mailsift")]
#[command(about = "Incrementally index a mailbox and search it semantically", long_about = None)]
struct Args {
    /// Path to the config file (default: first of the standard locations that exists)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the state directory
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch and index messages newer than the watermark
    Sync,

    /// List the most recent indexed messages
    List {
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Show one message by remote id
    Get { id: RemoteId },

    /// Semantic search, falling back to keywords when nothing matches
    Search {
        query: String,

        /// Only messages on or after this date (YYYY-MM-DD)
        #[arg(long)]
        after: Option<String>,

        /// Only messages before this date (YYYY-MM-DD)
        #[arg(long)]
        before: Option<String>,

        /// Case-insensitive substring of the sender
        #[arg(long)]
        sender: Option<String>,

        /// Regular expression the body or subject must match
        #[arg(long)]
        regex: Option<String>,

        /// Only messages with a detected verification code
        #[arg(long)]
        codes_only: bool,

        #[arg(short = 'k', long, default_value = "10")]
        limit: usize,
    },

    /// List messages containing verification codes
    SearchCodes {
        /// Pattern set: default, strict, broad (default: from config)
        #[arg(long)]
        set: Option<String>,

        /// Custom regular expression; every match is reported as a code
        #[arg(long, conflicts_with = "set")]
        pattern: Option<String>,

        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Show counts, watermark and index health
    Status,

    /// Rebuild the vector index from stored embeddings
    RebuildIndex,
}

#[tokio::main]
async fn main() -> ExitCode {
    logging::init();
    let args = Args::parse();

    match run(args).await {
        Ok(code) => code,
        Err(e) => {
            error!("{}", e);
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<ExitCode, MailsiftError> {
    let config = config::load(args.config.as_deref())?;
    // The flag wins over MAILSIFT_STATE_DIR and the config file
    let root = args.state_dir.unwrap_or_else(|| config.state_dir());

    match args.command {
        Command::Sync => sync(&config, &root).await,
        Command::List { limit } => {
            let local = open_state(&config, &root, OpenMode::ReadOnly)?;
            for record in message_service::list(&local, limit)? {
                println!(
                    "{:>8}  {}  {:<30}  {}",
                    record.remote_id,
                    fmt_date(record.timestamp),
                    truncate(&record.sender, 30),
                    record.subject
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Get { id } => {
            let local = open_state(&config, &root, OpenMode::ReadOnly)?;
            let record = message_service::get(&local, id)?;
            println!("Id:      {}", record.remote_id);
            println!("From:    {}", record.sender);
            println!("Date:    {}", fmt_date(record.timestamp));
            println!("Subject: {}", record.subject);
            println!();
            println!("{}", record.body_excerpt);
            Ok(ExitCode::SUCCESS)
        }
        Command::Search {
            query,
            after,
            before,
            sender,
            regex,
            codes_only,
            limit,
        } => {
            let filters = SearchFilters {
                after: after.as_deref().map(parse_date).transpose()?,
                before: before.as_deref().map(parse_date).transpose()?,
                sender,
                body_regex: regex.as_deref().map(Regex::new).transpose()?,
                verification_only: codes_only,
            };
            search(&config, &root, &query, &filters, limit).await
        }
        Command::SearchCodes { set, pattern, limit } => {
            let patterns = code_patterns(set.as_deref(), pattern.as_deref(), &config.codes)?;
            let local = open_state(&config, &root, OpenMode::ReadOnly)?;
            let found = message_service::search_by_pattern(&local, &patterns)?;
            if found.is_empty() {
                println!("No verification codes found");
            }
            for m in found.into_iter().take(limit) {
                println!(
                    "{:>8}  {}  {:<24}  {}  [{}]",
                    m.record.remote_id,
                    fmt_date(m.record.timestamp),
                    truncate(&m.record.sender, 24),
                    m.record.subject,
                    m.codes.join(", ")
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Status => {
            let local = open_state(&config, &root, OpenMode::ReadOnly)?;
            let report = message_service::status(&local)?;
            println!("State dir:   {}", local.root().display());
            println!("Epoch:       {}", report.epoch.as_deref().unwrap_or("-"));
            println!("Watermark:   {}", report.watermark);
            println!("Messages:    {}", report.messages);
            println!("Index slots: {}", report.slots);
            println!("Skipped:     {}", report.skipped);
            println!("Generation:  {}", report.generation);
            println!("In sync:     {}", if report.index_in_sync { "yes" } else { "no" });
            if let Some((first, last)) = report.date_range {
                println!("Date range:  {} .. {}", fmt_date(first), fmt_date(last));
            }
            if let Some(ms) = report.last_sync {
                println!("Last sync:   {}", fmt_date(ms / 1000));
            }
            println!("Database:    {} bytes", report.db_bytes);
            println!("Index:       {} bytes", report.index_bytes);
            Ok(ExitCode::SUCCESS)
        }
        Command::RebuildIndex => {
            let local = open_state(&config, &root, OpenMode::ReadWrite)?;
            let _lock = local.lock()?;
            let count = local.rebuild_index()?;
            println!("Rebuilt index with {} entries", count);
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// `--pattern` wins over `--set`, which wins over the config file.
fn code_patterns(
    set: Option<&str>,
    pattern: Option<&str>,
    codes: &CodesConfig,
) -> Result<code_detector::PatternSet, MailsiftError> {
    if let Some(pattern) = pattern {
        return Ok(code_detector::PatternSet::custom(pattern)?);
    }
    match set {
        Some(name) => code_detector::PatternSet::from_name(name)
            .ok_or_else(|| MailsiftError::InvalidInput(format!("unknown pattern set '{}'", name))),
        None => codes.pattern_set(),
    }
}

fn open_state(config: &AppConfig, root: &Path, mode: OpenMode) -> Result<LocalState, MailsiftError> {
    if mode == OpenMode::ReadOnly && !root.exists() {
        return Err(MailsiftError::Config(format!(
            "no state at {}, run `mailsift sync` first",
            root.display()
        )));
    }
    LocalState::open(
        root,
        StateOptions {
            dimension: config.embedding.dimension,
            index: config.index.params(),
            busy_timeout: config.busy_timeout(),
            mode,
        },
    )
}

async fn sync(config: &AppConfig, root: &Path) -> Result<ExitCode, MailsiftError> {
    let imap = config
        .imap
        .as_ref()
        .ok_or_else(|| MailsiftError::Config("missing [imap] section".into()))?
        .resolve()?;
    let source = ImapMailSource::new(imap);
    let embedder = embedding::from_config(&config.embedding)?;
    let options = SyncOptions::from_config(config)?;
    let local = open_state(config, root, OpenMode::ReadWrite)?;

    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = Arc::clone(&cancel);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, stopping after the current chunk");
                cancel.store(true, Ordering::SeqCst);
            }
        });
    }

    let ctx = SyncContext::new(&source, embedder.as_ref(), options).with_cancel(cancel);
    let state = local.load_sync_state()?;
    let result = run_sync(&local, state, &ctx).await;
    source.close().await;
    let (_, report) = result?;

    if report.reset {
        println!(
            "Mailbox epoch changed ({} -> {}), local state was rebuilt",
            report.previous_epoch.as_deref().unwrap_or("-"),
            report.epoch
        );
    }
    println!(
        "Synced {} messages ({} skipped) in {} chunks, watermark {}",
        report.processed, report.skipped, report.committed_chunks, report.watermark
    );
    if report.removed > 0 {
        println!("Removed {} messages deleted on the server", report.removed);
    }
    for failure in &report.failed_chunks {
        println!(
            "Chunk {} ({}..{}) failed after {} attempts: {}",
            failure.chunk, failure.first, failure.last, failure.attempts, failure.error
        );
    }
    if report.cancelled {
        println!("Sync cancelled; progress up to the watermark is kept");
    }

    if report.is_complete() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::from(2))
    }
}

async fn search(
    config: &AppConfig,
    root: &Path,
    query: &str,
    filters: &SearchFilters,
    limit: usize,
) -> Result<ExitCode, MailsiftError> {
    let local = open_state(config, root, OpenMode::ReadOnly)?;
    let embedder = embedding::from_config(&config.embedding)?;
    let service = SearchService::new(&local, embedder.as_ref())
        .with_timeout(std::time::Duration::from_secs(config.embedding.timeout_secs));

    let mut hits = service.search(query, limit, filters).await?;
    if hits.is_empty() {
        info!("Semantic search found nothing, trying keywords");
        hits = message_service::keyword_search(&local, query, filters, limit)?;
    }

    if hits.is_empty() {
        println!("No matches");
    }
    print_hits(&hits);
    Ok(ExitCode::SUCCESS)
}

fn print_hits(hits: &[SearchHit]) {
    for hit in hits {
        println!(
            "{:>8}  {:.3}  {}  {:<24}  {}",
            hit.record.remote_id,
            hit.similarity,
            fmt_date(hit.record.timestamp),
            truncate(&hit.record.sender, 24),
            hit.record.subject
        );
    }
}

fn parse_date(s: &str) -> Result<i64, MailsiftError> {
    let date = NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|e| MailsiftError::InvalidInput(format!("invalid date '{}': {}", s, e)))?;
    date.and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc().timestamp())
        .ok_or_else(|| MailsiftError::InvalidInput(format!("invalid date '{}'", s)))
}

fn fmt_date(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "-".into())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let mut out: String = s.chars().take(max.saturating_sub(1)).collect();
        out.push('…');
        out
    }
}
