//! CLI binary for sitedocs-ingest.
//!
//! Runs a local document through the same job lifecycle the service uses
//! (submit → queue → PROCESSING → COMPLETED/FAILED) and prints the result.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use sitedocs_ingest::{
    ExtractionJob, FsDocumentStore, IngestConfig, IngestService, JobStatus, KnownProject,
    LogNotifier, NotificationDispatcher, RenderChain, StaticProjectCatalog, SubmitRequest,
};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers ──────────────────────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Analyse every page of a drawing set
  ingest analyze S-201.pdf

  # Match against known projects, JSON output
  ingest analyze --projects projects.json --json A-101.pdf > A-101.json

  # Title block of the first page only
  ingest analyze --first-page-only set.pdf

  # Site photo
  ingest analyze photo.jpg

  # Page count only (no API key needed)
  ingest pages set.pdf

PROJECTS FILE:
  [{"id": "p-17", "name": "Riverside Bridge", "address": "12 Quay Street, Portland"}]

ENVIRONMENT VARIABLES:
  OPENAI_API_KEY          OpenAI API key
  ANTHROPIC_API_KEY       Anthropic API key
  GEMINI_API_KEY          Google Gemini API key
  EDGEQUAKE_LLM_PROVIDER  Override provider (openai, anthropic, gemini, ollama)
  EDGEQUAKE_MODEL         Override model ID
  PDFIUM_LIB_PATH         Directory containing libpdfium
"#;

#[derive(Parser, Debug)]
#[command(
    name = "ingest",
    version,
    about = "Extract title-block data from construction documents using Vision LLMs",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Debug-level logs.
    #[arg(short, long, global = true, env = "INGEST_VERBOSE")]
    verbose: bool,

    /// Errors only.
    #[arg(short, long, global = true, env = "INGEST_QUIET")]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a PDF or image through the full ingestion job.
    Analyze(AnalyzeArgs),
    /// Print the number of pages in a PDF.
    Pages {
        input: PathBuf,
    },
}

#[derive(Args, Debug)]
struct AnalyzeArgs {
    input: PathBuf,

    /// MIME type; guessed from the extension when omitted.
    #[arg(long)]
    mime: Option<String>,

    /// JSON array of known projects to match against.
    #[arg(long)]
    projects: Option<PathBuf>,

    #[arg(long, env = "EDGEQUAKE_MODEL")]
    model: Option<String>,

    #[arg(long, env = "EDGEQUAKE_LLM_PROVIDER")]
    provider: Option<String>,

    #[arg(long, env = "INGEST_MAX_PAGES", default_value_t = 50)]
    max_pages: usize,

    #[arg(short, long, env = "INGEST_CONCURRENCY", default_value_t = 3)]
    concurrency: usize,

    #[arg(long, env = "INGEST_API_TIMEOUT_SECS", default_value_t = 30)]
    api_timeout: u64,

    #[arg(long)]
    first_page_only: bool,

    /// Print the whole job record as JSON.
    #[arg(long)]
    json: bool,

    #[arg(long)]
    no_progress: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "error"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    match cli.command {
        Command::Pages { input } => pages(&input).await,
        Command::Analyze(args) => analyze(args, cli.quiet).await,
    }
}

async fn pages(input: &Path) -> Result<()> {
    let bytes = tokio::fs::read(input)
        .await
        .with_context(|| format!("reading {}", input.display()))?;
    let chain = RenderChain::from_config(&IngestConfig::default());
    let count = chain.page_count(&bytes).await;
    if count == 0 {
        bail!("could not determine the page count of {}", input.display());
    }
    println!("{count}");
    Ok(())
}

async fn analyze(args: AnalyzeArgs, quiet: bool) -> Result<()> {
    let input = args
        .input
        .canonicalize()
        .with_context(|| format!("cannot open {}", args.input.display()))?;
    let dir = input
        .parent()
        .context("input has no parent directory")?
        .to_path_buf();
    let file_name = input
        .file_name()
        .context("input has no file name")?
        .to_string_lossy()
        .into_owned();
    let mime = match args.mime {
        Some(m) => m,
        None => guess_mime(&input).with_context(|| {
            format!("cannot guess the type of {}; pass --mime", input.display())
        })?,
    };

    let projects = match &args.projects {
        Some(path) => load_projects(path).await?,
        None => Vec::new(),
    };

    let mut builder = IngestConfig::builder()
        .max_pages(args.max_pages)
        .concurrency(args.concurrency)
        .api_timeout(Duration::from_secs(args.api_timeout))
        .multi_page(!args.first_page_only)
        .max_concurrent_jobs(1);
    if let Some(m) = args.model {
        builder = builder.model(m);
    }
    if let Some(p) = args.provider {
        builder = builder.provider_name(p);
    }
    let config = builder.build().context("invalid configuration")?;

    let service = IngestService::from_config(
        config,
        Arc::new(FsDocumentStore::new(dir)),
        Arc::new(StaticProjectCatalog::new(projects)),
        NotificationDispatcher::default().with_notifier(Arc::new(LogNotifier)),
    )
    .context("could not set up the vision model")?;

    let id = service
        .submit(SubmitRequest {
            file_name: file_name.clone(),
            mime_type: mime,
            storage_path: file_name,
            ..Default::default()
        })
        .await?;

    let show_progress = !quiet && !args.no_progress && !args.json;
    let job = watch(&service, id, show_progress).await?;
    service.shutdown().await;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&job)?);
    } else {
        print_job(&job);
    }

    if job.status == JobStatus::Failed {
        bail!(job.error.unwrap_or_else(|| "analysis failed".into()));
    }
    Ok(())
}

/// Poll the job until it settles, mirroring its page progress on a bar.
async fn watch(service: &IngestService, id: uuid::Uuid, show_progress: bool) -> Result<ExtractionJob> {
    let bar = if show_progress {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template(
                "{spinner:.cyan} {prefix:.bold}  [{bar:42.green/238}] {pos:>3}/{len} pages  ⏱ {elapsed_precise}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▉▊▋▌▍▎▏  "),
        );
        bar.set_prefix("Analysing");
        bar.enable_steady_tick(Duration::from_millis(80));
        Some(bar)
    } else {
        None
    };

    loop {
        let job = service.job(id).await?;
        if let Some(bar) = &bar {
            if job.total_pages > 0 {
                bar.set_length(job.total_pages as u64);
                bar.set_position(job.processed_pages as u64);
            }
        }
        if job.status.is_terminal() {
            if let Some(bar) = bar {
                bar.finish_and_clear();
            }
            return Ok(job);
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
}

fn print_job(job: &ExtractionJob) {
    match job.status {
        JobStatus::Completed => eprintln!("{} {}", green("✔"), bold(&job.file_name)),
        _ => {
            eprintln!("{} {}", red("✘"), bold(&job.file_name));
            return;
        }
    }
    let Some(result) = &job.result else {
        return;
    };

    println!("Pages: {} ({} analysed)", result.page_count, result.pages.len());
    if let Some(summary) = &result.summary {
        if let Some(m) = &summary.project_match {
            println!(
                "Project: {} {}",
                m.project_name.as_deref().unwrap_or("?"),
                dim(&format!("({:.0}% confidence)", m.confidence * 100.0))
            );
        }
        if !summary.unique_drawings.is_empty() {
            println!("Drawings: {}", summary.unique_drawings.join(", "));
        }
        if !summary.disciplines.is_empty() {
            println!("Disciplines: {}", summary.disciplines.join(", "));
        }
    }
    for page in &result.pages {
        let d = &page.data;
        match &d.error {
            Some(e) => println!("  {} p{:<3} {}", red("✗"), page.page_number, red(e)),
            None => println!(
                "  {} p{:<3} {:<12} {}",
                green("✓"),
                page.page_number,
                d.drawing_number().unwrap_or("-"),
                dim(d.sheet_title().unwrap_or(""))
            ),
        }
    }
}

async fn load_projects(path: &Path) -> Result<Vec<KnownProject>> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

fn guess_mime(path: &Path) -> Option<String> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    let mime = match ext.as_str() {
        "pdf" => "application/pdf",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        _ => return None,
    };
    Some(mime.to_string())
}
