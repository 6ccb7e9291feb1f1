use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use miette::{Context, IntoDiagnostic, Result};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use prlens_core::{AnalysisResult, CacheKey, OutputFormat, PrLensConfig};
use prlens_jobs::{AnalysisRequest, BatchOutcome, BatchReport, HealthState, JobOutcome, ReviewService};

const CONFIG_FILE: &str = ".prlens.toml";
const POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Parser)]
#[command(
    name = "prlens",
    version,
    about = "Pull request review with an LLM and a heuristic fallback",
    long_about = "prlens fetches a GitHub pull request, asks a language model to review it,\n\
                   and caches the result per head commit. When no model answers, a\n\
                   deterministic rule set reviews the added lines instead.\n\n\
                   Examples:\n  \
                     prlens analyze --repo-url https://github.com/o/r --pr 12\n  \
                     prlens analyze --repo-url https://github.com/o/r --pr 12 --force\n  \
                     prlens batch --file prs.json --format json\n  \
                     prlens doctor                   Check cache and model backends\n  \
                     prlens init                     Create a default .prlens.toml"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to configuration file (default: .prlens.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output format
    #[arg(
        long,
        global = true,
        default_value = "text",
        long_help = "Output format for command results.\n\n\
                       Formats:\n  \
                         text      Human-readable summaries (default)\n  \
                         json      Machine-readable JSON\n  \
                         markdown  GitHub-flavored Markdown"
    )]
    format: OutputFormat,

    /// Enable verbose output
    #[arg(long, short, global = true)]
    verbose: bool,

    /// When to use colors
    #[arg(long, global = true, default_value = "auto")]
    color: ColorChoice,
}

#[derive(Subcommand)]
enum Command {
    /// Review one pull request
    #[command(long_about = "Review one pull request.\n\n\
        Submits a job, shows its stage while it runs, and prints the result.\n\
        A cached result for the same head commit is returned unless --force is given.\n\n\
        Examples:\n  prlens analyze --repo-url https://github.com/o/r --pr 12\n  \
        GITHUB_TOKEN=... prlens analyze --repo-url https://github.com/o/private --pr 3")]
    Analyze {
        /// Repository URL, e.g. https://github.com/owner/repo
        #[arg(long)]
        repo_url: String,

        /// Pull request number
        #[arg(long)]
        pr: u64,

        /// GitHub token for this request
        #[arg(long, env = "GITHUB_TOKEN", hide_env_values = true)]
        token: Option<String>,

        /// Recompute even when a cached result exists
        #[arg(long)]
        force: bool,
    },
    /// Review several pull requests concurrently
    #[command(long_about = "Review several pull requests concurrently.\n\n\
        Reads a JSON array of {\"repo_url\": ..., \"pr_number\": ...} objects.\n\
        Each entry may also carry \"token\" and \"force\". Entries fail individually.\n\n\
        Examples:\n  prlens batch --file prs.json\n  cat prs.json | prlens batch --format json")]
    Batch {
        /// Read requests from file instead of stdin
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// Print the cache key for a pull request at a commit
    CacheKey {
        /// Repository URL
        #[arg(long)]
        repo_url: String,

        /// Pull request number
        #[arg(long)]
        pr: u64,

        /// Head commit id (omit for the no-sha key)
        #[arg(long)]
        sha: Option<String>,
    },
    /// Check cache and model backends
    Doctor,
    /// Create default configuration
    Init,
    /// Generate shell completions
    Completions {
        /// Target shell
        shell: clap_complete::Shell,
    },
}

#[derive(Clone, PartialEq, Eq, ValueEnum)]
enum ColorChoice {
    /// Auto-detect based on terminal
    Auto,
    /// Always use colors
    Always,
    /// Never use colors
    Never,
}

fn print_welcome() {
    let version = env!("CARGO_PKG_VERSION");
    println!("prlens v{version}: pull request review with an LLM and a heuristic fallback\n");
    println!("Commands:");
    println!("  analyze      Review one pull request");
    println!("  batch        Review several pull requests concurrently");
    println!("  cache-key    Print the cache key for a pull request");
    println!("  doctor       Check cache and model backends");
    println!("  init         Create default configuration\n");
    println!("Run 'prlens <command> --help' for details.");
}

fn load_config(path: Option<&Path>) -> Result<PrLensConfig> {
    let mut config = match path {
        Some(path) => PrLensConfig::from_file(path)
            .wrap_err(format!("loading {}", path.display()))?,
        None => {
            let default_path = Path::new(CONFIG_FILE);
            if default_path.exists() {
                PrLensConfig::from_file(default_path).wrap_err("loading .prlens.toml")?
            } else {
                PrLensConfig::default()
            }
        }
    };
    config.apply_env()?;
    Ok(config)
}

fn init_tracing(config: &PrLensConfig, verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = if verbose { "debug" } else { config.log_level.as_str() };
        EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"))
    });
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn read_batch_input(file: Option<&Path>) -> Result<Vec<AnalysisRequest>> {
    let input = match file {
        Some(path) => std::fs::read_to_string(path)
            .into_diagnostic()
            .wrap_err(format!("reading {}", path.display()))?,
        None => std::io::read_to_string(std::io::stdin())
            .into_diagnostic()
            .wrap_err("reading stdin")?,
    };
    serde_json::from_str(&input)
        .into_diagnostic()
        .wrap_err("expected a JSON array of {\"repo_url\", \"pr_number\"} objects")
}

fn print_result(result: &AnalysisResult, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(result).into_diagnostic()?);
        }
        OutputFormat::Markdown => print!("{}", result.to_markdown()),
        OutputFormat::Text => print!("{result}"),
    }
    if result.is_degraded() {
        eprintln!("note: result was produced by a fallback path");
    }
    Ok(())
}

fn print_batch(report: &BatchReport, format: OutputFormat) -> Result<()> {
    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(report).into_diagnostic()?);
        return Ok(());
    }
    for item in &report.results {
        match &item.outcome {
            BatchOutcome::Success { result } => match format {
                OutputFormat::Markdown => println!("{}", result.to_markdown()),
                _ => println!("{result}"),
            },
            BatchOutcome::Error { error } => {
                println!("{} #{}: error: {error}\n", item.repo_url, item.pr_number);
            }
        }
    }
    println!(
        "{}: {} PRs, {} failed",
        report.batch_id,
        report.total_prs,
        report.error_count()
    );
    Ok(())
}

fn spinner(message: String) -> Option<indicatif::ProgressBar> {
    if !std::io::stderr().is_terminal() {
        return None;
    }
    let pb = indicatif::ProgressBar::new_spinner();
    if let Ok(style) = indicatif::ProgressStyle::with_template("{spinner:.cyan} {msg} ({elapsed})") {
        pb.set_style(style);
    }
    pb.set_message(message);
    pb.enable_steady_tick(Duration::from_millis(120));
    Some(pb)
}

async fn run_analyze(
    service: &ReviewService,
    request: AnalysisRequest,
    format: OutputFormat,
) -> Result<()> {
    let label = format!("{} #{}", request.repo_url.trim(), request.pr_number);
    let id = service.submit(request).await?;
    let pb = spinner(format!("{label}: PENDING"));

    let outcome = loop {
        let status = service.queue().status(id).await;
        if let Some(pb) = &pb {
            pb.set_message(format!("{label}: {status}"));
        }
        match service.queue().result(id).await {
            JobOutcome::NotReady => tokio::time::sleep(POLL_INTERVAL).await,
            outcome => break outcome,
        }
    };

    match outcome {
        JobOutcome::Ready(result) => {
            if let Some(pb) = pb {
                pb.finish_with_message(format!("{label}: done"));
            }
            print_result(&result, format)
        }
        JobOutcome::Failed(error) => {
            if let Some(pb) = pb {
                pb.finish_with_message(format!("{label}: failed"));
            }
            miette::bail!(error)
        }
        JobOutcome::Unknown | JobOutcome::NotReady => {
            if let Some(pb) = pb {
                pb.finish_and_clear();
            }
            miette::bail!("job {} is no longer tracked", id)
        }
    }
}

#[derive(serde::Serialize)]
struct CheckResult {
    name: String,
    status: &'static str,
    detail: String,
}

impl CheckResult {
    fn from_dependency(name: &str, detail: &str) -> Self {
        let status = if detail.starts_with("error") || detail == "not configured" {
            "fail"
        } else if detail.starts_with("ok") || detail == "configured" {
            "pass"
        } else {
            "info"
        };
        Self {
            name: name.to_string(),
            status,
            detail: detail.to_string(),
        }
    }

    fn symbol(&self, use_color: bool) -> &'static str {
        match (self.status, use_color) {
            ("pass", true) => "\x1b[32m\u{2713}\x1b[0m",
            ("fail", true) => "\x1b[31m\u{2717}\x1b[0m",
            (_, true) => "\x1b[33m~\x1b[0m",
            ("pass", false) => "\u{2713}",
            ("fail", false) => "\u{2717}",
            _ => "~",
        }
    }
}

async fn run_doctor(service: &ReviewService, format: OutputFormat, use_color: bool) -> Result<()> {
    let report = service.health().await;
    let checks: Vec<CheckResult> = report
        .dependencies
        .iter()
        .map(|(name, detail)| CheckResult::from_dependency(name, detail))
        .collect();

    match format {
        OutputFormat::Json => {
            let json = serde_json::json!({
                "version": env!("CARGO_PKG_VERSION"),
                "status": report.status,
                "checks": checks,
            });
            println!("{}", serde_json::to_string_pretty(&json).into_diagnostic()?);
        }
        _ => {
            println!("prlens v{}: environment check\n", env!("CARGO_PKG_VERSION"));
            for check in &checks {
                println!("  {} {:<12} {}", check.symbol(use_color), check.name, check.detail);
            }
            let state = match report.status {
                HealthState::Ok => "ok",
                HealthState::Degraded => "degraded",
            };
            println!("\nstatus: {state}");
        }
    }
    Ok(())
}

const DEFAULT_CONFIG: &str = r#"# prlens configuration
# Environment variables override these values:
#   PRLENS_MODEL_PROVIDER, OPENAI_API_KEY, PRLENS_OLLAMA_MODEL, PRLENS_OLLAMA_URL,
#   GITHUB_TOKEN, PRLENS_CACHE_TTL_SECONDS, PRLENS_LOG_LEVEL

# log_level = "info"

[llm]
# "ollama" for local inference, "openai" for the remote provider
provider = "ollama"
# timeout_secs = 120

[llm.ollama]
# base_url = "http://localhost:11434"
# model = "llama3"

[llm.openai]
# api_key = "sk-..."
# base_url = "https://api.openai.com"
# model = "gpt-4o-mini"
# temperature = 0.2

[github]
# token = "ghp_..."
# api_base = "https://api.github.com"
# timeout_secs = 30

[cache]
# "memory" or "sqlite"
backend = "memory"
# path = ".prlens/cache.db"
# ttl_seconds = 3600
# namespace = "prreview"

[jobs]
# worker_threads = 4
# max_concurrent_jobs = 4
# batch_limit = 10
# result_retention_secs = 86400
"#;

#[tokio::main]
async fn main() -> Result<()> {
    miette::set_hook(Box::new(|_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .terminal_links(true)
                .build(),
        )
    }))
    .expect("miette handler");
    human_panic::setup_panic!();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    init_tracing(&config, cli.verbose);

    let use_color = match cli.color {
        ColorChoice::Always => true,
        ColorChoice::Never => false,
        ColorChoice::Auto => std::io::stdout().is_terminal() && std::env::var("NO_COLOR").is_err(),
    };

    tracing::debug!(
        provider = %config.llm.provider,
        cache = ?config.cache.backend,
        format = %cli.format,
        "configuration loaded"
    );

    match cli.command {
        None => print_welcome(),
        Some(Command::Analyze {
            repo_url,
            pr,
            token,
            force,
        }) => {
            let service = ReviewService::from_config(&config)?;
            let mut request = AnalysisRequest::new(repo_url, pr);
            request.token = token;
            request.force = force;
            run_analyze(&service, request, cli.format).await?;
        }
        Some(Command::Batch { ref file }) => {
            let requests = read_batch_input(file.as_deref())?;
            if requests.is_empty() {
                miette::bail!(miette::miette!(
                    help = "Pass a JSON array such as [{\"repo_url\": \"https://github.com/o/r\", \"pr_number\": 1}]",
                    "Empty batch"
                ));
            }
            let service = ReviewService::from_config(&config)?;
            let pb = spinner(format!("Reviewing {} PRs...", requests.len()));
            let report = service.submit_batch(requests).await.inspect_err(|_e| {
                if let Some(pb) = &pb {
                    pb.finish_with_message("Failed");
                }
            })?;
            if let Some(pb) = pb {
                pb.finish_with_message("Done");
            }
            print_batch(&report, cli.format)?;
        }
        Some(Command::CacheKey {
            ref repo_url,
            pr,
            ref sha,
        }) => {
            let key = CacheKey::new(&config.cache.namespace, repo_url.trim(), pr, sha.as_deref());
            match cli.format {
                OutputFormat::Json => println!("{}", serde_json::json!({ "key": key.as_str() })),
                _ => println!("{key}"),
            }
        }
        Some(Command::Doctor) => {
            let service = ReviewService::from_config(&config)?;
            run_doctor(&service, cli.format, use_color).await?;
        }
        Some(Command::Init) => {
            let path = Path::new(CONFIG_FILE);
            if path.exists() {
                miette::bail!(".prlens.toml already exists");
            }
            std::fs::write(path, DEFAULT_CONFIG).into_diagnostic()?;
            println!("Created .prlens.toml with default configuration");
        }
        Some(Command::Completions { shell }) => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "prlens", &mut std::io::stdout());
        }
    }

    Ok(())
}
