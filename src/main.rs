use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use miette::{IntoDiagnostic, Result};
use tracing_subscriber::EnvFilter;

use courserag_core::{CourseRagConfig, OutputFormat, SearchResult, API_KEY_ENV};
use courserag_retrieval::context::{citations, Citation};
use courserag_retrieval::embedding::{BatchPolicy, EmbeddingClient};
use courserag_retrieval::index::LoadedIndex;
use courserag_retrieval::pipeline::{self, ChunkReport, EmbedReport, IndexReport};
use courserag_retrieval::retriever::Retriever;

const CONFIG_FILE: &str = ".courserag.toml";

#[derive(Parser)]
#[command(
    name = "courserag",
    version,
    about = "Retrieval core for a course question-answering assistant",
    long_about = "courserag turns course pages and forum threads into a searchable vector index.\n\n\
                   Build stages run in order and each writes a JSON artifact under data/:\n\
                   chunk -> embed -> index. 'build' runs all three.\n\n\
                   Examples:\n  \
                     courserag build                        Chunk, embed and index the corpus\n  \
                     courserag search 'what is a p-value'   Retrieve the nearest chunks\n  \
                     courserag search 'docker' --k 3 --format json\n  \
                     courserag doctor                       Check setup and artifacts"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to configuration file (default: .courserag.toml)
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
                         json      Machine-readable JSON with camelCase keys\n  \
                         markdown  Markdown (search results)"
    )]
    format: OutputFormat,

    /// Enable debug logging
    #[arg(long, short, global = true)]
    verbose: bool,

    /// When to use colors
    #[arg(long, global = true, default_value = "auto")]
    color: ColorChoice,
}

#[derive(Subcommand)]
enum Command {
    /// Split course pages and forum threads into chunks
    #[command(long_about = "Split course pages and forum threads into chunks.\n\n\
        Reads the course and discourse files from [paths] and writes the chunk\n\
        artifact. Missing input files are skipped with a warning.")]
    Chunk,
    /// Embed the chunk artifact
    #[command(long_about = "Embed the chunk artifact.\n\n\
        Sends chunks to the embedding service in batches, retrying transient\n\
        failures. Failed batches are skipped and reported. Requires AIPIPE_TOKEN\n\
        or [embedding].api_key.")]
    Embed,
    /// Build the vector index from the embedding artifact
    Index,
    /// Run chunk, embed and index in sequence
    Build,
    /// Retrieve the chunks nearest to a question
    Search {
        /// Question text
        query: String,

        /// Number of results (default: [retrieval].top_k)
        #[arg(long, short)]
        k: Option<usize>,
    },
    /// Create a default .courserag.toml
    #[command(long_about = "Create a default .courserag.toml in the current directory.\n\n\
        Generates a commented template with all available options.\n\
        Fails if .courserag.toml already exists.")]
    Init,
    /// Check configuration, credentials, inputs and index artifacts
    Doctor,
    /// Generate shell completion scripts
    #[command(hide = true)]
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
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

fn print_welcome(use_color: bool) {
    let version = env!("CARGO_PKG_VERSION");

    if use_color {
        println!("\x1b[1mcourserag\x1b[0m v{version} - course retrieval core\n");
        println!("Quick start:");
        println!("  \x1b[36mcourserag init\x1b[0m               Create a .courserag.toml config file");
        println!("  \x1b[36mcourserag build\x1b[0m              Chunk, embed and index the corpus");
        println!("  \x1b[36mcourserag search 'question'\x1b[0m  Retrieve relevant chunks\n");
    } else {
        println!("courserag v{version} - course retrieval core\n");
        println!("Quick start:");
        println!("  courserag init               Create a .courserag.toml config file");
        println!("  courserag build              Chunk, embed and index the corpus");
        println!("  courserag search 'question'  Retrieve relevant chunks\n");
    }

    println!("All commands:");
    println!("  chunk     Split inputs into chunks");
    println!("  embed     Embed chunks with the embedding service");
    println!("  index     Build the vector index");
    println!("  build     Run chunk, embed and index");
    println!("  search    Retrieve chunks for a question");
    println!("  doctor    Check your setup and artifacts");
    println!("  init      Create default configuration\n");
    println!("Run 'courserag <command> --help' for details.");
}

fn init_logging(verbose: bool, use_color: bool) {
    let level = if verbose { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "warn,courserag={level},courserag_core={level},courserag_retrieval={level}"
        ))
    });

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_ansi(use_color)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: Option<&Path>) -> Result<CourseRagConfig> {
    let config = match path {
        Some(path) => CourseRagConfig::from_file(path)?,
        None => {
            let default_path = Path::new(CONFIG_FILE);
            if default_path.exists() {
                CourseRagConfig::from_file(default_path)?
            } else {
                CourseRagConfig::default()
            }
        }
    };
    Ok(config)
}

fn require_api_key(config: &CourseRagConfig) -> Result<()> {
    if config.embedding.resolve_api_key().is_err() {
        miette::bail!(miette::miette!(
            help = format!("Set {API_KEY_ENV} or add api_key in your .courserag.toml under [embedding]"),
            "No API key configured for the embedding service"
        ));
    }
    Ok(())
}

fn embedding_client(config: &CourseRagConfig, timeout: Duration) -> Result<EmbeddingClient> {
    require_api_key(config)?;
    Ok(EmbeddingClient::with_config(&config.embedding, timeout)?)
}

fn batch_progress() -> Option<ProgressBar> {
    if !std::io::stderr().is_terminal() {
        return None;
    }
    let pb = ProgressBar::new(0);
    let style = ProgressStyle::with_template("{spinner:.cyan} embedding [{bar:30}] {pos}/{len} batches ({elapsed})")
        .unwrap_or_else(|_| ProgressStyle::default_bar());
    pb.set_style(style);
    pb.enable_steady_tick(Duration::from_millis(120));
    Some(pb)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).into_diagnostic()?);
    Ok(())
}

fn print_chunk_report(report: &ChunkReport, format: OutputFormat) -> Result<()> {
    if format == OutputFormat::Json {
        return print_json(report);
    }
    println!(
        "Created {} chunks ({} from course pages, {} from forum threads)",
        report.chunks, report.course_chunks, report.discourse_chunks
    );
    if report.skipped_records > 0 {
        println!("Skipped {} malformed or duplicate records", report.skipped_records);
    }
    for path in &report.missing_inputs {
        println!("Input not found: {path}");
    }
    Ok(())
}

fn print_embed_report(report: &EmbedReport, format: OutputFormat) -> Result<()> {
    if format == OutputFormat::Json {
        return print_json(report);
    }
    println!(
        "Embedded {} of {} chunks in {} batches ({} retries)",
        report.embedded, report.chunks, report.batches, report.retries
    );
    if report.failed_batches > 0 {
        println!("Skipped {} failed batches", report.failed_batches);
    }
    if report.embedded == 0 {
        println!("No chunks were embedded; the embedding artifact was not written.");
    }
    Ok(())
}

fn print_index_report(report: &IndexReport, format: OutputFormat) -> Result<()> {
    if format == OutputFormat::Json {
        return print_json(report);
    }
    println!(
        "Indexed {} vectors of dimension {}",
        report.vectors, report.dimension
    );
    Ok(())
}

fn snippet(text: &str, max_chars: usize) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max_chars {
        flat
    } else {
        let cut: String = flat.chars().take(max_chars).collect();
        format!("{cut}...")
    }
}

fn print_search_results(
    query: &str,
    results: &[SearchResult],
    sources: &[Citation],
    format: OutputFormat,
) -> Result<()> {
    match format {
        OutputFormat::Json => {
            let json = serde_json::json!({
                "query": query,
                "results": results,
                "citations": sources,
            });
            print_json(&json)?;
        }
        OutputFormat::Markdown => {
            if results.is_empty() {
                println!("No relevant content found.");
                return Ok(());
            }
            println!("# Results for \"{query}\"\n");
            for (i, r) in results.iter().enumerate() {
                println!(
                    "## {}. {} (distance {:.4})\n",
                    i + 1,
                    r.metadata.source_title,
                    r.distance
                );
                if let Some(url) = &r.metadata.source_url {
                    println!("<{url}>\n");
                }
                println!("{}\n", r.content);
            }
            println!("## Sources\n");
            for c in sources {
                println!("- [{}]({})", snippet(&c.text, 80), c.url);
            }
        }
        OutputFormat::Text => {
            if results.is_empty() {
                println!("No relevant content found.");
                return Ok(());
            }
            for (i, r) in results.iter().enumerate() {
                println!(
                    "{}. [{:.4}] {} ({})",
                    i + 1,
                    r.distance,
                    r.metadata.source_title,
                    r.metadata.chunk_id
                );
                if let Some(url) = &r.metadata.source_url {
                    println!("   {url}");
                }
                println!("   {}\n", snippet(&r.content, 200));
            }
            println!("Sources:");
            for c in sources {
                println!("  {}", c.url);
            }
        }
    }
    Ok(())
}

#[derive(serde::Serialize)]
struct CheckResult {
    name: &'static str,
    status: &'static str,
    detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    hint: Option<String>,
}

impl CheckResult {
    fn pass(name: &'static str, detail: impl Into<String>) -> Self {
        Self {
            name,
            status: "pass",
            detail: detail.into(),
            hint: None,
        }
    }

    fn fail(name: &'static str, detail: impl Into<String>, hint: impl Into<String>) -> Self {
        Self {
            name,
            status: "fail",
            detail: detail.into(),
            hint: Some(hint.into()),
        }
    }

    fn info(name: &'static str, detail: impl Into<String>) -> Self {
        Self {
            name,
            status: "info",
            detail: detail.into(),
            hint: None,
        }
    }

    fn symbol(&self) -> &'static str {
        match self.status {
            "pass" => "\u{2713}",
            "fail" => "\u{2717}",
            _ => "~",
        }
    }

    fn colored_symbol(&self) -> String {
        match self.status {
            "pass" => "\x1b[32m\u{2713}\x1b[0m".into(),
            "fail" => "\x1b[31m\u{2717}\x1b[0m".into(),
            _ => "\x1b[33m~\x1b[0m".into(),
        }
    }
}

fn input_check(name: &'static str, path: &Path) -> CheckResult {
    match pipeline::read_records(path) {
        Ok(Some(records)) => CheckResult::pass(
            name,
            format!("{} records in {}", records.len(), path.display()),
        ),
        Ok(None) => CheckResult::info(name, format!("{} not found (will be skipped)", path.display())),
        Err(e) => CheckResult::fail(
            name,
            format!("{} is unreadable: {e}", path.display()),
            "the file must contain a JSON array",
        ),
    }
}

fn run_doctor(
    config: &CourseRagConfig,
    config_path: Option<&Path>,
    format: OutputFormat,
    use_color: bool,
) -> Result<()> {
    let mut checks: Vec<CheckResult> = Vec::new();

    let source = config_path.unwrap_or(Path::new(CONFIG_FILE));
    if source.exists() {
        checks.push(CheckResult::pass(
            "config_file",
            format!("loaded {}", source.display()),
        ));
    } else {
        checks.push(CheckResult::info(
            "config_file",
            "not found, using defaults (run `courserag init` to create one)",
        ));
    }

    match config.embedding.resolve_api_key() {
        Ok(_) => {
            let origin = if config.embedding.api_key.is_some() {
                "set in config"
            } else {
                "set via env"
            };
            checks.push(CheckResult::pass(
                "embedding_api_key",
                format!("{origin} ({})", config.embedding.model),
            ));
        }
        Err(_) => checks.push(CheckResult::fail(
            "embedding_api_key",
            "not configured",
            format!("export {API_KEY_ENV}=... or set api_key under [embedding]"),
        )),
    }

    checks.push(input_check("course_input", &config.paths.course_file));
    checks.push(input_check("discourse_input", &config.paths.discourse_file));

    match LoadedIndex::load(&config.paths.index_file, &config.paths.mapping_file) {
        Ok(index) => checks.push(CheckResult::pass(
            "vector_index",
            format!(
                "{} vectors, dimension {}, {} side-table entries",
                index.len(),
                index.index().dimension(),
                index.side_table().len()
            ),
        )),
        Err(e) => checks.push(CheckResult::fail(
            "vector_index",
            e.to_string(),
            "run `courserag build`",
        )),
    }

    match format {
        OutputFormat::Json => {
            let version = env!("CARGO_PKG_VERSION");
            let json = serde_json::json!({
                "version": version,
                "checks": checks,
            });
            print_json(&json)?;
        }
        _ => {
            let version = env!("CARGO_PKG_VERSION");
            println!("courserag v{version} - environment check\n");

            for check in &checks {
                let sym = if use_color {
                    check.colored_symbol()
                } else {
                    check.symbol().to_string()
                };
                let label = check.name.replace('_', " ");
                println!("  {sym} {label:<20} {}", check.detail);
                if let Some(hint) = &check.hint {
                    println!("    hint: {hint}");
                }
            }

            let passed = checks.iter().filter(|c| c.status == "pass").count();
            let failed = checks.iter().filter(|c| c.status == "fail").count();
            let info = checks.iter().filter(|c| c.status == "info").count();
            println!("\n{passed} checks passed, {failed} failed, {info} info");
        }
    }

    Ok(())
}

const DEFAULT_CONFIG: &str = r#"# courserag configuration

[chunking]
# chunk_size = 1000
# chunk_overlap = 150

[embedding]
# OpenAI-compatible endpoint; the key falls back to the AIPIPE_TOKEN env var
# base_url = "https://aipipe.org/openai/v1"
# model = "text-embedding-3-small"
# batch_size = 200
# max_attempts = 3
# retry_delay_secs = 5
# timeout_secs = 60
# max_concurrency = 4

[retrieval]
# top_k = 5
# query_timeout_secs = 30

[paths]
# course_file = "data/course_content.json"
# discourse_file = "data/discourse.json"
# chunks_file = "data/chunks.json"
# embeddings_file = "data/embeddings.json"
# index_file = "data/vector_index.bin"
# mapping_file = "data/index_to_chunk_map.json"
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

    let use_color = match cli.color {
        ColorChoice::Always => true,
        ColorChoice::Never => false,
        ColorChoice::Auto => std::io::stdout().is_terminal() && std::env::var("NO_COLOR").is_err(),
    };
    init_logging(cli.verbose, use_color);

    let config = load_config(cli.config.as_deref())?;
    tracing::debug!(format = %cli.format, model = %config.embedding.model, "configuration loaded");

    match cli.command {
        None => {
            print_welcome(use_color);
        }
        Some(Command::Chunk) => {
            let report = pipeline::chunk_stage(&config.chunking, &config.paths)?;
            print_chunk_report(&report, cli.format)?;
        }
        Some(Command::Embed) => {
            let client = embedding_client(&config, Duration::from_secs(config.embedding.timeout_secs))?;
            let policy = BatchPolicy::from(&config.embedding);
            let pb = batch_progress();
            let result = pipeline::embed_stage(&client, &policy, &config.paths, pb.as_ref()).await;
            if let Some(pb) = &pb {
                pb.finish_and_clear();
            }
            print_embed_report(&result?, cli.format)?;
        }
        Some(Command::Index) => {
            let report = pipeline::index_stage(&config.paths)?;
            print_index_report(&report, cli.format)?;
        }
        Some(Command::Build) => {
            let client = embedding_client(&config, Duration::from_secs(config.embedding.timeout_secs))?;
            let pb = batch_progress();
            let result = pipeline::build(&config, &client, pb.as_ref()).await;
            if let Some(pb) = &pb {
                pb.finish_and_clear();
            }
            let report = result?;
            if cli.format == OutputFormat::Json {
                print_json(&report)?;
            } else {
                print_chunk_report(&report.chunk, cli.format)?;
                print_embed_report(&report.embed, cli.format)?;
                print_index_report(&report.index, cli.format)?;
            }
        }
        Some(Command::Search { ref query, k }) => {
            let index = Arc::new(LoadedIndex::load(
                &config.paths.index_file,
                &config.paths.mapping_file,
            )?);
            require_api_key(&config)?;
            let retriever = Retriever::from_config(&config, index)?;
            let k = k.unwrap_or(retriever.default_k());
            let results = retriever.retrieve(query, k).await?;
            let sources = citations(&results);
            print_search_results(query, &results, &sources, cli.format)?;
        }
        Some(Command::Init) => {
            let path = Path::new(CONFIG_FILE);
            if path.exists() {
                miette::bail!("{CONFIG_FILE} already exists");
            }
            std::fs::write(path, DEFAULT_CONFIG).into_diagnostic()?;
            println!("Created {CONFIG_FILE} with default configuration");
        }
        Some(Command::Doctor) => {
            run_doctor(&config, cli.config.as_deref(), cli.format, use_color)?;
        }
        Some(Command::Completions { shell }) => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "courserag", &mut std::io::stdout());
        }
    }

    Ok(())
}
