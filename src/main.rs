use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use std::path::PathBuf;
use std::process::ExitCode;
use testloom::artifacts::ArtifactLayout;
use testloom::backend;
use testloom::collect::ResultCollector;
use testloom::config::{BackendConfig, Config};
use testloom::orchestrator::{new_run_id, LoopStatus, RepairLoop};
use testloom::suite::{generate_from_story, StoryHints, TestSuite};
use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "TESTLOOM_LOG";

#[derive(Parser, Debug)]
#[command(
    name = "testloom",
    about = "Generate tests from a suite or user story, run them, and repair them until they pass",
    version
)]
struct Cli {
    /// Config file (defaults to ~/.config/testloom/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate, execute and repair a test file
    Run(RunArgs),
    /// Print the summary of the current artifacts directory
    Summarize(RunIdArgs),
    /// Zip the current artifacts directory
    Bundle(RunIdArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Structured suite (JSON)
    #[arg(long, conflicts_with_all = ["story", "story_file"])]
    suite: Option<PathBuf>,
    /// User story text
    #[arg(long, conflicts_with = "story_file")]
    story: Option<String>,
    /// File holding the user story
    #[arg(long)]
    story_file: Option<PathBuf>,
    /// Target address hint for story generation
    #[arg(long)]
    target: Option<String>,
    /// Suite id hint for story generation
    #[arg(long)]
    suite_id: Option<String>,
    /// Suite name hint for story generation
    #[arg(long)]
    suite_name: Option<String>,
    /// Fixture hint for story generation (e.g. "client: http")
    #[arg(long)]
    fixtures_hint: Option<String>,
    /// Test file to write, relative to the workspace root
    #[arg(long)]
    entry_point: Option<PathBuf>,
    /// File replacing the built-in system instruction for generation
    #[arg(long)]
    system_guide: Option<PathBuf>,
    /// Replay these fixture files instead of the configured backend
    #[arg(long = "fixture")]
    fixtures: Vec<PathBuf>,
    #[arg(long)]
    max_attempts: Option<u32>,
    /// Only generate the test file; do not execute it
    #[arg(long)]
    dry_run: bool,
}

#[derive(Args, Debug)]
struct RunIdArgs {
    #[arg(long)]
    run_id: Option<String>,
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();
    match dispatch(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {:#}", err);
            ExitCode::from(2)
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn dispatch(cli: Cli) -> Result<ExitCode> {
    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default(),
    };
    match cli.command {
        Commands::Run(args) => run(config, args),
        Commands::Summarize(args) => summarize(&config, args),
        Commands::Bundle(args) => bundle(&config, args),
    }
}

fn apply_overrides(config: &mut Config, args: &RunArgs) {
    if !args.fixtures.is_empty() {
        config.backend = BackendConfig::Replay {
            fixtures: args.fixtures.clone(),
        };
    }
    if let Some(max) = args.max_attempts {
        config.repair.max_attempts = max;
    }
    if let Some(entry) = &args.entry_point {
        config.workspace.entry_point = Some(entry.clone());
    }
    if let Some(guide) = &args.system_guide {
        config.repair.system_guide = Some(guide.clone());
    }
}

fn run(mut config: Config, args: RunArgs) -> Result<ExitCode> {
    apply_overrides(&mut config, &args);
    config.validate()?;

    let backend = backend::from_config(&config.backend)?;
    let suite = load_suite(&*backend, &config, &args)?;

    let repair_loop = RepairLoop::from_config(backend, &config)?;
    if args.dry_run {
        let path = repair_loop.generate_only(&suite)?;
        print_json(&json!({ "status": "GENERATED", "artifact_path": path }))?;
        return Ok(ExitCode::SUCCESS);
    }

    let outcome = repair_loop.run(&suite);
    print_json(&outcome)?;
    Ok(match outcome.status {
        LoopStatus::Succeeded => ExitCode::SUCCESS,
        LoopStatus::Exhausted => ExitCode::from(1),
        LoopStatus::Error { .. } => ExitCode::from(2),
    })
}

fn load_suite(
    backend: &dyn backend::GenerationBackend,
    config: &Config,
    args: &RunArgs,
) -> Result<TestSuite> {
    if let Some(path) = &args.suite {
        return TestSuite::load(path).with_context(|| format!("loading suite {}", path.display()));
    }

    let story = match (&args.story, &args.story_file) {
        (Some(story), _) => story.clone(),
        (None, Some(path)) => std::fs::read_to_string(path)
            .with_context(|| format!("reading story {}", path.display()))?,
        (None, None) => return Err(anyhow!("one of --suite, --story or --story-file is required")),
    };
    generate_from_story(backend, &story, &story_hints(config, args))
        .context("generating suite from story")
}

fn story_hints(config: &Config, args: &RunArgs) -> StoryHints {
    StoryHints {
        suite_id: args.suite_id.clone(),
        suite_name: args.suite_name.clone(),
        target: args.target.clone(),
        entry_point: config
            .workspace
            .entry_point
            .as_ref()
            .map(|p| p.to_string_lossy().to_string()),
        fixtures_hint: args.fixtures_hint.clone(),
    }
}

fn collector(config: &Config) -> ResultCollector {
    ResultCollector::new(ArtifactLayout::new(config.workspace.artifacts_root()))
}

fn summarize(config: &Config, args: RunIdArgs) -> Result<ExitCode> {
    let collector = collector(config);
    let summary = match (collector.read_summary(), args.run_id) {
        (Some(summary), None) => summary,
        (Some(summary), Some(id)) if summary.run_id == id => summary,
        (_, run_id) => collector.summarize(&run_id.unwrap_or_else(new_run_id), 0.0, -1),
    };
    print_json(&summary)?;
    Ok(ExitCode::SUCCESS)
}

fn bundle(config: &Config, args: RunIdArgs) -> Result<ExitCode> {
    let collector = collector(config);
    let run_id = args
        .run_id
        .or_else(|| collector.read_summary().map(|s| s.run_id))
        .unwrap_or_else(new_run_id);
    let path = collector.bundle(&run_id)?;
    print_json(&json!({ "run_id": run_id, "bundle_path": path }))?;
    Ok(ExitCode::SUCCESS)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
