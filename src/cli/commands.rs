//! CLI command definitions for roleplay-forge.
//!
//! Every stage command reads one prior output from the work directory,
//! writes its own output plus a manifest, and prints its summary as JSON.
//! A stage whose manifest still matches its input and configuration is
//! skipped unless `--force` is given.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use crate::allocate::{attach_labels, QualityAllocator, SplitPlan};
use crate::dispatch::{Dispatcher, OpenAiCompatibleService};
use crate::expand::{TrainingSample, TurnExpander};
use crate::merge::{ledger_keys, ledger_path, ResultMerger};
use crate::pipeline::config::parse_list;
use crate::pipeline::{up_to_date, PipelineConfig, StageManifest, StageSummary};
use crate::request::{Eligibility, InferenceResult, InferenceTask, RequestBuilder};
use crate::store::{
    digest_bytes, digest_sources, ingest_corpus, read_jsonl, read_jsonl_sources, write_jsonl,
    IngestSummary, RecordStore, Stage,
};

const RECORDS_FILE: &str = "records.jsonl";
const SAMPLES_FILE: &str = "samples.jsonl";
const LABELED_FILE: &str = "labeled.jsonl";
const SPLITS_DIR: &str = "splits";

/// Role-play dialogue dataset pipeline.
#[derive(Parser)]
#[command(name = "roleplay-forge")]
#[command(about = "Build role-play training data from annotated book dialogue")]
#[command(version)]
#[command(
    long_about = "roleplay-forge turns novel dialogue into role-play training samples.\n\nStages run in order and each one writes into the work directory:\n  roleplay-forge ingest --corpus-root ./books\n  roleplay-forge build-requests --stage role_thinking\n  roleplay-forge dispatch --stage role_thinking\n  roleplay-forge merge --stage role_thinking\n  roleplay-forge expand\n  roleplay-forge label --results ./work/judgement.results.jsonl\n  roleplay-forge allocate --plan split_plan.yaml"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Convert raw book files into the record store.
    Ingest(IngestArgs),

    /// Build inference tasks for one annotation stage.
    BuildRequests(BuildRequestsArgs),

    /// Submit a stage's tasks to the reasoning service.
    Dispatch(DispatchArgs),

    /// Merge a stage's results into the record store and write its failure ledger.
    Merge(MergeArgs),

    /// Expand conversations into per-turn training samples.
    Expand(ExpandArgs),

    /// Attach judgement labels to training samples.
    Label(LabelArgs),

    /// Allocate labeled samples into training splits.
    Allocate(AllocateArgs),

    /// Write the default split plan as YAML.
    InitPlan(InitPlanArgs),
}

/// Arguments shared by every stage command.
#[derive(Parser, Debug, Clone)]
pub struct StageArgs {
    /// Directory for stage outputs (overrides ROLEFORGE_WORK_DIR).
    #[arg(short = 'w', long)]
    pub work_dir: Option<PathBuf>,

    /// Run the stage even when its manifest is current.
    #[arg(long)]
    pub force: bool,
}

#[derive(Parser, Debug)]
pub struct IngestArgs {
    #[command(flatten)]
    pub stage: StageArgs,

    /// Directory of raw book files (overrides ROLEFORGE_CORPUS_ROOT).
    #[arg(short = 'c', long)]
    pub corpus_root: Option<PathBuf>,
}

#[derive(Parser, Debug)]
pub struct BuildRequestsArgs {
    #[command(flatten)]
    pub stage_args: StageArgs,

    /// Annotation stage (role_thinking, system_thinking, setting_completion).
    #[arg(short, long)]
    pub stage: Stage,

    /// Record store to read (default: <work-dir>/records.jsonl).
    #[arg(short, long)]
    pub input: Option<PathBuf>,

    /// Only rebuild keys listed in the stage's failure ledger.
    #[arg(long)]
    pub retarget: bool,

    /// With --retarget, only keys whose attempt budget is spent.
    #[arg(long, requires = "retarget")]
    pub exhausted_only: bool,

    /// Comma-separated narrator names (overrides ROLEFORGE_NARRATORS).
    #[arg(long)]
    pub narrators: Option<String>,
}

#[derive(Parser, Debug)]
pub struct DispatchArgs {
    #[command(flatten)]
    pub stage_args: StageArgs,

    #[arg(short, long)]
    pub stage: Stage,

    /// Model name (overrides ROLEFORGE_MODEL).
    #[arg(short, long)]
    pub model: Option<String>,

    /// Tasks in flight (overrides ROLEFORGE_CONCURRENCY).
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Service API key.
    #[arg(long, env = "ROLEFORGE_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,
}

#[derive(Parser, Debug)]
pub struct MergeArgs {
    #[command(flatten)]
    pub stage_args: StageArgs,

    #[arg(short, long)]
    pub stage: Stage,

    /// Record store to merge into (default: <work-dir>/records.jsonl).
    #[arg(short, long)]
    pub input: Option<PathBuf>,

    /// Results file or directory of shards (default: <work-dir>/<stage>.results.jsonl).
    #[arg(short, long)]
    pub results: Option<PathBuf>,

    /// Where to write the merged store (default: the input path).
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

#[derive(Parser, Debug)]
pub struct ExpandArgs {
    #[command(flatten)]
    pub stage: StageArgs,

    #[arg(short, long)]
    pub input: Option<PathBuf>,

    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Comma-separated narrator names (overrides ROLEFORGE_NARRATORS).
    #[arg(long)]
    pub narrators: Option<String>,
}

#[derive(Parser, Debug)]
pub struct LabelArgs {
    #[command(flatten)]
    pub stage: StageArgs,

    /// Samples to label (default: <work-dir>/samples.jsonl).
    #[arg(short, long)]
    pub input: Option<PathBuf>,

    /// Judgement results (default: <work-dir>/judgement.results.jsonl).
    #[arg(short, long)]
    pub results: Option<PathBuf>,

    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

#[derive(Parser, Debug)]
pub struct AllocateArgs {
    #[command(flatten)]
    pub stage: StageArgs,

    /// Labeled samples (default: <work-dir>/labeled.jsonl).
    #[arg(short, long)]
    pub input: Option<PathBuf>,

    /// Split plan YAML; the built-in plan is used when absent.
    #[arg(short, long)]
    pub plan: Option<PathBuf>,

    /// Output directory (default: <work-dir>/splits).
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Seed override for the plan.
    #[arg(long)]
    pub seed: Option<u64>,
}

#[derive(Parser, Debug)]
pub struct InitPlanArgs {
    /// Where to write the plan.
    #[arg(short, long, default_value = "split_plan.yaml")]
    pub output: PathBuf,
}

pub fn parse_cli() -> Cli {
    Cli::parse()
}

pub async fn run() -> anyhow::Result<()> {
    let cli = parse_cli();
    run_with_cli(cli).await
}

pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Ingest(args) => run_ingest_command(args).await?,
        Commands::BuildRequests(args) => run_build_requests_command(args).await?,
        Commands::Dispatch(args) => run_dispatch_command(args).await?,
        Commands::Merge(args) => run_merge_command(args).await?,
        Commands::Expand(args) => run_expand_command(args).await?,
        Commands::Label(args) => run_label_command(args).await?,
        Commands::Allocate(args) => run_allocate_command(args).await?,
        Commands::InitPlan(args) => run_init_plan_command(args).await?,
    }
    Ok(())
}

/// Environment configuration with the shared flags applied.
fn load_config(args: &StageArgs) -> anyhow::Result<PipelineConfig> {
    let mut config = PipelineConfig::from_env().context("invalid ROLEFORGE_* configuration")?;
    if let Some(ref dir) = args.work_dir {
        config = config.with_work_dir(dir.clone());
    }
    Ok(config)
}

/// Returns true when the stage can be skipped, printing the stored summary.
async fn skip_if_current(
    args: &StageArgs,
    output: &Path,
    input_digest: &str,
    config_digest: &str,
) -> anyhow::Result<bool> {
    if args.force {
        return Ok(false);
    }
    match up_to_date(output, input_digest, config_digest).await? {
        Some(manifest) => {
            info!(
                stage = %manifest.stage,
                output = %output.display(),
                "Output is up to date, skipping (use --force to rerun)"
            );
            print_summary(&manifest.summary)?;
            Ok(true)
        }
        None => Ok(false),
    }
}

async fn finish(
    summary: StageSummary,
    input_digest: String,
    config_digest: String,
    output: &Path,
) -> anyhow::Result<()> {
    summary.log();
    StageManifest::new(summary.clone(), input_digest, config_digest, output)
        .write()
        .await?;
    print_summary(&summary)
}

fn print_summary(summary: &StageSummary) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(summary)?);
    Ok(())
}

/// One digest over several inputs.
fn combine_digests<S: AsRef<str>>(parts: &[S]) -> String {
    let parts: Vec<&str> = parts.iter().map(|p| p.as_ref()).collect();
    digest_bytes(parts.join(":").as_bytes())
}

fn ingest_summary(ingest: &IngestSummary) -> StageSummary {
    let mut summary = StageSummary::new("ingest");
    summary.processed = ingest.books + ingest.failed_files;
    summary.merged = ingest.books;
    summary.failed = ingest.failed_files;
    summary.skipped = ingest.dropped_scenes + ingest.dropped_conversations;
    summary.add("scenes", ingest.scenes);
    summary.add("conversations", ingest.conversations);
    summary.add("turns", ingest.turns);
    summary.add("dropped_scenes", ingest.dropped_scenes);
    summary.add("dropped_conversations", ingest.dropped_conversations);
    summary
}

async fn run_ingest_command(args: IngestArgs) -> anyhow::Result<()> {
    let mut config = load_config(&args.stage)?;
    if let Some(root) = args.corpus_root {
        config = config.with_corpus_root(root);
    }
    let output = config.work_dir.join(RECORDS_FILE);

    // The corpus is a tree of plain JSON files; hash their bytes in order.
    let mut corpus_bytes = Vec::new();
    for path in crate::store::ingest::book_files(&config.corpus_root) {
        corpus_bytes.extend(tokio::fs::read(&path).await?);
        corpus_bytes.extend(path.to_string_lossy().as_bytes());
    }
    let input_digest = digest_bytes(&corpus_bytes);
    let config_digest = config.digest_for("ingest");
    if skip_if_current(&args.stage, &output, &input_digest, &config_digest).await? {
        return Ok(());
    }

    info!(corpus = %config.corpus_root.display(), "Ingesting corpus");
    let (records, ingest) = ingest_corpus(&config.corpus_root).await?;
    let store = RecordStore::from_records(records)?;
    info!(keys = store.len(), "Indexed corpus records");
    store.save(&output).await?;
    finish(ingest_summary(&ingest), input_digest, config_digest, &output).await
}

async fn run_build_requests_command(args: BuildRequestsArgs) -> anyhow::Result<()> {
    let mut config = load_config(&args.stage_args)?;
    if let Some(ref names) = args.narrators {
        config = config.with_narrators(parse_list(names));
    }
    let input = args
        .input
        .clone()
        .unwrap_or_else(|| config.work_dir.join(RECORDS_FILE));
    let output = config.work_dir.join(format!("{}.tasks.jsonl", args.stage));

    let eligibility = if args.retarget {
        let ledger = ledger_path(&config.work_dir, args.stage);
        let keys = ledger_keys(&ledger, args.exhausted_only).await?;
        info!(ledger = %ledger.display(), keys = keys.len(), "Retargeting failure ledger");
        Eligibility::Retarget(keys)
    } else if config.retarget_unstructured {
        Eligibility::MissingOrUnstructured
    } else {
        Eligibility::Missing
    };

    let mut input_digest = digest_sources(&input).await?;
    if args.retarget {
        let ledger_digest = digest_sources(&ledger_path(&config.work_dir, args.stage)).await?;
        input_digest = combine_digests(&[&input_digest, &ledger_digest]);
    }
    let config_digest = combine_digests(&[
        &config.digest_for(args.stage.as_str()),
        &format!("{:?}", eligibility),
    ]);
    if skip_if_current(&args.stage_args, &output, &input_digest, &config_digest).await? {
        return Ok(());
    }

    let (store, malformed) = RecordStore::load(&input)
        .await
        .with_context(|| format!("failed to load record store {}", input.display()))?;
    if store.is_empty() {
        warn!(input = %input.display(), "Record store holds no keys");
    }
    let built = RequestBuilder::new(args.stage)
        .with_budgets(config.budgets)
        .with_narrators(config.narrators.clone())
        .with_eligibility(eligibility)
        .build(&store);

    write_jsonl(&output, &built.tasks).await?;
    let mut summary = built.summary;
    summary.add("malformed_records", malformed);
    finish(summary, input_digest, config_digest, &output).await
}

async fn run_dispatch_command(args: DispatchArgs) -> anyhow::Result<()> {
    let mut config = load_config(&args.stage_args)?;
    if let Some(model) = args.model {
        config = config.with_model(model);
    }
    if let Some(concurrency) = args.concurrency {
        config = config.with_concurrency(concurrency);
    }
    if args.api_key.is_some() {
        config.api_key = args.api_key;
    }
    config.validate()?;
    config.require_service()?;

    let tasks_path = config.work_dir.join(format!("{}.tasks.jsonl", args.stage));
    let output = config.work_dir.join(format!("{}.results.jsonl", args.stage));

    let input_digest = digest_sources(&tasks_path).await?;
    let config_digest = combine_digests(&[
        &config.digest_for(args.stage.as_str()),
        &config.model,
        &config.api_base,
    ]);
    if skip_if_current(&args.stage_args, &output, &input_digest, &config_digest).await? {
        return Ok(());
    }

    let read = read_jsonl::<InferenceTask>(&tasks_path)
        .await
        .with_context(|| format!("failed to read tasks {}", tasks_path.display()))?;
    let tasks: Vec<InferenceTask> = read
        .items
        .into_iter()
        .filter(|task| task.stage == args.stage)
        .collect();

    let service = OpenAiCompatibleService::new(
        config.api_base.clone(),
        config.api_key.clone(),
        config.model.clone(),
        config.request_timeout.as_secs(),
    )?;
    info!(
        stage = %args.stage,
        tasks = tasks.len(),
        model = service.model(),
        "Starting dispatch"
    );

    let mut summary = Dispatcher::new(Arc::new(service))
        .with_max_attempts(config.max_attempts)
        .with_concurrency(config.concurrency)
        .with_backoff(config.retry_backoff)
        .dispatch(tasks, &output)
        .await?;
    summary.add("malformed_tasks", read.skipped);
    finish(summary, input_digest, config_digest, &output).await
}

async fn run_merge_command(args: MergeArgs) -> anyhow::Result<()> {
    let config = load_config(&args.stage_args)?;
    let input = args
        .input
        .unwrap_or_else(|| config.work_dir.join(RECORDS_FILE));
    let results_path = args
        .results
        .unwrap_or_else(|| config.work_dir.join(format!("{}.results.jsonl", args.stage)));
    let output = args.output.unwrap_or_else(|| input.clone());

    let input_digest = combine_digests(&[
        &digest_sources(&input).await?,
        &digest_sources(&results_path).await?,
    ]);
    let config_digest = config.digest_for(&format!("merge:{}", args.stage));
    if skip_if_current(&args.stage_args, &output, &input_digest, &config_digest).await? {
        return Ok(());
    }

    let (mut store, malformed) = RecordStore::load(&input)
        .await
        .with_context(|| format!("failed to load record store {}", input.display()))?;
    let results = read_jsonl_sources::<InferenceResult>(&results_path).await?;
    if results.items.is_empty() {
        warn!(results = %results_path.display(), "No results to merge");
    }

    let outcome = ResultMerger::new(args.stage, config.max_attempts).merge(&mut store, results.items);
    store.save(&output).await?;
    let ledger = ledger_path(&config.work_dir, args.stage);
    write_jsonl(&ledger, &outcome.failures).await?;
    info!(ledger = %ledger.display(), failures = outcome.failures.len(), "Wrote failure ledger");

    let mut summary = outcome.summary;
    summary.add("malformed_records", malformed);
    summary.add("malformed_results", results.skipped);
    finish(summary, input_digest, config_digest, &output).await
}

async fn run_expand_command(args: ExpandArgs) -> anyhow::Result<()> {
    let mut config = load_config(&args.stage)?;
    if let Some(ref names) = args.narrators {
        config = config.with_narrators(parse_list(names));
    }
    let input = args
        .input
        .unwrap_or_else(|| config.work_dir.join(RECORDS_FILE));
    let output = args
        .output
        .unwrap_or_else(|| config.work_dir.join(SAMPLES_FILE));

    let input_digest = digest_sources(&input).await?;
    let config_digest = config.digest_for("expand");
    if skip_if_current(&args.stage, &output, &input_digest, &config_digest).await? {
        return Ok(());
    }

    let (store, malformed) = RecordStore::load(&input)
        .await
        .with_context(|| format!("failed to load record store {}", input.display()))?;
    let expanded = TurnExpander::new()
        .with_narrators(config.narrators.clone())
        .expand(&store);
    write_jsonl(&output, &expanded.samples).await?;

    let mut summary = expanded.summary;
    summary.add("malformed_records", malformed);
    finish(summary, input_digest, config_digest, &output).await
}

async fn run_label_command(args: LabelArgs) -> anyhow::Result<()> {
    let config = load_config(&args.stage)?;
    let input = args
        .input
        .unwrap_or_else(|| config.work_dir.join(SAMPLES_FILE));
    let results_path = args.results.unwrap_or_else(|| {
        config
            .work_dir
            .join(format!("{}.results.jsonl", Stage::Judgement))
    });
    let output = args
        .output
        .unwrap_or_else(|| config.work_dir.join(LABELED_FILE));

    let input_digest = combine_digests(&[
        &digest_sources(&input).await?,
        &digest_sources(&results_path).await?,
    ]);
    let config_digest = config.digest_for("label");
    if skip_if_current(&args.stage, &output, &input_digest, &config_digest).await? {
        return Ok(());
    }

    let samples = read_jsonl::<TrainingSample>(&input)
        .await
        .with_context(|| format!("failed to read samples {}", input.display()))?;
    let results = read_jsonl_sources::<InferenceResult>(&results_path).await?;
    let mut labeled = samples.items;
    let mut summary = attach_labels(&mut labeled, results.items);
    write_jsonl(&output, &labeled).await?;

    summary.add("malformed_samples", samples.skipped);
    summary.add("malformed_results", results.skipped);
    finish(summary, input_digest, config_digest, &output).await
}

async fn run_allocate_command(args: AllocateArgs) -> anyhow::Result<()> {
    let config = load_config(&args.stage)?;
    let input = args
        .input
        .unwrap_or_else(|| config.work_dir.join(LABELED_FILE));
    let out_dir = args
        .output
        .unwrap_or_else(|| config.work_dir.join(SPLITS_DIR));
    let report_path = out_dir.join("allocation_report.json");

    let mut plan = match args.plan {
        Some(ref path) => SplitPlan::load(path)
            .with_context(|| format!("failed to load split plan {}", path.display()))?,
        None => SplitPlan {
            seed: config.seed,
            ..SplitPlan::default()
        },
    };
    if let Some(seed) = args.seed {
        plan.seed = seed;
    }
    plan.validate()?;

    let input_digest = digest_sources(&input).await?;
    let config_digest = digest_bytes(plan.to_yaml()?.as_bytes());
    if skip_if_current(&args.stage, &report_path, &input_digest, &config_digest).await? {
        return Ok(());
    }

    let pool = read_jsonl::<TrainingSample>(&input)
        .await
        .with_context(|| format!("failed to read samples {}", input.display()))?;
    let allocation = QualityAllocator::new(plan).allocate(pool.items)?;
    allocation.write(&out_dir).await?;

    let report = &allocation.report;
    let mut summary = StageSummary::new("allocate");
    summary.processed = report.pool;
    summary.merged = report.splits.values().sum();
    summary.skipped = report.excluded.values().sum();
    for (split, count) in &report.splits {
        summary.add(&format!("split:{}", split), *count);
    }
    for (reason, count) in &report.excluded {
        summary.add(&format!("excluded:{}", reason), *count);
    }
    summary.add("pinned_overflow", report.pinned_overflow);
    summary.add("malformed_samples", pool.skipped);
    finish(summary, input_digest, config_digest, &report_path).await
}

async fn run_init_plan_command(args: InitPlanArgs) -> anyhow::Result<()> {
    let yaml = SplitPlan::default().to_yaml()?;
    crate::store::jsonl::write_atomic(&args.output, yaml.as_bytes()).await?;
    println!("Wrote default split plan to {}", args.output.display());
    Ok(())
}
