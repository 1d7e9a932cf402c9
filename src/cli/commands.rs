//! CLI command definitions for itextmine.
//!
//! Each subcommand builds a [`RunConfig`] from its flags and hands it to the
//! [`Orchestrator`]. Precedence is flag > config file > built-in default.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser};

use crate::config::{DatabaseConfig, FileConfig, RunConfig};
use crate::execution::{ContainerRuntime, DockerClient, MemoryRuntime};
use crate::orchestrator::{Orchestrator, RunPlan};
use crate::pipeline::Tool;
use crate::provision::Readiness;

/// Text-mining pipeline runner over disposable containers.
#[derive(Parser)]
#[command(name = "itextmine")]
#[command(about = "Run containerized text-mining tools over large document collections")]
#[command(version)]
#[command(
    long_about = "itextmine splits a line-oriented document collection into task units, runs a tool's chain of containerized stages over every unit with bounded parallelism, and reduces the per-unit results into collection-level files.\n\nExample usage:\n  itextmine run -t rlimsp -w ./work -i docs.json -o ./out -c pmc -n 10 -l 100"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Partition, run every stage, tear down and reduce.
    Run(Box<RunArgs>),

    /// Only split the input document into task units.
    Split(SplitArgs),

    /// Only reduce existing task units into collection files.
    Reduce(ReduceArgs),

    /// Only remove resources left over by earlier runs.
    Cleanup(CleanupArgs),
}

/// Flags shared by every subcommand.
#[derive(Args, Debug)]
pub struct ToolArgs {
    /// Tool to run (rlimsp, mirtex, efip, egard).
    #[arg(short = 't', long)]
    pub tool: Tool,

    /// Working directory holding the task units.
    #[arg(short = 'w', long)]
    pub workdir: PathBuf,
}

/// Database parameters, required by tools that query the document stores.
#[derive(Args, Debug, Default)]
pub struct DatabaseArgs {
    #[arg(long, env = "MONGO_HOST")]
    pub mongo_host: Option<String>,

    #[arg(long, env = "MONGO_PORT")]
    pub mongo_port: Option<u16>,

    #[arg(long, env = "PUBTATOR_DB")]
    pub pubtator_db: Option<String>,

    #[arg(long, env = "PUBTATOR_MEDLINE_COLLECTION")]
    pub pubtator_collection: Option<String>,

    #[arg(long, env = "MEDLINE_DB")]
    pub medline_db: Option<String>,

    #[arg(long, env = "MEDLINE_TEXT_COLLECTION")]
    pub medline_text_collection: Option<String>,
}

impl DatabaseArgs {
    fn into_config(self) -> anyhow::Result<Option<DatabaseConfig>> {
        Ok(DatabaseConfig::from_parts(
            self.mongo_host,
            self.mongo_port,
            self.pubtator_db,
            self.pubtator_collection,
            self.medline_db,
            self.medline_text_collection,
        )?)
    }
}

/// Arguments for `itextmine run`.
#[derive(Args, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub tool: ToolArgs,

    /// Line-oriented input document.
    #[arg(short = 'i', long = "inputfile")]
    pub input: Option<PathBuf>,

    /// Directory receiving the collection-level outputs.
    #[arg(short = 'o', long = "outputdir")]
    pub output_dir: PathBuf,

    /// Collection tag used in output file names.
    #[arg(short = 'c', long)]
    pub collection: String,

    /// Number of task units processed at once (default: 10).
    #[arg(short = 'n', long = "numtasks")]
    pub workers: Option<usize>,

    /// Input lines per task unit (default: 100).
    #[arg(short = 'l', long = "linespertask")]
    pub lines_per_task: Option<usize>,

    /// Deadline for a single stage container, in seconds.
    #[arg(long)]
    pub stage_timeout: Option<u64>,

    /// Poll services for readiness this many times instead of a fixed wait.
    #[arg(long)]
    pub readiness_attempts: Option<u32>,

    /// TCP port probed on each service while polling for readiness.
    #[arg(long, requires = "readiness_attempts")]
    pub readiness_port: Option<u16>,

    /// Skip partitioning and tasks finished by an earlier run.
    #[arg(long)]
    pub resume: bool,

    /// Do not pull images before dispatch.
    #[arg(long)]
    pub skip_pull: bool,

    /// Hide the progress bar.
    #[arg(long)]
    pub no_progress: bool,

    /// Print what the run would do and exit without changing anything.
    #[arg(long)]
    pub dry_run: bool,

    /// YAML file with default settings.
    #[arg(long)]
    pub config: Option<PathBuf>,

    #[command(flatten)]
    pub database: DatabaseArgs,
}

impl RunArgs {
    /// Builds the run configuration: defaults, then the file, then flags.
    pub fn to_config(self) -> anyhow::Result<RunConfig> {
        let mut config = RunConfig::new(
            self.tool.tool,
            self.tool.workdir,
            self.input.unwrap_or_default(),
            self.output_dir,
            self.collection,
        );

        if let Some(path) = &self.config {
            let file = FileConfig::load(path)
                .with_context(|| format!("loading config file {}", path.display()))?;
            config = config.with_file(file);
        }

        if let Some(workers) = self.workers {
            config = config.with_workers(workers);
        }
        if let Some(lines) = self.lines_per_task {
            config = config.with_lines_per_task(lines);
        }
        if let Some(secs) = self.stage_timeout {
            config = config.with_stage_timeout(Duration::from_secs(secs));
        }
        if let Some(attempts) = self.readiness_attempts {
            config = config.with_readiness(Readiness::poll(attempts, self.readiness_port));
        }
        if let Some(database) = self.database.into_config()? {
            config = config.with_database(database);
        }

        Ok(config
            .with_resume(self.resume)
            .with_pull_images(!self.skip_pull)
            .with_progress(!self.no_progress))
    }
}

/// Arguments for `itextmine split`.
#[derive(Args, Debug)]
pub struct SplitArgs {
    #[command(flatten)]
    pub tool: ToolArgs,

    /// Line-oriented input document.
    #[arg(short = 'i', long = "inputfile")]
    pub input: PathBuf,

    /// Input lines per task unit.
    #[arg(short = 'l', long = "linespertask", default_value_t = crate::config::DEFAULT_LINES_PER_TASK)]
    pub lines_per_task: usize,
}

/// Arguments for `itextmine reduce`.
#[derive(Args, Debug)]
pub struct ReduceArgs {
    #[command(flatten)]
    pub tool: ToolArgs,

    /// Directory receiving the collection-level outputs.
    #[arg(short = 'o', long = "outputdir")]
    pub output_dir: PathBuf,

    /// Collection tag used in output file names.
    #[arg(short = 'c', long)]
    pub collection: String,
}

/// Arguments for `itextmine cleanup`.
#[derive(Args, Debug)]
pub struct CleanupArgs {
    #[command(flatten)]
    pub tool: ToolArgs,
}

/// Parse CLI arguments and return the Cli struct.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run(args) => run_pipeline_command(*args).await,
        Commands::Split(args) => run_split_command(args).await,
        Commands::Reduce(args) => run_reduce_command(args).await,
        Commands::Cleanup(args) => run_cleanup_command(args).await,
    }
}

async fn connect() -> anyhow::Result<Arc<dyn ContainerRuntime>> {
    let client = DockerClient::new().context("connecting to the Docker daemon")?;
    client.ping().await.context("Docker daemon did not answer")?;
    Ok(Arc::new(client))
}

async fn run_pipeline_command(args: RunArgs) -> anyhow::Result<()> {
    let dry_run = args.dry_run;
    let config = args.to_config()?;
    let tool = config.tool;

    if dry_run {
        let plan = Orchestrator::new(config, Arc::new(MemoryRuntime::new())).plan()?;
        print_plan(&plan);
        return Ok(());
    }

    let runtime = connect().await?;

    let summary = Orchestrator::new(config, runtime).run().await?;

    println!("✓ {} run {} completed", tool, summary.run_id);
    println!("  Tasks run:      {}", summary.report.dispatched);
    println!("  Tasks resumed:  {}", summary.resumed);
    println!("  Stages:         {}", summary.report.progress);
    println!("  Soft warnings:  {}", summary.report.warnings);
    println!("  Elapsed:        {:.1}s", summary.report.elapsed.as_secs_f64());
    for output in &summary.reduced.outputs {
        println!("  Output:         {}", output.display());
    }
    if let Some(root) = &summary.reduced.restage_root {
        println!("  Re-staged into: {}", root.display());
    }
    Ok(())
}

fn print_plan(plan: &RunPlan) {
    println!("✓ Dry run of {}, nothing was changed", plan.tool);
    println!("  Tasks:          {}", plan.tasks);
    println!("  Stages:         {}", plan.stages.join(" → "));
    println!("  Images:         {}", plan.images.join(", "));
    if !plan.networks.is_empty() {
        println!("  Networks:       {}", plan.networks.join(", "));
        println!("  Services:       {}", plan.services.join(", "));
    }
}

async fn run_split_command(args: SplitArgs) -> anyhow::Result<()> {
    let config = RunConfig::new(args.tool.tool, args.tool.workdir, args.input, "", "")
        .with_lines_per_task(args.lines_per_task);

    let units = Orchestrator::new(config, Arc::new(MemoryRuntime::new()))
        .split()
        .await?;

    println!("✓ Split into {} task unit(s)", units.len());
    Ok(())
}

async fn run_reduce_command(args: ReduceArgs) -> anyhow::Result<()> {
    let config = RunConfig::new(
        args.tool.tool,
        args.tool.workdir,
        "",
        args.output_dir,
        args.collection,
    );

    let reduced = Orchestrator::new(config, Arc::new(MemoryRuntime::new()))
        .reduce()
        .await?;

    println!("✓ Reduced {} task unit(s)", reduced.tasks);
    for output in &reduced.outputs {
        println!("  Output:         {}", output.display());
    }
    if let Some(root) = &reduced.restage_root {
        println!("  Re-staged into: {}", root.display());
    }
    Ok(())
}

async fn run_cleanup_command(args: CleanupArgs) -> anyhow::Result<()> {
    let config = RunConfig::new(args.tool.tool, args.tool.workdir, "", "", "");
    let runtime = connect().await?;

    let report = Orchestrator::new(config, runtime).cleanup().await?;

    println!(
        "✓ Removed {} container(s) and {} network(s)",
        report.containers_removed, report.networks_removed
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).expect("valid arguments")
    }

    #[test]
    fn test_run_flags_build_config() {
        let cli = parse(&[
            "itextmine", "run", "-t", "rlimsp", "-w", "/w", "-i", "/in.json", "-o", "/out", "-c",
            "pmc", "-n", "4", "-l", "50", "--stage-timeout", "120", "--readiness-attempts", "6",
            "--skip-pull",
        ]);
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        let config = args.to_config().expect("config");

        assert_eq!(config.tool, Tool::Rlimsp);
        assert_eq!(config.workers, 4);
        assert_eq!(config.lines_per_task, 50);
        assert_eq!(config.stage_timeout, Some(Duration::from_secs(120)));
        assert!(matches!(config.readiness, Readiness::Poll { attempts: 6, tcp_port: None, .. }));
        assert!(!config.pull_images);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_flags_override_config_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("itextmine.yaml");
        std::fs::write(&path, "workers: 3\nlines_per_task: 20\n").expect("write");

        let cli = parse(&[
            "itextmine", "run", "-t", "mirtex", "-w", "/w", "-i", "/in", "-o", "/out", "-c", "abs",
            "-n", "8", "--config", path.to_str().expect("utf-8 path"),
        ]);
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        let config = args.to_config().expect("config");

        assert_eq!(config.workers, 8);
        assert_eq!(config.lines_per_task, 20);
    }

    #[test]
    fn test_dry_run_only_on_run() {
        let cli = parse(&[
            "itextmine", "run", "-t", "mirtex", "-w", "/w", "-i", "/in", "-o", "/out", "-c", "abs",
            "--dry-run",
        ]);
        assert!(matches!(cli.command, Commands::Run(ref args) if args.dry_run));

        let split = Cli::try_parse_from([
            "itextmine", "split", "-t", "mirtex", "-w", "/w", "-i", "/in", "--dry-run",
        ]);
        assert!(split.is_err());
        let cleanup = Cli::try_parse_from(["itextmine", "cleanup", "-t", "egard", "-w", "/w", "--dry-run"]);
        assert!(cleanup.is_err());
    }

    #[tokio::test]
    async fn test_dry_run_leaves_workdir_and_outputs_alone() {
        let dir = tempfile::tempdir().expect("tempdir");
        let input = dir.path().join("docs.json");
        std::fs::write(&input, "{\"pmid\":1}\n{\"pmid\":2}\n{\"pmid\":3}\n").expect("write");
        let existing = dir.path().join("out/mirtex/mirtex.pmc.aligned.json");
        std::fs::create_dir_all(existing.parent().expect("parent")).expect("mkdir");
        std::fs::write(&existing, "kept results\n").expect("write");

        let work = dir.path().join("work");
        let out = dir.path().join("out");
        let cli = parse(&[
            "itextmine", "run", "-t", "mirtex", "-w", work.to_str().expect("utf-8"), "-i",
            input.to_str().expect("utf-8"), "-o", out.to_str().expect("utf-8"), "-c", "pmc", "-l",
            "2", "--dry-run",
        ]);
        run_with_cli(cli).await.expect("dry run");

        assert!(!work.exists());
        assert_eq!(std::fs::read_to_string(&existing).expect("read"), "kept results\n");
    }

    #[test]
    fn test_unknown_tool_rejected() {
        let result = Cli::try_parse_from(["itextmine", "cleanup", "-t", "pubtator", "-w", "/w"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_log_level_is_global() {
        let cli = parse(&["itextmine", "cleanup", "-t", "egard", "-w", "/w", "--log-level", "debug"]);
        assert_eq!(cli.log_level, "debug");
        assert!(matches!(cli.command, Commands::Cleanup(_)));
    }
}
