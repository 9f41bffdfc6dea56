use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use colored::Colorize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use strata_adapter::{BackendAdapter, MockAdapter, PostgresAdapter};
use strata_compiler::{compile, parse_vars, Compilation, CompileOptions};
use strata_core::{ProfilesConfig, Report, ResourceType, Severity, TargetConfig};
use strata_engine::{Executor, NodeStatus, RunConfig, RunReport};
use strata_graph::{Manifest, Selection, SelectionCriteria, Selector};

/// Strata - compile and run a graph of templated transformations
#[derive(Parser)]
#[command(name = "strata")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Project directory (default: current directory)
    #[arg(long, global = true, default_value = ".")]
    project_dir: PathBuf,

    /// Target from profiles.toml (default: the profile's default target)
    #[arg(long, global = true)]
    target: Option<String>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile the project and write the manifest
    Compile {
        #[command(flatten)]
        compile: CompileArgs,

        /// Output file for the manifest
        #[arg(short, long, default_value = "target/manifest.json")]
        output: PathBuf,
    },

    /// List the unique ids a selection resolves to
    Ls {
        #[command(flatten)]
        compile: CompileArgs,

        #[command(flatten)]
        select: SelectArgs,

        /// Keep only nodes of this resource type
        #[arg(long)]
        resource_type: Option<String>,
    },

    /// Build selected models
    Run(RunArgs),

    /// Run selected tests
    Test(RunArgs),

    /// Build selected models and run their tests
    Build(RunArgs),
}

#[derive(Args)]
struct CompileArgs {
    /// Variable overrides as an inline TOML table, e.g. 'min_total = 10'
    #[arg(long)]
    vars: Option<String>,

    /// Ignore existing incremental relations
    #[arg(long)]
    full_refresh: bool,
}

#[derive(Args)]
struct SelectArgs {
    /// Selection expression (repeatable)
    #[arg(short, long)]
    select: Vec<String>,

    /// Exclusion expression (repeatable)
    #[arg(long)]
    exclude: Vec<String>,

    /// Previous manifest for state: selectors
    #[arg(long)]
    state: Option<PathBuf>,
}

#[derive(Args)]
struct RunArgs {
    #[command(flatten)]
    compile: CompileArgs,

    #[command(flatten)]
    select: SelectArgs,

    /// Worker count (default: the target's threads)
    #[arg(long)]
    threads: Option<usize>,

    /// Stop scheduling after the first error
    #[arg(long)]
    fail_fast: bool,

    /// Backend adapter
    #[arg(long, value_enum, default_value_t = AdapterKind::Mock)]
    adapter: AdapterKind,

    /// Output file for the run report
    #[arg(short, long, default_value = "target/run_results.json")]
    output: PathBuf,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum AdapterKind {
    Mock,
    Postgres,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // .env feeds env_var() in templates
    dotenvy::dotenv().ok();
    init_tracing(cli.verbose);

    let target = load_target(&cli.project_dir, cli.target.as_deref())?;
    if cli.verbose {
        eprintln!(
            "{} target '{}' ({})",
            "Using".cyan(),
            target.name,
            target.adapter_type
        );
    }

    match &cli.command {
        Commands::Compile { compile, output } => compile_command(&cli, target, compile, output),
        Commands::Ls {
            compile,
            select,
            resource_type,
        } => ls_command(&cli, target, compile, select, resource_type.as_deref()),
        Commands::Run(args) => run_command(&cli, target, args, &[ResourceType::Model]).await,
        Commands::Test(args) => run_command(&cli, target, args, &[ResourceType::Test]).await,
        Commands::Build(args) => run_command(&cli, target, args, &[]).await,
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Target from `profiles.toml` in the project directory, or the default mock target
fn load_target(project_dir: &Path, name: Option<&str>) -> Result<TargetConfig> {
    let path = project_dir.join("profiles.toml");
    if !path.exists() {
        if let Some(name) = name {
            anyhow::bail!("Target '{}' requested but {} does not exist", name, path.display());
        }
        return Ok(TargetConfig::default());
    }
    let profiles = ProfilesConfig::from_file(&path)?;
    Ok(profiles.target(name)?)
}

/// Compile the project, printing the report and exiting on errors
fn compile_project(cli: &Cli, target: TargetConfig, args: &CompileArgs) -> Result<Compilation> {
    let mut options = CompileOptions::new(&cli.project_dir)
        .with_target(target)
        .full_refresh(args.full_refresh);
    if let Some(vars) = &args.vars {
        options = options.with_vars(parse_vars(vars)?);
    }

    if cli.verbose {
        eprintln!("{} {}", "Compiling".cyan(), cli.project_dir.display());
    }

    match compile(&options) {
        Ok(compilation) => {
            print_warnings(&compilation.report);
            Ok(compilation)
        }
        Err(failure) => {
            print_report_summary(&failure.report);
            eprintln!("{} {}", "✗".red().bold(), failure.to_string().red());
            std::process::exit(1);
        }
    }
}

/// Compile command - write the manifest
fn compile_command(cli: &Cli, target: TargetConfig, args: &CompileArgs, output: &Path) -> Result<()> {
    let compilation = compile_project(cli, target, args)?;
    let output = cli.project_dir.join(output);
    compilation
        .manifest
        .write_to_file(&output)
        .with_context(|| format!("Failed to write manifest to {}", output.display()))?;

    print_report_summary(&compilation.report);
    println!(
        "{} {} nodes, manifest saved to {}",
        "✓ Compiled".green().bold(),
        compilation.manifest.nodes.len(),
        output.display()
    );
    Ok(())
}

/// Ls command - print selected unique ids
fn ls_command(
    cli: &Cli,
    target: TargetConfig,
    compile_args: &CompileArgs,
    select: &SelectArgs,
    resource_type: Option<&str>,
) -> Result<()> {
    let resource_types = match resource_type {
        Some(value) => vec![ResourceType::parse(value)
            .ok_or_else(|| anyhow::anyhow!("Unknown resource type '{}'", value))?],
        None => Vec::new(),
    };
    let compilation = compile_project(cli, target, compile_args)?;
    let previous = load_state(select.state.as_deref())?;
    let criteria = criteria(select, &resource_types);

    let mut selector = Selector::new(&compilation.manifest);
    if let Some(previous) = &previous {
        selector = selector.with_state(previous);
    }
    let selection = selector.select(&criteria)?;

    for unique_id in &selection.selected {
        println!("{}", unique_id);
    }
    if cli.verbose {
        for pruned in &selection.pruned {
            eprintln!("{} {}: {}", "pruned".yellow(), pruned.unique_id, pruned.reason);
        }
    }
    Ok(())
}

/// Run, test and build - compile, select and execute
async fn run_command(
    cli: &Cli,
    target: TargetConfig,
    args: &RunArgs,
    resource_types: &[ResourceType],
) -> Result<()> {
    let compilation = compile_project(cli, target.clone(), &args.compile)?;
    let manifest = compilation.manifest;

    let manifest_path = cli.project_dir.join("target").join("manifest.json");
    manifest
        .write_to_file(&manifest_path)
        .with_context(|| format!("Failed to write manifest to {}", manifest_path.display()))?;

    let previous = load_state(args.select.state.as_deref())?;
    let mut selector = Selector::new(&manifest);
    if let Some(previous) = &previous {
        selector = selector.with_state(previous);
    }
    let selection = selector.select(&criteria(&args.select, resource_types))?;

    if selection.is_empty() {
        println!("{}", "Nothing to do: the selection matched no nodes".yellow());
        return Ok(());
    }
    for pruned in &selection.pruned {
        eprintln!("{} {}: {}", "WARN".yellow().bold(), pruned.unique_id, pruned.reason);
    }

    let mut config = RunConfig::new(target.clone())
        .fail_fast(args.fail_fast)
        .full_refresh(args.compile.full_refresh);
    if let Some(threads) = args.threads {
        config = config.with_threads(threads);
    }

    if cli.verbose {
        eprintln!(
            "{} {} node(s) on {} thread(s)",
            "Running".cyan(),
            selection.selected.len(),
            config.threads
        );
    }

    let report = match args.adapter {
        AdapterKind::Mock => execute(Arc::new(MockAdapter::new()), config, &manifest, &selection).await,
        AdapterKind::Postgres => {
            let adapter = PostgresAdapter::from_target(&target)?;
            execute(Arc::new(adapter), config, &manifest, &selection).await
        }
    };

    let output = cli.project_dir.join(&args.output);
    report
        .save_to_file(&output)
        .with_context(|| format!("Failed to write run report to {}", output.display()))?;

    print_run_summary(&report);
    if cli.verbose {
        eprintln!("{} {}", "Run report saved to:".green(), output.display());
    }

    if !report.success() {
        std::process::exit(1);
    }
    Ok(())
}

/// Execute a selection, stopping the run on Ctrl-C
async fn execute<A: BackendAdapter>(
    adapter: Arc<A>,
    config: RunConfig,
    manifest: &Manifest,
    selection: &Selection,
) -> RunReport {
    let executor = Executor::new(adapter, config);
    let stop = executor.stop_handle();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("{}", "Interrupted, cancelling remaining nodes...".yellow());
            stop.stop();
        }
    });

    let report = executor.run_selection(manifest, selection).await;
    interrupt.abort();
    report
}

fn load_state(path: Option<&Path>) -> Result<Option<Manifest>> {
    let Some(path) = path else {
        return Ok(None);
    };
    // Accept either the manifest file or the directory holding it
    let file = if path.is_dir() { path.join("manifest.json") } else { path.to_path_buf() };
    let manifest = Manifest::from_file(&file)
        .map_err(|e| anyhow::anyhow!("Failed to load state manifest: {}", e))?;
    Ok(Some(manifest))
}

fn criteria(args: &SelectArgs, resource_types: &[ResourceType]) -> SelectionCriteria {
    SelectionCriteria {
        select: args.select.clone(),
        exclude: args.exclude.clone(),
        resource_types: resource_types.iter().copied().collect(),
        ..SelectionCriteria::default()
    }
}

fn print_warnings(report: &Report) {
    for diag in report.diagnostics.iter().filter(|d| d.severity == Severity::Warn) {
        eprintln!("{} {}: {}", "WARN".yellow().bold(), diag.code, diag.message);
    }
}

fn print_report_summary(report: &Report) {
    if report.diagnostics.is_empty() {
        return;
    }

    println!("\n{}", "=".repeat(60).bright_blue());
    println!("{}", "Compile Report".bold().bright_blue());
    println!("{}", "=".repeat(60).bright_blue());
    println!();

    if report.summary.errors > 0 {
        println!("  Errors:   {}", report.summary.errors.to_string().red().bold());
    } else {
        println!("  Errors:   {}", report.summary.errors.to_string().green());
    }
    if report.summary.warnings > 0 {
        println!("  Warnings: {}", report.summary.warnings.to_string().yellow());
    } else {
        println!("  Warnings: {}", report.summary.warnings.to_string().green());
    }
    println!();

    for diag in &report.diagnostics {
        let severity = match diag.severity {
            Severity::Error => "ERROR".red().bold(),
            Severity::Warn => "WARN".yellow().bold(),
            Severity::Info => "INFO".cyan(),
        };
        println!("  [{}] {}: {}", severity, diag.code, diag.message);
        if let Some(location) = &diag.location {
            println!("    {} {}", "at".dimmed(), location);
        }
        if !diag.related.is_empty() {
            println!("    {} {}", "related:".dimmed(), diag.related.join(" -> "));
        }
    }
    println!();
}

fn print_run_summary(report: &RunReport) {
    println!();
    for result in &report.results {
        let label = |text: &str| format!("{:<8}", text);
        let status = match result.status {
            NodeStatus::Success => label("OK").green().bold(),
            NodeStatus::Warn => label("WARN").yellow().bold(),
            NodeStatus::Error => label("ERROR").red().bold(),
            NodeStatus::Skipped => label("SKIP").yellow(),
            NodeStatus::NotRun => label("NOT RUN").dimmed(),
        };
        let message = result.message.as_deref().unwrap_or("");
        println!(
            "  {} {} {} {}",
            status,
            result.unique_id,
            format!("[{:.2}s]", result.elapsed).dimmed(),
            message
        );
    }

    let summary = &report.summary;
    println!();
    println!(
        "{} {} total, {} success, {} warn, {} error, {} skipped, {} not run in {:.2}s",
        "Done.".bold(),
        summary.total,
        summary.success.to_string().green(),
        summary.warn.to_string().yellow(),
        summary.error.to_string().red(),
        summary.skipped.to_string().yellow(),
        summary.not_run,
        report.metadata.elapsed
    );
    if report.metadata.cancelled {
        println!("{}", "Run was cancelled".red().bold());
    }
}
