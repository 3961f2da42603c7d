use anyhow::{anyhow, Result};
use clap::Parser;
use perf_runner::RunConfig;
use serde_json::Value;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "perfrun", version, about = "Benchmark run orchestrator and stats aggregator")]
struct Cli {
    /// Path of the benchmark executable.
    #[arg(short = 'p', long)]
    exec: Option<PathBuf>,
    /// Environment prefix token prepended to the command line.
    #[arg(short, long)]
    env: Option<String>,
    /// Path of the benchmark test configuration (passed through via -O).
    #[arg(short, long)]
    test: Option<PathBuf>,
    /// Path of the file to write the report to.
    #[arg(short, long)]
    outfile: Option<PathBuf>,
    /// Emit the brief (machine-oriented) report instead of the detailed one.
    #[arg(short, long)]
    brief: bool,
    /// Number of times to run the test.
    #[arg(short = 'm', long, default_value_t = 1)]
    runmax: usize,
    /// Base path of the working directory handed to the benchmark.
    #[arg(long)]
    home: Option<PathBuf>,
    /// Reuse and reanalyse artifacts from previous runs instead of re-executing.
    #[arg(short, long)]
    reuse: bool,
    /// Path of the git working tree to report source-control facts for.
    #[arg(short, long)]
    git_root: Option<PathBuf>,
    /// Additional test information as a JSON object string.
    #[arg(short = 'i', long)]
    json_info: Option<String>,
    /// Run every configuration in a JSON batch file for a single test.
    #[arg(long)]
    batch_file: Option<PathBuf>,
    /// Additional arguments to pass to the executable, as a JSON list string.
    #[arg(short, long)]
    arguments: Option<String>,
    /// Statistics to report, as a JSON list string.
    #[arg(long)]
    operations: Option<String>,
    /// Be verbose.
    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    if let Err(err) = run(cli) {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = build_config(&cli)?;
    if config.verbose {
        print_config(&config);
    }

    let batch = match &config.batch_file {
        Some(path) => Some(perf_runner::load_batch_file(path)?),
        None => None,
    };
    perf_runner::validate_operations(config.operations.as_deref(), batch.as_deref())?;

    let stats = perf_runner::run_suite(&config, batch.as_deref(), cli.reuse)?;

    let report = if cli.brief {
        perf_runner::brief_report(&config, &stats)
    } else {
        let host = perf_runner::host_facts();
        let git = match &config.git_root {
            Some(root) => Some(perf_runner::git_facts(root)?),
            None => None,
        };
        perf_runner::detailed_report(&config, &stats, &host, git.as_ref())?
    };

    if config.verbose {
        println!("{}", serde_json::to_string_pretty(&report)?);
    }
    if let Some(outfile) = &cli.outfile {
        perf_runner::write_report(outfile, &report)?;
    }
    Ok(())
}

fn build_config(cli: &Cli) -> Result<RunConfig> {
    let exec_path = cli
        .exec
        .clone()
        .ok_or_else(|| anyhow!("the path to the benchmark executable is required (--exec)"))?;
    let test_path = cli
        .test
        .clone()
        .ok_or_else(|| anyhow!("the path to the test configuration is required (--test)"))?;
    let home_dir = cli
        .home
        .clone()
        .ok_or_else(|| anyhow!("the base path of the working directory is required (--home)"))?;
    if !cli.verbose && cli.outfile.is_none() {
        return Err(anyhow!(
            "enable --verbose or provide --outfile so the report has somewhere to go"
        ));
    }

    let arguments = parse_json_list(cli.arguments.as_deref(), "--arguments")?;
    let operations = parse_json_list(cli.operations.as_deref(), "--operations")?;
    let json_info = match cli.json_info.as_deref() {
        Some(raw) => serde_json::from_str::<Value>(raw)
            .map_err(|e| anyhow!("--json-info is not valid JSON: {}", e))?,
        None => Value::Object(Default::default()),
    };

    let config = RunConfig {
        exec_path,
        env_prefix: cli.env.clone(),
        test_path,
        home_dir,
        run_max: cli.runmax,
        arguments,
        operations,
        batch_file: cli.batch_file.clone(),
        git_root: cli.git_root.clone(),
        verbose: cli.verbose,
        json_info,
    };
    config.validate()?;
    Ok(config)
}

fn parse_json_list(raw: Option<&str>, flag: &str) -> Result<Option<Vec<String>>> {
    match raw {
        Some(raw) => serde_json::from_str::<Vec<String>>(raw)
            .map(Some)
            .map_err(|e| anyhow!("{} is not a JSON list of strings: {}", flag, e)),
        None => Ok(None),
    }
}

fn print_config(config: &RunConfig) {
    println!("configuration:");
    println!("  exec path:   {}", config.exec_path.display());
    println!("  env prefix:  {:?}", config.env_prefix);
    println!("  test path:   {}", config.test_path.display());
    println!("  home base:   {}", config.home_dir.display());
    println!("  run max:     {}", config.run_max);
    println!("  batch file:  {:?}", config.batch_file);
    println!("  arguments:   {:?}", config.arguments);
    println!("  operations:  {:?}", config.operations);
    println!("  git root:    {:?}", config.git_root);
    println!("  json info:   {}", config.json_info);
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
