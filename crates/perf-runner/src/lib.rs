use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;
use tracing::{debug, info};
use walkdir::WalkDir;

pub type Result<T, E = PerfError> = std::result::Result<T, E>;

// Every failure is terminal for the whole orchestration: no retry, no
// partial-result salvage.
#[derive(Debug, Error)]
pub enum PerfError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("benchmark process exited with code {code}: {output}")]
    Process { code: String, output: String },
    #[error("collection error: {0}")]
    Collection(String),
    #[error("git error: {0}")]
    Git(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize)]
pub struct RunConfig {
    pub exec_path: PathBuf,
    pub env_prefix: Option<String>,
    pub test_path: PathBuf,
    pub home_dir: PathBuf,
    pub run_max: usize,
    pub arguments: Option<Vec<String>>,
    pub operations: Option<Vec<String>>,
    pub batch_file: Option<PathBuf>,
    pub git_root: Option<PathBuf>,
    pub verbose: bool,
    pub json_info: Value,
}

impl RunConfig {
    pub fn validate(&self) -> Result<()> {
        if self.run_max == 0 {
            return Err(PerfError::Config(
                "the run count must be at least 1".to_string(),
            ));
        }
        if self.batch_file.is_some() && (self.arguments.is_some() || self.operations.is_some()) {
            return Err(PerfError::Config(
                "a batch file must not be combined with direct arguments or operations"
                    .to_string(),
            ));
        }
        Ok(())
    }

    pub fn test_name(&self) -> String {
        self.test_path
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default()
    }
}

// A batch entry's ordinal position seeds the working-directory suffix, so
// entry order is part of the on-disk layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchEntry {
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default)]
    pub operations: Vec<String>,
}

pub fn load_batch_file(path: &Path) -> Result<Vec<BatchEntry>> {
    let data = fs::read_to_string(path).map_err(|e| {
        PerfError::Config(format!("batch file {} unreadable: {}", path.display(), e))
    })?;
    serde_json::from_str(&data).map_err(|e| {
        PerfError::Config(format!(
            "batch file {} is not a JSON list of entries: {}",
            path.display(),
            e
        ))
    })
}

#[derive(Debug, Clone)]
pub struct RunContext {
    pub home_path: PathBuf,
    pub command_line: Vec<String>,
}

impl RunContext {
    pub fn new(
        config: &RunConfig,
        batch_index: usize,
        run_index: usize,
        extra_args: Option<&[String]>,
    ) -> Self {
        let home_path = run_home_path(&config.home_dir, batch_index, run_index);
        let command_line = build_command_line(
            &config.exec_path,
            config.env_prefix.as_deref(),
            Some(&config.test_path),
            extra_args,
            Some(&home_path),
        );
        Self {
            home_path,
            command_line,
        }
    }
}

// Distinct (batch, run) pairs must always yield distinct paths.
pub fn run_home_path(home: &Path, batch_index: usize, run_index: usize) -> PathBuf {
    PathBuf::from(format!("{}_{}_{}", home.display(), batch_index, run_index))
}

// Token order is fixed: env prefix, executable, -O override pair, extra
// arguments verbatim, -h home pair. Token contents are not validated here.
pub fn build_command_line(
    exec_path: &Path,
    env_prefix: Option<&str>,
    override_file: Option<&Path>,
    extra_args: Option<&[String]>,
    home_path: Option<&Path>,
) -> Vec<String> {
    let mut command_line = Vec::new();
    if let Some(env) = env_prefix {
        command_line.push(env.to_string());
    }
    command_line.push(exec_path.to_string_lossy().to_string());
    if let Some(file) = override_file {
        command_line.push("-O".to_string());
        command_line.push(file.to_string_lossy().to_string());
    }
    if let Some(args) = extra_args {
        command_line.extend(args.iter().cloned());
    }
    if let Some(home) = home_path {
        command_line.push("-h".to_string());
        command_line.push(home.to_string_lossy().to_string());
    }
    command_line
}

// No timeout: a hung benchmark hangs the orchestrator. A non-zero exit
// carries the captured combined output on the error.
pub fn execute(command_line: &[String]) -> Result<()> {
    let (program, args) = command_line
        .split_first()
        .ok_or_else(|| PerfError::Config("empty command line".to_string()))?;
    debug!(command = ?command_line, "spawning benchmark process");
    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|e| PerfError::Config(format!("failed to launch '{}': {}", program, e)))?;
    let mut combined = String::from_utf8_lossy(&output.stdout).to_string();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));
    if !output.status.success() {
        let code = output
            .status
            .code()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string());
        return Err(PerfError::Process {
            code,
            output: combined,
        });
    }
    debug!(output = %combined, "benchmark process completed");
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregation {
    Sum,
    Mean,
    Max,
}

/// A registry-known measurement: where to find it in a run's artifacts and
/// how repeated runs fold into one reported value.
#[derive(Debug)]
pub struct StatDefinition {
    pub label: &'static str,
    pub description: &'static str,
    pub artifact: &'static str,
    pub pattern: &'static str,
    pub token: usize,
    pub aggregation: Aggregation,
    pub brief: bool,
}

pub const ALL_STATS: &[StatDefinition] = &[
    StatDefinition {
        label: "load",
        description: "Load phase completion time (seconds)",
        artifact: "test.stat",
        pattern: "Load time:",
        token: 2,
        aggregation: Aggregation::Mean,
        brief: true,
    },
    StatDefinition {
        label: "insert",
        description: "Insert operations executed",
        artifact: "test.stat",
        pattern: "insert operations",
        token: 1,
        aggregation: Aggregation::Sum,
        brief: true,
    },
    StatDefinition {
        label: "read",
        description: "Read operations executed",
        artifact: "test.stat",
        pattern: "read operations",
        token: 1,
        aggregation: Aggregation::Sum,
        brief: true,
    },
    StatDefinition {
        label: "update",
        description: "Update operations executed",
        artifact: "test.stat",
        pattern: "update operations",
        token: 1,
        aggregation: Aggregation::Sum,
        brief: true,
    },
    StatDefinition {
        label: "opCount",
        description: "Total operations executed",
        artifact: "test.stat",
        pattern: "total operations",
        token: 1,
        aggregation: Aggregation::Sum,
        brief: true,
    },
    StatDefinition {
        label: "maxLatency",
        description: "Maximum operation latency (ms)",
        artifact: "test.stat",
        pattern: "Max latency:",
        token: 2,
        aggregation: Aggregation::Max,
        brief: false,
    },
];

/// Ordered registry of every statistic the collector can produce.
pub fn all_stats() -> &'static [StatDefinition] {
    ALL_STATS
}

#[derive(Debug, Clone)]
pub struct StatRecord {
    pub def: &'static StatDefinition,
    pub values: Vec<f64>,
}

impl StatRecord {
    pub fn aggregate(&self) -> f64 {
        match self.def.aggregation {
            Aggregation::Sum => self.values.iter().sum(),
            Aggregation::Mean => {
                self.values.iter().sum::<f64>() / self.values.len().max(1) as f64
            }
            Aggregation::Max => self.values.iter().cloned().fold(f64::MIN, f64::max),
        }
    }
}

/// Per-run values accumulated across the repeats of one batch entry, keyed
/// by statistic label.
#[derive(Debug)]
pub struct StatCollection {
    operations: Option<Vec<String>>,
    records: BTreeMap<String, StatRecord>,
}

impl StatCollection {
    pub fn new(operations: Option<&[String]>) -> Self {
        Self {
            operations: operations.map(|ops| ops.to_vec()),
            records: BTreeMap::new(),
        }
    }

    // An empty or omitted operations list selects the full registry.
    fn selected(&self) -> Vec<&'static StatDefinition> {
        ALL_STATS
            .iter()
            .filter(|def| match &self.operations {
                Some(ops) if !ops.is_empty() => ops.iter().any(|op| op == def.label),
                _ => true,
            })
            .collect()
    }

    // Works equally against a directory materialized by an earlier, reused
    // run. Missing directories or artifacts fail loudly; nothing is ever
    // reported as silently empty.
    pub fn collect_from(&mut self, working_dir: &Path) -> Result<()> {
        if !working_dir.is_dir() {
            return Err(PerfError::Collection(format!(
                "working directory missing: {}",
                working_dir.display()
            )));
        }
        for def in self.selected() {
            let artifact = find_artifact(working_dir, def.artifact).ok_or_else(|| {
                PerfError::Collection(format!(
                    "result artifact {} missing under {}",
                    def.artifact,
                    working_dir.display()
                ))
            })?;
            let value = extract_value(&artifact, def)?;
            self.records
                .entry(def.label.to_string())
                .or_insert_with(|| StatRecord {
                    def,
                    values: Vec::new(),
                })
                .values
                .push(value);
        }
        Ok(())
    }

    pub fn into_report(self) -> Vec<StatRecord> {
        ALL_STATS
            .iter()
            .filter_map(|def| self.records.get(def.label).cloned())
            .collect()
    }
}

fn find_artifact(working_dir: &Path, name: &str) -> Option<PathBuf> {
    WalkDir::new(working_dir)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| entry.ok())
        .find(|entry| entry.file_type().is_file() && entry.file_name().to_str() == Some(name))
        .map(|entry| entry.into_path())
}

// The last line matching the pattern wins: artifacts accumulate periodic
// progress lines and the final one is the run summary.
fn extract_value(artifact: &Path, def: &StatDefinition) -> Result<f64> {
    let data = fs::read_to_string(artifact)?;
    let line = data
        .lines()
        .filter(|line| line.contains(def.pattern))
        .next_back()
        .ok_or_else(|| {
            PerfError::Collection(format!(
                "statistic '{}' not found in {}",
                def.label,
                artifact.display()
            ))
        })?;
    let token = line.split_whitespace().nth(def.token).ok_or_else(|| {
        PerfError::Collection(format!(
            "statistic '{}' line '{}' in {} is missing its value field",
            def.label,
            line.trim(),
            artifact.display()
        ))
    })?;
    token.parse::<f64>().map_err(|_| {
        PerfError::Collection(format!(
            "statistic '{}' value '{}' in {} is not numeric",
            def.label,
            token,
            artifact.display()
        ))
    })
}

// Fail-fast gate, run before any process is spawned. Uniqueness is checked
// per flattened list: each batch entry's operations independently, so the
// same name reused by two different entries is legal.
pub fn validate_operations(
    direct: Option<&[String]>,
    batch: Option<&[BatchEntry]>,
) -> Result<()> {
    let mut lists: Vec<&[String]> = Vec::new();
    if let Some(entries) = batch {
        for entry in entries {
            lists.push(&entry.operations);
        }
    } else if let Some(ops) = direct {
        lists.push(ops);
    }

    for ops in &lists {
        let mut unique: Vec<&String> = Vec::new();
        for op in ops.iter() {
            if !unique.contains(&op) {
                unique.push(op);
            }
        }
        if unique.len() != ops.len() {
            return Err(PerfError::Validation(format!(
                "operations list {:?} contains duplicates",
                ops
            )));
        }
    }

    for ops in &lists {
        for op in ops.iter() {
            if !ALL_STATS.iter().any(|def| def.label == op.as_str()) {
                let mut labels: Vec<&str> = ALL_STATS.iter().map(|def| def.label).collect();
                labels.sort_unstable();
                return Err(PerfError::Validation(format!(
                    "operation '{}' does not match any known statistic; valid names are: {:?}",
                    op, labels
                )));
            }
        }
    }
    Ok(())
}

// Strictly sequential: entries and runs execute one after another, and the
// first failure of any kind aborts the remaining sequence.
pub fn run_suite(
    config: &RunConfig,
    batch: Option<&[BatchEntry]>,
    reuse: bool,
) -> Result<Vec<StatRecord>> {
    let mut reported = Vec::new();
    match batch {
        Some(entries) => {
            info!(entries = entries.len(), "running batch suite");
            for (batch_index, entry) in entries.iter().enumerate() {
                debug!(
                    batch_index,
                    arguments = ?entry.arguments,
                    operations = ?entry.operations,
                    "batch entry"
                );
                let collection = run_entry(
                    config,
                    batch_index,
                    Some(&entry.arguments),
                    Some(&entry.operations),
                    reuse,
                )?;
                reported.extend(collection.into_report());
            }
        }
        None => {
            let collection = run_entry(
                config,
                0,
                config.arguments.as_deref(),
                config.operations.as_deref(),
                reuse,
            )?;
            reported.extend(collection.into_report());
        }
    }
    Ok(reported)
}

fn run_entry(
    config: &RunConfig,
    batch_index: usize,
    extra_args: Option<&[String]>,
    operations: Option<&[String]>,
    reuse: bool,
) -> Result<StatCollection> {
    let mut stats = StatCollection::new(operations);
    for run_index in 0..config.run_max {
        let context = RunContext::new(config, batch_index, run_index, extra_args);
        if !reuse {
            info!(batch_index, run_index, home = %context.home_path.display(), "starting run");
            execute(&context.command_line)?;
            info!(batch_index, run_index, "completed run");
        }
        debug!(home = %context.home_path.display(), "collecting statistics");
        stats.collect_from(&context.home_path)?;
    }
    Ok(stats)
}

#[derive(Debug, Clone, Serialize)]
pub struct HostFacts {
    pub physical_cores: usize,
    pub logical_cores: usize,
    pub total_memory_bytes: u64,
    pub platform: String,
}

pub fn host_facts() -> HostFacts {
    let mut system = sysinfo::System::new();
    system.refresh_cpu_all();
    system.refresh_memory();
    let logical_cores = system.cpus().len();
    let physical_cores = system.physical_core_count().unwrap_or(logical_cores);
    let os = sysinfo::System::long_os_version()
        .unwrap_or_else(|| std::env::consts::OS.to_string());
    HostFacts {
        physical_cores,
        logical_cores,
        total_memory_bytes: system.total_memory(),
        platform: format!("{} {}", os, std::env::consts::ARCH),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GitFacts {
    pub hash: String,
    pub message: String,
    pub author: String,
    pub branch: String,
    pub files_changed: usize,
    pub num_commits: usize,
}

// A path outside any repository is an error, never an empty answer.
pub fn git_facts(root: &Path) -> Result<GitFacts> {
    let hash = git_output(root, &["rev-parse", "HEAD"])?;
    let message = git_output(root, &["log", "-1", "--format=%B"])?;
    let author = git_output(root, &["log", "-1", "--format=%an"])?;
    let branch = git_output(root, &["rev-parse", "--abbrev-ref", "HEAD"])?;
    let files_changed = git_output(root, &["diff", "--name-only"])?
        .lines()
        .filter(|line| !line.trim().is_empty())
        .count();
    let commits = git_output(root, &["rev-list", "--count", "HEAD"])?;
    let num_commits = commits
        .parse::<usize>()
        .map_err(|_| PerfError::Git(format!("unexpected rev-list count '{}'", commits)))?;
    Ok(GitFacts {
        hash,
        message,
        author,
        branch,
        files_changed,
        num_commits,
    })
}

fn git_output(root: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .arg("-C")
        .arg(root)
        .args(args)
        .output()
        .map_err(|e| PerfError::Git(format!("failed to launch git: {}", e)))?;
    if !output.status.success() {
        return Err(PerfError::Git(format!(
            "git {} failed in {}: {}",
            args.join(" "),
            root.display(),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

fn metric_values(stats: &[StatRecord], brief: bool) -> Vec<Value> {
    stats
        .iter()
        .filter(|record| !brief || record.def.brief)
        .map(|record| {
            if brief {
                json!({ "label": record.def.label, "value": record.aggregate() })
            } else {
                json!({
                    "label": record.def.label,
                    "description": record.def.description,
                    "value": record.aggregate(),
                    "values": record.values,
                })
            }
        })
        .collect()
}

// The brief payload is a one-element list: test identity plus the
// brief-flagged aggregated metrics.
pub fn brief_report(config: &RunConfig, stats: &[StatRecord]) -> Value {
    json!([{
        "info": { "test_name": config.test_name() },
        "metrics": metric_values(stats, true),
    }])
}

pub fn detailed_report(
    config: &RunConfig,
    stats: &[StatRecord],
    host: &HostFacts,
    git: Option<&GitFacts>,
) -> Result<Value> {
    let mut report = json!({
        "Test Name": config.test_name(),
        "config": serde_json::to_value(config)?,
        "metrics": metric_values(stats, false),
        "system": {
            "cpu_physical_cores": host.physical_cores,
            "cpu_logical_cores": host.logical_cores,
            "total_physical_memory_gb":
                host.total_memory_bytes as f64 / (1024.0 * 1024.0 * 1024.0),
            "platform": host.platform,
        },
    });
    if let Some(git) = git {
        report["git"] = json!({
            "head_commit": {
                "hash": git.hash,
                "message": git.message,
                "author": git.author,
            },
            "branch": { "name": git.branch },
            "stats": { "files_changed": git.files_changed },
            "num_commits": git.num_commits,
        });
    }
    Ok(report)
}

pub fn write_report(path: &Path, report: &Value) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let mut serialized = serde_json::to_string_pretty(report)?;
    serialized.push('\n');
    fs::write(path, serialized)?;
    Ok(())
}
