// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use anyhow::{Context, Result, bail};
use blake3::Hasher;
use clap::{Args, Parser, Subcommand, ValueEnum};
use polyfs_core::{ErrorKind, Features, FileSystem, FsConfig, FsError, MemFs, OsType, OpenFlags, tree};
use rand::{Rng, RngCore, SeedableRng, rngs::SmallRng};
use serde::Serialize;
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Write};
use std::path::PathBuf;
use std::time::Instant;
use tracing::{debug, info, warn};

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = cli.log_level.unwrap_or_default().to_string();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let config = load_config(cli.config.as_ref(), cli.os)?;
    match cli.command {
        Command::Run(args) => {
            let context = run_workload(config, args)?;
            if let Some(path) = context.json_output.clone() {
                serde_json::to_writer_pretty(File::create(&path)?, &context.report)
                    .with_context(|| format!("failed to write report {}", path.display()))?;
            }
            write_json_to_stdout(&context.report)?;
            if context.report.status != "passed" {
                bail!("stress run failed: {:?}", context.report.fatal_errors);
            }
        }
        Command::Tree(args) => {
            let rendered = render_demo_tree(config, args)?;
            let mut out = io::stdout().lock();
            out.write_all(rendered.as_bytes())?;
            out.flush()?;
        }
    }
    Ok(())
}

fn write_json_to_stdout<T: serde::Serialize>(value: &T) -> Result<()> {
    let mut out = io::stdout().lock();
    writeln!(out, "{}", serde_json::to_string_pretty(value)?)?;
    out.flush()?;
    Ok(())
}

#[derive(Parser)]
#[command(author, version, about = "PolyFS multi-user stress workload runner")]
struct Cli {
    /// Log verbosity level
    #[arg(long, value_enum, global = true, help = "Log verbosity level (default: info)")]
    log_level: Option<CliLogLevel>,

    /// JSON file with the filesystem configuration
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emulated operating system, overriding the configuration file
    #[arg(long, value_enum, global = true)]
    os: Option<OsArg>,

    #[command(subcommand)]
    command: Command,
}

#[derive(ValueEnum, Clone, Copy, Debug, Default)]
enum CliLogLevel {
    /// Only error conditions
    Error,
    /// Errors and warnings
    Warn,
    /// Errors, warnings, and informational messages
    #[default]
    Info,
    /// All above plus debug information
    Debug,
    /// All above plus detailed tracing
    Trace,
}

impl std::fmt::Display for CliLogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CliLogLevel::Error => write!(f, "error"),
            CliLogLevel::Warn => write!(f, "warn"),
            CliLogLevel::Info => write!(f, "info"),
            CliLogLevel::Debug => write!(f, "debug"),
            CliLogLevel::Trace => write!(f, "trace"),
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum OsArg {
    Linux,
    Windows,
}

impl From<OsArg> for OsType {
    fn from(os: OsArg) -> Self {
        match os {
            OsArg::Linux => OsType::Linux,
            OsArg::Windows => OsType::Windows,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Concurrent users creating directories and files
    Run(RunArgs),
    /// Build a small multi-user tree and print it
    Tree(TreeArgs),
}

#[derive(Args, Clone)]
struct RunArgs {
    /// Number of simulated users, one worker thread each
    #[arg(long, default_value_t = 100)]
    users: usize,

    /// Files each user creates in its own directory
    #[arg(long, default_value_t = 8)]
    files_per_user: usize,

    /// Maximum file size in KiB
    #[arg(long, default_value_t = 16)]
    max_file_size_kib: u64,

    /// Optional path for writing the JSON report
    #[arg(long)]
    json_output: Option<PathBuf>,
}

#[derive(Args, Clone)]
struct TreeArgs {
    /// Number of users with a populated home directory
    #[arg(long, default_value_t = 3)]
    users: usize,
}

fn load_config(path: Option<&PathBuf>, os: Option<OsArg>) -> Result<FsConfig> {
    let mut config = match path {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config {}", path.display()))?;
            serde_json::from_str::<FsConfig>(&text)
                .with_context(|| format!("failed to parse config {}", path.display()))?
        }
        None => FsConfig::default().with_features(Features::all() - Features::READ_ONLY - Features::REAL_FS),
    };
    if let Some(os) = os {
        config = config.with_os_type(os.into());
    }
    if !config.features.contains(Features::IDENTITY_MGR) {
        bail!("the stress harness needs {} to simulate users", Features::IDENTITY_MGR);
    }
    Ok(config)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    Mkdir,
    Create,
    Write,
    Read,
    Rename,
    Delete,
}

#[derive(Default, Serialize, Clone)]
struct OperationStats {
    mkdir: u64,
    create: u64,
    write: u64,
    read: u64,
    rename: u64,
    delete: u64,
}

impl OperationStats {
    fn increment(&mut self, op: Operation) {
        match op {
            Operation::Mkdir => self.mkdir += 1,
            Operation::Create => self.create += 1,
            Operation::Write => self.write += 1,
            Operation::Read => self.read += 1,
            Operation::Rename => self.rename += 1,
            Operation::Delete => self.delete += 1,
        }
    }

    fn total(&self) -> u64 {
        self.mkdir + self.create + self.write + self.read + self.rename + self.delete
    }
}

impl std::ops::AddAssign<&OperationStats> for OperationStats {
    fn add_assign(&mut self, other: &OperationStats) {
        self.mkdir += other.mkdir;
        self.create += other.create;
        self.write += other.write;
        self.read += other.read;
        self.rename += other.rename;
        self.delete += other.delete;
    }
}

#[derive(Debug, Serialize, Clone)]
struct TreeFingerprint {
    digest: String,
    file_count: u64,
    dir_count: u64,
}

#[derive(Serialize, Clone)]
struct IntegritySummary {
    root: String,
    expected_entries: usize,
    found_entries: usize,
    before: TreeFingerprint,
    after: TreeFingerprint,
}

#[derive(Serialize, Clone)]
struct RunReport {
    phase: String,
    os: String,
    features: String,
    users: usize,
    files_per_user: usize,
    max_file_size_kib: u64,
    start_time: String,
    end_time: String,
    elapsed_ms: u128,
    operations: OperationStats,
    total_ops: u64,
    benign_errors: HashMap<String, u64>,
    fatal_errors: HashMap<String, u64>,
    integrity: IntegritySummary,
    status: String,
}

struct RunContext {
    report: RunReport,
    json_output: Option<PathBuf>,
}

const STRESS_GROUP: &str = "stress";

fn run_workload(config: FsConfig, args: RunArgs) -> Result<RunContext> {
    let fs = MemFs::new(config).context("failed to create in-memory filesystem")?;
    let os = fs.os_type();
    let root = os.join(&[os.root(), "a"]);

    fs.mkdir(&root, 0o777).with_context(|| format!("failed to create {root}"))?;
    fs.chmod(&root, 0o777).with_context(|| format!("failed to open up {root}"))?;

    let idm = fs.idm();
    idm.add_group(STRESS_GROUP).context("failed to add stress group")?;
    let mut views = Vec::with_capacity(args.users);
    for id in 0..args.users {
        let name = format!("user{id}");
        idm.add_user(&name, STRESS_GROUP)
            .with_context(|| format!("failed to add user {name}"))?;
        views.push(fs.with_user(&name)?);
    }

    let before_fp = compute_tree_fingerprint(&fs, &root)?;
    info!(
        users = args.users,
        files_per_user = args.files_per_user,
        root = %root,
        os = %os,
        "multi-user workload starting"
    );

    let start_time = chrono::Utc::now();
    let started = Instant::now();

    let mut handles = Vec::with_capacity(args.users);
    for (id, view) in views.into_iter().enumerate() {
        let worker = Worker::new(id, view, root.clone(), args.files_per_user, args.max_file_size_kib);
        handles.push(std::thread::spawn(move || worker.run()));
    }

    let mut aggregate_stats = OperationStats::default();
    let mut benign_errors: HashMap<String, u64> = HashMap::new();
    let mut fatal_errors: HashMap<String, u64> = HashMap::new();

    for handle in handles {
        match handle.join() {
            Ok(result) => {
                aggregate_stats += &result.stats;
                merge_counts(&mut benign_errors, &result.benign_errors);
                merge_counts(&mut fatal_errors, &result.fatal_errors);
            }
            Err(panic) => {
                let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "unknown panic".to_string()
                };
                *fatal_errors.entry("thread_panic".to_string()).or_insert(0) += 1;
                warn!("worker thread panicked: {}", msg);
            }
        }
    }

    let elapsed = started.elapsed();
    let end_time = chrono::Utc::now();

    // One directory per user plus the shared one everybody races to create.
    let expected_entries = args.users + 1;
    let entries = fs.read_dir(&root).with_context(|| format!("failed to list {root}"))?;
    if entries.len() != expected_entries {
        *fatal_errors.entry("entry_count".to_string()).or_insert(0) += 1;
        warn!(expected = expected_entries, found = entries.len(), "unexpected entry count");
    }
    let after_fp = compute_tree_fingerprint(&fs, &root)?;

    let status = if fatal_errors.is_empty() {
        "passed".to_string()
    } else {
        "failed".to_string()
    };
    info!(status = %status, total_ops = aggregate_stats.total(), elapsed_ms = elapsed.as_millis(), "workload finished");

    let report = RunReport {
        phase: "multi-user".to_string(),
        os: os.to_string(),
        features: fs.features().to_string(),
        users: args.users,
        files_per_user: args.files_per_user,
        max_file_size_kib: args.max_file_size_kib,
        start_time: start_time.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        end_time: end_time.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        elapsed_ms: elapsed.as_millis(),
        operations: aggregate_stats.clone(),
        total_ops: aggregate_stats.total(),
        benign_errors,
        fatal_errors,
        integrity: IntegritySummary {
            root,
            expected_entries,
            found_entries: entries.len(),
            before: before_fp,
            after: after_fp,
        },
        status,
    };

    Ok(RunContext {
        report,
        json_output: args.json_output,
    })
}

fn merge_counts(target: &mut HashMap<String, u64>, source: &HashMap<String, u64>) {
    for (key, value) in source {
        *target.entry(key.clone()).or_insert(0) += value;
    }
}

struct Worker {
    id: usize,
    fs: MemFs,
    root: String,
    files: usize,
    max_file_size_kib: u64,
    rng_seed: u64,
}

struct WorkerResult {
    stats: OperationStats,
    benign_errors: HashMap<String, u64>,
    fatal_errors: HashMap<String, u64>,
}

enum OperationResult {
    Completed,
    Benign { label: String },
    Fatal { label: String, detail: String },
}

impl Worker {
    fn new(id: usize, fs: MemFs, root: String, files: usize, max_file_size_kib: u64) -> Self {
        let seed_base = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default() as u64;
        let pid_component = (std::process::id() as u64) << 32;
        let rng_seed = seed_base ^ pid_component ^ (id as u64);
        Self {
            id,
            fs,
            root,
            files,
            max_file_size_kib,
            rng_seed,
        }
    }

    fn path(&self, elems: &[&str]) -> String {
        let mut all = Vec::with_capacity(elems.len() + 1);
        all.push(self.root.as_str());
        all.extend_from_slice(elems);
        self.fs.join(&all)
    }

    fn run(self) -> WorkerResult {
        let mut rng = SmallRng::seed_from_u64(self.rng_seed);
        let mut stats = OperationStats::default();
        let mut benign_errors: HashMap<String, u64> = HashMap::new();
        let mut fatal_errors: HashMap<String, u64> = HashMap::new();

        let mut record = |op: Operation, result: OperationResult| match result {
            OperationResult::Completed => stats.increment(op),
            OperationResult::Benign { label } => {
                *benign_errors.entry(label).or_insert(0) += 1;
            }
            OperationResult::Fatal { label, detail } => {
                *fatal_errors.entry(label.clone()).or_insert(0) += 1;
                debug!("worker {} fatal {}: {}", self.id, label, detail);
            }
        };

        record(Operation::Mkdir, self.mkdir_shared());

        let dir_name = format!("user_{:08}", self.id);
        let dir = self.path(&[dir_name.as_str()]);
        let result = self.mkdir_own(&dir);
        let dir_ok = matches!(result, OperationResult::Completed);
        record(Operation::Mkdir, result);
        if !dir_ok {
            return WorkerResult {
                stats,
                benign_errors,
                fatal_errors,
            };
        }

        for seq in 0..self.files {
            let file_name = format!("file-{seq:04}.bin");
            let file_path = self.fs.join(&[dir.as_str(), file_name.as_str()]);
            let payload = self.payload(&mut rng);

            let created = self.create_file(&file_path, &payload);
            let ok = matches!(created, OperationResult::Completed);
            record(Operation::Create, created);
            if !ok {
                continue;
            }
            record(Operation::Write, OperationResult::Completed);
            record(Operation::Read, self.verify_file(&file_path, &payload));

            if seq % 2 == 0 {
                let done_name = format!("file-{seq:04}.done");
                let renamed = self.fs.join(&[dir.as_str(), done_name.as_str()]);
                record(Operation::Rename, self.rename_file(&file_path, &renamed));
            } else if seq % 3 == 0 {
                record(Operation::Delete, self.delete_file(&file_path));
            }
        }

        WorkerResult {
            stats,
            benign_errors,
            fatal_errors,
        }
    }

    fn payload(&self, rng: &mut SmallRng) -> Vec<u8> {
        let size_kib = self.max_file_size_kib.max(1);
        let size_bytes = rng.gen_range(1..=size_kib * 1024) as usize;
        let mut data = vec![0u8; size_bytes];
        rng.fill_bytes(&mut data);
        data
    }

    /// Every worker races to create the same directory; exactly one wins.
    fn mkdir_shared(&self) -> OperationResult {
        match self.fs.mkdir(&self.path(&["shared"]), 0o777) {
            Ok(()) => OperationResult::Completed,
            Err(err) => classify_error("mkdir_shared", &err),
        }
    }

    fn mkdir_own(&self, dir: &str) -> OperationResult {
        match self.fs.mkdir(dir, 0o755) {
            Ok(()) => OperationResult::Completed,
            Err(err) => OperationResult::Fatal {
                label: "mkdir_own".into(),
                detail: err.to_string(),
            },
        }
    }

    fn create_file(&self, path: &str, data: &[u8]) -> OperationResult {
        let flags = OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::EXCL;
        let handle = match self.fs.open_file(path, flags, 0o644) {
            Ok(handle) => handle,
            Err(err) => return classify_error("create", &err),
        };
        let written = self.fs.write(handle, data);
        let closed = self.fs.close(handle);
        match written.and(closed) {
            Ok(()) => OperationResult::Completed,
            Err(err) => classify_error("write", &err),
        }
    }

    fn verify_file(&self, path: &str, expected: &[u8]) -> OperationResult {
        match self.fs.read_file(path) {
            Ok(content) if content == expected => OperationResult::Completed,
            Ok(content) => OperationResult::Fatal {
                label: "content_mismatch".into(),
                detail: format!("{path}: expected {} bytes, read {}", expected.len(), content.len()),
            },
            Err(err) => classify_error("read", &err),
        }
    }

    fn rename_file(&self, from: &str, to: &str) -> OperationResult {
        match self.fs.rename(from, to) {
            Ok(()) => OperationResult::Completed,
            Err(err) => classify_error("rename", &err),
        }
    }

    fn delete_file(&self, path: &str) -> OperationResult {
        match self.fs.unlink(path) {
            Ok(()) => OperationResult::Completed,
            Err(err) => classify_error("delete", &err),
        }
    }
}

fn classify_error(op: &str, err: &FsError) -> OperationResult {
    match (op, err.kind()) {
        ("mkdir_shared", ErrorKind::AlreadyExists) => OperationResult::Benign {
            label: "mkdir_shared_exists".into(),
        },
        (_, kind) => OperationResult::Fatal {
            label: format!("{op}_{kind:?}").to_lowercase(),
            detail: err.to_string(),
        },
    }
}

/// Hash of every path and file content below `root`, in directory order.
fn compute_tree_fingerprint<F: FileSystem + ?Sized>(fs: &F, root: &str) -> Result<TreeFingerprint> {
    let mut hasher = Hasher::new();
    let mut file_count = 0u64;
    let mut dir_count = 0u64;
    let mut pending = vec![root.to_string()];

    while let Some(dir) = pending.pop() {
        let entries = fs.read_dir(&dir).with_context(|| format!("failed to list {dir}"))?;
        for entry in entries.into_iter().rev() {
            let path = fs.join(&[dir.as_str(), entry.name.as_str()]);
            hasher.update(path[root.len()..].as_bytes());
            if entry.is_dir() {
                dir_count += 1;
                pending.push(path);
            } else {
                file_count += 1;
                let content = fs.read_file(&path).with_context(|| format!("failed to read {path}"))?;
                hasher.update(&content);
            }
        }
    }

    Ok(TreeFingerprint {
        digest: format!("blake3:{}", hasher.finalize().to_hex()),
        file_count,
        dir_count,
    })
}

fn render_demo_tree(config: FsConfig, args: TreeArgs) -> Result<String> {
    let fs = MemFs::new(config).context("failed to create in-memory filesystem")?;
    let os = fs.os_type();
    let idm = fs.idm();
    idm.add_group("staff").context("failed to add group staff")?;

    for id in 0..args.users {
        let name = format!("user{id}");
        let user = idm.add_user(&name, "staff").with_context(|| format!("failed to add user {name}"))?;
        fs.mkdir_all(&os.dir(&fs.home_dir_user(&name)), 0o755)?;
        let home = fs.create_home_dir(&user)?;

        let view = fs.with_user(&name)?;
        view.write_file(&os.join(&[home.as_str(), "notes.txt"]), name.as_bytes(), 0o644)?;
        view.mkdir(&os.join(&[home.as_str(), "projects"]), 0o750)?;
        if fs.has_feature(Features::SYMLINK) {
            view.symlink("projects", &os.join(&[home.as_str(), "current"]))?;
        }
    }

    let mut out = String::new();
    let stats = tree::render(&fs, os.root(), &mut out)?;
    debug!(dirs = stats.dirs, files = stats.files, "rendered demo tree");
    Ok(out)
}
