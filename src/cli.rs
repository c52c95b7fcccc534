//! CLI argument parsing and command handlers.
//!
//! Handlers stay thin: they resolve the store root, take the job lock for
//! anything that mutates, and delegate to [`JobStore`].
use crate::jobs::JobStore;
use crate::record::{self, MeasurementRow};
use crate::runlog::{self, RunLog, WarningInput, WarningLevel};
use crate::session;
use crate::util::display_path;
use crate::value::FieldValue;
use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Environment variable naming the store root when `--root` is absent.
pub const ROOT_ENV: &str = "JOBSTORE_ROOT";

#[derive(Parser, Debug)]
#[command(
    name = "jobstore",
    version,
    about = "Single-source-of-truth job state store",
    after_help = "Examples:\n  jobstore ensure --wo WO-100 --line L1\n  jobstore record --job <id> --field result=PASS --decimal torque_nm=12.50\n  jobstore ingest --job <id> --slot overview shot.png shot.jpg\n  jobstore hash --job <id> --full\n  jobstore status --job <id> --json",
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct RootArgs {
    /// Store root (defaults to $JOBSTORE_ROOT, then the user data directory)
    #[arg(long, value_name = "DIR", global = true)]
    pub root: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    Ensure(EnsureArgs),
    Record(RecordArgs),
    Ingest(IngestArgs),
    Override(OverrideArgs),
    Hash(HashArgs),
    Warn(WarnArgs),
    Status(StatusArgs),
    BindSession(BindSessionArgs),
    ResolveSession(SessionArgs),
    UnbindSession(SessionArgs),
}

#[derive(Args, Debug)]
#[command(about = "Create or reopen the job for a work order line")]
pub struct EnsureArgs {
    /// Work order number
    #[arg(long, value_name = "WO")]
    pub wo: String,

    /// Line within the work order
    #[arg(long, value_name = "LINE")]
    pub line: String,
}

#[derive(Args, Debug)]
#[command(about = "Record field values and measurements")]
pub struct RecordArgs {
    #[arg(long, value_name = "JOB_ID")]
    pub job: String,

    /// Text field (repeatable)
    #[arg(long = "field", value_name = "KEY=VALUE")]
    pub fields: Vec<String>,

    /// Exact decimal field (repeatable)
    #[arg(long = "decimal", value_name = "KEY=VALUE")]
    pub decimals: Vec<String>,

    /// JSON array of measurement rows; replaces existing rows
    #[arg(long, value_name = "PATH")]
    pub measurements: Option<PathBuf>,
}

#[derive(Args, Debug)]
#[command(about = "Ingest candidate photos into a slot")]
pub struct IngestArgs {
    #[arg(long, value_name = "JOB_ID")]
    pub job: String,

    #[arg(long, value_name = "SLOT")]
    pub slot: String,

    /// Existing run to log warnings to (a new run is created when needed)
    #[arg(long, value_name = "RUN_ID")]
    pub run: Option<String>,

    /// Candidate files
    #[arg(required = true, value_name = "FILE")]
    pub files: Vec<PathBuf>,
}

#[derive(Args, Debug)]
#[command(about = "Proceed without evidence for a slot that allows override")]
pub struct OverrideArgs {
    #[arg(long, value_name = "JOB_ID")]
    pub job: String,

    #[arg(long, value_name = "SLOT")]
    pub slot: String,

    #[arg(long)]
    pub reason: String,

    #[arg(long)]
    pub user: String,

    #[arg(long, value_name = "RUN_ID")]
    pub run: Option<String>,
}

#[derive(Args, Debug)]
#[command(about = "Print the packet hash of a job")]
pub struct HashArgs {
    #[arg(long, value_name = "JOB_ID")]
    pub job: String,

    /// Include free-text fields
    #[arg(long)]
    pub full: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum LevelArg {
    Info,
    Warning,
    Error,
}

impl From<LevelArg> for WarningLevel {
    fn from(level: LevelArg) -> Self {
        match level {
            LevelArg::Info => WarningLevel::Info,
            LevelArg::Warning => WarningLevel::Warning,
            LevelArg::Error => WarningLevel::Error,
        }
    }
}

#[derive(Args, Debug)]
#[command(about = "Append a warning to a run log")]
pub struct WarnArgs {
    #[arg(long, value_name = "JOB_ID")]
    pub job: String,

    /// Existing run (a new run is created when absent)
    #[arg(long, value_name = "RUN_ID")]
    pub run: Option<String>,

    #[arg(long, value_enum, default_value = "warning")]
    pub level: LevelArg,

    #[arg(long)]
    pub code: String,

    #[arg(long = "action", value_name = "ACTION_ID")]
    pub action_id: String,

    #[arg(long = "subject", value_name = "FIELD_OR_SLOT")]
    pub field_or_slot: String,

    #[arg(long = "original", value_name = "VALUE")]
    pub original_value: String,

    #[arg(long = "resolved", value_name = "VALUE")]
    pub resolved_value: String,

    #[arg(long)]
    pub message: String,
}

#[derive(Args, Debug)]
#[command(about = "Summarize a job")]
pub struct StatusArgs {
    #[arg(long, value_name = "JOB_ID")]
    pub job: String,

    /// Emit machine-readable JSON output
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
#[command(about = "Bind a session to a job")]
pub struct BindSessionArgs {
    #[arg(long, value_name = "SESSION_ID")]
    pub session: String,

    #[arg(long, value_name = "JOB_ID")]
    pub job: String,
}

#[derive(Args, Debug)]
pub struct SessionArgs {
    #[arg(long, value_name = "SESSION_ID")]
    pub session: String,
}

/// Store root: `--root`, then `$JOBSTORE_ROOT`, then the user data directory.
pub fn resolve_root(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(root) = explicit {
        return Ok(root.to_path_buf());
    }
    if let Some(root) = std::env::var_os(ROOT_ENV).filter(|value| !value.is_empty()) {
        return Ok(PathBuf::from(root));
    }
    dirs::data_dir()
        .map(|dir| dir.join("jobstore"))
        .ok_or_else(|| anyhow!("no store root; pass --root or set {ROOT_ENV}"))
}

pub fn run(args: RootArgs) -> Result<()> {
    let root = resolve_root(args.root.as_deref())?;
    let store = JobStore::open(&root)
        .with_context(|| format!("open store at {}", root.display()))?;
    match args.command {
        Command::Ensure(args) => run_ensure(&store, args),
        Command::Record(args) => run_record(&store, args),
        Command::Ingest(args) => run_ingest(&store, args),
        Command::Override(args) => run_override(&store, args),
        Command::Hash(args) => run_hash(&store, args),
        Command::Warn(args) => run_warn(&store, args),
        Command::Status(args) => run_status(&store, args),
        Command::BindSession(args) => {
            session::bind(store.root(), &store.config().lock, &args.session, &args.job)?;
            println!("{} -> {}", args.session, args.job);
            Ok(())
        }
        Command::ResolveSession(args) => {
            println!("{}", session::resolve(store.root(), &args.session)?);
            Ok(())
        }
        Command::UnbindSession(args) => {
            let job_id = session::unbind(store.root(), &store.config().lock, &args.session)?;
            println!("unbound {} from {job_id}", args.session);
            Ok(())
        }
    }
}

fn run_ensure(store: &JobStore, args: EnsureArgs) -> Result<()> {
    let (job_dir, job_id) = store.ensure_job(&args.wo, &args.line)?;
    println!("{job_id}");
    tracing::info!(job_dir = %display_path(&job_dir, Some(store.root())), "job ready");
    Ok(())
}

fn run_record(store: &JobStore, args: RecordArgs) -> Result<()> {
    let job_dir = store.existing_job_dir(&args.job)?;
    let mut fields = BTreeMap::new();
    for pair in &args.fields {
        let (key, value) = split_pair(pair)?;
        fields.insert(key.to_string(), FieldValue::text(value));
    }
    for pair in &args.decimals {
        let (key, value) = split_pair(pair)?;
        fields.insert(key.to_string(), FieldValue::decimal(value)?);
    }
    let measurements = args
        .measurements
        .as_deref()
        .map(read_measurements)
        .transpose()?;
    let record = store.with_lock(&job_dir, |lock| {
        store.record_fields(&job_dir, lock, fields, measurements)
    })?;
    println!("{}", record.packet_hash.unwrap_or_default());
    Ok(())
}

fn run_ingest(store: &JobStore, args: IngestArgs) -> Result<()> {
    let job_dir = store.existing_job_dir(&args.job)?;
    let mut run = open_run_arg(&job_dir, args.run.as_deref())?;
    let outcome = store.with_lock(&job_dir, |lock| {
        store.ingest_photo(&job_dir, lock, &args.slot, &args.files, &mut run)
    })?;
    println!("{}", outcome.mapping.stored_path);
    for archived in &outcome.archived {
        println!("archived {}", display_path(archived, Some(&job_dir)));
    }
    if let Some(run) = &run {
        if outcome.selection.is_ambiguous() {
            eprintln!("warning: ambiguous slot match logged to run {}", run.run_id());
        }
    }
    Ok(())
}

fn run_override(store: &JobStore, args: OverrideArgs) -> Result<()> {
    let job_dir = store.existing_job_dir(&args.job)?;
    let mut run = open_run_arg(&job_dir, args.run.as_deref())?;
    store.with_lock(&job_dir, |lock| {
        store.record_slot_override(&job_dir, lock, &args.slot, &args.reason, &args.user, &mut run)
    })?;
    if let Some(run) = &run {
        println!("{}", run.run_id());
    }
    Ok(())
}

fn run_hash(store: &JobStore, args: HashArgs) -> Result<()> {
    let job_dir = store.existing_job_dir(&args.job)?;
    let record = record::load(&job_dir)?;
    let hash = if args.full {
        store.compute_full_hash(&record)?
    } else {
        store.compute_identity_hash(&record)?
    };
    println!("{hash}");
    Ok(())
}

fn run_warn(store: &JobStore, args: WarnArgs) -> Result<()> {
    let job_dir = store.existing_job_dir(&args.job)?;
    let warning = WarningInput {
        level: args.level.into(),
        code: args.code,
        action_id: args.action_id,
        field_or_slot: args.field_or_slot,
        original_value: args.original_value,
        resolved_value: args.resolved_value,
        message: args.message,
    };
    let run_id = store.with_lock(&job_dir, |lock| {
        let mut run = match args.run.as_deref() {
            Some(run_id) => runlog::load_run(&job_dir, run_id)?,
            None => runlog::create_run(&job_dir)?,
        };
        store.log_warning(&job_dir, lock, &mut run, warning)?;
        Ok(run.run_id().to_string())
    })?;
    println!("{run_id}");
    Ok(())
}

fn run_status(store: &JobStore, args: StatusArgs) -> Result<()> {
    let status = store.status(&args.job)?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }
    println!("job: {}", status.job_id);
    println!("work order: {} line {}", status.record.wo_no, status.record.line);
    println!("identity hash: {}", status.identity_hash);
    println!("full hash: {}", status.full_hash);
    println!("fields: {}", status.record.fields.len());
    println!("measurement rows: {}", status.record.measurements.len());
    for (slot, mapping) in &status.record.photo_slots {
        println!("slot {slot}: {}", mapping.stored_path);
    }
    for (slot, decision) in &status.record.slot_overrides {
        println!("slot {slot}: override by {} ({})", decision.user, decision.reason);
    }
    if status.missing_slots.is_empty() {
        println!("required slots: complete");
    } else {
        println!("required slots missing: {}", status.missing_slots.join(", "));
    }
    println!("runs: {}", status.runs.len());
    if let Some(holder) = &status.lock_holder {
        println!("locked by pid {} on {}", holder.owner_pid, holder.owner_host);
    }
    Ok(())
}

fn open_run_arg(job_dir: &Path, run_id: Option<&str>) -> Result<Option<RunLog>> {
    run_id
        .map(|run_id| runlog::load_run(job_dir, run_id))
        .transpose()
        .map_err(Into::into)
}

fn split_pair(pair: &str) -> Result<(&str, &str)> {
    let (key, value) = pair
        .split_once('=')
        .ok_or_else(|| anyhow!("expected KEY=VALUE, got {pair:?}"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(anyhow!("empty field name in {pair:?}"));
    }
    Ok((key, value))
}

fn read_measurements(path: &Path) -> Result<Vec<MeasurementRow>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("read measurements {}", path.display()))?;
    let rows: Vec<serde_json::Map<String, serde_json::Value>> = serde_json::from_str(&text)
        .with_context(|| format!("parse measurements {}", path.display()))?;
    rows.iter()
        .map(|row| {
            row.iter()
                .map(|(column, value)| Ok((column.clone(), FieldValue::from_json(value)?)))
                .collect::<Result<MeasurementRow>>()
        })
        .collect()
}
