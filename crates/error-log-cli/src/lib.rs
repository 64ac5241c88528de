//! Command surface for the personal error log.
//!
//! Hosts embed the CLI through:
//! - [`run_cli`] for full parsed CLI execution.
//! - [`run_with_db`] for direct [`Command`] execution against a DB path.
//! - [`run_command`] for execution against an existing [`SqliteErrorLogStore`].

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use error_log_core::{
    parse_module_pair, parse_tag_list, Complexity, Environment, EnvironmentDetail,
    EnvironmentResolution, EnvironmentSnapshot, ErrorFilter, ErrorRecord, ErrorSummary,
    ModuleSet, NewErrorRecord, Status,
};
use error_log_store_sqlite::SqliteErrorLogStore;

pub mod probe;

pub use probe::PythonProbe;

#[derive(Debug, Parser)]
#[command(name = "errlog")]
#[command(about = "Personal error log with environment tracking")]
pub struct Cli {
    #[arg(long, env = "ERRLOG_DB", default_value = "./error_logger.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Create the database tables if they are missing.
    Init,
    Env {
        #[command(subcommand)]
        command: Box<EnvCommand>,
    },
    /// Record a new error.
    Log(LogArgs),
    List(ListArgs),
    Search(SearchArgs),
    Summary(JsonArgs),
}

#[derive(Debug, Subcommand)]
pub enum EnvCommand {
    /// Probe a Python interpreter and register its environment.
    Current(EnvCurrentArgs),
    /// Register an environment from explicit values.
    Register(EnvRegisterArgs),
    List(JsonArgs),
    Show(EnvShowArgs),
}

#[derive(Debug, Args)]
pub struct JsonArgs {
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct EnvCurrentArgs {
    #[arg(long, env = "ERRLOG_PYTHON", default_value = "python3")]
    python: String,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct EnvRegisterArgs {
    #[arg(long)]
    python_version: String,
    #[arg(long)]
    platform: Option<String>,
    #[arg(long = "module", value_name = "NAME=VERSION")]
    modules: Vec<String>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct EnvShowArgs {
    #[arg(long)]
    id: i64,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct LogArgs {
    #[arg(long)]
    name: String,
    #[arg(long)]
    description: String,
    #[arg(long)]
    error_type: Option<String>,
    #[arg(long)]
    traceback: Option<String>,
    #[arg(long)]
    fix: Option<String>,
    #[arg(long, value_enum, default_value_t = ComplexityArg::Low)]
    complexity: ComplexityArg,
    #[arg(long, value_enum, default_value_t = StatusArg::Open)]
    status: StatusArg,
    /// Comma-separated tags.
    #[arg(long)]
    tags: Option<String>,
    #[arg(long, conflicts_with = "current_env")]
    environment_id: Option<i64>,
    /// Link the error to the environment of `--python`.
    #[arg(long)]
    current_env: bool,
    #[arg(long, env = "ERRLOG_PYTHON", default_value = "python3")]
    python: String,
}

#[derive(Debug, Args)]
pub struct ListArgs {
    #[arg(long)]
    environment_id: Option<i64>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct SearchArgs {
    /// Case-insensitive match against name or description.
    #[arg(long)]
    term: Option<String>,
    #[arg(long = "status", value_enum)]
    statuses: Vec<StatusArg>,
    #[arg(long = "complexity", value_enum)]
    complexities: Vec<ComplexityArg>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ComplexityArg {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum StatusArg {
    Open,
    InProgress,
    Resolved,
    WontFix,
}

/// Executes the parsed top-level CLI command.
///
/// # Errors
/// Returns an error when the store cannot be opened or initialized, or the
/// command fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    run_with_db(&cli.db, cli.command)
}

/// Executes a command against the database at `db_path`.
///
/// # Errors
/// Returns an error when store open/initialize fails or the command fails.
pub fn run_with_db(db_path: &Path, command: Command) -> Result<()> {
    let mut store = SqliteErrorLogStore::open(db_path)?;
    store.initialize()?;
    run_command(command, &mut store)
}

/// Executes a command against an existing store handle.
///
/// # Errors
/// Returns an error when validation, probing, persistence or retrieval fails.
pub fn run_command(command: Command, store: &mut SqliteErrorLogStore) -> Result<()> {
    match command {
        Command::Init => {
            println!("error log ready");
            Ok(())
        }
        Command::Env { command } => run_env(*command, store),
        Command::Log(args) => {
            let environment_id = if args.current_env {
                let probe = PythonProbe::new(args.python.clone());
                Some(store.resolve_current_environment(&probe)?.environment_id)
            } else {
                args.environment_id
            };
            let input = build_new_error(args, environment_id);
            let record = store.save_error(&input)?;
            println!("{}", serde_json::to_string_pretty(&record)?);
            Ok(())
        }
        Command::List(args) => {
            let records = match args.environment_id {
                Some(environment_id) => store.list_by_environment(environment_id)?,
                None => store.list_all()?,
            };
            if args.json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else {
                print_error_table(&records);
            }
            Ok(())
        }
        Command::Search(args) => {
            let filter = build_filter(&args);
            let records = store.search(&filter)?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else {
                println!("found {} error(s)", records.len());
                print_error_table(&records);
            }
            Ok(())
        }
        Command::Summary(args) => {
            let summary = store.summary()?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                print_summary(&summary);
            }
            Ok(())
        }
    }
}

fn run_env(command: EnvCommand, store: &mut SqliteErrorLogStore) -> Result<()> {
    match command {
        EnvCommand::Current(args) => {
            let probe = PythonProbe::new(args.python);
            let resolution = store.resolve_current_environment(&probe)?;
            print_resolution(&resolution, args.json)
        }
        EnvCommand::Register(args) => {
            let snapshot = build_snapshot(&args)?;
            let resolution = store.resolve_or_create_environment(&snapshot)?;
            print_resolution(&resolution, args.json)
        }
        EnvCommand::List(args) => {
            let environments = store.list_environments()?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&environments)?);
            } else {
                print_environment_table(&environments);
            }
            Ok(())
        }
        EnvCommand::Show(args) => {
            let Some(detail) = store.environment_detail(args.id)? else {
                return Err(anyhow!("environment {} not found", args.id));
            };
            if args.json {
                println!("{}", serde_json::to_string_pretty(&detail)?);
            } else {
                print_environment_detail(&detail);
            }
            Ok(())
        }
    }
}

fn build_snapshot(args: &EnvRegisterArgs) -> Result<EnvironmentSnapshot> {
    let modules = args
        .modules
        .iter()
        .map(|raw| parse_module_pair(raw).map_err(|err| anyhow!(err.to_string())))
        .collect::<Result<ModuleSet>>()?;

    Ok(EnvironmentSnapshot {
        python_version: args.python_version.clone(),
        platform: args.platform.clone(),
        modules,
    })
}

fn build_new_error(args: LogArgs, environment_id: Option<i64>) -> NewErrorRecord {
    NewErrorRecord {
        error_name: args.name,
        description: args.description,
        error_type: non_blank(args.error_type),
        traceback: non_blank(args.traceback),
        fix: non_blank(args.fix),
        complexity: Some(map_complexity(args.complexity)),
        status: Some(map_status(args.status)),
        tags: args.tags.as_deref().map(parse_tag_list).unwrap_or_default(),
        environment_id,
    }
}

fn build_filter(args: &SearchArgs) -> ErrorFilter {
    ErrorFilter {
        term: args.term.clone(),
        statuses: args.statuses.iter().copied().map(map_status).collect::<BTreeSet<_>>(),
        complexities: args
            .complexities
            .iter()
            .copied()
            .map(map_complexity)
            .collect::<BTreeSet<_>>(),
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|item| !item.trim().is_empty())
}

fn map_complexity(value: ComplexityArg) -> Complexity {
    match value {
        ComplexityArg::Low => Complexity::Low,
        ComplexityArg::Medium => Complexity::Medium,
        ComplexityArg::High => Complexity::High,
        ComplexityArg::Critical => Complexity::Critical,
    }
}

fn map_status(value: StatusArg) -> Status {
    match value {
        StatusArg::Open => Status::Open,
        StatusArg::InProgress => Status::InProgress,
        StatusArg::Resolved => Status::Resolved,
        StatusArg::WontFix => Status::WontFix,
    }
}

fn print_resolution(resolution: &EnvironmentResolution, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(resolution)?);
    } else if resolution.created {
        println!("environment {} (new)", resolution.environment_id);
    } else {
        println!("environment {} (existing)", resolution.environment_id);
    }
    Ok(())
}

fn print_error_table(records: &[ErrorRecord]) {
    if records.is_empty() {
        println!("no errors logged");
        return;
    }

    println!(
        "{:<6} {:<12} {:<10} {:<10} name",
        "id", "status", "complexity", "python"
    );
    for record in records {
        println!(
            "{:<6} {:<12} {:<10} {:<10} {}",
            record.id,
            record.status,
            record.complexity.map_or("-", Complexity::as_str),
            record
                .environment
                .as_ref()
                .map_or("-", |env| env.python_version.as_str()),
            record.error_name
        );
    }
}

fn print_environment_table(environments: &[Environment]) {
    if environments.is_empty() {
        println!("no environments registered");
        return;
    }

    println!("{:<6} {:<10} {:<8} platform", "id", "python", "modules");
    for env in environments {
        println!(
            "{:<6} {:<10} {:<8} {}",
            env.id,
            env.python_version,
            env.modules.len(),
            env.platform.as_deref().unwrap_or("-")
        );
    }
}

fn print_environment_detail(detail: &EnvironmentDetail) {
    let env = &detail.environment;
    println!("environment_id={}", env.id);
    println!("python_version={}", env.python_version);
    println!("platform={}", env.platform.as_deref().unwrap_or("-"));
    println!("modules={}", env.modules.len());
    for (name, version) in &env.modules {
        println!("  {name}=={version}");
    }
    println!("errors={}", detail.errors.len());
    for record in &detail.errors {
        println!("  - {} ({})", record.error_name, record.status);
    }
}

fn print_summary(summary: &ErrorSummary) {
    println!("total={}", summary.total);
    println!("open={}", summary.open);
    println!("resolved={}", summary.resolved);
    println!("critical={}", summary.critical);
}
