use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use agent_runs_contract::{load_contracts_from_path, ContractRegistry};
use agent_runs_domain::{DateTimeUtc, RunId, RunStatus, SubjectId, SubjectState, TaskKind, TenantId};
use agent_runs_engine::{
    Clock, EngineConfig, PoolOptions, RunEngine, SystemClock, TaskRegistry, WorkerPool,
};
use agent_runs_store_core::{RunFilter, RunLedger, SubjectStateSource};
use agent_runs_store_sqlite::SqliteLedger;
use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "agent-runs")]
#[command(about = "Tenant-scoped agent runs with approval-gated mutations")]
struct Cli {
    #[arg(long, global = true, env = "AGENT_RUNS_DB", default_value = "agent-runs.sqlite")]
    db: PathBuf,
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    contracts: Option<PathBuf>,
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
enum Commands {
    Migrate,
    Submit(SubmitArgs),
    Execute(ExecuteArgs),
    Approve(DecisionArgs),
    Reject(RejectArgs),
    Apply(DecisionArgs),
    Plan(PlanArgs),
    Runs(RunsArgs),
    Show(RunRef),
    Events(RunIdArg),
    Subject(SubjectArgs),
    Checklist(ChecklistArgs),
    Mutations(SubjectRef),
    Work(WorkArgs),
    Sweep,
    ReplayAudit(RunIdArg),
    Contracts,
}

#[derive(Debug, Args)]
struct SubmitArgs {
    #[arg(long)]
    tenant: i64,
    #[arg(long)]
    kind: String,
    #[arg(long)]
    subject: Option<i64>,
    #[arg(long)]
    payload: Option<String>,
    #[arg(long)]
    idempotency_key: Option<String>,
}

#[derive(Debug, Args)]
struct ExecuteArgs {
    #[arg(long)]
    tenant: i64,
    #[arg(long)]
    run_id: String,
    /// Defaults to the next attempt.
    #[arg(long)]
    attempt: Option<u32>,
}

#[derive(Debug, Args)]
struct DecisionArgs {
    #[arg(long)]
    tenant: i64,
    #[arg(long)]
    run_id: String,
    #[arg(long)]
    actor: String,
}

#[derive(Debug, Args)]
struct RejectArgs {
    #[arg(long)]
    tenant: i64,
    #[arg(long)]
    run_id: String,
    #[arg(long)]
    actor: String,
    #[arg(long, default_value = "")]
    reason: String,
}

#[derive(Debug, Args)]
struct PlanArgs {
    #[arg(long)]
    tenant: i64,
    #[arg(long)]
    subject: i64,
    #[arg(long, default_value_t = false)]
    submit: bool,
}

#[derive(Debug, Args)]
struct RunsArgs {
    #[arg(long)]
    tenant: Option<i64>,
    #[arg(long)]
    status: Option<String>,
    #[arg(long)]
    subject: Option<i64>,
    #[arg(long)]
    limit: Option<u32>,
}

#[derive(Debug, Args)]
struct RunRef {
    #[arg(long)]
    tenant: i64,
    #[arg(long)]
    run_id: String,
}

#[derive(Debug, Args)]
struct RunIdArg {
    #[arg(long)]
    run_id: String,
}

#[derive(Debug, Args)]
struct SubjectRef {
    #[arg(long)]
    tenant: i64,
    #[arg(long)]
    subject: i64,
}

#[derive(Debug, Args)]
struct SubjectArgs {
    #[command(subcommand)]
    command: SubjectSubcommand,
}

#[derive(Debug, Subcommand)]
enum SubjectSubcommand {
    Set {
        #[arg(long)]
        tenant: i64,
        #[arg(long)]
        subject: i64,
        #[arg(long)]
        stage: String,
        #[arg(long = "flag")]
        flags: Vec<String>,
        #[arg(long)]
        attrs: Option<String>,
    },
    Show(SubjectRef),
}

#[derive(Debug, Args)]
struct ChecklistArgs {
    #[command(subcommand)]
    command: ChecklistSubcommand,
}

#[derive(Debug, Subcommand)]
enum ChecklistSubcommand {
    Seed {
        #[arg(long)]
        tenant: i64,
        #[arg(long)]
        subject: i64,
        #[arg(long)]
        item_code: String,
        #[arg(long)]
        description: String,
    },
}

#[derive(Debug, Args)]
struct WorkArgs {
    #[arg(long, default_value_t = false, conflicts_with = "duration_secs")]
    drain: bool,
    #[arg(long)]
    duration_secs: Option<u64>,
}

/// Everything one command needs to build a [`RunEngine`].
struct Runtime {
    db: PathBuf,
    ledger: SqliteLedger,
    contracts: ContractRegistry,
    tasks: TaskRegistry,
    config: EngineConfig,
    clock: SystemClock,
}

impl Runtime {
    fn open(cli: &Cli) -> Result<Self> {
        let config = EngineConfig::load(cli.config.as_deref())?;
        let contracts = match cli.contracts.as_deref() {
            Some(path) => load_contracts_from_path(path)?,
            None => ContractRegistry::builtin(),
        };
        tracing::debug!(db = %cli.db.display(), "opening run ledger");
        let ledger = open_ledger(&cli.db)?;
        Ok(Self {
            db: cli.db.clone(),
            ledger,
            contracts,
            tasks: TaskRegistry::builtin(),
            config,
            clock: SystemClock,
        })
    }

    fn engine(&self) -> RunEngine<'_> {
        RunEngine::new(
            &self.ledger,
            &self.ledger,
            &self.contracts,
            &self.tasks,
            &self.config,
            &self.clock,
        )
    }

    fn now(&self) -> DateTimeUtc {
        self.clock.now()
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);
    let runtime = Runtime::open(&cli)?;

    match &cli.command {
        Commands::Migrate => emit(&json!({ "migrated": true, "db": runtime.db })),
        Commands::Submit(args) => submit_command(&runtime, args),
        Commands::Execute(args) => execute_command(&runtime, args),
        Commands::Approve(args) => {
            let run = runtime.engine().approve(
                TenantId(args.tenant),
                parse_run_id(&args.run_id)?,
                &args.actor,
            )?;
            emit(&run)
        }
        Commands::Reject(args) => {
            let run = runtime.engine().reject(
                TenantId(args.tenant),
                parse_run_id(&args.run_id)?,
                &args.actor,
                &args.reason,
            )?;
            emit(&run)
        }
        Commands::Apply(args) => {
            let outcome = runtime.engine().apply(
                TenantId(args.tenant),
                parse_run_id(&args.run_id)?,
                &args.actor,
            )?;
            emit(&outcome)
        }
        Commands::Plan(args) => plan_command(&runtime, args),
        Commands::Runs(args) => runs_command(&runtime, args),
        Commands::Show(args) => {
            let run = runtime
                .engine()
                .get_run(TenantId(args.tenant), parse_run_id(&args.run_id)?)?;
            emit(&run)
        }
        Commands::Events(args) => {
            for row in runtime.engine().events(parse_run_id(&args.run_id)?)? {
                emit(&row)?;
            }
            Ok(())
        }
        Commands::Subject(args) => subject_command(&runtime, &args.command),
        Commands::Checklist(args) => checklist_command(&runtime, &args.command),
        Commands::Mutations(args) => mutations_command(&runtime, args),
        Commands::Work(args) => work_command(&runtime, args),
        Commands::Sweep => emit(&runtime.engine().sweep_stale_runs()?),
        Commands::ReplayAudit(args) => {
            emit(&runtime.engine().replay_audit(parse_run_id(&args.run_id)?)?)
        }
        Commands::Contracts => {
            for (kind, contract) in runtime.contracts.contracts() {
                emit(&json!({ "task_kind": kind.as_str(), "contract": contract }))?;
            }
            Ok(())
        }
    }
}

fn submit_command(runtime: &Runtime, args: &SubmitArgs) -> Result<()> {
    let kind = parse_task_kind(&args.kind)?;
    let payload = match args.payload.as_deref() {
        Some(raw) => parse_json(raw, "--payload")?,
        None => json!({}),
    };
    let run = runtime.engine().submit(
        TenantId(args.tenant),
        kind,
        args.subject.map(SubjectId),
        payload,
        args.idempotency_key.clone(),
    )?;
    emit(&run)
}

fn execute_command(runtime: &Runtime, args: &ExecuteArgs) -> Result<()> {
    let engine = runtime.engine();
    let tenant_id = TenantId(args.tenant);
    let run_id = parse_run_id(&args.run_id)?;
    let run = match args.attempt {
        Some(attempt) => engine.execute(tenant_id, run_id, attempt)?,
        None => engine.execute_next(tenant_id, run_id)?,
    };
    emit(&run)
}

fn plan_command(runtime: &Runtime, args: &PlanArgs) -> Result<()> {
    let engine = runtime.engine();
    let tenant_id = TenantId(args.tenant);
    let planned = engine.plan(tenant_id, SubjectId(args.subject))?;
    if args.submit {
        for run in engine.submit_planned(tenant_id, &planned)? {
            emit(&run)?;
        }
    } else {
        for candidate in &planned {
            emit(candidate)?;
        }
    }
    Ok(())
}

fn runs_command(runtime: &Runtime, args: &RunsArgs) -> Result<()> {
    let status = args
        .status
        .as_deref()
        .map(|raw| RunStatus::parse(raw).ok_or_else(|| anyhow!("invalid --status '{raw}'")))
        .transpose()?;
    let filter = RunFilter {
        tenant_id: args.tenant.map(TenantId),
        status,
        subject_id: args.subject.map(SubjectId),
        limit: args.limit,
    };
    for run in runtime.engine().list_runs(&filter)? {
        emit(&run)?;
    }
    Ok(())
}

fn subject_command(runtime: &Runtime, command: &SubjectSubcommand) -> Result<()> {
    match command {
        SubjectSubcommand::Set {
            tenant,
            subject,
            stage,
            flags,
            attrs,
        } => {
            let attributes = match attrs.as_deref() {
                Some(raw) => match parse_json(raw, "--attrs")? {
                    Value::Object(map) => map,
                    _ => return Err(anyhow!("--attrs must be a JSON object")),
                },
                None => Map::new(),
            };
            let state = SubjectState {
                tenant_id: TenantId(*tenant),
                subject_id: SubjectId(*subject),
                stage: stage.clone(),
                flags: flags.clone(),
                attributes,
                updated_at: runtime.now(),
            };
            runtime.ledger.upsert_subject_state(&state)?;
            emit(&state)
        }
        SubjectSubcommand::Show(args) => {
            let state = runtime
                .ledger
                .subject_state(TenantId(args.tenant), SubjectId(args.subject))?
                .ok_or_else(|| {
                    anyhow!(
                        "no state recorded for subject {} in tenant {}",
                        args.subject,
                        args.tenant
                    )
                })?;
            emit(&state)
        }
    }
}

fn checklist_command(runtime: &Runtime, command: &ChecklistSubcommand) -> Result<()> {
    match command {
        ChecklistSubcommand::Seed {
            tenant,
            subject,
            item_code,
            description,
        } => {
            let id = runtime.ledger.seed_checklist_item(
                TenantId(*tenant),
                SubjectId(*subject),
                item_code,
                description,
            )?;
            emit(&json!({ "id": id, "item_code": item_code, "status": "pending" }))
        }
    }
}

fn mutations_command(runtime: &Runtime, args: &SubjectRef) -> Result<()> {
    let tenant_id = TenantId(args.tenant);
    let subject_id = SubjectId(args.subject);
    emit(&json!({
        "rehab_tasks": runtime.ledger.list_rehab_tasks(tenant_id, subject_id)?,
        "checklist_items": runtime.ledger.list_checklist_items(tenant_id, subject_id)?,
        "workflow_events": runtime.ledger.list_workflow_events(tenant_id, subject_id)?,
    }))
}

fn work_command(runtime: &Runtime, args: &WorkArgs) -> Result<()> {
    let pool = WorkerPool::new(
        &runtime.contracts,
        &runtime.tasks,
        &runtime.config,
        &runtime.clock,
    );
    let stop = AtomicBool::new(false);
    let options = PoolOptions {
        drain: args.drain,
        max_duration: args.duration_secs.map(Duration::from_secs),
    };
    let db = runtime.db.clone();
    let report = pool.run(|| open_ledger(&db), &stop, options)?;
    emit(&report)
}

fn open_ledger(path: &Path) -> Result<SqliteLedger> {
    let ledger = SqliteLedger::open(path)?;
    ledger.migrate()?;
    Ok(ledger)
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    let installed = match format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    if let Err(err) = installed {
        eprintln!("failed to install log subscriber: {err}");
    }
}

fn emit<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string(value).context("failed to serialize command output")?
    );
    Ok(())
}

fn parse_run_id(input: &str) -> Result<RunId> {
    RunId::parse(input).map_err(|err| anyhow!("invalid --run-id: {err}"))
}

fn parse_task_kind(input: &str) -> Result<TaskKind> {
    TaskKind::parse(input).ok_or_else(|| {
        let known: Vec<&str> = TaskKind::ALL.iter().map(|kind| kind.as_str()).collect();
        anyhow!("unknown task kind '{input}'; expected one of {}", known.join(", "))
    })
}

fn parse_json(raw: &str, flag: &str) -> Result<Value> {
    serde_json::from_str(raw).map_err(|err| anyhow!("invalid JSON for {flag}: {err}"))
}
