use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use fullhistory_api::{HistoryTracker, Registry, SchemaConfig, TracingObserver};
use fullhistory_core::{
    ActorContext, EntityRef, EntityType, FieldKind, FieldValue, FullHistoryEntry, HistoryError,
    RecordHandle, RequestId, UnitOfWork,
};
use fullhistory_store_sqlite::SqliteStore;
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::debug;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";
const LOG_ENV: &str = "FULLHISTORY_LOG";

#[derive(Debug, Parser)]
#[command(name = "fh")]
#[command(about = "Full history CLI")]
struct Cli {
    #[arg(long, env = "FULLHISTORY_DB", default_value = "./fullhistory.sqlite3")]
    db: PathBuf,

    #[arg(long, env = "FULLHISTORY_SCHEMA", default_value = "./fullhistory.yaml")]
    schema: PathBuf,

    #[command(flatten)]
    actor: ActorArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Args)]
struct ActorArgs {
    #[arg(long, global = true)]
    actor_id: Option<i64>,
    #[arg(long, global = true)]
    actor_name: Option<String>,
    #[arg(long, global = true, default_value_t = false)]
    anonymous: bool,
    #[arg(long, global = true)]
    origin_path: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Record {
        #[command(subcommand)]
        command: RecordCommand,
    },
    History {
        #[command(subcommand)]
        command: HistoryCommand,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    IntegrityCheck,
    Backup(DbBackupArgs),
    Restore(DbRestoreArgs),
    Export(DbExportArgs),
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct DbBackupArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Args)]
struct DbRestoreArgs {
    #[arg(long = "in")]
    input: PathBuf,
}

#[derive(Debug, Args)]
struct DbExportArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Subcommand)]
enum RecordCommand {
    Create(RecordCreateArgs),
    Update(RecordUpdateArgs),
    Delete(EntityArgs),
    Show(EntityArgs),
    Link(RecordLinkArgs),
}

#[derive(Debug, Args)]
struct EntityArgs {
    #[arg(long = "type")]
    entity_type: String,
    #[arg(long)]
    id: i64,
}

#[derive(Debug, Args)]
struct RecordCreateArgs {
    #[arg(long = "type")]
    entity_type: String,
    #[arg(long)]
    id: Option<i64>,
    #[arg(long = "set")]
    assignments: Vec<String>,
}

#[derive(Debug, Args)]
struct RecordUpdateArgs {
    #[command(flatten)]
    entity: EntityArgs,
    #[arg(long = "set")]
    assignments: Vec<String>,
}

#[derive(Debug, Args)]
struct RecordLinkArgs {
    #[command(flatten)]
    entity: EntityArgs,
    #[arg(long)]
    field: String,
    #[arg(long = "member")]
    members: Vec<i64>,
}

#[derive(Debug, Subcommand)]
enum HistoryCommand {
    List(HistoryListArgs),
    Actor(HistoryActorArgs),
    Request(HistoryRequestArgs),
    Version(RevisionArgs),
    Audit(EntityArgs),
    Rollback(HistoryRestoreArgs),
    Restore(HistoryRestoreArgs),
    Previous(RevisionArgs),
    Next(RevisionArgs),
}

#[derive(Debug, Args)]
struct HistoryListArgs {
    #[command(flatten)]
    entity: EntityArgs,
    #[arg(long)]
    from: Option<u32>,
    #[arg(long)]
    to: Option<u32>,
}

#[derive(Debug, Args)]
struct HistoryActorArgs {
    #[arg(long = "actor")]
    actor: i64,
}

#[derive(Debug, Args)]
struct HistoryRequestArgs {
    #[arg(long = "request")]
    request: String,
}

#[derive(Debug, Args)]
struct RevisionArgs {
    #[command(flatten)]
    entity: EntityArgs,
    #[arg(long)]
    revision: u32,
}

#[derive(Debug, Args)]
struct HistoryRestoreArgs {
    #[command(flatten)]
    entity: EntityArgs,
    #[arg(long)]
    revision: Option<u32>,
    #[arg(long, default_value_t = false)]
    commit: bool,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    match cli.command {
        Command::Db { command } => run_db(command, &cli.db),
        Command::Record { command } => {
            let mut tracker = open_tracker(&cli.schema, &cli.db)?;
            let mut unit = begin_unit(&cli.actor);
            run_record(command, &mut tracker, &mut unit)
        }
        Command::History { command } => {
            let mut tracker = open_tracker(&cli.schema, &cli.db)?;
            let mut unit = begin_unit(&cli.actor);
            run_history(command, &mut tracker, &mut unit)
        }
    }
}

fn open_tracker(schema: &Path, db: &Path) -> Result<HistoryTracker> {
    let config = SchemaConfig::load(schema)?;
    let registry = Registry::from_config(&config)?;
    let mut tracker = HistoryTracker::open(db, registry)?;
    debug!(db = %db.display(), schema = %schema.display(), "history database opened");
    tracker.subscribe(Box::new(TracingObserver));
    Ok(tracker)
}

fn begin_unit(args: &ActorArgs) -> UnitOfWork {
    let mut context = if args.anonymous {
        ActorContext::anonymous()
    } else if let Some(actor_id) = args.actor_id {
        ActorContext { actor_id: Some(actor_id), ..ActorContext::system() }
    } else {
        ActorContext::system()
    };
    if let Some(name) = &args.actor_name {
        context.actor_name = Some(name.clone());
    }
    if let Some(path) = &args.origin_path {
        context = context.with_origin_path(path.clone());
    }

    if context == ActorContext::system() {
        UnitOfWork::detached()
    } else {
        UnitOfWork::begin(context)
    }
}

fn run_db(command: DbCommand, db: &Path) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = fullhistory_api::schema_status(db)?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty()
            }))
        }
        DbCommand::Migrate(args) => {
            let result = fullhistory_api::migrate(db, args.dry_run)?;
            emit_json(serde_json::to_value(&result).context("failed to serialize migrate result")?)
        }
        DbCommand::IntegrityCheck => {
            let report = SqliteStore::open(db)?.integrity_check()?;
            emit_json(
                serde_json::to_value(&report).context("failed to serialize integrity report")?,
            )
        }
        DbCommand::Backup(args) => {
            let mut store = SqliteStore::open(db)?;
            store.migrate()?;
            store.backup_database(&args.out)?;
            emit_json(serde_json::json!({
                "backup_path": args.out,
                "status": "ok"
            }))
        }
        DbCommand::Restore(args) => {
            let mut store = SqliteStore::open(db)?;
            store.restore_database(&args.input)?;
            let status = store.schema_status()?;
            emit_json(serde_json::json!({
                "restored_from": args.input,
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions
            }))
        }
        DbCommand::Export(args) => {
            let mut store = SqliteStore::open(db)?;
            store.migrate()?;
            let manifest = store.export_ledger(&args.out)?;
            emit_json(serde_json::json!({
                "out_dir": args.out,
                "manifest": manifest
            }))
        }
    }
}

fn run_record(
    command: RecordCommand,
    tracker: &mut HistoryTracker,
    unit: &mut UnitOfWork,
) -> Result<()> {
    match command {
        RecordCommand::Create(args) => {
            let entity_type = parse_entity_type(&args.entity_type)?;
            let mut record = tracker.new_record(&entity_type)?;
            if let Some(id) = args.id {
                let entity = EntityRef::new(entity_type, id)?;
                if tracker.store().record_exists(&entity)? {
                    return Err(HistoryError::Validation(format!(
                        "{entity} already exists; use `record update`"
                    ))
                    .into());
                }
                record.assign_id(id);
            }
            apply_assignments(tracker, &mut record, &args.assignments)?;
            let entries = tracker.save(unit, &mut record)?;
            emit_json(serde_json::json!({
                "record": record_json(&record),
                "entries": entries
            }))
        }
        RecordCommand::Update(args) => {
            let mut record = tracker.load(&entity_ref(&args.entity)?)?;
            apply_assignments(tracker, &mut record, &args.assignments)?;
            let entries = tracker.save(unit, &mut record)?;
            emit_json(serde_json::json!({
                "record": record_json(&record),
                "entries": entries
            }))
        }
        RecordCommand::Delete(args) => {
            let mut record = tracker.load(&entity_ref(&args)?)?;
            let entries = tracker.delete(unit, &mut record)?;
            emit_json(serde_json::json!({
                "deleted": record_json(&record),
                "entries": entries
            }))
        }
        RecordCommand::Show(args) => {
            let record = tracker.load(&entity_ref(&args)?)?;
            emit_json(record_json(&record))
        }
        RecordCommand::Link(args) => {
            let mut record = tracker.load(&entity_ref(&args.entity)?)?;
            let entries = tracker.set_related(unit, &mut record, &args.field, args.members)?;
            emit_json(serde_json::json!({
                "record": record_json(&record),
                "entries": entries
            }))
        }
    }
}

fn run_history(
    command: HistoryCommand,
    tracker: &mut HistoryTracker,
    unit: &mut UnitOfWork,
) -> Result<()> {
    match command {
        HistoryCommand::List(args) => {
            let entity = entity_ref(&args.entity)?;
            let entries = tracker.entries_in_range(&entity, args.from, args.to)?;
            emit_json(serde_json::json!({
                "entity": entity,
                "entries": entries
            }))
        }
        HistoryCommand::Actor(args) => {
            let entries = tracker.entries_for_actor(args.actor)?;
            emit_json(serde_json::json!({
                "actor_id": args.actor,
                "entries": entries
            }))
        }
        HistoryCommand::Request(args) => {
            let request_id = RequestId(
                args.request
                    .parse()
                    .with_context(|| format!("invalid request id {}", args.request))?,
            );
            let request = tracker.request(request_id)?;
            let entries = tracker.entries_for_request(request_id)?;
            emit_json(serde_json::json!({
                "request": request,
                "entries": entries
            }))
        }
        HistoryCommand::Version(args) => {
            let record = tracker.preview_version(&entity_ref(&args.entity)?, args.revision)?;
            emit_json(serde_json::json!({
                "revision": args.revision,
                "record": record_json(&record)
            }))
        }
        HistoryCommand::Audit(args) => {
            let entity = entity_ref(&args)?;
            match tracker.audit_stored(&entity) {
                Ok(report) => emit_json(serde_json::json!({
                    "status": "ok",
                    "report": report
                })),
                Err(err) => {
                    if let Some(failure) = err.downcast_ref::<HistoryError>().and_then(failure_json)
                    {
                        emit_json(serde_json::json!({
                            "status": "failed",
                            "entity": entity,
                            "failure": failure
                        }))?;
                    }
                    Err(err)
                }
            }
        }
        HistoryCommand::Rollback(args) => {
            let current = tracker.load(&entity_ref(&args.entity)?)?;
            let record = tracker.rollback(unit, &current, args.revision, args.commit)?;
            emit_json(serde_json::json!({
                "committed": args.commit,
                "record": record_json(&record)
            }))
        }
        HistoryCommand::Restore(args) => {
            let entity = entity_ref(&args.entity)?;
            let record = tracker.restore(unit, &entity, args.revision, args.commit)?;
            emit_json(serde_json::json!({
                "committed": args.commit,
                "record": record_json(&record)
            }))
        }
        HistoryCommand::Previous(args) => {
            let entry = entry_at(tracker, &args)?;
            emit_json(serde_json::to_value(tracker.previous(&entry)?)?)
        }
        HistoryCommand::Next(args) => {
            let entry = entry_at(tracker, &args)?;
            emit_json(serde_json::to_value(tracker.next(&entry)?)?)
        }
    }
}

fn entry_at(tracker: &HistoryTracker, args: &RevisionArgs) -> Result<FullHistoryEntry> {
    tracker.store().entry_at(&entity_ref(&args.entity)?, args.revision)
}

fn failure_json(err: &HistoryError) -> Option<Value> {
    match err {
        HistoryError::AuditMismatch { entity, revision, field, expected, actual } => {
            Some(serde_json::json!({
                "kind": "audit_mismatch",
                "entity": entity,
                "revision": revision,
                "field": field,
                "expected": expected,
                "actual": actual
            }))
        }
        HistoryError::InvariantViolation { entity, revision, detail } => Some(serde_json::json!({
            "kind": "invariant_violation",
            "entity": entity,
            "revision": revision,
            "detail": detail
        })),
        _ => None,
    }
}

fn record_json(record: &RecordHandle) -> Value {
    serde_json::json!({
        "entity_type": record.entity_type(),
        "entity_id": record.entity_id(),
        "values": record.values()
    })
}

fn parse_entity_type(raw: &str) -> Result<EntityType> {
    Ok(EntityType::parse(raw)?)
}

fn entity_ref(args: &EntityArgs) -> Result<EntityRef> {
    Ok(EntityRef::new(parse_entity_type(&args.entity_type)?, args.id)?)
}

fn apply_assignments(
    tracker: &HistoryTracker,
    record: &mut RecordHandle,
    assignments: &[String],
) -> Result<()> {
    let fields = tracker.registry().fields_of(record.entity_type())?;
    for assignment in assignments {
        let (name, raw) = assignment
            .split_once('=')
            .ok_or_else(|| anyhow!("assignment `{assignment}` must look like field=value"))?;
        let descriptor = fields.iter().find(|field| field.name == name).ok_or_else(|| {
            HistoryError::Validation(format!("{} has no field `{name}`", record.entity_type()))
        })?;
        let value = parse_field_value(&descriptor.kind, raw)
            .with_context(|| format!("invalid value for field `{name}`"))?;
        record.set(name, value);
    }
    Ok(())
}

fn parse_field_value(kind: &FieldKind, raw: &str) -> Result<FieldValue> {
    if raw == "null" {
        return Ok(match kind {
            FieldKind::Relation { .. } => FieldValue::Reference(None),
            FieldKind::ManyToMany { .. } => FieldValue::Members(Vec::new()),
            _ => FieldValue::Null,
        });
    }

    match kind {
        FieldKind::Scalar => Ok(match serde_json::from_str::<Value>(raw) {
            Ok(Value::Bool(flag)) => FieldValue::Bool(flag),
            Ok(Value::Number(number)) => match (number.as_i64(), number.as_f64()) {
                (Some(integer), _) => FieldValue::Integer(integer),
                (None, Some(float)) => FieldValue::Float(float),
                (None, None) => FieldValue::Text(raw.to_string()),
            },
            Ok(Value::String(text)) => FieldValue::Text(text),
            _ => FieldValue::Text(raw.to_string()),
        }),
        FieldKind::Timestamp => Ok(FieldValue::Timestamp(
            OffsetDateTime::parse(raw, &Rfc3339)
                .with_context(|| format!("`{raw}` is not an RFC 3339 timestamp"))?,
        )),
        FieldKind::File => Ok(FieldValue::File(raw.to_string())),
        FieldKind::Relation { .. } => Ok(FieldValue::Reference(Some(
            raw.parse().with_context(|| format!("`{raw}` is not a record key"))?,
        ))),
        FieldKind::ManyToMany { .. } => {
            let members = raw
                .split(',')
                .map(str::trim)
                .filter(|member| !member.is_empty())
                .map(|member| {
                    member.parse::<i64>().with_context(|| format!("`{member}` is not a record key"))
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(FieldValue::Members(members))
        }
    }
}
