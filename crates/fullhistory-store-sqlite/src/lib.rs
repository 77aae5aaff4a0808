use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use fullhistory_core::{
    merge_adjustment, summarize, Action, EntityRef, EntityType, EntryData, EntryId, FieldValue,
    FullHistoryEntry, HistoryError, RecordHandle, RelationResolver, RequestId, RequestRecord,
    ResolveError,
};
use rusqlite::{
    params, Connection, DatabaseName, OptionalExtension, Transaction, TransactionBehavior,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use ulid::Ulid;

const LATEST_SCHEMA_VERSION: i64 = 2;
pub const DEFAULT_MAX_APPEND_ATTEMPTS: u32 = 5;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS history_requests (
  request_id TEXT PRIMARY KEY,
  actor_id INTEGER,
  actor_name TEXT NOT NULL CHECK (length(actor_name) <= 255),
  origin_path TEXT CHECK (origin_path IS NULL OR length(origin_path) <= 255),
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS full_history (
  entry_id TEXT PRIMARY KEY,
  entity_type TEXT NOT NULL,
  entity_id INTEGER NOT NULL CHECK (entity_id >= 1),
  revision INTEGER NOT NULL CHECK (revision >= 0),
  action TEXT NOT NULL CHECK (action IN ('C', 'U', 'D')),
  data_json TEXT,
  request_id TEXT REFERENCES history_requests(request_id),
  recorded_at TEXT NOT NULL,
  info TEXT NOT NULL,
  UNIQUE(entity_type, entity_id, revision)
);

CREATE INDEX IF NOT EXISTS idx_full_history_entity_revision
  ON full_history(entity_type, entity_id, revision);
CREATE INDEX IF NOT EXISTS idx_full_history_request ON full_history(request_id);
CREATE INDEX IF NOT EXISTS idx_history_requests_actor ON history_requests(actor_id);
";

const MIGRATION_002_SQL: &str = r"
CREATE TABLE IF NOT EXISTS record_keys (
  entity_id INTEGER PRIMARY KEY AUTOINCREMENT,
  allocated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS live_records (
  entity_type TEXT NOT NULL,
  entity_id INTEGER NOT NULL CHECK (entity_id >= 1),
  fields_json TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  PRIMARY KEY (entity_type, entity_id)
);
";

const ENTRY_COLUMNS: &str =
    "entry_id, entity_type, entity_id, revision, action, data_json, request_id, recorded_at, info";

pub struct SqliteStore {
    conn: Connection,
    max_append_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportFileDigest {
    pub path: String,
    pub sha256: String,
    pub records: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportManifest {
    pub schema_version: i64,
    pub exported_at: String,
    pub files: Vec<ExportFileDigest>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

/// One entity whose ledger breaks the revision or Create-first invariants.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerFinding {
    pub entity_type: String,
    pub entity_id: i64,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub ledger_findings: Vec<LedgerFinding>,
    pub schema_status: SchemaStatus,
}

/// Entry to append; the store assigns id, revision and timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEntry {
    pub entity: EntityRef,
    pub action: Action,
    pub data: Option<EntryData>,
    pub request_id: Option<RequestId>,
    pub info: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SaveOutcome {
    Created,
    Updated,
}

impl SaveOutcome {
    #[must_use]
    pub fn action(self) -> Action {
        match self {
            Self::Created => Action::Create,
            Self::Updated => Action::Update,
        }
    }
}

impl SqliteStore {
    /// Open a SQLite-backed history store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn, max_append_attempts: DEFAULT_MAX_APPEND_ATTEMPTS })
    }

    /// Bound the number of append attempts made when a revision slot is already taken.
    #[must_use]
    pub fn with_max_append_attempts(mut self, attempts: u32) -> Self {
        self.max_append_attempts = attempts.max(1);
        self
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;

        if version < 1 {
            apply_migration(&mut self.conn, 1, MIGRATION_001_SQL)?;
            version = 1;
        }

        if version < 2 {
            apply_migration(&mut self.conn, 2, MIGRATION_002_SQL)?;
            version = current_schema_version(&self.conn)?;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    /// Persist the `Request` row of a unit of work.
    ///
    /// # Errors
    /// Returns an error when the row cannot be inserted (including a duplicate request id).
    pub fn insert_request(&self, request: &RequestRecord) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO history_requests(request_id, actor_id, actor_name, origin_path, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    request.request_id.to_string(),
                    request.actor_id,
                    request.actor_name,
                    request.origin_path,
                    rfc3339(request.created_at)?,
                ],
            )
            .with_context(|| format!("failed to insert request {}", request.request_id))?;
        debug!(request_id = %request.request_id, actor = %request.actor_name, "request recorded");
        Ok(())
    }

    /// # Errors
    /// Returns [`HistoryError::NotFound`] when no such request exists, or an error when the
    /// lookup fails.
    pub fn request(&self, request_id: RequestId) -> Result<RequestRecord> {
        let row = self
            .conn
            .query_row(
                "SELECT actor_id, actor_name, origin_path, created_at
                 FROM history_requests WHERE request_id = ?1",
                params![request_id.to_string()],
                |row| {
                    Ok((
                        row.get::<_, Option<i64>>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()
            .with_context(|| format!("failed to load request {request_id}"))?;

        let Some((actor_id, actor_name, origin_path, created_at)) = row else {
            return Err(HistoryError::NotFound(format!("request {request_id}")).into());
        };

        Ok(RequestRecord {
            request_id,
            actor_id,
            actor_name,
            origin_path,
            created_at: parse_rfc3339(&created_at)?,
        })
    }

    /// Append one ledger entry at the next free revision of its entity.
    ///
    /// The revision count and the insert run in one immediate transaction. A collision on
    /// `(entity_type, entity_id, revision)` is retried with a recomputed revision until the
    /// attempt bound is reached.
    ///
    /// # Errors
    /// Returns [`HistoryError::Validation`] for a Create/Update without data,
    /// [`HistoryError::WriteConflict`] once retries are exhausted, or an error when the
    /// database write fails.
    pub fn append_entry(&mut self, entry: &NewEntry) -> Result<FullHistoryEntry> {
        if entry.action != Action::Delete && entry.data.is_none() {
            return Err(HistoryError::Validation(format!(
                "{} entry for {} MUST carry data",
                entry.action.as_str(),
                entry.entity
            ))
            .into());
        }

        let data_json = entry
            .data
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("failed to serialize entry data")?;
        let max_attempts = self.max_append_attempts;
        let mut attempts = 0_u32;

        loop {
            attempts += 1;
            let tx = self
                .conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .context("failed to begin append transaction")?;

            let revision = count_entries(&tx, &entry.entity)?;
            let stored = FullHistoryEntry {
                entry_id: EntryId::new(),
                entity: entry.entity.clone(),
                revision,
                action: entry.action,
                data: entry.data.clone(),
                request_id: entry.request_id,
                timestamp: OffsetDateTime::now_utc(),
                info: entry.info.clone(),
            };

            let inserted = tx.execute(
                "INSERT INTO full_history(
                    entry_id, entity_type, entity_id, revision, action, data_json, request_id,
                    recorded_at, info
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    stored.entry_id.to_string(),
                    stored.entity.entity_type.as_str(),
                    stored.entity.entity_id,
                    i64::from(stored.revision),
                    stored.action.as_code(),
                    data_json,
                    stored.request_id.map(|id| id.to_string()),
                    rfc3339(stored.timestamp)?,
                    stored.info,
                ],
            );

            match inserted {
                Ok(_) => {
                    tx.commit().context("failed to commit append transaction")?;
                    debug!(
                        entity = %stored.entity,
                        revision = stored.revision,
                        action = stored.action.as_str(),
                        "history entry appended"
                    );
                    return Ok(stored);
                }
                Err(err) if is_unique_violation(&err) => {
                    drop(tx);
                    if attempts >= max_attempts {
                        return Err(HistoryError::WriteConflict {
                            entity: entry.entity.clone(),
                            revision,
                            attempts,
                        }
                        .into());
                    }
                    warn!(entity = %entry.entity, revision, attempts, "revision already taken, retrying append");
                }
                Err(err) => {
                    return Err(err).with_context(|| {
                        format!("failed to append history entry for {}", entry.entity)
                    });
                }
            }
        }
    }

    /// Replace the data and summary of an existing entry. This is the only mutation a ledger
    /// entry ever receives after it is written.
    ///
    /// # Errors
    /// Returns [`HistoryError::NotFound`] for an unknown entry, or an error when the update fails.
    pub fn amend_entry(
        &mut self,
        entry_id: EntryId,
        data: &EntryData,
        info: &str,
    ) -> Result<FullHistoryEntry> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to begin amend transaction")?;
        let amended = rewrite_entry(&tx, entry_id, data, info)?;
        tx.commit().context("failed to commit amend transaction")?;

        debug!(entity = %amended.entity, revision = amended.revision, "history entry amended");
        Ok(amended)
    }

    /// Merge `adjusted` into the latest entry `request_id` wrote for `entity` and recompute its
    /// summary. The lookup, merge and rewrite share one IMMEDIATE transaction.
    ///
    /// Returns `None`, leaving the ledger untouched, when the request wrote no entry for
    /// `entity`.
    ///
    /// # Errors
    /// Returns an error when the query or the update fails.
    pub fn amend_latest_for_request(
        &mut self,
        entity: &EntityRef,
        request_id: RequestId,
        adjusted: &EntryData,
        actor_name: &str,
    ) -> Result<Option<FullHistoryEntry>> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to begin amend transaction")?;
        let target = query_entries(
            &tx,
            "WHERE entity_type = ?1 AND entity_id = ?2 AND request_id = ?3
             ORDER BY revision DESC LIMIT 1",
            params![entity.entity_type.as_str(), entity.entity_id, request_id.to_string()],
        )?
        .into_iter()
        .next();
        let Some(target) = target else {
            return Ok(None);
        };

        let merged = merge_adjustment(target.action, target.data, adjusted.clone());
        let info = summarize(target.action, actor_name, Some(&merged));
        let amended = rewrite_entry(&tx, target.entry_id, &merged, &info)?;
        tx.commit().context("failed to commit amend transaction")?;

        debug!(entity = %amended.entity, revision = amended.revision, "history entry adjusted");
        Ok(Some(amended))
    }

    /// Every entry of an entity, ordered by revision ascending.
    ///
    /// # Errors
    /// Returns an error when the query or row decoding fails.
    pub fn entries_for(&self, entity: &EntityRef) -> Result<Vec<FullHistoryEntry>> {
        self.entries_in_range(entity, None, None)
    }

    /// Entries of an entity with `from <= revision <= to`, ordered by revision ascending.
    ///
    /// # Errors
    /// Returns an error when the query or row decoding fails.
    pub fn entries_in_range(
        &self,
        entity: &EntityRef,
        from: Option<u32>,
        to: Option<u32>,
    ) -> Result<Vec<FullHistoryEntry>> {
        query_entries(
            &self.conn,
            "WHERE entity_type = ?1 AND entity_id = ?2
               AND revision >= ?3 AND (?4 IS NULL OR revision <= ?4)
             ORDER BY revision ASC",
            params![
                entity.entity_type.as_str(),
                entity.entity_id,
                i64::from(from.unwrap_or(0)),
                to.map(i64::from),
            ],
        )
    }

    /// # Errors
    /// Returns [`HistoryError::NotFound`] when the entity has no entry at `revision`.
    pub fn entry_at(&self, entity: &EntityRef, revision: u32) -> Result<FullHistoryEntry> {
        query_entries(
            &self.conn,
            "WHERE entity_type = ?1 AND entity_id = ?2 AND revision = ?3",
            params![entity.entity_type.as_str(), entity.entity_id, i64::from(revision)],
        )?
        .into_iter()
        .next()
        .ok_or_else(|| HistoryError::NotFound(format!("{entity} has no revision {revision}")).into())
    }

    /// # Errors
    /// Returns [`HistoryError::NotFound`] for the first entry of a ledger.
    pub fn previous(&self, entry: &FullHistoryEntry) -> Result<FullHistoryEntry> {
        self.entry_at(&entry.entity, entry.previous_revision()?)
    }

    /// # Errors
    /// Returns [`HistoryError::NotFound`] for the last entry of a ledger.
    pub fn next(&self, entry: &FullHistoryEntry) -> Result<FullHistoryEntry> {
        self.entry_at(&entry.entity, entry.next_revision()?)
    }

    /// # Errors
    /// Returns an error when the query or row decoding fails.
    pub fn latest_entry(&self, entity: &EntityRef) -> Result<Option<FullHistoryEntry>> {
        Ok(query_entries(
            &self.conn,
            "WHERE entity_type = ?1 AND entity_id = ?2 ORDER BY revision DESC LIMIT 1",
            params![entity.entity_type.as_str(), entity.entity_id],
        )?
        .into_iter()
        .next())
    }

    /// Most recent entry for `entity` written under `request_id`.
    ///
    /// # Errors
    /// Returns an error when the query or row decoding fails.
    pub fn latest_entry_for_request(
        &self,
        entity: &EntityRef,
        request_id: RequestId,
    ) -> Result<Option<FullHistoryEntry>> {
        Ok(query_entries(
            &self.conn,
            "WHERE entity_type = ?1 AND entity_id = ?2 AND request_id = ?3
             ORDER BY revision DESC LIMIT 1",
            params![entity.entity_type.as_str(), entity.entity_id, request_id.to_string()],
        )?
        .into_iter()
        .next())
    }

    /// Entries written under requests carrying `actor_id`, in write order.
    ///
    /// # Errors
    /// Returns an error when the query or row decoding fails.
    pub fn entries_for_actor(&self, actor_id: i64) -> Result<Vec<FullHistoryEntry>> {
        query_entries(
            &self.conn,
            "WHERE request_id IN (SELECT request_id FROM history_requests WHERE actor_id = ?1)
             ORDER BY rowid ASC",
            params![actor_id],
        )
    }

    /// Entries written under one unit of work, in write order.
    ///
    /// # Errors
    /// Returns an error when the query or row decoding fails.
    pub fn entries_for_request(&self, request_id: RequestId) -> Result<Vec<FullHistoryEntry>> {
        query_entries(
            &self.conn,
            "WHERE request_id = ?1 ORDER BY rowid ASC",
            params![request_id.to_string()],
        )
    }

    /// # Errors
    /// Returns [`HistoryError::NotFound`] when no live row exists for `entity`.
    pub fn load_record(&self, entity: &EntityRef) -> Result<RecordHandle> {
        let fields_json = self
            .conn
            .query_row(
                "SELECT fields_json FROM live_records WHERE entity_type = ?1 AND entity_id = ?2",
                params![entity.entity_type.as_str(), entity.entity_id],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .with_context(|| format!("failed to load live record {entity}"))?;

        let Some(fields_json) = fields_json else {
            return Err(HistoryError::NotFound(format!("live record {entity}")).into());
        };
        let values: BTreeMap<String, FieldValue> = serde_json::from_str(&fields_json)
            .with_context(|| format!("invalid fields_json for {entity}"))?;

        Ok(RecordHandle::from_values(entity.entity_type.clone(), Some(entity.entity_id), values))
    }

    /// Insert or overwrite the live row of `record`, allocating a key when it has none.
    ///
    /// Keys come from one sequence shared by every type, so rows of one inheritance chain can
    /// share a key. Explicit keys advance the sequence past themselves.
    ///
    /// # Errors
    /// Returns an error when key allocation or the write fails.
    pub fn save_record(&mut self, record: &mut RecordHandle) -> Result<SaveOutcome> {
        let fields_json =
            serde_json::to_string(record.values()).context("failed to serialize record fields")?;
        let now = now_rfc3339()?;
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to begin record save transaction")?;

        let entity_id = if let Some(entity_id) = record.entity_id() {
            tx.execute(
                "INSERT OR IGNORE INTO record_keys(entity_id, allocated_at) VALUES (?1, ?2)",
                params![entity_id, now],
            )
            .with_context(|| format!("failed to reserve record key {entity_id}"))?;
            entity_id
        } else {
            tx.execute("INSERT INTO record_keys(allocated_at) VALUES (?1)", params![now])
                .context("failed to allocate record key")?;
            tx.last_insert_rowid()
        };
        let entity = EntityRef::new(record.entity_type().clone(), entity_id)?;

        let existed = live_record_exists(&tx, &entity)?;
        tx.execute(
            "INSERT INTO live_records(entity_type, entity_id, fields_json, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(entity_type, entity_id)
             DO UPDATE SET fields_json = excluded.fields_json, updated_at = excluded.updated_at",
            params![entity.entity_type.as_str(), entity.entity_id, fields_json, now],
        )
        .with_context(|| format!("failed to write live record {entity}"))?;
        tx.commit().context("failed to commit record save transaction")?;

        record.assign_id(entity_id);
        Ok(if existed { SaveOutcome::Updated } else { SaveOutcome::Created })
    }

    /// Remove the live row of `entity`; returns whether a row existed.
    ///
    /// # Errors
    /// Returns an error when the delete fails.
    pub fn delete_record(&mut self, entity: &EntityRef) -> Result<bool> {
        let removed = self
            .conn
            .execute(
                "DELETE FROM live_records WHERE entity_type = ?1 AND entity_id = ?2",
                params![entity.entity_type.as_str(), entity.entity_id],
            )
            .with_context(|| format!("failed to delete live record {entity}"))?;
        Ok(removed > 0)
    }

    /// # Errors
    /// Returns an error when the lookup fails.
    pub fn record_exists(&self, entity: &EntityRef) -> Result<bool> {
        live_record_exists(&self.conn, entity)
    }

    /// Write `history_requests.ndjson`, `full_history.ndjson` and a digest manifest to `out_dir`.
    ///
    /// # Errors
    /// Returns an error when export files cannot be created, written, or serialized.
    pub fn export_ledger(&self, out_dir: &Path) -> Result<ExportManifest> {
        fs::create_dir_all(out_dir)
            .with_context(|| format!("failed to create export directory {}", out_dir.display()))?;

        let requests = self.list_requests()?;
        let entries = query_entries(&self.conn, "ORDER BY rowid ASC", [])?;

        let requests_path = out_dir.join("history_requests.ndjson");
        let request_digest = write_ndjson_file(&requests_path, &requests)?;

        let entries_path = out_dir.join("full_history.ndjson");
        let entry_digest = write_ndjson_file(&entries_path, &entries)?;

        let manifest = ExportManifest {
            schema_version: LATEST_SCHEMA_VERSION,
            exported_at: now_rfc3339()?,
            files: vec![
                ExportFileDigest {
                    path: "history_requests.ndjson".to_string(),
                    sha256: request_digest.0,
                    records: request_digest.1,
                },
                ExportFileDigest {
                    path: "full_history.ndjson".to_string(),
                    sha256: entry_digest.0,
                    records: entry_digest.1,
                },
            ],
        };

        let manifest_path = out_dir.join("manifest.json");
        let manifest_json =
            serde_json::to_vec_pretty(&manifest).context("failed to serialize export manifest")?;
        fs::write(&manifest_path, manifest_json).with_context(|| {
            format!("failed to write export manifest {}", manifest_path.display())
        })?;

        Ok(manifest)
    }

    /// Create a `SQLite` backup file of the current main database.
    ///
    /// # Errors
    /// Returns an error when backup directories cannot be created or backup fails.
    pub fn backup_database(&self, out_file: &Path) -> Result<()> {
        if let Some(parent) = out_file.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory for backup file {}", out_file.display())
            })?;
        }

        self.conn
            .backup(DatabaseName::Main, out_file, None)
            .with_context(|| format!("failed to create sqlite backup at {}", out_file.display()))
    }

    /// Restore this database from a `SQLite` backup file, then migrate to latest.
    ///
    /// # Errors
    /// Returns an error when the backup file is missing, restore fails, or migrations fail.
    pub fn restore_database(&mut self, in_file: &Path) -> Result<()> {
        if !in_file.exists() {
            return Err(anyhow!("backup file does not exist: {}", in_file.display()));
        }

        self.conn
            .restore(DatabaseName::Main, in_file, None::<fn(rusqlite::backup::Progress)>)
            .with_context(|| {
                format!("failed to restore sqlite backup from {}", in_file.display())
            })?;

        self.migrate()?;
        Ok(())
    }

    /// Run quick-check, foreign-key-check, ledger-shape and schema status health probes.
    ///
    /// # Errors
    /// Returns an error when any integrity probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        let ledger_findings = if table_exists(&self.conn, "full_history")? {
            self.ledger_findings()?
        } else {
            Vec::new()
        };

        let schema_status = self.schema_status()?;
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            ledger_findings,
            schema_status,
        })
    }

    fn ledger_findings(&self) -> Result<Vec<LedgerFinding>> {
        let mut findings = Vec::new();

        let mut gaps = self
            .conn
            .prepare(
                "SELECT entity_type, entity_id, COUNT(*), MIN(revision), MAX(revision)
                 FROM full_history
                 GROUP BY entity_type, entity_id
                 HAVING MIN(revision) != 0 OR MAX(revision) != COUNT(*) - 1
                 ORDER BY entity_type, entity_id",
            )
            .context("failed to prepare revision gap probe")?;
        let rows = gaps.query_map([], |row| {
            Ok(LedgerFinding {
                entity_type: row.get(0)?,
                entity_id: row.get(1)?,
                detail: format!(
                    "{} entries span revisions {}..={}",
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?
                ),
            })
        })?;
        for row in rows {
            findings.push(row?);
        }

        let mut starts = self
            .conn
            .prepare(
                "SELECT entity_type, entity_id, action FROM full_history
                 WHERE revision = 0 AND action != 'C'
                 ORDER BY entity_type, entity_id",
            )
            .context("failed to prepare ledger start probe")?;
        let rows = starts.query_map([], |row| {
            Ok(LedgerFinding {
                entity_type: row.get(0)?,
                entity_id: row.get(1)?,
                detail: format!("revision 0 has action {} instead of C", row.get::<_, String>(2)?),
            })
        })?;
        for row in rows {
            findings.push(row?);
        }

        Ok(findings)
    }

    fn list_requests(&self) -> Result<Vec<RequestRecord>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT request_id, actor_id, actor_name, origin_path, created_at
                 FROM history_requests ORDER BY rowid ASC",
            )
            .context("failed to prepare request listing")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<i64>>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        let mut requests = Vec::new();
        for row in rows {
            let (request_id, actor_id, actor_name, origin_path, created_at) = row?;
            requests.push(RequestRecord {
                request_id: RequestId(parse_ulid(&request_id)?),
                actor_id,
                actor_name,
                origin_path,
                created_at: parse_rfc3339(&created_at)?,
            });
        }
        Ok(requests)
    }
}

impl RelationResolver for SqliteStore {
    fn resolve(&self, target: &EntityRef) -> std::result::Result<bool, ResolveError> {
        self.record_exists(target).map_err(|err| ResolveError(format!("{err:#}")))
    }
}

struct EntryRow {
    entry_id: String,
    entity_type: String,
    entity_id: i64,
    revision: i64,
    action: String,
    data_json: Option<String>,
    request_id: Option<String>,
    recorded_at: String,
    info: String,
}

impl EntryRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            entry_id: row.get(0)?,
            entity_type: row.get(1)?,
            entity_id: row.get(2)?,
            revision: row.get(3)?,
            action: row.get(4)?,
            data_json: row.get(5)?,
            request_id: row.get(6)?,
            recorded_at: row.get(7)?,
            info: row.get(8)?,
        })
    }

    fn into_entry(self) -> Result<FullHistoryEntry> {
        let entity = EntityRef::new(EntityType::parse(&self.entity_type)?, self.entity_id)?;
        let action = Action::parse_code(&self.action)
            .ok_or_else(|| anyhow!("invalid action `{}` for {entity}", self.action))?;
        let data = self
            .data_json
            .as_deref()
            .map(serde_json::from_str::<EntryData>)
            .transpose()
            .with_context(|| format!("invalid data_json for {entity} revision {}", self.revision))?;

        Ok(FullHistoryEntry {
            entry_id: EntryId(parse_ulid(&self.entry_id)?),
            revision: u32::try_from(self.revision)
                .with_context(|| format!("invalid revision {} for {entity}", self.revision))?,
            entity,
            action,
            data,
            request_id: self.request_id.as_deref().map(parse_ulid).transpose()?.map(RequestId),
            timestamp: parse_rfc3339(&self.recorded_at)?,
            info: self.info,
        })
    }
}

fn rewrite_entry(
    tx: &Transaction<'_>,
    entry_id: EntryId,
    data: &EntryData,
    info: &str,
) -> Result<FullHistoryEntry> {
    let data_json = serde_json::to_string(data).context("failed to serialize amended data")?;
    let changed = tx
        .execute(
            "UPDATE full_history SET data_json = ?1, info = ?2 WHERE entry_id = ?3",
            params![data_json, info, entry_id.to_string()],
        )
        .with_context(|| format!("failed to amend history entry {entry_id}"))?;
    if changed == 0 {
        return Err(HistoryError::NotFound(format!("history entry {entry_id}")).into());
    }

    query_entries(tx, "WHERE entry_id = ?1", params![entry_id.to_string()])?
        .into_iter()
        .next()
        .ok_or_else(|| HistoryError::NotFound(format!("history entry {entry_id}")).into())
}

fn query_entries<P: rusqlite::Params>(
    conn: &Connection,
    clause: &str,
    params: P,
) -> Result<Vec<FullHistoryEntry>> {
    let sql = format!("SELECT {ENTRY_COLUMNS} FROM full_history {clause}");
    let mut stmt = conn.prepare(&sql).context("failed to prepare history query")?;
    let rows = stmt.query_map(params, EntryRow::from_row).context("failed to run history query")?;

    let mut entries = Vec::new();
    for row in rows {
        entries.push(row?.into_entry()?);
    }
    Ok(entries)
}

fn count_entries(conn: &Connection, entity: &EntityRef) -> Result<u32> {
    let count = conn
        .query_row(
            "SELECT COUNT(*) FROM full_history WHERE entity_type = ?1 AND entity_id = ?2",
            params![entity.entity_type.as_str(), entity.entity_id],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to count history entries for {entity}"))?;
    u32::try_from(count).with_context(|| format!("history for {entity} exceeds revision range"))
}

fn live_record_exists(conn: &Connection, entity: &EntityRef) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM live_records WHERE entity_type = ?1 AND entity_id = ?2)",
            params![entity.entity_type.as_str(), entity.entity_id],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check live record {entity}"))?;
    Ok(exists == 1)
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(code, _)
            if code.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

fn apply_migration(conn: &mut Connection, version: i64, sql: &str) -> Result<()> {
    let tx = conn
        .transaction()
        .with_context(|| format!("failed to begin migration {version}"))?;
    tx.execute_batch(sql).with_context(|| format!("failed to apply migration {version}"))?;
    record_schema_version(&tx, version)?;
    tx.commit().with_context(|| format!("failed to commit migration {version}"))?;
    info!(version, "schema migration applied");
    Ok(())
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if table exists: {table_name}"))?;
    Ok(exists == 1)
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    rfc3339(OffsetDateTime::now_utc())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}

fn parse_ulid(raw: &str) -> Result<Ulid> {
    Ulid::from_string(raw).with_context(|| format!("invalid ULID: {raw}"))
}

fn write_ndjson_file<T: Serialize>(path: &Path, values: &[T]) -> Result<(String, usize)> {
    let file = File::create(path)
        .with_context(|| format!("failed to create export file {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    let mut hasher = Sha256::new();

    for value in values {
        let line = serde_json::to_string(value).context("failed to serialize NDJSON row")?;
        writer
            .write_all(line.as_bytes())
            .with_context(|| format!("failed to write export file {}", path.display()))?;
        writer
            .write_all(b"\n")
            .with_context(|| format!("failed to write export file {}", path.display()))?;
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }

    writer.flush().with_context(|| format!("failed to flush export file {}", path.display()))?;

    Ok((format!("{:x}", hasher.finalize()), values.len()))
}
