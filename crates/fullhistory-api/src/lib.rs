use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use fullhistory_core::{
    diff, fold_entries, full_snapshot_as_delta, merge_adjustment, record_from_snapshot, snapshot,
    summarize, update_delta, verify_live_state, Action, EntityRef, EntityType, EntryData,
    FieldDescriptor, FieldValue, FullHistoryEntry, HistoryError, RecordHandle, RequestId,
    RequestRecord, Snapshot, UnitOfWork,
};
use fullhistory_store_sqlite::{NewEntry, SaveOutcome, SchemaStatus, SqliteStore};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

/// Inspect schema status without mutating data.
///
/// # Errors
/// Returns an error when the `SQLite` database cannot be opened or queried.
pub fn schema_status(db_path: &Path) -> Result<SchemaStatus> {
    SqliteStore::open(db_path)?.schema_status()
}

/// Apply pending migrations, or return planned versions for dry-run mode.
///
/// # Errors
/// Returns an error when migration planning or execution fails.
pub fn migrate(db_path: &Path, dry_run: bool) -> Result<MigrateResult> {
    let mut store = SqliteStore::open(db_path)?;
    let before = store.schema_status()?;
    if dry_run {
        return Ok(MigrateResult {
            dry_run: true,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: before.pending_versions,
            after_version: None,
            up_to_date: None,
        });
    }

    let planned_versions = before.pending_versions;
    store.migrate()?;
    let after = store.schema_status()?;
    Ok(MigrateResult {
        dry_run: false,
        current_version: before.current_version,
        target_version: before.target_version,
        would_apply_versions: planned_versions,
        after_version: Some(after.current_version),
        up_to_date: Some(after.pending_versions.is_empty()),
    })
}

fn default_track() -> bool {
    true
}

/// One record type as declared in the schema file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TypeSpec {
    pub name: EntityType,
    #[serde(default, rename = "abstract")]
    pub is_abstract: bool,
    #[serde(default = "default_track")]
    pub track: bool,
    #[serde(default)]
    pub parents: Vec<EntityType>,
    #[serde(default)]
    pub fields: Vec<FieldDescriptor>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SchemaConfig {
    #[serde(default)]
    pub types: Vec<TypeSpec>,
}

impl SchemaConfig {
    /// # Errors
    /// Returns an error when the document is not a valid schema configuration.
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        serde_yaml::from_str(raw).context("failed to parse schema configuration")
    }

    /// # Errors
    /// Returns an error when the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read schema configuration {}", path.display()))?;
        Self::from_yaml_str(&raw)
            .with_context(|| format!("invalid schema configuration {}", path.display()))
    }
}

#[derive(Debug, Clone)]
struct TypeBinding {
    spec: TypeSpec,
    ancestors: Vec<EntityType>,
    fields: Vec<FieldDescriptor>,
}

/// Declared record types with their ancestor chains and field tables, resolved once.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    bindings: BTreeMap<EntityType, TypeBinding>,
    registered: BTreeSet<EntityType>,
}

impl Registry {
    /// Declare every configured type, then register the tracked concrete ones.
    ///
    /// # Errors
    /// Returns an error for duplicate types or fields, unknown or cyclic parents, and
    /// tracked abstract types.
    pub fn from_config(config: &SchemaConfig) -> Result<Self> {
        let mut registry = Self::default();
        let mut pending = config.types.iter().collect::<Vec<_>>();

        while !pending.is_empty() {
            let before = pending.len();
            let mut deferred = Vec::new();
            for spec in pending {
                if spec.parents.iter().all(|parent| registry.bindings.contains_key(parent)) {
                    registry.declare(spec.clone())?;
                } else {
                    deferred.push(spec);
                }
            }
            if deferred.len() == before {
                let names =
                    deferred.iter().map(|spec| spec.name.as_str()).collect::<Vec<_>>().join(", ");
                return Err(HistoryError::Validation(format!(
                    "unknown or cyclic parents for: {names}"
                ))
                .into());
            }
            pending = deferred;
        }

        for spec in &config.types {
            if spec.track && !spec.is_abstract {
                registry.register(&spec.name)?;
            }
        }
        Ok(registry)
    }

    /// Declare one type. Its parents must already be declared.
    ///
    /// # Errors
    /// Returns an error for a duplicate type, duplicate own fields, or an undeclared parent.
    pub fn declare(&mut self, spec: TypeSpec) -> Result<()> {
        if self.bindings.contains_key(&spec.name) {
            return Err(
                HistoryError::Validation(format!("type {} declared twice", spec.name)).into()
            );
        }

        for (index, field) in spec.fields.iter().enumerate() {
            if spec.fields[..index].iter().any(|earlier| earlier.name == field.name) {
                return Err(HistoryError::Validation(format!(
                    "type {} declares field `{}` twice",
                    spec.name, field.name
                ))
                .into());
            }
        }

        let mut ancestors: Vec<EntityType> = Vec::new();
        for parent in &spec.parents {
            let binding = self.bindings.get(parent).ok_or_else(|| {
                HistoryError::Validation(format!("{} names undeclared parent {parent}", spec.name))
            })?;
            for ancestor in std::iter::once(parent).chain(binding.ancestors.iter()) {
                if !ancestors.contains(ancestor) {
                    ancestors.push(ancestor.clone());
                }
            }
        }

        let mut fields = spec.fields.clone();
        for ancestor in &ancestors {
            let Some(binding) = self.bindings.get(ancestor) else {
                continue;
            };
            for field in &binding.spec.fields {
                if !fields.iter().any(|existing| existing.name == field.name) {
                    fields.push(field.clone());
                }
            }
        }

        debug!(entity_type = %spec.name, ancestors = ancestors.len(), fields = fields.len(), "type declared");
        self.bindings.insert(spec.name.clone(), TypeBinding { spec, ancestors, fields });
        Ok(())
    }

    /// Register a concrete type and each of its concrete ancestors for history tracking.
    ///
    /// Returns the types that were not registered before.
    ///
    /// # Errors
    /// Returns an error when the type is undeclared or abstract.
    pub fn register(&mut self, entity_type: &EntityType) -> Result<Vec<EntityType>> {
        let mut newly_registered = Vec::new();
        for bound in self.lineage(entity_type)? {
            if self.registered.insert(bound.clone()) {
                newly_registered.push(bound);
            }
        }
        Ok(newly_registered)
    }

    #[must_use]
    pub fn is_registered(&self, entity_type: &EntityType) -> bool {
        self.registered.contains(entity_type)
    }

    #[must_use]
    pub fn is_declared(&self, entity_type: &EntityType) -> bool {
        self.bindings.contains_key(entity_type)
    }

    /// Own and inherited fields of a type.
    ///
    /// # Errors
    /// Returns [`HistoryError::NotFound`] for an undeclared type.
    pub fn fields_of(&self, entity_type: &EntityType) -> Result<&[FieldDescriptor]> {
        Ok(&self.binding(entity_type)?.fields)
    }

    /// The type itself followed by its concrete ancestors, nearest first.
    ///
    /// # Errors
    /// Returns an error for an undeclared or abstract type.
    pub fn lineage(&self, entity_type: &EntityType) -> Result<Vec<EntityType>> {
        let binding = self.binding(entity_type)?;
        if binding.spec.is_abstract {
            return Err(HistoryError::Validation(format!(
                "abstract type {entity_type} has no records"
            ))
            .into());
        }

        let mut lineage = vec![entity_type.clone()];
        for ancestor in &binding.ancestors {
            if !self.binding(ancestor)?.spec.is_abstract {
                lineage.push(ancestor.clone());
            }
        }
        Ok(lineage)
    }

    /// Concrete types that list `entity_type` among their ancestors.
    #[must_use]
    pub fn descendants_of(&self, entity_type: &EntityType) -> Vec<EntityType> {
        self.bindings
            .iter()
            .filter(|(_, binding)| {
                !binding.spec.is_abstract && binding.ancestors.contains(entity_type)
            })
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn declared_types(&self) -> impl Iterator<Item = &EntityType> {
        self.bindings.keys()
    }

    fn binding(&self, entity_type: &EntityType) -> Result<&TypeBinding> {
        self.bindings.get(entity_type).ok_or_else(|| {
            anyhow::Error::from(HistoryError::NotFound(format!(
                "entity type {entity_type} is not declared"
            )))
        })
    }
}

/// Subscriber for ledger writes. Callbacks cannot influence the write.
pub trait HistoryObserver {
    fn entry_created(&self, _entry: &FullHistoryEntry, _record: &RecordHandle) {}

    fn entry_adjusted(&self, _entry: &FullHistoryEntry, _record: &RecordHandle) {}
}

/// Reports ledger writes as `tracing` events.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl HistoryObserver for TracingObserver {
    fn entry_created(&self, entry: &FullHistoryEntry, _record: &RecordHandle) {
        info!(
            entity = %entry.entity,
            revision = entry.revision,
            action = entry.action.as_str(),
            "history entry created"
        );
    }

    fn entry_adjusted(&self, entry: &FullHistoryEntry, _record: &RecordHandle) {
        info!(entity = %entry.entity, revision = entry.revision, "history entry adjusted");
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuditReport {
    pub entity: EntityRef,
    pub revision: u32,
    pub entries: usize,
    pub fields_checked: usize,
}

/// Lifecycle hooks and replay over one history database.
pub struct HistoryTracker {
    store: SqliteStore,
    registry: Registry,
    observers: Vec<Box<dyn HistoryObserver>>,
}

impl HistoryTracker {
    /// Open the database at `db_path`, migrate it, and bind `registry`.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or migrated.
    pub fn open(db_path: &Path, registry: Registry) -> Result<Self> {
        let mut store = SqliteStore::open(db_path)?;
        store.migrate()?;
        Ok(Self::with_store(store, registry))
    }

    #[must_use]
    pub fn with_store(store: SqliteStore, registry: Registry) -> Self {
        Self { store, registry, observers: Vec::new() }
    }

    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    #[must_use]
    pub fn store(&self) -> &SqliteStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut SqliteStore {
        &mut self.store
    }

    pub fn subscribe(&mut self, observer: Box<dyn HistoryObserver>) {
        self.observers.push(observer);
    }

    /// A fresh, unsaved record of a declared concrete type.
    ///
    /// # Errors
    /// Returns an error for an undeclared or abstract type.
    pub fn new_record(&self, entity_type: &EntityType) -> Result<RecordHandle> {
        self.registry.lineage(entity_type)?;
        Ok(RecordHandle::new(entity_type.clone()))
    }

    /// Load a live record and cache its snapshot for every tracked type in its lineage.
    ///
    /// # Errors
    /// Returns [`HistoryError::NotFound`] when no live record exists.
    pub fn load(&self, entity: &EntityRef) -> Result<RecordHandle> {
        let mut record = self.store.load_record(entity)?;
        for entity_type in self.registry.lineage(&entity.entity_type)? {
            if !self.registry.is_registered(&entity_type) {
                continue;
            }
            let current = snapshot(&record, self.registry.fields_of(&entity_type)?, &self.store);
            record.cache_snapshot(entity_type, current);
        }
        Ok(record)
    }

    /// Persist `record` and write one Create or Update entry per tracked type in its lineage.
    ///
    /// Live rows of descendant types sharing the key receive the new values of the fields they
    /// inherit from the record's type, with an Update entry when they are tracked.
    ///
    /// # Errors
    /// Returns an error when the record type is not concrete, or persistence fails.
    pub fn save(
        &mut self,
        unit: &mut UnitOfWork,
        record: &mut RecordHandle,
    ) -> Result<Vec<FullHistoryEntry>> {
        let lineage = self.registry.lineage(record.entity_type())?;
        let outcome = self.persist_rows(&lineage, record)?;
        let entity_id = record.require_entity_ref()?.entity_id;

        let mut written = Vec::new();
        for entity_type in &lineage {
            if !self.registry.is_registered(entity_type) {
                continue;
            }
            let fields = self.registry.fields_of(entity_type)?.to_vec();
            let current = snapshot(record, &fields, &self.store);
            let data = match outcome {
                SaveOutcome::Created => full_snapshot_as_delta(&current),
                SaveOutcome::Updated => update_delta(record.cached_snapshot(entity_type), &current),
            };

            let entity = EntityRef::new(entity_type.clone(), entity_id)?;
            written.push(self.append(unit, entity, outcome.action(), Some(data), record)?);
            record.cache_snapshot(entity_type.clone(), current);
        }
        written.extend(self.sync_descendants(unit, record)?);
        Ok(written)
    }

    /// Remove the live rows of `record` and write one Delete entry per tracked type.
    ///
    /// # Errors
    /// Returns [`HistoryError::NotFound`] when the record has no live row.
    pub fn delete(
        &mut self,
        unit: &mut UnitOfWork,
        record: &mut RecordHandle,
    ) -> Result<Vec<FullHistoryEntry>> {
        let concrete = record.require_entity_ref()?;
        if !self.store.record_exists(&concrete)? {
            return Err(HistoryError::NotFound(format!("live record {concrete}")).into());
        }

        let mut written = Vec::new();
        for entity_type in self.registry.lineage(&concrete.entity_type)? {
            let entity = EntityRef::new(entity_type.clone(), concrete.entity_id)?;
            self.store.delete_record(&entity)?;
            if self.registry.is_registered(&entity_type) {
                written.push(self.append(unit, entity, Action::Delete, None, record)?);
            }
        }
        record.clear_cached_snapshots();
        Ok(written)
    }

    /// Replace a many-to-many field outside the primary save, then run the deferred adjustment.
    ///
    /// # Errors
    /// Returns an error when `field` is not a many-to-many field of the record's type, the
    /// record has no identity or no live row, or persistence fails.
    pub fn set_related(
        &mut self,
        unit: &mut UnitOfWork,
        record: &mut RecordHandle,
        field: &str,
        members: Vec<i64>,
    ) -> Result<Vec<FullHistoryEntry>> {
        let deferred = self
            .registry
            .fields_of(record.entity_type())?
            .iter()
            .find(|descriptor| descriptor.name == field)
            .map(|descriptor| descriptor.kind.is_deferred());
        match deferred {
            Some(true) => {}
            Some(false) => {
                return Err(HistoryError::Validation(format!(
                    "field `{field}` of {} is not many-to-many",
                    record.entity_type()
                ))
                .into());
            }
            None => {
                return Err(HistoryError::Validation(format!(
                    "{} has no field `{field}`",
                    record.entity_type()
                ))
                .into());
            }
        }
        let entity = record.require_entity_ref()?;
        if !self.store.record_exists(&entity)? {
            return Err(HistoryError::NotFound(format!("live record {entity}")).into());
        }

        record.set(field, FieldValue::Members(members));
        let lineage = self.registry.lineage(record.entity_type())?;
        self.persist_rows(&lineage, record)?;
        let mut touched = self.adjust(unit, record, Action::Update)?;
        touched.extend(self.sync_descendants(unit, record)?);
        Ok(touched)
    }

    /// Record changes to deferred fields made after the primary save.
    ///
    /// The changes are merged into the latest entry written for the same entity by this unit
    /// of work; without one, a new entry with `action` is appended.
    ///
    /// # Errors
    /// Returns an error when the record has no identity, or the ledger write fails.
    pub fn adjust(
        &mut self,
        unit: &mut UnitOfWork,
        record: &mut RecordHandle,
        action: Action,
    ) -> Result<Vec<FullHistoryEntry>> {
        let entity_id = record.require_entity_ref()?.entity_id;
        let lineage = self.registry.lineage(record.entity_type())?;

        let mut touched = Vec::new();
        for entity_type in &lineage {
            if !self.registry.is_registered(entity_type) {
                continue;
            }
            let fields = self.registry.fields_of(entity_type)?.to_vec();
            let current = snapshot(record, &fields, &self.store);
            let adjusted = match record.cached_snapshot(entity_type) {
                Some(prior) => diff(prior, &current),
                None => full_snapshot_as_delta(&current),
            };
            if adjusted.is_empty() {
                continue;
            }

            let entity = EntityRef::new(entity_type.clone(), entity_id)?;
            let amended = match unit.request_id() {
                Some(request_id) => self.store.amend_latest_for_request(
                    &entity,
                    request_id,
                    &adjusted,
                    &unit.actor_name(),
                )?,
                None => None,
            };

            let entry = if let Some(amended) = amended {
                for observer in &self.observers {
                    observer.entry_adjusted(&amended, record);
                }
                amended
            } else {
                let data = merge_adjustment(action, None, adjusted);
                self.append(unit, entity, action, Some(data), record)?
            };

            record.cache_snapshot(entity_type.clone(), current);
            touched.push(entry);
        }
        Ok(touched)
    }

    /// Fold the ledger of `entity`, optionally stopping at `up_to` (inclusive).
    ///
    /// # Errors
    /// Returns [`HistoryError::NotFound`] for an empty ledger or a missing `up_to` revision,
    /// and the fold errors of [`fold_entries`].
    pub fn reconstruct(
        &self,
        entity: &EntityRef,
        up_to: Option<u32>,
        audit: bool,
    ) -> Result<Snapshot> {
        let entries = self.store.entries_in_range(entity, None, up_to)?;
        if let Some(revision) = up_to {
            if entries.last().map(|entry| entry.revision) != Some(revision) {
                return Err(
                    HistoryError::NotFound(format!("{entity} has no revision {revision}")).into()
                );
            }
        }
        fold_logged(entity, &entries, audit)
    }

    /// Replay the full ledger with audit and compare it with the in-memory `record`.
    ///
    /// # Errors
    /// Returns [`HistoryError::AuditMismatch`] or [`HistoryError::InvariantViolation`] when the
    /// ledger does not explain the record.
    pub fn audit(&self, record: &RecordHandle) -> Result<AuditReport> {
        let entity = record.require_entity_ref()?;
        let live = snapshot(record, self.registry.fields_of(record.entity_type())?, &self.store);
        let entries = self.store.entries_for(&entity)?;
        let replayed = fold_logged(&entity, &entries, true)?;
        let revision = entries.last().map_or(0, |entry| entry.revision);

        let fields_checked =
            verify_live_state(&entity, &replayed, &live, revision).map_err(|err| {
                warn!(entity = %entity, error = %err, "live record disagrees with history");
                err
            })?;

        Ok(AuditReport { entity, revision, entries: entries.len(), fields_checked })
    }

    /// Load the live record of `entity`, then [`HistoryTracker::audit`] it.
    ///
    /// # Errors
    /// Returns [`HistoryError::NotFound`] when no live record exists, and the audit errors.
    pub fn audit_stored(&self, entity: &EntityRef) -> Result<AuditReport> {
        let record = self.store.load_record(entity)?;
        self.audit(&record)
    }

    /// Roll `record` back to `revision` (or its latest state).
    ///
    /// # Errors
    /// See [`HistoryTracker::restore`].
    pub fn rollback(
        &mut self,
        unit: &mut UnitOfWork,
        record: &RecordHandle,
        revision: Option<u32>,
        commit: bool,
    ) -> Result<RecordHandle> {
        let entity = record.require_entity_ref()?;
        self.restore(unit, &entity, revision, commit)
    }

    /// Rebuild `entity` as of `revision` from an audited replay; with `commit`, save it as the
    /// live record through the regular save hooks.
    ///
    /// Works for entities whose live record was deleted.
    ///
    /// # Errors
    /// Returns [`HistoryError::NotFound`] for a missing revision, the replay errors, or an
    /// error when saving fails.
    pub fn restore(
        &mut self,
        unit: &mut UnitOfWork,
        entity: &EntityRef,
        revision: Option<u32>,
        commit: bool,
    ) -> Result<RecordHandle> {
        let mut record = self.materialize(entity, revision, true)?;
        if commit {
            self.save(unit, &mut record)?;
            info!(entity = %entity, revision = ?revision, "record restored from history");
        }
        Ok(record)
    }

    /// Detached view of `entity` exactly as of `revision`, replayed without audit.
    ///
    /// # Errors
    /// Returns [`HistoryError::NotFound`] when the revision does not exist.
    pub fn preview_version(&self, entity: &EntityRef, revision: u32) -> Result<RecordHandle> {
        self.store.entry_at(entity, revision)?;
        self.materialize(entity, Some(revision), false)
    }

    /// # Errors
    /// Returns an error when the ledger query fails.
    pub fn entries_for(&self, entity: &EntityRef) -> Result<Vec<FullHistoryEntry>> {
        self.store.entries_for(entity)
    }

    /// # Errors
    /// Returns an error when the ledger query fails.
    pub fn entries_in_range(
        &self,
        entity: &EntityRef,
        from: Option<u32>,
        to: Option<u32>,
    ) -> Result<Vec<FullHistoryEntry>> {
        self.store.entries_in_range(entity, from, to)
    }

    /// # Errors
    /// Returns an error when the ledger query fails.
    pub fn entries_for_actor(&self, actor_id: i64) -> Result<Vec<FullHistoryEntry>> {
        self.store.entries_for_actor(actor_id)
    }

    /// # Errors
    /// Returns an error when the ledger query fails.
    pub fn entries_for_request(&self, request_id: RequestId) -> Result<Vec<FullHistoryEntry>> {
        self.store.entries_for_request(request_id)
    }

    /// Latest entry for `entity` written by this unit of work, if any.
    ///
    /// # Errors
    /// Returns an error when the ledger query fails.
    pub fn active_entry(
        &self,
        unit: &UnitOfWork,
        entity: &EntityRef,
    ) -> Result<Option<FullHistoryEntry>> {
        match unit.request_id() {
            Some(request_id) => self.store.latest_entry_for_request(entity, request_id),
            None => Ok(None),
        }
    }

    /// # Errors
    /// Returns [`HistoryError::NotFound`] for an unknown request.
    pub fn request(&self, request_id: RequestId) -> Result<RequestRecord> {
        self.store.request(request_id)
    }

    /// # Errors
    /// Returns [`HistoryError::NotFound`] at the start of the ledger.
    pub fn previous(&self, entry: &FullHistoryEntry) -> Result<FullHistoryEntry> {
        self.store.previous(entry)
    }

    /// # Errors
    /// Returns [`HistoryError::NotFound`] at the end of the ledger.
    pub fn next(&self, entry: &FullHistoryEntry) -> Result<FullHistoryEntry> {
        self.store.next(entry)
    }

    fn materialize(
        &self,
        entity: &EntityRef,
        revision: Option<u32>,
        audit: bool,
    ) -> Result<RecordHandle> {
        let state = self.reconstruct(entity, revision, audit)?;
        let fields = self.registry.fields_of(&entity.entity_type)?;
        Ok(record_from_snapshot(&entity.entity_type, Some(entity.entity_id), fields, &state)?)
    }

    fn persist_rows(
        &mut self,
        lineage: &[EntityType],
        record: &mut RecordHandle,
    ) -> Result<SaveOutcome> {
        let outcome = self.store.save_record(record)?;
        for ancestor in lineage.iter().skip(1) {
            let mut row = record.project(ancestor, self.registry.fields_of(ancestor)?);
            self.store.save_record(&mut row)?;
        }
        Ok(outcome)
    }

    fn sync_descendants(
        &mut self,
        unit: &mut UnitOfWork,
        record: &RecordHandle,
    ) -> Result<Vec<FullHistoryEntry>> {
        let entity_id = record.require_entity_ref()?.entity_id;
        let inherited = self.registry.fields_of(record.entity_type())?.to_vec();

        let mut written = Vec::new();
        for descendant in self.registry.descendants_of(record.entity_type()) {
            let entity = EntityRef::new(descendant.clone(), entity_id)?;
            if !self.store.record_exists(&entity)? {
                continue;
            }

            let mut row = self.load(&entity)?;
            let mut changed = false;
            for field in &inherited {
                let value = record.get(&field.name).cloned().unwrap_or(FieldValue::Null);
                if row.get(&field.name).unwrap_or(&FieldValue::Null) != &value {
                    row.set(&field.name, value);
                    changed = true;
                }
            }
            if !changed {
                continue;
            }

            self.store.save_record(&mut row)?;
            debug!(entity = %entity, source = %record.entity_type(), "inherited fields synced");
            if !self.registry.is_registered(&descendant) {
                continue;
            }
            let fields = self.registry.fields_of(&descendant)?.to_vec();
            let current = snapshot(&row, &fields, &self.store);
            let data = update_delta(row.cached_snapshot(&descendant), &current);
            written.push(self.append(unit, entity, Action::Update, Some(data), &row)?);
        }
        Ok(written)
    }

    fn append(
        &mut self,
        unit: &mut UnitOfWork,
        entity: EntityRef,
        action: Action,
        data: Option<EntryData>,
        record: &RecordHandle,
    ) -> Result<FullHistoryEntry> {
        if let Some(pending) = unit.pending_request() {
            self.store.insert_request(&pending)?;
            unit.bind_request(pending)?;
        }

        let info = summarize(action, &unit.actor_name(), data.as_ref());
        let entry = self.store.append_entry(&NewEntry {
            entity,
            action,
            data,
            request_id: unit.request_id(),
            info,
        })?;
        for observer in &self.observers {
            observer.entry_created(&entry, record);
        }
        Ok(entry)
    }
}

fn fold_logged(
    entity: &EntityRef,
    entries: &[FullHistoryEntry],
    audit: bool,
) -> Result<Snapshot> {
    fold_entries(entity, entries, audit).map_err(|err| {
        if matches!(
            err,
            HistoryError::AuditMismatch { .. } | HistoryError::InvariantViolation { .. }
        ) {
            warn!(entity = %entity, error = %err, "history replay failed");
        }
        anyhow::Error::from(err)
    })
}
