use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use ulid::Ulid;

pub const SYSTEM_ACTOR_NAME: &str = "(System)";
pub const ANONYMOUS_ACTOR_NAME: &str = "(Anonymous)";
pub const MAX_ACTOR_NAME_CHARS: usize = 255;
pub const MAX_ORIGIN_PATH_CHARS: usize = 255;
const INFO_PREVIEW_CHARS: usize = 50;

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum HistoryError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("invariant violation for {entity} at revision {revision}: {detail}")]
    InvariantViolation { entity: EntityRef, revision: u32, detail: String },
    #[error(
        "audit mismatch for {entity} at revision {revision}: field `{field}` expected {expected}, found {actual}"
    )]
    AuditMismatch { entity: EntityRef, revision: u32, field: String, expected: Value, actual: Value },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("write conflict for {entity}: revision {revision} still taken after {attempts} attempts")]
    WriteConflict { entity: EntityRef, revision: u32, attempts: u32 },
}

/// Registered record type tag, e.g. `ticket` or `auth.user`.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct EntityType(String);

impl EntityType {
    /// Parse a type tag made of lowercase ASCII letters, digits, `_` and `.`.
    ///
    /// # Errors
    /// Returns [`HistoryError::Validation`] for empty tags or tags with other characters.
    pub fn parse(value: &str) -> Result<Self, HistoryError> {
        if value.is_empty() {
            return Err(HistoryError::Validation("entity type MUST be non-empty".to_string()));
        }
        if !value.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '.')
        {
            return Err(HistoryError::Validation(format!(
                "entity type `{value}` MUST match [a-z0-9_.]+"
            )));
        }
        Ok(Self(value.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for EntityType {
    type Error = HistoryError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<EntityType> for String {
    fn from(value: EntityType) -> Self {
        value.0
    }
}

impl Display for EntityType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Polymorphic reference to one subject record.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct EntityRef {
    pub entity_type: EntityType,
    pub entity_id: i64,
}

impl EntityRef {
    /// # Errors
    /// Returns [`HistoryError::Validation`] when `entity_id` is not positive.
    pub fn new(entity_type: EntityType, entity_id: i64) -> Result<Self, HistoryError> {
        if entity_id < 1 {
            return Err(HistoryError::Validation(format!(
                "entity id MUST be >= 1 (got {entity_id} for {entity_type})"
            )));
        }
        Ok(Self { entity_type, entity_id })
    }
}

impl Display for EntityRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.entity_type, self.entity_id)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RequestId(pub Ulid);

impl RequestId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for RequestId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct EntryId(pub Ulid);

impl EntryId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for EntryId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for EntryId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Create,
    Update,
    Delete,
}

impl Action {
    /// Single-letter code used by the ledger table.
    #[must_use]
    pub fn as_code(self) -> &'static str {
        match self {
            Self::Create => "C",
            Self::Update => "U",
            Self::Delete => "D",
        }
    }

    #[must_use]
    pub fn parse_code(value: &str) -> Option<Self> {
        match value {
            "C" => Some(Self::Create),
            "U" => Some(Self::Update),
            "D" => Some(Self::Delete),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    #[must_use]
    pub fn past_tense(self) -> &'static str {
        match self {
            Self::Create => "Created",
            Self::Update => "Updated",
            Self::Delete => "Deleted",
        }
    }
}

/// Who performs the changes of one unit of work.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct ActorContext {
    pub actor_id: Option<i64>,
    pub actor_name: Option<String>,
    pub origin_path: Option<String>,
    #[serde(default)]
    pub anonymous: bool,
}

impl ActorContext {
    #[must_use]
    pub fn system() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn anonymous() -> Self {
        Self { anonymous: true, ..Self::default() }
    }

    #[must_use]
    pub fn user(actor_id: i64, actor_name: impl Into<String>) -> Self {
        Self { actor_id: Some(actor_id), actor_name: Some(actor_name.into()), ..Self::default() }
    }

    #[must_use]
    pub fn with_origin_path(mut self, origin_path: impl Into<String>) -> Self {
        self.origin_path = Some(origin_path.into());
        self
    }

    /// Resolve the name recorded on the `Request` row and in entry summaries.
    #[must_use]
    pub fn display_name(&self) -> String {
        let name = match (&self.actor_name, self.actor_id) {
            (Some(name), _) if !name.trim().is_empty() => name.clone(),
            _ if self.anonymous => ANONYMOUS_ACTOR_NAME.to_string(),
            (_, Some(actor_id)) => format!("user:{actor_id}"),
            _ => SYSTEM_ACTOR_NAME.to_string(),
        };
        truncate_chars(&name, MAX_ACTOR_NAME_CHARS)
    }

    #[must_use]
    pub fn truncated_origin_path(&self) -> Option<String> {
        self.origin_path.as_deref().map(|path| truncate_chars(path, MAX_ORIGIN_PATH_CHARS))
    }
}

/// Persisted actor record shared by every entry of one unit of work.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RequestRecord {
    pub request_id: RequestId,
    pub actor_id: Option<i64>,
    pub actor_name: String,
    pub origin_path: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl RequestRecord {
    #[must_use]
    pub fn from_context(context: &ActorContext) -> Self {
        Self {
            request_id: RequestId::new(),
            actor_id: context.actor_id,
            actor_name: context.display_name(),
            origin_path: context.truncated_origin_path(),
            created_at: OffsetDateTime::now_utc(),
        }
    }
}

/// Explicitly passed unit-of-work scope.
///
/// A unit begun with [`UnitOfWork::begin`] binds one `Request` row on its first history write
/// and reuses it for every later write. A detached unit never creates a `Request`.
#[derive(Debug)]
pub struct UnitOfWork {
    context: ActorContext,
    detached: bool,
    request: Option<RequestRecord>,
}

impl UnitOfWork {
    #[must_use]
    pub fn begin(context: ActorContext) -> Self {
        Self { context, detached: false, request: None }
    }

    #[must_use]
    pub fn detached() -> Self {
        Self { context: ActorContext::system(), detached: true, request: None }
    }

    #[must_use]
    pub fn context(&self) -> &ActorContext {
        &self.context
    }

    #[must_use]
    pub fn is_detached(&self) -> bool {
        self.detached
    }

    #[must_use]
    pub fn actor_name(&self) -> String {
        self.context.display_name()
    }

    #[must_use]
    pub fn request(&self) -> Option<&RequestRecord> {
        self.request.as_ref()
    }

    #[must_use]
    pub fn request_id(&self) -> Option<RequestId> {
        self.request.as_ref().map(|request| request.request_id)
    }

    /// The `Request` row that must be persisted before the next write, if any.
    #[must_use]
    pub fn pending_request(&self) -> Option<RequestRecord> {
        if self.detached || self.request.is_some() {
            return None;
        }
        Some(RequestRecord::from_context(&self.context))
    }

    /// # Errors
    /// Returns [`HistoryError::Validation`] when the unit is detached or already bound.
    pub fn bind_request(&mut self, request: RequestRecord) -> Result<(), HistoryError> {
        if self.detached {
            return Err(HistoryError::Validation(
                "detached unit of work cannot bind a request".to_string(),
            ));
        }
        if let Some(existing) = &self.request {
            return Err(HistoryError::Validation(format!(
                "unit of work already bound to request {}",
                existing.request_id
            )));
        }
        self.request = Some(request);
        Ok(())
    }

    /// Close the unit of work, releasing its actor and request binding.
    #[must_use]
    pub fn end(self) -> Option<RequestRecord> {
        self.request
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FieldKind {
    Scalar,
    Timestamp,
    File,
    Relation { target: EntityType },
    ManyToMany { target: EntityType },
}

impl FieldKind {
    #[must_use]
    pub fn is_relation(&self) -> bool {
        matches!(self, Self::Relation { .. } | Self::ManyToMany { .. })
    }

    /// Deferred fields are written outside the primary save.
    #[must_use]
    pub fn is_deferred(&self) -> bool {
        matches!(self, Self::ManyToMany { .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct FieldDescriptor {
    pub name: String,
    #[serde(flatten)]
    pub kind: FieldKind,
}

impl FieldDescriptor {
    #[must_use]
    pub fn scalar(name: &str) -> Self {
        Self { name: name.to_string(), kind: FieldKind::Scalar }
    }

    #[must_use]
    pub fn timestamp(name: &str) -> Self {
        Self { name: name.to_string(), kind: FieldKind::Timestamp }
    }

    #[must_use]
    pub fn file(name: &str) -> Self {
        Self { name: name.to_string(), kind: FieldKind::File }
    }

    #[must_use]
    pub fn relation(name: &str, target: EntityType) -> Self {
        Self { name: name.to_string(), kind: FieldKind::Relation { target } }
    }

    #[must_use]
    pub fn many_to_many(name: &str, target: EntityType) -> Self {
        Self { name: name.to_string(), kind: FieldKind::ManyToMany { target } }
    }
}

/// Live value of one field on a record handle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    Timestamp(#[serde(with = "time::serde::rfc3339")] OffsetDateTime),
    File(String),
    Reference(Option<i64>),
    Members(Vec<i64>),
}

impl FieldValue {
    #[must_use]
    pub fn text(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

/// Flat field-name to JSON-scalar mapping that every comparison runs on.
pub type Snapshot = BTreeMap<String, Value>;

/// In-memory handle to one record, carrying the snapshot cached at its last load or write.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordHandle {
    entity_type: EntityType,
    entity_id: Option<i64>,
    values: BTreeMap<String, FieldValue>,
    cached: BTreeMap<EntityType, Snapshot>,
}

impl RecordHandle {
    #[must_use]
    pub fn new(entity_type: EntityType) -> Self {
        Self { entity_type, entity_id: None, values: BTreeMap::new(), cached: BTreeMap::new() }
    }

    #[must_use]
    pub fn from_values(
        entity_type: EntityType,
        entity_id: Option<i64>,
        values: BTreeMap<String, FieldValue>,
    ) -> Self {
        Self { entity_type, entity_id, values, cached: BTreeMap::new() }
    }

    #[must_use]
    pub fn entity_type(&self) -> &EntityType {
        &self.entity_type
    }

    #[must_use]
    pub fn entity_id(&self) -> Option<i64> {
        self.entity_id
    }

    pub fn assign_id(&mut self, entity_id: i64) {
        self.entity_id = Some(entity_id);
    }

    #[must_use]
    pub fn entity_ref(&self) -> Option<EntityRef> {
        self.entity_id.and_then(|id| EntityRef::new(self.entity_type.clone(), id).ok())
    }

    /// # Errors
    /// Returns [`HistoryError::Validation`] when the record has no persisted identity.
    pub fn require_entity_ref(&self) -> Result<EntityRef, HistoryError> {
        self.entity_ref().ok_or_else(|| {
            HistoryError::Validation(format!("{} record has no persisted identity", self.entity_type))
        })
    }

    #[must_use]
    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.values.get(field)
    }

    pub fn set(&mut self, field: impl Into<String>, value: FieldValue) {
        self.values.insert(field.into(), value);
    }

    #[must_use]
    pub fn with(mut self, field: impl Into<String>, value: FieldValue) -> Self {
        self.set(field, value);
        self
    }

    #[must_use]
    pub fn values(&self) -> &BTreeMap<String, FieldValue> {
        &self.values
    }

    /// View this record as its ancestor `entity_type`, keeping only that type's fields.
    #[must_use]
    pub fn project(&self, entity_type: &EntityType, fields: &[FieldDescriptor]) -> Self {
        let values = fields
            .iter()
            .filter_map(|field| {
                self.values.get(&field.name).map(|value| (field.name.clone(), value.clone()))
            })
            .collect();
        let mut cached = BTreeMap::new();
        if let Some(snapshot) = self.cached.get(entity_type) {
            cached.insert(entity_type.clone(), snapshot.clone());
        }
        Self { entity_type: entity_type.clone(), entity_id: self.entity_id, values, cached }
    }

    #[must_use]
    pub fn cached_snapshot(&self, entity_type: &EntityType) -> Option<&Snapshot> {
        self.cached.get(entity_type)
    }

    pub fn cache_snapshot(&mut self, entity_type: EntityType, snapshot: Snapshot) {
        self.cached.insert(entity_type, snapshot);
    }

    pub fn clear_cached_snapshots(&mut self) {
        self.cached.clear();
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[error("relation resolution failed: {0}")]
pub struct ResolveError(pub String);

/// Looks up whether a referenced record exists.
pub trait RelationResolver {
    /// # Errors
    /// Implementations return [`ResolveError`] when the lookup itself fails.
    fn resolve(&self, target: &EntityRef) -> Result<bool, ResolveError>;
}

/// Resolver that accepts every positive key without a lookup.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrustStoredKeys;

impl RelationResolver for TrustStoredKeys {
    fn resolve(&self, _target: &EntityRef) -> Result<bool, ResolveError> {
        Ok(true)
    }
}

/// Convert a record into its snapshot over the declared `fields`.
///
/// Relations store the referenced key; a missing target or a failing lookup is stored as
/// null rather than reported.
#[must_use]
pub fn snapshot(
    record: &RecordHandle,
    fields: &[FieldDescriptor],
    resolver: &dyn RelationResolver,
) -> Snapshot {
    fields
        .iter()
        .map(|field| {
            let value = record.get(&field.name).unwrap_or(&FieldValue::Null);
            (field.name.clone(), encode_field(&field.kind, value, resolver))
        })
        .collect()
}

fn encode_field(kind: &FieldKind, value: &FieldValue, resolver: &dyn RelationResolver) -> Value {
    match (kind, value) {
        (FieldKind::Relation { target }, FieldValue::Reference(Some(key))) => {
            resolve_key(target, *key, resolver).map_or(Value::Null, Value::from)
        }
        (FieldKind::Relation { .. }, _) => Value::Null,
        (FieldKind::ManyToMany { target }, FieldValue::Members(keys)) => {
            let mut resolved =
                keys.iter().filter_map(|key| resolve_key(target, *key, resolver)).collect::<Vec<_>>();
            resolved.sort_unstable();
            resolved.dedup();
            Value::Array(resolved.into_iter().map(Value::from).collect())
        }
        (FieldKind::ManyToMany { .. }, _) => Value::Array(Vec::new()),
        (_, value) => scalar_json(value),
    }
}

fn resolve_key(target: &EntityType, key: i64, resolver: &dyn RelationResolver) -> Option<i64> {
    let reference = EntityRef::new(target.clone(), key).ok()?;
    match resolver.resolve(&reference) {
        Ok(true) => Some(key),
        Ok(false) | Err(_) => None,
    }
}

fn scalar_json(value: &FieldValue) -> Value {
    match value {
        FieldValue::Null | FieldValue::Reference(None) => Value::Null,
        FieldValue::Bool(flag) => Value::Bool(*flag),
        FieldValue::Integer(number) => Value::from(*number),
        FieldValue::Float(number) => {
            serde_json::Number::from_f64(*number).map_or(Value::Null, Value::Number)
        }
        FieldValue::Text(text) | FieldValue::File(text) => Value::String(text.clone()),
        FieldValue::Timestamp(at) => at.format(&Rfc3339).map_or(Value::Null, Value::String),
        FieldValue::Reference(Some(key)) => Value::from(*key),
        FieldValue::Members(keys) => Value::Array(keys.iter().copied().map(Value::from).collect()),
    }
}

/// Rebuild a detached record from a snapshot, resolving relations back from stored keys.
///
/// # Errors
/// Returns [`HistoryError::Validation`] when a stored value does not fit its declared kind.
pub fn record_from_snapshot(
    entity_type: &EntityType,
    entity_id: Option<i64>,
    fields: &[FieldDescriptor],
    snapshot: &Snapshot,
) -> Result<RecordHandle, HistoryError> {
    let mut values = BTreeMap::new();
    for field in fields {
        let raw = snapshot.get(&field.name).unwrap_or(&Value::Null);
        values.insert(field.name.clone(), decode_field(field, raw)?);
    }
    Ok(RecordHandle::from_values(entity_type.clone(), entity_id, values))
}

fn decode_field(field: &FieldDescriptor, raw: &Value) -> Result<FieldValue, HistoryError> {
    let mismatch = || {
        HistoryError::Validation(format!(
            "stored value {raw} does not fit {:?} field `{}`",
            field.kind, field.name
        ))
    };

    match (&field.kind, raw) {
        (FieldKind::Relation { .. }, Value::Null) => Ok(FieldValue::Reference(None)),
        (FieldKind::Relation { .. }, Value::Number(number)) => {
            number.as_i64().map(|key| FieldValue::Reference(Some(key))).ok_or_else(mismatch)
        }
        (FieldKind::ManyToMany { .. }, Value::Null) => Ok(FieldValue::Members(Vec::new())),
        (FieldKind::ManyToMany { .. }, Value::Array(items)) => items
            .iter()
            .map(|item| item.as_i64().ok_or_else(mismatch))
            .collect::<Result<Vec<_>, _>>()
            .map(FieldValue::Members),
        (FieldKind::Timestamp, Value::String(text)) => OffsetDateTime::parse(text, &Rfc3339)
            .map(FieldValue::Timestamp)
            .map_err(|_| mismatch()),
        (FieldKind::File, Value::String(path)) => Ok(FieldValue::File(path.clone())),
        (FieldKind::Scalar | FieldKind::Timestamp | FieldKind::File, Value::Null) => {
            Ok(FieldValue::Null)
        }
        (FieldKind::Scalar, Value::Bool(flag)) => Ok(FieldValue::Bool(*flag)),
        (FieldKind::Scalar, Value::Number(number)) => match number.as_i64() {
            Some(integer) => Ok(FieldValue::Integer(integer)),
            None => number.as_f64().map(FieldValue::Float).ok_or_else(mismatch),
        },
        (FieldKind::Scalar, Value::String(text)) => Ok(FieldValue::Text(text.clone())),
        _ => Err(mismatch()),
    }
}

/// Recorded change of one field: `[value]` when set outright, `[old, new]` when changed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(try_from = "Vec<Value>", into = "Vec<Value>")]
pub enum FieldDelta {
    Set(Value),
    Changed { old: Value, new: Value },
}

impl FieldDelta {
    /// The value the field holds after this delta.
    #[must_use]
    pub fn current(&self) -> &Value {
        match self {
            Self::Set(value) | Self::Changed { new: value, .. } => value,
        }
    }

    #[must_use]
    pub fn previous(&self) -> Option<&Value> {
        match self {
            Self::Set(_) => None,
            Self::Changed { old, .. } => Some(old),
        }
    }

    #[must_use]
    pub fn collapse(self) -> Self {
        match self {
            Self::Set(value) | Self::Changed { new: value, .. } => Self::Set(value),
        }
    }
}

impl TryFrom<Vec<Value>> for FieldDelta {
    type Error = String;

    fn try_from(value: Vec<Value>) -> Result<Self, Self::Error> {
        let arity = value.len();
        let mut items = value.into_iter();
        match (items.next(), items.next(), items.next()) {
            (Some(single), None, None) => Ok(Self::Set(single)),
            (Some(old), Some(new), None) => Ok(Self::Changed { old, new }),
            _ => Err(format!("field delta MUST hold 1 or 2 values, found {arity}")),
        }
    }
}

impl From<FieldDelta> for Vec<Value> {
    fn from(value: FieldDelta) -> Self {
        match value {
            FieldDelta::Set(value) => vec![value],
            FieldDelta::Changed { old, new } => vec![old, new],
        }
    }
}

pub type EntryData = BTreeMap<String, FieldDelta>;

/// Changed fields over the union of both snapshots; a key missing on one side compares as null.
#[must_use]
pub fn diff(prior: &Snapshot, current: &Snapshot) -> EntryData {
    let mut changes = EntryData::new();
    for key in prior.keys().chain(current.keys()) {
        if changes.contains_key(key) {
            continue;
        }
        let old = prior.get(key).unwrap_or(&Value::Null);
        let new = current.get(key).unwrap_or(&Value::Null);
        if old != new {
            changes.insert(key.clone(), FieldDelta::Changed { old: old.clone(), new: new.clone() });
        }
    }
    changes
}

#[must_use]
pub fn full_snapshot_as_delta(snapshot: &Snapshot) -> EntryData {
    snapshot.iter().map(|(key, value)| (key.clone(), FieldDelta::Set(value.clone()))).collect()
}

/// Delta recorded for an Update.
///
/// Without a prior snapshot, or when nothing changed by value, the full current snapshot is
/// recorded so the entry still replays to the live state.
#[must_use]
pub fn update_delta(prior: Option<&Snapshot>, current: &Snapshot) -> EntryData {
    let Some(prior) = prior else {
        return full_snapshot_as_delta(current);
    };
    let changes = diff(prior, current);
    if changes.is_empty() {
        full_snapshot_as_delta(current)
    } else {
        changes
    }
}

/// Merge a deferred-field adjustment into the data of the entry it amends.
///
/// Adjustments landing on a Create are collapsed to their new values first.
#[must_use]
pub fn merge_adjustment(
    target_action: Action,
    existing: Option<EntryData>,
    adjusted: EntryData,
) -> EntryData {
    let mut merged = existing.unwrap_or_default();
    for (field, delta) in adjusted {
        let delta = if target_action == Action::Create { delta.collapse() } else { delta };
        merged.insert(field, delta);
    }
    merged
}

/// Human-readable summary stored once as the entry's `info`.
#[must_use]
pub fn summarize(action: Action, actor_name: &str, data: Option<&EntryData>) -> String {
    let mut info = format!("{actor_name} {}", action.past_tense());
    if action == Action::Update {
        for (field, delta) in data.into_iter().flatten() {
            let FieldDelta::Changed { old, new } = delta else {
                break;
            };
            info.push_str(&format!(
                "\n\"{field}\" changed from [{}] to [{}]",
                preview(old),
                preview(new)
            ));
        }
    }
    info
}

fn preview(value: &Value) -> String {
    let rendered = match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    };
    truncate_chars(&rendered, INFO_PREVIEW_CHARS)
}

fn truncate_chars(value: &str, max_chars: usize) -> String {
    value.chars().take(max_chars).collect()
}

/// One row of an entity's ledger.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FullHistoryEntry {
    pub entry_id: EntryId,
    pub entity: EntityRef,
    pub revision: u32,
    pub action: Action,
    pub data: Option<EntryData>,
    pub request_id: Option<RequestId>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub info: String,
}

impl FullHistoryEntry {
    /// Revision of the entry before this one.
    ///
    /// # Errors
    /// Returns [`HistoryError::NotFound`] for the first entry of a ledger.
    pub fn previous_revision(&self) -> Result<u32, HistoryError> {
        self.revision.checked_sub(1).ok_or_else(|| {
            HistoryError::NotFound(format!("{} has no revision before 0", self.entity))
        })
    }

    /// # Errors
    /// Returns [`HistoryError::NotFound`] when the next revision number is not representable.
    pub fn next_revision(&self) -> Result<u32, HistoryError> {
        self.revision.checked_add(1).ok_or_else(|| {
            HistoryError::NotFound(format!("{} has no revision after {}", self.entity, self.revision))
        })
    }
}

/// Fold an entity's ordered ledger into the field state it describes.
///
/// With `audit`, every `[old, new]` delta must find `old` in the accumulated state.
///
/// # Errors
/// Returns [`HistoryError::NotFound`] for an empty ledger, [`HistoryError::InvariantViolation`]
/// when revisions are not `0..n` or the ledger does not begin with a Create, and
/// [`HistoryError::AuditMismatch`] when an audited delta disagrees with the replayed state.
pub fn fold_entries(
    entity: &EntityRef,
    entries: &[FullHistoryEntry],
    audit: bool,
) -> Result<Snapshot, HistoryError> {
    let Some(first) = entries.first() else {
        return Err(HistoryError::NotFound(format!("no history recorded for {entity}")));
    };

    for (index, entry) in entries.iter().enumerate() {
        let expected = u32::try_from(index)
            .map_err(|_| HistoryError::Validation(format!("ledger for {entity} is too long")))?;
        if entry.entity != *entity {
            return Err(HistoryError::InvariantViolation {
                entity: entity.clone(),
                revision: entry.revision,
                detail: format!("entry {} belongs to {}", entry.entry_id, entry.entity),
            });
        }
        if entry.revision != expected {
            return Err(HistoryError::InvariantViolation {
                entity: entity.clone(),
                revision: entry.revision,
                detail: format!("expected revision {expected}"),
            });
        }
    }

    if first.action != Action::Create {
        return Err(HistoryError::InvariantViolation {
            entity: entity.clone(),
            revision: first.revision,
            detail: "ledger must begin with Create".to_string(),
        });
    }

    let mut state = first
        .data
        .iter()
        .flatten()
        .map(|(field, delta)| (field.clone(), delta.current().clone()))
        .collect::<Snapshot>();

    for entry in entries.iter().skip(1) {
        if entry.action == Action::Delete {
            continue;
        }
        let Some(data) = &entry.data else {
            return Err(HistoryError::InvariantViolation {
                entity: entity.clone(),
                revision: entry.revision,
                detail: format!("{} entry carries no data", entry.action.as_str()),
            });
        };

        for (field, delta) in data {
            if let (true, Some(old)) = (audit, delta.previous()) {
                let actual = state.get(field).unwrap_or(&Value::Null);
                if actual != old {
                    return Err(HistoryError::AuditMismatch {
                        entity: entity.clone(),
                        revision: entry.revision,
                        field: field.clone(),
                        expected: old.clone(),
                        actual: actual.clone(),
                    });
                }
            }
            state.insert(field.clone(), delta.current().clone());
        }
    }

    Ok(state)
}

/// Compare every field of the live snapshot with the replayed state.
///
/// Returns the number of fields checked.
///
/// # Errors
/// Returns [`HistoryError::AuditMismatch`] for the first field whose live value differs.
pub fn verify_live_state(
    entity: &EntityRef,
    replayed: &Snapshot,
    live: &Snapshot,
    revision: u32,
) -> Result<usize, HistoryError> {
    for (field, actual) in live {
        let expected = replayed.get(field).unwrap_or(&Value::Null);
        if expected != actual {
            return Err(HistoryError::AuditMismatch {
                entity: entity.clone(),
                revision,
                field: field.clone(),
                expected: expected.clone(),
                actual: actual.clone(),
            });
        }
    }
    Ok(live.len())
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use serde_json::json;

    use super::*;

    fn ticket_type() -> EntityType {
        match EntityType::parse("ticket") {
            Ok(entity_type) => entity_type,
            Err(err) => panic!("invalid fixture type: {err}"),
        }
    }

    fn user_type() -> EntityType {
        match EntityType::parse("auth.user") {
            Ok(entity_type) => entity_type,
            Err(err) => panic!("invalid fixture type: {err}"),
        }
    }

    fn ticket(entity_id: i64) -> EntityRef {
        match EntityRef::new(ticket_type(), entity_id) {
            Ok(entity) => entity,
            Err(err) => panic!("invalid fixture ref: {err}"),
        }
    }

    fn snap(value: Value) -> Snapshot {
        match value {
            Value::Object(object) => object.into_iter().collect(),
            other => panic!("fixture snapshot must be an object, got {other}"),
        }
    }

    fn entry(entity: &EntityRef, revision: u32, action: Action, data: Option<EntryData>) -> FullHistoryEntry {
        FullHistoryEntry {
            entry_id: EntryId::new(),
            entity: entity.clone(),
            revision,
            action,
            info: summarize(action, SYSTEM_ACTOR_NAME, data.as_ref()),
            data,
            request_id: None,
            timestamp: OffsetDateTime::UNIX_EPOCH,
        }
    }

    struct MissingUsers;

    impl RelationResolver for MissingUsers {
        fn resolve(&self, target: &EntityRef) -> Result<bool, ResolveError> {
            match target.entity_id {
                1 => Ok(true),
                2 => Ok(false),
                _ => Err(ResolveError("lookup failed".to_string())),
            }
        }
    }

    fn ticket_fields() -> Vec<FieldDescriptor> {
        vec![
            FieldDescriptor::scalar("summary"),
            FieldDescriptor::timestamp("opened_at"),
            FieldDescriptor::file("attachment"),
            FieldDescriptor::relation("assigned_to", user_type()),
            FieldDescriptor::many_to_many("watchers", user_type()),
        ]
    }

    #[test]
    fn entity_type_rejects_invalid_tags() {
        assert!(EntityType::parse("").is_err());
        assert!(EntityType::parse("Ticket").is_err());
        assert!(EntityType::parse("tick et").is_err());
        assert!(EntityType::parse("app.ticket_2").is_ok());
        assert!(EntityRef::new(ticket_type(), 0).is_err());
    }

    #[test]
    fn actor_display_name_falls_back_to_sentinels() {
        assert_eq!(ActorContext::system().display_name(), SYSTEM_ACTOR_NAME);
        assert_eq!(ActorContext::anonymous().display_name(), ANONYMOUS_ACTOR_NAME);
        assert_eq!(ActorContext::user(7, "alice").display_name(), "alice");
        let only_id = ActorContext { actor_id: Some(9), ..ActorContext::default() };
        assert_eq!(only_id.display_name(), "user:9");

        let long = ActorContext::user(1, "x".repeat(400)).with_origin_path("/p".repeat(300));
        assert_eq!(long.display_name().chars().count(), MAX_ACTOR_NAME_CHARS);
        assert_eq!(
            long.truncated_origin_path().map(|path| path.chars().count()),
            Some(MAX_ORIGIN_PATH_CHARS)
        );
    }

    #[test]
    fn unit_of_work_binds_one_request() {
        let mut unit = UnitOfWork::begin(ActorContext::user(3, "carol").with_origin_path("/tickets/1"));
        let Some(pending) = unit.pending_request() else {
            panic!("fresh unit of work must offer a pending request");
        };
        assert_eq!(pending.actor_name, "carol");
        assert_eq!(pending.origin_path.as_deref(), Some("/tickets/1"));

        assert!(unit.bind_request(pending.clone()).is_ok());
        assert!(unit.pending_request().is_none());
        assert!(unit.bind_request(pending.clone()).is_err());
        assert_eq!(unit.request_id(), Some(pending.request_id));
        assert_eq!(unit.end().map(|request| request.request_id), Some(pending.request_id));

        let mut detached = UnitOfWork::detached();
        assert!(detached.pending_request().is_none());
        assert!(detached.bind_request(pending).is_err());
        assert_eq!(detached.actor_name(), SYSTEM_ACTOR_NAME);
    }

    #[test]
    fn snapshot_encodes_kinds_and_swallows_resolution_failures() {
        let opened_at = OffsetDateTime::UNIX_EPOCH + time::Duration::seconds(1_700_000_000);
        let record = RecordHandle::new(ticket_type())
            .with("summary", FieldValue::text("printer on fire"))
            .with("opened_at", FieldValue::Timestamp(opened_at))
            .with("attachment", FieldValue::File("attachments/fire.png".to_string()))
            .with("assigned_to", FieldValue::Reference(Some(3)))
            .with("watchers", FieldValue::Members(vec![3, 1, 2, 1]));

        let snapshot = snapshot(&record, &ticket_fields(), &MissingUsers);
        assert_eq!(
            snapshot,
            snap(json!({
                "summary": "printer on fire",
                "opened_at": "2023-11-14T22:13:20Z",
                "attachment": "attachments/fire.png",
                "assigned_to": null,
                "watchers": [1],
            }))
        );
    }

    #[test]
    fn snapshot_is_deterministic_for_unchanged_record() {
        let record = RecordHandle::new(ticket_type())
            .with("summary", FieldValue::text("a"))
            .with("watchers", FieldValue::Members(vec![5, 4]));
        let first = snapshot(&record, &ticket_fields(), &TrustStoredKeys);
        let second = snapshot(&record.clone(), &ticket_fields(), &TrustStoredKeys);
        assert_eq!(first, second);
        assert_eq!(first.get("watchers"), Some(&json!([4, 5])));
        assert_eq!(first.get("opened_at"), Some(&Value::Null));
    }

    #[test]
    fn record_from_snapshot_restores_relations_from_keys() -> Result<(), HistoryError> {
        let stored = snap(json!({
            "summary": "a",
            "opened_at": "2023-11-14T22:13:20Z",
            "attachment": null,
            "assigned_to": 4,
            "watchers": [1, 2],
            "dropped_column": true,
        }));
        let record = record_from_snapshot(&ticket_type(), Some(9), &ticket_fields(), &stored)?;
        assert_eq!(record.entity_id(), Some(9));
        assert_eq!(record.get("assigned_to"), Some(&FieldValue::Reference(Some(4))));
        assert_eq!(record.get("watchers"), Some(&FieldValue::Members(vec![1, 2])));
        assert_eq!(record.get("attachment"), Some(&FieldValue::Null));
        assert!(record.get("dropped_column").is_none());
        assert_eq!(snapshot(&record, &ticket_fields(), &TrustStoredKeys).len(), 5);

        let bad = snap(json!({ "assigned_to": "nobody" }));
        assert!(record_from_snapshot(&ticket_type(), None, &ticket_fields(), &bad).is_err());
        Ok(())
    }

    #[test]
    fn diff_covers_union_of_keys() {
        let prior = snap(json!({ "name": "a", "gone": 1, "same": true }));
        let current = snap(json!({ "name": "b", "same": true, "added": "x" }));
        let changes = diff(&prior, &current);
        assert_eq!(changes.len(), 3);
        assert_eq!(
            changes.get("name"),
            Some(&FieldDelta::Changed { old: json!("a"), new: json!("b") })
        );
        assert_eq!(changes.get("gone"), Some(&FieldDelta::Changed { old: json!(1), new: Value::Null }));
        assert_eq!(
            changes.get("added"),
            Some(&FieldDelta::Changed { old: Value::Null, new: json!("x") })
        );
    }

    #[test]
    fn update_without_net_change_records_full_snapshot() {
        let current = snap(json!({ "name": "a", "members": [] }));
        let same = update_delta(Some(&current), &current);
        assert_eq!(same, full_snapshot_as_delta(&current));
        assert_eq!(update_delta(None, &current), full_snapshot_as_delta(&current));
    }

    #[test]
    fn field_delta_uses_array_encoding() -> Result<(), serde_json::Error> {
        let data: EntryData = serde_json::from_value(json!({
            "name": ["a", "b"],
            "members": [[7]],
        }))?;
        assert_eq!(data.get("name"), Some(&FieldDelta::Changed { old: json!("a"), new: json!("b") }));
        assert_eq!(data.get("members"), Some(&FieldDelta::Set(json!([7]))));
        assert_eq!(serde_json::to_value(&data)?, json!({ "members": [[7]], "name": ["a", "b"] }));

        assert!(serde_json::from_value::<FieldDelta>(json!([])).is_err());
        assert!(serde_json::from_value::<FieldDelta>(json!([1, 2, 3])).is_err());
        assert!(serde_json::from_value::<FieldDelta>(json!("bare")).is_err());
        Ok(())
    }

    #[test]
    fn adjustment_collapses_into_create_and_keeps_pairs_on_update() {
        let adjusted = diff(&snap(json!({ "members": [] })), &snap(json!({ "members": [5] })));
        let base = full_snapshot_as_delta(&snap(json!({ "name": "a", "members": [] })));

        let on_create = merge_adjustment(Action::Create, Some(base.clone()), adjusted.clone());
        assert_eq!(on_create.get("members"), Some(&FieldDelta::Set(json!([5]))));
        assert_eq!(on_create.get("name"), Some(&FieldDelta::Set(json!("a"))));

        let on_update = merge_adjustment(Action::Update, Some(base), adjusted.clone());
        assert_eq!(
            on_update.get("members"),
            Some(&FieldDelta::Changed { old: json!([]), new: json!([5]) })
        );

        let fresh = merge_adjustment(Action::Update, None, adjusted);
        assert_eq!(fresh.len(), 1);
    }

    #[test]
    fn summary_lists_changed_pairs_with_preview_limit() {
        let data = diff(
            &snap(json!({ "email": "testemail@test.com", "bio": "" })),
            &snap(json!({ "email": "foo@test.com", "bio": "y".repeat(80) })),
        );
        let info = summarize(Action::Update, "alice", Some(&data));
        assert!(info.starts_with("alice Updated"));
        assert!(info.contains("\"email\" changed from [testemail@test.com] to [foo@test.com]"));
        assert!(info.contains(&format!("\"bio\" changed from [] to [{}]", "y".repeat(50))));
        assert!(!info.contains(&"y".repeat(51)));

        assert_eq!(summarize(Action::Create, "alice", Some(&data)), "alice Created");
        assert_eq!(summarize(Action::Delete, SYSTEM_ACTOR_NAME, None), "(System) Deleted");

        let snapshot_only = full_snapshot_as_delta(&snap(json!({ "name": "a" })));
        assert_eq!(summarize(Action::Update, "bob", Some(&snapshot_only)), "bob Updated");
    }

    #[test]
    fn fold_replays_create_then_update() -> Result<(), HistoryError> {
        let entity = ticket(1);
        let created = full_snapshot_as_delta(&snap(json!({ "name": "a" })));
        let updated = diff(&snap(json!({ "name": "a" })), &snap(json!({ "name": "b" })));
        let entries = vec![
            entry(&entity, 0, Action::Create, Some(created)),
            entry(&entity, 1, Action::Update, Some(updated)),
        ];

        assert_eq!(fold_entries(&entity, &entries, true)?, snap(json!({ "name": "b" })));
        assert_eq!(fold_entries(&entity, &entries[..1], true)?, snap(json!({ "name": "a" })));
        Ok(())
    }

    #[test]
    fn fold_requires_leading_create() {
        let entity = ticket(1);
        let data = full_snapshot_as_delta(&snap(json!({ "name": "a" })));
        let entries = vec![entry(&entity, 0, Action::Update, Some(data))];
        let Err(HistoryError::InvariantViolation { revision, detail, .. }) =
            fold_entries(&entity, &entries, true)
        else {
            panic!("ledger without Create must be rejected");
        };
        assert_eq!(revision, 0);
        assert!(detail.contains("Create"));

        assert!(matches!(fold_entries(&entity, &[], true), Err(HistoryError::NotFound(_))));
    }

    #[test]
    fn fold_detects_revision_gaps() {
        let entity = ticket(1);
        let data = full_snapshot_as_delta(&snap(json!({ "name": "a" })));
        let entries = vec![
            entry(&entity, 0, Action::Create, Some(data.clone())),
            entry(&entity, 2, Action::Update, Some(data)),
        ];
        assert!(matches!(
            fold_entries(&entity, &entries, false),
            Err(HistoryError::InvariantViolation { revision: 2, .. })
        ));
    }

    #[test]
    fn fold_skips_delete_entries() -> Result<(), HistoryError> {
        let entity = ticket(1);
        let data = full_snapshot_as_delta(&snap(json!({ "name": "a" })));
        let amended_delete = full_snapshot_as_delta(&snap(json!({ "name": "zzz" })));
        let entries = vec![
            entry(&entity, 0, Action::Create, Some(data)),
            entry(&entity, 1, Action::Delete, None),
            entry(&entity, 2, Action::Delete, Some(amended_delete)),
        ];
        assert_eq!(fold_entries(&entity, &entries, true)?, snap(json!({ "name": "a" })));
        Ok(())
    }

    #[test]
    fn audited_fold_reports_stale_old_value() -> Result<(), HistoryError> {
        let entity = ticket(4);
        let created = full_snapshot_as_delta(&snap(json!({ "name": "a" })));
        let tampered = diff(&snap(json!({ "name": "x" })), &snap(json!({ "name": "b" })));
        let entries = vec![
            entry(&entity, 0, Action::Create, Some(created)),
            entry(&entity, 1, Action::Update, Some(tampered)),
        ];

        let Err(HistoryError::AuditMismatch { revision, field, expected, actual, .. }) =
            fold_entries(&entity, &entries, true)
        else {
            panic!("stale old value must fail the audit");
        };
        assert_eq!((revision, field.as_str()), (1, "name"));
        assert_eq!((expected, actual), (json!("x"), json!("a")));

        assert_eq!(fold_entries(&entity, &entries, false)?, snap(json!({ "name": "b" })));
        Ok(())
    }

    #[test]
    fn live_state_verification_names_field() {
        let entity = ticket(2);
        let replayed = snap(json!({ "name": "b", "count": 1 }));
        assert_eq!(verify_live_state(&entity, &replayed, &replayed, 3), Ok(2));

        let live = snap(json!({ "name": "c", "count": 1 }));
        let Err(HistoryError::AuditMismatch { field, revision, .. }) =
            verify_live_state(&entity, &replayed, &live, 3)
        else {
            panic!("live drift must fail");
        };
        assert_eq!((field.as_str(), revision), ("name", 3));
    }

    #[test]
    fn previous_revision_stops_at_ledger_start() {
        let entity = ticket(1);
        let first = entry(&entity, 0, Action::Create, None);
        assert!(matches!(first.previous_revision(), Err(HistoryError::NotFound(_))));
        assert_eq!(first.next_revision(), Ok(1));

        let last = entry(&entity, u32::MAX, Action::Update, None);
        assert!(matches!(last.next_revision(), Err(HistoryError::NotFound(_))));
    }

    fn mk_snapshot((a, b, c): (i8, i8, Option<bool>)) -> Snapshot {
        snap(json!({ "a": a, "b": b, "c": c }))
    }

    proptest! {
        #[test]
        fn property_fold_of_recorded_deltas_matches_last_snapshot(
            states in proptest::collection::vec((any::<i8>(), any::<i8>(), any::<Option<bool>>()), 1..12)
        ) {
            let entity = ticket(1);
            let snapshots = states.into_iter().map(mk_snapshot).collect::<Vec<_>>();
            let mut entries = Vec::new();
            let mut prior: Option<&Snapshot> = None;
            for (index, current) in snapshots.iter().enumerate() {
                let revision = u32::try_from(index).unwrap_or(u32::MAX);
                let (action, data) = match prior {
                    None => (Action::Create, full_snapshot_as_delta(current)),
                    Some(prior) => (Action::Update, update_delta(Some(prior), current)),
                };
                entries.push(entry(&entity, revision, action, Some(data)));
                prior = Some(current);
            }

            let folded = fold_entries(&entity, &entries, true);
            prop_assert_eq!(folded.as_ref().ok(), snapshots.last());
        }
    }
}
