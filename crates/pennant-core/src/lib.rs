use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use ulid::Ulid;

/// Default cap on ranked candidates returned from a free-text search.
pub const DEFAULT_CANDIDATE_LIMIT: usize = 50;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ArchiveError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),
    #[error("configuration error: {0}")]
    Configuration(String),
}

/// Opaque identifier for a canonical entity. Owned by the identity
/// resolver; presentation layers treat it as a handle only.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct EntityId(pub Ulid);

impl Display for EntityId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl EntityId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Parses an entity ID from its ULID string form.
    ///
    /// # Errors
    /// Returns [`ArchiveError::Validation`] when the input is not a ULID.
    pub fn parse(raw: &str) -> Result<Self, ArchiveError> {
        Ulid::from_string(raw)
            .map(Self)
            .map_err(|err| ArchiveError::Validation(format!("invalid entity id {raw}: {err}")))
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    School,
    Player,
}

impl EntityType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::School => "school",
            Self::Player => "player",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "school" => Some(Self::School),
            "player" => Some(Self::Player),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Season {
    Spring,
    Summer,
}

impl Season {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Spring => "spring",
            Self::Summer => "summer",
        }
    }

    /// Historical rows mark the season with single CJK characters, newer
    /// rows with ASCII tokens. Both parse.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "spring" | "春" => Some(Self::Spring),
            "summer" | "夏" => Some(Self::Summer),
            _ => None,
        }
    }

    /// The marker stored on snapshot rows.
    #[must_use]
    pub fn stored_marker(self) -> &'static str {
        match self {
            Self::Spring => "春",
            Self::Summer => "夏",
        }
    }
}

/// A weakly-typed row as fetched from either store tier. Fields may be
/// absent, renamed, or inconsistently typed across calls.
pub type RawRecord = serde_json::Map<String, Value>;

/// A [`RawRecord`] passed through [`normalize`]: every requested logical
/// field is present under its logical name, `Value::Null` marking absence.
pub type NormalizedRecord = serde_json::Map<String, Value>;

/// Declares how one logical field maps onto drifting physical columns.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FieldSpec {
    pub logical: String,
    pub aliases: Vec<String>,
    pub required: bool,
    /// Sentinel strings that count as "true" for marker fields such as
    /// the captain column. None for non-marker fields.
    pub truthy: Option<BTreeSet<String>>,
}

impl FieldSpec {
    #[must_use]
    pub fn new(logical: &str, aliases: &[&str]) -> Self {
        Self {
            logical: logical.to_string(),
            aliases: aliases.iter().map(|alias| (*alias).to_string()).collect(),
            required: false,
            truthy: None,
        }
    }

    #[must_use]
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    #[must_use]
    pub fn with_truthy(mut self, sentinels: &[&str]) -> Self {
        self.truthy = Some(
            sentinels
                .iter()
                .map(|sentinel| (*sentinel).to_string())
                .collect(),
        );
        self
    }
}

/// Returns the value of the first present alias, else `None`.
///
/// A key counts as present when it exists in the record, even when its
/// value is SQL NULL; precedence is alias-list order regardless of the
/// record's own key order.
#[must_use]
pub fn resolve<'a>(record: &'a RawRecord, aliases: &[String]) -> Option<&'a Value> {
    aliases
        .iter()
        .find_map(|alias| record.get(alias.as_str()))
}

/// Applies [`resolve`] to every record, renaming each field to its
/// logical name and inserting `Value::Null` where no alias is present.
///
/// Row order and row count are preserved. Missing optional columns never
/// fail the row set.
///
/// # Errors
/// Returns [`ArchiveError::SchemaMismatch`] only when every alias of a
/// `required` field is absent from every record in the set.
pub fn normalize(
    records: &[RawRecord],
    specs: &[FieldSpec],
) -> Result<Vec<NormalizedRecord>, ArchiveError> {
    if records.is_empty() {
        return Ok(Vec::new());
    }

    for spec in specs.iter().filter(|spec| spec.required) {
        let column_present = records
            .iter()
            .any(|record| resolve(record, &spec.aliases).is_some());
        if !column_present {
            return Err(ArchiveError::SchemaMismatch(format!(
                "required field '{}' missing; tried aliases [{}]",
                spec.logical,
                spec.aliases.join(", ")
            )));
        }
    }

    let mut output = Vec::with_capacity(records.len());
    for record in records {
        let mut normalized = NormalizedRecord::new();
        for spec in specs {
            let value = resolve(record, &spec.aliases)
                .cloned()
                .unwrap_or(Value::Null);
            normalized.insert(spec.logical.clone(), value);
        }
        output.push(normalized);
    }

    Ok(output)
}

/// Sentinel markers observed across source revisions for "is captain" and
/// similar flag columns. None of them is authoritative on its own.
#[must_use]
pub fn default_truthy_markers() -> BTreeSet<String> {
    ["◎", "〇", "○", "1", "主将", "true", "yes"]
        .iter()
        .map(|marker| (*marker).to_string())
        .collect()
}

/// Interprets a marker-column value against a configured sentinel set.
#[must_use]
pub fn marker_is_truthy(value: &Value, sentinels: &BTreeSet<String>) -> bool {
    match value {
        Value::Bool(flag) => *flag,
        Value::Null => false,
        other => {
            let text = normalize_text(&value_text(other));
            !text.is_empty() && sentinels.iter().any(|marker| normalize_text(marker) == text)
        }
    }
}

/// Canonical display text for a weakly-typed value. Null becomes the
/// empty string so absence folds into "no data" at render time.
#[must_use]
pub fn value_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        Value::Bool(flag) => flag.to_string(),
        Value::Number(number) => number.to_string(),
        other => other.to_string(),
    }
}

/// Folds fullwidth ASCII forms (including parentheses and digits) to
/// their halfwidth equivalents, maps ideographic space to ASCII space,
/// collapses whitespace runs, and trims.
#[must_use]
pub fn normalize_text(input: &str) -> String {
    let folded: String = input
        .chars()
        .map(|ch| match ch {
            '\u{3000}' => ' ',
            '\u{FF01}'..='\u{FF5E}' => char::from_u32(u32::from(ch) - 0xFEE0).unwrap_or(ch),
            other => other,
        })
        .collect();

    folded.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Case-insensitive, width-insensitive comparison key for matching and
/// join-fan-out dedup.
#[must_use]
pub fn match_key(input: &str) -> String {
    normalize_text(input).to_lowercase()
}

/// Numeric-safe year extraction: accepts integers, numeric text, and
/// fullwidth-digit text. Returns `None` rather than failing.
#[must_use]
pub fn parse_year(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number.as_i64(),
        Value::String(text) => normalize_text(text).parse::<i64>().ok(),
        _ => None,
    }
}

/// Orders two year-ish values numerically when both parse, falling back
/// to string order. Never fails.
#[must_use]
pub fn cmp_year_values(left: &Value, right: &Value) -> Ordering {
    match (parse_year(left), parse_year(right)) {
        (Some(a), Some(b)) => a.cmp(&b),
        _ => match_key(&value_text(left)).cmp(&match_key(&value_text(right))),
    }
}

/// Builds the dedup key for one record over the given logical fields.
/// Key text differing only by case, whitespace, or character width
/// compares equal.
#[must_use]
pub fn dedup_key(record: &NormalizedRecord, key_fields: &[&str]) -> String {
    key_fields
        .iter()
        .map(|field| match_key(&value_text(record.get(*field).unwrap_or(&Value::Null))))
        .collect::<Vec<_>>()
        .join("\u{1f}")
}

/// Removes join-fan-out duplicates, keeping the first occurrence and
/// preserving row order.
#[must_use]
pub fn dedup_records(records: Vec<NormalizedRecord>, key_fields: &[&str]) -> Vec<NormalizedRecord> {
    let mut seen = BTreeSet::new();
    let mut output = Vec::with_capacity(records.len());
    for record in records {
        if seen.insert(dedup_key(&record, key_fields)) {
            output.push(record);
        }
    }
    output
}

/// One real-world school or player, possibly spanning several historical
/// names and raw-store keys.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CanonicalEntity {
    pub entity_id: EntityId,
    pub entity_type: EntityType,
    pub display_name: String,
    pub aliases: BTreeSet<String>,
    pub physical_keys: BTreeSet<String>,
    pub last_active_year: Option<i64>,
}

impl CanonicalEntity {
    /// Validates resolver invariants before persistence.
    ///
    /// # Errors
    /// Returns [`ArchiveError::Validation`] when the display name is
    /// blank or no physical key is linked.
    pub fn validate(&self) -> Result<(), ArchiveError> {
        if self.display_name.trim().is_empty() {
            return Err(ArchiveError::Validation(
                "display_name MUST be provided".to_string(),
            ));
        }
        if self.physical_keys.is_empty() {
            return Err(ArchiveError::Validation(format!(
                "entity {} has no physical keys linked",
                self.entity_id
            )));
        }
        Ok(())
    }

    /// All names this entity has ever appeared under.
    #[must_use]
    pub fn known_names(&self) -> BTreeSet<String> {
        let mut names = self.aliases.clone();
        names.insert(self.display_name.clone());
        names
    }

    fn matches(&self, query_key: &str) -> bool {
        self.known_names()
            .iter()
            .any(|name| match_key(name).contains(query_key))
    }

    fn is_exact_match(&self, query_key: &str) -> bool {
        self.known_names()
            .iter()
            .any(|name| match_key(name) == query_key)
    }
}

/// Ranks candidate entities for a free-text query: exact name match
/// first, then most-recent activity, then display name. Returns at most
/// `limit` candidates; an empty result is "not found", not an error.
#[must_use]
pub fn rank_candidates(
    entities: &[CanonicalEntity],
    free_text: &str,
    limit: usize,
) -> Vec<CanonicalEntity> {
    let query_key = match_key(free_text);
    if query_key.is_empty() {
        return Vec::new();
    }

    let mut matched: Vec<&CanonicalEntity> = entities
        .iter()
        .filter(|entity| entity.matches(&query_key))
        .collect();

    matched.sort_by(|a, b| {
        let exact = b
            .is_exact_match(&query_key)
            .cmp(&a.is_exact_match(&query_key));
        if exact != Ordering::Equal {
            return exact;
        }
        let recency = b
            .last_active_year
            .unwrap_or(i64::MIN)
            .cmp(&a.last_active_year.unwrap_or(i64::MIN));
        if recency != Ordering::Equal {
            return recency;
        }
        a.display_name.cmp(&b.display_name)
    });

    matched.into_iter().take(limit).cloned().collect()
}

/// Scopes a "find schools in tournament" query. The year may arrive as
/// text or integer upstream; [`TournamentContext::year_as_i64`] is the
/// numeric-safe view.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TournamentContext {
    pub year: String,
    pub season: Season,
}

impl TournamentContext {
    #[must_use]
    pub fn new(year: &str, season: Season) -> Self {
        Self {
            year: year.to_string(),
            season,
        }
    }

    #[must_use]
    pub fn year_as_i64(&self) -> Option<i64> {
        parse_year(&Value::String(self.year.clone()))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Running,
    Succeeded,
    Failed,
}

impl SyncStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

/// Progress event emitted after each table of a sync job. The job owns
/// no rendering concern; consumers subscribe via callback.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncProgress {
    pub table: String,
    pub index: usize,
    pub total: usize,
    pub fraction: f64,
}

impl SyncProgress {
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn new(table: &str, index: usize, total: usize) -> Self {
        let fraction = if total == 0 {
            1.0
        } else {
            (index + 1) as f64 / total as f64
        };
        Self {
            table: table.to_string(),
            index,
            total,
            fraction,
        }
    }
}

/// Terminal report for one sync job. Partial success is visible and
/// final: `tables_completed` names the tables whose replacement stands.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncReport {
    pub tables: Vec<String>,
    pub tables_completed: Vec<String>,
    pub status: SyncStatus,
    pub failed_table: Option<String>,
    pub failure: Option<String>,
    pub started_at: String,
    pub finished_at: String,
}

/// One independently-degrading section of a detail view.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DetailSection {
    pub rows: Vec<NormalizedRecord>,
    pub error: Option<String>,
}

impl DetailSection {
    #[must_use]
    pub fn loaded(rows: Vec<NormalizedRecord>) -> Self {
        Self { rows, error: None }
    }

    #[must_use]
    pub fn unavailable(message: &str) -> Self {
        Self {
            rows: Vec::new(),
            error: Some(message.to_string()),
        }
    }
}

/// Everything one drill-down view needs for a selected entity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DetailBundle {
    pub entity_id: EntityId,
    pub context_games: DetailSection,
    pub history: DetailSection,
    pub roster: DetailSection,
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`ArchiveError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, ArchiveError> {
    value
        .to_offset(time::UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| ArchiveError::Validation(format!("failed to format timestamp: {err}")))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(time::UtcOffset::UTC)
}
