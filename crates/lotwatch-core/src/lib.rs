//! Core domain model for lotwatch: catalog entries, runs and metric columns.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "lotwatch-core";

/// Fixed columns of every run's entry table. Metric categories may not reuse them.
pub const BASE_COLUMNS: [&str; 3] = ["entry_id", "entry_url", "entry_title"];

/// Stable external identifier of a catalog entry (the storefront's `data-id`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(pub i64);

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EntryId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<i64>().map(EntryId)
    }
}

/// A catalog item with the counters observed for it in one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub id: EntryId,
    pub url: String,
    pub title: String,
    #[serde(default)]
    pub metrics: MetricSet,
}

impl Entry {
    pub fn new(id: EntryId, url: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id,
            url: url.into(),
            title: title.into(),
            metrics: MetricSet::new(),
        }
    }
}

/// A child listing ("lot") of an entry. The owning run is the table it lives in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubEntry {
    pub name: String,
    pub url: String,
    pub parent_entry_id: EntryId,
}

/// Discovery output: one entry and the lots listed under it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub entry: Entry,
    pub sub_entries: Vec<SubEntry>,
}

/// Observed transaction record appended to a run's offer log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Offer {
    pub entry_id: EntryId,
    pub seller: Option<String>,
    pub description: String,
    pub price: Option<String>,
    pub link: Option<String>,
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RunIdError {
    #[error("run id `{0}` is not a YYYYMMDD_HHMMSS timestamp token")]
    Malformed(String),
}

/// Second-resolution UTC timestamp token naming a run and its tables.
///
/// Only constructed from a timestamp or a validated token, so it is always safe
/// to splice into a table name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RunId(String);

impl RunId {
    pub const FORMAT: &'static str = "%Y%m%d_%H%M%S";

    pub fn from_timestamp(at: DateTime<Utc>) -> Self {
        Self(at.format(Self::FORMAT).to_string())
    }

    pub fn parse(token: &str) -> Result<Self, RunIdError> {
        let token = token.trim();
        let well_formed = token.len() == 15
            && token
                .chars()
                .enumerate()
                .all(|(i, c)| if i == 8 { c == '_' } else { c.is_ascii_digit() });
        if !well_formed || NaiveDateTime::parse_from_str(token, Self::FORMAT).is_err() {
            return Err(RunIdError::Malformed(token.to_string()));
        }
        Ok(Self(token.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        NaiveDateTime::parse_from_str(&self.0, Self::FORMAT)
            .map(|naive| naive.and_utc())
            .unwrap_or_default()
    }

    /// Per-run table name, e.g. `entries_20260224_120000`.
    pub fn table(&self, prefix: &str) -> String {
        format!("{prefix}_{}", self.0)
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for RunId {
    type Error = RunIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<RunId> for String {
    fn from(value: RunId) -> Self {
        value.0
    }
}

/// Handle for a run returned by the store: which identity, and whether it already existed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunRef {
    pub id: RunId,
    pub resumed: bool,
}

/// Canonical label sanitizer: keeps `[A-Za-z0-9_]`, drops everything else.
pub fn sanitize_category(label: &str) -> String {
    label
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect()
}

/// Parses a displayed counter value such as `"1 204"` or `"12,530"`.
pub fn parse_counter_value(text: &str) -> Option<i64> {
    let digits: String = text
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ',')
        .collect();
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    digits.parse::<i64>().ok()
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CategoryError {
    #[error("label `{label}` has no identifier characters")]
    Empty { label: String },
    #[error("label `{label}` sanitizes to reserved column `{column}`")]
    Reserved { label: String, column: String },
}

/// A sanitized counter label usable as a column name.
///
/// Equality, ordering and hashing ignore ASCII case, matching how SQLite
/// resolves column names.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MetricCategory(String);

impl MetricCategory {
    pub fn parse(label: &str) -> Result<Self, CategoryError> {
        let sanitized = sanitize_category(label);
        if sanitized.is_empty() {
            return Err(CategoryError::Empty {
                label: label.to_string(),
            });
        }
        if let Some(column) = BASE_COLUMNS
            .iter()
            .find(|base| base.eq_ignore_ascii_case(&sanitized))
        {
            return Err(CategoryError::Reserved {
                label: label.to_string(),
                column: (*column).to_string(),
            });
        }
        Ok(Self(sanitized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Double-quoted SQL identifier. Sanitization guarantees no quote characters.
    pub fn quoted(&self) -> String {
        format!("\"{}\"", self.0)
    }

    fn folded(&self) -> impl Iterator<Item = u8> + '_ {
        self.0.bytes().map(|b| b.to_ascii_lowercase())
    }
}

impl PartialEq for MetricCategory {
    fn eq(&self, other: &Self) -> bool {
        self.0.eq_ignore_ascii_case(&other.0)
    }
}

impl Eq for MetricCategory {}

impl PartialOrd for MetricCategory {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MetricCategory {
    fn cmp(&self, other: &Self) -> Ordering {
        self.folded().cmp(other.folded())
    }
}

impl Hash for MetricCategory {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for b in self.folded() {
            state.write_u8(b);
        }
    }
}

impl fmt::Display for MetricCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for MetricCategory {
    type Error = CategoryError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<MetricCategory> for String {
    fn from(value: MetricCategory) -> Self {
        value.0
    }
}

/// Two labels of one metric page that landed on the same column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaConflict {
    pub category: MetricCategory,
    pub label: String,
    pub previous: i64,
    pub value: i64,
}

impl fmt::Display for SchemaConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "label `{}` collides with column `{}`; {} replaces {}",
            self.label, self.category, self.value, self.previous
        )
    }
}

/// Counter values keyed by category.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetricSet(BTreeMap<MetricCategory, i64>);

impl MetricSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, category: MetricCategory, value: i64) -> Option<i64> {
        self.0.insert(category, value)
    }

    /// Sanitizes `label` and stores `value`; a collision is reported and the new value kept.
    pub fn insert_label(
        &mut self,
        label: &str,
        value: i64,
    ) -> Result<Option<SchemaConflict>, CategoryError> {
        let category = MetricCategory::parse(label)?;
        let previous = self.0.insert(category.clone(), value);
        Ok(previous.map(|previous| SchemaConflict {
            category,
            label: label.to_string(),
            previous,
            value,
        }))
    }

    pub fn get(&self, name: &str) -> Option<i64> {
        let key = MetricCategory::parse(name).ok()?;
        self.0.get(&key).copied()
    }

    pub fn categories(&self) -> impl Iterator<Item = &MetricCategory> {
        self.0.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&MetricCategory, i64)> {
        self.0.iter().map(|(k, v)| (k, *v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(MetricCategory, i64)> for MetricSet {
    fn from_iter<I: IntoIterator<Item = (MetricCategory, i64)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Known metric columns of one run's entry table. Grows only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ColumnSet(BTreeSet<MetricCategory>);

impl ColumnSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, category: &MetricCategory) -> bool {
        self.0.contains(category)
    }

    /// Categories from `required` that are not columns yet, deduplicated.
    pub fn missing<'a>(
        &self,
        required: impl IntoIterator<Item = &'a MetricCategory>,
    ) -> Vec<MetricCategory> {
        let mut out: BTreeSet<MetricCategory> = BTreeSet::new();
        for category in required {
            if !self.0.contains(category) {
                out.insert(category.clone());
            }
        }
        out.into_iter().collect()
    }

    pub fn insert(&mut self, category: MetricCategory) -> bool {
        self.0.insert(category)
    }

    pub fn iter(&self) -> impl Iterator<Item = &MetricCategory> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<MetricCategory> for ColumnSet {
    fn from_iter<I: IntoIterator<Item = MetricCategory>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn cat(label: &str) -> MetricCategory {
        MetricCategory::parse(label).expect("valid label")
    }

    #[test]
    fn sanitizer_strips_everything_outside_identifier_charset() {
        assert_eq!(sanitize_category("Accounts"), "Accounts");
        assert_eq!(sanitize_category("Top-up / Gift cards"), "TopupGiftcards");
        assert_eq!(sanitize_category("  Battle_Pass 2 "), "Battle_Pass2");
        assert_eq!(sanitize_category("Кристаллы"), "");
    }

    #[test]
    fn sanitizer_is_idempotent() {
        for label in ["Accounts", "Top-up / Gift cards", "a--b__c", "", "üñí", "Keys (Steam)"] {
            let once = sanitize_category(label);
            assert_eq!(sanitize_category(&once), once, "label {label:?}");
        }
    }

    #[test]
    fn categories_compare_case_insensitively_and_keep_spelling() {
        let a = cat("Accounts");
        let b = cat("accounts");
        assert_eq!(a, b);
        assert_eq!(a.cmp(&b), Ordering::Equal);
        assert_eq!(a.to_string(), "Accounts");
        assert_eq!(a.quoted(), "\"Accounts\"");
    }

    #[test]
    fn empty_and_reserved_labels_are_rejected() {
        assert!(matches!(
            MetricCategory::parse("---"),
            Err(CategoryError::Empty { .. })
        ));
        assert!(matches!(
            MetricCategory::parse("Entry_ID"),
            Err(CategoryError::Reserved { column, .. }) if column == "entry_id"
        ));
    }

    #[test]
    fn colliding_labels_report_conflict_and_last_value_wins() {
        let mut metrics = MetricSet::new();
        assert_eq!(metrics.insert_label("Gift-cards", 3).expect("label"), None);
        let conflict = metrics
            .insert_label("Gift cards", 9)
            .expect("label")
            .expect("conflict");
        assert_eq!(conflict.previous, 3);
        assert_eq!(conflict.value, 9);
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics.get("Giftcards"), Some(9));
    }

    #[test]
    fn column_set_reports_only_unknown_categories_once() {
        let columns: ColumnSet = [cat("Accounts"), cat("Keys")].into_iter().collect();
        let required = [cat("accounts"), cat("Items"), cat("ITEMS"), cat("Services")];
        let missing = columns.missing(required.iter());
        let names: Vec<_> = missing.iter().map(|c| c.as_str().to_ascii_lowercase()).collect();
        assert_eq!(names, vec!["items", "services"]);
    }

    #[test]
    fn counter_values_accept_group_separators_only() {
        assert_eq!(parse_counter_value(" 1 204 "), Some(1204));
        assert_eq!(parse_counter_value("12,530"), Some(12530));
        assert_eq!(parse_counter_value("0"), Some(0));
        assert_eq!(parse_counter_value("-4"), None);
        assert_eq!(parse_counter_value("n/a"), None);
        assert_eq!(parse_counter_value(""), None);
    }

    #[test]
    fn run_id_tokens_are_validated() {
        let at = Utc.with_ymd_and_hms(2026, 2, 24, 12, 5, 9).single().expect("ts");
        let id = RunId::from_timestamp(at);
        assert_eq!(id.as_str(), "20260224_120509");
        assert_eq!(id.started_at(), at);
        assert_eq!(id.table("entries"), "entries_20260224_120509");
        assert_eq!(RunId::parse("20260224_120509").expect("parse"), id);
        assert!(RunId::parse("20260224_120509; DROP TABLE runs").is_err());
        assert!(RunId::parse("20261324_120509").is_err());
    }

    #[test]
    fn metric_set_serializes_as_plain_map() {
        let mut metrics = MetricSet::new();
        metrics.insert(cat("Accounts"), 5);
        let json = serde_json::to_string(&metrics).expect("serialize");
        assert_eq!(json, r#"{"Accounts":5}"#);
        let back: MetricSet = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.get("accounts"), Some(5));
    }
}
