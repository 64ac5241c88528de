//! Domain model for the personal error log.
//!
//! Holds the record types shared by the store and the CLI, the canonical
//! encodings for module sets and tag lists, the in-memory query helpers, and
//! the [`SnapshotProvider`] seam through which live environment state enters.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, PrimitiveDateTime, UtcOffset};

/// Installed package name to version. `BTreeMap` keeps keys sorted, which is
/// what makes [`encode_modules`] canonical.
pub type ModuleSet = BTreeMap<String, String>;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ErrorLogError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("encoding error: {0}")]
    Encoding(String),
    #[error("environment probe error: {0}")]
    Probe(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Complexity {
    Low,
    Medium,
    High,
    Critical,
}

impl Complexity {
    pub const ALL: [Self; 4] = [Self::Low, Self::Medium, Self::High, Self::Critical];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "Low",
            Self::Medium => "Medium",
            Self::High => "High",
            Self::Critical => "Critical",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Low" => Some(Self::Low),
            "Medium" => Some(Self::Medium),
            "High" => Some(Self::High),
            "Critical" => Some(Self::Critical),
            _ => None,
        }
    }
}

impl Display for Complexity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash,
)]
pub enum Status {
    #[default]
    Open,
    #[serde(rename = "In Progress")]
    InProgress,
    Resolved,
    #[serde(rename = "Won't Fix")]
    WontFix,
}

impl Status {
    pub const ALL: [Self; 4] = [Self::Open, Self::InProgress, Self::Resolved, Self::WontFix];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "Open",
            Self::InProgress => "In Progress",
            Self::Resolved => "Resolved",
            Self::WontFix => "Won't Fix",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Open" => Some(Self::Open),
            "In Progress" => Some(Self::InProgress),
            "Resolved" => Some(Self::Resolved),
            "Won't Fix" => Some(Self::WontFix),
            _ => None,
        }
    }
}

impl Display for Status {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// What a [`SnapshotProvider`] reports about the runtime an error happened in.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct EnvironmentSnapshot {
    pub python_version: String,
    pub platform: Option<String>,
    pub modules: ModuleSet,
}

impl EnvironmentSnapshot {
    /// Validates the snapshot before it is used as a dedup key.
    ///
    /// # Errors
    /// Returns [`ErrorLogError::Validation`] when the interpreter version is blank.
    pub fn validate(&self) -> Result<(), ErrorLogError> {
        if self.python_version.trim().is_empty() {
            return Err(ErrorLogError::Validation(
                "python_version MUST be provided".to_string(),
            ));
        }
        Ok(())
    }

    /// Canonical module-set text, the second half of the uniqueness key.
    ///
    /// # Errors
    /// Returns [`ErrorLogError::Encoding`] if serialization fails.
    pub fn module_encoding(&self) -> Result<String, ErrorLogError> {
        encode_modules(&self.modules)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Environment {
    pub id: i64,
    pub python_version: String,
    pub platform: Option<String>,
    pub modules: ModuleSet,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct EnvironmentResolution {
    pub environment_id: i64,
    pub created: bool,
}

/// Environment columns joined onto an error by `list_all`.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct EnvironmentLabel {
    pub python_version: String,
    pub platform: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct NewErrorRecord {
    pub error_name: String,
    pub description: String,
    pub error_type: Option<String>,
    pub traceback: Option<String>,
    pub fix: Option<String>,
    pub complexity: Option<Complexity>,
    pub status: Option<Status>,
    pub tags: Vec<String>,
    pub environment_id: Option<i64>,
}

impl NewErrorRecord {
    #[must_use]
    pub fn new(error_name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            error_name: error_name.into(),
            description: description.into(),
            ..Self::default()
        }
    }

    /// Checks required fields before a write is attempted.
    ///
    /// # Errors
    /// Returns [`ErrorLogError::Validation`] when the name or description is
    /// empty or whitespace only.
    pub fn validate(&self) -> Result<(), ErrorLogError> {
        if self.error_name.trim().is_empty() {
            return Err(ErrorLogError::Validation(
                "error_name MUST be provided".to_string(),
            ));
        }

        if self.description.trim().is_empty() {
            return Err(ErrorLogError::Validation(
                "description MUST be provided".to_string(),
            ));
        }

        Ok(())
    }

    #[must_use]
    pub fn effective_status(&self) -> Status {
        self.status.unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ErrorRecord {
    pub id: i64,
    pub error_name: String,
    pub description: String,
    pub error_type: Option<String>,
    pub traceback: Option<String>,
    pub fix: Option<String>,
    pub complexity: Option<Complexity>,
    pub status: Status,
    pub tags: Vec<String>,
    pub environment_id: Option<i64>,
    pub environment: Option<EnvironmentLabel>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// An environment together with the errors logged against it.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct EnvironmentDetail {
    pub environment: Environment,
    pub errors: Vec<ErrorRecord>,
}

/// Search and attribute filter applied over an already-fetched record set.
///
/// Empty `statuses` or `complexities` mean no restriction on that field.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct ErrorFilter {
    pub term: Option<String>,
    pub statuses: BTreeSet<Status>,
    pub complexities: BTreeSet<Complexity>,
}

impl ErrorFilter {
    #[must_use]
    pub fn matches(&self, record: &ErrorRecord) -> bool {
        if let Some(term) = self.term.as_deref() {
            if !term.trim().is_empty() {
                let needle = term.to_lowercase();
                let hit = record.error_name.to_lowercase().contains(&needle)
                    || record.description.to_lowercase().contains(&needle);
                if !hit {
                    return false;
                }
            }
        }

        if !self.statuses.is_empty() && !self.statuses.contains(&record.status) {
            return false;
        }

        if !self.complexities.is_empty() {
            match record.complexity {
                Some(complexity) if self.complexities.contains(&complexity) => {}
                _ => return false,
            }
        }

        true
    }

    /// Keeps matching records in their original order.
    #[must_use]
    pub fn apply(&self, records: Vec<ErrorRecord>) -> Vec<ErrorRecord> {
        records
            .into_iter()
            .filter(|record| self.matches(record))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct ErrorSummary {
    pub total: usize,
    pub open: usize,
    pub resolved: usize,
    pub critical: usize,
}

impl ErrorSummary {
    #[must_use]
    pub fn from_records(records: &[ErrorRecord]) -> Self {
        records.iter().fold(Self::default(), |mut summary, record| {
            summary.total += 1;
            match record.status {
                Status::Open => summary.open += 1,
                Status::Resolved => summary.resolved += 1,
                Status::InProgress | Status::WontFix => {}
            }
            if record.complexity == Some(Complexity::Critical) {
                summary.critical += 1;
            }
            summary
        })
    }
}

/// Source of the environment an error is logged against.
pub trait SnapshotProvider {
    /// Captures the current environment.
    ///
    /// # Errors
    /// Returns [`ErrorLogError::Probe`] when the environment cannot be observed.
    fn snapshot(&self) -> Result<EnvironmentSnapshot, ErrorLogError>;
}

/// Provider that always returns the same snapshot.
#[derive(Debug, Clone)]
pub struct StaticSnapshotProvider {
    snapshot: EnvironmentSnapshot,
}

impl StaticSnapshotProvider {
    #[must_use]
    pub fn new(snapshot: EnvironmentSnapshot) -> Self {
        Self { snapshot }
    }
}

impl SnapshotProvider for StaticSnapshotProvider {
    fn snapshot(&self) -> Result<EnvironmentSnapshot, ErrorLogError> {
        Ok(self.snapshot.clone())
    }
}

/// Encodes a module set as compact JSON with sorted keys.
///
/// # Errors
/// Returns [`ErrorLogError::Encoding`] if serialization fails.
pub fn encode_modules(modules: &ModuleSet) -> Result<String, ErrorLogError> {
    serde_json::to_string(modules)
        .map_err(|err| ErrorLogError::Encoding(format!("failed to encode modules: {err}")))
}

/// Decodes a stored module set. Missing or malformed text yields an empty set.
#[must_use]
pub fn decode_modules(raw: Option<&str>) -> ModuleSet {
    let Some(raw) = raw.filter(|value| !value.trim().is_empty()) else {
        return ModuleSet::new();
    };

    match serde_json::from_str::<ModuleSet>(raw) {
        Ok(modules) => modules,
        Err(err) => {
            tracing::warn!(error = %err, "malformed stored module set, treating as empty");
            ModuleSet::new()
        }
    }
}

/// Encodes tags as a JSON array. An empty list is stored as absent.
///
/// # Errors
/// Returns [`ErrorLogError::Encoding`] if serialization fails.
pub fn encode_tags(tags: &[String]) -> Result<Option<String>, ErrorLogError> {
    if tags.is_empty() {
        return Ok(None);
    }

    serde_json::to_string(tags)
        .map(Some)
        .map_err(|err| ErrorLogError::Encoding(format!("failed to encode tags: {err}")))
}

/// Decodes stored tags. Missing or malformed text yields no tags.
#[must_use]
pub fn decode_tags(raw: Option<&str>) -> Vec<String> {
    let Some(raw) = raw.filter(|value| !value.trim().is_empty()) else {
        return Vec::new();
    };

    match serde_json::from_str::<Vec<String>>(raw) {
        Ok(tags) => tags,
        Err(err) => {
            tracing::warn!(error = %err, "malformed stored tags, treating as empty");
            Vec::new()
        }
    }
}

/// Splits comma-separated tag input, trimming pieces and dropping empty ones.
#[must_use]
pub fn parse_tag_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|tag| !tag.is_empty())
        .map(ToString::to_string)
        .collect()
}

/// Parses a `name=version` module pair.
///
/// # Errors
/// Returns [`ErrorLogError::Validation`] when the pair is malformed.
pub fn parse_module_pair(raw: &str) -> Result<(String, String), ErrorLogError> {
    let Some((name, version)) = raw.split_once('=') else {
        return Err(ErrorLogError::Validation(format!(
            "module must be in <name>=<version> format: {raw}"
        )));
    };

    let name = name.trim();
    if name.is_empty() {
        return Err(ErrorLogError::Validation(format!(
            "module name MUST be provided: {raw}"
        )));
    }

    Ok((name.to_string(), version.trim().to_string()))
}

/// Parses an RFC3339 timestamp and requires UTC.
///
/// # Errors
/// Returns [`ErrorLogError::Validation`] when parsing fails or the offset is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, ErrorLogError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| ErrorLogError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(ErrorLogError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Parses a stored timestamp: RFC3339 UTC, or SQLite's `CURRENT_TIMESTAMP`
/// text (`YYYY-MM-DD HH:MM:SS`, implicitly UTC) found in older databases.
///
/// # Errors
/// Returns [`ErrorLogError::Validation`] when neither form parses.
pub fn parse_stored_timestamp(value: &str) -> Result<OffsetDateTime, ErrorLogError> {
    let rfc3339_err = match parse_rfc3339_utc(value) {
        Ok(parsed) => return Ok(parsed),
        Err(err) => err,
    };

    let format =
        time::format_description::parse("[year]-[month]-[day] [hour]:[minute]:[second]")
            .map_err(|err| ErrorLogError::Validation(format!("invalid timestamp format: {err}")))?;
    PrimitiveDateTime::parse(value, &format)
        .map(PrimitiveDateTime::assume_utc)
        .map_err(|_| rfc3339_err)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`ErrorLogError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, ErrorLogError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            ErrorLogError::Validation(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

/// Current UTC time truncated to whole seconds, so stored text sorts
/// chronologically.
#[must_use]
pub fn now_utc() -> OffsetDateTime {
    let now = OffsetDateTime::now_utc();
    now.replace_nanosecond(0).unwrap_or(now)
}
