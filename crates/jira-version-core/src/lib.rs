use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::Date;

/// Calendar date layout shared by release dates, labels and date arguments.
pub const ISO_DATE_FORMAT: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day]");

time::serde::format_description!(iso_date, Date, ISO_DATE_FORMAT);

/// Placeholder used in display labels for versions without a release date.
pub const MISSING_RELEASE_DATE_LABEL: &str = "none";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ParameterError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("connectivity error: {0}")]
    Connectivity(String),
}

impl ParameterError {
    #[must_use]
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }

    #[must_use]
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Connectivity(_))
    }
}

/// One project version as reported by the tracker.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct VersionRecord {
    pub name: String,
    pub id: Option<i64>,
    #[serde(default)]
    pub released: bool,
    #[serde(default)]
    pub archived: bool,
    #[serde(default, with = "iso_date::option")]
    pub release_date: Option<Date>,
}

impl VersionRecord {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), id: None, released: false, archived: false, release_date: None }
    }

    #[must_use]
    pub fn with_id(mut self, id: i64) -> Self {
        self.id = Some(id);
        self
    }

    #[must_use]
    pub fn released(mut self, released: bool) -> Self {
        self.released = released;
        self
    }

    #[must_use]
    pub fn archived(mut self, archived: bool) -> Self {
        self.archived = archived;
        self
    }

    #[must_use]
    pub fn with_release_date(mut self, release_date: Date) -> Self {
        self.release_date = Some(release_date);
        self
    }
}

/// Remote tracker access for one site.
///
/// Implementations must be shareable across concurrent requests.
pub trait TrackerSession: Send + Sync {
    /// Fetch the complete version list of a project.
    ///
    /// # Errors
    /// Returns [`ParameterError::Connectivity`] when the tracker cannot be reached,
    /// rejects the credentials, or answers with a malformed body.
    fn fetch_versions(&self, project_key: &str) -> Result<Vec<VersionRecord>, ParameterError>;

    /// Report whether any issue assigned to the version is still unresolved.
    ///
    /// # Errors
    /// Returns [`ParameterError::Connectivity`] on transport, auth, or parse failures.
    fn has_unresolved_issues(&self, version_id: i64) -> Result<bool, ParameterError>;
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub struct FilterToggles {
    #[serde(default)]
    pub include_released: bool,
    #[serde(default)]
    pub include_archived: bool,
    #[serde(default)]
    pub include_future: bool,
    #[serde(default)]
    pub require_all_resolved: bool,
}

#[derive(Debug, Clone)]
struct ReleasePattern {
    source: String,
    anchored: Regex,
}

impl ReleasePattern {
    fn compile(source: &str) -> Result<Self, ParameterError> {
        let invalid = |err: regex_lite::Error| {
            ParameterError::Configuration(format!("invalid release pattern `{source}`: {err}"))
        };
        // The bare pattern must compile before it is wrapped, so an unbalanced group
        // cannot close the anchoring group early.
        Regex::new(source).map_err(invalid)?;
        let anchored = Regex::new(&format!("^(?:{source})$")).map_err(invalid)?;
        Ok(Self { source: source.to_string(), anchored })
    }

    fn matches(&self, name: &str) -> bool {
        self.anchored.is_match(name)
    }
}

/// Compiled filter settings for one definition.
#[derive(Debug, Clone)]
pub struct FilterConfig {
    name_pattern: Option<ReleasePattern>,
    toggles: FilterToggles,
}

impl FilterConfig {
    /// Build a filter configuration, compiling the name pattern once.
    ///
    /// A missing or empty pattern disables the name filter.
    ///
    /// # Errors
    /// Returns [`ParameterError::Configuration`] when the pattern does not compile.
    pub fn new(pattern: Option<&str>, toggles: FilterToggles) -> Result<Self, ParameterError> {
        let name_pattern = match pattern {
            Some(source) if !source.is_empty() => Some(ReleasePattern::compile(source)?),
            _ => None,
        };
        Ok(Self { name_pattern, toggles })
    }

    #[must_use]
    pub fn unfiltered(toggles: FilterToggles) -> Self {
        Self { name_pattern: None, toggles }
    }

    /// Pattern text as configured; empty when no name filter is active.
    #[must_use]
    pub fn pattern_source(&self) -> &str {
        self.name_pattern.as_ref().map_or("", |pattern| pattern.source.as_str())
    }

    #[must_use]
    pub fn toggles(&self) -> FilterToggles {
        self.toggles
    }

    #[must_use]
    pub fn include_released(&self) -> bool {
        self.toggles.include_released
    }

    #[must_use]
    pub fn include_archived(&self) -> bool {
        self.toggles.include_archived
    }

    #[must_use]
    pub fn include_future(&self) -> bool {
        self.toggles.include_future
    }

    #[must_use]
    pub fn require_all_resolved(&self) -> bool {
        self.toggles.require_all_resolved
    }

    #[must_use]
    pub fn name_matches(&self, name: &str) -> bool {
        match &self.name_pattern {
            Some(pattern) => pattern.matches(name),
            None => true,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Rejection {
    NameMismatch,
    Released,
    Archived,
    BeforeToday,
    MissingReleaseDate,
    MissingId,
    UnresolvedIssues,
}

impl Rejection {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NameMismatch => "name_mismatch",
            Self::Released => "released",
            Self::Archived => "archived",
            Self::BeforeToday => "before_today",
            Self::MissingReleaseDate => "missing_release_date",
            Self::MissingId => "missing_id",
            Self::UnresolvedIssues => "unresolved_issues",
        }
    }

    #[must_use]
    pub fn reason(self) -> &'static str {
        match self {
            Self::NameMismatch => "name does not match the release pattern",
            Self::Released => "version is released and released versions are hidden",
            Self::Archived => "version is archived and archived versions are hidden",
            Self::BeforeToday => "release date is before today",
            Self::MissingReleaseDate => "no release date while only future versions are shown",
            Self::MissingId => "no version id to check unresolved issues against",
            Self::UnresolvedIssues => "version still has unresolved issues",
        }
    }
}

impl Display for Rejection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A selectable entry offered to the person starting a build.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub struct VersionCandidate {
    pub name: String,
    pub id: Option<i64>,
    pub display_label: String,
}

impl VersionCandidate {
    #[must_use]
    pub fn from_record(record: &VersionRecord) -> Self {
        Self {
            name: record.name.clone(),
            id: record.id,
            display_label: display_label(&record.name, record.release_date),
        }
    }
}

#[must_use]
pub fn display_label(name: &str, release_date: Option<Date>) -> String {
    let date = release_date.map_or_else(|| MISSING_RELEASE_DATE_LABEL.to_string(), format_date);
    format!("{name} (Release date: {date})")
}

fn format_date(date: Date) -> String {
    date.format(ISO_DATE_FORMAT).unwrap_or_else(|_| date.to_string())
}

/// Outcome of running one record through every active predicate.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct VersionDecision {
    pub name: String,
    pub id: Option<i64>,
    pub rejection: Option<Rejection>,
}

impl VersionDecision {
    #[must_use]
    pub fn included(&self) -> bool {
        self.rejection.is_none()
    }
}

/// Apply the predicates that need no remote call, in their fixed order.
#[must_use]
pub fn local_rejection(
    record: &VersionRecord,
    config: &FilterConfig,
    today: Date,
) -> Option<Rejection> {
    if !config.name_matches(&record.name) {
        return Some(Rejection::NameMismatch);
    }

    if !config.include_released() && record.released {
        return Some(Rejection::Released);
    }

    if !config.include_archived() && record.archived {
        return Some(Rejection::Archived);
    }

    if config.include_future() {
        match record.release_date {
            None => return Some(Rejection::MissingReleaseDate),
            Some(release_date) if release_date < today => return Some(Rejection::BeforeToday),
            Some(_) => {}
        }
    }

    if config.require_all_resolved() && record.id.is_none() {
        return Some(Rejection::MissingId);
    }

    None
}

fn decide<F>(
    record: &VersionRecord,
    config: &FilterConfig,
    today: Date,
    has_unresolved_issues: F,
) -> Result<Option<Rejection>, ParameterError>
where
    F: FnOnce(i64) -> Result<bool, ParameterError>,
{
    if let Some(rejection) = local_rejection(record, config, today) {
        return Ok(Some(rejection));
    }

    if let (true, Some(id)) = (config.require_all_resolved(), record.id) {
        if has_unresolved_issues(id)? {
            return Ok(Some(Rejection::UnresolvedIssues));
        }
    }

    Ok(None)
}

/// Run every record through the filters and record why each was kept or dropped.
///
/// Input order is preserved. The unresolved-issue lookup is only called for records
/// that passed every local predicate and carry an id.
///
/// # Errors
/// Propagates the first lookup failure; no partial result is returned.
pub fn evaluate_versions<F>(
    records: &[VersionRecord],
    config: &FilterConfig,
    today: Date,
    mut has_unresolved_issues: F,
) -> Result<Vec<VersionDecision>, ParameterError>
where
    F: FnMut(i64) -> Result<bool, ParameterError>,
{
    let mut decisions = Vec::with_capacity(records.len());
    for record in records {
        let rejection = decide(record, config, today, &mut has_unresolved_issues)?;
        decisions.push(VersionDecision { name: record.name.clone(), id: record.id, rejection });
    }
    Ok(decisions)
}

/// Produce the ordered candidate list for the given records.
///
/// # Errors
/// Propagates the first lookup failure; no partial result is returned.
pub fn filter_versions<F>(
    records: &[VersionRecord],
    config: &FilterConfig,
    today: Date,
    mut has_unresolved_issues: F,
) -> Result<Vec<VersionCandidate>, ParameterError>
where
    F: FnMut(i64) -> Result<bool, ParameterError>,
{
    let mut candidates = Vec::new();
    for record in records {
        if decide(record, config, today, &mut has_unresolved_issues)?.is_none() {
            candidates.push(VersionCandidate::from_record(record));
        }
    }
    Ok(candidates)
}

/// Same result as [`filter_versions`], with unresolved-issue lookups run concurrently.
///
/// Local predicates are applied first so lookups only happen for records that would
/// otherwise be kept. When several lookups fail, the error of the earliest record in
/// input order is returned.
///
/// # Errors
/// Propagates a lookup failure; no partial result is returned.
pub fn filter_versions_parallel<F>(
    records: &[VersionRecord],
    config: &FilterConfig,
    today: Date,
    has_unresolved_issues: F,
) -> Result<Vec<VersionCandidate>, ParameterError>
where
    F: Fn(i64) -> Result<bool, ParameterError> + Sync,
{
    use rayon::prelude::*;

    let survivors: Vec<&VersionRecord> =
        records.iter().filter(|record| local_rejection(record, config, today).is_none()).collect();

    if !config.require_all_resolved() {
        return Ok(survivors.into_iter().map(VersionCandidate::from_record).collect());
    }

    let outcomes: Vec<Result<Option<Rejection>, ParameterError>> = survivors
        .par_iter()
        .map(|record| decide(record, config, today, &has_unresolved_issues))
        .collect();

    let mut candidates = Vec::with_capacity(survivors.len());
    for (record, outcome) in survivors.into_iter().zip(outcomes) {
        if outcome?.is_none() {
            candidates.push(VersionCandidate::from_record(record));
        }
    }
    Ok(candidates)
}

/// The selection handed to the pipeline once a build is requested.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ParameterValue {
    name: String,
    value: String,
}

impl ParameterValue {
    #[must_use]
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self { name: name.into(), value: value.into() }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Expose the value as build environment variables under its name and the
    /// upper-cased name.
    pub fn export_to(&self, environment: &mut BTreeMap<String, String>) {
        environment.insert(self.name.clone(), self.value.clone());
        let upper = self.name.to_uppercase();
        if upper != self.name {
            environment.insert(upper, self.value.clone());
        }
    }
}

impl Display for ParameterValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}='{}'", self.name, self.value)
    }
}
