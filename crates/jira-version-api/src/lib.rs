use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use jira_version_client::{JiraSite, JiraSiteConfig, SiteRegistry};
use jira_version_core::{
    evaluate_versions, filter_versions_parallel, FilterConfig, FilterToggles, ParameterError,
    ParameterValue, TrackerSession, VersionCandidate, VersionDecision,
};
use serde::{Deserialize, Deserializer, Serialize};
use time::{Date, OffsetDateTime};

pub const API_CONTRACT_VERSION: &str = "api.v1";
pub const PARAMETER_DISPLAY_NAME: &str = "Jira Release Version Parameter";

/// The job or pipeline a request is made on behalf of.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ExecutionContext {
    /// Full display name of the project, used for site lookup and error messages.
    pub project: String,
    /// Site chosen explicitly by the caller, overriding project bindings.
    #[serde(default)]
    pub site: Option<String>,
}

impl ExecutionContext {
    #[must_use]
    pub fn new(project: impl Into<String>) -> Self {
        Self { project: project.into(), site: None }
    }

    #[must_use]
    pub fn with_site(mut self, site: impl Into<String>) -> Self {
        self.site = Some(site.into());
        self
    }
}

pub trait TrackerSite: Send + Sync {
    fn name(&self) -> &str;

    /// A session for this site, or `None` when remote access is not enabled.
    fn create_session(&self) -> Option<Box<dyn TrackerSession>>;
}

pub trait SiteResolver: Send + Sync {
    fn site_for(&self, context: &ExecutionContext) -> Option<Arc<dyn TrackerSite>>;
}

impl TrackerSite for JiraSite {
    fn name(&self) -> &str {
        JiraSite::name(self)
    }

    fn create_session(&self) -> Option<Box<dyn TrackerSession>> {
        JiraSite::create_session(self).map(|session| Box::new(session) as Box<dyn TrackerSession>)
    }
}

impl SiteResolver for SiteRegistry {
    fn site_for(&self, context: &ExecutionContext) -> Option<Arc<dyn TrackerSite>> {
        self.resolve(&context.project, context.site.as_deref())
            .map(|site| site as Arc<dyn TrackerSite>)
    }
}

/// `{name, value}` payload submitted by a structured form.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct StructuredSubmission {
    pub name: String,
    pub value: String,
}

/// Turns submitted input into parameter values and lists selectable candidates.
pub trait ParameterDefinition {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// Candidates offered for selection, in tracker order.
    ///
    /// # Errors
    /// Returns [`ParameterError::Configuration`] when no site or session is available
    /// for the context, and [`ParameterError::Connectivity`] when the tracker fails.
    fn candidate_list(
        &self,
        context: &ExecutionContext,
        resolver: &dyn SiteResolver,
        today: Date,
    ) -> Result<Vec<VersionCandidate>, ParameterError>;

    /// Exactly one submitted value yields a parameter value; any other count yields none.
    fn value_from_single_submission(&self, selected_values: &[String]) -> Option<ParameterValue>;

    fn value_from_structured_submission(&self, payload: StructuredSubmission) -> ParameterValue;

    /// The raw value is taken as-is; command-line callers are trusted to name a real version.
    fn value_from_command_line(&self, raw_value: &str) -> ParameterValue;
}

/// Lenient flag parsing: case-insensitive `true` is true, everything else is false.
#[must_use]
pub fn parse_flag(text: &str) -> bool {
    text.eq_ignore_ascii_case("true")
}

fn lenient_bool<'de, D>(deserializer: D) -> std::result::Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawFlag {
        Bool(bool),
        Text(String),
    }

    Ok(match RawFlag::deserialize(deserializer)? {
        RawFlag::Bool(flag) => flag,
        RawFlag::Text(text) => parse_flag(&text),
    })
}

/// Persisted fields of a version parameter definition.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct DefinitionConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub jira_project_key: String,
    #[serde(default)]
    pub jira_release_pattern: String,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub jira_show_released: bool,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub jira_show_archived: bool,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub jira_show_future: bool,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub jira_show_resolved: bool,
}

#[derive(Debug, Clone)]
pub struct JiraVersionParameterDefinition {
    name: String,
    description: String,
    project_key: String,
    filter: FilterConfig,
}

impl JiraVersionParameterDefinition {
    /// Build a definition from persisted fields, compiling the release pattern.
    ///
    /// # Errors
    /// Returns [`ParameterError::Configuration`] when the name or project key is blank
    /// or the release pattern does not compile.
    pub fn from_config(config: &DefinitionConfig) -> Result<Self, ParameterError> {
        if config.name.trim().is_empty() {
            return Err(ParameterError::Configuration(
                "parameter name MUST be provided".to_string(),
            ));
        }
        if config.jira_project_key.trim().is_empty() {
            return Err(ParameterError::Configuration(format!(
                "parameter `{}` MUST name a Jira project key",
                config.name
            )));
        }

        let filter = FilterConfig::new(
            Some(config.jira_release_pattern.as_str()),
            FilterToggles {
                include_released: config.jira_show_released,
                include_archived: config.jira_show_archived,
                include_future: config.jira_show_future,
                require_all_resolved: config.jira_show_resolved,
            },
        )?;

        Ok(Self {
            name: config.name.clone(),
            description: config.description.clone(),
            project_key: config.jira_project_key.clone(),
            filter,
        })
    }

    #[must_use]
    pub fn to_config(&self) -> DefinitionConfig {
        let toggles = self.filter.toggles();
        DefinitionConfig {
            name: self.name.clone(),
            description: self.description.clone(),
            jira_project_key: self.project_key.clone(),
            jira_release_pattern: self.filter.pattern_source().to_string(),
            jira_show_released: toggles.include_released,
            jira_show_archived: toggles.include_archived,
            jira_show_future: toggles.include_future,
            jira_show_resolved: toggles.require_all_resolved,
        }
    }

    #[must_use]
    pub fn project_key(&self) -> &str {
        &self.project_key
    }

    #[must_use]
    pub fn filter(&self) -> &FilterConfig {
        &self.filter
    }

    fn open_session(
        &self,
        context: &ExecutionContext,
        resolver: &dyn SiteResolver,
    ) -> Result<Box<dyn TrackerSession>, ParameterError> {
        let site = resolver.site_for(context).ok_or_else(|| {
            ParameterError::Configuration(format!(
                "Jira site needs to be configured in the project {}",
                context.project
            ))
        })?;
        site.create_session().ok_or_else(|| {
            ParameterError::Configuration(format!(
                "remote access for Jira site `{}` is not configured",
                site.name()
            ))
        })
    }

    /// Per-version decisions for the current tracker state, including rejected versions.
    ///
    /// # Errors
    /// Same as [`ParameterDefinition::candidate_list`].
    pub fn explain(
        &self,
        context: &ExecutionContext,
        resolver: &dyn SiteResolver,
        today: Date,
    ) -> Result<Vec<VersionDecision>, ParameterError> {
        let session = self.open_session(context, resolver)?;
        let records = session.fetch_versions(&self.project_key)?;
        evaluate_versions(&records, &self.filter, today, |version_id| {
            session.has_unresolved_issues(version_id)
        })
    }
}

impl ParameterDefinition for JiraVersionParameterDefinition {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn candidate_list(
        &self,
        context: &ExecutionContext,
        resolver: &dyn SiteResolver,
        today: Date,
    ) -> Result<Vec<VersionCandidate>, ParameterError> {
        let session = self.open_session(context, resolver)?;
        let records = session.fetch_versions(&self.project_key)?;
        let session = session.as_ref();
        let candidates = filter_versions_parallel(&records, &self.filter, today, |version_id| {
            session.has_unresolved_issues(version_id)
        })?;
        tracing::debug!(
            parameter = %self.name,
            project_key = %self.project_key,
            fetched = records.len(),
            offered = candidates.len(),
            "filtered Jira versions"
        );
        Ok(candidates)
    }

    fn value_from_single_submission(&self, selected_values: &[String]) -> Option<ParameterValue> {
        match selected_values {
            [only] => Some(ParameterValue::new(self.name.clone(), only.clone())),
            _ => None,
        }
    }

    fn value_from_structured_submission(&self, payload: StructuredSubmission) -> ParameterValue {
        if payload.name != self.name {
            tracing::debug!(
                parameter = %self.name,
                submitted_name = %payload.name,
                "structured submission carries a different parameter name"
            );
        }
        ParameterValue::new(payload.name, payload.value)
    }

    fn value_from_command_line(&self, raw_value: &str) -> ParameterValue {
        ParameterValue::new(self.name.clone(), raw_value)
    }
}

/// Contents of the YAML workspace configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkspaceConfig {
    #[serde(default)]
    pub sites: Vec<JiraSiteConfig>,
    /// Project display name to site name.
    #[serde(default)]
    pub projects: BTreeMap<String, String>,
    #[serde(default)]
    pub parameters: Vec<DefinitionConfig>,
}

impl WorkspaceConfig {
    /// Parse a workspace configuration document.
    ///
    /// # Errors
    /// Returns an error when the YAML is malformed.
    pub fn parse(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).context("failed to parse workspace configuration")
    }

    /// Read and parse a workspace configuration file.
    ///
    /// # Errors
    /// Returns an error when the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let body = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read configuration file {}", path.display()))?;
        Self::parse(&body).with_context(|| format!("invalid configuration in {}", path.display()))
    }
}

/// Configured sites and parameter definitions, ready to serve requests.
#[derive(Debug, Clone)]
pub struct ParameterCatalog {
    registry: SiteRegistry,
    definitions: BTreeMap<String, JiraVersionParameterDefinition>,
}

impl ParameterCatalog {
    #[must_use]
    pub fn new(
        registry: SiteRegistry,
        definitions: Vec<JiraVersionParameterDefinition>,
    ) -> Self {
        let definitions = definitions
            .into_iter()
            .map(|definition| (definition.name.clone(), definition))
            .collect();
        Self { registry, definitions }
    }

    /// Compile every configured site and definition.
    ///
    /// # Errors
    /// Returns an error naming the first invalid site or definition, or a duplicate
    /// parameter name.
    pub fn from_workspace(config: &WorkspaceConfig) -> Result<Self> {
        let registry = SiteRegistry::from_configs(&config.sites, config.projects.clone())
            .map_err(|err| anyhow!("invalid site configuration: {err}"))?;

        let mut definitions = BTreeMap::new();
        for parameter in &config.parameters {
            let definition = JiraVersionParameterDefinition::from_config(parameter)
                .map_err(|err| anyhow!("invalid parameter `{}`: {err}", parameter.name))?;
            if definitions.insert(parameter.name.clone(), definition).is_some() {
                return Err(anyhow!("duplicate parameter name `{}`", parameter.name));
            }
        }

        tracing::info!(
            sites = registry.sites().len(),
            parameters = definitions.len(),
            "loaded parameter catalog"
        );
        Ok(Self { registry, definitions })
    }

    /// Load and compile a workspace configuration file.
    ///
    /// # Errors
    /// See [`WorkspaceConfig::load`] and [`ParameterCatalog::from_workspace`].
    pub fn load(path: &Path) -> Result<Self> {
        Self::from_workspace(&WorkspaceConfig::load(path)?)
    }

    #[must_use]
    pub fn registry(&self) -> &SiteRegistry {
        &self.registry
    }

    #[must_use]
    pub fn definition(&self, name: &str) -> Option<&JiraVersionParameterDefinition> {
        self.definitions.get(name)
    }

    #[must_use]
    pub fn parameter_names(&self) -> Vec<&str> {
        self.definitions.keys().map(String::as_str).collect()
    }

    /// Candidates for a named parameter using the catalog's site registry.
    ///
    /// # Errors
    /// Returns [`ParameterError::Configuration`] for an unknown parameter, plus the
    /// errors of [`ParameterDefinition::candidate_list`].
    pub fn candidates(
        &self,
        parameter: &str,
        context: &ExecutionContext,
        today: Date,
    ) -> Result<Vec<VersionCandidate>, ParameterError> {
        let definition = self.definition(parameter).ok_or_else(|| {
            ParameterError::Configuration(format!("unknown parameter `{parameter}`"))
        })?;
        definition.candidate_list(context, &self.registry, today)
    }
}

/// Current date in UTC, used as "today" by the future-version filter.
#[must_use]
pub fn today_utc() -> Date {
    OffsetDateTime::now_utc().date()
}
