//! Jira REST access for release version parameters.
//!
//! Sites come from configuration; a site hands out a [`JiraRestSession`] only when
//! credentials are available for it.

use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose, Engine as _};
use jira_version_core::{ParameterError, TrackerSession, VersionRecord, ISO_DATE_FORMAT};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::Date;

const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Error, Eq, PartialEq)]
pub enum JiraClientError {
    #[error("request error: {0}")]
    Request(String),
    #[error("API error: {0}")]
    Api(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("authentication failed - check the configured API token")]
    AuthFailed,
    #[error("rate limited - try again later")]
    RateLimited,
    #[error("invalid site configuration: {0}")]
    InvalidSite(String),
    #[error("invalid project key `{0}`")]
    InvalidProjectKey(String),
}

impl From<JiraClientError> for ParameterError {
    fn from(err: JiraClientError) -> Self {
        match err {
            JiraClientError::InvalidSite(_) | JiraClientError::InvalidProjectKey(_) => {
                Self::Configuration(err.to_string())
            }
            other => Self::Connectivity(other.to_string()),
        }
    }
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

/// Site entry as written in the workspace configuration file.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct JiraSiteConfig {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    /// Name of the environment variable holding the API token.
    #[serde(default)]
    pub token_env: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Clone, Eq, PartialEq)]
pub struct JiraCredentials {
    pub username: String,
    api_token: String,
}

impl JiraCredentials {
    #[must_use]
    pub fn new(username: impl Into<String>, api_token: impl Into<String>) -> Self {
        Self { username: username.into(), api_token: api_token.into() }
    }

    fn basic_auth_header(&self) -> String {
        let raw = format!("{}:{}", self.username, self.api_token);
        format!("Basic {}", general_purpose::STANDARD.encode(raw))
    }
}

impl Debug for JiraCredentials {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JiraCredentials")
            .field("username", &self.username)
            .field("api_token", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct JiraSite {
    name: String,
    base_url: String,
    credentials: Option<JiraCredentials>,
    timeout: Duration,
}

impl JiraSite {
    /// Build a site from explicit values.
    ///
    /// # Errors
    /// Returns [`JiraClientError::InvalidSite`] when the name is blank or the URL is not
    /// an http(s) URL.
    pub fn new(
        name: &str,
        url: &str,
        credentials: Option<JiraCredentials>,
        timeout: Duration,
    ) -> Result<Self, JiraClientError> {
        if name.trim().is_empty() {
            return Err(JiraClientError::InvalidSite("site name MUST be provided".to_string()));
        }
        let trimmed = url.trim().trim_end_matches('/');
        if !(trimmed.starts_with("https://") || trimmed.starts_with("http://")) {
            return Err(JiraClientError::InvalidSite(format!(
                "site `{name}` url MUST start with http:// or https://, got `{url}`"
            )));
        }
        Ok(Self { name: name.to_string(), base_url: trimmed.to_string(), credentials, timeout })
    }

    /// Build a site from configuration, reading the API token from the process environment.
    ///
    /// # Errors
    /// See [`JiraSite::new`].
    pub fn from_config(config: &JiraSiteConfig) -> Result<Self, JiraClientError> {
        Self::from_config_with(config, |variable| std::env::var(variable).ok())
    }

    /// Build a site from configuration with a caller-supplied token lookup.
    ///
    /// # Errors
    /// See [`JiraSite::new`].
    pub fn from_config_with<F>(
        config: &JiraSiteConfig,
        lookup_token: F,
    ) -> Result<Self, JiraClientError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let credentials = match (&config.username, &config.token_env) {
            (Some(username), Some(token_env)) => match lookup_token(token_env) {
                Some(token) if !token.is_empty() => Some(JiraCredentials::new(username, token)),
                _ => {
                    tracing::warn!(
                        site = %config.name,
                        token_env = %token_env,
                        "API token variable is not set; remote access disabled for site"
                    );
                    None
                }
            },
            _ => None,
        };
        Self::new(&config.name, &config.url, credentials, Duration::from_secs(config.timeout_secs))
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    #[must_use]
    pub fn has_credentials(&self) -> bool {
        self.credentials.is_some()
    }

    /// Open a session, or `None` when remote access is not configured for this site.
    #[must_use]
    pub fn create_session(&self) -> Option<JiraRestSession> {
        let credentials = self.credentials.as_ref()?;
        let agent = ureq::AgentBuilder::new().timeout(self.timeout).build();
        Some(JiraRestSession {
            agent,
            base_url: self.base_url.clone(),
            auth_header: credentials.basic_auth_header(),
        })
    }
}

/// Chooses the site that serves a given project.
#[derive(Debug, Clone, Default)]
pub struct SiteRegistry {
    sites: Vec<Arc<JiraSite>>,
    project_bindings: BTreeMap<String, String>,
}

impl SiteRegistry {
    #[must_use]
    pub fn new(sites: Vec<JiraSite>, project_bindings: BTreeMap<String, String>) -> Self {
        Self { sites: sites.into_iter().map(Arc::new).collect(), project_bindings }
    }

    /// Build a registry from configuration entries.
    ///
    /// # Errors
    /// Returns [`JiraClientError::InvalidSite`] for an invalid entry, a duplicate site
    /// name, or a project bound to an unknown site.
    pub fn from_configs(
        configs: &[JiraSiteConfig],
        project_bindings: BTreeMap<String, String>,
    ) -> Result<Self, JiraClientError> {
        let mut sites: Vec<JiraSite> = Vec::with_capacity(configs.len());
        for config in configs {
            if sites.iter().any(|site| site.name == config.name) {
                return Err(JiraClientError::InvalidSite(format!(
                    "duplicate site name `{}`",
                    config.name
                )));
            }
            sites.push(JiraSite::from_config(config)?);
        }
        for (project, site_name) in &project_bindings {
            if !sites.iter().any(|site| &site.name == site_name) {
                return Err(JiraClientError::InvalidSite(format!(
                    "project `{project}` is bound to unknown site `{site_name}`"
                )));
            }
        }
        Ok(Self::new(sites, project_bindings))
    }

    #[must_use]
    pub fn sites(&self) -> &[Arc<JiraSite>] {
        &self.sites
    }

    #[must_use]
    pub fn site_named(&self, name: &str) -> Option<Arc<JiraSite>> {
        self.sites.iter().find(|site| site.name == name).cloned()
    }

    /// Resolve the site for a project.
    ///
    /// An explicit site name wins, then the project binding, then the only configured
    /// site when exactly one exists.
    #[must_use]
    pub fn resolve(&self, project: &str, explicit_site: Option<&str>) -> Option<Arc<JiraSite>> {
        if let Some(name) = explicit_site {
            return self.site_named(name);
        }
        if let Some(name) = self.project_bindings.get(project) {
            return self.site_named(name);
        }
        match self.sites.as_slice() {
            [only] => Some(Arc::clone(only)),
            _ => None,
        }
    }
}

pub struct JiraRestSession {
    agent: ureq::Agent,
    base_url: String,
    auth_header: String,
}

impl Debug for JiraRestSession {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JiraRestSession").field("base_url", &self.base_url).finish_non_exhaustive()
    }
}

impl JiraRestSession {
    fn get(&self, path: &str) -> Result<String, JiraClientError> {
        let url = format!("{}{path}", self.base_url);
        let request = self
            .agent
            .get(&url)
            .set("Authorization", &self.auth_header)
            .set("Accept", "application/json");

        match request.call() {
            Ok(response) => {
                let status = response.status();
                let body = response
                    .into_string()
                    .map_err(|err| JiraClientError::Request(err.to_string()))?;
                // Size only; bodies may carry project data.
                tracing::debug!(status, bytes = body.len(), path, "jira response received");
                Ok(body)
            }
            Err(ureq::Error::Status(status, response)) => {
                let bytes = response.into_string().map(|body| body.len()).unwrap_or(0);
                tracing::debug!(status, bytes, path, "jira error response received");
                Err(match status {
                    401 | 403 => JiraClientError::AuthFailed,
                    429 => JiraClientError::RateLimited,
                    _ => JiraClientError::Api(format!("HTTP {status} for {path}")),
                })
            }
            Err(ureq::Error::Transport(transport)) => {
                Err(JiraClientError::Request(transport.to_string()))
            }
        }
    }

    /// Fetch all versions of a project.
    ///
    /// # Errors
    /// Returns [`JiraClientError`] on invalid keys, HTTP failures, or malformed bodies.
    pub fn project_versions(
        &self,
        project_key: &str,
    ) -> Result<Vec<VersionRecord>, JiraClientError> {
        if !is_valid_project_key(project_key) {
            return Err(JiraClientError::InvalidProjectKey(project_key.to_string()));
        }
        let body = self.get(&format!("/rest/api/2/project/{project_key}/versions"))?;
        parse_versions(&body)
    }

    /// Count issues of a version that are not resolved yet.
    ///
    /// # Errors
    /// Returns [`JiraClientError`] on HTTP failures or malformed bodies.
    pub fn unresolved_issue_count(&self, version_id: i64) -> Result<u64, JiraClientError> {
        let body = self.get(&format!("/rest/api/2/version/{version_id}/unresolvedIssueCount"))?;
        parse_unresolved_count(&body)
    }
}

impl TrackerSession for JiraRestSession {
    fn fetch_versions(&self, project_key: &str) -> Result<Vec<VersionRecord>, ParameterError> {
        Ok(self.project_versions(project_key)?)
    }

    fn has_unresolved_issues(&self, version_id: i64) -> Result<bool, ParameterError> {
        Ok(self.unresolved_issue_count(version_id)? > 0)
    }
}

fn is_valid_project_key(project_key: &str) -> bool {
    !project_key.is_empty()
        && project_key.chars().all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-')
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RestId {
    Text(String),
    Number(i64),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RestVersion {
    #[serde(default)]
    id: Option<RestId>,
    name: String,
    #[serde(default)]
    released: bool,
    #[serde(default)]
    archived: bool,
    #[serde(default)]
    release_date: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RestUnresolvedCount {
    issues_unresolved_count: u64,
}

fn parse_rest_id(id: RestId, name: &str) -> Result<i64, JiraClientError> {
    match id {
        RestId::Number(value) => Ok(value),
        RestId::Text(text) => text.trim().parse::<i64>().map_err(|err| {
            JiraClientError::Parse(format!("version `{name}` has non-numeric id `{text}`: {err}"))
        }),
    }
}

fn parse_release_date(text: &str, name: &str) -> Result<Date, JiraClientError> {
    Date::parse(text, ISO_DATE_FORMAT).map_err(|err| {
        JiraClientError::Parse(format!("version `{name}` has invalid releaseDate `{text}`: {err}"))
    })
}

/// Parse the body of `GET /rest/api/2/project/{key}/versions`.
///
/// # Errors
/// Returns [`JiraClientError::Parse`] when the body is not a version array or a field
/// has an unexpected format.
pub fn parse_versions(body: &str) -> Result<Vec<VersionRecord>, JiraClientError> {
    let rest_versions: Vec<RestVersion> = serde_json::from_str(body)
        .map_err(|err| JiraClientError::Parse(format!("invalid versions payload: {err}")))?;

    rest_versions
        .into_iter()
        .map(|rest| -> Result<VersionRecord, JiraClientError> {
            let id = rest.id.map(|id| parse_rest_id(id, &rest.name)).transpose()?;
            let release_date = match rest.release_date.as_deref() {
                Some(text) if !text.trim().is_empty() => {
                    Some(parse_release_date(text.trim(), &rest.name)?)
                }
                _ => None,
            };
            Ok(VersionRecord {
                name: rest.name,
                id,
                released: rest.released,
                archived: rest.archived,
                release_date,
            })
        })
        .collect()
}

/// Parse the body of `GET /rest/api/2/version/{id}/unresolvedIssueCount`.
///
/// # Errors
/// Returns [`JiraClientError::Parse`] when the count field is missing or malformed.
pub fn parse_unresolved_count(body: &str) -> Result<u64, JiraClientError> {
    let count: RestUnresolvedCount = serde_json::from_str(body)
        .map_err(|err| JiraClientError::Parse(format!("invalid unresolved count payload: {err}")))?;
    Ok(count.issues_unresolved_count)
}

#[cfg(test)]
mod tests {
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpListener;
    use std::sync::mpsc;
    use std::thread;

    use time::macros::date;

    use super::*;

    fn site_config(name: &str) -> JiraSiteConfig {
        JiraSiteConfig {
            name: name.to_string(),
            url: format!("https://{name}.example.atlassian.net/"),
            username: Some("builder@example.com".to_string()),
            token_env: Some("JIRA_TOKEN".to_string()),
            timeout_secs: 5,
        }
    }

    fn mk_site(config: &JiraSiteConfig) -> JiraSite {
        match JiraSite::from_config_with(config, |_| Some("secret-token".to_string())) {
            Ok(site) => site,
            Err(err) => panic!("fixture site should be valid: {err}"),
        }
    }

    /// Serve exactly one canned HTTP response and report the raw request head.
    fn serve_once(status_line: &str, body: &str) -> (String, mpsc::Receiver<String>) {
        let listener = match TcpListener::bind("127.0.0.1:0") {
            Ok(listener) => listener,
            Err(err) => panic!("failed to bind test listener: {err}"),
        };
        let addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(err) => panic!("listener has no local address: {err}"),
        };
        let response = format!(
            "HTTP/1.1 {status_line}\r\nContent-Type: application/json\r\n\
             Content-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );
        let (sender, receiver) = mpsc::channel();
        thread::spawn(move || {
            let Ok((stream, _)) = listener.accept() else {
                return;
            };
            let mut reader = BufReader::new(stream);
            let mut head = String::new();
            loop {
                let mut line = String::new();
                match reader.read_line(&mut line) {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {
                        if line == "\r\n" {
                            break;
                        }
                        head.push_str(&line);
                    }
                }
            }
            let _ = sender.send(head);
            let mut stream = reader.into_inner();
            let _ = stream.write_all(response.as_bytes());
            let _ = stream.flush();
        });
        (format!("http://{addr}"), receiver)
    }

    fn local_session(base_url: &str) -> JiraRestSession {
        let site = match JiraSite::new(
            "local",
            base_url,
            Some(JiraCredentials::new("builder@example.com", "secret-token")),
            Duration::from_secs(5),
        ) {
            Ok(site) => site,
            Err(err) => panic!("local site should be valid: {err}"),
        };
        match site.create_session() {
            Some(session) => session,
            None => panic!("site with credentials should open a session"),
        }
    }

    #[test]
    fn parse_versions_reads_rest_payload() {
        let body = r#"[
            {"self":"https://x/rest/api/2/version/10000","id":"10000","name":"1.0",
             "archived":false,"released":true,"releaseDate":"2010-07-06","projectId":10000},
            {"id":"10010","name":"1.1","archived":true,"released":false,"overdue":false},
            {"id":10020,"name":"2.0","releaseDate":""}
        ]"#;
        let records = match parse_versions(body) {
            Ok(records) => records,
            Err(err) => panic!("payload should parse: {err}"),
        };
        assert_eq!(
            records,
            vec![
                VersionRecord::new("1.0")
                    .with_id(10_000)
                    .released(true)
                    .with_release_date(date!(2010 - 07 - 06)),
                VersionRecord::new("1.1").with_id(10_010).archived(true),
                VersionRecord::new("2.0").with_id(10_020),
            ]
        );
    }

    #[test]
    fn parse_versions_rejects_bad_dates_and_ids() {
        let bad_date = parse_versions(r#"[{"id":"1","name":"x","releaseDate":"06/07/2010"}]"#);
        assert!(matches!(
            bad_date,
            Err(JiraClientError::Parse(message)) if message.contains("releaseDate")
        ));

        let bad_id = parse_versions(r#"[{"id":"abc","name":"x"}]"#);
        assert!(matches!(
            bad_id,
            Err(JiraClientError::Parse(message)) if message.contains("non-numeric id")
        ));

        let not_array = parse_versions(r#"{"errorMessages":["No project"]}"#);
        assert!(matches!(not_array, Err(JiraClientError::Parse(_))));
    }

    #[test]
    fn parse_unresolved_count_reads_field() {
        let body = r#"{"self":"https://x/rest/api/2/version/10000","issuesUnresolvedCount":3}"#;
        assert_eq!(parse_unresolved_count(body), Ok(3));
        assert!(parse_unresolved_count("{}").is_err());
    }

    #[test]
    fn site_without_token_has_no_session() {
        let config = site_config("acme");
        let site = match JiraSite::from_config_with(&config, |_| None) {
            Ok(site) => site,
            Err(err) => panic!("site should be valid without token: {err}"),
        };
        assert!(!site.has_credentials());
        assert!(site.create_session().is_none());
        assert_eq!(site.base_url(), "https://acme.example.atlassian.net");
    }

    #[test]
    fn site_rejects_non_http_url() {
        let mut config = site_config("acme");
        config.url = "ftp://jira".to_string();
        let err = match JiraSite::from_config_with(&config, |_| None) {
            Ok(_) => panic!("ftp url should be rejected"),
            Err(err) => err,
        };
        assert!(ParameterError::from(err).is_configuration());
    }

    #[test]
    fn credentials_debug_redacts_token() {
        let credentials = JiraCredentials::new("builder", "hunter2");
        let rendered = format!("{credentials:?}");
        assert!(rendered.contains("builder"));
        assert!(!rendered.contains("hunter2"));
    }

    fn resolved_name(registry: &SiteRegistry, project: &str, site: Option<&str>) -> Option<String> {
        registry.resolve(project, site).map(|resolved| resolved.name().to_string())
    }

    #[test]
    fn registry_resolves_explicit_binding_then_single_site() {
        let alpha = mk_site(&site_config("alpha"));
        let beta = mk_site(&site_config("beta"));
        let mut bindings = BTreeMap::new();
        bindings.insert("mobile-app".to_string(), "beta".to_string());
        let registry = SiteRegistry::new(vec![alpha.clone(), beta], bindings);

        assert_eq!(resolved_name(&registry, "web", Some("alpha")).as_deref(), Some("alpha"));
        assert_eq!(resolved_name(&registry, "mobile-app", None).as_deref(), Some("beta"));
        assert!(registry.resolve("web", None).is_none());
        assert!(registry.resolve("web", Some("gamma")).is_none());

        let single = SiteRegistry::new(vec![alpha], BTreeMap::new());
        assert_eq!(resolved_name(&single, "web", None).as_deref(), Some("alpha"));
        assert!(SiteRegistry::default().resolve("web", None).is_none());
    }

    #[test]
    fn registry_rejects_unknown_binding_and_duplicates() {
        let mut bindings = BTreeMap::new();
        bindings.insert("web".to_string(), "missing".to_string());
        let unknown = SiteRegistry::from_configs(&[site_config("alpha")], bindings);
        assert!(matches!(
            unknown,
            Err(JiraClientError::InvalidSite(message)) if message.contains("unknown site")
        ));

        let duplicate = SiteRegistry::from_configs(
            &[site_config("alpha"), site_config("alpha")],
            BTreeMap::new(),
        );
        assert!(matches!(
            duplicate,
            Err(JiraClientError::InvalidSite(message)) if message.contains("duplicate")
        ));
    }

    #[test]
    fn session_fetches_versions_with_basic_auth() {
        let (base_url, request_head) = serve_once(
            "200 OK",
            r#"[{"id":"7","name":"3.1","released":false,"releaseDate":"2031-01-02"}]"#,
        );
        let session = local_session(&base_url);

        let records = match session.fetch_versions("APP") {
            Ok(records) => records,
            Err(err) => panic!("fetch should succeed: {err}"),
        };
        assert_eq!(
            records,
            vec![VersionRecord::new("3.1").with_id(7).with_release_date(date!(2031 - 01 - 02))]
        );

        let head = match request_head.recv() {
            Ok(head) => head,
            Err(err) => panic!("server did not report request: {err}"),
        };
        assert!(head.starts_with("GET /rest/api/2/project/APP/versions HTTP/1.1"));
        let credentials = general_purpose::STANDARD.encode("builder@example.com:secret-token");
        let expected_auth = format!("authorization: basic {}", credentials.to_ascii_lowercase());
        assert!(head.to_ascii_lowercase().contains(&expected_auth));
    }

    #[test]
    fn session_reports_unresolved_issues() {
        let (base_url, _head) = serve_once("200 OK", r#"{"issuesUnresolvedCount":2}"#);
        let session = local_session(&base_url);
        assert_eq!(session.has_unresolved_issues(42), Ok(true));

        let (base_url, _head) = serve_once("200 OK", r#"{"issuesUnresolvedCount":0}"#);
        let session = local_session(&base_url);
        assert_eq!(session.has_unresolved_issues(42), Ok(false));
    }

    #[test]
    fn session_maps_auth_failure_to_connectivity_error() {
        let (base_url, _head) = serve_once("401 Unauthorized", r#"{"errorMessages":[]}"#);
        let session = local_session(&base_url);
        assert_eq!(session.project_versions("APP"), Err(JiraClientError::AuthFailed));

        let (base_url, _head) = serve_once("401 Unauthorized", "{}");
        let session = local_session(&base_url);
        let err = match session.fetch_versions("APP") {
            Ok(_) => panic!("401 should fail"),
            Err(err) => err,
        };
        assert!(err.is_connectivity());
    }

    #[test]
    fn session_rejects_suspicious_project_key_without_request() {
        let session = local_session("http://127.0.0.1:9");
        assert_eq!(
            session.project_versions("APP/../admin"),
            Err(JiraClientError::InvalidProjectKey("APP/../admin".to_string()))
        );
    }
}
