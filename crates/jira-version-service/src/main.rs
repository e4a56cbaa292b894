use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use jira_version_api::{
    today_utc, ExecutionContext, JiraVersionParameterDefinition, ParameterCatalog,
    ParameterDefinition, StructuredSubmission, API_CONTRACT_VERSION,
};
use jira_version_core::{
    ParameterError, ParameterValue, VersionCandidate, ISO_DATE_FORMAT,
};
use serde::{Deserialize, Serialize};
use time::Date;
use tracing_subscriber::EnvFilter;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";

#[derive(Debug, Clone)]
struct ServiceState {
    catalog: Arc<ParameterCatalog>,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    #[serde(skip)]
    status: StatusCode,
    service_contract_version: &'static str,
    error: String,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Clone, Serialize)]
struct ParametersResponse {
    parameters: Vec<ParameterSummary>,
}

#[derive(Debug, Clone, Serialize)]
struct ParameterSummary {
    name: String,
    description: String,
    project_key: String,
}

#[derive(Debug, Clone, Deserialize)]
struct CandidatesRequest {
    project: String,
    #[serde(default)]
    site: Option<String>,
    /// YYYY-MM-DD; the current UTC date when absent.
    #[serde(default)]
    today: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct CandidatesResponse {
    parameter: String,
    today: String,
    candidates: Vec<VersionCandidate>,
}

#[derive(Debug, Clone, Deserialize)]
struct SubmissionRequest {
    #[serde(default)]
    values: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct CommandLineRequest {
    value: String,
}

#[derive(Debug, Clone, Serialize)]
struct ValueResponse {
    value: Option<ParameterValue>,
}

#[derive(Debug, Parser)]
#[command(name = "jira-version-service")]
#[command(about = "Local HTTP service for Jira release version parameters")]
struct Args {
    #[arg(long, default_value = "./jira-versions.yaml")]
    config: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status;
        (status, Json(self)).into_response()
    }
}

impl ServiceError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self { status, service_contract_version: SERVICE_CONTRACT_VERSION, error: message.into() }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn unknown_parameter(name: &str) -> Self {
        Self::new(StatusCode::NOT_FOUND, format!("unknown parameter `{name}`"))
    }
}

impl From<ParameterError> for ServiceError {
    fn from(err: ParameterError) -> Self {
        let status = match err {
            ParameterError::Configuration(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ParameterError::Connectivity(_) => StatusCode::BAD_GATEWAY,
        };
        Self::new(status, err.to_string())
    }
}

impl ServiceState {
    fn definition(&self, name: &str) -> Result<&JiraVersionParameterDefinition, ServiceError> {
        self.catalog.definition(name).ok_or_else(|| ServiceError::unknown_parameter(name))
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/parameters", get(parameters))
        .route("/v1/parameters/:name/candidates", post(candidates))
        .route("/v1/parameters/:name/value", post(value_from_submission))
        .route("/v1/parameters/:name/value/structured", post(value_from_structured))
        .route("/v1/parameters/:name/value/cli", post(value_from_command_line))
        .with_state(state)
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging();
    let catalog = ParameterCatalog::load(&args.config)?;
    let state = ServiceState { catalog: Arc::new(catalog) };
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(bind = %args.bind, "jira version service listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn parameters(
    State(state): State<ServiceState>,
) -> Json<ServiceEnvelope<ParametersResponse>> {
    let parameters = state
        .catalog
        .parameter_names()
        .into_iter()
        .filter_map(|name| state.catalog.definition(name))
        .map(|definition| ParameterSummary {
            name: definition.name().to_string(),
            description: definition.description().to_string(),
            project_key: definition.project_key().to_string(),
        })
        .collect();
    Json(envelope(ParametersResponse { parameters }))
}

fn parse_today(raw: Option<&str>) -> Result<Date, ServiceError> {
    match raw {
        Some(text) => Date::parse(text, ISO_DATE_FORMAT)
            .map_err(|err| ServiceError::bad_request(format!("today must be YYYY-MM-DD: {err}"))),
        None => Ok(today_utc()),
    }
}

async fn candidates(
    State(state): State<ServiceState>,
    Path(name): Path<String>,
    Json(request): Json<CandidatesRequest>,
) -> Result<Json<ServiceEnvelope<CandidatesResponse>>, ServiceError> {
    state.definition(&name)?;
    let today = parse_today(request.today.as_deref())?;
    let mut context = ExecutionContext::new(request.project);
    if let Some(site) = request.site {
        context = context.with_site(site);
    }

    // Tracker calls block on network I/O.
    let catalog = Arc::clone(&state.catalog);
    let parameter = name.clone();
    let candidates =
        tokio::task::spawn_blocking(move || catalog.candidates(&parameter, &context, today))
            .await
            .map_err(|err| {
                ServiceError::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("candidate lookup task failed: {err}"),
                )
            })??;

    tracing::info!(parameter = %name, count = candidates.len(), "listed candidates");
    Ok(Json(envelope(CandidatesResponse { parameter: name, today: today.to_string(), candidates })))
}

async fn value_from_submission(
    State(state): State<ServiceState>,
    Path(name): Path<String>,
    Json(request): Json<SubmissionRequest>,
) -> Result<Json<ServiceEnvelope<ValueResponse>>, ServiceError> {
    let definition = state.definition(&name)?;
    let value = definition.value_from_single_submission(&request.values);
    Ok(Json(envelope(ValueResponse { value })))
}

async fn value_from_structured(
    State(state): State<ServiceState>,
    Path(name): Path<String>,
    Json(request): Json<StructuredSubmission>,
) -> Result<Json<ServiceEnvelope<ValueResponse>>, ServiceError> {
    let definition = state.definition(&name)?;
    let value = definition.value_from_structured_submission(request);
    Ok(Json(envelope(ValueResponse { value: Some(value) })))
}

async fn value_from_command_line(
    State(state): State<ServiceState>,
    Path(name): Path<String>,
    Json(request): Json<CommandLineRequest>,
) -> Result<Json<ServiceEnvelope<ValueResponse>>, ServiceError> {
    let definition = state.definition(&name)?;
    let value = definition.value_from_command_line(&request.value);
    Ok(Json(envelope(ValueResponse { value: Some(value) })))
}
