use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use jira_version_api::{
    today_utc, ExecutionContext, JiraVersionParameterDefinition, ParameterCatalog,
    ParameterDefinition, WorkspaceConfig, API_CONTRACT_VERSION,
};
use jira_version_core::ISO_DATE_FORMAT;
use serde_json::Value;
use time::Date;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "jvp")]
#[command(about = "Jira release version parameter CLI")]
struct Cli {
    #[arg(long, default_value = "./jira-versions.yaml")]
    config: PathBuf,

    #[arg(long, default_value_t = false)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List the versions offered for a parameter.
    Candidates(CandidatesArgs),
    /// Build a parameter value from a command-line argument.
    Value(ValueArgs),
    /// Build a parameter value from form-style submitted values.
    Submit(SubmitArgs),
    Parameters,
    Definition {
        #[command(subcommand)]
        command: DefinitionCommand,
    },
}

#[derive(Debug, Args)]
struct CandidatesArgs {
    #[arg(long)]
    parameter: String,
    #[arg(long)]
    project: String,
    #[arg(long)]
    site: Option<String>,
    /// Date treated as today, YYYY-MM-DD. Defaults to the current UTC date.
    #[arg(long)]
    today: Option<String>,
    /// Include rejected versions and the reason they were dropped.
    #[arg(long, default_value_t = false)]
    explain: bool,
}

#[derive(Debug, Args)]
struct ValueArgs {
    #[arg(long)]
    parameter: String,
    value: String,
}

#[derive(Debug, Args)]
struct SubmitArgs {
    #[arg(long)]
    parameter: String,
    #[arg(long = "value")]
    values: Vec<String>,
}

#[derive(Debug, Subcommand)]
enum DefinitionCommand {
    Show(DefinitionShowArgs),
    Check,
}

#[derive(Debug, Args)]
struct DefinitionShowArgs {
    #[arg(long)]
    parameter: String,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            object.insert(
                "api_contract_version".to_string(),
                Value::String(API_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "api_contract_version": API_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_logging(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    // stdout carries JSON output only.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Command::Candidates(args) => run_candidates(&args, &ParameterCatalog::load(&cli.config)?),
        Command::Value(args) => run_value(&args, &ParameterCatalog::load(&cli.config)?),
        Command::Submit(args) => run_submit(&args, &ParameterCatalog::load(&cli.config)?),
        Command::Parameters => {
            let catalog = ParameterCatalog::load(&cli.config)?;
            emit_json(serde_json::json!({ "parameters": catalog.parameter_names() }))
        }
        Command::Definition { command: DefinitionCommand::Show(args) } => {
            let catalog = ParameterCatalog::load(&cli.config)?;
            let definition = lookup(&catalog, &args.parameter)?;
            emit_json(serde_json::json!({ "definition": definition.to_config() }))
        }
        Command::Definition { command: DefinitionCommand::Check } => {
            run_definition_check(&cli.config)
        }
    }
}

fn lookup<'a>(
    catalog: &'a ParameterCatalog,
    name: &str,
) -> Result<&'a JiraVersionParameterDefinition> {
    catalog.definition(name).ok_or_else(|| anyhow!("unknown parameter `{name}`"))
}

fn parse_today(raw: Option<&str>) -> Result<Date> {
    match raw {
        Some(text) => Date::parse(text, ISO_DATE_FORMAT)
            .with_context(|| format!("--today must be YYYY-MM-DD, got `{text}`")),
        None => Ok(today_utc()),
    }
}

fn run_candidates(args: &CandidatesArgs, catalog: &ParameterCatalog) -> Result<()> {
    let definition = lookup(catalog, &args.parameter)?;
    let today = parse_today(args.today.as_deref())?;
    let mut context = ExecutionContext::new(&args.project);
    if let Some(site) = &args.site {
        context = context.with_site(site);
    }

    if args.explain {
        let decisions = definition
            .explain(&context, catalog.registry(), today)
            .with_context(|| format!("failed to evaluate versions for `{}`", args.parameter))?;
        let decisions: Vec<Value> = decisions
            .iter()
            .map(|decision| {
                serde_json::json!({
                    "name": decision.name,
                    "id": decision.id,
                    "included": decision.included(),
                    "rejection": decision.rejection.map(|rejection| rejection.as_str()),
                    "reason": decision.rejection.map(|rejection| rejection.reason()),
                })
            })
            .collect();
        return emit_json(serde_json::json!({
            "parameter": args.parameter,
            "project": args.project,
            "today": today.to_string(),
            "decisions": decisions
        }));
    }

    let candidates = definition
        .candidate_list(&context, catalog.registry(), today)
        .with_context(|| format!("failed to list versions for `{}`", args.parameter))?;
    tracing::info!(parameter = %args.parameter, count = candidates.len(), "listed candidates");
    emit_json(serde_json::json!({
        "parameter": args.parameter,
        "project": args.project,
        "today": today.to_string(),
        "candidates": candidates
    }))
}

fn run_value(args: &ValueArgs, catalog: &ParameterCatalog) -> Result<()> {
    let definition = lookup(catalog, &args.parameter)?;
    let value = definition.value_from_command_line(&args.value);
    emit_json(serde_json::json!({ "value": value }))
}

fn run_submit(args: &SubmitArgs, catalog: &ParameterCatalog) -> Result<()> {
    let definition = lookup(catalog, &args.parameter)?;
    let value = definition.value_from_single_submission(&args.values);
    if value.is_none() {
        tracing::debug!(
            parameter = %args.parameter,
            submitted = args.values.len(),
            "submission did not carry exactly one value"
        );
    }
    emit_json(serde_json::json!({ "value": value }))
}

fn run_definition_check(config_path: &Path) -> Result<()> {
    let config = WorkspaceConfig::load(config_path)?;
    let mut results = Vec::with_capacity(config.parameters.len());
    let mut failures = 0_usize;
    for parameter in &config.parameters {
        match JiraVersionParameterDefinition::from_config(parameter) {
            Ok(_) => results.push(serde_json::json!({ "name": parameter.name, "ok": true })),
            Err(err) => {
                failures += 1;
                results.push(serde_json::json!({
                    "name": parameter.name,
                    "ok": false,
                    "error": err.to_string()
                }));
            }
        }
    }
    emit_json(serde_json::json!({ "checked": results.len(), "results": results }))?;
    if failures > 0 {
        return Err(anyhow!("{failures} parameter definition(s) failed to compile"));
    }
    Ok(())
}
