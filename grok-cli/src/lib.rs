//! Administrative front end for the authorization framework.
//!
//! Every command builds a framework from the configuration file and runs one
//! reload before doing its work, the same way the host does at startup.

pub mod cli_args;

use std::fmt::Write as _;

use anyhow::Context;
use anyhow::Result;
use grok_authz::AuthorizationFramework;
use grok_authz::EntryStatus;
use grok_authz::Group;
use grok_authz::Project;
use grok_plugin::ReloadOutcome;
use grok_plugin::ReloadReport;
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

pub use cli_args::CheckArgs;
pub use cli_args::Cli;
pub use cli_args::Command;
pub use cli_args::OutputFormat;

/// Logs go to stderr so command output stays parseable.
pub fn init_tracing(verbose: bool) {
    let default_level = if verbose { "info" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let layer = fmt::layer().with_target(false).with_writer(std::io::stderr);
    tracing_subscriber::registry().with(filter).with(layer).init();
}

/// What a command prints, and whether the process should exit successfully.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub text: String,
    /// False when `check` denied any target.
    pub success: bool,
}

pub fn run(cli: &Cli) -> Result<CommandOutput> {
    let config = cli
        .load_config()
        .with_context(|| format!("loading {}", cli.config.display()))?;
    let framework = AuthorizationFramework::new(config)?;
    let outcome = framework.reload();
    if let ReloadOutcome::Skipped { reason } = &outcome {
        info!(%reason, "no plugins loaded, every request is allowed");
    }

    let mut success = true;
    let text = match &cli.command {
        Command::Reload { format } => render_outcome(&outcome, *format)?,
        Command::Stack => framework.hierarchy_to_string(),
        Command::Status { format } => render_statuses(&framework.statuses(), *format)?,
        Command::Check(args) => {
            let (output, all_allowed) = decide(&framework, args);
            success = all_allowed;
            output
        }
        Command::Stats(args) => {
            decide(&framework, args);
            let mut output = serde_json::to_string_pretty(&framework.statistics().snapshot())?;
            output.push('\n');
            output
        }
    };
    Ok(CommandOutput { text, success })
}

/// One `allowed`/`denied` line per target, projects first.
fn decide(framework: &AuthorizationFramework, args: &CheckArgs) -> (String, bool) {
    let request = args.request();
    let mut output = String::new();
    let mut all_allowed = true;
    let projects = args.projects.iter().map(|name| {
        let allowed = framework.is_allowed_project(&request, &Project::new(name.as_str()));
        ("project", name, allowed)
    });
    let groups = args.groups.iter().map(|name| {
        let allowed = framework.is_allowed_group(&request, &Group::new(name.as_str()));
        ("group", name, allowed)
    });
    for (kind, name, allowed) in projects.chain(groups) {
        all_allowed &= allowed;
        let verdict = if allowed { "allowed" } else { "denied" };
        let _ = writeln!(output, "{kind} {name}: {verdict}");
    }
    (output, all_allowed)
}

#[derive(Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
enum OutcomeView<'a> {
    Completed(&'a ReloadReport),
    Skipped { reason: &'a str },
}

fn render_outcome(outcome: &ReloadOutcome, format: OutputFormat) -> Result<String> {
    let view = match outcome {
        ReloadOutcome::Completed(report) => OutcomeView::Completed(report),
        ReloadOutcome::Skipped { reason } => OutcomeView::Skipped { reason },
    };
    if format == OutputFormat::Json {
        return Ok(serde_json::to_string_pretty(&view)? + "\n");
    }

    let mut output = String::new();
    match view {
        OutcomeView::Skipped { reason } => {
            let _ = writeln!(output, "reload skipped: {reason}");
        }
        OutcomeView::Completed(report) => {
            let _ = writeln!(
                output,
                "{}: {} candidates, {} loaded, {} skipped, {} failed ({} security violations)",
                report.directory.display(),
                report.candidates,
                report.loaded.len(),
                report.skipped.len(),
                report.failures.len(),
                report.security_violations(),
            );
            for unit in &report.loaded {
                let _ = writeln!(output, "  loaded  {unit}");
            }
            for unit in &report.skipped {
                let _ = writeln!(output, "  skipped {unit}");
            }
            for failure in &report.failures {
                let label = if failure.security_violation { "refused" } else { "failed " };
                let _ = writeln!(output, "  {label} {}: {}", failure.unit, failure.error);
            }
        }
    }
    Ok(output)
}

fn render_statuses(statuses: &[EntryStatus], format: OutputFormat) -> Result<String> {
    if format == OutputFormat::Json {
        return Ok(serde_json::to_string_pretty(statuses)? + "\n");
    }
    let mut output = String::new();
    for status in statuses {
        let indent = "  ".repeat(status.path.len().saturating_sub(1));
        let _ = write!(output, "{indent}{} {} [{}]", status.role, status.name(), status.state);
        if let Some(origin) = &status.origin {
            let _ = write!(output, " from {origin}");
        }
        if let Some(error) = &status.error {
            let _ = write!(output, ": {error}");
        }
        output.push('\n');
    }
    Ok(output)
}
