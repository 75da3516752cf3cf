//! Binary entry point for the cutover CLI.

mod cli;

use std::io::{self, Write};
use std::process;

use clap::Parser;
use serde::Serialize;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

use cutover::injection::InjectionOutcome;
use cutover::network::{self, MappingSummary, NetworkValidationResult};
use cutover::source::PowerChange;
use cutover::steps::display_name_for;
use cutover::validator::{SourceObservation, ValidationInput};
use cutover::{
    CleanupError, CleanupOrchestrator, CleanupOutcome, ConfigError, ContextId, ControlPlaneConfig,
    FailoverError, FailoverKind, FailoverOrchestrator, FailoverOutcome, FailoverRequest,
    FailoverStep, PreflightValidator, RollbackOptions, SanitizedMessage, Services, StoreError,
    rollback_decision, sanitize, sanitize_step,
};

use cli::{
    Cli, Command, ContextArgs, ExplainCommand, KindArg, LiveCommand, RollbackCommand,
    ValidateCommand,
};

/// Exit status when the context is not ready or the operator must decide.
const NEEDS_ATTENTION: i32 = 2;

/// Environment variable holding the log filter.
const LOG_ENV: &str = "CUTOVER_LOG";

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("state error: {0}")]
    Store(#[from] StoreError),
    #[error("failover failed: {0}")]
    Failover(#[from] Box<FailoverError>),
    #[error("cleanup failed: {0}")]
    Cleanup(#[from] Box<CleanupError>),
    #[error("failed to render output: {0}")]
    Output(#[from] serde_json::Error),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let exit_code = match dispatch(&cli.command).await {
        Ok(code) => code,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

fn init_tracing(verbose: bool) {
    let fallback = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init()
        .ok();
}

async fn dispatch(command: &Command) -> Result<i32, CliError> {
    if let Command::Explain(args) = command {
        return explain(io::stdout(), args);
    }

    let config = ControlPlaneConfig::load_without_cli_args()?;
    let services = Services::connect(&config)?;
    execute(&services, command, io::stdout()).await
}

async fn execute(
    services: &Services,
    command: &Command,
    out: impl Write,
) -> Result<i32, CliError> {
    match command {
        Command::Test(args) => run_failover(services, &test_request(services, args)?, out).await,
        Command::Live(args) => run_failover(services, &live_request(services, args)?, out).await,
        Command::Cleanup(args) => cleanup(services, args, out).await,
        Command::Rollback(args) => rollback(services, args, out).await,
        Command::Validate(args) => validate(services, args, out).await,
        Command::Networks(args) => networks(services, args, out),
        Command::Explain(args) => explain(out, args),
    }
}

const fn kind_of(arg: KindArg) -> FailoverKind {
    match arg {
        KindArg::Test => FailoverKind::Test,
        KindArg::Live => FailoverKind::Live,
    }
}

fn test_request(services: &Services, args: &ContextArgs) -> Result<FailoverRequest, CliError> {
    let context = services.store.context(&ContextId::from(args.context.as_str()))?;
    Ok(FailoverRequest::test(
        context.context_id,
        context.vm_id,
        &context.vm_name,
    ))
}

fn live_request(services: &Services, args: &LiveCommand) -> Result<FailoverRequest, CliError> {
    let context = services.store.context(&ContextId::from(args.context.as_str()))?;
    Ok(
        FailoverRequest::live(context.context_id, context.vm_id, &context.vm_name)
            .power_off_source(!args.no_power_off)
            .final_sync(!args.no_final_sync)
            .skip_validation(args.skip_validation)
            .skip_driver_injection(args.skip_driver_injection),
    )
}

async fn run_failover(
    services: &Services,
    request: &FailoverRequest,
    mut out: impl Write,
) -> Result<i32, CliError> {
    let outcome = FailoverOrchestrator::new(services)
        .execute(request)
        .await
        .map_err(Box::new)?;
    report_failover(&mut out, &outcome);
    Ok(0)
}

fn report_failover(out: &mut impl Write, outcome: &FailoverOutcome) {
    writeln!(
        out,
        "failover job {} completed: destination VM {} is running",
        outcome.job_id, outcome.destination_vm_id
    )
    .ok();
    for snapshot in outcome.snapshots.iter() {
        writeln!(
            out,
            "  protection snapshot {} on volume {}",
            snapshot.id, snapshot.volume_id
        )
        .ok();
    }
    if let Some(InjectionOutcome::Skipped { .. }) = &outcome.injection {
        writeln!(out, "  driver injection skipped").ok();
    }
}

async fn cleanup(
    services: &Services,
    args: &ContextArgs,
    mut out: impl Write,
) -> Result<i32, CliError> {
    let outcome = CleanupOrchestrator::new(services)
        .cleanup(&ContextId::from(args.context.as_str()))
        .await
        .map_err(Box::new)?;
    report_cleanup(&mut out, &outcome);
    Ok(0)
}

async fn rollback(
    services: &Services,
    args: &RollbackCommand,
    mut out: impl Write,
) -> Result<i32, CliError> {
    let context_id = ContextId::from(args.context.as_str());
    let context = services.store.context(&context_id)?;
    let kind = match args.failover_type {
        Some(kind) => kind_of(kind),
        None => services
            .store
            .latest_job(&context_id)?
            .map_or(FailoverKind::Test, |job| job.failover_type),
    };

    let Some(options) = rollback_options(args, kind) else {
        serde_json::to_writer_pretty(&mut out, &rollback_decision(kind, &context.vm_name))?;
        writeln!(out).ok();
        return Ok(NEEDS_ATTENTION);
    };

    let outcome = CleanupOrchestrator::new(services)
        .rollback(&context_id, &options)
        .await
        .map_err(Box::new)?;
    report_cleanup(&mut out, &outcome);
    Ok(0)
}

/// Resolves the rollback options, or `None` when a live rollback still
/// needs the operator's power-on decision.
fn rollback_options(args: &RollbackCommand, kind: FailoverKind) -> Option<RollbackOptions> {
    let defaults = RollbackOptions::defaults_for(kind);
    let power_on_source = match (args.power_on_source, args.leave_source_off) {
        (true, _) => true,
        (_, true) => false,
        _ if matches!(kind, FailoverKind::Live) => return None,
        _ => defaults.power_on_source,
    };
    Some(RollbackOptions {
        power_on_source,
        force_cleanup: args.force,
        ..defaults
    })
}

fn report_cleanup(out: &mut impl Write, outcome: &CleanupOutcome) {
    writeln!(out, "cleanup job {} completed", outcome.job_id).ok();
    if let Some(vm_id) = &outcome.deleted_vm {
        writeln!(out, "  deleted destination VM {vm_id}").ok();
    }
    writeln!(
        out,
        "  {} volume(s) returned to the hub",
        outcome.returned_volumes.len()
    )
    .ok();
    match outcome.source_power {
        Some(PowerChange::Switched) => {
            writeln!(out, "  source VM powered on").ok();
        }
        Some(PowerChange::AlreadyInState) => {
            writeln!(out, "  source VM was already running").ok();
        }
        None => {}
    }
}

async fn validate(
    services: &Services,
    args: &ValidateCommand,
    mut out: impl Write,
) -> Result<i32, CliError> {
    let context_id = ContextId::from(args.context.as_str());
    let context = services.store.context(&context_id)?;
    let mappings = services.store.network_mappings(&context_id)?;
    let source = match services.source_power().state(&context.vm_id).await {
        Ok(state) => SourceObservation::Reported(state),
        Err(err) => SourceObservation::Unavailable(err.to_string()),
    };
    let kind = kind_of(args.failover_type);

    let report = PreflightValidator::new().validate(&ValidationInput {
        context: &context,
        mappings: &mappings,
        kind,
        powers_off_source: matches!(kind, FailoverKind::Live),
        source: &source,
    });
    serde_json::to_writer_pretty(&mut out, &report)?;
    writeln!(out).ok();
    Ok(if report.is_valid { 0 } else { NEEDS_ATTENTION })
}

#[derive(Debug, Serialize)]
struct NetworkReport {
    summary: MappingSummary,
    validation: NetworkValidationResult,
}

fn networks(services: &Services, args: &ContextArgs, mut out: impl Write) -> Result<i32, CliError> {
    let context_id = ContextId::from(args.context.as_str());
    let context = services.store.context(&context_id)?;
    let mappings = services.store.network_mappings(&context_id)?;

    let report = NetworkReport {
        summary: network::summarize(&mappings),
        validation: network::audit(&context_id, &context.networks, &mappings),
    };
    serde_json::to_writer_pretty(&mut out, &report)?;
    writeln!(out).ok();
    Ok(0)
}

#[derive(Debug, Serialize)]
struct Explanation {
    step: String,
    #[serde(flatten)]
    message: SanitizedMessage,
}

fn explain(mut out: impl Write, args: &ExplainCommand) -> Result<i32, CliError> {
    let explanation = Explanation {
        step: display_name_for(&args.step),
        message: sanitize(&args.step, Some(&args.message)),
    };
    serde_json::to_writer_pretty(&mut out, &explanation)?;
    writeln!(out).ok();
    Ok(0)
}

/// Headline and per-step sanitized messages for errors raised by a step.
///
/// Returns `None` for errors that carry no step output.
fn sanitized_report(err: &CliError) -> Option<(String, Vec<(FailoverStep, SanitizedMessage)>)> {
    match err {
        CliError::Failover(failover) => match failover.as_ref() {
            FailoverError::StepFailed { job_id, step, source } => Some((
                format!("failover job {job_id} failed"),
                vec![(*step, sanitize_step(*step, source))],
            )),
            _ => None,
        },
        CliError::Cleanup(cleanup) => match cleanup.as_ref() {
            CleanupError::Step { job_id, step, source } => Some((
                format!("cleanup job {job_id} failed"),
                vec![(*step, sanitize_step(*step, source))],
            )),
            CleanupError::Incomplete { job_id, failures } => Some((
                format!(
                    "cleanup job {job_id} finished with {} failed step(s)",
                    failures.len()
                ),
                failures
                    .iter()
                    .map(|failure| {
                        (
                            failure.step,
                            sanitize(failure.step.id(), Some(&failure.message)),
                        )
                    })
                    .collect(),
            )),
            CleanupError::SourcePowerOn { job_id, source } => Some((
                format!("cleanup job {job_id} completed but the source VM is still off"),
                vec![(
                    FailoverStep::SourceVmPowerOn,
                    sanitize_step(FailoverStep::SourceVmPowerOn, source),
                )],
            )),
            CleanupError::Store(_) => None,
        },
        _ => None,
    }
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    let Some((headline, messages)) = sanitized_report(err) else {
        writeln!(target, "{err}").ok();
        return;
    };
    writeln!(target, "{headline}").ok();
    for (step, message) in messages {
        writeln!(target, "{}: {}", step.display_name(), message.user_message).ok();
        for hint in &message.actionable_steps {
            writeln!(target, "  - {hint}").ok();
        }
    }
}

#[cfg(test)]
#[path = "main_tests.rs"]
mod tests;
