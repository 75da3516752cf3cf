//! Command-line interface definitions for the `cutover` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::{Args, Parser, Subcommand, ValueEnum};

/// Top-level CLI for the `cutover` binary.
#[derive(Debug, Parser)]
#[command(
    name = "cutover",
    about = "Fail replicated VMs over to the destination platform and roll them back",
    arg_required_else_help = true
)]
pub(crate) struct Cli {
    /// Log at debug level unless `CUTOVER_LOG` says otherwise.
    #[arg(long, short, global = true)]
    pub(crate) verbose: bool,
    /// Operation to run.
    #[command(subcommand)]
    pub(crate) command: Command,
}

/// Subcommands of the `cutover` binary.
#[derive(Debug, Subcommand)]
pub(crate) enum Command {
    /// Start a sandboxed test failover.
    #[command(name = "test", about = "Start a sandboxed test failover")]
    Test(ContextArgs),
    /// Cut the VM over for production.
    #[command(name = "live", about = "Cut the VM over for production")]
    Live(LiveCommand),
    /// Tear down a test failover.
    #[command(name = "cleanup", about = "Tear down a test failover")]
    Cleanup(ContextArgs),
    /// Roll back a failover and optionally power the source back on.
    #[command(
        name = "rollback",
        about = "Roll back a failover and optionally power the source back on"
    )]
    Rollback(RollbackCommand),
    /// Run the pre-flight checks without failing over.
    #[command(name = "validate", about = "Run the pre-flight checks without failing over")]
    Validate(ValidateCommand),
    /// Audit the network mappings of a context.
    #[command(name = "networks", about = "Audit the network mappings of a context")]
    Networks(ContextArgs),
    /// Show the operator-facing rendering of a step error.
    #[command(name = "explain", about = "Show the operator-facing rendering of a step error")]
    Explain(ExplainCommand),
}

/// Arguments naming a VM context.
#[derive(Debug, Args)]
pub(crate) struct ContextArgs {
    /// Identifier of the replicated VM context.
    #[arg(value_name = "CONTEXT")]
    pub(crate) context: String,
}

/// Arguments for `cutover live`.
#[derive(Debug, Args)]
pub(crate) struct LiveCommand {
    /// Identifier of the replicated VM context.
    #[arg(value_name = "CONTEXT")]
    pub(crate) context: String,
    /// Leave the source VM running during the cutover.
    #[arg(long)]
    pub(crate) no_power_off: bool,
    /// Skip the last incremental sync.
    ///
    /// Only meaningful when the source is powered off; a running source
    /// never gets a final sync.
    #[arg(long)]
    pub(crate) no_final_sync: bool,
    /// Skip the pre-flight checks.
    #[arg(long)]
    pub(crate) skip_validation: bool,
    /// Skip guest driver injection.
    #[arg(long)]
    pub(crate) skip_driver_injection: bool,
}

/// Arguments for `cutover rollback`.
#[derive(Debug, Args)]
pub(crate) struct RollbackCommand {
    /// Identifier of the replicated VM context.
    #[arg(value_name = "CONTEXT")]
    pub(crate) context: String,
    /// Keep going after a failed step and report every failure at the end.
    #[arg(long)]
    pub(crate) force: bool,
    /// Power the source VM back on once the teardown finishes.
    #[arg(long, conflicts_with = "leave_source_off")]
    pub(crate) power_on_source: bool,
    /// Leave the source VM powered off.
    #[arg(long, conflicts_with = "power_on_source")]
    pub(crate) leave_source_off: bool,
    /// Kind of failover being reversed; read from the latest job by default.
    #[arg(long = "type", value_enum, value_name = "TYPE")]
    pub(crate) failover_type: Option<KindArg>,
}

/// Arguments for `cutover validate`.
#[derive(Debug, Args)]
pub(crate) struct ValidateCommand {
    /// Identifier of the replicated VM context.
    #[arg(value_name = "CONTEXT")]
    pub(crate) context: String,
    /// Kind of failover to check readiness for.
    #[arg(long = "type", value_enum, value_name = "TYPE", default_value = "test")]
    pub(crate) failover_type: KindArg,
}

/// Arguments for `cutover explain`.
#[derive(Debug, Args)]
pub(crate) struct ExplainCommand {
    /// Step identifier, for example `virtio-driver-injection`.
    #[arg(value_name = "STEP")]
    pub(crate) step: String,
    /// Raw error text reported by the step.
    #[arg(value_name = "MESSAGE")]
    pub(crate) message: String,
}

/// Failover kind accepted on the command line.
#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub(crate) enum KindArg {
    /// Sandboxed test failover.
    Test,
    /// Production cutover.
    Live,
}
