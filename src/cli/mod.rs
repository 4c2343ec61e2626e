//! Command-line interface definitions for the `vastrun` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::{Args, Parser, Subcommand};

/// Top-level CLI for the `vastrun` binary.
#[derive(Debug, Parser)]
#[command(
    name = "vastrun",
    about = "Run jobs on rented vast.ai GPU instances and tear them down afterwards",
    arg_required_else_help = true
)]
pub(crate) struct Cli {
    /// Control plane base URL; overrides `VAST_SERVER_URL`.
    #[arg(long, global = true, value_name = "URL")]
    pub(crate) url: Option<String>,
    /// API key for this invocation; overrides the stored key.
    #[arg(long, global = true, value_name = "KEY")]
    pub(crate) api_key: Option<String>,
    /// Subcommand to run.
    #[command(subcommand)]
    pub(crate) command: Command,
}

/// Subcommands of `vastrun`.
#[derive(Debug, Subcommand)]
pub(crate) enum Command {
    /// Rent an offer, run a command on it, and destroy it.
    #[command(name = "launch")]
    Launch(LaunchCommand),
    /// Start a stopped instance, run a command on it, and stop it again.
    #[command(name = "start-run")]
    StartRun(StartRunCommand),
    /// Copy a local directory to a running instance.
    #[command(name = "copy")]
    Copy(CopyCommand),
    /// Request the running state for an instance.
    #[command(name = "start")]
    Start(InstanceArg),
    /// Request the stopped state for an instance.
    #[command(name = "stop")]
    Stop(InstanceArg),
    /// Destroy an instance irreversibly.
    #[command(name = "destroy")]
    Destroy(InstanceArg),
    /// Print the ssh:// URL of an instance.
    #[command(name = "ssh-url")]
    SshUrl(InstanceArg),
    /// Print the scp:// URL of an instance.
    #[command(name = "scp-url")]
    ScpUrl(InstanceArg),
    /// Store the API key used for later invocations.
    #[command(name = "set-api-key")]
    SetApiKey(SetApiKeyCommand),
}

/// Options shared by commands that run a job.
#[derive(Debug, Args)]
pub(crate) struct JobArgs {
    /// Seconds to wait for the instance to start and accept SSH.
    #[arg(long, value_name = "SECS")]
    pub(crate) timeout: Option<u64>,
    /// Private key used for SSH; overrides `VAST_SSH_IDENTITY_FILE`.
    #[arg(long, value_name = "PATH")]
    pub(crate) identity: Option<String>,
    /// Command to execute on the remote host.
    ///
    /// A single argument is handed to the remote shell as written, so
    /// `"python -u train.py > log.txt"` keeps its spaces and redirection.
    /// Several arguments are quoted one by one. Put `--` before a command
    /// that starts with a flag.
    #[arg(required = true, trailing_var_arg = true)]
    pub(crate) command: Vec<String>,
}

/// Arguments for `vastrun launch`.
#[derive(Debug, Args)]
pub(crate) struct LaunchCommand {
    /// Offer identifier to rent.
    #[arg(value_name = "OFFER_ID")]
    pub(crate) offer_id: u64,
    /// Docker image to boot.
    #[arg(long, default_value = "pytorch/pytorch", value_name = "IMAGE")]
    pub(crate) image: String,
    /// Local disk size in gigabytes.
    #[arg(long, value_name = "GB")]
    pub(crate) disk: Option<u32>,
    /// Bid price per hour for interruptible instances.
    #[arg(long, value_name = "USD")]
    pub(crate) price: Option<f64>,
    /// Label attached to the instance.
    #[arg(long, value_name = "LABEL")]
    pub(crate) label: Option<String>,
    /// Command the image runs on boot.
    #[arg(long = "onstart-cmd", value_name = "CMD")]
    pub(crate) onstart: Option<String>,
    /// Job options.
    #[command(flatten)]
    pub(crate) job: JobArgs,
}

/// Arguments for `vastrun start-run`.
#[derive(Debug, Args)]
pub(crate) struct StartRunCommand {
    /// Instance to start.
    #[arg(value_name = "ID")]
    pub(crate) id: u64,
    /// Job options.
    #[command(flatten)]
    pub(crate) job: JobArgs,
}

/// Arguments for `vastrun copy`.
#[derive(Debug, Args)]
pub(crate) struct CopyCommand {
    /// Local directory to copy.
    #[arg(value_name = "SRC")]
    pub(crate) source: String,
    /// Destination as `ID:PATH`.
    #[arg(value_name = "ID:PATH")]
    pub(crate) destination: String,
    /// Apply `.vastignore` or `.gitignore` patterns.
    #[arg(long)]
    pub(crate) ignore: bool,
    /// Private key used for SSH; overrides `VAST_SSH_IDENTITY_FILE`.
    #[arg(long, value_name = "PATH")]
    pub(crate) identity: Option<String>,
}

/// A single instance identifier.
#[derive(Debug, Args)]
pub(crate) struct InstanceArg {
    /// Instance identifier.
    #[arg(value_name = "ID")]
    pub(crate) id: u64,
}

/// Arguments for `vastrun set-api-key`.
#[derive(Debug, Args)]
pub(crate) struct SetApiKeyCommand {
    /// Key to store.
    #[arg(value_name = "KEY")]
    pub(crate) key: String,
}
