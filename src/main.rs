//! Binary entry point for the `vastrun` CLI.

use std::io::{self, Write};
use std::process;
use std::time::Duration;

use camino::Utf8PathBuf;
use clap::Parser;
use shell_escape::unix::escape;
use thiserror::Error;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use vastrun::control_plane::DEFAULT_DISK_GB;
use vastrun::ssh::TransferProgress;
use vastrun::{
    ApiKeyError, ApiKeyStore, ControlPlane, ControlPlaneError, CreateInstanceRequest, InstanceId,
    JobConfig, JobError, JobOrchestrator, JobReport, JobSpec, SshClient, SshConfig, SshError,
    TargetState, VastClient, VastConfig, resolve_api_key,
};

mod cli;

use cli::{Cli, Command, CopyCommand, JobArgs, LaunchCommand, StartRunCommand};

const DEFAULT_LOG_FILTER: &str = "vastrun=info";

/// Conventional status for a process stopped by SIGINT.
const INTERRUPTED_EXIT_CODE: i32 = 130;

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("api key error: {0}")]
    ApiKey(#[from] ApiKeyError),
    #[error("ssh error: {0}")]
    Ssh(#[from] SshError),
    #[error("control plane error: {0}")]
    ControlPlane(#[from] ControlPlaneError),
    #[error("job failed: {0}")]
    Job(#[from] JobError<ControlPlaneError>),
    #[error("instance {0} has no ssh endpoint yet")]
    MissingEndpoint(InstanceId),
    #[error("remote command terminated without an exit status")]
    MissingExitCode,
    #[error("invalid command argument: {0}")]
    InvalidCommand(String),
    #[error("invalid copy destination {0}: expected ID:PATH")]
    InvalidDestination(String),
    #[error("failed to write output: {0}")]
    Output(#[from] io::Error),
}

impl CliError {
    const fn exit_code(&self) -> i32 {
        match self {
            Self::Job(err) if err.is_interrupted() => INTERRUPTED_EXIT_CODE,
            _ => 1,
        }
    }
}

/// Flags that apply to every subcommand.
struct Globals {
    url: Option<String>,
    api_key: Option<String>,
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();
    let exit_code = match dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            report_error(&err);
            err.exit_code()
        }
    };

    process::exit(exit_code);
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

async fn dispatch(cli: Cli) -> Result<i32, CliError> {
    let Cli {
        url,
        api_key,
        command,
    } = cli;
    let globals = Globals { url, api_key };

    match command {
        Command::Launch(args) => launch(&globals, args).await,
        Command::StartRun(args) => start_run(&globals, args).await,
        Command::Copy(args) => copy(&globals, args).await,
        Command::Start(target) => {
            change_state(&globals, InstanceId::new(target.id), TargetState::Running).await
        }
        Command::Stop(target) => {
            change_state(&globals, InstanceId::new(target.id), TargetState::Stopped).await
        }
        Command::Destroy(target) => destroy(&globals, InstanceId::new(target.id)).await,
        Command::SshUrl(target) => print_url(&globals, InstanceId::new(target.id), "ssh").await,
        Command::ScpUrl(target) => print_url(&globals, InstanceId::new(target.id), "scp").await,
        Command::SetApiKey(args) => set_api_key(&args.key),
    }
}

fn load_vast_config(globals: &Globals) -> Result<VastConfig, CliError> {
    let mut config =
        VastConfig::load_without_cli_args().map_err(|err| CliError::Config(err.to_string()))?;
    if let Some(url) = &globals.url {
        config.server_url.clone_from(url);
    }
    if let Some(key) = &globals.api_key {
        config.api_key = Some(key.clone());
    }
    config
        .validate()
        .map_err(|err| CliError::Config(err.to_string()))?;
    Ok(config)
}

fn control_plane(globals: &Globals) -> Result<VastClient, CliError> {
    let config = load_vast_config(globals)?;
    let key = resolve_api_key(&config)?;
    Ok(VastClient::new(config.server_url, key))
}

fn ssh_client(identity: Option<&str>) -> Result<SshClient, CliError> {
    let mut config =
        SshConfig::load_without_cli_args().map_err(|err| CliError::Config(err.to_string()))?;
    if let Some(path) = identity {
        config.identity_file = Some(path.to_owned());
    }
    Ok(SshClient::with_process_runner(config)?)
}

fn build_orchestrator(
    globals: &Globals,
    identity: Option<&str>,
) -> Result<(JobOrchestrator<VastClient, SshClient>, JobConfig), CliError> {
    let job_config =
        JobConfig::load_without_cli_args().map_err(|err| CliError::Config(err.to_string()))?;
    let settings = job_config
        .job_settings()
        .map_err(|err| CliError::Config(err.to_string()))?;
    let orchestrator = JobOrchestrator::new(control_plane(globals)?, ssh_client(identity)?)
        .with_settings(settings)
        .with_progress(render_progress);
    Ok((orchestrator, job_config))
}

/// Flips to `true` on the first Ctrl-C so a running job can release its
/// instance before the process exits.
fn shutdown_on_ctrl_c() -> watch::Receiver<bool> {
    let (requested, shutdown) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            requested.send(true).ok();
        }
    });
    shutdown
}

fn job_spec(args: &JobArgs, job_config: &JobConfig) -> Result<JobSpec, CliError> {
    validate_command_args(&args.command)?;
    let cwd = std::env::current_dir().map_err(|err| CliError::Config(err.to_string()))?;
    let source = Utf8PathBuf::from_path_buf(cwd)
        .map_err(|path| CliError::Config(format!("{} is not valid UTF-8", path.display())))?;
    let timeout = args
        .timeout
        .map_or_else(|| job_config.timeout(), Duration::from_secs);
    Ok(JobSpec::new(
        render_remote_command(&args.command),
        source,
        timeout,
    ))
}

async fn launch(globals: &Globals, args: LaunchCommand) -> Result<i32, CliError> {
    let (orchestrator, job_config) = build_orchestrator(globals, args.job.identity.as_deref())?;
    let job = job_spec(&args.job, &job_config)?;
    let request = CreateInstanceRequest {
        disk_gb: args.disk.unwrap_or(DEFAULT_DISK_GB),
        price: args.price,
        label: args.label,
        onstart: args.onstart,
        ..CreateInstanceRequest::new(args.offer_id, args.image)
    };

    let mut stdout = io::stdout();
    let report = orchestrator
        .with_shutdown(shutdown_on_ctrl_c())
        .launch(&request, &job, &mut stdout)
        .await?;
    finish(&report)
}

async fn start_run(globals: &Globals, args: StartRunCommand) -> Result<i32, CliError> {
    let (orchestrator, job_config) = build_orchestrator(globals, args.job.identity.as_deref())?;
    let job = job_spec(&args.job, &job_config)?;

    let mut stdout = io::stdout();
    let report = orchestrator
        .with_shutdown(shutdown_on_ctrl_c())
        .start_and_run(InstanceId::new(args.id), &job, &mut stdout)
        .await?;
    finish(&report)
}

async fn copy(globals: &Globals, args: CopyCommand) -> Result<i32, CliError> {
    let (id, remote_path) = parse_destination(&args.destination)?;
    let (orchestrator, _) = build_orchestrator(globals, args.identity.as_deref())?;
    let report = orchestrator
        .copy(
            id,
            &Utf8PathBuf::from(args.source),
            &remote_path,
            args.ignore,
        )
        .await?;
    writeln!(
        io::stdout(),
        "copied {} files to {id}:{remote_path} ({} excluded)",
        report.transferred,
        report.excluded
    )?;
    Ok(0)
}

async fn change_state(globals: &Globals, id: InstanceId, state: TargetState) -> Result<i32, CliError> {
    control_plane(globals)?.set_state(id, state).await?;
    let verb = match state {
        TargetState::Running => "starting",
        TargetState::Stopped => "stopping",
    };
    writeln!(io::stdout(), "{verb} instance {id}")?;
    Ok(0)
}

async fn destroy(globals: &Globals, id: InstanceId) -> Result<i32, CliError> {
    control_plane(globals)?.destroy(id).await?;
    writeln!(io::stdout(), "destroying instance {id}")?;
    Ok(0)
}

async fn print_url(globals: &Globals, id: InstanceId, scheme: &str) -> Result<i32, CliError> {
    let ssh_config =
        SshConfig::load_without_cli_args().map_err(|err| CliError::Config(err.to_string()))?;
    let instance = control_plane(globals)?.instance(id).await?;
    let endpoint = instance.endpoint.ok_or(CliError::MissingEndpoint(id))?;
    writeln!(io::stdout(), "{}", endpoint.url(scheme, &ssh_config.user))?;
    Ok(0)
}

fn set_api_key(key: &str) -> Result<i32, CliError> {
    let config =
        VastConfig::load_without_cli_args().map_err(|err| CliError::Config(err.to_string()))?;
    let store = ApiKeyStore::from_config(&config);
    store.write(key)?;
    writeln!(io::stdout(), "api key saved to {}", store.path())?;
    Ok(0)
}

fn finish(report: &JobReport) -> Result<i32, CliError> {
    let mut stderr = io::stderr();
    if !report.artifacts.is_empty() {
        writeln!(
            stderr,
            "retrieved {} artifact files into {}",
            report.artifacts.files().len(),
            report.artifacts.root()
        )?;
    }
    if let Some(err) = &report.collection_error {
        writeln!(stderr, "artifacts were not retrieved: {err}")?;
    }
    report.exit_code.ok_or(CliError::MissingExitCode)
}

fn parse_destination(raw: &str) -> Result<(InstanceId, String), CliError> {
    let invalid = || CliError::InvalidDestination(raw.to_owned());
    let (id, path) = raw.split_once(':').ok_or_else(invalid)?;
    if path.is_empty() {
        return Err(invalid());
    }
    let parsed = id.parse::<InstanceId>().map_err(|_| invalid())?;
    Ok((parsed, path.to_owned()))
}

fn render_progress(progress: TransferProgress) {
    let mut stderr = io::stderr();
    let end = if progress.sent >= progress.total { "\n" } else { "" };
    write!(
        stderr,
        "\ruploading workspace: {}/{} bytes{end}",
        progress.sent, progress.total
    )
    .ok();
    stderr.flush().ok();
}

/// A lone argument is already a shell command line; several are one word each.
fn render_remote_command(args: &[String]) -> String {
    if let [command_line] = args {
        return command_line.clone();
    }
    args.iter()
        .map(|arg| escape(arg.as_str().into()))
        .collect::<Vec<_>>()
        .join(" ")
}

fn validate_command_args(args: &[String]) -> Result<(), CliError> {
    for arg in args {
        if arg
            .chars()
            .any(|ch| matches!(ch, '\u{0000}'..='\u{001F}' | '\u{007F}'))
        {
            return Err(CliError::InvalidCommand(String::from(concat!(
                "command arguments must not contain control characters (ASCII ",
                "0x00-0x1F or 0x7F, e.g. newline, carriage return, tab, NUL)"
            ))));
        }
    }
    Ok(())
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use vastrun::job::{JobStage, StageError};

    #[test]
    fn validate_command_args_rejects_control_characters() {
        let err = validate_command_args(&[String::from("echo\tbad")])
            .expect_err("tab should be rejected");

        assert!(
            matches!(err, CliError::InvalidCommand(ref message) if message.contains("control characters")),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn validate_command_args_accepts_safe_arguments() {
        assert!(validate_command_args(&[String::from("python"), String::from("train.py")]).is_ok());
    }

    #[test]
    fn render_remote_command_escapes_arguments() {
        let args = vec![
            String::from("echo"),
            String::from("a b"),
            String::from("c'd"),
        ];

        assert_eq!(render_remote_command(&args), "echo 'a b' 'c'\\''d'");
    }

    #[rstest]
    #[case::plain("python -u train.py")]
    #[case::redirection("python train.py > log.txt 2>&1")]
    fn single_argument_is_sent_as_written(#[case] command_line: &str) {
        let args = vec![String::from(command_line)];

        assert_eq!(render_remote_command(&args), command_line);
    }

    #[test]
    fn interrupted_job_exits_with_sigint_status() {
        let interrupted = CliError::Job(JobError::Stage {
            stage: JobStage::Executing,
            message: String::from("interrupted by shutdown request"),
            source: StageError::Interrupted,
        });
        let failed = CliError::Job(JobError::Stage {
            stage: JobStage::AwaitConnectable,
            message: String::from("no endpoint"),
            source: StageError::MissingEndpoint(InstanceId::new(42)),
        });

        assert_eq!(interrupted.exit_code(), INTERRUPTED_EXIT_CODE);
        assert_eq!(failed.exit_code(), 1);
        assert_eq!(CliError::MissingExitCode.exit_code(), 1);
    }

    #[rstest]
    #[case("42:/root/data", 42, "/root/data")]
    #[case("7:relative/dir", 7, "relative/dir")]
    fn parse_destination_splits_id_and_path(
        #[case] raw: &str,
        #[case] id: u64,
        #[case] path: &str,
    ) {
        let (parsed_id, parsed_path) =
            parse_destination(raw).unwrap_or_else(|err| panic!("valid destination: {err}"));

        assert_eq!(parsed_id, InstanceId::new(id));
        assert_eq!(parsed_path, path);
    }

    #[rstest]
    #[case("/root/data")]
    #[case("abc:/root")]
    #[case("42:")]
    fn parse_destination_rejects_malformed_input(#[case] raw: &str) {
        let err = parse_destination(raw).expect_err("malformed destination");

        assert!(matches!(err, CliError::InvalidDestination(_)), "{err:?}");
    }

    #[test]
    fn write_error_writes_cli_error() {
        let mut buf = Vec::new();
        write_error(&mut buf, &CliError::MissingExitCode);

        let rendered = String::from_utf8(buf).expect("utf8");
        assert!(
            rendered.contains("remote command terminated without an exit status"),
            "rendered: {rendered}"
        );
    }
}
