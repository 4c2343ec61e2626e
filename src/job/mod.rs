//! Orchestrates a complete job on a rented instance.
//!
//! A job waits for the instance to run, waits for SSH, ships the local
//! workspace, runs the command, pulls artifacts back and tears the instance
//! down. The overall timeout bounds only the two waiting stages. An
//! [`InstanceLease`] is held from the moment the job owns the instance (on
//! creation for rented instances, once running otherwise) and is released
//! on every exit path, including when a shutdown is requested mid-job.

use std::cell::Cell;
use std::fmt;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use shell_escape::unix::escape;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::artifacts::{ARTIFACTS_DIR, ArtifactBundle, ArtifactCollector};
use crate::config::DEFAULT_REMOTE_PATH;
use crate::connect::{CONNECT_POLL_INTERVAL, ConnectError, ConnectionEstablisher};
use crate::control_plane::{
    ControlPlane, CreateInstanceRequest, Instance, InstanceId, TargetState,
};
use crate::deadline::Deadline;
use crate::exec::{ExecError, OUTPUT_POLL_INTERVAL, RemoteExecutor, SETTLE_INTERVAL};
use crate::lifecycle::{InstanceLifecycleWaiter, RUNNING_POLL_INTERVAL, WaitError};
use crate::ssh::{RemoteShell, Session, SshError, TransferError, TransferProgress};
use crate::sync::{SyncError, SyncReport, WorkspaceSynchronizer};

/// Script written into the remote root and sourced before every command.
pub const ENV_SCRIPT: &str = ".vast-set-path.sh";

/// Dependency list installed before the command when present locally.
pub const REQUIREMENTS_FILE: &str = "requirements.txt";

/// Stages of a job, in execution order.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum JobStage {
    /// Waiting for the control plane to report the instance running.
    AwaitRunning,
    /// Waiting for the instance to accept SSH sessions.
    AwaitConnectable,
    /// Uploading and unpacking the workspace.
    Syncing,
    /// Writing the environment script and installing requirements.
    Preparing,
    /// Running the user command.
    Executing,
    /// Downloading the artifacts directory.
    Collecting,
}

impl fmt::Display for JobStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::AwaitRunning => "waiting for instance",
            Self::AwaitConnectable => "waiting for ssh",
            Self::Syncing => "workspace sync",
            Self::Preparing => "environment setup",
            Self::Executing => "remote command",
            Self::Collecting => "artifact collection",
        };
        f.write_str(name)
    }
}

/// How an instance is released at the end of a job.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Teardown {
    /// Request the stopped state; the instance can be restarted later.
    Stop,
    /// Destroy the instance irreversibly.
    Destroy,
}

impl fmt::Display for Teardown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stop => f.write_str("stop"),
            Self::Destroy => f.write_str("destroy"),
        }
    }
}

/// Failure of a single job stage.
#[derive(Debug, Error)]
pub enum StageError<E>
where
    E: std::error::Error + 'static,
{
    /// The instance did not start, or could not be looked up.
    #[error(transparent)]
    Wait(#[from] WaitError<E>),
    /// The instance runs but advertises no SSH endpoint.
    #[error("instance {0} is running but reports no ssh endpoint")]
    MissingEndpoint(InstanceId),
    /// SSH never became available.
    #[error(transparent)]
    Connect(#[from] ConnectError),
    /// The workspace could not be shipped.
    #[error(transparent)]
    Sync(#[from] SyncError),
    /// A preparation command failed.
    #[error(transparent)]
    Setup(#[from] SshError),
    /// The user command could not be run to completion.
    #[error(transparent)]
    Exec(#[from] ExecError),
    /// A shutdown was requested while the stage was in progress.
    #[error("interrupted by shutdown request")]
    Interrupted,
}

/// Errors surfaced by [`JobOrchestrator`].
#[derive(Debug, Error)]
pub enum JobError<E>
where
    E: std::error::Error + 'static,
{
    /// Renting a new instance failed.
    #[error("failed to create instance: {0}")]
    Create(#[source] E),
    /// The start request was rejected.
    #[error("failed to start instance {id}: {source}")]
    Start {
        /// Instance that was asked to start.
        id: InstanceId,
        /// Control plane error.
        #[source]
        source: E,
    },
    /// A stage failed. When the instance was leased, teardown has already
    /// been attempted and `message` notes any teardown failure.
    #[error("{stage} failed: {message}")]
    Stage {
        /// Stage that failed.
        stage: JobStage,
        /// Failure description, including any teardown note.
        message: String,
        /// Underlying stage error.
        #[source]
        source: StageError<E>,
    },
    /// Every stage succeeded but the instance could not be released.
    #[error("failed to {action} instance {id}: {source}")]
    Teardown {
        /// Instance being released.
        id: InstanceId,
        /// Release action that failed.
        action: Teardown,
        /// Control plane error.
        #[source]
        source: E,
    },
}

impl<E> JobError<E>
where
    E: std::error::Error + 'static,
{
    /// Stage the job failed at, if it got that far.
    #[must_use]
    pub const fn stage(&self) -> Option<JobStage> {
        match self {
            Self::Stage { stage, .. } => Some(*stage),
            Self::Create(_) | Self::Start { .. } | Self::Teardown { .. } => None,
        }
    }

    /// Returns `true` when the job stopped because a shutdown was requested.
    #[must_use]
    pub const fn is_interrupted(&self) -> bool {
        matches!(
            self,
            Self::Stage {
                source: StageError::Interrupted,
                ..
            }
        )
    }
}

/// Outcome of a completed job.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct JobReport {
    /// Instance the job ran on.
    pub instance_id: InstanceId,
    /// Workspace transfer counts.
    pub sync: SyncReport,
    /// Exit code of the user command, if the remote side reported one.
    pub exit_code: Option<i32>,
    /// Artifacts retrieved after the command.
    pub artifacts: ArtifactBundle,
    /// Transfer failure during collection. Collection failures do not fail
    /// the job.
    pub collection_error: Option<TransferError>,
}

impl JobReport {
    /// Returns `true` when the user command exited with status zero.
    #[must_use]
    pub const fn succeeded(&self) -> bool {
        matches!(self.exit_code, Some(0))
    }
}

/// Tunables shared by every job an orchestrator runs.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct JobSettings {
    /// Remote working directory.
    pub remote_root: String,
    /// Artifacts directory relative to `remote_root`.
    pub artifacts_dir: String,
    /// Interval between instance state lookups.
    pub running_poll_interval: Duration,
    /// Interval between SSH login attempts.
    pub connect_poll_interval: Duration,
    /// Interval between output channel polls.
    pub output_poll_interval: Duration,
    /// Wait applied before concluding a command printed nothing.
    pub settle_interval: Duration,
    /// Whether ignore files filter the workspace.
    pub use_ignore_file: bool,
    /// Whether `requirements.txt` is installed before the command.
    pub install_requirements: bool,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            remote_root: DEFAULT_REMOTE_PATH.to_owned(),
            artifacts_dir: ARTIFACTS_DIR.to_owned(),
            running_poll_interval: RUNNING_POLL_INTERVAL,
            connect_poll_interval: CONNECT_POLL_INTERVAL,
            output_poll_interval: OUTPUT_POLL_INTERVAL,
            settle_interval: SETTLE_INTERVAL,
            use_ignore_file: true,
            install_requirements: true,
        }
    }
}

impl JobSettings {
    /// Absolute remote path of the artifacts directory.
    #[must_use]
    pub fn artifacts_remote_path(&self) -> String {
        let root = self.remote_root.trim_end_matches('/');
        format!("{root}/{}", self.artifacts_dir)
    }
}

/// What to run and where its files live locally.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct JobSpec {
    /// Shell command run in the remote root. Arguments must already be
    /// escaped.
    pub command: String,
    /// Local workspace shipped before the command.
    pub local_root: Utf8PathBuf,
    /// Local directory the artifacts directory is downloaded into.
    pub artifacts_dest: Utf8PathBuf,
    /// Budget for the instance to start and accept SSH.
    pub timeout: Duration,
}

impl JobSpec {
    /// Creates a job that collects artifacts into `local_root`.
    #[must_use]
    pub fn new(
        command: impl Into<String>,
        local_root: impl Into<Utf8PathBuf>,
        timeout: Duration,
    ) -> Self {
        let root = local_root.into();
        Self {
            command: command.into(),
            artifacts_dest: root.clone(),
            local_root: root,
            timeout,
        }
    }

    /// Overrides where artifacts are downloaded to.
    #[must_use]
    pub fn with_artifacts_dest(mut self, dest: impl Into<Utf8PathBuf>) -> Self {
        self.artifacts_dest = dest.into();
        self
    }
}

/// Holds an instance that must be stopped or destroyed.
///
/// Release consumes the lease. Dropping it unreleased, for example when the
/// job future is cancelled, logs the instance that was left running.
#[derive(Debug)]
pub struct InstanceLease<'a, C> {
    control_plane: &'a C,
    id: InstanceId,
    teardown: Teardown,
    released: bool,
}

impl<'a, C> InstanceLease<'a, C>
where
    C: ControlPlane,
{
    /// Leases `id`, to be released with `teardown`.
    #[must_use]
    pub const fn new(control_plane: &'a C, id: InstanceId, teardown: Teardown) -> Self {
        Self {
            control_plane,
            id,
            teardown,
            released: false,
        }
    }

    /// Leased instance.
    #[must_use]
    pub const fn id(&self) -> InstanceId {
        self.id
    }

    /// Issues the teardown request.
    ///
    /// # Errors
    ///
    /// Returns the control plane error when the request is rejected.
    pub async fn release(mut self) -> Result<(), C::Error> {
        self.released = true;
        info!(instance = %self.id, action = %self.teardown, "tearing down instance");
        match self.teardown {
            Teardown::Stop => {
                self.control_plane
                    .set_state(self.id, TargetState::Stopped)
                    .await
            }
            Teardown::Destroy => self.control_plane.destroy(self.id).await,
        }
    }
}

impl<C> Drop for InstanceLease<'_, C> {
    fn drop(&mut self) {
        if !self.released {
            warn!(
                instance = %self.id,
                action = %self.teardown,
                "job abandoned before teardown; instance was not released"
            );
        }
    }
}

type Progress = Arc<dyn Fn(TransferProgress) + Send + Sync>;

struct StageFailure<E>
where
    E: std::error::Error + 'static,
{
    stage: JobStage,
    source: StageError<E>,
}

/// Runs jobs against a control plane and a remote shell.
pub struct JobOrchestrator<C, S> {
    control_plane: C,
    shell: S,
    settings: JobSettings,
    progress: Option<Progress>,
    shutdown: Option<watch::Receiver<bool>>,
}

impl<C, S> fmt::Debug for JobOrchestrator<C, S>
where
    C: fmt::Debug,
    S: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobOrchestrator")
            .field("control_plane", &self.control_plane)
            .field("shell", &self.shell)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl<C, S> JobOrchestrator<C, S>
where
    C: ControlPlane,
    S: RemoteShell,
{
    /// Creates an orchestrator with default settings.
    #[must_use]
    pub fn new(control_plane: C, shell: S) -> Self {
        Self {
            control_plane,
            shell,
            settings: JobSettings::default(),
            progress: None,
            shutdown: None,
        }
    }

    /// Replaces the settings.
    #[must_use]
    pub fn with_settings(mut self, settings: JobSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Registers a callback for upload progress.
    #[must_use]
    pub fn with_progress<F>(mut self, progress: F) -> Self
    where
        F: Fn(TransferProgress) + Send + Sync + 'static,
    {
        self.progress = Some(Arc::new(progress));
        self
    }

    /// Aborts running jobs once `shutdown` turns `true`.
    ///
    /// The leased instance is torn down before the job returns
    /// [`StageError::Interrupted`]. Dropping the sender never triggers a
    /// shutdown.
    #[must_use]
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Runs a job on an instance whose start has already been requested,
    /// releasing it with `teardown` afterwards.
    ///
    /// An instance that never reports running is left alone: it was never
    /// reached, so no teardown is issued.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::Stage`] naming the failed stage, or
    /// [`JobError::Teardown`] when only the release failed.
    pub async fn run_job<W>(
        &self,
        id: InstanceId,
        job: &JobSpec,
        teardown: Teardown,
        sink: &mut W,
    ) -> Result<JobReport, JobError<C::Error>>
    where
        W: Write + ?Sized,
    {
        self.drive(id, job, teardown, false, sink).await
    }

    /// Requests the running state for a stopped instance, runs the job and
    /// stops the instance again.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::Start`] when the start request fails, otherwise
    /// as [`JobOrchestrator::run_job`].
    pub async fn start_and_run<W>(
        &self,
        id: InstanceId,
        job: &JobSpec,
        sink: &mut W,
    ) -> Result<JobReport, JobError<C::Error>>
    where
        W: Write + ?Sized,
    {
        info!(instance = %id, "requesting instance start");
        self.control_plane
            .set_state(id, TargetState::Running)
            .await
            .map_err(|source| JobError::Start { id, source })?;
        self.drive(id, job, Teardown::Stop, false, sink).await
    }

    /// Rents a new instance, runs the job on it and destroys it.
    ///
    /// The instance is destroyed exactly once whatever happens after it was
    /// created, including when it never starts.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::Create`] when renting fails, otherwise as
    /// [`JobOrchestrator::run_job`].
    pub async fn launch<W>(
        &self,
        request: &CreateInstanceRequest,
        job: &JobSpec,
        sink: &mut W,
    ) -> Result<JobReport, JobError<C::Error>>
    where
        W: Write + ?Sized,
    {
        let id = self
            .control_plane
            .create(request)
            .await
            .map_err(JobError::Create)?;
        info!(instance = %id, offer = request.offer_id, "instance created");
        self.drive(id, job, Teardown::Destroy, true, sink).await
    }

    /// Synchronises `local_root` into `remote_root` on a running instance
    /// without running anything.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::Stage`] when the lookup or the transfer fails.
    pub async fn copy(
        &self,
        id: InstanceId,
        local_root: &Utf8Path,
        remote_root: &str,
        filter_enabled: bool,
    ) -> Result<SyncReport, JobError<C::Error>> {
        let instance = self
            .control_plane
            .instance(id)
            .await
            .map_err(|err| {
                failed(
                    Self::at(JobStage::AwaitConnectable)(WaitError::ControlPlane(err)),
                    None,
                )
            })?;
        let session = self
            .session_for(&instance)
            .map_err(|failure| failed(failure, None))?;
        self.sync_workspace(&session, local_root, remote_root, filter_enabled)
            .map_err(|err| failed(Self::at(JobStage::Syncing)(err), None))
    }

    async fn drive<W>(
        &self,
        id: InstanceId,
        job: &JobSpec,
        teardown: Teardown,
        lease_before_wait: bool,
        sink: &mut W,
    ) -> Result<JobReport, JobError<C::Error>>
    where
        W: Write + ?Sized,
    {
        let deadline = Deadline::after(job.timeout);
        let early_lease =
            lease_before_wait.then(|| InstanceLease::new(&self.control_plane, id, teardown));

        let waiter = InstanceLifecycleWaiter::new(&self.control_plane)
            .with_poll_interval(self.settings.running_poll_interval);
        let waited = tokio::select! {
            running = waiter.wait_until_running(id, deadline.remaining()) => {
                running.map_err(Self::at(JobStage::AwaitRunning))
            }
            () = self.shutdown_requested() => Err(interrupted(JobStage::AwaitRunning)),
        };
        let instance = match waited {
            Ok(instance) => instance,
            Err(failure) => return Err(fail_and_release(failure, early_lease).await),
        };

        let lease =
            early_lease.unwrap_or_else(|| InstanceLease::new(&self.control_plane, id, teardown));
        let stage = Cell::new(JobStage::AwaitConnectable);
        let outcome = tokio::select! {
            finished = self.run_stages(&instance, job, &deadline, &stage, sink) => finished,
            () = self.shutdown_requested() => Err(interrupted(stage.get())),
        };
        match outcome {
            Ok(report) => {
                lease
                    .release()
                    .await
                    .map_err(|source| JobError::Teardown {
                        id,
                        action: teardown,
                        source,
                    })?;
                info!(instance = %id, exit_code = ?report.exit_code, "job finished");
                Ok(report)
            }
            Err(failure) => Err(fail_and_release(failure, Some(lease)).await),
        }
    }

    async fn run_stages<W>(
        &self,
        instance: &Instance,
        job: &JobSpec,
        deadline: &Deadline,
        stage: &Cell<JobStage>,
        sink: &mut W,
    ) -> Result<JobReport, StageFailure<C::Error>>
    where
        W: Write + ?Sized,
    {
        let session = self.session_for(instance)?;
        info!(
            instance = %instance.id,
            elapsed = ?deadline.elapsed(),
            remaining = ?deadline.remaining(),
            "instance running"
        );
        ConnectionEstablisher::new()
            .with_poll_interval(self.settings.connect_poll_interval)
            .wait_for_connectable(&session, deadline.remaining())
            .await
            .map_err(Self::at(JobStage::AwaitConnectable))?;

        stage.set(JobStage::Syncing);
        info!(stage = %JobStage::Syncing, source = %job.local_root, "job stage");
        let sync = self
            .sync_workspace(
                &session,
                &job.local_root,
                &self.settings.remote_root,
                self.settings.use_ignore_file,
            )
            .map_err(Self::at(JobStage::Syncing))?;

        stage.set(JobStage::Preparing);
        info!(stage = %JobStage::Preparing, "job stage");
        self.prepare(&session, job, sink).await?;

        stage.set(JobStage::Executing);
        info!(stage = %JobStage::Executing, command = %job.command, "job stage");
        let outcome = self
            .executor()
            .run(&session, &self.in_remote_root(&job.command), sink)
            .await
            .map_err(Self::at(JobStage::Executing))?;

        stage.set(JobStage::Collecting);
        info!(stage = %JobStage::Collecting, exit_code = ?outcome.exit_code, "job stage");
        let (artifacts, collection_error) = self.collect(&session, &job.artifacts_dest);

        Ok(JobReport {
            instance_id: instance.id,
            sync,
            exit_code: outcome.exit_code,
            artifacts,
            collection_error,
        })
    }

    fn session_for(&self, instance: &Instance) -> Result<Session<'_, S>, StageFailure<C::Error>> {
        let endpoint = instance.endpoint.clone().ok_or_else(|| StageFailure {
            stage: JobStage::AwaitConnectable,
            source: StageError::MissingEndpoint(instance.id),
        })?;
        Ok(Session::new(&self.shell, endpoint))
    }

    fn sync_workspace(
        &self,
        session: &Session<'_, S>,
        local_root: &Utf8Path,
        remote_root: &str,
        filter_enabled: bool,
    ) -> Result<SyncReport, SyncError> {
        let progress = self.progress.clone();
        WorkspaceSynchronizer::new().sync(
            session,
            local_root,
            remote_root,
            filter_enabled,
            &mut |update| {
                if let Some(report) = &progress {
                    report(update);
                }
            },
        )
    }

    async fn prepare<W>(
        &self,
        session: &Session<'_, S>,
        job: &JobSpec,
        sink: &mut W,
    ) -> Result<(), StageFailure<C::Error>>
    where
        W: Write + ?Sized,
    {
        session
            .run_checked(&env_script_command(&self.settings.remote_root))
            .map_err(Self::at(JobStage::Preparing))?;

        if !self.settings.install_requirements || !job.local_root.join(REQUIREMENTS_FILE).is_file()
        {
            return Ok(());
        }
        let install = format!("pip install -r {REQUIREMENTS_FILE}");
        let outcome = self
            .executor()
            .run(session, &self.in_remote_root(&install), sink)
            .await
            .map_err(Self::at(JobStage::Preparing))?;
        if !outcome.succeeded() {
            warn!(exit_code = ?outcome.exit_code, "requirements installation failed; running command anyway");
        }
        Ok(())
    }

    fn collect(
        &self,
        session: &Session<'_, S>,
        local_dest: &Utf8Path,
    ) -> (ArtifactBundle, Option<TransferError>) {
        let remote = self.settings.artifacts_remote_path();
        let landing = ArtifactCollector::landing_dir(&remote, local_dest);
        let scanned = ArtifactCollector::new()
            .collect(session, &remote, local_dest)
            .and_then(|retrieved| {
                if retrieved {
                    ArtifactBundle::scan(&landing)
                } else {
                    Ok(ArtifactBundle::empty(landing.clone()))
                }
            });
        match scanned {
            Ok(bundle) => (bundle, None),
            Err(err) => {
                warn!(source = %remote, error = %err, "artifact collection failed");
                (ArtifactBundle::empty(landing), Some(err))
            }
        }
    }

    /// Resolves once a shutdown has been requested; never resolves without a
    /// shutdown channel or after its sender is gone.
    async fn shutdown_requested(&self) {
        let Some(mut shutdown) = self.shutdown.clone() else {
            return std::future::pending().await;
        };
        if shutdown.wait_for(|requested| *requested).await.is_err() {
            std::future::pending::<()>().await;
        }
        warn!("shutdown requested; abandoning job");
    }

    fn at<T>(stage: JobStage) -> impl FnOnce(T) -> StageFailure<C::Error>
    where
        T: Into<StageError<C::Error>>,
    {
        move |err| StageFailure {
            stage,
            source: err.into(),
        }
    }

    fn executor(&self) -> RemoteExecutor {
        RemoteExecutor::new().with_intervals(
            self.settings.output_poll_interval,
            self.settings.settle_interval,
        )
    }

    fn in_remote_root(&self, command: &str) -> String {
        let root = escape(self.settings.remote_root.as_str().into());
        format!("cd {root} && . ./{ENV_SCRIPT} && {command}")
    }
}

const fn interrupted<E>(stage: JobStage) -> StageFailure<E>
where
    E: std::error::Error + 'static,
{
    StageFailure {
        stage,
        source: StageError::Interrupted,
    }
}

async fn fail_and_release<C>(
    failure: StageFailure<C::Error>,
    lease: Option<InstanceLease<'_, C>>,
) -> JobError<C::Error>
where
    C: ControlPlane,
{
    warn!(stage = %failure.stage, error = %failure.source, "job stage failed");
    let teardown_error = match lease {
        Some(held) => held.release().await.err(),
        None => None,
    };
    failed(failure, teardown_error.as_ref())
}

fn failed<E>(failure: StageFailure<E>, teardown_error: Option<&E>) -> JobError<E>
where
    E: std::error::Error + 'static,
{
    JobError::Stage {
        stage: failure.stage,
        message: append_teardown_note(failure.source.to_string(), teardown_error),
        source: failure.source,
    }
}

fn append_teardown_note<E: fmt::Display>(message: String, teardown_error: Option<&E>) -> String {
    if let Some(teardown) = teardown_error {
        format!("{message} (teardown also failed: {teardown})")
    } else {
        message
    }
}

/// Shell command writing [`ENV_SCRIPT`] into `remote_root`.
///
/// A login shell writes the script so the exported `PATH` is the one the
/// image's profile sets up.
#[must_use]
pub fn env_script_command(remote_root: &str) -> String {
    let trimmed = remote_root.trim_end_matches('/');
    let root = if trimmed.is_empty() { "/" } else { trimmed };
    let script = escape(format!("{root}/{ENV_SCRIPT}").into());
    let pythonpath = escape(format!("export PYTHONPATH={}", escape(root.into())).into());
    let body = format!(
        "mkdir -p {dir} && printf '%s\\n' 'export PYTHONUNBUFFERED=1' {pythonpath} \
         \"export PATH=\\\"$PATH\\\"\" > {script}",
        dir = escape(root.into()),
    );
    format!("sh -lc {}", escape(body.into()))
}
