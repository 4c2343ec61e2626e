//! Test support utilities shared across unit and integration tests.
//!
//! The doubles here record every call they receive so tests can assert on
//! ordering and counts, and replay scripted responses in FIFO order.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::env;
use std::ffi::OsString;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard as StdMutexGuard, PoisonError};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use tokio::sync::{Mutex as AsyncMutex, MutexGuard};
use tokio::time::{Instant, sleep};

use crate::control_plane::{
    ControlPlane, ControlPlaneError, ControlPlaneFuture, CreateInstanceRequest, Endpoint,
    Instance, InstanceId, InstanceState, TargetState,
};
use crate::ssh::{
    CommandOutput, CommandRunner, ExecutionStream, LoginFailure, RemoteExit, RemoteShell,
    SshError, TransferError, TransferProgress,
};

fn locked<T>(mutex: &Mutex<T>) -> StdMutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Used to drive deterministic command outcomes without spawning processes.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    responses: std::rc::Rc<std::cell::RefCell<VecDeque<CommandOutput>>>,
    invocations: std::rc::Rc<std::cell::RefCell<Vec<CommandInvocation>>>,
}

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        self.invocations.borrow().clone()
    }

    /// Pushes a successful exit status.
    pub fn push_success(&self) {
        self.push_output(Some(0), "", "");
    }

    /// Pushes a failing exit code with stderr text.
    pub fn push_failure(&self, code: i32) {
        self.push_output(Some(code), "", "simulated failure");
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        self.responses.borrow_mut().push_back(CommandOutput {
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        });
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, SshError> {
        self.invocations.borrow_mut().push(CommandInvocation {
            program: program.to_owned(),
            args: args.to_vec(),
        });
        self.responses
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| SshError::Spawn {
                program: program.to_owned(),
                message: String::from("no scripted response available"),
            })
    }
}

/// Request observed by [`FakeControlPlane`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ControlPlaneCall {
    /// Instance snapshot lookup.
    Lookup(InstanceId),
    /// State change request.
    SetState(InstanceId, TargetState),
    /// Destroy request.
    Destroy(InstanceId),
    /// Creation request for the given offer.
    Create(u64),
}

impl ControlPlaneCall {
    /// Returns `true` for stop and destroy requests.
    #[must_use]
    pub const fn is_teardown(&self) -> bool {
        matches!(
            self,
            Self::SetState(_, TargetState::Stopped) | Self::Destroy(_)
        )
    }
}

#[derive(Debug, Default)]
struct ControlPlaneState {
    snapshots: BTreeMap<InstanceId, VecDeque<Instance>>,
    calls: Vec<ControlPlaneCall>,
    fail_lookups: bool,
    fail_set_state: bool,
    fail_destroy: bool,
    fail_create: bool,
    created_id: Option<u64>,
    lookup_delay: Option<Duration>,
}

/// In-memory control plane replaying scripted instance snapshots.
///
/// Each lookup pops the next snapshot for the id; the last one is repeated
/// once the queue is down to a single entry.
#[derive(Clone, Debug, Default)]
pub struct FakeControlPlane {
    state: Arc<Mutex<ControlPlaneState>>,
}

impl FakeControlPlane {
    /// Creates a control plane that knows no instances.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a snapshot in `state` without an endpoint.
    pub fn push_state(&self, id: u64, state: InstanceState) {
        self.push_instance(Instance {
            id: InstanceId::new(id),
            state,
            endpoint: None,
            label: None,
        });
    }

    /// Queues a running snapshot reachable at `host:port`.
    pub fn push_running(&self, id: u64, host: &str, port: u16) {
        self.push_instance(Instance {
            id: InstanceId::new(id),
            state: InstanceState::Running,
            endpoint: Some(Endpoint::new(host, port)),
            label: None,
        });
    }

    /// Queues an explicit snapshot.
    pub fn push_instance(&self, instance: Instance) {
        locked(&self.state)
            .snapshots
            .entry(instance.id)
            .or_default()
            .push_back(instance);
    }

    /// Makes every lookup take `delay` on the tokio clock before answering.
    pub fn delay_lookups(&self, delay: Duration) {
        locked(&self.state).lookup_delay = Some(delay);
    }

    /// Makes every lookup fail with a transport error.
    pub fn fail_lookups(&self) {
        locked(&self.state).fail_lookups = true;
    }

    /// Makes every state change request fail.
    pub fn fail_set_state(&self) {
        locked(&self.state).fail_set_state = true;
    }

    /// Makes every destroy request fail.
    pub fn fail_destroy(&self) {
        locked(&self.state).fail_destroy = true;
    }

    /// Makes every creation request fail.
    pub fn fail_create(&self) {
        locked(&self.state).fail_create = true;
    }

    /// Sets the id returned by the next successful creation.
    pub fn set_created_id(&self, id: u64) {
        locked(&self.state).created_id = Some(id);
    }

    /// Returns every request received so far.
    #[must_use]
    pub fn calls(&self) -> Vec<ControlPlaneCall> {
        locked(&self.state).calls.clone()
    }

    /// Number of snapshot lookups received.
    #[must_use]
    pub fn lookups(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, ControlPlaneCall::Lookup(_)))
            .count()
    }

    /// Stop and destroy requests received, in order.
    #[must_use]
    pub fn teardown_requests(&self) -> Vec<ControlPlaneCall> {
        self.calls()
            .into_iter()
            .filter(ControlPlaneCall::is_teardown)
            .collect()
    }

    fn lookup(&self, id: InstanceId) -> Result<Instance, ControlPlaneError> {
        let mut state = locked(&self.state);
        state.calls.push(ControlPlaneCall::Lookup(id));
        if state.fail_lookups {
            return Err(simulated_transport("lookup"));
        }
        let queue = state
            .snapshots
            .get_mut(&id)
            .ok_or(ControlPlaneError::NotFound { id })?;
        let snapshot = if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        };
        snapshot.ok_or(ControlPlaneError::NotFound { id })
    }

    fn record_state(&self, id: InstanceId, target: TargetState) -> Result<(), ControlPlaneError> {
        let mut state = locked(&self.state);
        state.calls.push(ControlPlaneCall::SetState(id, target));
        if state.fail_set_state {
            return Err(simulated_transport("state change"));
        }
        Ok(())
    }

    fn record_destroy(&self, id: InstanceId) -> Result<(), ControlPlaneError> {
        let mut state = locked(&self.state);
        state.calls.push(ControlPlaneCall::Destroy(id));
        if state.fail_destroy {
            return Err(simulated_transport("destroy"));
        }
        Ok(())
    }

    fn record_create(&self, request: &CreateInstanceRequest) -> Result<InstanceId, ControlPlaneError> {
        let mut state = locked(&self.state);
        state.calls.push(ControlPlaneCall::Create(request.offer_id));
        if state.fail_create {
            return Err(ControlPlaneError::Rejected {
                message: String::from("offer is no longer available"),
            });
        }
        Ok(InstanceId::new(state.created_id.unwrap_or(1)))
    }
}

fn simulated_transport(action: &str) -> ControlPlaneError {
    ControlPlaneError::Transport {
        message: format!("simulated {action} failure"),
    }
}

impl ControlPlane for FakeControlPlane {
    type Error = ControlPlaneError;

    fn instance(&self, id: InstanceId) -> ControlPlaneFuture<'_, Instance, Self::Error> {
        Box::pin(async move {
            let delay = locked(&self.state).lookup_delay;
            if let Some(delay) = delay {
                sleep(delay).await;
            }
            self.lookup(id)
        })
    }

    fn set_state(
        &self,
        id: InstanceId,
        state: TargetState,
    ) -> ControlPlaneFuture<'_, (), Self::Error> {
        Box::pin(async move { self.record_state(id, state) })
    }

    fn destroy(&self, id: InstanceId) -> ControlPlaneFuture<'_, (), Self::Error> {
        Box::pin(async move { self.record_destroy(id) })
    }

    fn create<'a>(
        &'a self,
        request: &'a CreateInstanceRequest,
    ) -> ControlPlaneFuture<'a, InstanceId, Self::Error> {
        Box::pin(async move { self.record_create(request) })
    }
}

#[derive(Clone, Debug)]
enum StreamEvent {
    Output(Vec<u8>),
    Failure(String),
}

/// [`ExecutionStream`] replaying output and exit events on a timeline.
///
/// Offsets are measured from the first poll, on the tokio clock, so tests
/// running with a paused clock observe the timeline deterministically.
#[derive(Clone, Debug, Default)]
pub struct ScriptedStream {
    events: Vec<(Duration, StreamEvent)>,
    exit: Option<(Duration, Option<i32>)>,
    started: Option<Instant>,
}

impl ScriptedStream {
    /// Creates a stream that never exits and produces nothing.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a stream that exits immediately with `code` and no output.
    #[must_use]
    pub fn exiting(code: i32) -> Self {
        Self::new().exit_at(Duration::ZERO, Some(code))
    }

    /// Makes `text` available `offset` after the first poll.
    #[must_use]
    pub fn output_at(mut self, offset: Duration, text: &str) -> Self {
        self.push_event(offset, StreamEvent::Output(text.as_bytes().to_vec()));
        self
    }

    /// Makes the channel fail `offset` after the first poll.
    #[must_use]
    pub fn fail_at(mut self, offset: Duration, message: &str) -> Self {
        self.push_event(offset, StreamEvent::Failure(message.to_owned()));
        self
    }

    /// Signals exit with `code` `offset` after the first poll.
    #[must_use]
    pub fn exit_at(mut self, offset: Duration, code: Option<i32>) -> Self {
        self.exit = Some((offset, code));
        self
    }

    fn push_event(&mut self, offset: Duration, event: StreamEvent) {
        self.events.push((offset, event));
        self.events.sort_by_key(|(at, _)| *at);
    }

    fn elapsed(&mut self) -> Duration {
        self.started.get_or_insert_with(Instant::now).elapsed()
    }
}

impl ExecutionStream for ScriptedStream {
    fn try_next_chunk(&mut self) -> io::Result<Option<Vec<u8>>> {
        let elapsed = self.elapsed();
        match self.events.first() {
            Some((at, _)) if *at <= elapsed => {}
            _ => return Ok(None),
        }
        match self.events.remove(0).1 {
            StreamEvent::Output(bytes) => Ok(Some(bytes)),
            StreamEvent::Failure(message) => Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                message,
            )),
        }
    }

    fn exit_status(&mut self) -> io::Result<Option<RemoteExit>> {
        let elapsed = self.elapsed();
        Ok(self
            .exit
            .filter(|(at, _)| *at <= elapsed)
            .map(|(_, code)| RemoteExit { code }))
    }
}

/// Interaction observed by [`FakeShell`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ShellCall {
    /// Session login check.
    Login,
    /// Command run to completion.
    Run(String),
    /// Streamed command.
    Exec(String),
    /// File upload to the given remote path.
    Upload(String),
    /// Directory download from the given remote path.
    Download(String),
}

/// Archive received by [`FakeShell::upload`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UploadRecord {
    /// Local file that was uploaded.
    pub local: Utf8PathBuf,
    /// Remote destination path.
    pub remote: String,
    /// File contents at upload time.
    pub bytes: Vec<u8>,
}

#[derive(Clone, Debug, Default)]
enum DownloadScript {
    #[default]
    Missing,
    Files(Vec<(String, Vec<u8>)>),
    Failure(TransferError),
}

#[derive(Debug, Default)]
struct ShellState {
    logins: VecDeque<Result<(), LoginFailure>>,
    run_failures: Vec<(String, CommandOutput)>,
    streams: VecDeque<Result<ScriptedStream, SshError>>,
    upload_failure: Option<TransferError>,
    download: DownloadScript,
    calls: Vec<ShellCall>,
    uploads: Vec<UploadRecord>,
}

/// In-memory [`RemoteShell`] with scripted outcomes.
///
/// Unscripted login checks succeed, unscripted commands exit zero, unscripted
/// streams exit zero without output, and downloads report a missing path.
#[derive(Clone, Debug, Default)]
pub struct FakeShell {
    state: Arc<Mutex<ShellState>>,
}

impl FakeShell {
    /// Creates a shell where every operation succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues the outcome of the next login check.
    pub fn push_login(&self, outcome: Result<(), LoginFailure>) {
        locked(&self.state).logins.push_back(outcome);
    }

    /// Makes any run command containing `fragment` exit with `code`.
    pub fn fail_run_containing(&self, fragment: &str, code: i32, stderr: &str) {
        locked(&self.state).run_failures.push((
            fragment.to_owned(),
            CommandOutput {
                code: Some(code),
                stdout: String::new(),
                stderr: stderr.to_owned(),
            },
        ));
    }

    /// Queues the stream returned by the next exec.
    pub fn push_stream(&self, stream: ScriptedStream) {
        locked(&self.state).streams.push_back(Ok(stream));
    }

    /// Makes the next exec fail to start.
    pub fn push_exec_failure(&self, message: &str) {
        locked(&self.state).streams.push_back(Err(SshError::Spawn {
            program: String::from("ssh"),
            message: message.to_owned(),
        }));
    }

    /// Makes every upload fail after recording it.
    pub fn fail_uploads(&self, message: &str) {
        locked(&self.state).upload_failure = Some(TransferError::Upload {
            message: message.to_owned(),
        });
    }

    /// Serves `files` (relative path, contents) from any downloaded
    /// directory.
    pub fn serve_download(&self, files: &[(&str, &str)]) {
        locked(&self.state).download = DownloadScript::Files(
            files
                .iter()
                .map(|(path, contents)| ((*path).to_owned(), contents.as_bytes().to_vec()))
                .collect(),
        );
    }

    /// Makes every download fail with `error`.
    pub fn fail_downloads(&self, error: TransferError) {
        locked(&self.state).download = DownloadScript::Failure(error);
    }

    /// Returns every interaction so far.
    #[must_use]
    pub fn calls(&self) -> Vec<ShellCall> {
        locked(&self.state).calls.clone()
    }

    /// Number of login checks attempted.
    #[must_use]
    pub fn login_attempts(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, ShellCall::Login))
            .count()
    }

    /// Commands passed to [`RemoteShell::run`], in order.
    #[must_use]
    pub fn run_commands(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                ShellCall::Run(command) => Some(command),
                _ => None,
            })
            .collect()
    }

    /// Commands passed to [`RemoteShell::exec`], in order.
    #[must_use]
    pub fn exec_commands(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                ShellCall::Exec(command) => Some(command),
                _ => None,
            })
            .collect()
    }

    /// Uploads received so far.
    #[must_use]
    pub fn uploads(&self) -> Vec<UploadRecord> {
        locked(&self.state).uploads.clone()
    }
}

impl RemoteShell for FakeShell {
    type Stream = ScriptedStream;

    fn check_login(&self, _endpoint: &Endpoint) -> Result<(), LoginFailure> {
        let mut state = locked(&self.state);
        state.calls.push(ShellCall::Login);
        state.logins.pop_front().unwrap_or(Ok(()))
    }

    fn run(&self, _endpoint: &Endpoint, command: &str) -> Result<CommandOutput, SshError> {
        let mut state = locked(&self.state);
        state.calls.push(ShellCall::Run(command.to_owned()));
        let scripted = state
            .run_failures
            .iter()
            .find(|(fragment, _)| command.contains(fragment.as_str()))
            .map(|(_, output)| output.clone());
        Ok(scripted.unwrap_or(CommandOutput {
            code: Some(0),
            stdout: String::new(),
            stderr: String::new(),
        }))
    }

    fn exec(&self, _endpoint: &Endpoint, command: &str) -> Result<Self::Stream, SshError> {
        let mut state = locked(&self.state);
        state.calls.push(ShellCall::Exec(command.to_owned()));
        state
            .streams
            .pop_front()
            .unwrap_or_else(|| Ok(ScriptedStream::exiting(0)))
    }

    fn upload(
        &self,
        _endpoint: &Endpoint,
        local: &Utf8Path,
        remote: &str,
        progress: &mut dyn FnMut(TransferProgress),
    ) -> Result<(), TransferError> {
        let bytes = std::fs::read(local).map_err(|err| TransferError::Io {
            path: local.to_path_buf(),
            message: err.to_string(),
        })?;
        let mut state = locked(&self.state);
        state.calls.push(ShellCall::Upload(remote.to_owned()));
        let total = u64::try_from(bytes.len()).unwrap_or(u64::MAX);
        state.uploads.push(UploadRecord {
            local: local.to_path_buf(),
            remote: remote.to_owned(),
            bytes,
        });
        if let Some(err) = state.upload_failure.clone() {
            return Err(err);
        }
        progress(TransferProgress { sent: total, total });
        Ok(())
    }

    fn download(
        &self,
        _endpoint: &Endpoint,
        remote: &str,
        local: &Utf8Path,
    ) -> Result<(), TransferError> {
        let mut state = locked(&self.state);
        state.calls.push(ShellCall::Download(remote.to_owned()));
        match &state.download {
            DownloadScript::Missing => Err(TransferError::NotFound {
                path: remote.to_owned(),
            }),
            DownloadScript::Failure(err) => Err(err.clone()),
            DownloadScript::Files(files) => {
                let name = Utf8Path::new(remote).file_name().unwrap_or("download");
                let root = local.join(name);
                for (relative, contents) in files {
                    write_file(&root.join(relative), contents)?;
                }
                Ok(())
            }
        }
    }
}

fn write_file(path: &Utf8Path, contents: &[u8]) -> Result<(), TransferError> {
    let io_error = |err: io::Error| TransferError::Io {
        path: path.to_path_buf(),
        message: err.to_string(),
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io_error)?;
    }
    std::fs::write(path, contents).map_err(io_error)
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: AsyncMutex<()> = AsyncMutex::const_new(());

/// Guard that holds the env mutex and restores variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: MutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets multiple environment variables while holding a global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::set_var(key, value) };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
