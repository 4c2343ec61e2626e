//! Core library for the `vastrun` remote job tool.
//!
//! A job rents (or restarts) a marketplace GPU instance, waits for it to run
//! and accept SSH, ships the local workspace to it, streams a command's
//! output back, collects artifacts, and always stops or destroys the
//! instance afterwards. The control plane and the remote shell sit behind
//! traits so the whole flow can be driven by in-memory doubles.

pub mod api_key;
pub mod artifacts;
pub mod config;
pub mod connect;
pub mod control_plane;
pub mod deadline;
pub mod exec;
pub mod job;
pub mod lifecycle;
pub mod ssh;
pub mod sync;
pub mod test_support;

pub use api_key::{ApiKeyError, ApiKeyStore, resolve_api_key};
pub use artifacts::{ARTIFACTS_DIR, ArtifactBundle, ArtifactCollector};
pub use config::{ConfigError, ConfigLoadError, JobConfig, VastConfig};
pub use connect::{ConnectError, ConnectionEstablisher, FatalConnectionError};
pub use control_plane::{
    ControlPlane, ControlPlaneError, CreateInstanceRequest, Endpoint, Instance, InstanceId,
    InstanceState, TargetState, VastClient,
};
pub use deadline::{Deadline, DeadlineExceeded, WaitStage};
pub use exec::{ExecError, ExecutionOutcome, RemoteExecutor};
pub use job::{
    InstanceLease, JobError, JobOrchestrator, JobReport, JobSettings, JobSpec, JobStage,
    StageError, Teardown,
};
pub use lifecycle::{InstanceLifecycleWaiter, WaitError};
pub use ssh::{RemoteShell, Session, SshClient, SshConfig, SshError, TransferError};
pub use sync::{SyncError, SyncReport, WorkspaceManifest, WorkspaceSynchronizer};
