//! Behavioural scenarios for whole jobs driven through the public API.

use std::fs;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use camino::Utf8PathBuf;
use rstest::{fixture, rstest};
use tempfile::TempDir;

use vastrun::ssh::LoginFailure;
use vastrun::test_support::{ControlPlaneCall, FakeControlPlane, FakeShell, ScriptedStream, ShellCall};
use vastrun::{
    CreateInstanceRequest, InstanceId, InstanceState, JobError, JobOrchestrator, JobSettings,
    JobSpec, JobStage, StageError, TargetState,
};

struct Project {
    _dir: TempDir,
    root: Utf8PathBuf,
}

#[fixture]
fn project() -> Project {
    let dir = TempDir::new().unwrap_or_else(|err| panic!("temp dir: {err}"));
    let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf())
        .unwrap_or_else(|path| panic!("temp dir should be utf8: {}", path.display()));
    for (relative, contents) in [
        (".gitignore", "checkpoints/\n"),
        ("train.py", "print('epoch 1')\n"),
        ("requirements.txt", "torch\n"),
        ("checkpoints/last.pt", "stale weights"),
    ] {
        let path = root.join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap_or_else(|err| panic!("create {parent}: {err}"));
        }
        fs::write(&path, contents).unwrap_or_else(|err| panic!("write {path}: {err}"));
    }
    Project { _dir: dir, root }
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn launch_rents_runs_collects_and_destroys(project: Project) {
    let control_plane = FakeControlPlane::new();
    control_plane.set_created_id(7001);
    control_plane.push_state(7001, InstanceState::Provisioning);
    control_plane.push_state(7001, InstanceState::Provisioning);
    control_plane.push_running(7001, "ssh7.example", 17001);
    let shell = FakeShell::new();
    shell.push_login(Err(LoginFailure::Unreachable(String::from(
        "kex_exchange_identification: Connection closed by remote host",
    ))));
    shell.push_stream(ScriptedStream::exiting(0));
    shell.push_stream(
        ScriptedStream::new()
            .output_at(Duration::ZERO, "epoch 1\n")
            .output_at(Duration::from_millis(5), "epoch 2\n")
            .exit_at(Duration::from_millis(10), Some(0)),
    );
    shell.serve_download(&[("weights.pt", "trained")]);
    let progress = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&progress);
    let orchestrator = JobOrchestrator::new(control_plane.clone(), shell.clone()).with_progress(
        move |update| {
            seen.lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .push((update.sent, update.total));
        },
    );
    let request = CreateInstanceRequest {
        price: Some(0.25),
        label: Some(String::from("nightly")),
        ..CreateInstanceRequest::new(123_456, "pytorch/pytorch")
    };
    let job = JobSpec::new("python train.py", project.root.clone(), Duration::from_secs(300));
    let mut output = Vec::new();

    let report = orchestrator
        .launch(&request, &job, &mut output)
        .await
        .unwrap_or_else(|err| panic!("launch should succeed: {err}"));

    assert_eq!(report.instance_id, InstanceId::new(7001));
    assert_eq!(report.exit_code, Some(0));
    assert_eq!(String::from_utf8_lossy(&output), "epoch 1\nepoch 2\n");
    assert_eq!(report.sync.excluded, 1);
    assert_eq!(report.artifacts.root(), project.root.join("vast-artifacts"));
    assert_eq!(report.artifacts.files().len(), 1);
    assert_eq!(
        fs::read_to_string(project.root.join("vast-artifacts/weights.pt"))
            .unwrap_or_else(|err| panic!("read artifact: {err}")),
        "trained"
    );
    assert_eq!(
        control_plane.teardown_requests(),
        vec![ControlPlaneCall::Destroy(InstanceId::new(7001))]
    );
    assert_eq!(
        shell.exec_commands(),
        vec![
            String::from("cd /app && . ./.vast-set-path.sh && pip install -r requirements.txt"),
            String::from("cd /app && . ./.vast-set-path.sh && python train.py"),
        ]
    );
    let updates = progress
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .clone();
    let last = updates.last().copied().unwrap_or_else(|| panic!("no progress reported"));
    assert_eq!(last.0, last.1);
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn dropped_channel_still_stops_restarted_instance(project: Project) {
    let control_plane = FakeControlPlane::new();
    control_plane.push_state(55, InstanceState::Stopped);
    control_plane.push_running(55, "ssh5.example", 10055);
    let shell = FakeShell::new();
    shell.push_stream(
        ScriptedStream::new()
            .output_at(Duration::ZERO, "step 1\n")
            .fail_at(Duration::from_millis(3), "broken pipe"),
    );
    let orchestrator = JobOrchestrator::new(control_plane.clone(), shell.clone()).with_settings(
        JobSettings {
            install_requirements: false,
            ..JobSettings::default()
        },
    );
    let job = JobSpec::new("python train.py", project.root.clone(), Duration::from_secs(120));
    let mut output = Vec::new();

    let err = orchestrator
        .start_and_run(InstanceId::new(55), &job, &mut output)
        .await
        .expect_err("channel failure should fail the job");

    assert_eq!(err.stage(), Some(JobStage::Executing));
    assert!(
        matches!(err, JobError::Stage { source: StageError::Exec(_), .. }),
        "unexpected error: {err:?}"
    );
    assert_eq!(String::from_utf8_lossy(&output), "step 1\n");
    assert_eq!(
        control_plane.calls().first(),
        Some(&ControlPlaneCall::SetState(InstanceId::new(55), TargetState::Running))
    );
    assert_eq!(
        control_plane.teardown_requests(),
        vec![ControlPlaneCall::SetState(InstanceId::new(55), TargetState::Stopped)]
    );
    assert!(
        !shell.calls().iter().any(|call| matches!(call, ShellCall::Download(_))),
        "artifacts are not collected after a failed command"
    );
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn copy_ships_filtered_workspace_without_touching_state(project: Project) {
    let control_plane = FakeControlPlane::new();
    control_plane.push_running(9, "ssh9.example", 10009);
    let shell = FakeShell::new();
    let orchestrator = JobOrchestrator::new(control_plane.clone(), shell.clone());

    let report = orchestrator
        .copy(InstanceId::new(9), &project.root, "/root/work", true)
        .await
        .unwrap_or_else(|err| panic!("copy should succeed: {err}"));

    assert_eq!(report.transferred, 3);
    assert_eq!(report.excluded, 1);
    assert!(control_plane.teardown_requests().is_empty());
    assert!(shell.exec_commands().is_empty());
}
