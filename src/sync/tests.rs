//! Unit tests for the sync module.

use super::*;
use crate::control_plane::Endpoint;
use crate::test_support::{FakeShell, ShellCall};
use rstest::{fixture, rstest};
use std::io::Cursor;
use tempfile::TempDir;
use walkdir::WalkDir;

const WORKSPACE_FILES: &[(&str, &str)] = &[
    (".vastignore", "*.log\ndata/\n"),
    (".gitignore", "*.py\n"),
    ("README.md", "# trainer\n"),
    ("configs/a.yaml", "lr: 0.1\n"),
    ("configs/b.yaml", "lr: 0.01\n"),
    ("data/big.bin", "0123456789"),
    ("main.py", "print('ok')\n"),
    ("requirements.txt", "numpy\n"),
    ("src/__init__.py", ""),
    ("src/model.py", "class Model: ...\n"),
    ("src/util.py", "def helper(): ...\n"),
    ("train.log", "epoch 1\n"),
];

struct Workspace {
    _dir: TempDir,
    root: Utf8PathBuf,
}

fn write_tree(root: &Utf8Path, files: &[(&str, &str)]) {
    for (relative, contents) in files {
        let path = root.join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("create parent dir");
        }
        std::fs::write(&path, contents).expect("write workspace file");
    }
}

fn workspace_with(files: &[(&str, &str)]) -> Workspace {
    let dir = TempDir::new().expect("temp dir");
    let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf8 path");
    write_tree(&root, files);
    Workspace { _dir: dir, root }
}

#[fixture]
fn workspace() -> Workspace {
    workspace_with(WORKSPACE_FILES)
}

fn paths(entries: &[Utf8PathBuf]) -> Vec<&str> {
    entries.iter().map(|path| path.as_str()).collect()
}

fn includes(manifest: &WorkspaceManifest, relative: &str) -> bool {
    manifest.entries().iter().any(|entry| entry.as_str() == relative)
}

fn extract(archive: &Utf8Path, destination: &Utf8Path) {
    let file = std::fs::File::open(archive).unwrap_or_else(|err| panic!("open archive: {err}"));
    zip::ZipArchive::new(file)
        .and_then(|mut zip| zip.extract(destination))
        .unwrap_or_else(|err| panic!("archive should unpack: {err}"));
}

fn files_under(root: &Utf8Path) -> Vec<(String, Vec<u8>)> {
    let mut files: Vec<_> = WalkDir::new(root)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| {
            let relative = entry
                .path()
                .strip_prefix(root.as_std_path())
                .expect("under root")
                .to_string_lossy()
                .into_owned();
            let bytes = std::fs::read(entry.path()).expect("read file");
            (relative, bytes)
        })
        .collect();
    files.sort();
    files
}

#[rstest]
fn tool_ignore_file_takes_precedence(workspace: Workspace) {
    let manifest = WorkspaceManifest::collect(&workspace.root, true)
        .unwrap_or_else(|err| panic!("manifest should build: {err}"));

    assert_eq!(manifest.len(), 10);
    assert_eq!(paths(manifest.excluded()), vec!["data/big.bin", "train.log"]);
    assert!(includes(&manifest, "main.py"));
    assert!(includes(&manifest, ".vastignore"));
}

#[test]
fn generic_ignore_file_applies_without_tool_file() {
    let workspace = workspace_with(&[
        (".gitignore", "__pycache__/\n*.pyc\n"),
        ("main.py", ""),
        ("__pycache__/main.cpython-311.pyc", ""),
        ("lib/cache.pyc", ""),
    ]);

    let manifest = WorkspaceManifest::collect(&workspace.root, true)
        .unwrap_or_else(|err| panic!("manifest should build: {err}"));

    assert_eq!(paths(manifest.entries()), vec![".gitignore", "main.py"]);
    assert_eq!(manifest.excluded().len(), 2);
}

#[rstest]
fn disabled_filter_includes_everything(workspace: Workspace) {
    let manifest = WorkspaceManifest::collect(&workspace.root, false)
        .unwrap_or_else(|err| panic!("manifest should build: {err}"));

    assert_eq!(manifest.len(), WORKSPACE_FILES.len());
    assert!(manifest.excluded().is_empty());
}

#[test]
fn missing_ignore_file_means_no_filtering() {
    let workspace = workspace_with(&[("train.log", ""), ("main.py", "")]);

    let manifest = WorkspaceManifest::collect(&workspace.root, true)
        .unwrap_or_else(|err| panic!("manifest should build: {err}"));

    assert_eq!(paths(manifest.entries()), vec!["main.py", "train.log"]);
}

#[rstest]
fn manifest_is_idempotent_and_sorted(workspace: Workspace) {
    let first = WorkspaceManifest::collect(&workspace.root, true).expect("first build");
    let second = WorkspaceManifest::collect(&workspace.root, true).expect("second build");

    assert_eq!(first, second);
    let mut sorted = first.entries().to_vec();
    sorted.sort();
    assert_eq!(first.entries(), sorted.as_slice());
}

#[test]
fn missing_root_is_reported() {
    let err = WorkspaceManifest::collect(Utf8Path::new("/definitely/not/a/workspace"), true)
        .expect_err("root does not exist");

    assert!(matches!(err, SyncError::MissingSource { .. }), "{err:?}");
}

#[rstest]
fn archive_round_trip_preserves_paths_and_bytes(workspace: Workspace) {
    let manifest = WorkspaceManifest::collect(&workspace.root, true).expect("manifest");
    let archive = TransferArchive::pack(&manifest)
        .unwrap_or_else(|err| panic!("archive should pack: {err}"));
    let output = TempDir::new().expect("temp dir");
    let destination = Utf8PathBuf::from_path_buf(output.path().to_path_buf()).expect("utf8 path");

    extract(archive.path(), &destination);

    let expected: Vec<_> = files_under(&workspace.root)
        .into_iter()
        .filter(|(relative, _)| includes(&manifest, relative))
        .collect();
    assert_eq!(files_under(&destination), expected);
    assert_eq!(archive.entries(), 10);
}

#[rstest]
fn archive_file_is_removed_on_drop(workspace: Workspace) {
    let manifest = WorkspaceManifest::collect(&workspace.root, false).expect("manifest");
    let archive = TransferArchive::pack(&manifest).expect("archive");
    let path = archive.path().to_path_buf();
    assert!(path.is_file());
    assert!(path.file_name().is_some_and(|name| name.starts_with("vast-")));

    drop(archive);

    assert!(!path.exists());
}

#[rstest]
fn sync_uploads_filtered_archive_and_unpacks_it(workspace: Workspace) {
    let shell = FakeShell::new();
    let session = Session::new(&shell, Endpoint::new("ssh1.example", 2200));
    let mut progress = Vec::new();

    let report = WorkspaceSynchronizer::new()
        .sync(&session, &workspace.root, "/app", true, &mut |p| progress.push(p))
        .unwrap_or_else(|err| panic!("sync should succeed: {err}"));

    assert_eq!(report.transferred, 10);
    assert_eq!(report.excluded, 2);
    assert!(!progress.is_empty());

    let uploads = shell.uploads();
    let upload = uploads.first().expect("one upload");
    assert_eq!(upload.remote, REMOTE_ARCHIVE_PATH);
    assert_eq!(
        u64::try_from(upload.bytes.len()).expect("length fits"),
        report.archive_bytes
    );
    let zip = zip::ZipArchive::new(Cursor::new(upload.bytes.clone())).expect("valid zip");
    assert_eq!(zip.len(), 10);
    assert!(!upload.local.exists(), "local archive should be removed");

    assert_eq!(
        shell.calls(),
        vec![
            ShellCall::Upload(String::from(REMOTE_ARCHIVE_PATH)),
            ShellCall::Run(extract_command(REMOTE_ARCHIVE_PATH, "/app")),
        ]
    );
}

#[rstest]
fn upload_failure_removes_local_archive(workspace: Workspace) {
    let shell = FakeShell::new();
    shell.fail_uploads("connection reset by peer");
    let session = Session::new(&shell, Endpoint::new("ssh1.example", 2200));

    let err = WorkspaceSynchronizer::new()
        .sync(&session, &workspace.root, "/app", true, &mut |_| {})
        .expect_err("upload fails");

    assert!(
        matches!(err, SyncError::Transfer(TransferError::Upload { .. })),
        "{err:?}"
    );
    let uploads = shell.uploads();
    let upload = uploads.first().expect("upload attempted");
    assert!(!upload.local.exists(), "local archive should be removed");
    assert!(shell.run_commands().is_empty(), "nothing to extract");
}

#[rstest]
fn extraction_failure_removes_local_archive(workspace: Workspace) {
    let shell = FakeShell::new();
    shell.fail_run_containing("unzip -o", 9, "unzip: cannot find zipfile directory");
    let session = Session::new(&shell, Endpoint::new("ssh1.example", 2200));

    let err = WorkspaceSynchronizer::new()
        .sync(&session, &workspace.root, "/app", true, &mut |_| {})
        .expect_err("extraction fails");

    let SyncError::Transfer(TransferError::Extract { message }) = err else {
        panic!("expected extraction failure, got {err:?}");
    };
    assert!(message.contains("cannot find zipfile"), "{message}");
    let uploads = shell.uploads();
    assert!(uploads.iter().all(|upload| !upload.local.exists()));
}

#[test]
fn extract_command_quotes_destination() {
    let command = extract_command(REMOTE_ARCHIVE_PATH, "/root/my project");

    assert!(command.contains("mkdir -p '/root/my project'"), "{command}");
    assert!(
        command.contains("unzip -o -q /tmp/vast-upload.zip -d '/root/my project'"),
        "{command}"
    );
    assert!(command.ends_with("rm -f /tmp/vast-upload.zip"), "{command}");
}
