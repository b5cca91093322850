//! Patch engine tests

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use patch_protocol::{
    PatchDeploymentRequest, PatchStatus, PatchStep, StatusEvent, PATCH_REQUEST_TYPE_APPLICATION,
};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use branchpatch::filesys::dir::Dir;
use branchpatch::patch::engine::{PatchEngine, PatchEngineOptions, PatchOutcome};
use branchpatch::patch::reporter::StatusSink;
use branchpatch::storage::layout::StorageLayout;
use branchpatch::transfer::remote::FsRemoteStore;
use branchpatch::transfer::service::{TransferOptions, TransferService};
use branchpatch::utils::sha256_file;

use crate::common::{write_zip, FakeHost, RecordingSink};

use PatchStatus::{Failed, InProgress, Rollback, Success};

/// Runs `action` on the app directory the first time `trigger` is published
struct Hook {
    trigger: (PatchStatus, PatchStep),
    action: Box<dyn Fn(&Path) + Send + Sync>,
}

struct HookSink {
    inner: Arc<RecordingSink>,
    app_dir: PathBuf,
    hook: Hook,
    fired: AtomicBool,
}

#[async_trait]
impl StatusSink for HookSink {
    async fn publish(&self, event: &StatusEvent) {
        self.inner.publish(event).await;
        if (event.status, event.step) == self.hook.trigger && !self.fired.swap(true, Ordering::SeqCst) {
            (self.hook.action)(&self.app_dir);
        }
    }
}

struct Fixture {
    _tmp: TempDir,
    store_root: PathBuf,
    layout: StorageLayout,
    app: Dir,
    host: Arc<FakeHost>,
    sink: Arc<RecordingSink>,
    engine: PatchEngine,
}

impl Fixture {
    async fn new(app_files: &[(&str, &[u8])], archive: &[(&str, &[u8])]) -> Self {
        Self::with_retention(app_files, archive, 3).await
    }

    async fn with_retention(app_files: &[(&str, &[u8])], archive: &[(&str, &[u8])], retention: usize) -> Self {
        Self::build(app_files, archive, retention, FakeHost::with_process(4242, "kiosk"), None).await
    }

    async fn build(
        app_files: &[(&str, &[u8])],
        archive: &[(&str, &[u8])],
        retention: usize,
        host: FakeHost,
        hook: Option<Hook>,
    ) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let store_root = tmp.path().join("store");
        let app = Dir::new(tmp.path().join("app"));
        let layout = StorageLayout::new(tmp.path().join("agent"));
        layout.setup().await.unwrap();

        app.create().await.unwrap();
        for (name, data) in app_files {
            let path = app.path().join(name);
            tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
            tokio::fs::write(path, data).await.unwrap();
        }
        write_zip(&store_root.join("patches/v2.3.1.zip"), archive);

        let host = Arc::new(host);
        let sink = Arc::new(RecordingSink::default());
        let status: Arc<dyn StatusSink> = match hook {
            Some(hook) => Arc::new(HookSink {
                inner: sink.clone(),
                app_dir: app.path().to_path_buf(),
                hook,
                fired: AtomicBool::new(false),
            }),
            None => sink.clone(),
        };
        let transfer = Arc::new(TransferService::new(
            Arc::new(FsRemoteStore::new(&store_root)),
            fast_transfer(),
        ));
        let options = PatchEngineOptions {
            app_dir: app.path().to_path_buf(),
            main_executable: "kiosk".to_string(),
            target_processes: vec!["kiosk".to_string()],
            service_name: "branch-agent".to_string(),
            backup_retention: retention,
            drain_delay: Duration::ZERO,
            stop_timeout: Duration::ZERO,
            restart_after_patch: true,
        };
        let engine = PatchEngine::new(options, layout.clone(), transfer, host.clone(), status);

        Self {
            _tmp: tmp,
            store_root,
            layout,
            app,
            host,
            sink,
            engine,
        }
    }

    fn artifact(&self) -> PathBuf {
        self.store_root.join("patches/v2.3.1.zip")
    }

    async fn checksum(&self) -> String {
        sha256_file(&self.artifact()).await.unwrap()
    }

    async fn run(&self, request: PatchDeploymentRequest) -> PatchOutcome {
        self.engine.run(request, &CancellationToken::new()).await
    }

    async fn app_files(&self) -> Vec<PathBuf> {
        self.app.walk_files().await.unwrap()
    }

    async fn read_app(&self, name: &str) -> Vec<u8> {
        tokio::fs::read(self.app.path().join(name)).await.unwrap()
    }
}

fn fast_transfer() -> TransferOptions {
    TransferOptions {
        chunk_retry_delay: Duration::ZERO,
        max_attempts: 2,
        attempt_delay: Duration::ZERO,
        ..TransferOptions::default()
    }
}

fn request(checksum: Option<String>) -> PatchDeploymentRequest {
    PatchDeploymentRequest {
        job_id: Some("BR007-1718000000000-0000beef".to_string()),
        user_id: "ops-lead".to_string(),
        patch_id: "v2.3.1".to_string(),
        patch_zip_path: r"\patches\v2.3.1.zip".to_string(),
        expected_checksum: checksum,
        status: PatchStatus::Init,
        step: PatchStep::Start,
        request_type: PATCH_REQUEST_TYPE_APPLICATION.to_string(),
    }
}

fn paths(names: &[&str]) -> Vec<PathBuf> {
    names.iter().map(PathBuf::from).collect()
}

async fn count_dirs(dir: &Path) -> usize {
    Dir::new(dir).list_dirs().await.map(|d| d.len()).unwrap_or(0)
}

#[tokio::test]
async fn test_successful_deployment_publishes_nominal_sequence() {
    let fixture = Fixture::new(
        &[("kiosk", b"kiosk v2.3.0"), ("config.ini", b"branch=BR007")],
        &[("kiosk", b"kiosk v2.3.1"), ("lib/render.so", b"render")],
    )
    .await;

    let outcome = fixture.run(request(Some(fixture.checksum().await))).await;
    assert_eq!(outcome, PatchOutcome::Succeeded);

    use PatchStep::*;
    assert_eq!(
        fixture.sink.steps(),
        vec![
            (InProgress, Download, 5),
            (Success, Download, 15),
            (InProgress, Validate, 20),
            (Success, Validate, 30),
            (InProgress, Extract, 35),
            (Success, Extract, 40),
            (InProgress, StopApp, 45),
            (Success, StopApp, 55),
            (InProgress, Backup, 60),
            (Success, Backup, 75),
            (InProgress, Update, 78),
            (Success, Update, 80),
            (Success, StartApp, 85),
            (InProgress, Verify, 90),
            (Success, Verify, 92),
            (InProgress, Cleanup, 95),
            (Success, Complete, 100),
        ]
    );

    let events = fixture.sink.events();
    assert!(events
        .iter()
        .all(|e| e.job_id.as_deref() == Some("BR007-1718000000000-0000beef") && e.patch_id == "v2.3.1"));
    assert!(events
        .windows(2)
        .all(|pair| pair[0].progress_percent <= pair[1].progress_percent));

    // Merge is additive and the old executable was stopped first
    assert_eq!(fixture.app_files().await, paths(&["config.ini", "kiosk", "lib/render.so"]));
    assert_eq!(fixture.read_app("kiosk").await, b"kiosk v2.3.1");
    assert_eq!(fixture.host.running("kiosk"), 0);
    assert_eq!(fixture.host.restarts(), 1);

    // Cleanup kept the backup and dropped the scratch files
    assert_eq!(count_dirs(fixture.layout.backups_dir().path()).await, 1);
    assert!(!fixture.layout.download_file("v2.3.1").exists().await);
    assert!(!fixture.layout.update_root().exists().await);
}

#[tokio::test]
async fn test_missing_checksum_skips_validation() {
    let fixture = Fixture::new(&[("kiosk", b"old")], &[("kiosk", b"new")]).await;

    let outcome = fixture.run(request(None)).await;

    assert_eq!(outcome, PatchOutcome::Succeeded);
    let validate = fixture
        .sink
        .events()
        .into_iter()
        .find(|e| e.status == Success && e.step == PatchStep::Validate)
        .unwrap();
    assert!(validate.message.contains("skipped"));
}

#[tokio::test]
async fn test_checksum_mismatch_fails_before_touching_the_app() {
    let fixture = Fixture::new(&[("kiosk", b"old")], &[("kiosk", b"new")]).await;

    let outcome = fixture.run(request(Some("00".repeat(32)))).await;

    assert!(matches!(
        outcome,
        PatchOutcome::Failed {
            step: PatchStep::Validate,
            ..
        }
    ));
    let last = fixture.sink.events().pop().unwrap();
    assert_eq!(
        (last.status, last.step, last.progress_percent),
        (PatchStatus::Failed, PatchStep::Validate, 20)
    );
    assert!(last.message.contains("Checksum mismatch"));

    assert_eq!(fixture.read_app("kiosk").await, b"old");
    assert_eq!(fixture.host.running("kiosk"), 1);
    assert_eq!(fixture.host.restarts(), 0);
    assert!(!fixture.layout.download_file("v2.3.1").exists().await);
}

#[tokio::test]
async fn test_uppercase_checksum_is_accepted() {
    let fixture = Fixture::new(&[("kiosk", b"old")], &[("kiosk", b"new")]).await;
    let checksum = fixture.checksum().await.to_uppercase();

    assert_eq!(fixture.run(request(Some(checksum))).await, PatchOutcome::Succeeded);
}

#[tokio::test]
async fn test_missing_artifact_fails_download() {
    let fixture = Fixture::new(&[("kiosk", b"old")], &[("kiosk", b"new")]).await;
    let mut missing = request(None);
    missing.patch_zip_path = "/patches/v9.9.9.zip".to_string();

    let outcome = fixture.run(missing).await;

    assert!(matches!(
        outcome,
        PatchOutcome::Failed {
            step: PatchStep::Download,
            ..
        }
    ));
    assert_eq!(fixture.sink.steps().last().unwrap().0, PatchStatus::Failed);
    assert_eq!(fixture.host.restarts(), 0);
}

#[tokio::test]
async fn test_failed_update_restores_exact_file_set() {
    // `data` is a file in the app but a directory in the patch, so the merge
    // fails half way through
    let fixture = Fixture::new(
        &[("kiosk", b"kiosk v2.3.0"), ("data", b"legacy data file")],
        &[
            ("a-new-module.so", b"module"),
            ("data/config.json", b"{}"),
            ("kiosk", b"kiosk v2.3.1"),
        ],
    )
    .await;

    let outcome = fixture.run(request(Some(fixture.checksum().await))).await;

    assert!(matches!(
        outcome,
        PatchOutcome::RolledBack {
            step: PatchStep::Update,
            ..
        }
    ));

    let tail: Vec<_> = fixture.sink.steps().into_iter().rev().take(3).rev().collect();
    assert_eq!(
        tail,
        vec![
            (InProgress, PatchStep::Update, 78),
            (InProgress, PatchStep::Rollback, 65),
            (Rollback, PatchStep::Complete, 100),
        ]
    );

    assert_eq!(fixture.app_files().await, paths(&["data", "kiosk"]));
    assert_eq!(fixture.read_app("kiosk").await, b"kiosk v2.3.0");
    assert_eq!(fixture.read_app("data").await, b"legacy data file");
    assert_eq!(fixture.host.restarts(), 1);
}

#[tokio::test]
async fn test_missing_executable_rolls_back_at_start_app() {
    let fixture = Fixture::new(&[("readme.txt", b"old")], &[("readme.txt", b"new")]).await;

    let outcome = fixture.run(request(None)).await;

    assert!(matches!(
        outcome,
        PatchOutcome::RolledBack {
            step: PatchStep::StartApp,
            ..
        }
    ));
    let events = fixture.sink.events();
    let rollback = events
        .iter()
        .find(|e| e.step == PatchStep::Rollback)
        .unwrap();
    assert!(rollback.message.contains("START_APP"));
    assert_eq!(events.last().unwrap().status, Rollback);
    assert_eq!(fixture.read_app("readme.txt").await, b"old");
    assert_eq!(fixture.host.restarts(), 1);
}

#[tokio::test]
async fn test_damaged_install_rolls_back_at_verify() {
    let fixture = Fixture::build(
        &[("kiosk", b"kiosk v2.3.0")],
        &[("kiosk", b"kiosk v2.3.1"), ("lib/render.so", b"render")],
        3,
        FakeHost::with_process(4242, "kiosk"),
        Some(Hook {
            trigger: (Success, PatchStep::StartApp),
            // Something truncates a freshly installed file
            action: Box::new(|app| std::fs::write(app.join("lib/render.so"), b"").unwrap()),
        }),
    )
    .await;

    let outcome = fixture.run(request(Some(fixture.checksum().await))).await;

    assert!(matches!(
        outcome,
        PatchOutcome::RolledBack {
            step: PatchStep::Verify,
            ..
        }
    ));
    let tail: Vec<_> = fixture.sink.steps().into_iter().rev().take(3).rev().collect();
    assert_eq!(
        tail,
        vec![
            (InProgress, PatchStep::Verify, 90),
            (InProgress, PatchStep::Rollback, 65),
            (Rollback, PatchStep::Complete, 100),
        ]
    );
    let rollback = fixture
        .sink
        .events()
        .into_iter()
        .find(|e| e.step == PatchStep::Rollback)
        .unwrap();
    assert!(rollback.message.contains("VERIFY"));
    assert!(rollback.message.contains("render.so"));

    assert_eq!(fixture.app_files().await, paths(&["kiosk"]));
    assert_eq!(fixture.read_app("kiosk").await, b"kiosk v2.3.0");
    assert_eq!(fixture.host.restarts(), 1);
}

#[tokio::test]
async fn test_unexpected_error_after_backup_rolls_back() {
    let fixture = Fixture::build(
        &[("kiosk", b"kiosk v2.3.0"), ("config.ini", b"branch=BR007")],
        &[("kiosk", b"kiosk v2.3.1"), ("lib/render.so", b"render")],
        3,
        FakeHost::with_process(4242, "kiosk"),
        Some(Hook {
            trigger: (Success, PatchStep::Update),
            action: Box::new(|_| panic!("status channel gone")),
        }),
    )
    .await;

    let outcome = fixture.run(request(None)).await;

    match outcome {
        PatchOutcome::RolledBack { step, reason } => {
            assert_eq!(step, PatchStep::Error);
            assert!(reason.contains("status channel gone"), "{}", reason);
        }
        other => panic!("expected a rollback, got {:?}", other),
    }

    let steps: Vec<_> = fixture
        .sink
        .steps()
        .into_iter()
        .map(|(status, step, _)| (status, step))
        .collect();
    assert_eq!(
        steps[steps.len() - 4..],
        [
            (Success, PatchStep::Update),
            (Failed, PatchStep::Error),
            (InProgress, PatchStep::Rollback),
            (Rollback, PatchStep::Complete),
        ]
    );

    // The update had already landed; the backup puts the old set back
    assert_eq!(fixture.app_files().await, paths(&["config.ini", "kiosk"]));
    assert_eq!(fixture.read_app("kiosk").await, b"kiosk v2.3.0");
    assert_eq!(fixture.host.restarts(), 1);
}

#[tokio::test]
async fn test_surviving_process_fails_stop_app() {
    let fixture = Fixture::build(
        &[("kiosk", b"old")],
        &[("kiosk", b"new")],
        3,
        FakeHost::with_surviving_process(4242, "kiosk"),
        None,
    )
    .await;

    let outcome = fixture.run(request(None)).await;

    match outcome {
        PatchOutcome::Failed { step, reason } => {
            assert_eq!(step, PatchStep::StopApp);
            assert!(reason.contains("still running"), "{}", reason);
        }
        other => panic!("expected a failure, got {:?}", other),
    }
    let last = fixture.sink.events().pop().unwrap();
    assert_eq!((last.status, last.step), (Failed, PatchStep::StopApp));
    assert!(last.is_terminal());

    // No rollback: nothing was touched
    assert!(fixture.sink.events().iter().all(|e| e.step != PatchStep::Rollback));
    assert_eq!(fixture.read_app("kiosk").await, b"old");
    assert_eq!(count_dirs(fixture.layout.backups_dir().path()).await, 0);
    assert_eq!(fixture.host.restarts(), 0);
}

#[tokio::test]
async fn test_empty_archive_fails_extract() {
    let fixture = Fixture::new(&[("kiosk", b"old")], &[]).await;

    let outcome = fixture.run(request(Some(fixture.checksum().await))).await;

    match outcome {
        PatchOutcome::Failed { step, reason } => {
            assert_eq!(step, PatchStep::Extract);
            assert!(reason.contains("no files"), "{}", reason);
        }
        other => panic!("expected a failure, got {:?}", other),
    }
    let last = fixture.sink.events().pop().unwrap();
    assert_eq!((last.status, last.step), (Failed, PatchStep::Extract));

    assert_eq!(fixture.read_app("kiosk").await, b"old");
    assert_eq!(fixture.host.running("kiosk"), 1);
    assert_eq!(fixture.host.restarts(), 0);
    assert!(!fixture.layout.download_file("v2.3.1").exists().await);
}

#[tokio::test]
async fn test_resume_keeps_partial_download_and_full_retry_discards_it() {
    let archive: &[(&str, &[u8])] = &[("kiosk", b"new kiosk build")];

    // A full retry throws away whatever an earlier attempt left behind
    let fixture = Fixture::new(&[("kiosk", b"old")], archive).await;
    let checksum = fixture.checksum().await;
    let partial = fixture.layout.download_file("v2.3.1");
    partial.write_bytes(b"garbage").await.unwrap();
    assert_eq!(fixture.run(request(Some(checksum))).await, PatchOutcome::Succeeded);

    // A resume continues from the partial file, so a corrupt prefix is caught by validation
    let fixture = Fixture::new(&[("kiosk", b"old")], archive).await;
    let checksum = fixture.checksum().await;
    let partial = fixture.layout.download_file("v2.3.1");
    partial.write_bytes(b"garbage").await.unwrap();
    let mut resume = request(Some(checksum));
    resume.status = PatchStatus::Restart;
    resume.step = PatchStep::Restart;

    let outcome = fixture.run(resume).await;
    assert!(matches!(
        outcome,
        PatchOutcome::Failed {
            step: PatchStep::Validate,
            ..
        }
    ));
    // The rejected file is gone so the next attempt starts clean
    assert!(!partial.exists().await);
}

#[tokio::test]
async fn test_cleanup_prunes_old_backups() {
    let fixture = Fixture::with_retention(&[("kiosk", b"old")], &[("kiosk", b"new")], 2).await;

    for _ in 0..3 {
        assert_eq!(fixture.run(request(None)).await, PatchOutcome::Succeeded);
        // Backup names carry a millisecond timestamp
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert_eq!(count_dirs(fixture.layout.backups_dir().path()).await, 2);
    assert_eq!(fixture.host.restarts(), 3);
}

#[tokio::test]
async fn test_cancel_before_extract_ends_without_changes() {
    let fixture = Fixture::new(&[("kiosk", b"old")], &[("kiosk", b"new")]).await;
    let cancel = CancellationToken::new();

    // Cancelled up front: the download itself is abandoned
    cancel.cancel();
    let outcome = fixture.engine.run(request(None), &cancel).await;

    assert!(matches!(outcome, PatchOutcome::Failed { .. }));
    assert_eq!(fixture.read_app("kiosk").await, b"old");
    assert_eq!(fixture.host.restarts(), 0);
    assert_eq!(count_dirs(fixture.layout.backups_dir().path()).await, 0);
}
