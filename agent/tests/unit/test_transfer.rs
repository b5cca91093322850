//! Resumable transfer tests

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use branchpatch::transfer::remote::FsRemoteStore;
use branchpatch::transfer::service::{TransferOptions, TransferService};
use branchpatch::transfer::sink::{NullSink, TransferOutcome};

use crate::common::FlakyStore;

const CHUNK: usize = 7;

fn options(max_attempts: u32) -> TransferOptions {
    TransferOptions {
        chunk_size: CHUNK,
        chunk_retries: 0,
        chunk_retry_delay: Duration::ZERO,
        max_attempts,
        attempt_delay: Duration::ZERO,
        progress_step_percent: 5,
    }
}

fn payload() -> Vec<u8> {
    (0..100u32).map(|i| (i * 7 % 251) as u8).collect()
}

#[tokio::test]
async fn test_interrupted_download_resumes_at_every_offset() {
    let remote = tempfile::tempdir().unwrap();
    let local = tempfile::tempdir().unwrap();
    let data = payload();
    tokio::fs::create_dir_all(remote.path().join("patches")).await.unwrap();
    tokio::fs::write(remote.path().join("patches/app.zip"), &data).await.unwrap();
    let cancel = CancellationToken::new();

    for k in 0..data.len() as u64 {
        let target = local.path().join(format!("app-{}.zip", k));

        let flaky = TransferService::new(
            Arc::new(FlakyStore::new(remote.path(), vec![Some(k)])),
            options(1),
        );
        let outcome = flaky
            .download("/patches/app.zip", &target, &NullSink, &cancel)
            .await
            .unwrap();
        assert!(matches!(outcome, TransferOutcome::Failed { .. }), "k={}", k);

        // Only whole chunks reach the disk
        let partial = (k / CHUNK as u64) * CHUNK as u64;
        let on_disk = tokio::fs::metadata(&target).await.map(|m| m.len()).unwrap_or(0);
        assert_eq!(on_disk, partial, "k={}", k);

        let healthy = TransferService::new(Arc::new(FsRemoteStore::new(remote.path())), options(1));
        let outcome = healthy
            .download("/patches/app.zip", &target, &NullSink, &cancel)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            TransferOutcome::Completed {
                bytes: data.len() as u64 - partial
            },
            "k={}",
            k
        );
        assert_eq!(tokio::fs::read(&target).await.unwrap(), data, "k={}", k);
    }
}

#[tokio::test]
async fn test_next_attempt_resumes_on_a_fresh_session() {
    let remote = tempfile::tempdir().unwrap();
    let local = tempfile::tempdir().unwrap();
    let data = payload();
    tokio::fs::write(remote.path().join("app.zip"), &data).await.unwrap();

    let store = Arc::new(FlakyStore::new(remote.path(), vec![Some(30)]));
    let service = TransferService::new(store.clone(), options(2));
    let target = local.path().join("app.zip");

    let outcome = service
        .download("app.zip", &target, &NullSink, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome, TransferOutcome::Completed { bytes: 100 - 28 });
    assert_eq!(store.connects(), 2);
    assert_eq!(tokio::fs::read(&target).await.unwrap(), data);
}

#[tokio::test]
async fn test_chunk_retry_reopens_on_the_same_session() {
    let remote = tempfile::tempdir().unwrap();
    let local = tempfile::tempdir().unwrap();
    let data = payload();
    tokio::fs::write(remote.path().join("app.zip"), &data).await.unwrap();

    let store = Arc::new(FlakyStore::new(remote.path(), vec![Some(30)]));
    let service = TransferService::new(
        store.clone(),
        TransferOptions {
            chunk_retries: 1,
            ..options(1)
        },
    );
    let target = local.path().join("app.zip");

    let outcome = service
        .download("app.zip", &target, &NullSink, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome, TransferOutcome::Completed { bytes: 100 });
    assert_eq!(store.connects(), 1);
    assert_eq!(tokio::fs::read(&target).await.unwrap(), data);
}

#[tokio::test]
async fn test_destination_larger_than_source_restarts_from_zero() {
    let remote = tempfile::tempdir().unwrap();
    let local = tempfile::tempdir().unwrap();
    let data = payload();
    tokio::fs::write(remote.path().join("app.zip"), &data).await.unwrap();
    let target = local.path().join("app.zip");
    tokio::fs::write(&target, vec![0xffu8; 150]).await.unwrap();

    let service = TransferService::new(Arc::new(FsRemoteStore::new(remote.path())), options(1));
    let outcome = service
        .download("app.zip", &target, &NullSink, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome, TransferOutcome::Completed { bytes: 100 });
    assert_eq!(tokio::fs::read(&target).await.unwrap(), data);
}

#[tokio::test]
async fn test_upload_resumes_partial_remote_file() {
    let remote = tempfile::tempdir().unwrap();
    let local = tempfile::tempdir().unwrap();
    let data = payload();
    let source = local.path().join("report.log");
    tokio::fs::write(&source, &data).await.unwrap();
    tokio::fs::create_dir_all(remote.path().join("uploads")).await.unwrap();
    tokio::fs::write(remote.path().join("uploads/report.log"), &data[..40]).await.unwrap();

    let service = TransferService::new(Arc::new(FsRemoteStore::new(remote.path())), options(1));
    let outcome = service
        .upload(&source, r"\uploads\report.log", &NullSink, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome, TransferOutcome::Completed { bytes: 60 });
    assert_eq!(
        tokio::fs::read(remote.path().join("uploads/report.log")).await.unwrap(),
        data
    );
}

#[tokio::test]
async fn test_upload_creates_remote_directories() {
    let remote = tempfile::tempdir().unwrap();
    let local = tempfile::tempdir().unwrap();
    let source = local.path().join("empty.txt");
    tokio::fs::write(&source, b"").await.unwrap();

    let service = TransferService::new(Arc::new(FsRemoteStore::new(remote.path())), options(1));
    let outcome = service
        .upload(&source, "/deep/nested/empty.txt", &NullSink, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome, TransferOutcome::Completed { bytes: 0 });
    assert!(remote.path().join("deep/nested/empty.txt").is_file());
}
