mod common;

use bytes::Bytes;
use common::{Harness, meta};
use futures::stream;
use std::{
    path::Path,
    sync::{Arc, atomic::Ordering},
};
use tokio::sync::oneshot;
use video_ingest::{
    models::upload::UploadStage,
    services::{
        assembler::CollisionPolicy,
        catalog::{Catalog, NewVideo, SqliteCatalog},
        coordinator::{IngestError, IngestionCoordinator},
    },
};

fn hidden_entries(dir: &Path) -> Vec<String> {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .map(|e| e.unwrap().file_name().into_string().unwrap())
                .filter(|name| name.starts_with('.'))
                .collect()
        })
        .unwrap_or_default()
}

async fn send(h: &Harness, upload_id: &str, index: i64, total: i64, payload: &'static [u8]) -> bool {
    h.coordinator
        .accept_chunk(meta(upload_id, index, total, "clip.mp4"), Bytes::from_static(payload))
        .await
        .unwrap()
        .complete
}

#[tokio::test]
async fn out_of_order_chunks_assemble_in_index_order() {
    let h = Harness::new(CollisionPolicy::Reject).await;

    assert!(!send(&h, "u1", 1, 3, b"AA").await);
    assert!(!send(&h, "u1", 0, 3, b"BB").await);
    assert!(send(&h, "u1", 2, 3, b"CC").await);
    h.coordinator.wait_idle().await;

    let assembled = h.video_root().join("clip.mp4");
    assert_eq!(std::fs::read(&assembled).unwrap(), b"BBAACC");
    assert!(h.video_root().join("clip").join("index.m3u8").exists());
    assert!(!h.chunk_root().join("u1").exists());

    let registered = h.catalog.registered();
    assert_eq!(registered.len(), 1);
    assert_eq!(registered[0].owner, "alice");
    assert_eq!(registered[0].display_name, "clip.mp4");
    assert_eq!(registered[0].file_path, assembled);
    assert_eq!(
        registered[0].stream_dir.as_deref(),
        Some(h.video_root().join("clip").as_path())
    );

    assert!(matches!(
        h.coordinator.status("u1").await,
        Err(IngestError::NotFound(_))
    ));
}

#[tokio::test]
async fn resent_chunk_keeps_latest_payload() {
    let h = Harness::new(CollisionPolicy::Reject).await;

    send(&h, "u2", 0, 2, b"X").await;
    send(&h, "u2", 0, 2, b"Y").await;
    let status = h.coordinator.status("u2").await.unwrap();
    assert_eq!(status.received_count, 1);
    assert!(!status.is_complete);

    send(&h, "u2", 1, 2, b"Z").await;
    h.coordinator.wait_idle().await;

    assert_eq!(std::fs::read(h.video_root().join("clip.mp4")).unwrap(), b"YZ");
}

#[tokio::test]
async fn every_arrival_order_yields_the_same_file() {
    let orders: [[i64; 4]; 4] = [[0, 1, 2, 3], [3, 2, 1, 0], [2, 0, 3, 1], [1, 3, 0, 2]];
    let payloads: [&'static [u8]; 4] = [b"one-", b"two-", b"three-", b"four"];

    for (n, order) in orders.iter().enumerate() {
        let h = Harness::new(CollisionPolicy::Reject).await;
        let upload_id = format!("perm-{}", n);
        for &index in order {
            h.coordinator
                .accept_chunk(
                    meta(&upload_id, index, 4, "clip.mp4"),
                    Bytes::from_static(payloads[index as usize]),
                )
                .await
                .unwrap();
        }
        h.coordinator.wait_idle().await;
        assert_eq!(
            std::fs::read(h.video_root().join("clip.mp4")).unwrap(),
            b"one-two-three-four",
            "arrival order {:?}",
            order
        );
    }
}

#[tokio::test]
async fn invalid_chunks_change_nothing() {
    let h = Harness::new(CollisionPolicy::Reject).await;
    send(&h, "u3", 0, 3, b"AA").await;

    let cases = [
        meta("u3", 5, 3, "clip.mp4"),
        meta("u3", -1, 3, "clip.mp4"),
        meta("u3", 0, 0, "clip.mp4"),
        meta("u3", 1, 4, "clip.mp4"),
        meta("../escape", 0, 1, "clip.mp4"),
        meta("u3", 1, 3, "../clip.mp4"),
    ];
    for case in cases {
        let err = h
            .coordinator
            .accept_chunk(case.clone(), Bytes::from_static(b"??"))
            .await
            .unwrap_err();
        assert!(
            matches!(err, IngestError::InvalidChunk(_)),
            "{:?} gave {:?}",
            case,
            err
        );
    }

    let status = h.coordinator.status("u3").await.unwrap();
    assert_eq!(status.received_chunks.iter().copied().collect::<Vec<_>>(), vec![0]);
    assert_eq!(status.total_chunks, 3);
    let staged: Vec<_> = std::fs::read_dir(h.chunk_root().join("u3")).unwrap().collect();
    assert_eq!(staged.len(), 1);
}

#[tokio::test]
async fn parallel_chunks_trigger_the_pipeline_once() {
    let h = Harness::new(CollisionPolicy::Reject).await;
    let total = 24i64;

    let mut handles = Vec::new();
    for index in 0..total {
        let coordinator = h.coordinator.clone();
        handles.push(tokio::spawn(async move {
            coordinator
                .accept_chunk(
                    meta("u4", index, total, "clip.mp4"),
                    Bytes::from(vec![b'a' + index as u8; 3]),
                )
                .await
                .unwrap()
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }
    h.coordinator.wait_idle().await;

    assert_eq!(h.transcoder.calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.catalog.registered().len(), 1);

    let expected: Vec<u8> = (0..total).flat_map(|i| vec![b'a' + i as u8; 3]).collect();
    assert_eq!(std::fs::read(h.video_root().join("clip.mp4")).unwrap(), expected);
}

#[tokio::test]
async fn transcode_failure_keeps_assembled_file_and_retries_alone() {
    let h = Harness::new(CollisionPolicy::Reject).await;
    h.transcoder.fail.store(true, Ordering::SeqCst);

    send(&h, "u5", 0, 2, b"head").await;
    send(&h, "u5", 1, 2, b"tail").await;
    h.coordinator.wait_idle().await;

    let failed = h.coordinator.status("u5").await.unwrap();
    assert_eq!(failed.stage, UploadStage::Failed);
    assert_eq!(failed.failed_stage, Some(UploadStage::Transcoding));
    assert!(failed.last_error.unwrap().contains("Invalid data"));
    let assembled = h.video_root().join("clip.mp4");
    assert_eq!(failed.assembled_path.as_deref(), Some(assembled.to_str().unwrap()));
    assert!(assembled.exists());
    assert!(h.catalog.registered().is_empty());

    h.transcoder.fail.store(false, Ordering::SeqCst);
    let stage = h.coordinator.retry("u5").await.unwrap();
    assert_eq!(stage, UploadStage::Transcoding);
    h.coordinator.wait_idle().await;

    assert_eq!(h.transcoder.calls.load(Ordering::SeqCst), 2);
    assert_eq!(h.catalog.registered().len(), 1);
    assert_eq!(std::fs::read(&assembled).unwrap(), b"headtail");
    assert!(matches!(
        h.coordinator.status("u5").await,
        Err(IngestError::NotFound(_))
    ));
}

#[tokio::test]
async fn catalog_rejection_retains_session_and_artifacts() {
    let h = Harness::new(CollisionPolicy::Reject).await;
    h.catalog.reject.store(true, Ordering::SeqCst);

    send(&h, "u6", 0, 1, b"only").await;
    h.coordinator.wait_idle().await;

    let failed = h.coordinator.status("u6").await.unwrap();
    assert_eq!(failed.failed_stage, Some(UploadStage::Registering));
    assert!(failed.output_dir.is_some());
    assert!(h.video_root().join("clip.mp4").exists());
    assert!(h.video_root().join("clip").join("index.m3u8").exists());

    h.catalog.reject.store(false, Ordering::SeqCst);
    assert_eq!(
        h.coordinator.retry("u6").await.unwrap(),
        UploadStage::Registering
    );
    h.coordinator.wait_idle().await;

    assert_eq!(h.transcoder.calls.load(Ordering::SeqCst), 1);
    let registered = h.catalog.registered();
    assert_eq!(registered.len(), 1);
    assert_eq!(registered[0].stream_dir, Some(h.video_root().join("clip")));
}

#[tokio::test]
async fn assembly_collision_keeps_chunks_for_retry() {
    let h = Harness::new(CollisionPolicy::Reject).await;
    let blocker = h.video_root().join("clip.mp4");
    std::fs::write(&blocker, b"someone else's video").unwrap();

    send(&h, "u7", 0, 2, b"ab").await;
    send(&h, "u7", 1, 2, b"cd").await;
    h.coordinator.wait_idle().await;

    let failed = h.coordinator.status("u7").await.unwrap();
    assert_eq!(failed.failed_stage, Some(UploadStage::Assembling));
    assert!(failed.assembled_path.is_none());
    assert!(h.chunk_root().join("u7").join("0.part").exists());
    assert!(h.chunk_root().join("u7").join("1.part").exists());
    assert_eq!(h.transcoder.calls.load(Ordering::SeqCst), 0);

    std::fs::remove_file(&blocker).unwrap();
    assert_eq!(h.coordinator.retry("u7").await.unwrap(), UploadStage::Assembling);
    h.coordinator.wait_idle().await;

    assert_eq!(std::fs::read(&blocker).unwrap(), b"abcd");
    assert_eq!(h.catalog.registered().len(), 1);
}

#[tokio::test]
async fn retry_is_refused_outside_failed_or_pending_states() {
    let h = Harness::new(CollisionPolicy::Reject).await;
    send(&h, "u8", 0, 2, b"ab").await;

    assert!(matches!(
        h.coordinator.retry("u8").await,
        Err(IngestError::NotRetryable {
            stage: UploadStage::Receiving,
            ..
        })
    ));
    assert!(matches!(
        h.coordinator.retry("nope").await,
        Err(IngestError::NotFound(_))
    ));
}

#[tokio::test]
async fn concurrent_retries_start_one_pipeline() {
    let h = Harness::new(CollisionPolicy::Reject).await;
    h.transcoder.fail.store(true, Ordering::SeqCst);
    send(&h, "u9", 0, 1, b"v").await;
    h.coordinator.wait_idle().await;
    h.transcoder.fail.store(false, Ordering::SeqCst);

    let (a, b) = tokio::join!(h.coordinator.retry("u9"), h.coordinator.retry("u9"));
    assert!(a.is_ok() ^ b.is_ok());
    h.coordinator.wait_idle().await;

    assert_eq!(h.transcoder.calls.load(Ordering::SeqCst), 2);
    assert_eq!(h.catalog.registered().len(), 1);
}

#[tokio::test]
async fn chunks_after_completion_are_not_written() {
    let h = Harness::new(CollisionPolicy::Reject).await;
    h.transcoder.fail.store(true, Ordering::SeqCst);
    send(&h, "u10", 0, 1, b"original").await;
    h.coordinator.wait_idle().await;

    let late = h
        .coordinator
        .accept_chunk(meta("u10", 0, 1, "clip.mp4"), Bytes::from_static(b"late"))
        .await
        .unwrap();
    assert!(late.ignored);
    assert!(late.complete);
    assert!(late.receipt.is_none());
    assert!(!h.chunk_root().join("u10").exists());
    assert_eq!(
        std::fs::read(h.video_root().join("clip.mp4")).unwrap(),
        b"original"
    );
}

#[tokio::test]
async fn restart_dispatches_pending_and_parks_in_flight_uploads() {
    let h = Harness::new(CollisionPolicy::Reject).await;

    // Completed before the "crash" but never dispatched.
    h.complete_without_dispatch("pending", "pending.mp4", b"P").await;

    // Caught mid-assembly.
    h.complete_without_dispatch("inflight", "inflight.mp4", b"I").await;
    assert!(
        h.ledger
            .transition("inflight", UploadStage::Complete, UploadStage::Assembling)
            .await
            .unwrap()
    );

    let report = h.coordinator.resume_interrupted().await.unwrap();
    assert_eq!(report.dispatched, vec!["pending".to_string()]);
    assert_eq!(report.parked, vec!["inflight".to_string()]);
    h.coordinator.wait_idle().await;

    assert_eq!(std::fs::read(h.video_root().join("pending.mp4")).unwrap(), b"P");
    assert_eq!(h.catalog.registered().len(), 1);

    let parked = h.coordinator.status("inflight").await.unwrap();
    assert_eq!(parked.stage, UploadStage::Failed);
    assert_eq!(parked.failed_stage, Some(UploadStage::Assembling));
    assert_eq!(parked.last_error.as_deref(), Some("interrupted by restart"));
}

#[tokio::test]
async fn assembly_published_but_never_recorded_is_reused_after_restart() {
    let h = Harness::new(CollisionPolicy::Disambiguate).await;
    h.complete_without_dispatch("p", "clip.mp4", b"P").await;
    assert!(
        h.ledger
            .transition("p", UploadStage::Complete, UploadStage::Assembling)
            .await
            .unwrap()
    );

    // The old worker published the file and died before the ledger heard of it.
    let published = h.assembler().assemble("p", "clip.mp4", 1).await.unwrap();
    assert!(h.ledger.get("p").await.unwrap().assembled_path.is_none());
    assert!(h.chunk_root().join("p").join("0.part").exists());

    let report = h.coordinator.resume_interrupted().await.unwrap();
    assert_eq!(report.parked, vec!["p".to_string()]);
    assert_eq!(h.coordinator.retry("p").await.unwrap(), UploadStage::Assembling);
    h.coordinator.wait_idle().await;

    let registered = h.catalog.registered();
    assert_eq!(registered.len(), 1);
    assert_eq!(registered[0].file_path, published);
    assert_eq!(std::fs::read(&published).unwrap(), b"P");
    assert!(!h.video_root().join("clip-1.mp4").exists());
    assert!(hidden_entries(&h.video_root()).is_empty());
    assert!(!h.chunk_root().join("p").exists());
    assert!(h.ledger.published("p").await.unwrap().is_some());
}

#[tokio::test]
async fn slow_resend_that_loses_the_race_to_publication_is_ignored() {
    let h = Harness::new(CollisionPolicy::Reject).await;
    let (started_tx, started_rx) = oneshot::channel();
    let (release_tx, release_rx) = oneshot::channel::<()>();
    let body = stream::once(async move {
        let _ = started_tx.send(());
        let _ = release_rx.await;
        Ok::<_, std::io::Error>(Bytes::from_static(b"stale"))
    });
    let slow = {
        let coordinator = h.coordinator.clone();
        tokio::spawn(async move {
            coordinator
                .accept_chunk_stream(meta("r1", 0, 2, "clip.mp4"), body)
                .await
        })
    };
    // The resend is past the early check and streaming its body.
    started_rx.await.unwrap();

    send(&h, "r1", 0, 2, b"AA").await;
    send(&h, "r1", 1, 2, b"BB").await;
    h.coordinator.wait_idle().await;
    assert_eq!(h.catalog.registered().len(), 1);

    release_tx.send(()).unwrap();
    let late = slow.await.unwrap().unwrap();
    assert!(late.ignored);
    assert!(late.complete);
    assert!(late.receipt.is_none());

    let again = h
        .coordinator
        .accept_chunk(meta("r1", 0, 2, "clip.mp4"), Bytes::from_static(b"stale"))
        .await
        .unwrap();
    assert!(again.ignored);
    assert_eq!(again.received_chunks, 2);

    assert!(matches!(
        h.coordinator.status("r1").await,
        Err(IngestError::NotFound(_))
    ));
    assert!(!h.chunk_root().join("r1").exists());
    let incoming = std::fs::read_dir(h.chunk_root().join(".incoming")).unwrap().count();
    assert_eq!(incoming, 0);
    assert_eq!(std::fs::read(h.video_root().join("clip.mp4")).unwrap(), b"AABB");
    assert_eq!(h.catalog.registered().len(), 1);
}

#[tokio::test]
async fn registration_interrupted_after_the_catalog_insert_registers_once() {
    let h = Harness::new(CollisionPolicy::Reject).await;
    let catalog = Arc::new(SqliteCatalog::new(h.db.clone()));
    let coordinator = IngestionCoordinator::new(
        h.chunks.clone(),
        h.ledger.clone(),
        h.assembler(),
        h.transcoder.clone(),
        catalog.clone(),
        1,
    );

    // Assembled, transcoded and registered; the process died before retiring the session.
    h.complete_without_dispatch("g", "clip.mp4", b"G").await;
    let file_path = h.video_root().join("clip.mp4");
    let stream_dir = h.video_root().join("clip");
    h.ledger
        .transition("g", UploadStage::Complete, UploadStage::Assembling)
        .await
        .unwrap();
    h.ledger
        .record_assembled("g", file_path.to_str().unwrap())
        .await
        .unwrap();
    h.ledger
        .record_transcoded("g", stream_dir.to_str().unwrap())
        .await
        .unwrap();
    let first = catalog
        .create_video_record(NewVideo {
            upload_id: "g",
            owner: "bob",
            file_path: &file_path,
            display_name: "clip.mp4",
            stream_dir: Some(&stream_dir),
        })
        .await
        .unwrap();

    let report = coordinator.resume_interrupted().await.unwrap();
    assert_eq!(report.parked, vec!["g".to_string()]);
    assert_eq!(coordinator.retry("g").await.unwrap(), UploadStage::Registering);
    coordinator.wait_idle().await;

    let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM videos")
        .fetch_one(&*h.db)
        .await
        .unwrap();
    assert_eq!(rows, 1);
    assert_eq!(h.ledger.published("g").await.unwrap().unwrap().video_id, first);
    assert!(matches!(
        coordinator.status("g").await,
        Err(IngestError::NotFound(_))
    ));
}
