//! Download verification and user-driven transfer control

mod common;

use std::fs;

use common::{md5_hex, Harness};
use pairsync_core::config::ConfigBuilder;
use pairsync_core::domain::{PairState, Transfer, TransferDirection, TransferStatus};
use pairsync_core::ports::{IPairStateStore, IRemoteClient};
use pairsync_sync::transfer::{is_download_tmp, MAX_DOWNLOAD_ATTEMPTS};
use pairsync_sync::{SyncError, TransferError};

fn leftovers(dir: &std::path::Path) -> usize {
    fs::read_dir(dir)
        .unwrap()
        .filter_map(Result::ok)
        .filter(|e| is_download_tmp(&e.file_name().to_string_lossy()))
        .count()
}

#[tokio::test]
async fn test_download_rejects_corrupted_content() {
    let h = Harness::new().await;
    let root = h.bind_root().await;
    let file = h.remote.add_file(&root, "data.bin", b"actual bytes");
    h.engine.poll_remote().await.unwrap();
    h.sync().await;

    let pair = h.pair_of(&file).await.unwrap();
    let mut info = h.remote.get_info(&file).await.unwrap().unwrap();
    info.digest = Some(md5_hex(b"announced bytes"));
    let before = h.remote.calls().downloads;

    let result = h.engine.transfers().download(&pair, &info, &h.abs("")).await;

    assert!(matches!(
        result,
        Err(SyncError::Transfer(TransferError::Corrupted { .. }))
    ));
    assert_eq!(
        h.remote.calls().downloads - before,
        MAX_DOWNLOAD_ATTEMPTS as usize
    );
    assert_eq!(leftovers(&h.abs("")), 0);
    assert!(h
        .store
        .get_transfer_for_pair(pair.id, TransferDirection::Download)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_download_skips_check_when_disabled() {
    let h = Harness::with_config(|home| {
        ConfigBuilder::new()
            .nxdrive_home(home.to_path_buf())
            .trash_fallback_delete(true)
            .disabled_file_integrity_check(true)
            .build()
    })
    .await;
    let root = h.bind_root().await;
    let file = h.remote.add_file(&root, "data.bin", b"actual bytes");
    h.engine.poll_remote().await.unwrap();
    h.sync().await;

    let pair = h.pair_of(&file).await.unwrap();
    let mut info = h.remote.get_info(&file).await.unwrap().unwrap();
    info.digest = Some(md5_hex(b"announced bytes"));

    let downloaded = h
        .engine
        .transfers()
        .download(&pair, &info, &h.abs(""))
        .await
        .unwrap();
    assert_eq!(downloaded.digest, md5_hex(b"actual bytes"));
    assert_eq!(fs::read(&downloaded.tmp_path).unwrap(), b"actual bytes");
}

#[tokio::test]
async fn test_user_paused_upload_waits_for_resume() {
    let h = Harness::new().await;
    let root = h.bind_root().await;

    fs::write(h.abs("report.txt"), b"quarterly numbers").unwrap();
    h.engine.scan_local().await.unwrap();
    let pair = h.pair("report.txt").await.unwrap();

    let mut transfer = Transfer::new(pair.id, TransferDirection::Upload, 17);
    transfer.status = TransferStatus::Paused;
    h.store.save_transfer(&transfer).await.unwrap();
    assert!(h.engine.transfers().is_paused(&pair).await.unwrap());

    h.sync().await;
    assert_eq!(h.remote.calls().files_created, 0);
    assert_eq!(
        h.pair("report.txt").await.unwrap().pair_state,
        PairState::LocallyCreated
    );

    h.engine.resume_transfer(transfer.uid).await.unwrap();
    h.sync().await;

    let uploaded = h.remote.child(&root, "report.txt").unwrap();
    assert_eq!(h.remote.content(&uploaded).unwrap(), b"quarterly numbers");
    assert_eq!(
        h.pair("report.txt").await.unwrap().pair_state,
        PairState::Synchronized
    );
}

#[tokio::test]
async fn test_cancelled_transfer_is_forgotten() {
    let h = Harness::new().await;
    h.bind_root().await;

    fs::write(h.abs("big.iso"), b"image").unwrap();
    h.engine.scan_local().await.unwrap();
    let pair = h.pair("big.iso").await.unwrap();

    let transfer = Transfer::new(pair.id, TransferDirection::Upload, 5);
    h.store.save_transfer(&transfer).await.unwrap();
    h.engine.cancel_transfer(transfer.uid).await.unwrap();

    assert!(h.store.get_transfer(transfer.uid).await.unwrap().is_none());
}

#[tokio::test]
async fn test_small_download_ignores_suspension_checkpoints() {
    let h = Harness::with_config(|home| {
        ConfigBuilder::new()
            .nxdrive_home(home.to_path_buf())
            .trash_fallback_delete(true)
            .tmp_file_limit(1024)
            .build()
    })
    .await;
    let root = h.bind_root().await;
    let file = h.remote.add_file(&root, "small.txt", b"tiny");
    h.engine.poll_remote().await.unwrap();
    let pair = h.pair_of(&file).await.unwrap();
    let info = h.remote.get_info(&file).await.unwrap().unwrap();

    h.engine.transfers().request_suspend();
    let downloaded = h
        .engine
        .transfers()
        .download(&pair, &info, &h.abs(""))
        .await
        .unwrap();

    assert_eq!(downloaded.digest, md5_hex(b"tiny"));
    assert_eq!(fs::read(&downloaded.tmp_path).unwrap(), b"tiny");
}

#[tokio::test]
async fn test_streamed_download_stops_when_suspended() {
    let h = Harness::new().await;
    let root = h.bind_root().await;
    let file = h.remote.add_file(&root, "small.txt", b"tiny");
    h.engine.poll_remote().await.unwrap();
    let pair = h.pair_of(&file).await.unwrap();
    let info = h.remote.get_info(&file).await.unwrap().unwrap();

    h.engine.transfers().request_suspend();
    let result = h.engine.transfers().download(&pair, &info, &h.abs("")).await;

    assert!(matches!(
        result,
        Err(SyncError::Transfer(TransferError::Paused(_)))
    ));
    let transfer = h
        .store
        .get_transfer_for_pair(pair.id, TransferDirection::Download)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(transfer.status, TransferStatus::Suspended);
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_full_disk_unsynchronizes_and_suspends() {
    use pairsync_sync::EngineEvent;

    if !std::path::Path::new("/dev/full").exists() {
        return;
    }
    let h = Harness::new().await;
    let root = h.bind_root().await;
    let file = h.remote.add_file(&root, "big.bin", b"does not fit");
    h.engine.poll_remote().await.unwrap();
    let pair = h.pair_of(&file).await.unwrap();

    // A known transfer uid lets the partial file resolve to a full device
    let transfer = Transfer::new(pair.id, TransferDirection::Download, 12);
    h.store.save_transfer(&transfer).await.unwrap();
    let tmp = h.abs(&format!(".big.bin.{}.nxpart", transfer.uid));
    std::os::unix::fs::symlink("/dev/full", &tmp).unwrap();

    let mut events = h.engine.subscribe();
    h.sync().await;

    let pair = h.pair_of(&file).await.unwrap();
    assert_eq!(pair.pair_state, PairState::Unsynchronized);
    assert_eq!(pair.last_error.as_deref(), Some("NO_SPACE_LEFT_ON_DEVICE"));
    assert!(h.engine.is_suspended());
    assert!(!h.abs("big.bin").exists());
    assert_eq!(leftovers(&h.abs("")), 0);

    let mut seen_no_space = false;
    while let Ok(event) = events.try_recv() {
        seen_no_space |= matches!(event, EngineEvent::NoSpaceLeft { .. });
    }
    assert!(seen_no_space);
}
