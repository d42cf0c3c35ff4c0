use chrono::{Duration, Utc};
use sha2::{Digest, Sha256};

use crate::models::RootAnalysis;
use crate::tests::common::create_test_context;
use crate::utils::CoreError;

#[tokio::test]
async fn test_store_and_retrieve_content() {
    let ctx = create_test_context().await;
    let content = b"malware sample bytes";

    let sha256 = ctx
        .state
        .storage
        .store_content(content, "sample.bin", None, None)
        .await
        .expect("store failed");
    assert_eq!(sha256, hex::encode(Sha256::digest(content)));

    let retrieved = ctx
        .state
        .storage
        .get_content_bytes(&sha256)
        .await
        .expect("retrieval failed");
    assert_eq!(retrieved, content);

    let meta = ctx
        .state
        .storage
        .get_content_meta(&sha256)
        .await
        .expect("meta lookup failed")
        .expect("meta missing");
    assert_eq!(meta.name, "sample.bin");
    assert_eq!(meta.size, content.len() as i64);
}

#[tokio::test]
async fn test_unknown_content_is_refused() {
    let ctx = create_test_context().await;
    let result = ctx.state.storage.get_content_bytes("0".repeat(64).as_str()).await;
    assert!(matches!(result, Err(CoreError::UnknownFile(_))));
}

#[tokio::test]
async fn test_delete_content_is_idempotent() {
    let ctx = create_test_context().await;
    let sha256 = ctx
        .state
        .storage
        .store_content(b"temporary", "temp.bin", None, None)
        .await
        .expect("store failed");

    assert!(ctx.state.storage.delete_content(&sha256).await.expect("delete failed"));
    assert!(!ctx.state.storage.delete_content(&sha256).await.expect("delete failed"));
    assert!(ctx
        .state
        .storage
        .get_content_meta(&sha256)
        .await
        .expect("meta lookup failed")
        .is_none());
}

#[tokio::test]
async fn test_file_round_trip() {
    let ctx = create_test_context().await;
    let dir = tempfile::tempdir().expect("tempdir failed");

    let source = dir.path().join("input.txt");
    tokio::fs::write(&source, b"file content").await.expect("write failed");

    let sha256 = ctx
        .state
        .storage
        .save_file(source.to_str().expect("path"), None)
        .await
        .expect("save failed");

    let target = dir.path().join("output.txt");
    ctx.state
        .storage
        .load_file(&sha256, target.to_str().expect("path"))
        .await
        .expect("load failed");

    let restored = tokio::fs::read(&target).await.expect("read failed");
    assert_eq!(restored, b"file content");
}

#[tokio::test]
async fn test_iter_content_streams_bytes() {
    use tokio::io::AsyncReadExt;

    let ctx = create_test_context().await;
    let content = b"streamed content";
    let sha256 = ctx
        .state
        .storage
        .store_content(content, "stream.bin", None, None)
        .await
        .expect("store failed");

    let mut reader = ctx
        .state
        .storage
        .iter_content(&sha256)
        .await
        .expect("open failed");
    let mut streamed = Vec::new();
    reader.read_to_end(&mut streamed).await.expect("read failed");
    assert_eq!(streamed, content);
}

#[tokio::test]
async fn test_root_references() {
    let ctx = create_test_context().await;

    let sha256 = ctx
        .state
        .storage
        .store_content(b"referenced", "ref.bin", None, None)
        .await
        .expect("store failed");

    // no references yet
    assert!(!ctx
        .state
        .storage
        .has_valid_root_reference(&sha256)
        .await
        .expect("reference check failed"));

    let mut root = RootAnalysis::new();
    let root_uuid = root.uuid.clone();
    ctx.state
        .analysis_tracking
        .track_root_analysis(&mut root)
        .await
        .expect("tracking failed");
    ctx.state
        .storage
        .track_content_root(&sha256, &root_uuid)
        .await
        .expect("root tracking failed");

    assert!(ctx
        .state
        .storage
        .has_valid_root_reference(&sha256)
        .await
        .expect("reference check failed"));
    assert_eq!(
        ctx.state.storage.get_content_roots(&sha256).await.expect("roots lookup failed"),
        vec![root_uuid.clone()]
    );

    // a reference to a deleted root no longer counts
    ctx.state
        .analysis_tracking
        .delete_root_analysis(&root_uuid)
        .await
        .expect("root deletion failed");
    assert!(!ctx
        .state
        .storage
        .has_valid_root_reference(&sha256)
        .await
        .expect("reference check failed"));
}

#[tokio::test]
async fn test_expired_content_deletion_honors_root_references() {
    let ctx = create_test_context().await;
    let expired_at = Utc::now() - Duration::hours(1);

    let orphaned = ctx
        .state
        .storage
        .store_content(b"orphaned", "orphan.bin", Some(expired_at), None)
        .await
        .expect("store failed");

    let referenced = ctx
        .state
        .storage
        .store_content(b"still referenced", "kept.bin", Some(expired_at), None)
        .await
        .expect("store failed");

    let mut root = RootAnalysis::new();
    let root_uuid = root.uuid.clone();
    ctx.state
        .analysis_tracking
        .track_root_analysis(&mut root)
        .await
        .expect("tracking failed");
    ctx.state
        .storage
        .track_content_root(&referenced, &root_uuid)
        .await
        .expect("root tracking failed");

    let expired = ctx.state.storage.iter_expired_content().await.expect("scan failed");
    assert_eq!(expired.len(), 2);

    let deleted = ctx.state.storage.delete_expired_content().await.expect("purge failed");
    assert_eq!(deleted, 1);

    assert!(ctx
        .state
        .storage
        .get_content_meta(&orphaned)
        .await
        .expect("meta lookup failed")
        .is_none());
    assert!(ctx
        .state
        .storage
        .get_content_meta(&referenced)
        .await
        .expect("meta lookup failed")
        .is_some());
}

// file observables tracked into a root keep their content association
#[tokio::test]
async fn test_file_observables_are_associated_on_save() {
    let ctx = create_test_context().await;

    let sha256 = ctx
        .state
        .storage
        .store_content(b"attachment", "attachment.bin", None, None)
        .await
        .expect("store failed");

    let mut root = RootAnalysis::new();
    root.add_observable("file", sha256.clone(), None);
    let root_uuid = root.uuid.clone();
    ctx.state
        .analysis_tracking
        .track_root_analysis(&mut root)
        .await
        .expect("tracking failed");

    assert_eq!(
        ctx.state.storage.get_content_roots(&sha256).await.expect("roots lookup failed"),
        vec![root_uuid]
    );
}
