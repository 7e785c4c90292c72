//! Upload and download through the in-memory provider

mod common;

use cloud_stage::provider::{Capabilities, Fault, FaultPoint, MemoryProvider};
use cloud_stage::{
    DownloadRequest, ErrorKind, FileBackedStream, ObjectMetadata, Operation, UploadRequest,
};
use common::{chunked_config, encryption, fast_client, fast_config, payload, RotatingSession, BUCKET};
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn write_source(dir: &tempfile::TempDir, name: &str, data: &[u8]) -> std::path::PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, data).unwrap();
    path
}

#[tokio::test]
async fn test_single_put_round_trip() {
    let provider = MemoryProvider::new("token-0");
    let (client, _) = fast_client(&provider, 3);
    let dir = tempfile::tempdir().unwrap();
    let data = payload(3000);
    let src = write_source(&dir, "orders.csv", &data);

    let metadata = ObjectMetadata::new()
        .with_content_type("text/csv")
        .with_user_metadata("sfc-digest", "abc123");
    let summary = client
        .upload(UploadRequest::from_file("PUT", BUCKET, "in/orders.csv", &src).with_metadata(metadata))
        .await
        .unwrap();
    assert_eq!(summary.bytes, 3000);
    assert_eq!(summary.parts, 1);
    assert_eq!(summary.attempts, 1);

    let stored = provider.object_metadata(BUCKET, "in/orders.csv").unwrap();
    assert_eq!(stored.content_type.as_deref(), Some("text/csv"));
    assert_eq!(stored.user_metadata.get("sfc-digest").map(String::as_str), Some("abc123"));
    assert!(!stored.is_encrypted());

    let out = tempfile::tempdir().unwrap();
    let summary = client
        .download(DownloadRequest::new("GET", BUCKET, "in/orders.csv", out.path()))
        .await
        .unwrap();
    assert_eq!(summary.bytes, 3000);
    assert_eq!(std::fs::read(out.path().join("orders.csv")).unwrap(), data);
}

#[tokio::test]
async fn test_encrypted_round_trip() {
    for key_size in [128, 192, 256] {
        let provider = MemoryProvider::new("token-0");
        let config = fast_config().encryption(encryption(key_size)).build().unwrap();
        let client = common::client(&provider, config, Arc::new(RotatingSession::new()));
        let dir = tempfile::tempdir().unwrap();
        let data = payload(1000);
        let src = write_source(&dir, "secret.bin", &data);

        let summary = client
            .upload(UploadRequest::from_file("PUT", BUCKET, "secret.bin", &src))
            .await
            .unwrap();
        // PKCS#7 always adds padding
        assert_eq!(summary.bytes, 1008);

        let stored = provider.object(BUCKET, "secret.bin").unwrap();
        assert_ne!(&stored[..], &data[..]);
        let metadata = provider.object_metadata(BUCKET, "secret.bin").unwrap();
        let enc = metadata.encryption.expect("encryption metadata");
        assert_eq!(enc.key_size(), key_size);
        assert_eq!(enc.material.smk_id, Some(4711));

        let out = tempfile::tempdir().unwrap();
        client
            .download(DownloadRequest::new("GET", BUCKET, "secret.bin", out.path()))
            .await
            .unwrap();
        assert_eq!(std::fs::read(out.path().join("secret.bin")).unwrap(), data);
    }
}

#[tokio::test]
async fn test_encrypted_multipart_and_ranged_round_trip() {
    let provider = MemoryProvider::new("token-0");
    let mut config = chunked_config(1024, 2048, 1000);
    config.encryption = Some(encryption(256));
    let client = common::client(&provider, config, Arc::new(RotatingSession::new()));
    let dir = tempfile::tempdir().unwrap();
    let data = payload(10_000);
    let src = write_source(&dir, "big.bin", &data);

    let summary = client
        .upload(UploadRequest::from_file("PUT", BUCKET, "big.bin", &src).with_parallelism(4))
        .await
        .unwrap();
    assert_eq!(summary.bytes, 10_016);
    assert_eq!(summary.parts, 10);

    let out = tempfile::tempdir().unwrap();
    let summary = client
        .download(DownloadRequest::new("GET", BUCKET, "big.bin", out.path()).with_parallelism(4))
        .await
        .unwrap();
    assert_eq!(summary.parts, 11);
    assert_eq!(std::fs::read(out.path().join("big.bin")).unwrap(), data);
}

#[tokio::test]
async fn test_parallelism_does_not_change_bytes() {
    let provider = MemoryProvider::new("token-0");
    let data = payload(100_000);
    provider.put_raw(BUCKET, "data.bin", data.clone());
    let client = common::client(
        &provider,
        chunked_config(4096, 8192, 4096),
        Arc::new(RotatingSession::new()),
    );

    let serial = tempfile::tempdir().unwrap();
    let summary = client
        .download(DownloadRequest::new("GET", BUCKET, "data.bin", serial.path()).with_parallelism(1))
        .await
        .unwrap();
    assert_eq!(summary.parts, 1);

    let parallel = tempfile::tempdir().unwrap();
    let summary = client
        .download(DownloadRequest::new("GET", BUCKET, "data.bin", parallel.path()).with_parallelism(8))
        .await
        .unwrap();
    assert_eq!(summary.parts, 25);

    let a = std::fs::read(serial.path().join("data.bin")).unwrap();
    let b = std::fs::read(parallel.path().join("data.bin")).unwrap();
    assert_eq!(a, b);
    assert_eq!(a, data);
}

#[tokio::test]
async fn test_failed_range_is_retried_independently() {
    let provider = MemoryProvider::new("token-0");
    let data = payload(20_000);
    provider.put_raw(BUCKET, "data.bin", data.clone());
    provider.inject(FaultPoint::GetRange, Fault::Transient, 2);
    let client = common::client(
        &provider,
        chunked_config(4096, 8192, 4096),
        Arc::new(RotatingSession::new()),
    );

    let out = tempfile::tempdir().unwrap();
    let summary = client
        .download(DownloadRequest::new("GET", BUCKET, "data.bin", out.path()).with_parallelism(3))
        .await
        .unwrap();
    assert_eq!(summary.parts, 5);
    assert_eq!(summary.retries, 2);
    assert_eq!(provider.attempts(FaultPoint::GetRange), 7);
    assert_eq!(std::fs::read(out.path().join("data.bin")).unwrap(), data);
}

#[tokio::test]
async fn test_failed_part_aborts_multipart_upload() {
    let provider = MemoryProvider::new("token-0");
    provider.inject_always(FaultPoint::UploadPart(3), Fault::Fatal);
    let client = common::client(
        &provider,
        chunked_config(1024, 2048, 1024),
        Arc::new(RotatingSession::new()),
    );
    let dir = tempfile::tempdir().unwrap();
    let src = write_source(&dir, "five.bin", &payload(5000));

    let err = client
        .upload(UploadRequest::from_file("PUT five.bin", BUCKET, "five.bin", &src).with_parallelism(2))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Fatal);
    assert_eq!(err.operation(), Operation::Upload);
    assert_eq!(err.command(), "PUT five.bin");
    assert_eq!(provider.attempts(FaultPoint::CreateMultipart), 1);
    assert_eq!(provider.attempts(FaultPoint::AbortMultipart), 1);
    assert_eq!(provider.attempts(FaultPoint::CompleteMultipart), 0);
    assert_eq!(provider.pending_uploads(), 0);
    assert!(provider.object(BUCKET, "five.bin").is_none());
}

#[tokio::test]
async fn test_throttled_part_is_retried() {
    let provider = MemoryProvider::new("token-0");
    provider.inject(FaultPoint::UploadPart(2), Fault::Throttled, 2);
    let client = common::client(
        &provider,
        chunked_config(1024, 2048, 1024),
        Arc::new(RotatingSession::new()),
    );
    let dir = tempfile::tempdir().unwrap();
    let data = payload(5000);
    let src = write_source(&dir, "five.bin", &data);

    let summary = client
        .upload(UploadRequest::from_file("PUT", BUCKET, "five.bin", &src).with_parallelism(5))
        .await
        .unwrap();

    assert_eq!(summary.parts, 5);
    assert_eq!(summary.retries, 2);
    assert_eq!(provider.attempts(FaultPoint::UploadPart(2)), 3);
    assert_eq!(provider.part_attempts(), 7);
    assert_eq!(provider.pending_uploads(), 0);
    assert_eq!(&provider.object(BUCKET, "five.bin").unwrap()[..], &data[..]);
}

#[tokio::test]
async fn test_provider_without_multipart_uses_single_put() {
    let provider = MemoryProvider::new("token-0");
    provider.set_capabilities(Capabilities {
        ranged_get: false,
        multipart: false,
        multipart_metadata: false,
    });
    let client = common::client(
        &provider,
        chunked_config(1024, 2048, 1024),
        Arc::new(RotatingSession::new()),
    );
    let dir = tempfile::tempdir().unwrap();
    let data = payload(5000);
    let src = write_source(&dir, "blob.bin", &data);

    let summary = client
        .upload(UploadRequest::from_file("PUT", BUCKET, "blob.bin", &src).with_parallelism(4))
        .await
        .unwrap();
    assert_eq!(summary.parts, 1);
    assert_eq!(provider.attempts(FaultPoint::CreateMultipart), 0);

    let out = tempfile::tempdir().unwrap();
    let summary = client
        .download(DownloadRequest::new("GET", BUCKET, "blob.bin", out.path()).with_parallelism(4))
        .await
        .unwrap();
    assert_eq!(summary.parts, 1);
    assert_eq!(std::fs::read(out.path().join("blob.bin")).unwrap(), data);
}

#[tokio::test]
async fn test_metadata_less_multipart_provider() {
    let provider = MemoryProvider::new("token-0");
    provider.set_capabilities(Capabilities {
        ranged_get: true,
        multipart: true,
        multipart_metadata: false,
    });
    let client = common::client(
        &provider,
        chunked_config(1024, 2048, 1024),
        Arc::new(RotatingSession::new()),
    );
    let dir = tempfile::tempdir().unwrap();
    let src = write_source(&dir, "blob.bin", &payload(5000));

    let summary = client
        .upload(UploadRequest::from_file("PUT", BUCKET, "plain.bin", &src).with_parallelism(2))
        .await
        .unwrap();
    assert_eq!(summary.parts, 5);

    let summary = client
        .upload(
            UploadRequest::from_file("PUT", BUCKET, "typed.bin", &src)
                .with_metadata(ObjectMetadata::new().with_content_type("application/octet-stream")),
        )
        .await
        .unwrap();
    assert_eq!(summary.parts, 1);
    assert_eq!(provider.attempts(FaultPoint::CreateMultipart), 1);
    assert_eq!(
        provider
            .object_metadata(BUCKET, "typed.bin")
            .unwrap()
            .content_type
            .as_deref(),
        Some("application/octet-stream")
    );
}

#[cfg(feature = "gcs-native")]
#[tokio::test]
async fn test_object_store_multipart_round_trip() {
    use cloud_stage::provider::ObjectStoreProvider;
    use cloud_stage::{ProviderKind, StorageClient};
    use object_store::memory::InMemory;

    let provider = ObjectStoreProvider::from_store(ProviderKind::Gcs, Arc::new(InMemory::new()));
    let client = StorageClient::new(
        &chunked_config(1024, 2048, 1024),
        Arc::new(provider),
        Arc::new(RotatingSession::new()),
    )
    .unwrap();
    let dir = tempfile::tempdir().unwrap();
    let data = payload(5000);
    let src = write_source(&dir, "big.bin", &data);

    let summary = client
        .upload(UploadRequest::from_file("PUT", BUCKET, "stage/big.bin", &src))
        .await
        .unwrap();
    assert_eq!(summary.parts, 5);

    let out = tempfile::tempdir().unwrap();
    let summary = client
        .download(DownloadRequest::new("GET", BUCKET, "stage/big.bin", out.path()).with_parallelism(3))
        .await
        .unwrap();
    assert_eq!(summary.parts, 5);
    assert_eq!(std::fs::read(out.path().join("big.bin")).unwrap(), data);
}

#[tokio::test]
async fn test_stream_and_spill_sources() {
    let provider = MemoryProvider::new("token-0");
    let config = fast_config().spill_threshold(64).build().unwrap();
    let client = common::client(&provider, config, Arc::new(RotatingSession::new()));
    let data = payload(500);

    client
        .upload(UploadRequest::from_stream(
            "PUT",
            BUCKET,
            "stream.bin",
            Box::new(Cursor::new(data.clone())),
        ))
        .await
        .unwrap();
    assert_eq!(&provider.object(BUCKET, "stream.bin").unwrap()[..], &data[..]);

    let mut spill = FileBackedStream::new(64);
    spill.write_all(&data).await.unwrap();
    assert!(spill.is_spilled());
    client
        .upload(UploadRequest::from_spill("PUT", BUCKET, "spill.bin", spill))
        .await
        .unwrap();
    assert_eq!(&provider.object(BUCKET, "spill.bin").unwrap()[..], &data[..]);
}

#[tokio::test]
async fn test_malformed_sources_are_rejected() {
    let provider = MemoryProvider::new("token-0");
    let (client, _) = fast_client(&provider, 3);
    let dir = tempfile::tempdir().unwrap();
    let src = write_source(&dir, "a.bin", b"abc");

    // File flagged as a stream upload
    let mut request = UploadRequest::from_file("PUT", BUCKET, "k", &src);
    request.upload_from_stream = true;
    let err = client.upload(request).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Malformed);

    // Stream given for a file upload
    let mut request = UploadRequest::from_file("PUT", BUCKET, "k", &src);
    request.input_stream = Some(Box::new(Cursor::new(b"x".to_vec())));
    let err = client.upload(request).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Malformed);

    // Both streams at once
    let mut request =
        UploadRequest::from_stream("PUT", BUCKET, "k", Box::new(Cursor::new(b"x".to_vec())));
    request.spill_stream = Some(FileBackedStream::new(8));
    let err = client.upload(request).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Malformed);

    // Neither stream
    let mut request = UploadRequest::from_spill("PUT", BUCKET, "k", FileBackedStream::new(8));
    request.spill_stream = None;
    let err = client.upload(request).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Malformed);

    // Missing file
    let err = client
        .upload(UploadRequest::from_file("PUT", BUCKET, "k", dir.path().join("nope")))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Malformed);

    // Directory as source
    let err = client
        .upload(UploadRequest::from_file("PUT", BUCKET, "k", dir.path()))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Malformed);

    assert_eq!(provider.attempts(FaultPoint::PutObject), 0);
}

#[tokio::test]
async fn test_zero_parallelism_is_malformed() {
    let provider = MemoryProvider::new("token-0");
    provider.put_raw(BUCKET, "k", b"x".to_vec());
    let (client, _) = fast_client(&provider, 3);
    let dir = tempfile::tempdir().unwrap();
    let src = write_source(&dir, "a.bin", b"abc");

    let err = client
        .upload(UploadRequest::from_file("PUT", BUCKET, "k", &src).with_parallelism(0))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Malformed);
    assert_eq!(err.attempts(), 0);

    let err = client
        .download(DownloadRequest::new("GET", BUCKET, "k", dir.path()).with_parallelism(0))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Malformed);
    assert_eq!(provider.attempts(FaultPoint::Head), 0);
}

#[tokio::test]
async fn test_download_missing_object() {
    let provider = MemoryProvider::new("token-0");
    let (client, _) = fast_client(&provider, 3);
    let dir = tempfile::tempdir().unwrap();

    let err = client
        .download(DownloadRequest::new("GET", BUCKET, "missing.csv", dir.path()))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(!dir.path().join("missing.csv").exists());
}

#[tokio::test]
async fn test_failed_download_removes_partial_file() {
    let provider = MemoryProvider::new("token-0");
    provider.put_raw(BUCKET, "data.bin", payload(20_000));
    // One of the ranges fails for good
    provider.set_latency(Duration::from_millis(5));
    let client = common::client(
        &provider,
        chunked_config(4096, 8192, 4096),
        Arc::new(RotatingSession::new()),
    );
    provider.inject(FaultPoint::GetRange, Fault::Fatal, 1);
    let dir = tempfile::tempdir().unwrap();

    let err = client
        .download(DownloadRequest::new("GET", BUCKET, "data.bin", dir.path()).with_parallelism(2))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Fatal);
    assert!(!dir.path().join("data.bin").exists());
}

fn entries(dir: &std::path::Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

#[tokio::test]
async fn test_failed_download_keeps_existing_file() {
    let provider = MemoryProvider::new("token-0");
    let config = fast_config()
        .max_retries(1)
        .range_size(1024)
        .encryption(encryption(128))
        .build()
        .unwrap();
    let client = common::client(&provider, config, Arc::new(RotatingSession::new()));
    let src_dir = tempfile::tempdir().unwrap();
    let src = write_source(&src_dir, "k.bin", &payload(5000));
    client
        .upload(UploadRequest::from_file("PUT", BUCKET, "k.bin", &src))
        .await
        .unwrap();

    let out = tempfile::tempdir().unwrap();
    std::fs::write(out.path().join("k.bin"), b"keep me").unwrap();
    provider.inject_always(FaultPoint::GetRange, Fault::Fatal);

    let err = client
        .download(DownloadRequest::new("GET", BUCKET, "k.bin", out.path()).with_parallelism(4))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Fatal);
    assert_eq!(std::fs::read(out.path().join("k.bin")).unwrap(), b"keep me");
    assert_eq!(entries(out.path()), vec!["k.bin".to_string()]);
}

#[tokio::test]
async fn test_download_replaces_existing_file() {
    let provider = MemoryProvider::new("token-0");
    let data = payload(10_000);
    provider.put_raw(BUCKET, "data.bin", data.clone());
    let client = common::client(
        &provider,
        chunked_config(4096, 8192, 4096),
        Arc::new(RotatingSession::new()),
    );
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("data.bin"), b"stale").unwrap();

    client
        .download(DownloadRequest::new("GET", BUCKET, "data.bin", dir.path()).with_parallelism(3))
        .await
        .unwrap();
    assert_eq!(std::fs::read(dir.path().join("data.bin")).unwrap(), data);
    assert_eq!(entries(dir.path()), vec!["data.bin".to_string()]);
}

#[tokio::test]
async fn test_encrypting_client_rejects_plain_object() {
    let provider = MemoryProvider::new("token-0");
    provider.put_raw(BUCKET, "plain.bin", payload(100));
    let config = fast_config().encryption(encryption(128)).build().unwrap();
    let client = common::client(&provider, config, Arc::new(RotatingSession::new()));
    let dir = tempfile::tempdir().unwrap();

    let err = client
        .download(DownloadRequest::new("GET", BUCKET, "plain.bin", dir.path()))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Fatal);
    assert_eq!(provider.attempts(FaultPoint::GetRange), 0);
    assert!(!dir.path().join("plain.bin").exists());
}

#[tokio::test]
async fn test_cancelled_download() {
    let provider = MemoryProvider::new("token-0");
    provider.put_raw(BUCKET, "k", b"x".to_vec());
    let (client, _) = fast_client(&provider, 3);
    let dir = tempfile::tempdir().unwrap();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = client
        .download(DownloadRequest::new("GET", BUCKET, "k", dir.path()).with_cancellation(cancel))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert!(!dir.path().join("k").exists());
}

#[tokio::test]
async fn test_cancelled_multipart_upload_is_aborted() {
    let provider = MemoryProvider::new("token-0");
    provider.set_latency(Duration::from_millis(50));
    let client = common::client(
        &provider,
        chunked_config(1024, 2048, 1024),
        Arc::new(RotatingSession::new()),
    );
    let dir = tempfile::tempdir().unwrap();
    let src = write_source(&dir, "ten.bin", &payload(10_240));
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(120)).await;
        trigger.cancel();
    });

    let err = client
        .upload(
            UploadRequest::from_file("PUT", BUCKET, "ten.bin", &src)
                .with_parallelism(2)
                .with_cancellation(cancel),
        )
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert_eq!(provider.attempts(FaultPoint::AbortMultipart), 1);
    assert_eq!(provider.pending_uploads(), 0);
    assert!(provider.object(BUCKET, "ten.bin").is_none());
}
