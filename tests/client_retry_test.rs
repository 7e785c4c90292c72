//! Retry, backoff and credential renewal through the storage client

mod common;

use cloud_stage::provider::{Fault, FaultPoint, MemoryProvider};
use cloud_stage::{ErrorKind, Operation, RetryDecision, RetryPolicy};
use common::{fast_client, fast_config, RotatingSession, BUCKET};
use std::sync::Arc;
use std::time::Duration;

#[test]
fn test_backoff_table_matches_defaults() {
    let policy = RetryPolicy::new(25, Duration::from_millis(1000), 4);
    let delays: Vec<u128> = (0..6).map(|n| policy.backoff(n).as_millis()).collect();
    assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000, 16000]);
}

#[tokio::test]
async fn test_max_retries_three_gives_four_attempts() {
    let provider = MemoryProvider::new("token-0");
    provider.put_raw(BUCKET, "data.csv", b"a,b".to_vec());
    provider.inject_always(FaultPoint::Head, Fault::Throttled);
    let (client, _) = fast_client(&provider, 3);

    let err = client
        .get_object_metadata(BUCKET, "data.csv")
        .await
        .unwrap_err();

    assert_eq!(provider.attempts(FaultPoint::Head), 4);
    assert_eq!(err.kind(), ErrorKind::Fatal);
    assert_eq!(err.attempts(), 4);
    assert_eq!(err.operation(), Operation::GetObjectMetadata);
    let message = err.to_string();
    assert!(message.contains("getObjectMetadata"), "{message}");
    assert!(message.contains(&format!("HEAD {}/data.csv", BUCKET)), "{message}");
    assert!(message.contains("4 attempt(s)"), "{message}");
}

#[tokio::test]
async fn test_transient_then_success() {
    let provider = MemoryProvider::new("token-0");
    provider.put_raw(BUCKET, "k", b"xyz".to_vec());
    provider.inject(FaultPoint::Head, Fault::Transient, 2);
    let (client, _) = fast_client(&provider, 3);

    let metadata = client.get_object_metadata(BUCKET, "k").await.unwrap();
    assert_eq!(metadata.content_length, 3);
    assert_eq!(provider.attempts(FaultPoint::Head), 3);
}

#[tokio::test(start_paused = true)]
async fn test_backoff_sleeps_follow_policy() {
    let provider = MemoryProvider::new("token-0");
    provider.put_raw(BUCKET, "k", b"x".to_vec());
    provider.inject(FaultPoint::Head, Fault::Throttled, 3);
    let config = cloud_stage::ClientConfig::builder()
        .max_retries(5)
        .retry_backoff_min(Duration::from_millis(1000))
        .jitter(false)
        .build()
        .unwrap();
    let client = common::client(&provider, config, Arc::new(RotatingSession::new()));

    let start = tokio::time::Instant::now();
    client.get_object_metadata(BUCKET, "k").await.unwrap();
    // 1000 + 2000 + 4000 ms of virtual time
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(7000), "{:?}", elapsed);
    assert!(elapsed < Duration::from_millis(7100), "{:?}", elapsed);
}

#[tokio::test]
async fn test_not_found_fails_on_first_attempt() {
    let provider = MemoryProvider::new("token-0");
    let (client, _) = fast_client(&provider, 5);

    let err = client.get_object_metadata(BUCKET, "nope").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(err.is_not_found());
    assert_eq!(provider.attempts(FaultPoint::Head), 1);
}

#[tokio::test]
async fn test_fatal_provider_error_is_not_retried() {
    let provider = MemoryProvider::new("token-0");
    provider.inject_always(FaultPoint::Head, Fault::Fatal);
    let (client, _) = fast_client(&provider, 5);

    let err = client.get_object_metadata(BUCKET, "k").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Fatal);
    assert_eq!(provider.attempts(FaultPoint::Head), 1);
    let raw = err.provider_error().unwrap();
    assert_eq!(raw.code.as_deref(), Some("AccessDenied"));
    assert_eq!(raw.status, Some(403));
}

#[tokio::test]
async fn test_expired_token_renews_without_consuming_retry() {
    let provider = MemoryProvider::new("token-0");
    provider.put_raw(BUCKET, "k", b"x".to_vec());
    provider.revoke_token("token-0");
    // A zero retry budget still allows renewal
    let (client, session) = fast_client(&provider, 0);

    let metadata = client.get_object_metadata(BUCKET, "k").await.unwrap();
    assert_eq!(metadata.content_length, 1);
    assert_eq!(session.issued(), 1);
    assert_eq!(provider.renewals(), 1);
    assert_eq!(provider.attempts(FaultPoint::Head), 2);
}

#[tokio::test]
async fn test_renewal_keeps_configuration() {
    let provider = MemoryProvider::new("token-0");
    provider.put_raw(BUCKET, "k", b"x".to_vec());
    provider.revoke_token("token-0");
    let session = Arc::new(RotatingSession::new());
    let config = fast_config()
        .max_retries(9)
        .encryption(common::encryption(256))
        .build()
        .unwrap();
    let client = common::client(&provider, config, session);

    client.get_object_metadata(BUCKET, "k").await.unwrap();
    assert_eq!(client.max_retries(), 9);
    assert!(client.is_encrypting());
    assert_eq!(client.encryption_key_size(), Some(256));
}

#[tokio::test]
async fn test_renewal_is_bounded() {
    let provider = MemoryProvider::new("token-0");
    provider.inject_always(FaultPoint::Head, Fault::ExpiredToken);
    let session = Arc::new(RotatingSession::new());
    let config = fast_config().max_retries(10).max_renewals(2).build().unwrap();
    let client = common::client(&provider, config, session.clone());

    let err = client.get_object_metadata(BUCKET, "k").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Fatal);
    assert_eq!(session.issued(), 2);
    assert_eq!(provider.attempts(FaultPoint::Head), 3);
}

#[tokio::test]
async fn test_failed_session_renewal_is_fatal() {
    let provider = MemoryProvider::new("token-0");
    provider.revoke_token("token-0");
    let session = Arc::new(RotatingSession::failing());
    let config = fast_config().build().unwrap();
    let client = common::client(&provider, config, session.clone());

    let err = client.get_object_metadata(BUCKET, "k").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Fatal);
    assert!(err.to_string().contains("credential renewal failed"));
    assert_eq!(session.issued(), 1);
    assert_eq!(provider.renewals(), 0);
}

#[test]
fn test_policy_decisions_are_values() {
    let policy = RetryPolicy::new(1, Duration::from_millis(10), 2);
    let state = cloud_stage::retry::RetryState::new();
    assert_eq!(
        policy.evaluate(ErrorKind::ThrottledOrTransient, &state),
        RetryDecision::Backoff(Duration::from_millis(10))
    );
    assert_eq!(
        policy.evaluate(ErrorKind::ExpiredCredentials, &state),
        RetryDecision::Renew
    );
    assert_eq!(policy.evaluate(ErrorKind::NotFound, &state), RetryDecision::Fail);
}
