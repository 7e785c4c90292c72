//! Shared helpers for the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use cloud_stage::credentials::{keys, SessionError};
use cloud_stage::provider::MemoryProvider;
use cloud_stage::{ClientConfig, EncryptionConfig, StageCredentials, StageSession, StorageClient};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const BUCKET: &str = "stage-bucket";

/// Session that issues a new memory token on every renewal
#[derive(Debug, Default)]
pub struct RotatingSession {
    issued: AtomicU32,
    fail: bool,
}

impl RotatingSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Session whose renewals always fail
    pub fn failing() -> Self {
        Self {
            issued: AtomicU32::new(0),
            fail: true,
        }
    }

    /// Renewals requested so far
    pub fn issued(&self) -> u32 {
        self.issued.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StageSession for RotatingSession {
    fn session_id(&self) -> &str {
        "rotating"
    }

    async fn fresh_credentials(&self, _command: &str) -> Result<StageCredentials, SessionError> {
        let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail {
            return Err("session expired".into());
        }
        Ok(StageCredentials::new().with(keys::MEMORY_TOKEN, format!("token-{}", n)))
    }
}

/// Retry settings that keep tests fast: 1 ms minimum, no jitter
pub fn fast_config() -> cloud_stage::config::ClientConfigBuilder {
    ClientConfig::builder()
        .retry_backoff_min(Duration::from_millis(1))
        .jitter(false)
}

pub fn client(
    provider: &MemoryProvider,
    config: ClientConfig,
    session: Arc<dyn StageSession>,
) -> StorageClient {
    StorageClient::new(&config, Arc::new(provider.clone()), session).unwrap()
}

/// Client over `provider` with fast retries and a rotating session
pub fn fast_client(provider: &MemoryProvider, max_retries: u32) -> (StorageClient, Arc<RotatingSession>) {
    let session = Arc::new(RotatingSession::new());
    let config = fast_config().max_retries(max_retries).build().unwrap();
    (client(provider, config, session.clone()), session)
}

/// Small transfer sizes so multipart and ranged paths run on tiny payloads
pub fn chunked_config(part_size: usize, multipart_threshold: usize, range_size: usize) -> ClientConfig {
    fast_config()
        .max_retries(3)
        .part_size(part_size)
        .multipart_threshold(multipart_threshold)
        .range_size(range_size)
        .build()
        .unwrap()
}

pub fn encryption(key_size: u32) -> EncryptionConfig {
    let key: Vec<u8> = (0..key_size / 8).map(|i| (i * 7 + 3) as u8).collect();
    let mut config = EncryptionConfig::new(&key);
    config.query_id = Some("01b2c3d4-0000-1111-2222-333344445555".to_string());
    config.smk_id = Some(4711);
    config
}

/// Deterministic, non-repeating-looking test payload
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 31 + i / 251) % 256) as u8).collect()
}
