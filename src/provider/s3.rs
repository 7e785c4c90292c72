//! Amazon S3 provider

use async_trait::async_trait;
use aws_config::meta::region::RegionProviderChain;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart as AwsCompletedPart};
use aws_sdk_s3::Client as AwsS3Client;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use super::{Capabilities, CompletedPart, ListPage, ProviderKind, StorageProvider};
use crate::credentials::{keys, StageCredentials};
use crate::error::{ErrorKind, ProviderError, ProviderResult};
use crate::metadata::{ObjectMetadata, ObjectSummary};

const PROVIDER: &str = "s3";
const PROVIDER_NAME: &str = "cloud-stage";
const OPERATION_TIMEOUT: Duration = Duration::from_secs(300);

/// Connection settings of an S3 stage
#[derive(Debug, Clone, Default)]
pub struct S3Settings {
    pub region: Option<String>,

    /// Custom endpoint for S3-compatible services (MinIO, LocalStack)
    pub endpoint: Option<String>,

    /// Path-style addressing, required by most S3-compatible services
    pub force_path_style: bool,
}

/// S3 provider backed by `aws-sdk-s3`
///
/// SDK retries are disabled; the storage client owns the retry loop.
#[derive(Clone)]
pub struct S3Provider {
    client: AwsS3Client,
    /// Config the client was built from, reused when credentials rotate
    base: aws_sdk_s3::Config,
    /// Session credentials (`AWS_TOKEN`) are in use and can expire
    temporary: bool,
}

impl fmt::Debug for S3Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Provider")
            .field("region", &self.base.region())
            .field("temporary", &self.temporary)
            .finish()
    }
}

impl S3Provider {
    /// Build an S3 provider from settings and stage credentials
    ///
    /// # Errors
    ///
    /// Fails with a `Malformed` hint when `AWS_KEY_ID` or `AWS_SECRET_KEY`
    /// is missing.
    pub async fn connect(
        settings: S3Settings,
        credentials: &StageCredentials,
    ) -> ProviderResult<Self> {
        let credentials = sdk_credentials(credentials)?;
        let temporary = credentials.session_token().is_some();

        let region_provider = match &settings.region {
            Some(region) => RegionProviderChain::first_try(Region::new(region.clone())),
            None => RegionProviderChain::default_provider().or_else(Region::new("us-east-1")),
        };

        let sdk_config = aws_config::defaults(BehaviorVersion::latest())
            .region(region_provider)
            .credentials_provider(credentials)
            .retry_config(aws_config::retry::RetryConfig::disabled())
            .load()
            .await;

        let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config);
        if let Some(endpoint) = &settings.endpoint {
            builder = builder.endpoint_url(endpoint);
        }
        if settings.force_path_style {
            builder = builder.force_path_style(true);
        }
        let timeout_config = aws_sdk_s3::config::timeout::TimeoutConfig::builder()
            .operation_timeout(OPERATION_TIMEOUT)
            .build();
        let base = builder.timeout_config(timeout_config).build();

        tracing::debug!(
            region = ?base.region(),
            endpoint = ?settings.endpoint,
            "Built S3 client"
        );
        Ok(Self {
            client: AwsS3Client::from_conf(base.clone()),
            base,
            temporary,
        })
    }
}

fn sdk_credentials(credentials: &StageCredentials) -> ProviderResult<Credentials> {
    let key_id = credentials
        .require(keys::AWS_KEY_ID)
        .map_err(|e| ProviderError::missing_credential(PROVIDER, &e.0))?;
    let secret = credentials
        .require(keys::AWS_SECRET_KEY)
        .map_err(|e| ProviderError::missing_credential(PROVIDER, &e.0))?;
    let token = credentials.get(keys::AWS_TOKEN).map(str::to_string);
    Ok(Credentials::new(key_id, secret, token, None, PROVIDER_NAME))
}

/// Convert an SDK failure, keeping its error code and HTTP status
fn sdk_error<E>(error: SdkError<E>) -> ProviderError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let status = error.raw_response().map(|r| r.status().as_u16());
    let code = error.code().map(str::to_string);
    let message = error
        .message()
        .map(str::to_string)
        .unwrap_or_else(|| DisplayErrorContext(&error).to_string());
    let transport = matches!(
        error,
        SdkError::DispatchFailure(_) | SdkError::TimeoutError(_) | SdkError::ResponseError(_)
    );

    let mut converted = ProviderError::new(PROVIDER, message);
    if let Some(code) = code {
        converted = converted.with_code(code);
    }
    if let Some(status) = status {
        converted = converted.with_status(status);
    }
    if transport {
        converted = converted.with_hint(ErrorKind::ThrottledOrTransient);
    }
    converted.with_source(error)
}

/// HEAD responses have no body, so an expired session token arrives as a
/// bare 400 or 403 without an error code
fn head_error(error: ProviderError, temporary: bool) -> ProviderError {
    let bare = error.code.is_none() && error.kind_hint.is_none();
    if temporary && bare && matches!(error.status, Some(400 | 403)) {
        error.with_hint(ErrorKind::ExpiredCredentials)
    } else {
        error
    }
}

fn to_chrono(dt: &aws_sdk_s3::primitives::DateTime) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(dt.secs(), dt.subsec_nanos())
}

#[async_trait]
impl StorageProvider for S3Provider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::S3
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::FULL
    }

    async fn renewed(
        &self,
        credentials: &StageCredentials,
    ) -> ProviderResult<Arc<dyn StorageProvider>> {
        let credentials = sdk_credentials(credentials)?;
        let temporary = credentials.session_token().is_some();
        let base = self
            .base
            .to_builder()
            .credentials_provider(credentials)
            .build();
        Ok(Arc::new(S3Provider {
            client: AwsS3Client::from_conf(base.clone()),
            base,
            temporary,
        }))
    }

    async fn list_page(
        &self,
        location: &str,
        prefix: &str,
        token: Option<&str>,
    ) -> ProviderResult<ListPage> {
        let response = self
            .client
            .list_objects_v2()
            .bucket(location)
            .prefix(prefix)
            .set_continuation_token(token.map(str::to_string))
            .send()
            .await
            .map_err(sdk_error)?;

        let summaries = response
            .contents()
            .iter()
            .filter_map(|obj| {
                Some(ObjectSummary {
                    location: location.to_string(),
                    key: obj.key()?.to_string(),
                    size: obj.size().unwrap_or(0).max(0) as u64,
                    last_modified: obj.last_modified().and_then(to_chrono),
                    etag: obj.e_tag().map(str::to_string),
                })
            })
            .collect();

        let next_token = if response.is_truncated().unwrap_or(false) {
            response.next_continuation_token().map(str::to_string)
        } else {
            None
        };
        Ok(ListPage {
            summaries,
            next_token,
        })
    }

    async fn head_object(&self, location: &str, key: &str) -> ProviderResult<ObjectMetadata> {
        let response = self
            .client
            .head_object()
            .bucket(location)
            .key(key)
            .send()
            .await
            .map_err(|e| head_error(sdk_error(e), self.temporary))?;

        let user: BTreeMap<String, String> = response
            .metadata()
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();
        let (user_metadata, encryption) = ObjectMetadata::split_user_metadata(user)
            .map_err(|e| ProviderError::new(PROVIDER, e).with_hint(ErrorKind::Fatal))?;

        Ok(ObjectMetadata {
            content_length: response.content_length().unwrap_or(0).max(0) as u64,
            content_type: response.content_type().map(str::to_string),
            content_encoding: response.content_encoding().map(str::to_string),
            user_metadata,
            encryption,
            etag: response.e_tag().map(str::to_string),
            last_modified: response.last_modified().and_then(to_chrono),
        })
    }

    async fn get_range(
        &self,
        location: &str,
        key: &str,
        range: Option<Range<u64>>,
    ) -> ProviderResult<Bytes> {
        let header = range.map(|r| format!("bytes={}-{}", r.start, r.end.saturating_sub(1)));
        let response = self
            .client
            .get_object()
            .bucket(location)
            .key(key)
            .set_range(header)
            .send()
            .await
            .map_err(sdk_error)?;

        let body = response.body.collect().await.map_err(|e| {
            ProviderError::new(PROVIDER, format!("failed to read response body: {}", e))
                .with_hint(ErrorKind::ThrottledOrTransient)
                .with_source(e)
        })?;
        Ok(body.into_bytes())
    }

    async fn put_object(
        &self,
        location: &str,
        key: &str,
        data: Bytes,
        metadata: &ObjectMetadata,
    ) -> ProviderResult<()> {
        let user: HashMap<String, String> = metadata.amz_user_metadata().into_iter().collect();
        self.client
            .put_object()
            .bucket(location)
            .key(key)
            .body(ByteStream::from(data))
            .set_content_type(metadata.content_type.clone())
            .set_content_encoding(metadata.content_encoding.clone())
            .set_metadata(Some(user))
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(())
    }

    async fn create_multipart(
        &self,
        location: &str,
        key: &str,
        metadata: &ObjectMetadata,
    ) -> ProviderResult<String> {
        let user: HashMap<String, String> = metadata.amz_user_metadata().into_iter().collect();
        let response = self
            .client
            .create_multipart_upload()
            .bucket(location)
            .key(key)
            .set_content_type(metadata.content_type.clone())
            .set_content_encoding(metadata.content_encoding.clone())
            .set_metadata(Some(user))
            .send()
            .await
            .map_err(sdk_error)?;

        response.upload_id().map(str::to_string).ok_or_else(|| {
            ProviderError::new(PROVIDER, "no upload id returned").with_hint(ErrorKind::Fatal)
        })
    }

    async fn upload_part(
        &self,
        location: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> ProviderResult<CompletedPart> {
        let response = self
            .client
            .upload_part()
            .bucket(location)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number as i32)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(sdk_error)?;

        let etag = response.e_tag().map(str::to_string).ok_or_else(|| {
            ProviderError::new(PROVIDER, format!("no etag returned for part {}", part_number))
                .with_hint(ErrorKind::ThrottledOrTransient)
        })?;
        Ok(CompletedPart { part_number, etag })
    }

    async fn complete_multipart(
        &self,
        location: &str,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> ProviderResult<()> {
        let completed: Vec<AwsCompletedPart> = parts
            .iter()
            .map(|p| {
                AwsCompletedPart::builder()
                    .part_number(p.part_number as i32)
                    .e_tag(&p.etag)
                    .build()
            })
            .collect();
        let upload = CompletedMultipartUpload::builder()
            .set_parts(Some(completed))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(location)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(upload)
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(())
    }

    async fn abort_multipart(
        &self,
        location: &str,
        key: &str,
        upload_id: &str,
    ) -> ProviderResult<()> {
        self.client
            .abort_multipart_upload()
            .bucket(location)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(())
    }

    async fn shutdown(&self) {
        // The SDK client owns no resources beyond its connection pool
        tracing::debug!("Releasing S3 client");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_sdk_s3::operation::head_object::HeadObjectError;

    fn credentials() -> StageCredentials {
        StageCredentials::new()
            .with(keys::AWS_KEY_ID, "AKIAEXAMPLE")
            .with(keys::AWS_SECRET_KEY, "secret")
            .with(keys::AWS_TOKEN, "session")
    }

    #[tokio::test]
    async fn test_connect_with_explicit_settings() {
        let settings = S3Settings {
            region: Some("us-west-2".to_string()),
            endpoint: Some("http://localhost:9000".to_string()),
            force_path_style: true,
        };
        let provider = S3Provider::connect(settings, &credentials()).await.unwrap();
        assert_eq!(provider.kind(), ProviderKind::S3);
        assert_eq!(provider.base.region().map(|r| r.as_ref()), Some("us-west-2"));
        assert!(provider.capabilities().multipart);
    }

    #[tokio::test]
    async fn test_missing_keys_are_malformed() {
        let creds = StageCredentials::new().with(keys::AWS_KEY_ID, "AKIA");
        let err = S3Provider::connect(S3Settings::default(), &creds)
            .await
            .unwrap_err();
        assert_eq!(err.kind_hint, Some(ErrorKind::Malformed));
        assert!(err.message.contains(keys::AWS_SECRET_KEY));
    }

    #[tokio::test]
    async fn test_renewed_keeps_region() {
        let settings = S3Settings {
            region: Some("eu-central-1".to_string()),
            ..Default::default()
        };
        let provider = S3Provider::connect(settings, &credentials()).await.unwrap();
        let renewed = provider.renewed(&credentials()).await.unwrap();
        assert_eq!(renewed.kind(), ProviderKind::S3);
        assert!(provider.renewed(&StageCredentials::new()).await.is_err());
    }

    #[test]
    fn test_timeout_is_transient() {
        let err: SdkError<HeadObjectError> = SdkError::timeout_error("request timed out");
        let converted = sdk_error(err);
        assert_eq!(converted.kind_hint, Some(ErrorKind::ThrottledOrTransient));
        assert_eq!(converted.provider, "s3");
    }

    #[test]
    fn test_bare_head_denial_with_session_token_renews() {
        let bare = || ProviderError::new(PROVIDER, "service error").with_status(403);
        let err = head_error(bare(), true);
        assert_eq!(crate::classify::classify(&err), ErrorKind::ExpiredCredentials);
        let err = head_error(ProviderError::new(PROVIDER, "bad request").with_status(400), true);
        assert_eq!(err.kind_hint, Some(ErrorKind::ExpiredCredentials));

        // Long-lived keys never expire, so a denial is final
        let err = head_error(bare(), false);
        assert_eq!(crate::classify::classify(&err), ErrorKind::Fatal);

        let err = head_error(bare().with_code("AccessDenied"), true);
        assert_eq!(err.kind_hint, None);
        let err = head_error(ProviderError::new(PROVIDER, "missing").with_status(404), true);
        assert_eq!(crate::classify::classify(&err), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_session_token_marks_credentials_temporary() {
        let settings = S3Settings {
            region: Some("us-east-1".to_string()),
            ..Default::default()
        };
        let provider = S3Provider::connect(settings.clone(), &credentials()).await.unwrap();
        assert!(provider.temporary);
        let long_lived = StageCredentials::new()
            .with(keys::AWS_KEY_ID, "AKIAEXAMPLE")
            .with(keys::AWS_SECRET_KEY, "secret");
        let renewed = provider.renewed(&long_lived).await.unwrap();
        assert!(format!("{:?}", renewed).contains("temporary: false"));
        let provider = S3Provider::connect(settings, &long_lived).await.unwrap();
        assert!(!provider.temporary);
    }

    #[test]
    fn test_construction_failure_is_not_hinted() {
        let err: SdkError<HeadObjectError> = SdkError::construction_failure("bad input");
        let converted = sdk_error(err);
        assert_eq!(converted.kind_hint, None);
        assert_eq!(crate::classify::classify(&converted), ErrorKind::Fatal);
    }
}
