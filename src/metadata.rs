//! Provider-neutral object metadata and listing types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// User metadata keys used on S3 for client-side encryption
pub const AMZ_KEY: &str = "x-amz-key";
pub const AMZ_IV: &str = "x-amz-iv";
pub const AMZ_MATDESC: &str = "x-amz-matdesc";

/// User metadata keys used on Azure Blob and GCS for client-side encryption
pub const ENCRYPTION_DATA: &str = "encryptiondata";
pub const MATDESC: &str = "matdesc";

/// Material descriptor recorded next to every encrypted object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaterialDescriptor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub smk_id: Option<u64>,

    /// File key size in bits
    pub key_size: u32,
}

/// Encryption parameters of one object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionMetadata {
    /// Base64 file key, wrapped with the stage master key
    pub key: String,

    /// Base64 initialization vector of the payload cipher
    pub iv: String,

    pub material: MaterialDescriptor,
}

/// `encryptiondata` document stored on Azure Blob and GCS objects
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct EncryptionData {
    encryption_mode: String,
    wrapped_content_key: WrappedContentKey,
    encryption_agent: EncryptionAgent,
    #[serde(rename = "ContentEncryptionIV")]
    content_encryption_iv: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WrappedContentKey {
    key_id: String,
    encrypted_key: String,
    algorithm: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct EncryptionAgent {
    protocol: String,
    encryption_algorithm: String,
}

impl EncryptionMetadata {
    pub fn key_size(&self) -> u32 {
        self.material.key_size
    }

    /// S3 style: three user metadata entries
    pub fn to_amz_entries(&self) -> Vec<(String, String)> {
        vec![
            (AMZ_KEY.to_string(), self.key.clone()),
            (AMZ_IV.to_string(), self.iv.clone()),
            (AMZ_MATDESC.to_string(), material_json(&self.material)),
        ]
    }

    /// Read S3 style entries; `None` when the object is not encrypted
    pub fn from_amz_entries(user: &BTreeMap<String, String>) -> Option<Result<Self, String>> {
        let key = user.get(AMZ_KEY)?;
        Some(Self::assemble(key, user.get(AMZ_IV), user.get(AMZ_MATDESC)))
    }

    /// Azure/GCS style: an `encryptiondata` JSON document plus `matdesc`
    pub fn to_blob_entries(&self) -> Vec<(String, String)> {
        let data = EncryptionData {
            encryption_mode: "FullBlob".to_string(),
            wrapped_content_key: WrappedContentKey {
                key_id: "symmKey1".to_string(),
                encrypted_key: self.key.clone(),
                algorithm: "AES_CBC_256".to_string(),
            },
            encryption_agent: EncryptionAgent {
                protocol: "1.0".to_string(),
                encryption_algorithm: format!("AES_CBC_{}", self.material.key_size),
            },
            content_encryption_iv: self.iv.clone(),
        };
        let document = serde_json::to_string(&data).unwrap_or_default();
        vec![
            (ENCRYPTION_DATA.to_string(), document),
            (MATDESC.to_string(), material_json(&self.material)),
        ]
    }

    /// Read Azure/GCS style entries; `None` when the object is not encrypted
    pub fn from_blob_entries(user: &BTreeMap<String, String>) -> Option<Result<Self, String>> {
        let document = user.get(ENCRYPTION_DATA)?;
        let data: EncryptionData = match serde_json::from_str(document) {
            Ok(data) => data,
            Err(e) => return Some(Err(format!("invalid {}: {}", ENCRYPTION_DATA, e))),
        };
        Some(Self::assemble(
            &data.wrapped_content_key.encrypted_key,
            Some(&data.content_encryption_iv),
            user.get(MATDESC),
        ))
    }

    fn assemble(
        key: &str,
        iv: Option<&String>,
        matdesc: Option<&String>,
    ) -> Result<Self, String> {
        let iv = iv.ok_or_else(|| "encryption IV is missing".to_string())?;
        let matdesc = matdesc.ok_or_else(|| "material descriptor is missing".to_string())?;
        let material: MaterialDescriptor = serde_json::from_str(matdesc)
            .map_err(|e| format!("invalid material descriptor: {}", e))?;
        Ok(Self {
            key: key.to_string(),
            iv: iv.clone(),
            material,
        })
    }
}

fn material_json(material: &MaterialDescriptor) -> String {
    serde_json::to_string(material).unwrap_or_default()
}

/// Provider-neutral description of one stored object
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMetadata {
    /// Stored size in bytes (ciphertext size for encrypted objects)
    pub content_length: u64,

    pub content_type: Option<String>,

    pub content_encoding: Option<String>,

    /// User-defined metadata, encryption entries excluded
    pub user_metadata: BTreeMap<String, String>,

    pub encryption: Option<EncryptionMetadata>,

    pub etag: Option<String>,

    pub last_modified: Option<DateTime<Utc>>,
}

impl ObjectMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_content_encoding(mut self, encoding: impl Into<String>) -> Self {
        self.content_encoding = Some(encoding.into());
        self
    }

    pub fn with_user_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.user_metadata.insert(key.into(), value.into());
        self
    }

    pub fn is_encrypted(&self) -> bool {
        self.encryption.is_some()
    }

    /// Anything beyond the length that a provider has to persist
    pub fn has_stored_fields(&self) -> bool {
        self.content_type.is_some()
            || self.content_encoding.is_some()
            || !self.user_metadata.is_empty()
            || self.encryption.is_some()
    }

    /// User metadata plus S3 style encryption entries
    pub fn amz_user_metadata(&self) -> BTreeMap<String, String> {
        let mut user = self.user_metadata.clone();
        if let Some(encryption) = &self.encryption {
            user.extend(encryption.to_amz_entries());
        }
        user
    }

    /// User metadata plus Azure/GCS style encryption entries
    pub fn blob_user_metadata(&self) -> BTreeMap<String, String> {
        let mut user = self.user_metadata.clone();
        if let Some(encryption) = &self.encryption {
            user.extend(encryption.to_blob_entries());
        }
        user
    }

    /// Split raw user metadata into plain entries and encryption metadata
    ///
    /// Accepts either layout so objects written by one provider flavour can be
    /// read back through another.
    pub fn split_user_metadata(
        mut user: BTreeMap<String, String>,
    ) -> Result<(BTreeMap<String, String>, Option<EncryptionMetadata>), String> {
        let encryption = match EncryptionMetadata::from_amz_entries(&user)
            .or_else(|| EncryptionMetadata::from_blob_entries(&user))
        {
            Some(result) => Some(result?),
            None => None,
        };
        for key in [AMZ_KEY, AMZ_IV, AMZ_MATDESC, ENCRYPTION_DATA, MATDESC] {
            user.remove(key);
        }
        Ok((user, encryption))
    }
}

/// One entry of a listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectSummary {
    /// Bucket or container the object lives in
    pub location: String,

    pub key: String,

    pub size: u64,

    pub last_modified: Option<DateTime<Utc>>,

    pub etag: Option<String>,
}

/// Complete listing result, in provider page order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectSummaryCollection {
    summaries: Vec<ObjectSummary>,
}

impl ObjectSummaryCollection {
    pub fn new(summaries: Vec<ObjectSummary>) -> Self {
        Self { summaries }
    }

    pub fn len(&self) -> usize {
        self.summaries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.summaries.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ObjectSummary> {
        self.summaries.iter()
    }

    pub fn keys(&self) -> Vec<&str> {
        self.summaries.iter().map(|s| s.key.as_str()).collect()
    }

    pub fn total_size(&self) -> u64 {
        self.summaries.iter().map(|s| s.size).sum()
    }

    pub fn into_vec(self) -> Vec<ObjectSummary> {
        self.summaries
    }
}

impl IntoIterator for ObjectSummaryCollection {
    type Item = ObjectSummary;
    type IntoIter = std::vec::IntoIter<ObjectSummary>;

    fn into_iter(self) -> Self::IntoIter {
        self.summaries.into_iter()
    }
}

impl<'a> IntoIterator for &'a ObjectSummaryCollection {
    type Item = &'a ObjectSummary;
    type IntoIter = std::slice::Iter<'a, ObjectSummary>;

    fn into_iter(self) -> Self::IntoIter {
        self.summaries.iter()
    }
}
