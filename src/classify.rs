//! Provider error classification
//!
//! Maps provider error codes, HTTP statuses and, as a last resort, error
//! messages onto the small [`ErrorKind`] taxonomy the retry loop works with.
//! Providers that know better attach a `kind_hint` at the call site, which
//! always wins.

use crate::error::{ErrorKind, ProviderError};

/// Classify a provider error
pub fn classify(error: &ProviderError) -> ErrorKind {
    if let Some(kind) = error.kind_hint {
        return kind;
    }

    if let Some(kind) = error.code.as_deref().and_then(classify_code) {
        return kind;
    }

    if let Some(status) = error.status {
        return classify_status(status);
    }

    classify_message(&error.message)
}

/// Classify a provider error code (S3, Azure and GCS codes share a namespace here)
pub fn classify_code(code: &str) -> Option<ErrorKind> {
    let kind = match code {
        "ExpiredToken"
        | "ExpiredTokenException"
        | "TokenRefreshRequired"
        | "AuthenticationFailed"
        | "InvalidAuthenticationInfo" => ErrorKind::ExpiredCredentials,

        "NoSuchKey" | "NoSuchBucket" | "NoSuchUpload" | "NotFound" | "BlobNotFound"
        | "ContainerNotFound" => ErrorKind::NotFound,

        "SlowDown"
        | "Throttling"
        | "ThrottlingException"
        | "TooManyRequests"
        | "RequestTimeout"
        | "RequestTimeTooSkewed"
        | "ServiceUnavailable"
        | "InternalError"
        | "ServerBusy"
        | "OperationTimedOut" => ErrorKind::ThrottledOrTransient,

        "InvalidArgument" | "InvalidRequest" | "InvalidBucketName" | "KeyTooLongError"
        | "MetadataTooLarge" | "InvalidRange" => ErrorKind::Malformed,

        "AccessDenied" | "Forbidden" | "InvalidPart" | "InvalidPartOrder" | "EntityTooSmall"
        | "EntityTooLarge" => ErrorKind::Fatal,

        _ => return None,
    };
    Some(kind)
}

/// Classify a bare HTTP status
pub fn classify_status(status: u16) -> ErrorKind {
    match status {
        401 => ErrorKind::ExpiredCredentials,
        404 => ErrorKind::NotFound,
        408 | 429 => ErrorKind::ThrottledOrTransient,
        500..=599 => ErrorKind::ThrottledOrTransient,
        _ => ErrorKind::Fatal,
    }
}

/// Classify by message content when the provider exposed nothing structured
pub fn classify_message(message: &str) -> ErrorKind {
    let lower = message.to_lowercase();

    if lower.contains("expired") || lower.contains("token refresh") {
        return ErrorKind::ExpiredCredentials;
    }
    if let Some(status) = status_in_message(&lower) {
        return classify_status(status);
    }
    if lower.contains("timed out")
        || lower.contains("timeout")
        || lower.contains("connection reset")
        || lower.contains("connection refused")
        || lower.contains("connection closed")
        || lower.contains("broken pipe")
        || lower.contains("temporarily unavailable")
        || lower.contains("service unavailable")
        || lower.contains("internal server error")
        || lower.contains("bad gateway")
        || lower.contains("too many requests")
        || lower.contains("throttl")
        || lower.contains("slow down")
    {
        ErrorKind::ThrottledOrTransient
    } else if lower.contains("not found") {
        ErrorKind::NotFound
    } else {
        ErrorKind::Fatal
    }
}

/// HTTP status written shortly after "status" or "http"
///
/// Matches "status code: 503", "HTTP 429" and "status server error (500)";
/// other numbers in the text (keys, sizes) are ignored.
pub fn status_in_message(message: &str) -> Option<u16> {
    let lower = message.to_lowercase();
    ["status", "http"].iter().find_map(|marker| {
        lower.match_indices(marker).find_map(|(i, _)| {
            let rest = &lower[i + marker.len()..];
            // "https" or "statuses" are other words
            if rest.starts_with(|c: char| c.is_ascii_alphabetic()) {
                return None;
            }
            let start = rest.find(|c: char| c.is_ascii_digit())?;
            // Only accept a number close to the marker
            if start > 24 {
                return None;
            }
            let digits: String = rest[start..]
                .chars()
                .take_while(|c| c.is_ascii_digit())
                .collect();
            if digits.len() != 3 {
                return None;
            }
            digits.parse::<u16>().ok().filter(|s| (100..600).contains(s))
        })
    })
}
