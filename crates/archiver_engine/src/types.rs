use std::fmt;
use std::net::IpAddr;

use archiver_core::{ArchiveId, ArchiveState, Failure, FailureReason, LinkId, Stage};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchOutput {
    pub bytes: Vec<u8>,
    pub metadata: FetchMetadata,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchMetadata {
    pub original_url: String,
    pub final_url: String,
    pub status: u16,
    pub redirect_count: usize,
    pub content_type: Option<String>,
    pub byte_len: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct FetchError {
    pub kind: FetchFailure,
    pub message: String,
}

impl FetchError {
    pub(crate) fn new(kind: FetchFailure, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchFailure {
    InvalidUrl,
    InvalidScheme { scheme: String },
    BlockedAddress { host: String, ip: IpAddr },
    HttpStatus(u16),
    Timeout,
    TooManyRedirects { max: usize },
    SizeLimitExceeded { max_bytes: u64, actual: Option<u64> },
    UnsupportedContentType { content_type: String },
    ConnectionFailed,
}

impl FetchFailure {
    pub fn reason(&self) -> FailureReason {
        match self {
            FetchFailure::InvalidUrl => FailureReason::InvalidFormat,
            FetchFailure::InvalidScheme { .. } => FailureReason::InvalidScheme,
            FetchFailure::BlockedAddress { .. } => FailureReason::PrivateIpBlocked,
            FetchFailure::HttpStatus(_) => FailureReason::HttpStatus,
            FetchFailure::Timeout => FailureReason::Timeout,
            FetchFailure::TooManyRedirects { .. } => FailureReason::TooManyRedirects,
            FetchFailure::SizeLimitExceeded { .. } => FailureReason::SizeLimitExceeded,
            FetchFailure::UnsupportedContentType { .. } => FailureReason::UnsupportedContentType,
            FetchFailure::ConnectionFailed => FailureReason::ConnectionFailed,
        }
    }
}

impl fmt::Display for FetchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchFailure::InvalidUrl => write!(f, "invalid url"),
            FetchFailure::InvalidScheme { scheme } => write!(f, "invalid scheme {scheme}"),
            FetchFailure::BlockedAddress { host, ip } => {
                write!(f, "blocked address {ip} for {host}")
            }
            FetchFailure::HttpStatus(code) => write!(f, "http status {code}"),
            FetchFailure::Timeout => write!(f, "timeout"),
            FetchFailure::TooManyRedirects { max } => write!(f, "more than {max} redirects"),
            FetchFailure::SizeLimitExceeded { max_bytes, actual } => {
                write!(f, "response too large (max {max_bytes}, actual {actual:?})")
            }
            FetchFailure::UnsupportedContentType { content_type } => {
                write!(f, "unsupported content type {content_type}")
            }
            FetchFailure::ConnectionFailed => write!(f, "connection failed"),
        }
    }
}

impl From<FetchError> for Failure {
    fn from(err: FetchError) -> Self {
        let failure = Failure::new(err.kind.reason(), err.to_string()).at_stage(Stage::Fetch);
        match err.kind {
            FetchFailure::HttpStatus(status) => failure.with_http_status(status),
            FetchFailure::BlockedAddress { ip, .. } => failure.with_resolved_ip(ip),
            _ => failure,
        }
    }
}

/// Pipeline step a running job is in, reported through [`ArchiveEvent::Progress`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    Validating,
    Fetching,
    Extracting,
    Sanitizing,
    Persisting,
}

/// Notifications broadcast to subscribers of the archiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveEvent {
    Progress {
        archive_id: ArchiveId,
        stage: PipelineStage,
    },
    StateChanged {
        archive_id: ArchiveId,
        link_id: LinkId,
        from: ArchiveState,
        to: ArchiveState,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_time_block_is_attributed_to_fetch() {
        let ip: IpAddr = "10.0.0.7".parse().unwrap();
        let err = FetchError::new(
            FetchFailure::BlockedAddress {
                host: "internal.test".to_string(),
                ip,
            },
            "redirect refused",
        );
        let failure = Failure::from(err);
        assert_eq!(failure.reason, FailureReason::PrivateIpBlocked);
        assert_eq!(failure.stage, Stage::Fetch);
        assert_eq!(failure.resolved_ip, Some(ip));
    }

    #[test]
    fn fetch_scheme_and_format_errors_stay_in_fetch() {
        let scheme = Failure::from(FetchError::new(
            FetchFailure::InvalidScheme {
                scheme: "ftp".to_string(),
            },
            "redirect to ftp",
        ));
        assert_eq!(scheme.stage, Stage::Fetch);
        let url = Failure::from(FetchError::new(FetchFailure::InvalidUrl, "bad url"));
        assert_eq!((url.reason, url.stage), (FailureReason::InvalidFormat, Stage::Fetch));
    }
}
