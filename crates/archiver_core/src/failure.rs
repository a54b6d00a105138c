use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Pipeline stage a failure is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Validation,
    Fetch,
    Extraction,
    Sanitization,
    Orchestration,
}

impl Stage {
    pub const fn as_str(self) -> &'static str {
        match self {
            Stage::Validation => "validation",
            Stage::Fetch => "fetch",
            Stage::Extraction => "extraction",
            Stage::Sanitization => "sanitization",
            Stage::Orchestration => "orchestration",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Machine-readable failure reason recorded in the transition log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    InvalidFormat,
    InvalidScheme,
    DnsResolutionFailed,
    PrivateIpBlocked,
    SizeLimitExceeded,
    TooManyRedirects,
    ConnectionFailed,
    Timeout,
    HttpStatus,
    UnsupportedContentType,
    MetadataExtractionFailed,
    MainContentExtractionFailed,
    SanitizationFailed,
    Cancelled,
}

impl FailureReason {
    pub const ALL: [FailureReason; 14] = [
        FailureReason::InvalidFormat,
        FailureReason::InvalidScheme,
        FailureReason::DnsResolutionFailed,
        FailureReason::PrivateIpBlocked,
        FailureReason::SizeLimitExceeded,
        FailureReason::TooManyRedirects,
        FailureReason::ConnectionFailed,
        FailureReason::Timeout,
        FailureReason::HttpStatus,
        FailureReason::UnsupportedContentType,
        FailureReason::MetadataExtractionFailed,
        FailureReason::MainContentExtractionFailed,
        FailureReason::SanitizationFailed,
        FailureReason::Cancelled,
    ];

    pub const fn code(self) -> &'static str {
        match self {
            FailureReason::InvalidFormat => "invalid_format",
            FailureReason::InvalidScheme => "invalid_scheme",
            FailureReason::DnsResolutionFailed => "dns_resolution_failed",
            FailureReason::PrivateIpBlocked => "private_ip_blocked",
            FailureReason::SizeLimitExceeded => "size_limit_exceeded",
            FailureReason::TooManyRedirects => "too_many_redirects",
            FailureReason::ConnectionFailed => "connection_failed",
            FailureReason::Timeout => "timeout",
            FailureReason::HttpStatus => "http_status",
            FailureReason::UnsupportedContentType => "unsupported_content_type",
            FailureReason::MetadataExtractionFailed => "metadata_extraction_failed",
            FailureReason::MainContentExtractionFailed => "main_content_extraction_failed",
            FailureReason::SanitizationFailed => "sanitization_failed",
            FailureReason::Cancelled => "cancelled",
        }
    }

    /// Stage a reason usually comes from; boundaries override it where the
    /// same reason can surface later in the pipeline.
    pub const fn default_stage(self) -> Stage {
        match self {
            FailureReason::InvalidFormat
            | FailureReason::InvalidScheme
            | FailureReason::DnsResolutionFailed
            | FailureReason::PrivateIpBlocked => Stage::Validation,
            FailureReason::SizeLimitExceeded
            | FailureReason::TooManyRedirects
            | FailureReason::ConnectionFailed
            | FailureReason::Timeout
            | FailureReason::HttpStatus
            | FailureReason::UnsupportedContentType => Stage::Fetch,
            FailureReason::MetadataExtractionFailed
            | FailureReason::MainContentExtractionFailed => Stage::Extraction,
            FailureReason::SanitizationFailed => Stage::Sanitization,
            FailureReason::Cancelled => Stage::Orchestration,
        }
    }

    /// Only transient network conditions are worth another attempt.
    pub const fn is_retryable(self) -> bool {
        matches!(
            self,
            FailureReason::ConnectionFailed | FailureReason::Timeout
        )
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown failure reason `{0}`")]
pub struct UnknownReason(pub String);

impl FromStr for FailureReason {
    type Err = UnknownReason;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FailureReason::ALL
            .into_iter()
            .find(|reason| reason.code() == s)
            .ok_or_else(|| UnknownReason(s.to_string()))
    }
}

/// A stage failure translated at its boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub reason: FailureReason,
    pub stage: Stage,
    pub detail: String,
    pub http_status: Option<u16>,
    pub resolved_ip: Option<IpAddr>,
}

impl Failure {
    pub fn new(reason: FailureReason, detail: impl Into<String>) -> Self {
        Self {
            reason,
            stage: reason.default_stage(),
            detail: detail.into(),
            http_status: None,
            resolved_ip: None,
        }
    }

    pub fn cancelled(detail: impl Into<String>) -> Self {
        Self::new(FailureReason::Cancelled, detail)
    }

    pub fn at_stage(mut self, stage: Stage) -> Self {
        self.stage = stage;
        self
    }

    pub fn with_http_status(mut self, status: u16) -> Self {
        self.http_status = Some(status);
        self
    }

    pub fn with_resolved_ip(mut self, ip: IpAddr) -> Self {
        self.resolved_ip = Some(ip);
        self
    }

    /// Human-readable message stored in `Archive::error_message`.
    pub fn error_message(&self) -> String {
        format!("{} failed ({}): {}", self.stage, self.reason, self.detail)
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.error_message())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip() {
        for reason in FailureReason::ALL {
            assert_eq!(reason.code().parse::<FailureReason>(), Ok(reason));
        }
    }

    #[test]
    fn serde_uses_reason_codes() {
        let json = serde_json::to_string(&FailureReason::PrivateIpBlocked).unwrap();
        assert_eq!(json, "\"private_ip_blocked\"");
    }

    #[test]
    fn only_transient_network_failures_retry() {
        let retryable: Vec<_> = FailureReason::ALL
            .into_iter()
            .filter(|reason| reason.is_retryable())
            .collect();
        assert_eq!(
            retryable,
            vec![FailureReason::ConnectionFailed, FailureReason::Timeout]
        );
    }

    #[test]
    fn error_message_names_stage_and_reason() {
        let failure = Failure::new(FailureReason::HttpStatus, "404 Not Found").with_http_status(404);
        assert_eq!(
            failure.error_message(),
            "fetch failed (http_status): 404 Not Found"
        );
    }

    #[test]
    fn boundary_stage_overrides_reason_default() {
        let failure = Failure::new(FailureReason::PrivateIpBlocked, "redirected to 10.0.0.7");
        assert_eq!(failure.stage, Stage::Validation);

        let failure = failure.at_stage(Stage::Fetch);
        assert_eq!(failure.stage, Stage::Fetch);
        assert_eq!(
            failure.error_message(),
            "fetch failed (private_ip_blocked): redirected to 10.0.0.7"
        );
    }
}
