use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use archiver_core::{Failure, FailureReason, Stage};
use archiver_logging::archiver_debug;
use url::{Host, Url};

use crate::{BlockList, Resolver};

/// A URL that passed every safety check, with the addresses it resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedUrl {
    pub url: Url,
    /// The input, unchanged.
    pub original: String,
    pub host: String,
    pub addresses: Vec<IpAddr>,
}

impl ValidatedUrl {
    pub fn primary_address(&self) -> Option<IpAddr> {
        self.addresses.first().copied()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("invalid url format: {0}")]
    InvalidFormat(String),
    #[error("unsupported url scheme `{0}`")]
    InvalidScheme(String),
    #[error("dns resolution failed for {host}: {message}")]
    DnsResolutionFailed { host: String, message: String },
    #[error("{host} resolves to blocked address {ip}")]
    PrivateIpBlocked { host: String, ip: IpAddr },
}

impl ValidationError {
    pub fn reason(&self) -> FailureReason {
        match self {
            ValidationError::InvalidFormat(_) => FailureReason::InvalidFormat,
            ValidationError::InvalidScheme(_) => FailureReason::InvalidScheme,
            ValidationError::DnsResolutionFailed { .. } => FailureReason::DnsResolutionFailed,
            ValidationError::PrivateIpBlocked { .. } => FailureReason::PrivateIpBlocked,
        }
    }
}

impl From<ValidationError> for Failure {
    fn from(err: ValidationError) -> Self {
        let failure = Failure::new(err.reason(), err.to_string()).at_stage(Stage::Validation);
        match err {
            ValidationError::PrivateIpBlocked { ip, .. } => failure.with_resolved_ip(ip),
            _ => failure,
        }
    }
}

/// Classifies a URL and rejects anything that resolves into a blocked range.
#[derive(Clone)]
pub struct UrlValidator {
    resolver: Arc<dyn Resolver>,
    block_list: Arc<BlockList>,
    dns_timeout: Duration,
}

impl UrlValidator {
    pub fn new(resolver: Arc<dyn Resolver>, block_list: Arc<BlockList>, dns_timeout: Duration) -> Self {
        Self {
            resolver,
            block_list,
            dns_timeout,
        }
    }

    /// Checks, in order: format, scheme, DNS resolution, block list.
    pub async fn validate(&self, raw: &str) -> Result<ValidatedUrl, ValidationError> {
        let url = Url::parse(raw.trim())
            .map_err(|err| ValidationError::InvalidFormat(err.to_string()))?;

        match url.scheme() {
            "http" | "https" => {}
            other => return Err(ValidationError::InvalidScheme(other.to_string())),
        }

        let host = url
            .host()
            .ok_or_else(|| ValidationError::InvalidFormat("url has no host".to_string()))?;
        let (host_name, addresses) = match host {
            Host::Ipv4(ip) => (ip.to_string(), vec![IpAddr::V4(ip)]),
            Host::Ipv6(ip) => (ip.to_string(), vec![IpAddr::V6(ip)]),
            Host::Domain(domain) => {
                let addresses = self.resolve(domain).await?;
                (domain.to_string(), addresses)
            }
        };

        if let Some(ip) = self.block_list.first_blocked(&addresses) {
            return Err(ValidationError::PrivateIpBlocked {
                host: host_name,
                ip,
            });
        }

        archiver_debug!("Validated {} -> {:?}", host_name, addresses);
        Ok(ValidatedUrl {
            url,
            original: raw.to_string(),
            host: host_name,
            addresses,
        })
    }

    async fn resolve(&self, domain: &str) -> Result<Vec<IpAddr>, ValidationError> {
        let failed = |message: String| ValidationError::DnsResolutionFailed {
            host: domain.to_string(),
            message,
        };
        let addresses = tokio::time::timeout(self.dns_timeout, self.resolver.resolve(domain))
            .await
            .map_err(|_| failed("lookup timed out".to_string()))?
            .map_err(|err| failed(err.to_string()))?;
        if addresses.is_empty() {
            return Err(failed("no A or AAAA records".to_string()));
        }
        Ok(addresses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StaticResolver;

    fn validator(resolver: StaticResolver) -> UrlValidator {
        UrlValidator::new(
            Arc::new(resolver),
            Arc::new(BlockList::default()),
            Duration::from_secs(1),
        )
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn malformed_input_is_invalid_format() {
        let err = validator(StaticResolver::new())
            .validate("not a url")
            .await
            .unwrap_err();
        assert_eq!(err.reason(), FailureReason::InvalidFormat);
    }

    #[tokio::test]
    async fn ftp_is_invalid_scheme() {
        let resolver = StaticResolver::new().with_host("example.com", [ip("93.184.216.34")]);
        let err = validator(resolver)
            .validate("ftp://example.com")
            .await
            .unwrap_err();
        assert_eq!(err, ValidationError::InvalidScheme("ftp".to_string()));
    }

    #[tokio::test]
    async fn file_and_javascript_schemes_are_rejected() {
        for url in ["file:///etc/passwd", "javascript:alert(1)", "mailto:a@example.com"] {
            let err = validator(StaticResolver::new()).validate(url).await.unwrap_err();
            assert_eq!(err.reason(), FailureReason::InvalidScheme, "{url}");
        }
    }

    #[tokio::test]
    async fn unknown_host_is_dns_failure() {
        let err = validator(StaticResolver::new())
            .validate("https://no-records.example/")
            .await
            .unwrap_err();
        assert_eq!(err.reason(), FailureReason::DnsResolutionFailed);
    }

    #[tokio::test]
    async fn empty_record_set_is_dns_failure() {
        let resolver = StaticResolver::new().with_host("empty.example", []);
        let err = validator(resolver)
            .validate("https://empty.example/")
            .await
            .unwrap_err();
        assert_eq!(err.reason(), FailureReason::DnsResolutionFailed);
    }

    #[tokio::test]
    async fn public_name_resolving_to_private_address_is_blocked() {
        let resolver = StaticResolver::new().with_host("innocent.example", [ip("10.0.0.7")]);
        let err = validator(resolver)
            .validate("https://innocent.example/admin")
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ValidationError::PrivateIpBlocked {
                host: "innocent.example".to_string(),
                ip: ip("10.0.0.7"),
            }
        );
        let failure = Failure::from(err);
        assert_eq!(failure.resolved_ip, Some(ip("10.0.0.7")));
    }

    #[tokio::test]
    async fn literal_private_addresses_are_blocked_for_both_schemes() {
        for url in [
            "http://192.168.1.50/internal",
            "https://127.0.0.1:8443/",
            "http://[::1]/",
            "http://169.254.169.254/latest/meta-data",
            "http://2130706433/",
        ] {
            let err = validator(StaticResolver::new()).validate(url).await.unwrap_err();
            assert_eq!(err.reason(), FailureReason::PrivateIpBlocked, "{url}");
        }
    }

    #[tokio::test]
    async fn unspecified_addresses_do_not_reach_the_local_host() {
        for url in ["http://0.0.0.0:8080/admin", "http://[::]/", "http://0/"] {
            let err = validator(StaticResolver::new()).validate(url).await.unwrap_err();
            assert_eq!(err.reason(), FailureReason::PrivateIpBlocked, "{url}");
        }
    }

    #[tokio::test]
    async fn validation_failures_are_attributed_to_validation() {
        let err = validator(StaticResolver::new())
            .validate("http://10.0.0.5/")
            .await
            .unwrap_err();
        assert_eq!(Failure::from(err).stage, Stage::Validation);
    }

    #[tokio::test]
    async fn valid_url_is_returned_unchanged() {
        let resolver = StaticResolver::new().with_host("example.com", [ip("93.184.216.34")]);
        let raw = "https://example.com/article?utm_source=feed";
        let validated = validator(resolver).validate(raw).await.unwrap();
        assert_eq!(validated.original, raw);
        assert_eq!(validated.url.as_str(), raw);
        assert_eq!(validated.primary_address(), Some(ip("93.184.216.34")));
    }
}
