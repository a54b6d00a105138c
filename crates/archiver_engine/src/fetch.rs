use std::error::Error as StdError;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};
use std::time::Duration;

use archiver_logging::{archiver_debug, archiver_info};
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, CONTENT_LENGTH, CONTENT_TYPE};
use url::{Host, Url};

use crate::resolve::{BlockedTarget, GuardedDnsResolver};
use crate::{ArchiverConfig, BlockList, FetchError, FetchFailure, FetchMetadata, FetchOutput, Resolver};

#[derive(Debug, Clone)]
pub struct FetchSettings {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub total_timeout: Duration,
    pub max_redirects: usize,
    pub max_bytes: u64,
    pub user_agent: String,
    pub allowed_content_types: Vec<String>,
}

impl Default for FetchSettings {
    fn default() -> Self {
        FetchSettings::from(&ArchiverConfig::default())
    }
}

impl From<&ArchiverConfig> for FetchSettings {
    fn from(config: &ArchiverConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout(),
            read_timeout: config.read_timeout(),
            total_timeout: config.fetch_timeout(),
            max_redirects: config.max_redirects,
            max_bytes: config.max_content_bytes,
            user_agent: config.user_agent(),
            allowed_content_types: config.allowed_content_types.clone(),
        }
    }
}

#[async_trait::async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchOutput, FetchError>;
}

/// HTTP fetcher whose every connection goes through the block list.
#[derive(Clone)]
pub struct ReqwestFetcher {
    settings: FetchSettings,
    resolver: Arc<dyn Resolver>,
    block_list: Arc<BlockList>,
}

/// Per-request bookkeeping shared with the redirect policy and DNS guard.
#[derive(Default)]
struct RequestState {
    redirects: AtomicUsize,
    blocked: Arc<Mutex<Option<BlockedTarget>>>,
    bad_scheme: Mutex<Option<String>>,
}

impl RequestState {
    fn blocked_target(&self) -> Option<BlockedTarget> {
        self.blocked.lock().ok().and_then(|slot| slot.clone())
    }

    fn bad_scheme(&self) -> Option<String> {
        self.bad_scheme.lock().ok().and_then(|slot| slot.clone())
    }

    /// Forgets what the HEAD probe observed before the real request.
    fn reset(&self) {
        self.redirects.store(0, Ordering::Relaxed);
        if let Ok(mut slot) = self.blocked.lock() {
            *slot = None;
        }
        if let Ok(mut slot) = self.bad_scheme.lock() {
            *slot = None;
        }
    }
}

impl ReqwestFetcher {
    pub fn new(settings: FetchSettings, resolver: Arc<dyn Resolver>, block_list: Arc<BlockList>) -> Self {
        Self {
            settings,
            resolver,
            block_list,
        }
    }

    pub fn settings(&self) -> &FetchSettings {
        &self.settings
    }

    fn build_client(&self, state: Arc<RequestState>) -> Result<reqwest::Client, FetchError> {
        let max_redirects = self.settings.max_redirects;
        let block_list = Arc::clone(&self.block_list);
        let policy_state = Arc::clone(&state);
        let policy = reqwest::redirect::Policy::custom(move |attempt| {
            let count = attempt.previous().len();
            policy_state.redirects.store(count, Ordering::Relaxed);
            if count > max_redirects {
                return attempt.error("redirect limit exceeded");
            }
            let next = attempt.url();
            if !matches!(next.scheme(), "http" | "https") {
                if let Ok(mut slot) = policy_state.bad_scheme.lock() {
                    *slot = Some(next.scheme().to_string());
                }
                return attempt.error("redirect to unsupported scheme");
            }
            if let Some(ip) = literal_ip(next) {
                if block_list.is_blocked(ip) {
                    if let Ok(mut slot) = policy_state.blocked.lock() {
                        *slot = Some(BlockedTarget {
                            host: ip.to_string(),
                            ip,
                        });
                    }
                    return attempt.error("redirect to blocked address");
                }
            }
            attempt.follow()
        });

        let resolver = GuardedDnsResolver::new(
            Arc::clone(&self.resolver),
            Arc::clone(&self.block_list),
            self.settings.connect_timeout,
            Arc::clone(&state.blocked),
        );

        reqwest::Client::builder()
            .connect_timeout(self.settings.connect_timeout)
            .read_timeout(self.settings.read_timeout)
            .timeout(self.settings.total_timeout)
            .redirect(policy)
            .user_agent(self.settings.user_agent.clone())
            .dns_resolver(Arc::new(resolver))
            .no_proxy()
            .build()
            .map_err(|err| FetchError::new(FetchFailure::ConnectionFailed, err.to_string()))
    }

    fn is_content_type_allowed(&self, content_type: &str) -> bool {
        let ct = content_type.split(';').next().unwrap_or(content_type).trim();
        self.settings
            .allowed_content_types
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(ct))
    }

    fn too_large(&self, actual: Option<u64>) -> FetchError {
        FetchError::new(
            FetchFailure::SizeLimitExceeded {
                max_bytes: self.settings.max_bytes,
                actual,
            },
            "response too large",
        )
    }

    /// HEAD probe. Any failure here is ignored; some servers reject HEAD.
    async fn probe_content_length(&self, client: &reqwest::Client, url: &Url) -> Option<u64> {
        match client.head(url.clone()).send().await {
            Ok(response) if response.status().is_success() => {
                header_content_length(response.headers())
            }
            Ok(response) => {
                archiver_debug!("HEAD {} answered {}", url, response.status());
                None
            }
            Err(err) => {
                archiver_debug!("HEAD {} failed: {}", url, err);
                None
            }
        }
    }
}

#[async_trait::async_trait]
impl Fetcher for ReqwestFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchOutput, FetchError> {
        let deadline = self.settings.total_timeout;
        match tokio::time::timeout(deadline, self.fetch_within_deadline(url)).await {
            Ok(result) => result,
            Err(_) => {
                archiver_info!("Fetch of {} exceeded {:?}", url, deadline);
                Err(FetchError::new(
                    FetchFailure::Timeout,
                    format!("fetch did not finish within {deadline:?}"),
                ))
            }
        }
    }
}

impl ReqwestFetcher {
    async fn fetch_within_deadline(&self, url: &str) -> Result<FetchOutput, FetchError> {
        let parsed =
            Url::parse(url).map_err(|err| FetchError::new(FetchFailure::InvalidUrl, err.to_string()))?;
        let state = Arc::new(RequestState::default());
        let client = self.build_client(Arc::clone(&state))?;

        if let Some(advertised) = self.probe_content_length(&client, &parsed).await {
            if advertised > self.settings.max_bytes {
                archiver_info!(
                    "Skipping {}: advertised {} bytes exceeds {}",
                    url,
                    advertised,
                    self.settings.max_bytes
                );
                return Err(self.too_large(Some(advertised)));
            }
        }
        state.reset();

        let response = client
            .get(parsed)
            .send()
            .await
            .map_err(|err| map_reqwest_error(err, &state, self.settings.max_redirects))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::new(
                FetchFailure::HttpStatus(status.as_u16()),
                status.to_string(),
            ));
        }

        if let Some(content_len) = header_content_length(response.headers()) {
            if content_len > self.settings.max_bytes {
                return Err(self.too_large(Some(content_len)));
            }
        }

        let final_url = response.url().to_string();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.to_string());

        if let Some(ct) = content_type.as_deref() {
            if !self.is_content_type_allowed(ct) {
                return Err(FetchError::new(
                    FetchFailure::UnsupportedContentType {
                        content_type: ct.to_string(),
                    },
                    "unsupported content type",
                ));
            }
        }

        let mut bytes = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk =
                chunk.map_err(|err| map_reqwest_error(err, &state, self.settings.max_redirects))?;
            let next_len = bytes.len() as u64 + chunk.len() as u64;
            if next_len > self.settings.max_bytes {
                return Err(self.too_large(Some(next_len)));
            }
            bytes.extend_from_slice(&chunk);
        }

        let metadata = FetchMetadata {
            original_url: url.to_string(),
            final_url,
            status: status.as_u16(),
            redirect_count: state.redirects.load(Ordering::Relaxed),
            content_type,
            byte_len: bytes.len() as u64,
        };
        archiver_debug!(
            "Fetched {} bytes from {} after {} redirects",
            metadata.byte_len,
            metadata.final_url,
            metadata.redirect_count
        );

        Ok(FetchOutput { bytes, metadata })
    }
}

fn header_content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse().ok())
}

fn literal_ip(url: &Url) -> Option<std::net::IpAddr> {
    match url.host()? {
        Host::Ipv4(ip) => Some(ip.into()),
        Host::Ipv6(ip) => Some(ip.into()),
        Host::Domain(_) => None,
    }
}

fn map_reqwest_error(err: reqwest::Error, state: &RequestState, max_redirects: usize) -> FetchError {
    if let Some(BlockedTarget { host, ip }) = state.blocked_target() {
        return FetchError::new(FetchFailure::BlockedAddress { host, ip }, err.to_string());
    }
    if let Some(scheme) = state.bad_scheme() {
        return FetchError::new(FetchFailure::InvalidScheme { scheme }, err.to_string());
    }
    if err.is_timeout() || has_timeout_source(&err) {
        return FetchError::new(FetchFailure::Timeout, err.to_string());
    }
    if err.is_redirect() {
        return FetchError::new(
            FetchFailure::TooManyRedirects { max: max_redirects },
            err.to_string(),
        );
    }
    FetchError::new(FetchFailure::ConnectionFailed, describe(&err))
}

fn has_timeout_source(err: &reqwest::Error) -> bool {
    let mut source = err.source();
    while let Some(inner) = source {
        if let Some(io) = inner.downcast_ref::<std::io::Error>() {
            if io.kind() == std::io::ErrorKind::TimedOut {
                return true;
            }
        }
        source = inner.source();
    }
    false
}

/// reqwest's top-level message is terse; append the innermost cause.
fn describe(err: &reqwest::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    let mut innermost = None;
    while let Some(inner) = source {
        innermost = Some(inner.to_string());
        source = inner.source();
    }
    if let Some(cause) = innermost {
        message.push_str(": ");
        message.push_str(&cause);
    }
    message
}
