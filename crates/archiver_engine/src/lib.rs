//! Archiver engine: URL validation, guarded fetching, extraction,
//! sanitization, persistence and the job orchestrator.
mod archiver;
mod blocklist;
mod config;
mod decode;
mod error;
mod extract;
mod fetch;
mod html;
mod resolve;
mod sanitize;
pub mod store;
mod types;
mod validate;

pub use archiver::{Archiver, ArchiverBuilder, ResumeSummary};
pub use blocklist::{BlockList, InvalidRange, IpRange, DEFAULT_BLOCKED_RANGES};
pub use config::{ArchiverConfig, ConfigError};
pub use decode::{decode_html, DecodedHtml};
pub use error::ArchiverError;
pub use extract::{
    derive_text, ExtractedContent, ExtractionError, Extractor, PageMetadata, ReadabilityExtractor,
    ReadabilitySettings,
};
pub use fetch::{FetchSettings, Fetcher, ReqwestFetcher};
pub use resolve::{prefer_ipv4, BlockedTarget, DnsGuardError, Resolver, StaticResolver, SystemResolver};
pub use sanitize::{PruningSanitizer, SanitizationError, Sanitizer};
pub use store::{Database, StoreError};
pub use types::{ArchiveEvent, FetchError, FetchFailure, FetchMetadata, FetchOutput, PipelineStage};
pub use validate::{UrlValidator, ValidatedUrl, ValidationError};
