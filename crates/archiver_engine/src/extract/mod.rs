//! Metadata and main-content extraction.

mod metadata;
mod readability;
mod text;

use archiver_core::{Failure, FailureReason, MetadataBag, Stage};

pub use metadata::PageMetadata;
pub use readability::{ReadabilityExtractor, ReadabilitySettings};
pub use text::derive_text;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedContent {
    pub title: Option<String>,
    pub description: Option<String>,
    pub image_url: Option<String>,
    pub metadata: MetadataBag,
    /// Main-content fragment, not yet sanitized.
    pub content_html: String,
    pub content_text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExtractionError {
    #[error("metadata pass failed: {0}")]
    MetadataExtractionFailed(String),
    #[error("main content pass failed: {0}")]
    MainContentExtractionFailed(String),
}

impl ExtractionError {
    pub fn reason(&self) -> FailureReason {
        match self {
            ExtractionError::MetadataExtractionFailed(_) => FailureReason::MetadataExtractionFailed,
            ExtractionError::MainContentExtractionFailed(_) => {
                FailureReason::MainContentExtractionFailed
            }
        }
    }
}

impl From<ExtractionError> for Failure {
    fn from(err: ExtractionError) -> Self {
        let detail = match &err {
            ExtractionError::MetadataExtractionFailed(detail)
            | ExtractionError::MainContentExtractionFailed(detail) => detail.clone(),
        };
        Failure::new(err.reason(), detail).at_stage(Stage::Extraction)
    }
}

/// Pure, deterministic transformation of a decoded document.
pub trait Extractor: Send + Sync {
    fn extract(&self, html: &str, source_url: &str) -> Result<ExtractedContent, ExtractionError>;
}
