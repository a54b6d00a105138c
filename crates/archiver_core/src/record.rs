use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{ArchiveState, FailureReason, Stage};

/// Creation-ordered archive identifier (UUID v7).
pub type ArchiveId = Uuid;

/// Identifier of the owning entity (the saved link).
pub type LinkId = String;

/// Flexible key/value bag of secondary metadata, namespaced by source
/// (`og.title`, `twitter.card`, `canonical_url`).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetadataBag(BTreeMap<String, String>);

impl MetadataBag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `namespace.key`. The first value seen for a key wins, so
    /// repeated tags resolve the same way on every run.
    pub fn insert_namespaced(&mut self, namespace: &str, key: &str, value: impl Into<String>) {
        self.insert(format!("{namespace}.{key}"), value);
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.entry(key.into()).or_insert_with(|| value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Keys belonging to `namespace`, without the prefix.
    pub fn namespace<'a>(&'a self, namespace: &'a str) -> impl Iterator<Item = (&'a str, &'a str)> {
        self.iter().filter_map(move |(key, value)| {
            key.strip_prefix(namespace)
                .and_then(|rest| rest.strip_prefix('.'))
                .map(|rest| (rest, value))
        })
    }
}

/// Everything a successful pipeline run writes onto the archive row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveContent {
    pub content_html: String,
    pub content_text: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub image_url: Option<String>,
    pub final_url: String,
    pub metadata: MetadataBag,
    pub fetched_at: DateTime<Utc>,
}

/// Persisted unit of work and result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Archive {
    pub id: ArchiveId,
    pub link_id: LinkId,
    pub url: String,
    pub state: ArchiveState,
    pub error_message: Option<String>,
    pub content_html: Option<String>,
    pub content_text: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub image_url: Option<String>,
    pub final_url: Option<String>,
    pub metadata: MetadataBag,
    pub fetched_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Archive {
    pub fn new_pending(link_id: impl Into<LinkId>, url: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7(),
            link_id: link_id.into(),
            url: url.into(),
            state: ArchiveState::Pending,
            error_message: None,
            content_html: None,
            content_text: None,
            title: None,
            description: None,
            image_url: None,
            final_url: None,
            metadata: MetadataBag::new(),
            fetched_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn has_content(&self) -> bool {
        self.content_html.is_some() || self.content_text.is_some() || self.title.is_some()
    }

    pub(crate) fn set_content(&mut self, content: ArchiveContent) {
        self.content_html = Some(content.content_html);
        self.content_text = Some(content.content_text);
        self.title = content.title;
        self.description = content.description;
        self.image_url = content.image_url;
        self.final_url = Some(content.final_url);
        self.metadata = content.metadata;
        self.fetched_at = Some(content.fetched_at);
    }

    /// `fetched_at` survives a retry: it records the last successful fetch.
    pub(crate) fn clear_content(&mut self) {
        self.content_html = None;
        self.content_text = None;
        self.title = None;
        self.description = None;
        self.image_url = None;
        self.final_url = None;
        self.metadata = MetadataBag::new();
    }
}

/// Stage facts attached to a transition row.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TransitionMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<FailureReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub byte_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_url: Option<String>,
}

/// Append-only log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub id: i64,
    pub archive_id: ArchiveId,
    pub from_state: ArchiveState,
    pub to_state: ArchiveState,
    pub metadata: TransitionMetadata,
    pub occurred_at: DateTime<Utc>,
}
