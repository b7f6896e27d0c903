//! Canonical retrieved documents, deduplicated by URL.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::validation::clip_title;

/// A stored source row. The URL is the deduplication key; writing the same
/// URL twice merges fields instead of inserting a duplicate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub source_id: String,
    pub url: String,
    /// Clipped to 254 characters at the persistence boundary
    pub title: String,
    pub provider: Option<String>,
    pub accessed_at: DateTime<Utc>,
    pub content_hash: Option<String>,
    pub extracted_text: Option<String>,
}

/// Candidate source prior to persistence. Title clipping happens when the
/// store facade converts this into a [`Source`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSource {
    pub url: String,
    pub title: Option<String>,
    pub provider: Option<String>,
    pub accessed_at: DateTime<Utc>,
    pub content_hash: Option<String>,
    pub extracted_text: Option<String>,
}

impl NewSource {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            title: None,
            provider: None,
            accessed_at: Utc::now(),
            content_hash: None,
            extracted_text: None,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_extracted_text(mut self, text: impl Into<String>) -> Self {
        self.extracted_text = Some(text.into());
        self
    }

    pub fn with_accessed_at(mut self, at: DateTime<Utc>) -> Self {
        self.accessed_at = at;
        self
    }

    /// Normalize into a storable row, applying the title bound.
    pub fn into_source(self) -> Source {
        Source {
            source_id: super::new_id(),
            url: self.url,
            title: clip_title(self.title.as_deref()),
            provider: self.provider,
            accessed_at: self.accessed_at,
            content_hash: self.content_hash,
            extracted_text: self.extracted_text,
        }
    }
}
