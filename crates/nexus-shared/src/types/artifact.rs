//! Generated research outputs bound to a task.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::validation::clip_title;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Markdown,
    Json,
    Pdf,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Markdown => "markdown",
            Self::Json => "json",
            Self::Pdf => "pdf",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "markdown" => Some(Self::Markdown),
            "json" => Some(Self::Json),
            "pdf" => Some(Self::Pdf),
            _ => None,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Markdown => "md",
            Self::Json => "json",
            Self::Pdf => "pdf",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub artifact_id: String,
    pub task_id: String,
    pub title: String,
    pub kind: ArtifactKind,
    /// Path of the generated file under the storage root
    pub file_path: Option<String>,
    /// Inline content when the artifact is small enough to keep in-row
    pub content: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Artifact {
    pub fn new(task_id: impl Into<String>, title: Option<&str>, kind: ArtifactKind) -> Self {
        Self {
            artifact_id: super::new_id(),
            task_id: task_id.into(),
            title: clip_title(title),
            kind,
            file_path: None,
            content: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_file_path(mut self, path: impl Into<String>) -> Self {
        self.file_path = Some(path.into());
        self
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_artifact_title_is_clipped() {
        let artifact = Artifact::new("t1", Some(&"x".repeat(400)), ArtifactKind::Markdown);
        assert_eq!(artifact.title.len(), 254);
    }

    #[test]
    fn test_kind_extensions() {
        assert_eq!(ArtifactKind::Markdown.extension(), "md");
        assert_eq!(ArtifactKind::Json.extension(), "json");
    }
}
