use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub mod error;

pub use error::{ErrorKind, SdlcError};

pub const PACKAGE_SEPARATOR: &str = "::";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    pub path: String,
    pub classifier_path: String,
    pub content: Map<String, Value>,
}

impl Entity {
    /// Package portion of the path, empty for entities at the root.
    pub fn package(&self) -> &str {
        split_entity_path(&self.path).0
    }

    pub fn name(&self) -> &str {
        split_entity_path(&self.path).1
    }

    pub fn stereotypes(&self) -> &[Value] {
        self.content_array("stereotypes")
    }

    pub fn tagged_values(&self) -> &[Value] {
        self.content_array("taggedValues")
    }

    fn content_array(&self, key: &str) -> &[Value] {
        self.content
            .get(key)
            .and_then(|v| v.as_array())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

pub fn split_entity_path(path: &str) -> (&str, &str) {
    match path.rfind(PACKAGE_SEPARATOR) {
        Some(idx) => (&path[..idx], &path[idx + PACKAGE_SEPARATOR.len()..]),
        None => ("", path),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReviewSide {
    From,
    To,
}

impl ReviewSide {
    pub fn as_str(self) -> &'static str {
        match self {
            ReviewSide::From => "from",
            ReviewSide::To => "to",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkspaceType {
    User,
    Group,
}

impl WorkspaceType {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkspaceType::User => "user",
            WorkspaceType::Group => "group",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkspaceAccessType {
    Workspace,
    WorkspaceWithConflictResolution,
    WorkspaceWithBackup,
}

impl WorkspaceAccessType {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkspaceAccessType::Workspace => "workspace",
            WorkspaceAccessType::WorkspaceWithConflictResolution => "workspace with conflict resolution",
            WorkspaceAccessType::WorkspaceWithBackup => "backup workspace",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowJobStatus {
    Pending,
    InProgress,
    Succeeded,
    Failed,
    Canceled,
    Skipped,
    Manual,
    Unknown,
}

impl WorkflowJobStatus {
    pub const ALL: [WorkflowJobStatus; 8] = [
        WorkflowJobStatus::Pending,
        WorkflowJobStatus::InProgress,
        WorkflowJobStatus::Succeeded,
        WorkflowJobStatus::Failed,
        WorkflowJobStatus::Canceled,
        WorkflowJobStatus::Skipped,
        WorkflowJobStatus::Manual,
        WorkflowJobStatus::Unknown,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            WorkflowJobStatus::Pending => "PENDING",
            WorkflowJobStatus::InProgress => "IN_PROGRESS",
            WorkflowJobStatus::Succeeded => "SUCCEEDED",
            WorkflowJobStatus::Failed => "FAILED",
            WorkflowJobStatus::Canceled => "CANCELED",
            WorkflowJobStatus::Skipped => "SKIPPED",
            WorkflowJobStatus::Manual => "MANUAL",
            WorkflowJobStatus::Unknown => "UNKNOWN",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        Self::ALL.into_iter().find(|status| status.as_str() == raw)
    }

    /// Only jobs waiting for a manual trigger can be run.
    pub fn can_run(self) -> bool {
        self == WorkflowJobStatus::Manual
    }

    pub fn can_retry(self) -> bool {
        matches!(self, WorkflowJobStatus::Failed | WorkflowJobStatus::Canceled)
    }

    pub fn can_cancel(self) -> bool {
        matches!(
            self,
            WorkflowJobStatus::Pending | WorkflowJobStatus::InProgress
        )
    }
}

impl std::fmt::Display for WorkflowJobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowJob {
    pub id: String,
    #[serde(rename = "projectId")]
    pub project_id: String,
    #[serde(rename = "workflowId")]
    pub workflow_id: String,
    #[serde(rename = "revisionId")]
    pub revision_id: String,
    pub name: String,
    pub status: WorkflowJobStatus,
    #[serde(rename = "webURL")]
    pub web_url: Option<String>,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "startedAt")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(rename = "finishedAt")]
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowStatus {
    InProgress,
    Succeeded,
    Failed,
    Unknown,
}

impl WorkflowStatus {
    pub const ALL: [WorkflowStatus; 4] = [
        WorkflowStatus::InProgress,
        WorkflowStatus::Succeeded,
        WorkflowStatus::Failed,
        WorkflowStatus::Unknown,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            WorkflowStatus::InProgress => "IN_PROGRESS",
            WorkflowStatus::Succeeded => "SUCCEEDED",
            WorkflowStatus::Failed => "FAILED",
            WorkflowStatus::Unknown => "UNKNOWN",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        Self::ALL.into_iter().find(|status| status.as_str() == raw)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workflow {
    pub id: String,
    #[serde(rename = "projectId")]
    pub project_id: String,
    #[serde(rename = "revisionId")]
    pub revision_id: String,
    pub status: WorkflowStatus,
    #[serde(rename = "webURL")]
    pub web_url: Option<String>,
    #[serde(rename = "createdAt")]
    pub created_at: Option<DateTime<Utc>>,
}
