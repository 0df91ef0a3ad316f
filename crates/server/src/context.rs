use sdlc_contracts::{ReviewSide, SdlcError, WorkspaceAccessType, WorkspaceType};
use sdlc_gitlab::GitLabApi;

use crate::backend::backend_error;

pub const REVISION_ALIASES: [&str; 2] = ["latest", "HEAD"];
const VERSION_TAG_PREFIX: &str = "release-";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextTarget {
    Workspace {
        workspace_id: String,
        workspace_type: WorkspaceType,
        access_type: WorkspaceAccessType,
    },
    Review {
        review_id: String,
        side: ReviewSide,
    },
    Revision {
        revision_id: String,
    },
    Version {
        version_id: String,
    },
    DefaultBranch,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowScope {
    Branch(String),
    Tag(String),
    Commit(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessContext {
    pub project_id: String,
    pub gitlab_project_id: u64,
    pub target: ContextTarget,
    pub commit: String,
    pub scope: WorkflowScope,
}

impl ContextTarget {
    pub fn describe(&self, project_id: &str) -> String {
        match self {
            ContextTarget::Workspace {
                workspace_id,
                workspace_type,
                access_type,
            } => format!(
                "{} {} {} in project {}",
                workspace_type.as_str(),
                access_type.as_str(),
                workspace_id,
                project_id
            ),
            ContextTarget::Review { review_id, side } => format!(
                "{} side of review {} in project {}",
                side.as_str(),
                review_id,
                project_id
            ),
            ContextTarget::Revision { revision_id } => {
                format!("revision {} in project {}", revision_id, project_id)
            }
            ContextTarget::Version { version_id } => {
                format!("version {} in project {}", version_id, project_id)
            }
            ContextTarget::DefaultBranch => format!("project {}", project_id),
        }
    }
}

impl AccessContext {
    pub fn describe(&self) -> String {
        self.target.describe(&self.project_id)
    }
}

pub struct ContextResolver<'a> {
    api: &'a GitLabApi,
    project_id_prefix: Option<&'a str>,
}

impl<'a> ContextResolver<'a> {
    pub fn new(api: &'a GitLabApi, project_id_prefix: Option<&'a str>) -> Self {
        Self {
            api,
            project_id_prefix,
        }
    }

    pub fn parse_project_id(&self, project_id: &str) -> Result<u64, SdlcError> {
        parse_project_id(project_id, self.project_id_prefix)
    }

    pub async fn resolve(
        &self,
        project_id: &str,
        target: &ContextTarget,
    ) -> Result<AccessContext, SdlcError> {
        match target {
            ContextTarget::Workspace {
                workspace_id,
                workspace_type,
                access_type,
            } => {
                self.workspace_context(project_id, workspace_id, *workspace_type, *access_type)
                    .await
            }
            ContextTarget::Review { review_id, side } => {
                self.review_context(project_id, review_id, *side).await
            }
            ContextTarget::Revision { revision_id } => {
                self.revision_context(project_id, revision_id).await
            }
            ContextTarget::Version { version_id } => {
                self.version_context(project_id, version_id).await
            }
            ContextTarget::DefaultBranch => self.default_branch_context(project_id).await,
        }
    }

    pub async fn workspace_context(
        &self,
        project_id: &str,
        workspace_id: &str,
        workspace_type: WorkspaceType,
        access_type: WorkspaceAccessType,
    ) -> Result<AccessContext, SdlcError> {
        let gitlab_project_id = self.parse_project_id(project_id)?;
        validate_workspace_id(workspace_id)?;

        let username = match workspace_type {
            WorkspaceType::User => Some(
                self.api
                    .current_user()
                    .await
                    .map_err(|err| backend_error(err, "current user"))?
                    .username,
            ),
            WorkspaceType::Group => None,
        };

        let branch_name = workspace_branch_name(
            workspace_type,
            access_type,
            username.as_deref(),
            workspace_id,
        );
        let target = ContextTarget::Workspace {
            workspace_id: workspace_id.to_string(),
            workspace_type,
            access_type,
        };
        let subject = target.describe(project_id);
        let branch = self
            .api
            .branch(gitlab_project_id, &branch_name)
            .await
            .map_err(|err| backend_error(err, &subject))?;

        Ok(AccessContext {
            project_id: project_id.to_string(),
            gitlab_project_id,
            target,
            commit: branch.commit.id,
            scope: WorkflowScope::Branch(branch.name),
        })
    }

    pub async fn review_context(
        &self,
        project_id: &str,
        review_id: &str,
        side: ReviewSide,
    ) -> Result<AccessContext, SdlcError> {
        let gitlab_project_id = self.parse_project_id(project_id)?;
        let subject = format!("review {} in project {}", review_id, project_id);
        let iid = review_id
            .trim()
            .parse::<u64>()
            .map_err(|_| SdlcError::not_found(format!("unknown {}", subject)))?;

        let review = self
            .api
            .merge_request(gitlab_project_id, iid)
            .await
            .map_err(|err| backend_error(err, &subject))?;
        let diff_refs = review.diff_refs.as_ref();

        let commit = match side {
            ReviewSide::From => match diff_refs.and_then(|refs| refs.base_sha.clone()) {
                Some(sha) => sha,
                None => {
                    self.api
                        .merge_base(
                            gitlab_project_id,
                            &review.source_branch,
                            &review.target_branch,
                        )
                        .await
                        .map_err(|err| backend_error(err, &subject))?
                        .id
                }
            },
            ReviewSide::To => match diff_refs
                .and_then(|refs| refs.head_sha.clone())
                .or_else(|| review.sha.clone())
            {
                Some(sha) => sha,
                None => {
                    self.api
                        .branch(gitlab_project_id, &review.source_branch)
                        .await
                        .map_err(|err| backend_error(err, &subject))?
                        .commit
                        .id
                }
            },
        };

        Ok(AccessContext {
            project_id: project_id.to_string(),
            gitlab_project_id,
            target: ContextTarget::Review {
                review_id: review_id.to_string(),
                side,
            },
            scope: WorkflowScope::Commit(commit.clone()),
            commit,
        })
    }

    pub async fn revision_context(
        &self,
        project_id: &str,
        revision_id: &str,
    ) -> Result<AccessContext, SdlcError> {
        let revision_id = revision_id.trim();
        if revision_id.is_empty() {
            return Err(SdlcError::bad_request("revision id must be non-empty"));
        }

        if REVISION_ALIASES.contains(&revision_id) {
            let mut context = self.default_branch_context(project_id).await?;
            context.target = ContextTarget::Revision {
                revision_id: revision_id.to_string(),
            };
            return Ok(context);
        }

        let gitlab_project_id = self.parse_project_id(project_id)?;
        let subject = format!("revision {} in project {}", revision_id, project_id);
        let commit = self
            .api
            .commit(gitlab_project_id, revision_id)
            .await
            .map_err(|err| backend_error(err, &subject))?;

        Ok(AccessContext {
            project_id: project_id.to_string(),
            gitlab_project_id,
            target: ContextTarget::Revision {
                revision_id: revision_id.to_string(),
            },
            scope: WorkflowScope::Commit(commit.id.clone()),
            commit: commit.id,
        })
    }

    pub async fn version_context(
        &self,
        project_id: &str,
        version_id: &str,
    ) -> Result<AccessContext, SdlcError> {
        let gitlab_project_id = self.parse_project_id(project_id)?;
        let version = parse_version_id(version_id)?;
        let subject = format!("version {} in project {}", version, project_id);

        let tag = self
            .api
            .tag(gitlab_project_id, &version_tag_name(&version))
            .await
            .map_err(|err| backend_error(err, &subject))?;

        Ok(AccessContext {
            project_id: project_id.to_string(),
            gitlab_project_id,
            target: ContextTarget::Version {
                version_id: version,
            },
            commit: tag.commit.id,
            scope: WorkflowScope::Tag(tag.name),
        })
    }

    pub async fn default_branch_context(
        &self,
        project_id: &str,
    ) -> Result<AccessContext, SdlcError> {
        let gitlab_project_id = self.parse_project_id(project_id)?;
        let subject = format!("project {}", project_id);

        let project = self
            .api
            .project(gitlab_project_id)
            .await
            .map_err(|err| backend_error(err, &subject))?;
        let default_branch = project.default_branch.ok_or_else(|| {
            SdlcError::not_found(format!("project {} has no default branch", project_id))
        })?;

        let branch = self
            .api
            .branch(gitlab_project_id, &default_branch)
            .await
            .map_err(|err| backend_error(err, &subject))?;

        Ok(AccessContext {
            project_id: project_id.to_string(),
            gitlab_project_id,
            target: ContextTarget::DefaultBranch,
            commit: branch.commit.id,
            scope: WorkflowScope::Branch(branch.name),
        })
    }
}

pub fn parse_project_id(project_id: &str, prefix: Option<&str>) -> Result<u64, SdlcError> {
    let raw = project_id.trim();
    let numeric = match prefix {
        Some(prefix) => raw
            .strip_prefix(prefix)
            .map(|rest| rest.strip_prefix('-').unwrap_or(rest))
            .unwrap_or(raw),
        None => raw,
    };

    numeric
        .parse::<u64>()
        .ok()
        .filter(|id| *id > 0)
        .ok_or_else(|| SdlcError::bad_request(format!("invalid project id: {}", project_id)))
}

pub fn workspace_branch_name(
    workspace_type: WorkspaceType,
    access_type: WorkspaceAccessType,
    username: Option<&str>,
    workspace_id: &str,
) -> String {
    let prefix = match (workspace_type, access_type) {
        (WorkspaceType::User, WorkspaceAccessType::Workspace) => "workspace",
        (WorkspaceType::User, WorkspaceAccessType::WorkspaceWithConflictResolution) => {
            "resolution"
        }
        (WorkspaceType::User, WorkspaceAccessType::WorkspaceWithBackup) => "backup",
        (WorkspaceType::Group, WorkspaceAccessType::Workspace) => "group",
        (WorkspaceType::Group, WorkspaceAccessType::WorkspaceWithConflictResolution) => {
            "group-resolution"
        }
        (WorkspaceType::Group, WorkspaceAccessType::WorkspaceWithBackup) => "group-backup",
    };

    match (workspace_type, username) {
        (WorkspaceType::User, Some(username)) => {
            format!("{}/{}/{}", prefix, username, workspace_id)
        }
        _ => format!("{}/{}", prefix, workspace_id),
    }
}

pub fn validate_workspace_id(workspace_id: &str) -> Result<(), SdlcError> {
    if workspace_id.trim().is_empty() {
        return Err(SdlcError::bad_request("workspace id must be non-empty"));
    }
    if workspace_id.trim() != workspace_id || workspace_id.contains('/') {
        return Err(SdlcError::bad_request(format!(
            "invalid workspace id: {}",
            workspace_id
        )));
    }
    Ok(())
}

pub fn parse_version_id(version_id: &str) -> Result<String, SdlcError> {
    let invalid = || {
        SdlcError::bad_request(format!(
            "invalid version id \"{}\": expected MAJOR.MINOR.PATCH",
            version_id
        ))
    };

    let parts = version_id
        .trim()
        .split('.')
        .map(|part| {
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            part.parse::<u32>().ok()
        })
        .collect::<Option<Vec<_>>>()
        .ok_or_else(invalid)?;

    match parts.as_slice() {
        [major, minor, patch] => Ok(format!("{}.{}.{}", major, minor, patch)),
        _ => Err(invalid()),
    }
}

pub fn version_tag_name(version_id: &str) -> String {
    format!("{}{}", VERSION_TAG_PREFIX, version_id)
}
