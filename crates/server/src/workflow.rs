use bytes::Bytes;
use futures::stream::BoxStream;
use sdlc_contracts::{SdlcError, Workflow, WorkflowJob, WorkflowJobStatus, WorkflowStatus};
use sdlc_gitlab::models::{Job, Pipeline};
use sdlc_gitlab::{GitLabApi, GitLabError, PipelineFilter};

use crate::backend::backend_error;
use crate::context::{AccessContext, WorkflowScope};

pub type JobLogStream = BoxStream<'static, Result<Bytes, GitLabError>>;

pub fn map_job_status(raw: &str) -> WorkflowJobStatus {
    match raw {
        "created" | "waiting_for_resource" | "preparing" | "pending" | "scheduled" => {
            WorkflowJobStatus::Pending
        }
        "running" => WorkflowJobStatus::InProgress,
        "success" => WorkflowJobStatus::Succeeded,
        "failed" => WorkflowJobStatus::Failed,
        "canceled" | "canceling" => WorkflowJobStatus::Canceled,
        "skipped" => WorkflowJobStatus::Skipped,
        "manual" => WorkflowJobStatus::Manual,
        _ => WorkflowJobStatus::Unknown,
    }
}

pub fn map_workflow_status(raw: &str) -> WorkflowStatus {
    match raw {
        "created" | "waiting_for_resource" | "preparing" | "pending" | "running"
        | "scheduled" | "manual" => WorkflowStatus::InProgress,
        "success" => WorkflowStatus::Succeeded,
        "failed" | "canceled" | "canceling" | "skipped" => WorkflowStatus::Failed,
        _ => WorkflowStatus::Unknown,
    }
}

fn selected<T: Copy + PartialEq>(statuses: &[T], status: T, unknown: T) -> bool {
    statuses.is_empty() || (status != unknown && statuses.contains(&status))
}

pub struct WorkflowJobController<'a> {
    api: &'a GitLabApi,
    context: &'a AccessContext,
}

impl<'a> WorkflowJobController<'a> {
    pub fn new(api: &'a GitLabApi, context: &'a AccessContext) -> Self {
        Self { api, context }
    }

    pub async fn list_workflows(
        &self,
        statuses: &[WorkflowStatus],
    ) -> Result<Vec<Workflow>, SdlcError> {
        let filter = match &self.context.scope {
            WorkflowScope::Branch(name) | WorkflowScope::Tag(name) => PipelineFilter::Ref(name),
            WorkflowScope::Commit(sha) => PipelineFilter::Sha(sha),
        };

        let pipelines = self
            .api
            .pipelines(self.context.gitlab_project_id, filter)
            .await
            .map_err(|err| backend_error(err, &format!("workflows of {}", self.describe())))?;

        Ok(pipelines
            .into_iter()
            .filter(|pipeline| self.in_scope(pipeline.git_ref.as_deref(), &pipeline.sha))
            .map(|pipeline| self.to_workflow(pipeline))
            .filter(|workflow| selected(statuses, workflow.status, WorkflowStatus::Unknown))
            .collect())
    }

    pub async fn get_workflow(&self, workflow_id: &str) -> Result<Workflow, SdlcError> {
        let pipeline = self.pipeline(workflow_id).await?;
        Ok(self.to_workflow(pipeline))
    }

    pub async fn list_jobs(
        &self,
        workflow_id: &str,
        statuses: &[WorkflowJobStatus],
    ) -> Result<Vec<WorkflowJob>, SdlcError> {
        let pipeline = self.pipeline(workflow_id).await?;

        let jobs = self
            .api
            .pipeline_jobs(self.context.gitlab_project_id, pipeline.id)
            .await
            .map_err(|err| backend_error(err, &self.workflow_subject(workflow_id)))?;

        Ok(jobs
            .into_iter()
            .map(|job| self.to_workflow_job(job))
            .filter(|job| selected(statuses, job.status, WorkflowJobStatus::Unknown))
            .collect())
    }

    pub async fn get_job(&self, workflow_id: &str, job_id: &str) -> Result<WorkflowJob, SdlcError> {
        let job = self.job(workflow_id, job_id).await?;
        Ok(self.to_workflow_job(job))
    }

    pub async fn get_job_log(
        &self,
        workflow_id: &str,
        job_id: &str,
    ) -> Result<JobLogStream, SdlcError> {
        let job = self.job(workflow_id, job_id).await?;
        let subject = self.job_subject(workflow_id, job_id);
        if job.started_at.is_none() {
            return Err(SdlcError::not_found(format!("no log yet for {}", subject)));
        }

        self.api
            .job_trace(self.context.gitlab_project_id, job.id)
            .await
            .map_err(|err| backend_error(err, &format!("log of {}", subject)))
    }

    pub async fn run_job(&self, workflow_id: &str, job_id: &str) -> Result<WorkflowJob, SdlcError> {
        let job = self
            .guarded_job(workflow_id, job_id, "run", WorkflowJobStatus::can_run)
            .await?;
        let played = self
            .api
            .play_job(self.context.gitlab_project_id, job.id)
            .await
            .map_err(|err| backend_error(err, &self.job_subject(workflow_id, job_id)))?;
        Ok(self.to_workflow_job(played))
    }

    pub async fn retry_job(
        &self,
        workflow_id: &str,
        job_id: &str,
    ) -> Result<WorkflowJob, SdlcError> {
        let job = self
            .guarded_job(workflow_id, job_id, "retry", WorkflowJobStatus::can_retry)
            .await?;
        let retried = self
            .api
            .retry_job(self.context.gitlab_project_id, job.id)
            .await
            .map_err(|err| backend_error(err, &self.job_subject(workflow_id, job_id)))?;
        Ok(self.to_workflow_job(retried))
    }

    pub async fn cancel_job(
        &self,
        workflow_id: &str,
        job_id: &str,
    ) -> Result<WorkflowJob, SdlcError> {
        let job = self
            .guarded_job(workflow_id, job_id, "cancel", WorkflowJobStatus::can_cancel)
            .await?;
        let canceled = self
            .api
            .cancel_job(self.context.gitlab_project_id, job.id)
            .await
            .map_err(|err| backend_error(err, &self.job_subject(workflow_id, job_id)))?;
        Ok(self.to_workflow_job(canceled))
    }

    async fn guarded_job(
        &self,
        workflow_id: &str,
        job_id: &str,
        action: &str,
        allowed: fn(WorkflowJobStatus) -> bool,
    ) -> Result<Job, SdlcError> {
        let job = self.job(workflow_id, job_id).await?;
        let status = map_job_status(&job.status);
        if !allowed(status) {
            return Err(SdlcError::conflict(format!(
                "cannot {} {}: status is {}",
                action,
                self.job_subject(workflow_id, job_id),
                status
            )));
        }
        Ok(job)
    }

    async fn pipeline(&self, workflow_id: &str) -> Result<Pipeline, SdlcError> {
        let subject = self.workflow_subject(workflow_id);
        let not_found = || SdlcError::not_found(format!("unknown {}", subject));

        let pipeline_id = parse_backend_id(workflow_id).ok_or_else(not_found)?;
        let pipeline = self
            .api
            .pipeline(self.context.gitlab_project_id, pipeline_id)
            .await
            .map_err(|err| backend_error(err, &subject))?;

        if !self.in_scope(pipeline.git_ref.as_deref(), &pipeline.sha) {
            return Err(not_found());
        }
        Ok(pipeline)
    }

    async fn job(&self, workflow_id: &str, job_id: &str) -> Result<Job, SdlcError> {
        let subject = self.job_subject(workflow_id, job_id);
        let not_found = || SdlcError::not_found(format!("unknown {}", subject));

        let pipeline_id = parse_backend_id(workflow_id).ok_or_else(not_found)?;
        let backend_job_id = parse_backend_id(job_id).ok_or_else(not_found)?;

        let job = self
            .api
            .job(self.context.gitlab_project_id, backend_job_id)
            .await
            .map_err(|err| backend_error(err, &subject))?;

        if job.pipeline.id != pipeline_id
            || !self.in_scope(job.pipeline.git_ref.as_deref(), &job.pipeline.sha)
        {
            return Err(not_found());
        }
        Ok(job)
    }

    fn in_scope(&self, git_ref: Option<&str>, sha: &str) -> bool {
        match &self.context.scope {
            WorkflowScope::Branch(name) | WorkflowScope::Tag(name) => {
                git_ref == Some(name.as_str())
            }
            WorkflowScope::Commit(commit) => sha == commit,
        }
    }

    fn to_workflow(&self, pipeline: Pipeline) -> Workflow {
        Workflow {
            id: pipeline.id.to_string(),
            project_id: self.context.project_id.clone(),
            revision_id: pipeline.sha,
            status: map_workflow_status(&pipeline.status),
            web_url: pipeline.web_url,
            created_at: pipeline.created_at,
        }
    }

    fn to_workflow_job(&self, job: Job) -> WorkflowJob {
        WorkflowJob {
            id: job.id.to_string(),
            project_id: self.context.project_id.clone(),
            workflow_id: job.pipeline.id.to_string(),
            revision_id: job.pipeline.sha,
            name: job.name,
            status: map_job_status(&job.status),
            web_url: job.web_url,
            created_at: job.created_at,
            started_at: job.started_at,
            finished_at: job.finished_at,
        }
    }

    fn describe(&self) -> String {
        self.context.describe()
    }

    fn workflow_subject(&self, workflow_id: &str) -> String {
        format!("workflow {} in {}", workflow_id, self.describe())
    }

    fn job_subject(&self, workflow_id: &str, job_id: &str) -> String {
        format!(
            "job {} of workflow {} in {}",
            job_id,
            workflow_id,
            self.describe()
        )
    }
}

fn parse_backend_id(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    raw.parse::<u64>().ok()
}
