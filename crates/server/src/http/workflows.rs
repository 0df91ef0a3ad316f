use axum::body::Body;
use axum::extract::{Path, RawQuery, State};
use axum::http::{HeaderMap, HeaderValue, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use sdlc_contracts::{SdlcError, Workflow, WorkflowJob, WorkflowJobStatus, WorkflowStatus};

use super::{
    ApiError, AppState, PathParams, TargetKind, describe_target, execute_with_logging,
    parse_query, path_param, query_values, target_from_path,
};
use crate::context::ContextResolver;
use crate::workflow::WorkflowJobController;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobAction {
    Run,
    Retry,
    Cancel,
}

impl JobAction {
    fn as_str(self) -> &'static str {
        match self {
            JobAction::Run => "run",
            JobAction::Retry => "retry",
            JobAction::Cancel => "cancel",
        }
    }

    fn gerund(self) -> &'static str {
        match self {
            JobAction::Run => "running",
            JobAction::Retry => "retrying",
            JobAction::Cancel => "canceling",
        }
    }

    fn route(self) -> &'static str {
        match self {
            JobAction::Run => "run_workflow_job",
            JobAction::Retry => "retry_workflow_job",
            JobAction::Cancel => "cancel_workflow_job",
        }
    }
}

pub(super) fn routes(
    router: Router<AppState>,
    base: &str,
    kind: TargetKind,
) -> Router<AppState> {
    let workflows = format!("{}/workflows", base);
    let workflow = format!("{}/{{workflow_id}}", workflows);
    let jobs = format!("{}/jobs", workflow);
    let job = format!("{}/{{job_id}}", jobs);

    let mut router = router
        .route(
            &workflows,
            get(
                move |State(state): State<AppState>,
                      Path(params): Path<PathParams>,
                      headers: HeaderMap,
                      RawQuery(query): RawQuery| async move {
                    list_workflows(state, kind, params, headers, query).await
                },
            ),
        )
        .route(
            &workflow,
            get(
                move |State(state): State<AppState>,
                      Path(params): Path<PathParams>,
                      headers: HeaderMap| async move {
                    get_workflow(state, kind, params, headers).await
                },
            ),
        )
        .route(
            &jobs,
            get(
                move |State(state): State<AppState>,
                      Path(params): Path<PathParams>,
                      headers: HeaderMap,
                      RawQuery(query): RawQuery| async move {
                    list_jobs(state, kind, params, headers, query).await
                },
            ),
        )
        .route(
            &job,
            get(
                move |State(state): State<AppState>,
                      Path(params): Path<PathParams>,
                      headers: HeaderMap| async move {
                    get_job(state, kind, params, headers).await
                },
            ),
        )
        .route(
            &format!("{}/logs", job),
            get(
                move |State(state): State<AppState>,
                      Path(params): Path<PathParams>,
                      headers: HeaderMap| async move {
                    get_job_logs(state, kind, params, headers).await
                },
            ),
        );

    for action in [JobAction::Run, JobAction::Retry, JobAction::Cancel] {
        router = router.route(
            &format!("{}/{}", job, action.as_str()),
            post(
                move |State(state): State<AppState>,
                      Path(params): Path<PathParams>,
                      headers: HeaderMap| async move {
                    job_action(state, kind, params, headers, action).await
                },
            ),
        );
    }

    router
}

async fn list_workflows(
    state: AppState,
    kind: TargetKind,
    params: PathParams,
    headers: HeaderMap,
    query: Option<String>,
) -> Result<Json<Vec<Workflow>>, ApiError> {
    let prefix = state.config.project_id_prefix.as_deref();
    let target = target_from_path(kind, &params);
    let description = format!("getting workflows for {}", describe_target(&target));

    let workflows = execute_with_logging(
        &state,
        &headers,
        "list_workflows",
        "GET",
        description,
        |api| async move {
            let (project_id, target) = target?;
            let statuses = parse_statuses(query.as_deref(), WorkflowStatus::parse)?;

            let context = ContextResolver::new(&api, prefix)
                .resolve(&project_id, &target)
                .await?;
            WorkflowJobController::new(&api, &context)
                .list_workflows(&statuses)
                .await
        },
    )
    .await?;

    Ok(Json(workflows))
}

async fn get_workflow(
    state: AppState,
    kind: TargetKind,
    params: PathParams,
    headers: HeaderMap,
) -> Result<Json<Workflow>, ApiError> {
    let prefix = state.config.project_id_prefix.as_deref();
    let target = target_from_path(kind, &params);
    let workflow_id = path_param(&params, "workflow_id");
    let description = format!(
        "getting workflow {} for {}",
        workflow_id.as_deref().unwrap_or(""),
        describe_target(&target)
    );

    let workflow = execute_with_logging(
        &state,
        &headers,
        "get_workflow",
        "GET",
        description,
        |api| async move {
            let (project_id, target) = target?;
            let workflow_id = workflow_id?;

            let context = ContextResolver::new(&api, prefix)
                .resolve(&project_id, &target)
                .await?;
            WorkflowJobController::new(&api, &context)
                .get_workflow(&workflow_id)
                .await
        },
    )
    .await?;

    Ok(Json(workflow))
}

async fn list_jobs(
    state: AppState,
    kind: TargetKind,
    params: PathParams,
    headers: HeaderMap,
    query: Option<String>,
) -> Result<Json<Vec<WorkflowJob>>, ApiError> {
    let prefix = state.config.project_id_prefix.as_deref();
    let target = target_from_path(kind, &params);
    let workflow_id = path_param(&params, "workflow_id");
    let description = format!(
        "getting jobs of workflow {} for {}",
        workflow_id.as_deref().unwrap_or(""),
        describe_target(&target)
    );

    let jobs = execute_with_logging(
        &state,
        &headers,
        "list_workflow_jobs",
        "GET",
        description,
        |api| async move {
            let (project_id, target) = target?;
            let workflow_id = workflow_id?;
            let statuses = parse_statuses(query.as_deref(), WorkflowJobStatus::parse)?;

            let context = ContextResolver::new(&api, prefix)
                .resolve(&project_id, &target)
                .await?;
            WorkflowJobController::new(&api, &context)
                .list_jobs(&workflow_id, &statuses)
                .await
        },
    )
    .await?;

    Ok(Json(jobs))
}

async fn get_job(
    state: AppState,
    kind: TargetKind,
    params: PathParams,
    headers: HeaderMap,
) -> Result<Json<WorkflowJob>, ApiError> {
    let prefix = state.config.project_id_prefix.as_deref();
    let target = target_from_path(kind, &params);
    let ids = job_ids(&params);
    let description = format!("getting {} for {}", job_label(&ids), describe_target(&target));

    let job = execute_with_logging(
        &state,
        &headers,
        "get_workflow_job",
        "GET",
        description,
        |api| async move {
            let (project_id, target) = target?;
            let (workflow_id, job_id) = ids?;

            let context = ContextResolver::new(&api, prefix)
                .resolve(&project_id, &target)
                .await?;
            WorkflowJobController::new(&api, &context)
                .get_job(&workflow_id, &job_id)
                .await
        },
    )
    .await?;

    Ok(Json(job))
}

async fn get_job_logs(
    state: AppState,
    kind: TargetKind,
    params: PathParams,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let prefix = state.config.project_id_prefix.as_deref();
    let target = target_from_path(kind, &params);
    let ids = job_ids(&params);
    let description = format!(
        "getting logs of {} for {}",
        job_label(&ids),
        describe_target(&target)
    );
    let filename = ids
        .as_ref()
        .map(|(_, job_id)| log_filename(job_id))
        .unwrap_or_default();

    let stream = execute_with_logging(
        &state,
        &headers,
        "get_workflow_job_logs",
        "GET",
        description,
        |api| async move {
            let (project_id, target) = target?;
            let (workflow_id, job_id) = ids?;

            let context = ContextResolver::new(&api, prefix)
                .resolve(&project_id, &target)
                .await?;
            WorkflowJobController::new(&api, &context)
                .get_job_log(&workflow_id, &job_id)
                .await
        },
    )
    .await?;

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    if let Ok(value) = HeaderValue::from_str(&format!("attachment; filename=\"{}\"", filename)) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }

    Ok((headers, Body::from_stream(stream)).into_response())
}

async fn job_action(
    state: AppState,
    kind: TargetKind,
    params: PathParams,
    headers: HeaderMap,
    action: JobAction,
) -> Result<Json<WorkflowJob>, ApiError> {
    let prefix = state.config.project_id_prefix.as_deref();
    let target = target_from_path(kind, &params);
    let ids = job_ids(&params);
    let description = format!(
        "{} {} for {}",
        action.gerund(),
        job_label(&ids),
        describe_target(&target)
    );

    let job = execute_with_logging(
        &state,
        &headers,
        action.route(),
        "POST",
        description,
        |api| async move {
            let (project_id, target) = target?;
            let (workflow_id, job_id) = ids?;

            let context = ContextResolver::new(&api, prefix)
                .resolve(&project_id, &target)
                .await?;
            let controller = WorkflowJobController::new(&api, &context);
            match action {
                JobAction::Run => controller.run_job(&workflow_id, &job_id).await,
                JobAction::Retry => controller.retry_job(&workflow_id, &job_id).await,
                JobAction::Cancel => controller.cancel_job(&workflow_id, &job_id).await,
            }
        },
    )
    .await?;

    Ok(Json(job))
}

fn job_ids(params: &PathParams) -> Result<(String, String), SdlcError> {
    Ok((path_param(params, "workflow_id")?, path_param(params, "job_id")?))
}

fn job_label(ids: &Result<(String, String), SdlcError>) -> String {
    match ids {
        Ok((workflow_id, job_id)) => format!("job {} of workflow {}", job_id, workflow_id),
        Err(_) => "job".to_string(),
    }
}

fn log_filename(job_id: &str) -> String {
    let stem = job_id
        .chars()
        .filter(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.'))
        .collect::<String>();
    format!("{}.log", if stem.is_empty() { "job" } else { &stem })
}

fn parse_statuses<T>(
    query: Option<&str>,
    parse: fn(&str) -> Option<T>,
) -> Result<Vec<T>, SdlcError> {
    let pairs = parse_query(query);
    query_values(&pairs, "status")
        .iter()
        .map(|raw| {
            parse(&raw.trim().to_ascii_uppercase())
                .ok_or_else(|| SdlcError::bad_request(format!("unknown status: {}", raw)))
        })
        .collect()
}
