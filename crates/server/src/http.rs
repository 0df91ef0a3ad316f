use std::collections::BTreeMap;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use sdlc_auth::{AuthError, CredentialExtractor};
use sdlc_contracts::{ErrorKind, ReviewSide, SdlcError, WorkspaceAccessType, WorkspaceType};
use sdlc_gitlab::{GitLabApi, GitLabClient, GitLabClientConfig};
use serde::Serialize;
use tracing::Instrument;
use ulid::Ulid;

use crate::config::{ServerConfig, StartupError};
use crate::context::ContextTarget;
use crate::metrics::BackendCallMetrics;

mod entities;
mod workflows;

pub const REQUEST_ID_HEADER: &str = "x-sdlc-request-id";

#[derive(Clone)]
pub struct AppState {
    pub config: ServerConfig,
    gitlab: GitLabClient,
    credentials: CredentialExtractor,
}

type ApiError = (StatusCode, Json<ErrorResponse>);
type PathParams = HashMap<String, String>;

pub fn router(config: ServerConfig) -> Result<Router, StartupError> {
    let gitlab = GitLabClient::new(GitLabClientConfig {
        base_url: config.gitlab_url.clone(),
        timeout: config.gitlab_timeout(),
        retry_backoff: config.gitlab_retry_backoff(),
    })
    .map_err(|err| StartupError {
        code: "ERR_INVALID_CONFIG",
        message: format!("failed to initialize GitLab client: {}", err),
    })?
    .with_observer(Arc::new(BackendCallMetrics));

    let credentials =
        CredentialExtractor::new(config.auth_mode.clone()).map_err(|err| StartupError {
            code: err.code,
            message: err.message,
        })?;

    let state = AppState {
        config,
        gitlab,
        credentials,
    };

    let mut router = Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics));

    router = entities::routes(
        router,
        "/projects/{project_id}/reviews/{review_id}/comparison/{side}",
        TargetKind::Review,
    );
    for (segment, workspace_type) in [
        ("workspaces", WorkspaceType::User),
        ("groupWorkspaces", WorkspaceType::Group),
    ] {
        let base = format!("/projects/{{project_id}}/{}/{{workspace_id}}", segment);
        for (suffix, access_type) in [
            ("", WorkspaceAccessType::Workspace),
            (
                "/conflictResolution",
                WorkspaceAccessType::WorkspaceWithConflictResolution,
            ),
            ("/backup", WorkspaceAccessType::WorkspaceWithBackup),
        ] {
            router = entities::routes(
                router,
                &format!("{}{}", base, suffix),
                TargetKind::Workspace(workspace_type, access_type),
            );
        }
        router = workflows::routes(
            router,
            &base,
            TargetKind::Workspace(workspace_type, WorkspaceAccessType::Workspace),
        );
    }
    router = entities::routes(
        router,
        "/projects/{project_id}/revisions/{revision_id}",
        TargetKind::Revision,
    );
    router = entities::routes(
        router,
        "/projects/{project_id}/versions/{version_id}",
        TargetKind::Version,
    );
    router = workflows::routes(router, "/projects/{project_id}", TargetKind::DefaultBranch);

    Ok(router.with_state(state))
}

async fn healthz() -> &'static str {
    "ok"
}

#[derive(Debug, Serialize)]
struct ReadyzResponse {
    status: &'static str,
    checks: BTreeMap<&'static str, bool>,
}

async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let mut checks = BTreeMap::new();

    let gitlab_ready = state.gitlab.ping().await.is_ok();
    checks.insert("gitlab", gitlab_ready);

    let all_ready = checks.values().all(|ok| *ok);
    let status = if all_ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadyzResponse {
            status: if all_ready { "ready" } else { "not_ready" },
            checks,
        }),
    )
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    if !state.config.metrics_enabled {
        return StatusCode::NOT_FOUND.into_response();
    }

    match crate::metrics::render() {
        Ok((body, content_type)) => {
            let mut headers = HeaderMap::new();
            if let Ok(value) = HeaderValue::from_str(content_type.as_str()) {
                headers.insert(header::CONTENT_TYPE, value);
            }
            (headers, body).into_response()
        }
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TargetKind {
    Workspace(WorkspaceType, WorkspaceAccessType),
    Review,
    Revision,
    Version,
    DefaultBranch,
}

fn target_from_path(
    kind: TargetKind,
    params: &PathParams,
) -> Result<(String, ContextTarget), SdlcError> {
    let project_id = path_param(params, "project_id")?;

    let target = match kind {
        TargetKind::Workspace(workspace_type, access_type) => ContextTarget::Workspace {
            workspace_id: path_param(params, "workspace_id")?,
            workspace_type,
            access_type,
        },
        TargetKind::Review => {
            let review_id = path_param(params, "review_id")?;
            let side = match path_param(params, "side")?.as_str() {
                "from" => ReviewSide::From,
                "to" => ReviewSide::To,
                other => {
                    return Err(SdlcError::not_found(format!(
                        "unknown review comparison side: {}",
                        other
                    )));
                }
            };
            ContextTarget::Review { review_id, side }
        }
        TargetKind::Revision => ContextTarget::Revision {
            revision_id: path_param(params, "revision_id")?,
        },
        TargetKind::Version => ContextTarget::Version {
            version_id: path_param(params, "version_id")?,
        },
        TargetKind::DefaultBranch => ContextTarget::DefaultBranch,
    };

    Ok((project_id, target))
}

fn path_param(params: &PathParams, name: &str) -> Result<String, SdlcError> {
    params
        .get(name)
        .cloned()
        .ok_or_else(|| SdlcError::internal(format!("route is missing path parameter {}", name)))
}

fn describe_target(target: &Result<(String, ContextTarget), SdlcError>) -> String {
    match target {
        Ok((project_id, target)) => target.describe(project_id),
        Err(_) => "unresolved context".to_string(),
    }
}

async fn execute_with_logging<T, F, Fut>(
    state: &AppState,
    headers: &HeaderMap,
    route: &'static str,
    method: &'static str,
    description: String,
    operation: F,
) -> Result<T, ApiError>
where
    F: FnOnce(GitLabApi) -> Fut,
    Fut: Future<Output = Result<T, SdlcError>>,
{
    let request_id = extract_request_id(headers);
    let span = tracing::info_span!(
        "sdlc.request",
        request_id = %request_id,
        operation = route,
        method,
        latency_ms = tracing::field::Empty,
        outcome = tracing::field::Empty,
    );
    let started = Instant::now();

    async move {
        tracing::info!("Started {}", description);

        let result = match state.credentials.extract(headers) {
            Err(err) => Err(auth_error(err)),
            Ok(credentials) => {
                let api = state.gitlab.for_credentials(credentials);
                match tokio::time::timeout(state.config.request_timeout(), operation(api)).await {
                    Ok(result) => result,
                    Err(_) => Err(SdlcError::timeout(format!(
                        "request deadline exceeded while {}",
                        description
                    ))),
                }
            }
        };

        let latency = started.elapsed();
        tracing::Span::current().record("latency_ms", latency.as_millis() as u64);

        match result {
            Ok(value) => {
                tracing::Span::current().record("outcome", "ok");
                tracing::info!("Finished {} ({} ms)", description, latency.as_millis());
                crate::metrics::observe_http_request(route, method, 200, latency);
                Ok(value)
            }
            Err(err) => {
                let (status, body) = error_response(&err);
                tracing::Span::current().record("outcome", err.kind.as_str());
                if status.is_server_error() {
                    tracing::error!(
                        kind = err.kind.as_str(),
                        cause = err.cause.as_deref().unwrap_or(""),
                        "Error {}: {}",
                        description,
                        err.message
                    );
                } else {
                    tracing::warn!(
                        kind = err.kind.as_str(),
                        cause = err.cause.as_deref().unwrap_or(""),
                        "Error {}: {}",
                        description,
                        err.message
                    );
                }
                crate::metrics::observe_http_request(route, method, status.as_u16(), latency);
                Err((status, body))
            }
        }
    }
    .instrument(span)
    .await
}

fn auth_error(err: AuthError) -> SdlcError {
    SdlcError::unauthorized(err.message).with_cause(err.code)
}

fn extract_request_id(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .and_then(sanitize_request_id)
        .unwrap_or_else(|| Ulid::new().to_string())
}

fn sanitize_request_id(raw: &str) -> Option<String> {
    const MAX_LEN: usize = 64;

    let out = raw
        .chars()
        .filter(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.'))
        .take(MAX_LEN)
        .collect::<String>();

    (!out.is_empty()).then_some(out)
}

fn parse_query(raw: Option<&str>) -> Vec<(String, String)> {
    raw.map(|raw| {
        url::form_urlencoded::parse(raw.as_bytes())
            .into_owned()
            .collect()
    })
    .unwrap_or_default()
}

fn query_values(pairs: &[(String, String)], key: &str) -> Vec<String> {
    pairs
        .iter()
        .filter(|(k, _)| k == key)
        .map(|(_, v)| v.clone())
        .collect()
}

fn query_value<'a>(pairs: &'a [(String, String)], key: &str) -> Option<&'a str> {
    pairs
        .iter()
        .rev()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

fn query_bool(pairs: &[(String, String)], key: &str, default: bool) -> Result<bool, SdlcError> {
    match query_value(pairs, key).map(|v| v.trim()) {
        None | Some("") => Ok(default),
        Some(raw) if raw.eq_ignore_ascii_case("true") => Ok(true),
        Some(raw) if raw.eq_ignore_ascii_case("false") => Ok(false),
        Some(raw) => Err(SdlcError::bad_request(format!(
            "invalid value for {}: {} (expected true or false)",
            key, raw
        ))),
    }
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    message: String,
    status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    cause: Option<String>,
}

fn json_error(
    status: StatusCode,
    message: impl Into<String>,
    cause: Option<String>,
) -> (StatusCode, Json<ErrorResponse>) {
    (
        status,
        Json(ErrorResponse {
            message: message.into(),
            status: status.as_u16(),
            cause,
        }),
    )
}

fn error_response(err: &SdlcError) -> ApiError {
    let status = StatusCode::from_u16(err.kind.http_status())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let message = match err.kind {
        ErrorKind::Internal if err.message.is_empty() => "internal error".to_string(),
        _ => err.message.clone(),
    };
    json_error(status, message, err.cause.clone())
}
