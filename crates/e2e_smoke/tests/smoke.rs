use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use axum::extract::{Path, Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

const TOKEN: &str = "glpat-smoke-7d1c55e0b2";
const WORKSPACE_BRANCH: &str = "workspace/alice/ws1";
const GROUP_BRANCH: &str = "group/modelling";

/// In-memory stand-in for the handful of GitLab v4 endpoints the server uses.
struct MockGitLab {
    calls: AtomicUsize,
    branches: HashMap<&'static str, &'static str>,
    tags: HashMap<&'static str, &'static str>,
    merge_requests: HashMap<u64, Value>,
    trees: HashMap<&'static str, Vec<(String, String)>>,
    pipelines: Vec<Value>,
    jobs: Mutex<BTreeMap<u64, Value>>,
    next_job_id: AtomicU64,
    merge_request_delay: Duration,
}

impl MockGitLab {
    fn new() -> Self {
        let review_to = vec![
            entity_file(
                "a::B",
                json!({"taggedValues": [tagged_value("since", "2024-03-01")]}),
            ),
            entity_file(
                "a::sub::C",
                json!({"taggedValues": [tagged_value("since", "2023-12-31")]}),
            ),
            entity_file("x::Y", json!({})),
        ];
        let review_from = vec![
            entity_file("a::B", json!({})),
            ("entities/a/Broken.json".to_string(), "{\"classifierPath\": ".to_string()),
            entity_file("x::Y", json!({})),
        ];
        let revision = vec![
            entity_file("a::FooOne", json!({})),
            entity_file("a::NotFoo", json!({})),
            entity_file("b::Foo", json!({})),
            entity_file("c::Bar", json!({})),
            (
                "entities/README.md".to_string(),
                "not an entity".to_string(),
            ),
        ];
        let unchanged = vec![entity_file("a::B", json!({})), entity_file("x::Y", json!({}))];
        let workspace = vec![entity_file(
            "model::Person",
            json!({"stereotypes": [{"profile": "meta::pure::profiles::doc", "value": "deprecated"}]}),
        )];
        let release = vec![entity_file("model::Released", json!({}))];

        let pipelines = vec![
            pipeline(9, WORKSPACE_BRANCH, "ws-sha", "manual"),
            pipeline(10, "main", "main-sha", "success"),
            pipeline(12, GROUP_BRANCH, "group-sha", "running"),
        ];

        let jobs = BTreeMap::from([
            (5, job(5, "build", "running", 9, WORKSPACE_BRANCH, "ws-sha", true)),
            (7, job(7, "deploy", "manual", 9, WORKSPACE_BRANCH, "ws-sha", false)),
            (8, job(8, "test", "failed", 9, WORKSPACE_BRANCH, "ws-sha", true)),
            (11, job(11, "publish", "success", 10, "main", "main-sha", true)),
            (13, job(13, "verify", "pending", 12, GROUP_BRANCH, "group-sha", false)),
            (14, job(14, "lint", "failed", 12, GROUP_BRANCH, "group-sha", true)),
        ]);

        Self {
            calls: AtomicUsize::new(0),
            branches: HashMap::from([
                ("main", "main-sha"),
                (WORKSPACE_BRANCH, "ws-sha"),
                (GROUP_BRANCH, "group-sha"),
            ]),
            tags: HashMap::from([("release-1.2.3", "release-sha")]),
            merge_requests: HashMap::from([
                (42, merge_request(42, "from-sha", "to-sha")),
                (43, merge_request(43, "base-43", "head-43")),
            ]),
            trees: HashMap::from([
                ("to-sha", review_to),
                ("from-sha", review_from),
                ("rev-sha", revision),
                ("base-43", unchanged.clone()),
                ("head-43", unchanged),
                ("ws-sha", workspace),
                ("release-sha", release),
                ("main-sha", Vec::new()),
            ]),
            pipelines,
            jobs: Mutex::new(jobs),
            next_job_id: AtomicU64::new(100),
            merge_request_delay: Duration::ZERO,
        }
    }

    fn with_merge_request_delay(mut self, delay: Duration) -> Self {
        self.merge_request_delay = delay;
        self
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

fn entity_file(path: &str, extra_content: Value) -> (String, String) {
    let (package, name) = path.rsplit_once("::").unwrap_or(("", path));
    let mut content = json!({"package": package, "name": name});
    if let (Some(content), Value::Object(extra)) = (content.as_object_mut(), extra_content) {
        content.extend(extra);
    }
    let file_path = format!("entities/{}.json", path.replace("::", "/"));
    let body = json!({
        "path": path,
        "classifierPath": "meta::pure::metamodel::type::Class",
        "content": content,
    });
    (file_path, body.to_string())
}

fn tagged_value(tag: &str, value: &str) -> Value {
    json!({"tag": {"profile": "meta::MyProfile", "value": tag}, "value": value})
}

fn merge_request(iid: u64, base_sha: &str, head_sha: &str) -> Value {
    json!({
        "iid": iid,
        "source_branch": format!("feature-{}", iid),
        "target_branch": "main",
        "state": "opened",
        "sha": head_sha,
        "diff_refs": {"base_sha": base_sha, "head_sha": head_sha, "start_sha": base_sha},
    })
}

fn pipeline(id: u64, git_ref: &str, sha: &str, status: &str) -> Value {
    json!({
        "id": id,
        "ref": git_ref,
        "sha": sha,
        "status": status,
        "web_url": format!("https://gitlab.test/pipelines/{}", id),
        "created_at": "2024-05-01T09:00:00Z",
    })
}

fn job(
    id: u64,
    name: &str,
    status: &str,
    pipeline_id: u64,
    git_ref: &str,
    sha: &str,
    started: bool,
) -> Value {
    json!({
        "id": id,
        "name": name,
        "status": status,
        "created_at": "2024-05-01T10:00:00Z",
        "started_at": if started { json!("2024-05-01T10:01:00Z") } else { Value::Null },
        "finished_at": null,
        "web_url": format!("https://gitlab.test/jobs/{}", id),
        "pipeline": {"id": pipeline_id, "ref": git_ref, "sha": sha},
    })
}

fn not_found(what: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"message": format!("404 {} Not Found", what)})),
    )
        .into_response()
}

async fn count_and_authenticate(
    State(state): State<Arc<MockGitLab>>,
    request: Request,
    next: Next,
) -> Response {
    state.calls.fetch_add(1, Ordering::SeqCst);

    let headers = request.headers();
    let private_token = headers.get("private-token").and_then(|v| v.to_str().ok());
    let bearer = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    if private_token != Some(TOKEN) && bearer != Some(TOKEN) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"message": "401 Unauthorized"})),
        )
            .into_response();
    }

    next.run(request).await
}

async fn spawn_mock_gitlab(
    state: Arc<MockGitLab>,
) -> (SocketAddr, oneshot::Sender<()>, tokio::task::JoinHandle<()>) {
    async fn version() -> impl IntoResponse {
        Json(json!({"version": "17.0.0"}))
    }

    async fn user() -> impl IntoResponse {
        Json(json!({"id": 1, "username": "alice"}))
    }

    async fn project(Path(project): Path<u64>) -> Response {
        if project != 1 {
            return not_found("Project");
        }
        Json(json!({
            "id": 1,
            "default_branch": "main",
            "path_with_namespace": "modelling/model",
            "web_url": "https://gitlab.test/modelling/model",
        }))
        .into_response()
    }

    async fn branch(
        State(state): State<Arc<MockGitLab>>,
        Path((_project, branch)): Path<(u64, String)>,
    ) -> Response {
        match state.branches.get(branch.as_str()) {
            Some(sha) => Json(json!({"name": branch, "commit": {"id": sha}})).into_response(),
            None => not_found("Branch"),
        }
    }

    async fn tag(
        State(state): State<Arc<MockGitLab>>,
        Path((_project, tag)): Path<(u64, String)>,
    ) -> Response {
        match state.tags.get(tag.as_str()) {
            Some(sha) => Json(json!({"name": tag, "commit": {"id": sha}})).into_response(),
            None => not_found("Tag"),
        }
    }

    async fn commit(
        State(state): State<Arc<MockGitLab>>,
        Path((_project, sha)): Path<(u64, String)>,
    ) -> Response {
        if state.trees.contains_key(sha.as_str()) {
            Json(json!({"id": sha, "created_at": "2024-05-01T08:00:00Z"})).into_response()
        } else {
            not_found("Commit")
        }
    }

    async fn merge_request(
        State(state): State<Arc<MockGitLab>>,
        Path((_project, iid)): Path<(u64, u64)>,
    ) -> Response {
        tokio::time::sleep(state.merge_request_delay).await;
        match state.merge_requests.get(&iid) {
            Some(mr) => Json(mr.clone()).into_response(),
            None => not_found("Merge Request"),
        }
    }

    async fn tree(
        State(state): State<Arc<MockGitLab>>,
        Query(query): Query<HashMap<String, String>>,
    ) -> Response {
        let sha = query.get("ref").map(String::as_str).unwrap_or("");
        let Some(files) = state.trees.get(sha) else {
            return not_found("Tree");
        };
        let root = query.get("path").cloned().unwrap_or_default();

        let mut entries = vec![json!({"id": "t0", "name": "a", "type": "tree", "path": format!("{}/a", root)})];
        entries.extend(files.iter().enumerate().map(|(i, (path, _))| {
            let name = path.rsplit('/').next().unwrap_or(path);
            json!({"id": format!("b{}", i), "name": name, "type": "blob", "path": path})
        }));
        Json(Value::Array(entries)).into_response()
    }

    async fn raw_file(
        State(state): State<Arc<MockGitLab>>,
        Path((_project, file_path)): Path<(u64, String)>,
        Query(query): Query<HashMap<String, String>>,
    ) -> Response {
        let sha = query.get("ref").map(String::as_str).unwrap_or("");
        state
            .trees
            .get(sha)
            .and_then(|files| files.iter().find(|(path, _)| *path == file_path))
            .map(|(_, body)| body.clone().into_response())
            .unwrap_or_else(|| not_found("File"))
    }

    async fn pipelines(
        State(state): State<Arc<MockGitLab>>,
        Query(query): Query<HashMap<String, String>>,
    ) -> impl IntoResponse {
        let selected = state
            .pipelines
            .iter()
            .filter(|p| {
                query.get("ref").is_none_or(|r| p["ref"] == json!(r))
                    && query.get("sha").is_none_or(|s| p["sha"] == json!(s))
            })
            .cloned()
            .collect::<Vec<_>>();
        Json(Value::Array(selected))
    }

    async fn pipeline(
        State(state): State<Arc<MockGitLab>>,
        Path((_project, id)): Path<(u64, u64)>,
    ) -> Response {
        match state.pipelines.iter().find(|p| p["id"] == json!(id)) {
            Some(p) => Json(p.clone()).into_response(),
            None => not_found("Pipeline"),
        }
    }

    async fn pipeline_jobs(
        State(state): State<Arc<MockGitLab>>,
        Path((_project, id)): Path<(u64, u64)>,
    ) -> impl IntoResponse {
        let jobs = state.jobs.lock().expect("jobs lock");
        let selected = jobs
            .values()
            .filter(|job| job["pipeline"]["id"] == json!(id))
            .cloned()
            .collect::<Vec<_>>();
        Json(Value::Array(selected))
    }

    async fn get_job(
        State(state): State<Arc<MockGitLab>>,
        Path((_project, id)): Path<(u64, u64)>,
    ) -> Response {
        let jobs = state.jobs.lock().expect("jobs lock");
        match jobs.get(&id) {
            Some(job) => Json(job.clone()).into_response(),
            None => not_found("Job"),
        }
    }

    async fn trace(Path((_project, id)): Path<(u64, u64)>) -> impl IntoResponse {
        format!("Running job {}\nJob succeeded\n", id)
    }

    fn update_job(state: &MockGitLab, id: u64, status: &str) -> Response {
        let mut jobs = state.jobs.lock().expect("jobs lock");
        match jobs.get_mut(&id) {
            Some(job) => {
                job["status"] = json!(status);
                Json(job.clone()).into_response()
            }
            None => not_found("Job"),
        }
    }

    async fn play(
        State(state): State<Arc<MockGitLab>>,
        Path((_project, id)): Path<(u64, u64)>,
    ) -> Response {
        update_job(&state, id, "pending")
    }

    async fn cancel(
        State(state): State<Arc<MockGitLab>>,
        Path((_project, id)): Path<(u64, u64)>,
    ) -> Response {
        update_job(&state, id, "canceled")
    }

    async fn retry(
        State(state): State<Arc<MockGitLab>>,
        Path((_project, id)): Path<(u64, u64)>,
    ) -> Response {
        let mut jobs = state.jobs.lock().expect("jobs lock");
        let Some(original) = jobs.get(&id).cloned() else {
            return not_found("Job");
        };
        let new_id = state.next_job_id.fetch_add(1, Ordering::SeqCst);
        let mut fresh = original;
        fresh["id"] = json!(new_id);
        fresh["status"] = json!("pending");
        fresh["started_at"] = Value::Null;
        jobs.insert(new_id, fresh.clone());
        Json(fresh).into_response()
    }

    let app = Router::new()
        .route("/api/v4/version", get(version))
        .route("/api/v4/user", get(user))
        .route("/api/v4/projects/{project}", get(project))
        .route(
            "/api/v4/projects/{project}/repository/branches/{branch}",
            get(branch),
        )
        .route("/api/v4/projects/{project}/repository/tags/{tag}", get(tag))
        .route(
            "/api/v4/projects/{project}/repository/commits/{sha}",
            get(commit),
        )
        .route(
            "/api/v4/projects/{project}/merge_requests/{iid}",
            get(merge_request),
        )
        .route("/api/v4/projects/{project}/repository/tree", get(tree))
        .route(
            "/api/v4/projects/{project}/repository/files/{file}/raw",
            get(raw_file),
        )
        .route("/api/v4/projects/{project}/pipelines", get(pipelines))
        .route("/api/v4/projects/{project}/pipelines/{id}", get(pipeline))
        .route(
            "/api/v4/projects/{project}/pipelines/{id}/jobs",
            get(pipeline_jobs),
        )
        .route("/api/v4/projects/{project}/jobs/{id}", get(get_job))
        .route("/api/v4/projects/{project}/jobs/{id}/trace", get(trace))
        .route("/api/v4/projects/{project}/jobs/{id}/play", post(play))
        .route("/api/v4/projects/{project}/jobs/{id}/cancel", post(cancel))
        .route("/api/v4/projects/{project}/jobs/{id}/retry", post(retry))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            count_and_authenticate,
        ))
        .with_state(state);

    spawn_server(app).await
}

struct Harness {
    mock: Arc<MockGitLab>,
    server_addr: SocketAddr,
    client: reqwest::Client,
    shutdowns: Vec<(oneshot::Sender<()>, tokio::task::JoinHandle<()>)>,
}

impl Harness {
    async fn start() -> Self {
        Self::start_with(MockGitLab::new(), &[]).await
    }

    async fn start_with(mock: MockGitLab, overrides: &[(&str, &str)]) -> Self {
        let mock = Arc::new(mock);
        let (gitlab_addr, gitlab_shutdown, gitlab_task) = spawn_mock_gitlab(mock.clone()).await;

        let mut settings = HashMap::from([
            ("SDLC_BIND_ADDR".to_string(), "127.0.0.1:0".to_string()),
            (
                "SDLC_GITLAB_URL".to_string(),
                format!("http://{}", gitlab_addr),
            ),
            ("SDLC_GITLAB_TIMEOUT_MS".to_string(), "2000".to_string()),
            ("SDLC_GITLAB_RETRY_BACKOFF_MS".to_string(), "5".to_string()),
            ("SDLC_REQUEST_TIMEOUT_MS".to_string(), "5000".to_string()),
            ("SDLC_PROJECT_ID_PREFIX".to_string(), "PROJ".to_string()),
            ("SDLC_ENTITY_FETCH_CONCURRENCY".to_string(), "2".to_string()),
        ]);
        for (key, value) in overrides {
            settings.insert(key.to_string(), value.to_string());
        }
        let config = sdlc_server::config::ServerConfig::from_kv(&settings)
            .expect("server config should be valid");

        let (server_addr, server_shutdown, server_task) = spawn_server(
            sdlc_server::http::router(config).expect("server router should init"),
        )
        .await;

        let client = reqwest::Client::new();
        wait_for_healthz(&client, server_addr).await;

        Self {
            mock,
            server_addr,
            client,
            shutdowns: vec![
                (server_shutdown, server_task),
                (gitlab_shutdown, gitlab_task),
            ],
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.server_addr, path)
    }

    async fn get(&self, path: &str) -> reqwest::Response {
        self.client
            .get(self.url(path))
            .header("PRIVATE-TOKEN", TOKEN)
            .send()
            .await
            .expect("request should succeed")
    }

    async fn post(&self, path: &str) -> reqwest::Response {
        self.client
            .post(self.url(path))
            .header("PRIVATE-TOKEN", TOKEN)
            .send()
            .await
            .expect("request should succeed")
    }

    async fn entity_paths(&self, path: &str) -> Vec<String> {
        let response = self.get(path).await;
        assert_eq!(response.status(), StatusCode::OK, "GET {}", path);
        let entities = response.json::<Vec<Value>>().await.expect("entity list json");
        entities
            .iter()
            .map(|e| e["path"].as_str().expect("entity path").to_string())
            .collect()
    }

    async fn stop(self) {
        for (shutdown, task) in self.shutdowns {
            shutdown.send(()).ok();
            let _ = task.await;
        }
    }
}

const REVIEW_TO: &str = "/projects/PROJ1/reviews/42/comparison/to/entities";
const REVIEW_FROM: &str = "/projects/PROJ1/reviews/42/comparison/from/entities";
const WORKSPACE_JOBS: &str = "/projects/PROJ1/workspaces/ws1/workflows/9/jobs";
const GROUP_JOBS: &str = "/projects/PROJ1/groupWorkspaces/modelling/workflows/12/jobs";

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn review_packages_scope_with_and_without_sub_packages() {
    let harness = Harness::start().await;

    assert_eq!(
        harness
            .entity_paths(&format!("{}?package=a&includeSubPackages=false", REVIEW_TO))
            .await,
        vec!["a::B"]
    );
    assert_eq!(
        harness
            .entity_paths(&format!("{}?package=a&includeSubPackages=true", REVIEW_TO))
            .await,
        vec!["a::B", "a::sub::C"]
    );
    assert_eq!(
        harness.entity_paths(REVIEW_TO).await,
        vec!["a::B", "a::sub::C", "x::Y"]
    );

    harness.stop().await;
}

async fn timed_out_message(response: reqwest::Response) -> String {
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = response.json::<Value>().await.expect("error json");
    assert_eq!(body["status"], json!(503));
    assert_eq!(body["cause"], json!("Timeout"));
    body["message"].as_str().unwrap_or_default().to_string()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn slow_backend_calls_time_out_after_one_retry() {
    let harness = Harness::start_with(
        MockGitLab::new().with_merge_request_delay(Duration::from_millis(1500)),
        &[("SDLC_GITLAB_TIMEOUT_MS", "200")],
    )
    .await;

    let message = timed_out_message(harness.get(REVIEW_TO).await).await;
    assert_eq!(message, "timed out accessing review 42 in project PROJ1");
    assert_eq!(harness.mock.calls(), 2);

    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn request_deadline_bounds_the_whole_operation() {
    let harness = Harness::start_with(
        MockGitLab::new().with_merge_request_delay(Duration::from_millis(1500)),
        &[
            ("SDLC_GITLAB_TIMEOUT_MS", "250"),
            ("SDLC_REQUEST_TIMEOUT_MS", "300"),
        ],
    )
    .await;

    let message = timed_out_message(harness.get(REVIEW_TO).await).await;
    assert!(message.starts_with("request deadline exceeded"), "{}", message);

    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn invalid_entities_fail_the_listing_unless_excluded() {
    let harness = Harness::start().await;

    let response = harness.get(REVIEW_FROM).await;
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body = response.json::<Value>().await.expect("error json");
    assert_eq!(body["status"], json!(422));
    assert!(
        body["message"]
            .as_str()
            .is_some_and(|m| m.contains("a::Broken")),
        "message should name the invalid entity: {}",
        body
    );

    assert_eq!(
        harness
            .entity_paths(&format!("{}?excludeInvalid=true", REVIEW_FROM))
            .await,
        vec!["a::B", "x::Y"]
    );

    let response = harness.get(&format!("{}/a::Broken", REVIEW_FROM)).await;
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

    let response = harness
        .get(&format!("{}/a::Broken?excludeInvalid=true", REVIEW_FROM))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.json::<Value>().await.expect("json"), Value::Null);

    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn tagged_value_and_name_regexes_filter_entities() {
    let harness = Harness::start().await;

    assert_eq!(
        harness
            .entity_paths(&format!(
                "{}?taggedValue=meta::MyProfile.since%2F2024.*",
                REVIEW_TO
            ))
            .await,
        vec!["a::B"]
    );

    assert_eq!(
        harness
            .entity_paths("/projects/PROJ1/revisions/rev-sha/entities?name=%5EFoo.*")
            .await,
        vec!["a::FooOne", "b::Foo"]
    );

    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn invalid_regex_is_rejected_before_any_backend_call() {
    let harness = Harness::start().await;

    let response = harness
        .get(&format!("{}?name=%5Bunclosed", REVIEW_TO))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = response.json::<Value>().await.expect("error json");
    assert_eq!(body["status"], json!(400));
    assert_eq!(harness.mock.calls(), 0);

    let response = harness
        .get(&format!("{}?includeSubPackages=maybe", REVIEW_TO))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(harness.mock.calls(), 0);

    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_credentials_are_unauthorized_without_backend_calls() {
    let harness = Harness::start().await;

    let response = harness
        .client
        .get(harness.url(REVIEW_TO))
        .send()
        .await
        .expect("request should succeed");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(harness.mock.calls(), 0);

    let response = harness
        .client
        .get(harness.url(REVIEW_TO))
        .header("PRIVATE-TOKEN", "wrong-token")
        .send()
        .await
        .expect("request should succeed");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = harness
        .client
        .get(harness.url(REVIEW_TO))
        .bearer_auth(TOKEN)
        .send()
        .await
        .expect("request should succeed");
    assert_eq!(response.status(), StatusCode::OK);

    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unchanged_review_sides_list_the_same_entities() {
    let harness = Harness::start().await;

    let from = harness
        .entity_paths("/projects/PROJ1/reviews/43/comparison/from/entities")
        .await;
    let to = harness
        .entity_paths("/projects/PROJ1/reviews/43/comparison/to/entities")
        .await;
    assert_eq!(from, to);
    assert_eq!(from, vec!["a::B", "x::Y"]);

    let response = harness
        .get("/projects/PROJ1/reviews/R42/comparison/to/entities")
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn entities_resolve_for_workspaces_versions_and_single_paths() {
    let harness = Harness::start().await;

    assert_eq!(
        harness
            .entity_paths(
                "/projects/PROJ1/workspaces/ws1/entities?stereotype=meta::pure::profiles::doc.deprecated"
            )
            .await,
        vec!["model::Person"]
    );
    assert_eq!(
        harness
            .entity_paths("/projects/1/versions/1.2.3/entities")
            .await,
        vec!["model::Released"]
    );

    let response = harness.get(&format!("{}/a::sub::C", REVIEW_TO)).await;
    assert_eq!(response.status(), StatusCode::OK);
    let entity = response.json::<Value>().await.expect("entity json");
    assert_eq!(entity["path"], json!("a::sub::C"));
    assert_eq!(
        entity["classifierPath"],
        json!("meta::pure::metamodel::type::Class")
    );
    assert_eq!(entity["content"]["name"], json!("C"));

    let response = harness.get(&format!("{}/a::Missing", REVIEW_TO)).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = harness.get("/projects/PROJ1/versions/1.2/entities").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = harness.get("/projects/OTHER7/revisions/HEAD/entities").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn manual_job_runs_and_state_guards_reject_invalid_transitions() {
    let harness = Harness::start().await;

    let response = harness.get(&format!("{}/7", WORKSPACE_JOBS)).await;
    assert_eq!(response.status(), StatusCode::OK);
    let job = response.json::<Value>().await.expect("job json");
    assert_eq!(job["status"], json!("MANUAL"));
    assert_eq!(job["workflowId"], json!("9"));
    assert_eq!(job["projectId"], json!("PROJ1"));

    let response = harness.post(&format!("{}/7/cancel", WORKSPACE_JOBS)).await;
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let response = harness.post(&format!("{}/7/retry", WORKSPACE_JOBS)).await;
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let response = harness.post(&format!("{}/7/run", WORKSPACE_JOBS)).await;
    assert_eq!(response.status(), StatusCode::OK);
    let job = response.json::<Value>().await.expect("job json");
    assert!(
        matches!(job["status"].as_str(), Some("PENDING") | Some("IN_PROGRESS")),
        "unexpected status after run: {}",
        job
    );

    let response = harness.post(&format!("{}/7/run", WORKSPACE_JOBS)).await;
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let response = harness.post(&format!("{}/7/cancel", WORKSPACE_JOBS)).await;
    assert_eq!(response.status(), StatusCode::OK);
    let job = response.json::<Value>().await.expect("job json");
    assert_eq!(job["status"], json!("CANCELED"));

    let response = harness.post(&format!("{}/7/retry", WORKSPACE_JOBS)).await;
    assert_eq!(response.status(), StatusCode::OK);
    let job = response.json::<Value>().await.expect("job json");
    assert_eq!(job["id"], json!("100"));
    assert_eq!(job["status"], json!("PENDING"));

    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn job_logs_stream_as_attachments() {
    let harness = Harness::start().await;

    let response = harness.get(&format!("{}/8/logs", WORKSPACE_JOBS)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get("content-disposition")
            .and_then(|v| v.to_str().ok()),
        Some("attachment; filename=\"8.log\"")
    );
    assert!(
        response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with("text/plain"))
    );
    assert_eq!(
        response.text().await.expect("log body"),
        "Running job 8\nJob succeeded\n"
    );

    let response = harness.get(&format!("{}/7/logs", WORKSPACE_JOBS)).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn workflows_are_scoped_to_their_context() {
    let harness = Harness::start().await;

    let response = harness.get("/projects/PROJ1/workspaces/ws1/workflows").await;
    assert_eq!(response.status(), StatusCode::OK);
    let workflows = response.json::<Vec<Value>>().await.expect("workflows json");
    assert_eq!(workflows.len(), 1);
    assert_eq!(workflows[0]["id"], json!("9"));
    assert_eq!(workflows[0]["status"], json!("IN_PROGRESS"));

    let response = harness.get("/projects/PROJ1/workspaces/ws1/workflows/10").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = harness
        .get("/projects/PROJ1/workspaces/ws1/workflows/10/jobs/11")
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = harness
        .get(&format!("{}?status=FAILED&status=MANUAL", WORKSPACE_JOBS))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let jobs = response.json::<Vec<Value>>().await.expect("jobs json");
    let ids = jobs.iter().map(|j| j["id"].clone()).collect::<Vec<_>>();
    assert_eq!(ids, vec![json!("7"), json!("8")]);

    let response = harness.get(&format!("{}?status=UNKNOWN", WORKSPACE_JOBS)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(
        response
            .json::<Vec<Value>>()
            .await
            .expect("jobs json")
            .is_empty()
    );

    let response = harness.get(&format!("{}?status=BOGUS", WORKSPACE_JOBS)).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = harness
        .get("/projects/PROJ1/groupWorkspaces/modelling/workflows/12/jobs/13")
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let job = response.json::<Value>().await.expect("job json");
    assert_eq!(job["status"], json!("PENDING"));

    let response = harness.get("/projects/PROJ1/workflows").await;
    assert_eq!(response.status(), StatusCode::OK);
    let workflows = response.json::<Vec<Value>>().await.expect("workflows json");
    assert_eq!(workflows.len(), 1);
    assert_eq!(workflows[0]["id"], json!("10"));
    assert_eq!(workflows[0]["status"], json!("SUCCEEDED"));

    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn group_workspace_jobs_support_logs_and_actions() {
    let harness = Harness::start().await;

    let response = harness.get(GROUP_JOBS).await;
    assert_eq!(response.status(), StatusCode::OK);
    let jobs = response.json::<Vec<Value>>().await.expect("jobs json");
    let ids = jobs.iter().map(|j| j["id"].clone()).collect::<Vec<_>>();
    assert_eq!(ids, vec![json!("13"), json!("14")]);

    let response = harness.get(&format!("{}/14/logs", GROUP_JOBS)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get("content-disposition")
            .and_then(|v| v.to_str().ok()),
        Some("attachment; filename=\"14.log\"")
    );
    assert_eq!(
        response.text().await.expect("log body"),
        "Running job 14\nJob succeeded\n"
    );

    let response = harness.post(&format!("{}/13/run", GROUP_JOBS)).await;
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let response = harness.post(&format!("{}/13/cancel", GROUP_JOBS)).await;
    assert_eq!(response.status(), StatusCode::OK);
    let job = response.json::<Value>().await.expect("job json");
    assert_eq!(job["status"], json!("CANCELED"));
    assert_eq!(job["workflowId"], json!("12"));

    let response = harness.post(&format!("{}/14/retry", GROUP_JOBS)).await;
    assert_eq!(response.status(), StatusCode::OK);
    let job = response.json::<Value>().await.expect("job json");
    assert_eq!(job["id"], json!("100"));
    assert_eq!(job["status"], json!("PENDING"));

    let response = harness
        .post("/projects/PROJ1/groupWorkspaces/modelling/workflows/9/jobs/8/retry")
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn tokens_never_reach_logs_and_metrics_are_exposed() {
    let log_buf = init_test_tracing();
    let harness = Harness::start().await;

    let response = harness.get(REVIEW_TO).await;
    assert_eq!(response.status(), StatusCode::OK);
    let response = harness.post(&format!("{}/7/cancel", WORKSPACE_JOBS)).await;
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let response = harness.client.get(harness.url("/readyz")).send().await.expect("readyz");
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.json::<Value>().await.expect("readyz json");
    assert_eq!(body["checks"]["gitlab"], json!(true));

    let response = harness.client.get(harness.url("/metrics")).send().await.expect("metrics");
    assert_eq!(response.status(), StatusCode::OK);
    let metrics = response.text().await.expect("metrics body");
    assert!(metrics.contains("sdlc_http_requests_total"));
    assert!(metrics.contains("sdlc_backend_calls_total"));

    harness.stop().await;

    let logs = {
        let lock = log_buf.lock().expect("log lock should be available");
        String::from_utf8_lossy(&lock).to_string()
    };
    assert!(logs.contains("sdlc.request"), "request spans should be logged");
    assert!(!logs.contains(TOKEN), "logs must not contain caller tokens");
}

async fn spawn_server(
    app: Router,
) -> (SocketAddr, oneshot::Sender<()>, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind should succeed");
    let addr = listener.local_addr().expect("local_addr should succeed");

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(async move {
        let _ = axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await;
    });

    (addr, shutdown_tx, handle)
}

async fn wait_for_healthz(client: &reqwest::Client, addr: SocketAddr) {
    let url = format!("http://{}/healthz", addr);

    for _ in 0..50 {
        if let Ok(response) = client.get(&url).send().await
            && response.status().is_success()
        {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    panic!("server did not become ready at {}", url);
}

#[derive(Clone)]
struct TestWriter {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl Write for TestWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut lock = self
            .buf
            .lock()
            .map_err(|_| std::io::Error::other("log mutex poisoned"))?;
        lock.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn init_test_tracing() -> Arc<Mutex<Vec<u8>>> {
    static LOG_BUF: OnceLock<Arc<Mutex<Vec<u8>>>> = OnceLock::new();

    LOG_BUF
        .get_or_init(|| {
            let buf = Arc::new(Mutex::new(Vec::new()));
            let make_writer = {
                let buf = buf.clone();
                move || TestWriter { buf: buf.clone() }
            };

            let subscriber = tracing_subscriber::fmt()
                .with_env_filter(tracing_subscriber::EnvFilter::new("info"))
                .with_ansi(false)
                .with_writer(make_writer)
                .finish();

            tracing::subscriber::set_global_default(subscriber)
                .expect("global tracing subscriber should be set once");

            buf
        })
        .clone()
}
