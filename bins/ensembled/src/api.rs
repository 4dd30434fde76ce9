// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! HTTP routes over a [`QueryHandler`].

use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use ensemble_cache::{CacheStore, JobId, Signature};
use ensemble_fingerprint::SimulationRequest;
use ensemble_jobs::{CoordinatorError, Executor};
use ensemble_query::{CachedReply, QueryError, QueryHandler, ResultsPayload, SignalRequest};
use serde_json::json;
use tracing::{error, warn};

/// Build the `/api/v2` router.
pub fn router<C, E>(handler: QueryHandler<C, E>) -> Router
where
    C: CacheStore + 'static,
    E: Executor,
{
    Router::new()
        .route("/api/v2/simulation/gillespy2/run", post(run::<C, E>))
        .route(
            "/api/v2/simulation/gillespy2/{signature}/{n}/status",
            get(status::<C, E>),
        )
        .route(
            "/api/v2/simulation/gillespy2/{signature}/{n}/results",
            get(results::<C, E>),
        )
        .route(
            "/api/v2/cache/gillespy2/{signature}/{n}/is_cached",
            get(is_cached::<C, E>),
        )
        .route("/api/v2/cloud/sourceip", get(source_ip))
        .route("/api/v2/jobs/{job_id}", get(job::<C, E>))
        .route("/api/v2/jobs/{job_id}/signal", post(signal::<C, E>))
        .with_state(handler)
}

/// Error body `{"error": ...}` with a matching status code.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<QueryError> for ApiError {
    fn from(err: QueryError) -> Self {
        let status = match &err {
            QueryError::InvalidModel(_) => StatusCode::BAD_REQUEST,
            QueryError::NotFound { .. } => StatusCode::NOT_FOUND,
            QueryError::Coordinator(inner) => match inner {
                CoordinatorError::UnknownJob { .. } => StatusCode::NOT_FOUND,
                CoordinatorError::IllegalTransition { .. }
                | CoordinatorError::ResultsPending { .. } => StatusCode::CONFLICT,
                CoordinatorError::NoRuntime | CoordinatorError::ShuttingDown => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
            },
            QueryError::Cache(_) => {
                error!(%err, "cache failure while serving request");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self::new(status, err.to_string())
    }
}

fn parse_key(signature: &str, n: u64) -> Result<(Signature, u64), ApiError> {
    let signature = signature
        .parse::<Signature>()
        .map_err(|e| ApiError::bad_request(e.to_string()))?;
    if n == 0 {
        return Err(ApiError::bad_request("n must be at least 1"));
    }
    Ok((signature, n))
}

/// Run `f` on the blocking pool. Cache lookups may touch the disk and must
/// stay off the reactor.
async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

fn parse_job(job_id: &str) -> Result<JobId, ApiError> {
    job_id
        .parse()
        .map_err(|_| ApiError::bad_request(format!("malformed job id {job_id:?}")))
}

async fn run<C, E>(
    State(q): State<QueryHandler<C, E>>,
    Json(request): Json<SimulationRequest>,
) -> Result<impl IntoResponse, ApiError>
where
    C: CacheStore + 'static,
    E: Executor,
{
    let ack = blocking(move || q.submit(&request)).await?.map_err(|err| {
        warn!(%err, "run rejected");
        ApiError::from(err)
    })?;
    Ok(Json(ack))
}

async fn status<C, E>(
    State(q): State<QueryHandler<C, E>>,
    Path((signature, n)): Path<(String, u64)>,
) -> Result<impl IntoResponse, ApiError>
where
    C: CacheStore + 'static,
    E: Executor,
{
    let (signature, n) = parse_key(&signature, n)?;
    let report = blocking(move || q.status(&signature, n)).await?;
    Ok(Json(report))
}

async fn results<C, E>(
    State(q): State<QueryHandler<C, E>>,
    Path((signature, n)): Path<(String, u64)>,
) -> Result<impl IntoResponse, ApiError>
where
    C: CacheStore + 'static,
    E: Executor,
{
    let (signature, n) = parse_key(&signature, n)?;
    let trajectories = blocking(move || q.results(&signature, n)).await??;
    Ok(Json(ResultsPayload { trajectories }))
}

async fn is_cached<C, E>(
    State(q): State<QueryHandler<C, E>>,
    Path((signature, n)): Path<(String, u64)>,
) -> Result<impl IntoResponse, ApiError>
where
    C: CacheStore + 'static,
    E: Executor,
{
    let (signature, n) = parse_key(&signature, n)?;
    let cached = blocking(move || q.is_cached(&signature, n)).await?;
    Ok(Json(CachedReply { cached }))
}

async fn source_ip(ConnectInfo(addr): ConnectInfo<SocketAddr>) -> impl IntoResponse {
    Json(json!({ "source_ip": addr.ip().to_string() }))
}

async fn job<C, E>(
    State(q): State<QueryHandler<C, E>>,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, ApiError>
where
    C: CacheStore + 'static,
    E: Executor,
{
    let job = parse_job(&job_id)?;
    q.job(job)
        .map(Json)
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, format!("unknown job {job}")))
}

async fn signal<C, E>(
    State(q): State<QueryHandler<C, E>>,
    Path(job_id): Path<String>,
    Json(body): Json<SignalRequest>,
) -> Result<impl IntoResponse, ApiError>
where
    C: CacheStore + 'static,
    E: Executor,
{
    let job = parse_job(&job_id)?;
    let status = q.signal(job, body.status)?;
    Ok(Json(json!({ "status": status })))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::extract::connect_info::MockConnectInfo;
    use axum::http::{header, Method, Request};
    use ensemble_dry_tests::{decay_request, CoordinatorHarness, ScriptedExecutor};
    use ensemble_jobs::JobStatus;
    use serde_json::Value;
    use std::time::Duration;
    use tower::ServiceExt;

    fn app(h: &CoordinatorHarness) -> Router {
        router(QueryHandler::new(h.coordinator.clone()))
            .layer(MockConnectInfo(SocketAddr::from(([10, 1, 2, 3], 4711))))
    }

    async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut req = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(v) => {
                req = req.header(header::CONTENT_TYPE, "application/json");
                Body::from(v.to_string())
            }
            None => Body::empty(),
        };
        let response = app.clone().oneshot(req.body(body).unwrap()).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn run_then_fetch_results() {
        let h = CoordinatorHarness::new(ScriptedExecutor::new());
        let app = app(&h);
        let request = serde_json::to_value(decay_request(3)).unwrap();

        let (code, ack) = call(&app, Method::POST, "/api/v2/simulation/gillespy2/run", Some(request)).await;
        assert_eq!(code, StatusCode::OK);
        let sig = ack["signature"].as_str().unwrap().to_owned();
        let job: JobId = ack["job_id"].as_str().unwrap().parse().unwrap();
        tokio::time::timeout(Duration::from_secs(5), h.coordinator.wait(job))
            .await
            .unwrap()
            .unwrap();

        let (code, body) = call(&app, Method::GET, &format!("/api/v2/simulation/gillespy2/{sig}/3/status"), None).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["status"], "ready");

        let (code, body) = call(&app, Method::GET, &format!("/api/v2/simulation/gillespy2/{sig}/2/results"), None).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["trajectories"].as_array().unwrap().len(), 2);

        let (_, body) = call(&app, Method::GET, &format!("/api/v2/cache/gillespy2/{sig}/4/is_cached"), None).await;
        assert_eq!(body["cached"], false);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn bad_keys_are_client_errors() {
        let h = CoordinatorHarness::new(ScriptedExecutor::new());
        let app = app(&h);
        let sig = "ab".repeat(32);

        let (code, _) = call(&app, Method::GET, &format!("/api/v2/simulation/gillespy2/{sig}/0/status"), None).await;
        assert_eq!(code, StatusCode::BAD_REQUEST);
        let (code, _) = call(&app, Method::GET, "/api/v2/simulation/gillespy2/xyz/1/status", None).await;
        assert_eq!(code, StatusCode::BAD_REQUEST);
        let (code, body) = call(&app, Method::GET, &format!("/api/v2/simulation/gillespy2/{sig}/5/results"), None).await;
        assert_eq!(code, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("fewer than 5"));

        let invalid = serde_json::json!({ "model": [1, 2, 3] });
        let (code, _) = call(&app, Method::POST, "/api/v2/simulation/gillespy2/run", Some(invalid)).await;
        assert_eq!(code, StatusCode::BAD_REQUEST);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn job_routes_report_and_signal() {
        let h = CoordinatorHarness::new(ScriptedExecutor::held());
        let app = app(&h);
        let (sig, reservation) = h.reserve(&decay_request(2)).unwrap();
        let job = reservation.job().unwrap().job_id;

        let (code, body) = call(&app, Method::GET, &format!("/api/v2/jobs/{job}"), None).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["signature"], sig.to_hex());

        let stop = serde_json::json!({ "status": "STOPPED" });
        let (code, body) = call(&app, Method::POST, &format!("/api/v2/jobs/{job}/signal"), Some(stop)).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["status"], "STOPPED");
        assert_eq!(h.coordinator.poll(job), Some(JobStatus::Stopped));

        let resume = serde_json::json!({ "status": "RUNNING" });
        let (code, _) = call(&app, Method::POST, &format!("/api/v2/jobs/{job}/signal"), Some(resume)).await;
        assert_eq!(code, StatusCode::CONFLICT);

        let (code, _) = call(&app, Method::GET, &format!("/api/v2/jobs/{}", JobId::new()), None).await;
        assert_eq!(code, StatusCode::NOT_FOUND);
        let (code, _) = call(&app, Method::GET, "/api/v2/jobs/not-a-uuid", None).await;
        assert_eq!(code, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn source_ip_echoes_the_peer() {
        let h = CoordinatorHarness::new(ScriptedExecutor::new());
        let (code, body) = call(&app(&h), Method::GET, "/api/v2/cloud/sourceip", None).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["source_ip"], "10.1.2.3");
    }
}
