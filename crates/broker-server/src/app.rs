use crate::metrics;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use broker_core::job::format_ts;
use broker_core::{
    BrokerError, Disposition, FailInfo, JobBroker, JobRecord, Lease, Pushed, SetEntry, SetKey,
    SetKind, Stats,
};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(Clone)]
pub struct AppState {
    pub broker: Arc<dyn JobBroker>,
}

/// The fields of a job payload the broker interprets. Anything else is
/// carried through untouched.
#[derive(Debug, serde::Deserialize, utoipa::ToSchema)]
pub struct JobPayload {
    pub jid: String,
    pub jobtype: String,
    /// Defaults to `default`.
    pub queue: Option<String>,
    #[schema(value_type = Object)]
    pub args: Option<serde_json::Value>,
    #[schema(value_type = Object)]
    pub custom: Option<serde_json::Value>,
    /// RFC 3339; a future time routes the job to the scheduled set.
    pub at: Option<String>,
    /// Per-job override of the retry limit.
    pub retry: Option<i64>,
    /// Lease length in seconds, overriding the fetch request.
    pub reserve_for: Option<u64>,
}

#[derive(Debug, serde::Deserialize, utoipa::ToSchema)]
pub struct FetchRequest {
    /// Queues to try, in order.
    pub queues: Vec<String>,
    pub lease_ms: Option<u64>,
}

#[derive(Debug, serde::Serialize, utoipa::ToSchema)]
pub struct FetchResponse {
    #[schema(value_type = Object)]
    pub job: JobRecord,
}

#[derive(Debug, Default, serde::Deserialize, utoipa::ToSchema)]
pub struct FailRequest {
    pub errtype: Option<String>,
    pub message: Option<String>,
    pub backtrace: Option<Vec<String>>,
}

impl From<FailRequest> for FailInfo {
    fn from(req: FailRequest) -> Self {
        FailInfo {
            errtype: req.errtype,
            message: req.message,
            backtrace: req.backtrace,
        }
    }
}

#[derive(Debug, serde::Serialize, utoipa::ToSchema)]
pub struct StatsResponse {
    pub queues: std::collections::BTreeMap<String, usize>,
    pub scheduled: usize,
    pub retries: usize,
    pub dead: usize,
    pub working: usize,
}

impl From<Stats> for StatsResponse {
    fn from(s: Stats) -> Self {
        Self {
            queues: s.queues,
            scheduled: s.scheduled,
            retries: s.retries,
            dead: s.dead,
            working: s.working,
        }
    }
}

#[derive(Debug, serde::Serialize, utoipa::ToSchema)]
pub struct QueueSummary {
    pub name: String,
    pub size: usize,
}

#[derive(Debug, serde::Serialize, utoipa::ToSchema)]
pub struct QueueJobsResponse {
    pub queue: String,
    #[schema(value_type = Vec<Object>)]
    pub jobs: Vec<JobRecord>,
}

#[derive(Debug, serde::Serialize, utoipa::ToSchema)]
pub struct SetEntryView {
    /// `{timestamp}|{jid}`; percent-encode the `|` in paths.
    pub key: String,
    #[schema(value_type = Object)]
    pub job: JobRecord,
}

impl From<SetEntry> for SetEntryView {
    fn from(e: SetEntry) -> Self {
        Self {
            key: e.key.to_string(),
            job: e.job,
        }
    }
}

#[derive(Debug, serde::Serialize, utoipa::ToSchema)]
pub struct SetEntriesResponse {
    pub set: String,
    pub entries: Vec<SetEntryView>,
}

#[derive(Debug, serde::Serialize, utoipa::ToSchema)]
pub struct LeaseView {
    pub jid: String,
    pub queue: String,
    /// RFC 3339; the reaper reclaims the job after this.
    pub expires_at: String,
    #[schema(value_type = Object)]
    pub job: JobRecord,
}

impl From<Lease> for LeaseView {
    fn from(l: Lease) -> Self {
        Self {
            jid: l.job.jid.clone(),
            queue: l.queue,
            expires_at: format_ts(&l.expires_at),
            job: l.job,
        }
    }
}

#[derive(Debug, serde::Serialize, utoipa::ToSchema)]
pub struct RetriedResponse {
    pub queue: String,
}

#[derive(Debug, serde::Deserialize, utoipa::IntoParams, utoipa::ToSchema)]
pub struct LimitQuery {
    /// Max number of jobs to return (1–500).
    pub limit: Option<usize>,
}

#[derive(Debug, serde::Deserialize, utoipa::IntoParams, utoipa::ToSchema)]
pub struct PageQuery {
    pub offset: Option<usize>,
    /// Max number of entries to return (1–500).
    pub limit: Option<usize>,
}

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Job Broker API",
        version = "0.1.0",
        description = "Push, fetch, ack and fail jobs; inspect queues and the scheduled, retry and dead sets."
    ),
    paths(
        push_job,
        fetch_job,
        ack_job,
        fail_job,
        stats,
        list_queues,
        queue_jobs,
        working,
        set_entries,
        set_entry,
        retry_entry,
        delete_entry,
        kill_entry
    ),
    components(schemas(
        JobPayload,
        FetchRequest,
        FetchResponse,
        FailRequest,
        StatsResponse,
        QueueSummary,
        QueueJobsResponse,
        SetEntryView,
        SetEntriesResponse,
        LeaseView,
        RetriedResponse,
        LimitQuery,
        PageQuery
    ))
)]
struct ApiDoc;

async fn metrics_handler(State(state): State<AppState>) -> Response {
    let working = state.broker.stats().await.working;
    metrics::WORKING_SET_SIZE.set(working as i64);
    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        metrics::gather(),
    )
        .into_response()
}

pub fn build_app(state: AppState) -> Router {
    let unauthenticated = Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/metrics", get(metrics_handler));

    let worker_api = Router::new()
        .route("/v1/jobs", post(push_job))
        .route("/v1/fetch", post(fetch_job))
        .route("/v1/jobs/{jid}/ack", post(ack_job))
        .route("/v1/jobs/{jid}/fail", post(fail_job));

    let monitoring = Router::new()
        .route("/v1/stats", get(stats))
        .route("/v1/queues", get(list_queues))
        .route("/v1/queues/{queue}", get(queue_jobs))
        .route("/v1/working", get(working))
        .route("/v1/sets/{set}", get(set_entries))
        .route("/v1/sets/{set}/{key}", get(set_entry).delete(delete_entry))
        .route("/v1/sets/{set}/{key}/retry", post(retry_entry))
        .route("/v1/sets/retries/{key}/kill", post(kill_entry));

    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .merge(unauthenticated)
        .merge(worker_api)
        .merge(monitoring)
        .with_state(state)
}

/// Push a job. A future `at` schedules it instead of queueing it.
#[utoipa::path(
    post,
    path = "/v1/jobs",
    request_body = JobPayload,
    responses(
        (status = 204, description = "Job accepted"),
        (status = 400, description = "Malformed payload"),
        (status = 500, description = "Internal error")
    )
)]
async fn push_job(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<StatusCode, (StatusCode, String)> {
    let job = JobRecord::parse(&body).map_err(map_err)?;
    let pushed = state.broker.push(job).await.map_err(map_err)?;
    if let Pushed::Scheduled { key } = &pushed {
        tracing::debug!(key = %key, "push scheduled");
    }
    metrics::JOBS_PUSHED.inc();
    Ok(StatusCode::NO_CONTENT)
}

/// Lease the head of the first non-empty queue.
#[utoipa::path(
    post,
    path = "/v1/fetch",
    request_body = FetchRequest,
    responses(
        (status = 200, description = "Leased job", body = FetchResponse),
        (status = 204, description = "All queues empty"),
        (status = 400, description = "No queues given"),
        (status = 409, description = "Job id already leased"),
        (status = 500, description = "Internal error")
    )
)]
async fn fetch_job(
    State(state): State<AppState>,
    Json(req): Json<FetchRequest>,
) -> Result<Response, (StatusCode, String)> {
    let ttl = req.lease_ms.map(Duration::from_millis);
    let job = state
        .broker
        .fetch(&req.queues, ttl)
        .await
        .map_err(map_err)?;

    match job {
        Some(job) => {
            metrics::JOBS_FETCHED.inc();
            Ok(Json(FetchResponse { job }).into_response())
        }
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

/// Acknowledge (complete) a leased job.
#[utoipa::path(
    post,
    path = "/v1/jobs/{jid}/ack",
    params(("jid" = String, Path, description = "Job ID")),
    responses(
        (status = 204, description = "Job acknowledged"),
        (status = 404, description = "No live lease for this job"),
        (status = 500, description = "Internal error")
    )
)]
async fn ack_job(
    State(state): State<AppState>,
    Path(jid): Path<String>,
) -> Result<StatusCode, (StatusCode, String)> {
    state.broker.ack(&jid).await.map_err(map_err)?;
    metrics::JOBS_ACKED.inc();
    Ok(StatusCode::NO_CONTENT)
}

/// Report a failed attempt; the job goes to the retry set or the dead set.
#[utoipa::path(
    post,
    path = "/v1/jobs/{jid}/fail",
    params(("jid" = String, Path, description = "Job ID")),
    request_body = FailRequest,
    responses(
        (status = 204, description = "Failure recorded"),
        (status = 404, description = "No live lease for this job"),
        (status = 500, description = "Internal error")
    )
)]
async fn fail_job(
    State(state): State<AppState>,
    Path(jid): Path<String>,
    body: Option<Json<FailRequest>>,
) -> Result<StatusCode, (StatusCode, String)> {
    let req = body.map(|Json(r)| r).unwrap_or_default();
    let disposition = state.broker.fail(&jid, req.into()).await.map_err(map_err)?;
    metrics::JOBS_FAILED.inc();
    if disposition == Disposition::Dead {
        metrics::JOBS_DEAD.inc();
    }
    Ok(StatusCode::NO_CONTENT)
}

/// Sizes of every queue and set.
#[utoipa::path(
    get,
    path = "/v1/stats",
    responses((status = 200, description = "Broker totals", body = StatsResponse))
)]
async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(state.broker.stats().await.into())
}

#[utoipa::path(
    get,
    path = "/v1/queues",
    responses((status = 200, description = "Known queues", body = Vec<QueueSummary>))
)]
async fn list_queues(State(state): State<AppState>) -> Json<Vec<QueueSummary>> {
    let queues = state
        .broker
        .stats()
        .await
        .queues
        .into_iter()
        .map(|(name, size)| QueueSummary { name, size })
        .collect();
    Json(queues)
}

/// Jobs waiting in a queue, oldest first.
#[utoipa::path(
    get,
    path = "/v1/queues/{queue}",
    params(
        ("queue" = String, Path, description = "Queue name"),
        LimitQuery
    ),
    responses(
        (status = 200, description = "Queued jobs", body = QueueJobsResponse),
        (status = 404, description = "Unknown queue")
    )
)]
async fn queue_jobs(
    State(state): State<AppState>,
    Path(queue): Path<String>,
    Query(q): Query<LimitQuery>,
) -> Result<Json<QueueJobsResponse>, (StatusCode, String)> {
    let limit = q.limit.unwrap_or(50).clamp(1, 500);
    let jobs = state
        .broker
        .queue_jobs(&queue, limit)
        .await
        .map_err(map_err)?;
    Ok(Json(QueueJobsResponse { queue, jobs }))
}

/// Leased jobs, soonest expiry first.
#[utoipa::path(
    get,
    path = "/v1/working",
    responses((status = 200, description = "Current leases", body = Vec<LeaseView>))
)]
async fn working(State(state): State<AppState>) -> Json<Vec<LeaseView>> {
    let leases = state
        .broker
        .working()
        .await
        .into_iter()
        .map(LeaseView::from)
        .collect();
    Json(leases)
}

#[utoipa::path(
    get,
    path = "/v1/sets/{set}",
    params(
        ("set" = String, Path, description = "scheduled, retries or dead"),
        PageQuery
    ),
    responses(
        (status = 200, description = "Entries in key order", body = SetEntriesResponse),
        (status = 400, description = "Unknown set")
    )
)]
async fn set_entries(
    State(state): State<AppState>,
    Path(set): Path<String>,
    Query(q): Query<PageQuery>,
) -> Result<Json<SetEntriesResponse>, (StatusCode, String)> {
    let set: SetKind = set.parse().map_err(map_err)?;
    let offset = q.offset.unwrap_or(0);
    let limit = q.limit.unwrap_or(50).clamp(1, 500);
    let entries = state
        .broker
        .set_entries(set, offset, limit)
        .await
        .into_iter()
        .map(SetEntryView::from)
        .collect();
    Ok(Json(SetEntriesResponse {
        set: set.to_string(),
        entries,
    }))
}

fn parse_entry(set: &str, key: &str) -> Result<(SetKind, SetKey), (StatusCode, String)> {
    let set = set.parse().map_err(map_err)?;
    let key = key.parse().map_err(map_err)?;
    Ok((set, key))
}

#[utoipa::path(
    get,
    path = "/v1/sets/{set}/{key}",
    params(
        ("set" = String, Path, description = "scheduled, retries or dead"),
        ("key" = String, Path, description = "Entry key")
    ),
    responses(
        (status = 200, description = "The entry", body = SetEntryView),
        (status = 400, description = "Malformed set or key"),
        (status = 404, description = "No such entry")
    )
)]
async fn set_entry(
    State(state): State<AppState>,
    Path((set, key)): Path<(String, String)>,
) -> Result<Json<SetEntryView>, (StatusCode, String)> {
    let (set, key) = parse_entry(&set, &key)?;
    let job = state.broker.set_entry(set, &key).await.map_err(map_err)?;
    Ok(Json(SetEntry { key, job }.into()))
}

/// Move an entry into its queue now.
#[utoipa::path(
    post,
    path = "/v1/sets/{set}/{key}/retry",
    params(
        ("set" = String, Path, description = "scheduled, retries or dead"),
        ("key" = String, Path, description = "Entry key")
    ),
    responses(
        (status = 200, description = "Entry queued", body = RetriedResponse),
        (status = 400, description = "Malformed set or key"),
        (status = 404, description = "No such entry")
    )
)]
async fn retry_entry(
    State(state): State<AppState>,
    Path((set, key)): Path<(String, String)>,
) -> Result<Json<RetriedResponse>, (StatusCode, String)> {
    let (set, key) = parse_entry(&set, &key)?;
    let queue = state.broker.retry_now(set, &key).await.map_err(map_err)?;
    Ok(Json(RetriedResponse { queue }))
}

#[utoipa::path(
    delete,
    path = "/v1/sets/{set}/{key}",
    params(
        ("set" = String, Path, description = "scheduled, retries or dead"),
        ("key" = String, Path, description = "Entry key")
    ),
    responses(
        (status = 204, description = "Entry deleted"),
        (status = 400, description = "Malformed set or key"),
        (status = 404, description = "No such entry")
    )
)]
async fn delete_entry(
    State(state): State<AppState>,
    Path((set, key)): Path<(String, String)>,
) -> Result<StatusCode, (StatusCode, String)> {
    let (set, key) = parse_entry(&set, &key)?;
    state.broker.delete(set, &key).await.map_err(map_err)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Give up on a retry entry and move it to the dead set.
#[utoipa::path(
    post,
    path = "/v1/sets/retries/{key}/kill",
    params(("key" = String, Path, description = "Entry key")),
    responses(
        (status = 204, description = "Entry moved to the dead set"),
        (status = 400, description = "Malformed key"),
        (status = 404, description = "No such entry")
    )
)]
async fn kill_entry(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<StatusCode, (StatusCode, String)> {
    let key: SetKey = key.parse().map_err(map_err)?;
    state.broker.kill(&key).await.map_err(map_err)?;
    metrics::JOBS_DEAD.inc();
    Ok(StatusCode::NO_CONTENT)
}

fn map_err(e: BrokerError) -> (StatusCode, String) {
    match e {
        BrokerError::Validation(_) => (StatusCode::BAD_REQUEST, e.to_string()),
        BrokerError::NotFound(_) => (StatusCode::NOT_FOUND, e.to_string()),
        BrokerError::Conflict(_) => (StatusCode::CONFLICT, e.to_string()),
        BrokerError::Storage(_) => {
            tracing::error!(error = %e, "storage failure");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}
