use std::sync::Arc;

use actix_web::{web, HttpResponse};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use utoipa::{OpenApi, ToSchema};

use crate::auth::{Auth, Role};
use crate::error::ApiError;
use crate::imager::AllocError;
use crate::models::{ImageDescriptor, PostId};
use crate::openapi::ApiDoc;
use crate::protocol::{ServerMessage, FRAME_SEPARATOR};
use crate::require_role;
use crate::services::Services;

/// Longest log slice served in one request.
pub const MAX_LOG_SLICE: u64 = 10_000;

pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/json/log").route(web::post().to(read_log)))
        .service(
            web::scope("/api/v1")
                .service(web::resource("/images/allocations").route(web::post().to(deposit_image)))
                .service(web::resource("/images/duplicates/{hash}").route(web::get().to(find_duplicate)))
                .service(web::resource("/admin/notification").route(web::post().to(notify_all)))
                .service(web::resource("/admin/threads/{id}/purge").route(web::post().to(purge_thread))),
        )
        .route("/metrics", web::get().to(render_metrics))
        .route("/health", web::get().to(health))
        .route("/docs/openapi.json", web::get().to(openapi_json));
}

#[derive(Clone)]
pub struct AppState {
    pub services: Arc<Services>,
    pub metrics: Option<PrometheusHandle>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct LogRequest {
    /// Thread id
    pub id: PostId,
    pub start: u64,
    pub end: u64,
}

#[utoipa::path(
    post,
    path = "/json/log",
    request_body = LogRequest,
    responses(
        (status = 200, description = "Replication log entries with start <= seq < end, joined by NUL", body = String, content_type = "text/plain"),
        (status = 400, description = "Invalid range"),
        (status = 404, description = "No such thread")
    )
)]
pub async fn read_log(data: web::Data<AppState>, payload: web::Json<LogRequest>) -> Result<HttpResponse, ApiError> {
    let LogRequest { id, start, end } = payload.into_inner();
    if end < start || end - start > MAX_LOG_SLICE {
        return Err(ApiError::BadRequest("invalid range".into()));
    }
    metrics::counter!("rib_backlog_requests_total").increment(1);
    let entries = data.services.store.read_log(id, start, end).await?;
    let body = entries
        .into_iter()
        .map(|e| e.payload)
        .collect::<Vec<_>>()
        .join(&FRAME_SEPARATOR.to_string());
    Ok(HttpResponse::Ok().content_type("text/plain; charset=utf-8").body(body))
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct AllocationResponse {
    pub token: String,
}

#[utoipa::path(
    post,
    path = "/api/v1/images/allocations",
    request_body = ImageDescriptor,
    responses(
        (status = 201, description = "Descriptor stored", body = AllocationResponse),
        (status = 400, description = "Invalid descriptor"),
        (status = 403, description = "Forbidden – Admins only")
    )
)]
pub async fn deposit_image(
    auth: Auth,
    data: web::Data<AppState>,
    payload: web::Json<ImageDescriptor>,
) -> Result<HttpResponse, ApiError> {
    require_role!(auth, Role::Admin);
    let token = data.services.images.deposit(payload.into_inner()).await.map_err(alloc_error)?;
    Ok(HttpResponse::Created().json(AllocationResponse { token }))
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct DuplicateResponse {
    pub post: Option<PostId>,
}

#[utoipa::path(
    get,
    path = "/api/v1/images/duplicates/{hash}",
    params(("hash" = String, Path, description = "Content hash")),
    responses(
        (status = 200, description = "Post that used this image recently, if any", body = DuplicateResponse),
        (status = 403, description = "Forbidden – Admins only")
    )
)]
pub async fn find_duplicate(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    require_role!(auth, Role::Admin);
    let post = data.services.images.check_duplicate(&path.into_inner()).await.map_err(alloc_error)?;
    Ok(HttpResponse::Ok().json(DuplicateResponse { post }))
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct NotificationRequest {
    pub text: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct NotificationResponse {
    pub delivered: usize,
}

#[utoipa::path(
    post,
    path = "/api/v1/admin/notification",
    request_body = NotificationRequest,
    responses(
        (status = 200, description = "Notification sent to every live session", body = NotificationResponse),
        (status = 403, description = "Forbidden – Admins only")
    )
)]
pub async fn notify_all(
    auth: Auth,
    data: web::Data<AppState>,
    payload: web::Json<NotificationRequest>,
) -> Result<HttpResponse, ApiError> {
    require_role!(auth, Role::Admin);
    let text = payload.into_inner().text;
    if text.trim().is_empty() {
        return Err(ApiError::BadRequest("empty notification".into()));
    }
    let delivered = data
        .services
        .sessions
        .broadcast(&ServerMessage::Notification(text))
        .map_err(|_| ApiError::Internal)?;
    info!(delivered, by = %auth.0.sub, "notification broadcast");
    Ok(HttpResponse::Ok().json(NotificationResponse { delivered }))
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct PurgeResponse {
    pub removed: usize,
}

#[utoipa::path(
    post,
    path = "/api/v1/admin/threads/{id}/purge",
    params(("id" = u64, Path, description = "Thread id")),
    responses(
        (status = 200, description = "Thread and its posts removed", body = PurgeResponse),
        (status = 403, description = "Forbidden – Admins only"),
        (status = 404, description = "No such thread")
    )
)]
pub async fn purge_thread(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<PostId>,
) -> Result<HttpResponse, ApiError> {
    require_role!(auth, Role::Admin);
    let id = path.into_inner();
    if !data.services.cache.is_thread(id) {
        return Err(ApiError::NotFound);
    }
    let removed = data.services.writer.purge_thread(id).await?;
    info!(thread = id, removed, by = %auth.0.sub, "purge requested");
    Ok(HttpResponse::Ok().json(PurgeResponse { removed }))
}

pub async fn render_metrics(data: web::Data<AppState>) -> HttpResponse {
    match &data.metrics {
        Some(handle) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(handle.render()),
        None => HttpResponse::NotFound().content_type("text/plain").body("metrics disabled"),
    }
}

pub async fn health() -> HttpResponse {
    HttpResponse::Ok().content_type("text/plain").body("ok")
}

pub async fn openapi_json() -> HttpResponse {
    HttpResponse::Ok().json(ApiDoc::openapi())
}

fn alloc_error(e: AllocError) -> ApiError {
    match e {
        AllocError::Store(inner) => inner.into(),
        AllocError::Media(inner) => {
            warn!(error = %inner, "media failure");
            ApiError::Internal
        }
        other => ApiError::BadRequest(other.to_string()),
    }
}
