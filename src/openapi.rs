use crate::models::{FileKind, ImageDescriptor, TempFile, ThumbClass};
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::routes::read_log,
        crate::routes::deposit_image,
        crate::routes::find_duplicate,
        crate::routes::notify_all,
        crate::routes::purge_thread,
    ),
    components(schemas(
        ImageDescriptor, TempFile, FileKind, ThumbClass,
        crate::routes::LogRequest, crate::routes::AllocationResponse,
        crate::routes::DuplicateResponse, crate::routes::NotificationRequest,
        crate::routes::NotificationResponse, crate::routes::PurgeResponse,
    )),
    tags(
        (name = "log", description = "Replication log backfill"),
        (name = "images", description = "Image pipeline hand-off"),
        (name = "admin", description = "Administration"),
    )
)]
pub struct ApiDoc;
