//! OpenAPI document assembled from the handler annotations.

use utoipa::OpenApi;

use super::sessions::{FileInfoDto, MessageDto, SessionDetailDto, SessionSummaryDto};
use super::ErrorResponse;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "tabula",
        description = "Conversational analytics over uploaded tabular files."
    ),
    paths(
        super::health,
        super::sessions::sessions_list,
        super::sessions::sessions_get,
        super::sessions::sessions_delete,
    ),
    components(schemas(
        ErrorResponse,
        SessionSummaryDto,
        SessionDetailDto,
        FileInfoDto,
        MessageDto,
    ))
)]
pub struct ApiDoc;
