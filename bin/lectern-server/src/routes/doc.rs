//! OpenAPI document assembled from the per-module route descriptions.

use utoipa::OpenApi;

use super::{health, v1};

#[derive(OpenApi)]
#[openapi(info(title = "lectern-server", description = "Transcription and generation job API"))]
pub struct ApiDoc;

pub fn get_docs() -> utoipa::openapi::OpenApi {
    let mut doc = ApiDoc::openapi();
    doc.merge(health::HealthApi::openapi());
    doc.merge(v1::api_docs());
    doc
}
