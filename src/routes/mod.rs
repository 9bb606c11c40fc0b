// Route modules organization

pub mod base_routes;
pub mod camera_routes;
pub mod gallery_routes;

// Re-export all routes for convenience
pub use base_routes::*;
pub use camera_routes::*;
pub use gallery_routes::*;

use actix_web::http::StatusCode;
use actix_web::HttpResponse;
use instant_cam::AppError;

/// JSON error body with the status the error maps to.
pub(crate) fn error_reply(err: &AppError) -> HttpResponse {
    let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    HttpResponse::build(status).json(err.error_response())
}
