use actix_web::http::header::{ContentDisposition, DispositionParam, DispositionType};
use actix_web::{delete, get, web, HttpResponse, Responder};
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

use instant_cam::export::export_filename;
use instant_cam::PhotoBooth;

use super::error_reply;

#[get("/gallery")]
pub async fn list_gallery(booth: web::Data<Arc<PhotoBooth>>) -> impl Responder {
    let entries = booth.list().await;
    HttpResponse::Ok().json(serde_json::json!({
        "ok": true,
        "count": entries.len(),
        "entries": entries
    }))
}

#[get("/gallery/{id}/image")]
pub async fn gallery_image(
    path: web::Path<String>,
    booth: web::Data<Arc<PhotoBooth>>,
) -> impl Responder {
    let id = path.into_inner();
    match booth.entry(&id).await {
        Ok(entry) => HttpResponse::Ok()
            .content_type("image/jpeg")
            .body(entry.image_data().to_vec()),
        Err(e) => error_reply(&e),
    }
}

#[derive(Debug, Deserialize)]
pub struct ExportQuery {
    pub scale: Option<u32>,
}

#[get("/gallery/{id}/export")]
pub async fn export_print(
    path: web::Path<String>,
    query: web::Query<ExportQuery>,
    booth: web::Data<Arc<PhotoBooth>>,
) -> impl Responder {
    let id = path.into_inner();

    match booth.export(&id, query.scale).await {
        Ok(jpeg) => {
            info!("Exported print {} ({} bytes)", id, jpeg.len());
            HttpResponse::Ok()
                .content_type("image/jpeg")
                .insert_header(ContentDisposition {
                    disposition: DispositionType::Attachment,
                    parameters: vec![DispositionParam::Filename(export_filename(&id))],
                })
                .body(jpeg)
        }
        Err(e) => error_reply(&e),
    }
}

#[delete("/gallery/{id}")]
pub async fn delete_print(
    path: web::Path<String>,
    booth: web::Data<Arc<PhotoBooth>>,
) -> impl Responder {
    let id = path.into_inner();
    match booth.remove(&id).await {
        Ok(()) => HttpResponse::Ok().json(serde_json::json!({
            "ok": true,
            "deleted": id
        })),
        Err(e) => error_reply(&e),
    }
}

#[delete("/gallery")]
pub async fn clear_gallery(booth: web::Data<Arc<PhotoBooth>>) -> impl Responder {
    booth.clear().await;
    HttpResponse::Ok().json(serde_json::json!({ "ok": true }))
}
