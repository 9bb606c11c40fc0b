use actix_web::{get, post, web, HttpResponse, Responder};
use bytes::Bytes;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use instant_cam::{Facing, PhotoBooth, ShutterOutcome};

use super::error_reply;

const BOUNDARY: &str = "frame";
const PREVIEW_INTERVAL: Duration = Duration::from_millis(66);
const PREVIEW_IDLE_LIMIT: u32 = 150;

fn mjpeg_part(jpeg: &[u8]) -> Bytes {
    let boundary_prefix = format!("--{}\r\n", BOUNDARY).into_bytes();
    let header = format!(
        "Content-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        jpeg.len()
    )
    .into_bytes();
    let tail = b"\r\n";

    let mut part = Vec::with_capacity(boundary_prefix.len() + header.len() + jpeg.len() + tail.len());
    part.extend_from_slice(&boundary_prefix);
    part.extend_from_slice(&header);
    part.extend_from_slice(jpeg);
    part.extend_from_slice(tail);
    Bytes::from(part)
}

#[get("/preview")]
pub async fn preview_stream(booth: web::Data<Arc<PhotoBooth>>) -> impl Responder {
    let booth = booth.get_ref().clone();

    let stream = async_stream::stream! {
        if !booth.camera_status().await.active {
            info!("No active camera session - returning empty preview stream");
            return;
        }

        info!("Starting preview stream");
        let mut ticker = tokio::time::interval(PREVIEW_INTERVAL);
        let mut last_frame: Option<Vec<u8>> = None;
        let mut idle_ticks = 0u32;
        let mut frame_count = 0u64;

        loop {
            ticker.tick().await;

            match booth.preview_jpeg().await {
                Some(jpeg) if last_frame.as_ref() != Some(&jpeg) => {
                    idle_ticks = 0;
                    frame_count += 1;
                    if frame_count % 100 == 1 {
                        debug!("Preview streamed {} frames", frame_count);
                    }
                    yield Ok::<Bytes, actix_web::Error>(mjpeg_part(&jpeg));
                    last_frame = Some(jpeg);
                }
                _ => {
                    idle_ticks += 1;
                    if idle_ticks >= PREVIEW_IDLE_LIMIT {
                        warn!("Preview stream stalled, closing");
                        break;
                    }
                }
            }
        }
    };

    HttpResponse::Ok()
        .insert_header((
            "Content-Type",
            format!("multipart/x-mixed-replace; boundary={}", BOUNDARY),
        ))
        .streaming(stream)
}

#[get("/camera")]
pub async fn camera_status(booth: web::Data<Arc<PhotoBooth>>) -> impl Responder {
    let status = booth.camera_status().await;
    HttpResponse::Ok().json(serde_json::json!({
        "ok": true,
        "camera": status
    }))
}

#[derive(Debug, Default, Deserialize)]
pub struct FacingRequest {
    pub facing: Option<Facing>,
}

/// Switches to the requested facing, or toggles when none is given.
#[post("/camera/facing")]
pub async fn switch_facing(
    booth: web::Data<Arc<PhotoBooth>>,
    body: Option<web::Json<FacingRequest>>,
) -> impl Responder {
    let requested = body.and_then(|b| b.into_inner().facing);

    match booth.switch_camera(requested).await {
        Ok(status) => HttpResponse::Ok().json(serde_json::json!({
            "ok": true,
            "camera": status
        })),
        Err(e) => {
            warn!("Camera switch failed: {}", e);
            error_reply(&e)
        }
    }
}

#[post("/shutter")]
pub async fn press_shutter(booth: web::Data<Arc<PhotoBooth>>) -> impl Responder {
    match booth.press_shutter().await {
        Ok(ShutterOutcome::Admitted { id }) => HttpResponse::Ok().json(serde_json::json!({
            "ok": true,
            "admitted": true,
            "id": id
        })),
        Ok(ShutterOutcome::Dropped) => HttpResponse::Ok().json(serde_json::json!({
            "ok": true,
            "admitted": false
        })),
        Err(e) => error_reply(&e),
    }
}
