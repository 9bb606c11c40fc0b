use actix_web::{get, web, HttpResponse, Responder};
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use instant_cam::PhotoBooth;

#[get("/status")]
pub async fn booth_status(booth: web::Data<Arc<PhotoBooth>>) -> impl Responder {
    let status = booth.status().await;
    HttpResponse::Ok().json(serde_json::json!({
        "ok": true,
        "status": status
    }))
}

/// Server-sent events feed of booth activity.
#[get("/events")]
pub async fn booth_events(booth: web::Data<Arc<PhotoBooth>>) -> impl Responder {
    let mut events = booth.subscribe();

    let stream = async_stream::stream! {
        loop {
            match events.recv().await {
                Ok(event) => {
                    let payload = match serde_json::to_string(&event) {
                        Ok(json) => json,
                        Err(e) => {
                            warn!("Failed to serialize booth event: {}", e);
                            continue;
                        }
                    };
                    yield Ok::<Bytes, actix_web::Error>(Bytes::from(format!("data: {}\n\n", payload)));
                }
                Err(RecvError::Lagged(skipped)) => {
                    debug!("Event subscriber lagged, skipped {} events", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    };

    HttpResponse::Ok()
        .insert_header(("Content-Type", "text/event-stream"))
        .insert_header(("Cache-Control", "no-cache"))
        .streaming(stream)
}
