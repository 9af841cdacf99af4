//! # Stream Control Handlers
//!
//! ## Available Endpoints:
//! - `POST /api/v1/stream/start` - start publishing (optional target override)
//! - `POST /api/v1/stream/stop` - stop publishing; a no-op when idle
//! - `GET /api/v1/stream/status` - engine state, counters and the last error
//! - `POST /api/v1/stream/pcm` - raw mono S16LE capture audio (any chunk size)

use crate::audio::playback::peak_level;
use crate::stream::output::{stream_key_for, StreamTarget};
use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde::Deserialize;
use serde_json::json;

/// Request body for `POST /stream/start`. Every field is optional.
///
/// ```json
/// { "stream_key": "stream_g1_u7" }
/// { "group_id": "g1", "user_id": "u7" }
/// ```
#[derive(Debug, Default, Deserialize)]
pub struct StartStreamRequest {
    pub stream_key: Option<String>,
    pub group_id: Option<String>,
    pub user_id: Option<String>,
}

impl StartStreamRequest {
    /// Apply the requested key to `base`. An explicit key wins over a
    /// group/user pair; no key at all keeps the configured one.
    pub fn resolve_target(&self, mut base: StreamTarget) -> Result<StreamTarget, AppError> {
        match (&self.stream_key, &self.group_id, &self.user_id) {
            (Some(key), _, _) => base.stream_key = key.clone(),
            (None, Some(group), Some(user)) => base.stream_key = stream_key_for(group, user),
            (None, Some(_), None) | (None, None, Some(_)) => {
                return Err(AppError::ValidationError(
                    "group_id and user_id must be given together".to_string(),
                ));
            }
            (None, None, None) => {}
        }
        Ok(base)
    }
}

pub async fn start_stream(
    state: web::Data<AppState>,
    body: Option<web::Json<StartStreamRequest>>,
) -> Result<HttpResponse, AppError> {
    let request = body.map(web::Json::into_inner).unwrap_or_default();
    let target = request.resolve_target(state.get_config().streaming.target())?;

    let status = state.pipelines.stream.start(Some(target)).await?;

    Ok(HttpResponse::Ok().json(json!({
        "status": "started",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "stream": status
    })))
}

pub async fn stop_stream(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let status = state.pipelines.stream.stop().await?;

    Ok(HttpResponse::Ok().json(json!({
        "status": "stopped",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "stream": status
    })))
}

pub async fn stream_status(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let status = state.pipelines.stream.status().await?;
    let events = state.stream_event_log();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "stream": status,
        "queue": state.pipelines.stream.queue_stats(),
        "error_occurred": events.last_error.is_some(),
        "events": events
    })))
}

pub async fn push_pcm(state: web::Data<AppState>, body: web::Bytes) -> Result<HttpResponse, AppError> {
    if body.is_empty() {
        return Err(AppError::BadRequest("PCM body is empty".to_string()));
    }

    let bytes = body.len();
    let peak = peak_level(&body);
    let queued = state.pipelines.stream.push_pcm(body.to_vec());

    Ok(HttpResponse::Accepted().json(json!({
        "queued": queued,
        "bytes": bytes,
        "peak": peak
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::tests::test_state;
    use crate::stream::streamer::StreamerEvent;
    use actix_web::test::{call_and_read_body_json, call_service, init_service, TestRequest};
    use actix_web::App;

    fn base() -> StreamTarget {
        StreamTarget::rtmp("h", 1935, "live", "configured")
    }

    #[test]
    fn explicit_key_wins() {
        let request = StartStreamRequest {
            stream_key: Some("k".into()),
            group_id: Some("g".into()),
            user_id: Some("u".into()),
        };
        assert_eq!(request.resolve_target(base()).unwrap().stream_key, "k");
    }

    #[test]
    fn group_and_user_derive_the_key() {
        let request = StartStreamRequest {
            group_id: Some("class 3".into()),
            user_id: Some("u/9".into()),
            ..Default::default()
        };
        assert_eq!(request.resolve_target(base()).unwrap().stream_key, "stream_class_3_u_9");

        let half = StartStreamRequest {
            group_id: Some("g".into()),
            ..Default::default()
        };
        assert!(half.resolve_target(base()).is_err());
        assert_eq!(
            StartStreamRequest::default().resolve_target(base()).unwrap().stream_key,
            "configured"
        );
    }

    #[actix_web::test]
    async fn start_push_stop_round_trip() {
        let (state, backend) = test_state();
        let mut events = state.pipelines.stream.subscribe();
        let app = init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/stream/start", web::post().to(start_stream))
                .route("/stream/stop", web::post().to(stop_stream))
                .route("/stream/status", web::get().to(stream_status))
                .route("/stream/pcm", web::post().to(push_pcm)),
        )
        .await;

        // The configured key is empty.
        let req = TestRequest::post().uri("/stream/start").to_request();
        assert_eq!(call_service(&app, req).await.status(), 400);

        let req = TestRequest::post()
            .uri("/stream/start")
            .set_json(json!({"group_id": "g1", "user_id": "u7"}))
            .to_request();
        let body: serde_json::Value = call_and_read_body_json(&app, req).await;
        assert_eq!(body["stream"]["state"], "running");
        assert_eq!(body["stream"]["url"], "rtmp://127.0.0.1:1935/live/stream_g1_u7");

        let req = TestRequest::post()
            .uri("/stream/start")
            .set_json(json!({"stream_key": "other"}))
            .to_request();
        assert_eq!(call_service(&app, req).await.status(), 409);

        let req = TestRequest::post()
            .uri("/stream/pcm")
            .set_payload(vec![0u8; 16])
            .to_request();
        let body: serde_json::Value = call_and_read_body_json(&app, req).await;
        assert_eq!(body["queued"], true);

        let req = TestRequest::post().uri("/stream/stop").to_request();
        let body: serde_json::Value = call_and_read_body_json(&app, req).await;
        assert_eq!(body["stream"]["state"], "idle");
        assert_eq!(backend.frames.lock().unwrap().len(), 2);

        // Stop again is harmless.
        let req = TestRequest::post().uri("/stream/stop").to_request();
        assert_eq!(call_service(&app, req).await.status(), 200);

        let mut saw_started = false;
        while let Ok(event) = events.try_recv() {
            saw_started |= matches!(event, StreamerEvent::Started { .. });
        }
        assert!(saw_started);
    }

    #[actix_web::test]
    async fn empty_pcm_is_rejected() {
        let (state, _backend) = test_state();
        let app = init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/stream/pcm", web::post().to(push_pcm)),
        )
        .await;
        let req = TestRequest::post().uri("/stream/pcm").to_request();
        assert_eq!(call_service(&app, req).await.status(), 400);
    }
}
