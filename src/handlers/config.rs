use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn get_config(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let config = state.get_config();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": config
    })))
}

/// Partial update of the `streaming` and `recording` sections.
///
/// Streaming changes are handed to the stream worker and apply from the next
/// start. Recording changes apply when the receive pipeline is restarted.
pub async fn update_config(
    state: web::Data<AppState>,
    body: web::Json<serde_json::Value>,
) -> Result<HttpResponse, AppError> {
    let json_str = serde_json::to_string(&body.into_inner())?;

    let previous = state.get_config();
    let mut current_config = previous.clone();
    current_config
        .update_from_json(&json_str)
        .map_err(|e| AppError::ValidationError(e.to_string()))?;

    state
        .update_config(current_config.clone())
        .map_err(AppError::ValidationError)?;

    state
        .pipelines
        .stream
        .configure(current_config.streaming.settings(), current_config.streaming.target())
        .await?;

    let recording_changed = previous.recording.enabled != current_config.recording.enabled
        || previous.recording.directory != current_config.recording.directory;

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Configuration updated successfully",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "restart_required": if recording_changed { vec!["recording"] } else { vec![] },
        "updated_config": current_config
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::tests::test_state;
    use actix_web::{test, App};

    #[actix_web::test]
    async fn update_applies_valid_changes_only() {
        let (state, _backend) = test_state();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/config", web::get().to(get_config))
                .route("/config", web::put().to(update_config)),
        )
        .await;

        let req = test::TestRequest::put()
            .uri("/config")
            .set_json(json!({"streaming": {"stream_key": "stream_a_b", "port": 1936}}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 200);
        assert_eq!(state.get_config().streaming.stream_key, "stream_a_b");
        assert_eq!(state.get_config().streaming.port, 1936);

        let req = test::TestRequest::put()
            .uri("/config")
            .set_json(json!({"streaming": {"capture_channels": 6}}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 400);
        assert_eq!(state.get_config().streaming.capture_channels, 1);

        let req = test::TestRequest::get().uri("/config").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["config"]["streaming"]["codec"], "mulaw");
    }
}
