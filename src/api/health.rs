use axum::{extract::State, Json};
use serde_json::json;

use crate::api::error::ApiError;
use crate::queue::Priority;
use crate::AppState;

/// GET /health: per-lane counters from the event stream plus table counts.
pub async fn health(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let mut lanes = serde_json::Map::new();
    for lane in Priority::ALL {
        let counts = state.queue.lane_counts(lane).await?;
        lanes.insert(
            lane.as_str().to_string(),
            json!({
                "metrics": state.metrics.snapshot(lane),
                "counts": counts,
            }),
        );
    }
    Ok(Json(json!({"status": "ok", "lanes": lanes})))
}
