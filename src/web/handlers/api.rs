use axum::{
    extract::State,
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::pipeline::{Question, RunOptions};
use crate::schema::SchemaSnapshot;
use crate::web::state::AppState;

#[derive(Debug, Deserialize)]
pub struct AskRequest {
    pub question: String,
    #[serde(default)]
    pub tables: Vec<String>,
    pub max_rows: Option<usize>,
    #[serde(default)]
    pub want_total: bool,
    #[serde(default)]
    pub params: HashMap<String, JsonValue>,
}

#[derive(Debug, Serialize)]
pub struct SystemStatus {
    pub version: String,
    pub uptime_seconds: i64,
    pub source_id: String,
    pub dialect: String,
    pub table_count: usize,
}

/// Runs the full question-to-chart pipeline. The outcome is always 200:
/// terminal failures are part of the payload so the caller can show the
/// SQL and explanation.
pub async fn ask(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<AskRequest>,
) -> impl IntoResponse {
    info!("NL-query: {}", payload.question);

    let question = Question {
        text: payload.question,
        rewritten: None,
        tables: payload.tables,
    };

    let options = RunOptions {
        max_rows: payload.max_rows,
        want_total: payload.want_total,
        params: payload.params,
    };

    let outcome = state
        .pipeline
        .run(question, &state.config.source, options)
        .await;

    debug!("Pipeline outcome: retries={}", outcome.retry_count);

    let mut headers = HeaderMap::new();
    if let Ok(v) = HeaderValue::from_str(&outcome.sql.replace(['\n', '\r'], " ")) {
        headers.insert(HeaderName::from_static("x-generated-sql"), v);
    }
    if let Ok(v) = HeaderValue::from_str(&outcome.retry_count.to_string()) {
        headers.insert(HeaderName::from_static("x-retry-count"), v);
    }
    if let Some(result) = &outcome.result {
        let total = result.total_rows.unwrap_or(result.row_count as u64);
        if let Ok(v) = HeaderValue::from_str(&total.to_string()) {
            headers.insert(HeaderName::from_static("x-total-count"), v);
        }
    }

    (StatusCode::OK, headers, Json(outcome))
}

pub async fn get_schema(
    State(state): State<Arc<AppState>>,
) -> Result<Json<SchemaSnapshot>, (StatusCode, String)> {
    let snapshot = state.pipeline.describe(&state.config.source).await;

    if snapshot.is_empty() {
        return Err((
            StatusCode::NOT_FOUND,
            "No tables found in the configured data source".to_string(),
        ));
    }

    Ok(Json(snapshot))
}

pub async fn system_status(State(state): State<Arc<AppState>>) -> Json<SystemStatus> {
    let snapshot = state.pipeline.describe(&state.config.source).await;
    let uptime = chrono::Utc::now() - state.startup_time;

    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: uptime.num_seconds(),
        source_id: state.config.source.id.clone(),
        dialect: state.config.source.dialect.name().to_string(),
        table_count: snapshot.tables.len(),
    })
}
