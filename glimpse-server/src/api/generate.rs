//! Free text generation

use axum::{
    extract::{rejection::JsonRejection, State},
    http::HeaderMap,
    Json,
};
use glimpse_core::{GenerateRequest, NormalizedResult};
use serde::Deserialize;

use super::{caller_deadline, non_empty};
use crate::error::ApiError;
use crate::state::AppState;

pub const DEFAULT_MODEL: &str = "smollm2-1.7b";

#[derive(Debug, Deserialize)]
pub struct GenerateBody {
    pub prompt: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub max_new_tokens: Option<usize>,
    #[serde(default)]
    pub temperature: Option<f64>,
}

impl From<GenerateBody> for GenerateRequest {
    fn from(body: GenerateBody) -> Self {
        GenerateRequest {
            model_key: non_empty(body.model).unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            prompt: body.prompt,
            max_new_tokens: body.max_new_tokens,
            temperature: body.temperature,
        }
    }
}

pub async fn generate(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<GenerateBody>, JsonRejection>,
) -> Result<Json<NormalizedResult>, ApiError> {
    let deadline = caller_deadline(&headers)?;
    let Json(body) =
        body.map_err(|e| ApiError::bad_request(format!("Invalid JSON payload: {e}")))?;

    let result = state
        .governor
        .handle(GenerateRequest::from(body).into(), deadline)
        .await?;
    Ok(Json(result))
}
