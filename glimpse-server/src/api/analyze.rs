//! Image captioning and visual question answering

use axum::{
    extract::{Multipart, Request, State},
    http::header::CONTENT_TYPE,
    Json, RequestExt,
};
use base64::Engine;
use glimpse_core::{AnalyzeRequest, NormalizedResult};
use serde::Deserialize;

use super::{caller_deadline, non_empty};
use crate::error::ApiError;
use crate::state::AppState;

pub const DEFAULT_MODEL: &str = "moondream-2";

/// JSON form of an analyze request.
#[derive(Debug, Deserialize)]
pub struct AnalyzeBody {
    pub image_base64: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub question: Option<String>,
}

impl AnalyzeBody {
    fn into_request(self) -> Result<AnalyzeRequest, ApiError> {
        Ok(AnalyzeRequest {
            model_key: non_empty(self.model).unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            image_bytes: decode_base64_image(&self.image_base64)?,
            mode: non_empty(self.mode),
            question: non_empty(self.question),
        })
    }
}

pub async fn analyze(
    State(state): State<AppState>,
    req: Request,
) -> Result<Json<NormalizedResult>, ApiError> {
    let deadline = caller_deadline(req.headers())?;
    let request = parse_analyze_request(req).await?;
    let result = state.governor.handle(request.into(), deadline).await?;
    Ok(Json(result))
}

async fn parse_analyze_request(req: Request) -> Result<AnalyzeRequest, ApiError> {
    let content_type = req
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_ascii_lowercase();

    if content_type.starts_with("application/json") {
        let Json(body) = req
            .extract::<Json<AnalyzeBody>, _>()
            .await
            .map_err(|e| ApiError::bad_request(format!("Invalid JSON payload: {e}")))?;
        return body.into_request();
    }

    if content_type.starts_with("multipart/form-data") {
        let multipart = req
            .extract::<Multipart, _>()
            .await
            .map_err(|e| ApiError::bad_request(format!("Invalid multipart payload: {e}")))?;
        return parse_multipart(multipart).await;
    }

    Err(ApiError::bad_request(
        "Expected a multipart/form-data or application/json body",
    ))
}

async fn parse_multipart(mut multipart: Multipart) -> Result<AnalyzeRequest, ApiError> {
    let mut image_bytes: Option<Vec<u8>> = None;
    let mut model = None;
    let mut mode = None;
    let mut question = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("Failed reading multipart field: {e}")))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "image" => {
                let bytes = field.bytes().await.map_err(|e| {
                    ApiError::bad_request(format!("Failed reading multipart 'image' field: {e}"))
                })?;
                image_bytes = Some(bytes.to_vec());
            }
            "image_base64" => {
                let text = read_text(field, "image_base64").await?;
                if !text.trim().is_empty() {
                    image_bytes = Some(decode_base64_image(&text)?);
                }
            }
            "model" => model = Some(read_text(field, "model").await?),
            "mode" => mode = Some(read_text(field, "mode").await?),
            "question" => question = Some(read_text(field, "question").await?),
            _ => {}
        }
    }

    let image_bytes = image_bytes.ok_or_else(|| {
        ApiError::bad_request("Missing image in multipart request (expected 'image' file field)")
    })?;

    Ok(AnalyzeRequest {
        model_key: non_empty(model).unwrap_or_else(|| DEFAULT_MODEL.to_string()),
        image_bytes,
        mode: non_empty(mode),
        question: non_empty(question),
    })
}

async fn read_text(
    field: axum::extract::multipart::Field<'_>,
    name: &str,
) -> Result<String, ApiError> {
    field
        .text()
        .await
        .map_err(|e| ApiError::bad_request(format!("Failed reading multipart '{name}' field: {e}")))
}

/// Accepts bare base64 or a `data:` URL.
fn decode_base64_image(encoded: &str) -> Result<Vec<u8>, ApiError> {
    let payload = match encoded.split_once(";base64,") {
        Some((prefix, data)) if prefix.starts_with("data:") => data,
        _ => encoded,
    };
    base64::engine::general_purpose::STANDARD
        .decode(payload.trim())
        .map_err(|e| ApiError::bad_request(format!("Invalid base64 image: {e}")))
}
