//! Transport-agnostic requests and results.

use image::DynamicImage;
use serde::{Deserialize, Serialize};

use crate::catalog::{Family, GenerationParams};

/// A caption or visual question over one image.
#[derive(Debug, Clone, Default)]
pub struct AnalyzeRequest {
    pub model_key: String,
    pub image_bytes: Vec<u8>,
    pub mode: Option<String>,
    pub question: Option<String>,
}

/// Free text generation. Unset parameters fall back to the model's defaults.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct GenerateRequest {
    pub model_key: String,
    pub prompt: String,
    pub max_new_tokens: Option<usize>,
    pub temperature: Option<f64>,
}

#[derive(Debug, Clone)]
pub enum NormalizedRequest {
    Analyze(AnalyzeRequest),
    Generate(GenerateRequest),
}

impl NormalizedRequest {
    pub fn model_key(&self) -> &str {
        match self {
            NormalizedRequest::Analyze(req) => &req.model_key,
            NormalizedRequest::Generate(req) => &req.model_key,
        }
    }

    pub(crate) fn kind(&self) -> &'static str {
        match self {
            NormalizedRequest::Analyze(_) => "analyze",
            NormalizedRequest::Generate(_) => "generate",
        }
    }
}

impl From<AnalyzeRequest> for NormalizedRequest {
    fn from(req: AnalyzeRequest) -> Self {
        NormalizedRequest::Analyze(req)
    }
}

impl From<GenerateRequest> for NormalizedRequest {
    fn from(req: GenerateRequest) -> Self {
        NormalizedRequest::Generate(req)
    }
}

/// The exact call a backend receives.
#[derive(Debug, Clone)]
pub enum Invocation {
    /// Unconditional captioning.
    Caption { image: DynamicImage },
    /// A prompt answered against an image.
    Query { image: DynamicImage, prompt: String },
    Generate {
        prompt: String,
        params: GenerationParams,
    },
}

impl Invocation {
    pub fn name(&self) -> &'static str {
        match self {
            Invocation::Caption { .. } => "caption",
            Invocation::Query { .. } => "query",
            Invocation::Generate { .. } => "generate",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedResult {
    pub model_key: String,
    pub output_text: String,
    pub latency_ms: u64,
    pub model_family: Family,
}
