//! Request validation and backend invocation.
//!
//! Validation (`plan`) is pure and cheap: it never touches the registry and never
//! decodes an image, so a malformed request costs nothing but a catalog lookup.
//! Image decoding (`decode`) happens on the blocking pool once the request has
//! been admitted. Execution hands the resulting [`Invocation`] to a loaded
//! backend on the blocking pool and reduces its raw candidates to one output text.

use std::sync::Arc;

use anyhow::anyhow;
use image::DynamicImage;
use tracing::debug;

use crate::catalog::{Catalog, Family, GenerationParams, Mode, ModelDescriptor};
use crate::error::{Error, Result};
use crate::request::{AnalyzeRequest, GenerateRequest, Invocation, NormalizedRequest};
use crate::{EngineConfig, ModelLike};

pub const MAX_TEMPERATURE: f64 = 2.0;

/// Input ceilings enforced during validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub max_image_bytes: usize,
    pub max_prompt_chars: usize,
    pub max_new_tokens_ceiling: usize,
}

impl From<&EngineConfig> for Limits {
    fn from(config: &EngineConfig) -> Self {
        Self {
            max_image_bytes: config.max_image_bytes,
            max_prompt_chars: config.max_prompt_chars,
            max_new_tokens_ceiling: config.max_new_tokens_ceiling,
        }
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

#[derive(Debug, Clone)]
enum Staged {
    /// Upload not decoded yet. `None` captions, `Some` queries.
    Image {
        bytes: Vec<u8>,
        prompt: Option<String>,
    },
    Ready(Invocation),
}

/// A validated request, ready to run once its model is loaded.
#[derive(Debug, Clone)]
pub struct Plan {
    descriptor: Arc<ModelDescriptor>,
    staged: Staged,
    echo: Option<String>,
}

impl Plan {
    pub fn descriptor(&self) -> &Arc<ModelDescriptor> {
        &self.descriptor
    }

    /// The backend call, once any image has been decoded.
    pub fn invocation(&self) -> Option<&Invocation> {
        match &self.staged {
            Staged::Ready(invocation) => Some(invocation),
            Staged::Image { .. } => None,
        }
    }

    /// Name of the backend call this plan turns into.
    pub fn invocation_name(&self) -> &'static str {
        match &self.staged {
            Staged::Ready(invocation) => invocation.name(),
            Staged::Image { prompt: None, .. } => "caption",
            Staged::Image { prompt: Some(_), .. } => "query",
        }
    }

    /// The prompt a query or generation will send, if any.
    pub fn prompt(&self) -> Option<&str> {
        match &self.staged {
            Staged::Image { prompt, .. } => prompt.as_deref(),
            Staged::Ready(Invocation::Query { prompt, .. })
            | Staged::Ready(Invocation::Generate { prompt, .. }) => Some(prompt),
            Staged::Ready(Invocation::Caption { .. }) => None,
        }
    }
}

/// Prompt used for each mode on query-style vision models.
pub fn mode_prompt(mode: Mode) -> Option<&'static str> {
    match mode {
        Mode::Caption => Some("Describe this image in one sentence."),
        Mode::MoreDetailed => Some("Describe this image in detail."),
        Mode::Ocr => Some("Transcribe all text visible in this image."),
        Mode::Roast => Some("Roast this image in one short, witty sentence."),
        Mode::VisualQuestionAnswering | Mode::FreeGeneration => None,
    }
}

pub struct Dispatcher {
    catalog: Arc<Catalog>,
    limits: Limits,
}

impl Dispatcher {
    pub fn new(catalog: Arc<Catalog>, limits: Limits) -> Self {
        Self { catalog, limits }
    }

    pub fn limits(&self) -> Limits {
        self.limits
    }

    /// Validates a request and builds the backend call it maps to.
    pub fn plan(&self, request: NormalizedRequest) -> Result<Plan> {
        let descriptor = self.catalog.lookup(request.model_key())?.clone();
        let compatible = match request {
            NormalizedRequest::Analyze(_) => descriptor.family.is_vision(),
            NormalizedRequest::Generate(_) => descriptor.family == Family::TextGenerator,
        };
        if !compatible {
            return Err(Error::FamilyMismatch {
                key: descriptor.key.clone(),
                family: descriptor.family,
                request: request.kind(),
            });
        }
        match request {
            NormalizedRequest::Analyze(req) => self.plan_analyze(descriptor, req),
            NormalizedRequest::Generate(req) => self.plan_generate(descriptor, &req),
        }
    }

    fn plan_analyze(&self, descriptor: Arc<ModelDescriptor>, req: AnalyzeRequest) -> Result<Plan> {
        let mode = parse_mode(&descriptor, req.mode.as_deref())?;
        let question = non_blank(req.question.as_deref());

        enum Call {
            Caption,
            Query(String),
        }

        let call = match (descriptor.family, mode, question) {
            (Family::VisionCaptioner, _, Some(_)) => {
                return Err(Error::invalid_parameter(
                    "question",
                    format!("model '{}' only captions and cannot answer questions", descriptor.key),
                ))
            }
            (_, None | Some(Mode::VisualQuestionAnswering), Some(question)) => {
                self.check_prompt("question", question)?;
                Call::Query(question.to_string())
            }
            (_, Some(mode), Some(_)) => {
                return Err(Error::invalid_parameter(
                    "question",
                    format!("a question cannot be combined with mode '{mode}'"),
                ))
            }
            (_, Some(Mode::VisualQuestionAnswering), None) => {
                return Err(Error::invalid_parameter(
                    "question",
                    "required for mode 'visual_question_answering'",
                ))
            }
            (family, mode, None) => {
                let mode = match mode.or(descriptor.default_mode) {
                    Some(mode) => mode,
                    None if descriptor.supports(Mode::Caption) => Mode::Caption,
                    None => return Err(invalid_mode(&descriptor, Mode::Caption)),
                };
                if !descriptor.supports(mode) {
                    return Err(invalid_mode(&descriptor, mode));
                }
                match (family, mode) {
                    (Family::VisionCaptioner, Mode::Caption) => Call::Caption,
                    (Family::VisionVqa, mode) => match mode_prompt(mode) {
                        Some(prompt) => Call::Query(prompt.to_string()),
                        None => return Err(invalid_mode(&descriptor, mode)),
                    },
                    (_, mode) => return Err(invalid_mode(&descriptor, mode)),
                }
            }
        };

        self.check_image(&req.image_bytes)?;
        let prompt = match call {
            Call::Caption => None,
            Call::Query(prompt) => Some(prompt),
        };
        Ok(Plan {
            descriptor,
            staged: Staged::Image {
                bytes: req.image_bytes,
                prompt,
            },
            echo: None,
        })
    }

    fn plan_generate(&self, descriptor: Arc<ModelDescriptor>, req: &GenerateRequest) -> Result<Plan> {
        self.check_prompt("prompt", &req.prompt)?;

        // Request values win over descriptor defaults. Defaults are capped by the
        // configured ceiling; explicit values outside the range are rejected.
        let ceiling = self.limits.max_new_tokens_ceiling;
        let defaults = descriptor.default_parameters.unwrap_or_default();
        let max_new_tokens = req
            .max_new_tokens
            .unwrap_or_else(|| defaults.max_new_tokens.min(ceiling));
        if max_new_tokens == 0 || max_new_tokens > ceiling {
            return Err(Error::invalid_parameter(
                "max_new_tokens",
                format!("must lie in [1, {ceiling}], got {max_new_tokens}"),
            ));
        }
        let temperature = req.temperature.unwrap_or(defaults.temperature);
        if !(temperature > 0.0 && temperature <= MAX_TEMPERATURE) {
            return Err(Error::invalid_parameter(
                "temperature",
                format!("must lie in (0, {MAX_TEMPERATURE}], got {temperature}"),
            ));
        }

        Ok(Plan {
            staged: Staged::Ready(Invocation::Generate {
                prompt: req.prompt.clone(),
                params: GenerationParams {
                    max_new_tokens,
                    temperature,
                },
            }),
            echo: Some(req.prompt.clone()),
            descriptor,
        })
    }

    fn check_prompt(&self, name: &'static str, text: &str) -> Result<()> {
        if text.trim().is_empty() {
            return Err(Error::invalid_parameter(name, "must not be empty"));
        }
        let chars = text.chars().count();
        if chars > self.limits.max_prompt_chars {
            return Err(Error::invalid_parameter(
                name,
                format!(
                    "{chars} characters exceeds the limit of {}",
                    self.limits.max_prompt_chars
                ),
            ));
        }
        Ok(())
    }

    fn check_image(&self, bytes: &[u8]) -> Result<()> {
        if bytes.is_empty() {
            return Err(Error::invalid_parameter("image", "no image data"));
        }
        if bytes.len() > self.limits.max_image_bytes {
            return Err(Error::invalid_parameter(
                "image",
                format!(
                    "{} bytes exceeds the limit of {}",
                    bytes.len(),
                    self.limits.max_image_bytes
                ),
            ));
        }
        Ok(())
    }

    /// Decodes the plan's image on the blocking pool. Plans without an image pass
    /// through untouched.
    pub async fn decode(&self, plan: Plan) -> Result<Plan> {
        let Plan {
            descriptor,
            staged,
            echo,
        } = plan;
        let invocation = resolve(staged).await?;
        Ok(Plan {
            descriptor,
            staged: Staged::Ready(invocation),
            echo,
        })
    }

    /// Runs a plan on a loaded backend, decoding its image first if that has not
    /// happened yet. Inference happens on the blocking pool and keeps running to
    /// completion even if the caller stops waiting.
    pub async fn execute(&self, backend: Arc<dyn ModelLike>, plan: Plan) -> Result<String> {
        let Plan {
            descriptor,
            staged,
            echo,
        } = plan;
        let invocation = resolve(staged).await?;
        debug!(model = %descriptor.key, invocation = invocation.name(), "dispatching");

        let inference_failed = |cause: anyhow::Error| Error::InferenceFailed {
            key: descriptor.key.clone(),
            cause: Arc::new(cause),
        };
        let candidates = tokio::task::spawn_blocking(move || backend.run(&invocation))
            .await
            .map_err(|e| anyhow!("inference task failed: {e}"))
            .and_then(|result| result)
            .map_err(inference_failed)?;

        let count = candidates.len();
        normalize(candidates, echo.as_deref()).ok_or_else(|| {
            inference_failed(anyhow!("backend returned no usable output ({count} candidates)"))
        })
    }
}

async fn resolve(staged: Staged) -> Result<Invocation> {
    let (bytes, prompt) = match staged {
        Staged::Ready(invocation) => return Ok(invocation),
        Staged::Image { bytes, prompt } => (bytes, prompt),
    };
    let image = tokio::task::spawn_blocking(move || decode_image(&bytes))
        .await
        .map_err(|e| Error::invalid_parameter("image", format!("cannot decode image: {e}")))??;
    Ok(match prompt {
        None => Invocation::Caption { image },
        Some(prompt) => Invocation::Query { image, prompt },
    })
}

fn decode_image(bytes: &[u8]) -> Result<DynamicImage> {
    let image = image::load_from_memory(bytes)
        .map_err(|e| Error::invalid_parameter("image", format!("cannot decode image: {e}")))?;
    Ok(DynamicImage::ImageRgb8(image.to_rgb8()))
}

/// First non-empty candidate, with an echoed prompt prefix stripped and
/// surrounding whitespace trimmed.
pub fn normalize(candidates: Vec<String>, echo: Option<&str>) -> Option<String> {
    candidates
        .into_iter()
        .map(|candidate| {
            let text = match echo {
                Some(prompt) if !prompt.is_empty() => {
                    candidate.strip_prefix(prompt).unwrap_or(&candidate)
                }
                _ => candidate.as_str(),
            };
            text.trim().to_string()
        })
        .find(|text| !text.is_empty())
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn parse_mode(descriptor: &ModelDescriptor, raw: Option<&str>) -> Result<Option<Mode>> {
    let Some(raw) = non_blank(raw) else {
        return Ok(None);
    };
    let unsupported = || Error::InvalidMode {
        key: descriptor.key.clone(),
        mode: raw.to_string(),
    };
    let mode: Mode = raw.parse().map_err(|_| unsupported())?;
    if !descriptor.supports(mode) {
        return Err(unsupported());
    }
    Ok(Some(mode))
}

fn invalid_mode(descriptor: &ModelDescriptor, mode: Mode) -> Error {
    Error::InvalidMode {
        key: descriptor.key.clone(),
        mode: mode.to_string(),
    }
}
