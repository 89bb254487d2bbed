//! Static catalog of the models this process knows how to serve.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Which kind of request a model can serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Family {
    VisionCaptioner,
    VisionVqa,
    TextGenerator,
}

serde_plain::derive_display_from_serialize!(Family);

impl Family {
    pub fn is_vision(self) -> bool {
        matches!(self, Family::VisionCaptioner | Family::VisionVqa)
    }

    /// Whether a model of this family can be declared with `mode`.
    pub fn allows(self, mode: Mode) -> bool {
        match self {
            Family::VisionCaptioner => mode == Mode::Caption,
            Family::VisionVqa => mode != Mode::FreeGeneration,
            Family::TextGenerator => mode == Mode::FreeGeneration,
        }
    }
}

/// An invocation mode a descriptor may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Caption,
    MoreDetailed,
    Ocr,
    Roast,
    #[serde(alias = "vqa")]
    VisualQuestionAnswering,
    FreeGeneration,
}

serde_plain::derive_display_from_serialize!(Mode);
serde_plain::derive_fromstr_from_deserialize!(Mode);

/// Coarse memory footprint used by admission control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryClass {
    Small,
    Medium,
    Large,
}

impl MemoryClass {
    /// Budget units consumed while a model of this class is loading or loaded.
    pub fn weight(self) -> u32 {
        match self {
            MemoryClass::Small => 1,
            MemoryClass::Medium => 2,
            MemoryClass::Large => 4,
        }
    }
}

/// Native implementation the hub loader builds for a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Architecture {
    Blip,
    Moondream,
    Llama,
    Qwen2,
    Phi3,
    Gemma2,
}

serde_plain::derive_display_from_serialize!(Architecture);

/// Sampling parameters for text generation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    pub max_new_tokens: usize,
    pub temperature: f64,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_new_tokens: 256,
            temperature: 0.7,
        }
    }
}

/// Immutable description of one servable model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelDescriptor {
    pub key: String,
    pub name: String,
    pub description: String,
    pub family: Family,
    pub architecture: Architecture,
    pub repo: String,
    pub revision: Option<String>,
    pub capabilities: BTreeSet<Mode>,
    pub default_mode: Option<Mode>,
    pub default_parameters: Option<GenerationParams>,
    pub memory_class: MemoryClass,
}

impl ModelDescriptor {
    /// A descriptor with the usual capabilities of its family. Vision models
    /// default to captioning, text generators to [`GenerationParams::default`].
    pub fn new(
        key: impl Into<String>,
        family: Family,
        architecture: Architecture,
        repo: impl Into<String>,
    ) -> Self {
        let key = key.into();
        let (capabilities, default_mode, default_parameters) = match family {
            Family::VisionCaptioner => (BTreeSet::from([Mode::Caption]), Some(Mode::Caption), None),
            Family::VisionVqa => (
                BTreeSet::from([Mode::Caption, Mode::VisualQuestionAnswering]),
                Some(Mode::Caption),
                None,
            ),
            Family::TextGenerator => (
                BTreeSet::from([Mode::FreeGeneration]),
                None,
                Some(GenerationParams::default()),
            ),
        };
        Self {
            name: key.clone(),
            key,
            description: String::new(),
            family,
            architecture,
            repo: repo.into(),
            revision: None,
            capabilities,
            default_mode,
            default_parameters,
            memory_class: MemoryClass::Medium,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_revision(mut self, revision: impl Into<String>) -> Self {
        self.revision = Some(revision.into());
        self
    }

    pub fn with_modes(mut self, modes: impl IntoIterator<Item = Mode>) -> Self {
        self.capabilities = modes.into_iter().collect();
        self
    }

    pub fn with_default_mode(mut self, mode: Mode) -> Self {
        self.default_mode = Some(mode);
        self
    }

    pub fn with_default_parameters(mut self, params: GenerationParams) -> Self {
        self.default_parameters = Some(params);
        self
    }

    pub fn with_memory_class(mut self, class: MemoryClass) -> Self {
        self.memory_class = class;
        self
    }

    pub fn supports(&self, mode: Mode) -> bool {
        self.capabilities.contains(&mode)
    }
}

/// Read-only table of descriptors, in declaration order.
#[derive(Debug, Clone)]
pub struct Catalog {
    descriptors: Vec<Arc<ModelDescriptor>>,
    index: HashMap<String, usize>,
}

impl Catalog {
    pub fn new(descriptors: impl IntoIterator<Item = ModelDescriptor>) -> Result<Self> {
        let mut index = HashMap::new();
        let mut list = Vec::new();
        for descriptor in descriptors {
            if let Some(mode) = descriptor
                .capabilities
                .iter()
                .find(|mode| !descriptor.family.allows(**mode))
            {
                return Err(Error::Config(format!(
                    "{} model '{}' cannot declare mode '{mode}'",
                    descriptor.family, descriptor.key
                )));
            }
            if let Some(mode) = descriptor.default_mode {
                if !descriptor.supports(mode) {
                    return Err(Error::Config(format!(
                        "default mode '{mode}' of '{}' is not among its capabilities",
                        descriptor.key
                    )));
                }
            }
            if index.insert(descriptor.key.clone(), list.len()).is_some() {
                return Err(Error::Config(format!(
                    "duplicate model key '{}'",
                    descriptor.key
                )));
            }
            list.push(Arc::new(descriptor));
        }
        Ok(Self {
            descriptors: list,
            index,
        })
    }

    /// The models shipped with the server.
    pub fn builtin() -> Self {
        let vision_modes = [
            Mode::Caption,
            Mode::MoreDetailed,
            Mode::Ocr,
            Mode::Roast,
            Mode::VisualQuestionAnswering,
        ];
        let descriptors = vec![
            ModelDescriptor::new(
                "blip-large",
                Family::VisionCaptioner,
                Architecture::Blip,
                "Salesforce/blip-image-captioning-large",
            )
            .with_name("BLIP Large")
            .with_description("More detailed captions (2GB)")
            .with_revision("refs/pr/18"),
            ModelDescriptor::new(
                "moondream-2",
                Family::VisionVqa,
                Architecture::Moondream,
                "vikhyatk/moondream2",
            )
            .with_name("Moondream2")
            .with_description("Lightweight VLM (fast CPU, ~1-2GB RAM)")
            .with_revision("2024-03-06")
            .with_modes(vision_modes),
            ModelDescriptor::new(
                "smollm2-1.7b",
                Family::TextGenerator,
                Architecture::Llama,
                "HuggingFaceTB/SmolLM2-1.7B-Instruct",
            )
            .with_name("SmolLM2 1.7B Instruct")
            .with_description("Tiny instruct model (fast CPU, ~1.5GB RAM)"),
            ModelDescriptor::new(
                "phi3-mini",
                Family::TextGenerator,
                Architecture::Phi3,
                "microsoft/Phi-3-mini-4k-instruct",
            )
            .with_name("Phi-3 Mini 4k")
            .with_description("Reasoning-focused small model (~3GB RAM)")
            .with_memory_class(MemoryClass::Large),
            ModelDescriptor::new(
                "gemma2-2b",
                Family::TextGenerator,
                Architecture::Gemma2,
                "google/gemma-2-2b-it",
            )
            .with_name("Gemma-2 2B IT")
            .with_description("Creative text, ~2GB RAM")
            .with_memory_class(MemoryClass::Large),
            ModelDescriptor::new(
                "qwen2.5-1.5b",
                Family::TextGenerator,
                Architecture::Qwen2,
                "Qwen/Qwen2.5-1.5B-Instruct",
            )
            .with_name("Qwen2.5 1.5B Instruct")
            .with_description("Multilingual ultra-light (~1GB RAM)")
            .with_memory_class(MemoryClass::Small),
            ModelDescriptor::new(
                "tinyllama-1.1b",
                Family::TextGenerator,
                Architecture::Llama,
                "TinyLlama/TinyLlama-1.1B-Chat-v1.0",
            )
            .with_name("TinyLlama 1.1B Chat")
            .with_description("Very fast, basic chat (~1GB RAM)")
            .with_memory_class(MemoryClass::Small),
        ];
        // The table above is static and satisfies every check in `new`.
        Self::new(descriptors).unwrap_or_else(|err| panic!("invalid builtin catalog: {err}"))
    }

    pub fn list(&self) -> &[Arc<ModelDescriptor>] {
        &self.descriptors
    }

    pub fn lookup(&self, key: &str) -> Result<&Arc<ModelDescriptor>> {
        self.index
            .get(key)
            .map(|&i| &self.descriptors[i])
            .ok_or_else(|| Error::UnknownModel(key.to_string()))
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_lookup_and_order() {
        let catalog = Catalog::builtin();
        let keys: Vec<_> = catalog.list().iter().map(|d| d.key.as_str()).collect();
        assert_eq!(keys[0], "blip-large");
        assert_eq!(keys[1], "moondream-2");
        assert_eq!(keys.len(), catalog.len());

        let moondream = catalog.lookup("moondream-2").unwrap();
        assert_eq!(moondream.family, Family::VisionVqa);
        assert!(moondream.supports(Mode::Roast));
        assert_eq!(moondream.default_mode, Some(Mode::Caption));

        let smol = catalog.lookup("smollm2-1.7b").unwrap();
        assert_eq!(smol.default_parameters, Some(GenerationParams::default()));
    }

    #[test]
    fn unknown_key() {
        let catalog = Catalog::builtin();
        assert!(matches!(
            catalog.lookup("florence-2"),
            Err(Error::UnknownModel(key)) if key == "florence-2"
        ));
    }

    #[test]
    fn duplicate_keys_rejected() {
        let a = ModelDescriptor::new("a", Family::TextGenerator, Architecture::Llama, "x/a");
        assert!(Catalog::new([a.clone(), a]).is_err());
    }

    #[test]
    fn default_mode_must_be_a_capability() {
        let d = ModelDescriptor::new("a", Family::VisionVqa, Architecture::Moondream, "x/a")
            .with_modes([Mode::VisualQuestionAnswering]);
        assert!(Catalog::new([d]).is_err());
    }

    #[test]
    fn modes_must_fit_the_family() {
        let d = ModelDescriptor::new("a", Family::VisionCaptioner, Architecture::Blip, "x/a")
            .with_modes([Mode::Caption, Mode::Roast]);
        assert!(Catalog::new([d]).is_err());
        let d = ModelDescriptor::new("b", Family::TextGenerator, Architecture::Llama, "x/b")
            .with_modes([Mode::Caption]);
        assert!(Catalog::new([d]).is_err());
    }

    #[test]
    fn mode_strings() {
        assert_eq!("more_detailed".parse::<Mode>().unwrap(), Mode::MoreDetailed);
        assert_eq!("vqa".parse::<Mode>().unwrap(), Mode::VisualQuestionAnswering);
        assert!("bogus_mode".parse::<Mode>().is_err());
        assert_eq!(Mode::FreeGeneration.to_string(), "free_generation");
        assert_eq!(Family::VisionCaptioner.to_string(), "vision-captioner");
    }
}
