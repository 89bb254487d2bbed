use std::path::Path;
use std::sync::Mutex;

use anyhow::{bail, Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::generation::LogitsProcessor;
use candle_transformers::models::{gemma2, llama, phi3, qwen2};
use hf_hub::api::tokio::Api;
use serde::de::DeserializeOwned;
use tokenizers::Tokenizer;

use super::lock_model;
use crate::{
    hub_repo, hub_safetensors, hub_tokenizer, select_best_device, Architecture, DeviceMap,
    GenerationParams, Invocation, ModelDescriptor, ModelLike,
};

const EOS_TOKENS: &[&str] = &[
    "</s>",
    "<|endoftext|>",
    "<|im_end|>",
    "<|end|>",
    "<end_of_turn>",
    "<eos>",
];

enum Weights {
    Llama {
        model: llama::Llama,
        config: llama::Config,
        cache: llama::Cache,
    },
    Qwen2(qwen2::ModelForCausalLM),
    Phi3(phi3::Model),
    Gemma2(gemma2::Model),
}

impl Weights {
    fn build(
        architecture: Architecture,
        config_file: &Path,
        vb: VarBuilder,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let weights = match architecture {
            Architecture::Llama => {
                let config: llama::LlamaConfig = read_config(config_file)?;
                let config = config.into_config(false);
                let cache = llama::Cache::new(true, dtype, &config, device)?;
                let model = llama::Llama::load(vb, &config)?;
                Weights::Llama {
                    model,
                    config,
                    cache,
                }
            }
            Architecture::Qwen2 => {
                let config: qwen2::Config = read_config(config_file)?;
                Weights::Qwen2(qwen2::ModelForCausalLM::new(&config, vb)?)
            }
            Architecture::Phi3 => {
                let config: phi3::Config = read_config(config_file)?;
                Weights::Phi3(phi3::Model::new(&config, vb)?)
            }
            Architecture::Gemma2 => {
                let config: gemma2::Config = read_config(config_file)?;
                Weights::Gemma2(gemma2::Model::new(false, &config, vb)?)
            }
            other => bail!("{other} is not a text generation architecture"),
        };
        Ok(weights)
    }

    fn reset(&mut self, dtype: DType, device: &Device) -> Result<()> {
        match self {
            Weights::Llama { config, cache, .. } => {
                *cache = llama::Cache::new(true, dtype, config, device)?;
            }
            Weights::Qwen2(model) => model.clear_kv_cache(),
            Weights::Phi3(model) => model.clear_kv_cache(),
            Weights::Gemma2(model) => model.clear_kv_cache(),
        }
        Ok(())
    }

    /// Logits for the last position of `input`, flattened to (vocab,).
    fn forward(&mut self, input: &Tensor, offset: usize) -> Result<Tensor> {
        let logits = match self {
            Weights::Llama { model, cache, .. } => model.forward(input, offset, cache)?,
            Weights::Qwen2(model) => model.forward(input, offset)?,
            Weights::Phi3(model) => model.forward(input, offset)?,
            Weights::Gemma2(model) => model.forward(input, offset)?,
        };
        Ok(logits.flatten_all()?.to_dtype(DType::F32)?)
    }
}

fn read_config<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path).context("failed to read model config")?;
    serde_json::from_str(&raw).context("failed to parse model config")
}

/// Decoder-only text generator. The prompt is fed verbatim, without a chat template.
pub struct CausalLm {
    weights: Mutex<Weights>,
    tokenizer: Tokenizer,
    device: Device,
    dtype: DType,
    eos_tokens: Vec<u32>,
    seed: u64,
}

impl CausalLm {
    pub async fn load(
        api: &Api,
        descriptor: &ModelDescriptor,
        device_map: DeviceMap,
        seed: u64,
    ) -> Result<Self> {
        let repo = hub_repo(api, descriptor);
        let config_file = repo
            .get("config.json")
            .await
            .context("failed to get model config")?;
        let weights = hub_safetensors(&repo)
            .await
            .context("failed to get model weights")?;
        let tokenizer = hub_tokenizer(&repo).await?;
        let eos_tokens: Vec<u32> = EOS_TOKENS
            .iter()
            .filter_map(|name| tokenizer.token_to_id(name))
            .collect();
        if eos_tokens.is_empty() {
            bail!("tokenizer of {} has no end-of-sequence token", descriptor.repo);
        }
        let architecture = descriptor.architecture;

        tokio::task::spawn_blocking(move || -> Result<Self> {
            let device = select_best_device(device_map).context("failed to set up device")?;
            let dtype = device.bf16_default_to_f32();
            let vb = unsafe { VarBuilder::from_mmaped_safetensors(&weights, dtype, &device)? };
            let weights = Weights::build(architecture, &config_file, vb, dtype, &device)
                .with_context(|| format!("failed to build {architecture} model"))?;
            Ok(Self {
                weights: Mutex::new(weights),
                tokenizer,
                device,
                dtype,
                eos_tokens,
                seed,
            })
        })
        .await?
    }

    fn generate(&self, prompt: &str, params: &GenerationParams) -> Result<String> {
        let mut weights = lock_model(&self.weights, "text generation")?;
        weights.reset(self.dtype, &self.device)?;

        let encoding = self
            .tokenizer
            .encode(prompt, true)
            .map_err(anyhow::Error::msg)?;
        let mut tokens = encoding.get_ids().to_vec();
        let prompt_len = tokens.len();
        let mut sampler = LogitsProcessor::new(self.seed, Some(params.temperature), None);

        for index in 0..params.max_new_tokens {
            let context_size = if index > 0 { 1 } else { tokens.len() };
            let offset = tokens.len().saturating_sub(context_size);
            let input = Tensor::new(&tokens[offset..], &self.device)?.unsqueeze(0)?;
            let logits = weights.forward(&input, offset)?;
            let next = sampler.sample(&logits)?;
            if self.eos_tokens.contains(&next) {
                break;
            }
            tokens.push(next);
        }

        self.tokenizer
            .decode(&tokens[prompt_len..], true)
            .map_err(anyhow::Error::msg)
    }
}

impl ModelLike for CausalLm {
    fn run(&self, invocation: &Invocation) -> Result<Vec<String>> {
        let Invocation::Generate { prompt, params } = invocation else {
            bail!("text generators cannot serve {} invocations", invocation.name());
        };
        Ok(vec![self.generate(prompt, params)?])
    }
}
