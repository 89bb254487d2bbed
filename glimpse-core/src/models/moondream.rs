use std::sync::Mutex;

use anyhow::{bail, Context, Result};
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::moondream;
use hf_hub::api::tokio::Api;
use tokenizers::Tokenizer;

use super::{lock_model, special_token};
use crate::{
    hub_repo, hub_safetensors, hub_tokenizer, image_to_tensor, select_best_device, DeviceMap,
    Invocation, ModelDescriptor, ModelLike,
};

const IMAGE_SIZE: u32 = 378;
const MAX_ANSWER_TOKENS: usize = 256;

/// Moondream2 vision-language model. Every mode is a prompt answered against the
/// image; plain captioning uses a fixed prompt.
pub struct Moondream {
    model: Mutex<moondream::Model>,
    tokenizer: Tokenizer,
    device: Device,
    dtype: DType,
    bos_token: u32,
    stop_tokens: Vec<u32>,
}

impl Moondream {
    pub async fn load(api: &Api, descriptor: &ModelDescriptor, device_map: DeviceMap) -> Result<Self> {
        let repo = hub_repo(api, descriptor);
        let weights = hub_safetensors(&repo)
            .await
            .context("failed to get moondream weights")?;
        let tokenizer = hub_tokenizer(&repo).await?;

        let bos_token = special_token(&tokenizer, &["<|endoftext|>"])
            .context("moondream tokenizer has no <|endoftext|> token")?;
        let stop_tokens = ["<END>", "<|endoftext|>"]
            .iter()
            .filter_map(|name| tokenizer.token_to_id(name))
            .collect();

        tokio::task::spawn_blocking(move || -> Result<Self> {
            let device = select_best_device(device_map).context("failed to set up device")?;
            let dtype = if device.is_cuda() { DType::F16 } else { DType::F32 };
            let vb = unsafe { VarBuilder::from_mmaped_safetensors(&weights, dtype, &device)? };
            let config = moondream::Config::v2();
            let model =
                moondream::Model::new(&config, vb).context("failed to build moondream model")?;
            Ok(Self {
                model: Mutex::new(model),
                tokenizer,
                device,
                dtype,
                bos_token,
                stop_tokens,
            })
        })
        .await?
    }

    fn answer(&self, image: &image::DynamicImage, prompt: &str) -> Result<String> {
        let mut model = lock_model(&self.model, "moondream")?;
        model.text_model.clear_kv_cache();

        let pixels = image_to_tensor(image, IMAGE_SIZE, [0.5; 3], [0.5; 3], &self.device)?
            .to_dtype(self.dtype)?;
        let image_embeds = model.vision_encoder().forward(&pixels.unsqueeze(0)?)?;

        let prompt = format!("\n\nQuestion: {prompt}\n\nAnswer:");
        let encoding = self
            .tokenizer
            .encode(prompt, true)
            .map_err(anyhow::Error::msg)?;
        let mut tokens = encoding.get_ids().to_vec();
        let prompt_len = tokens.len();
        let bos = Tensor::new(&[self.bos_token], &self.device)?.unsqueeze(0)?;

        for index in 0..MAX_ANSWER_TOKENS {
            let context_size = if index > 0 { 1 } else { tokens.len() };
            let ctxt = &tokens[tokens.len().saturating_sub(context_size)..];
            let input = Tensor::new(ctxt, &self.device)?.unsqueeze(0)?;
            let logits = if index > 0 {
                model.text_model.forward(&input)?
            } else {
                model
                    .text_model
                    .forward_with_img(&bos, &input, &image_embeds)?
            };
            let logits = logits.flatten_all()?.to_dtype(DType::F32)?;
            let next = logits.argmax(0)?.to_scalar::<u32>()?;
            if self.stop_tokens.contains(&next) {
                break;
            }
            tokens.push(next);
        }

        self.tokenizer
            .decode(&tokens[prompt_len..], true)
            .map_err(anyhow::Error::msg)
    }
}

impl ModelLike for Moondream {
    fn run(&self, invocation: &Invocation) -> Result<Vec<String>> {
        let answer = match invocation {
            Invocation::Query { image, prompt } => self.answer(image, prompt)?,
            Invocation::Caption { image } => {
                self.answer(image, "Describe this image in one sentence.")?
            }
            Invocation::Generate { .. } => {
                bail!("moondream cannot serve {} invocations", invocation.name())
            }
        };
        Ok(vec![answer])
    }
}
