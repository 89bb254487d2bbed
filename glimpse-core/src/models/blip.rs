use std::sync::Mutex;

use anyhow::{bail, Context, Result};
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::blip;
use hf_hub::api::tokio::Api;
use tokenizers::Tokenizer;

use super::lock_model;
use crate::{
    hub_repo, hub_safetensors, hub_tokenizer, image_to_tensor, select_best_device, DeviceMap,
    Invocation, ModelDescriptor, ModelLike,
};

const IMAGE_SIZE: u32 = 384;
const CLIP_MEAN: [f32; 3] = [0.481_454_66, 0.457_827_5, 0.408_210_73];
const CLIP_STD: [f32; 3] = [0.268_629_54, 0.261_302_58, 0.275_777_11];
const BOS_TOKEN_ID: u32 = 30522;
const SEP_TOKEN_ID: u32 = 102;
const MAX_CAPTION_TOKENS: usize = 64;

/// BLIP image captioning. Greedy decoding, so a given image always gets the same caption.
pub struct BlipCaptioner {
    model: Mutex<blip::BlipForConditionalGeneration>,
    tokenizer: Tokenizer,
    device: Device,
}

impl BlipCaptioner {
    pub async fn load(api: &Api, descriptor: &ModelDescriptor, device_map: DeviceMap) -> Result<Self> {
        let weights = hub_safetensors(&hub_repo(api, descriptor))
            .await
            .context("failed to get BLIP weights")?;
        // the tokenizer lives on the main branch, not on the pinned weights revision
        let tokenizer = hub_tokenizer(&api.model(descriptor.repo.clone())).await?;

        tokio::task::spawn_blocking(move || -> Result<Self> {
            let device = select_best_device(device_map).context("failed to set up device")?;
            let vb = unsafe { VarBuilder::from_mmaped_safetensors(&weights, DType::F32, &device)? };
            let config = blip::Config::image_captioning_large();
            let model = blip::BlipForConditionalGeneration::new(&config, vb)
                .context("failed to build BLIP model")?;
            Ok(Self {
                model: Mutex::new(model),
                tokenizer,
                device,
            })
        })
        .await?
    }
}

impl ModelLike for BlipCaptioner {
    fn run(&self, invocation: &Invocation) -> Result<Vec<String>> {
        let Invocation::Caption { image } = invocation else {
            bail!("BLIP cannot serve {} invocations", invocation.name());
        };
        let mut model = lock_model(&self.model, "BLIP")?;
        model.reset_kv_cache();

        let pixels = image_to_tensor(image, IMAGE_SIZE, CLIP_MEAN, CLIP_STD, &self.device)?;
        let image_embeds = model.vision_model().forward(&pixels.unsqueeze(0)?)?;

        let mut token_ids = vec![BOS_TOKEN_ID];
        for index in 0..MAX_CAPTION_TOKENS {
            let context_size = if index > 0 { 1 } else { token_ids.len() };
            let start_pos = token_ids.len().saturating_sub(context_size);
            let input_ids = Tensor::new(&token_ids[start_pos..], &self.device)?.unsqueeze(0)?;
            let logits = model.text_decoder().forward(&input_ids, &image_embeds)?;
            let logits = logits.squeeze(0)?;
            let logits = logits.get(logits.dim(0)? - 1)?;
            let token = logits.argmax(0)?.to_scalar::<u32>()?;
            if token == SEP_TOKEN_ID {
                break;
            }
            token_ids.push(token);
        }

        let caption = self
            .tokenizer
            .decode(&token_ids[1..], true)
            .map_err(anyhow::Error::msg)?;
        Ok(vec![caption])
    }
}
