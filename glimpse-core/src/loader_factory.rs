use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use hf_hub::api::tokio::Api;

use crate::models::{BlipCaptioner, CausalLm, Moondream};
use crate::{Architecture, DeviceMap, Loader, ModelDescriptor, ModelLike};

/// Production loader: pulls weights from the Hugging Face hub and builds the
/// native implementation for the descriptor's architecture.
pub struct HubLoader {
    api: Api,
    device_map: DeviceMap,
    seed: u64,
}

impl HubLoader {
    pub fn new(device_map: DeviceMap, seed: u64) -> Result<Self> {
        Ok(Self {
            api: Api::new()?,
            device_map,
            seed,
        })
    }
}

#[async_trait]
impl Loader for HubLoader {
    async fn load(&self, descriptor: &ModelDescriptor) -> Result<Arc<dyn ModelLike>> {
        let model: Arc<dyn ModelLike> = match descriptor.architecture {
            Architecture::Blip => {
                Arc::new(BlipCaptioner::load(&self.api, descriptor, self.device_map).await?)
            }
            Architecture::Moondream => {
                Arc::new(Moondream::load(&self.api, descriptor, self.device_map).await?)
            }
            Architecture::Llama | Architecture::Qwen2 | Architecture::Phi3 | Architecture::Gemma2 => {
                Arc::new(CausalLm::load(&self.api, descriptor, self.device_map, self.seed).await?)
            }
        };
        Ok(model)
    }
}
