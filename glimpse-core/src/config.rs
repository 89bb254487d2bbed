//! Engine tuning values. Where they come from (flags, environment) is the
//! embedding binary's business.

use std::time::Duration;

use crate::error::{Error, Result};
use crate::DeviceMap;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Upper bound for one request, loader wait included.
    pub request_timeout: Duration,
    /// Memory units available to loading and loaded models.
    pub memory_budget: u32,
    pub max_image_bytes: usize,
    pub max_prompt_chars: usize,
    pub max_new_tokens_ceiling: usize,
    /// Requests admitted at once; the rest fail fast.
    pub max_concurrent_requests: usize,
    pub seed: u64,
    pub device_map: DeviceMap,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(120),
            memory_budget: 8,
            max_image_bytes: 50 * 1024 * 1024,
            max_prompt_chars: 8192,
            max_new_tokens_ceiling: 1024,
            max_concurrent_requests: 4,
            seed: 299_792_458,
            device_map: DeviceMap::default(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        let zero = |name: &str| Err(Error::Config(format!("{name} must be greater than zero")));
        if self.request_timeout.is_zero() {
            return zero("request_timeout");
        }
        if self.memory_budget == 0 {
            return zero("memory_budget");
        }
        if self.max_image_bytes == 0 {
            return zero("max_image_bytes");
        }
        if self.max_prompt_chars == 0 {
            return zero("max_prompt_chars");
        }
        if self.max_new_tokens_ceiling == 0 {
            return zero("max_new_tokens_ceiling");
        }
        if self.max_concurrent_requests == 0 {
            return zero("max_concurrent_requests");
        }
        Ok(())
    }
}
