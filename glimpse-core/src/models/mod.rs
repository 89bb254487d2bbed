//! Native candle backends, one per [`Architecture`](crate::Architecture).

mod blip;
mod causal_lm;
mod moondream;

pub use blip::BlipCaptioner;
pub use causal_lm::CausalLm;
pub use moondream::Moondream;

use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Result};
use tokenizers::Tokenizer;

/// Backends keep KV caches, so one inference runs at a time per model.
pub(crate) fn lock_model<'a, T>(model: &'a Mutex<T>, name: &str) -> Result<MutexGuard<'a, T>> {
    model
        .lock()
        .map_err(|_| anyhow!("{name} model lock poisoned by an earlier panic"))
}

/// First of `names` present in the tokenizer vocabulary.
pub(crate) fn special_token(tokenizer: &Tokenizer, names: &[&str]) -> Option<u32> {
    names.iter().find_map(|name| tokenizer.token_to_id(name))
}
