use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::{ModelDescriptor, ModelLike};

/// Builds a backend for a descriptor. May take minutes (downloads, weight
/// mapping); the registry guarantees it is called at most once at a time per key.
#[async_trait]
pub trait Loader: Send + Sync {
    async fn load(&self, descriptor: &ModelDescriptor) -> Result<Arc<dyn ModelLike>>;
}
