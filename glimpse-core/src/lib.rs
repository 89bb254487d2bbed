pub mod catalog;
pub mod config;
pub mod device_map;
pub mod dispatch;
pub mod error;
pub mod governor;
pub mod loader;
mod loader_factory;
pub mod models;
pub mod registry;
pub mod request;
mod util;

pub use catalog::{
    Architecture, Catalog, Family, GenerationParams, MemoryClass, Mode, ModelDescriptor,
};
pub use config::EngineConfig;
pub use device_map::*;
pub use dispatch::Dispatcher;
pub use error::{Error, ErrorKind, Failure, Result};
pub use governor::Governor;
pub use loader::*;
pub use loader_factory::*;
pub use registry::{HandleState, HandleStatus, ModelRegistry};
pub use request::{
    AnalyzeRequest, GenerateRequest, Invocation, NormalizedRequest, NormalizedResult,
};
pub(crate) use util::*;

/// A loaded backend. Returns raw candidate outputs; the dispatcher picks one.
///
/// Implementations block for the whole inference and are only ever called from
/// the blocking thread pool.
pub trait ModelLike: Send + Sync {
    fn run(&self, invocation: &Invocation) -> anyhow::Result<Vec<String>>;
}
