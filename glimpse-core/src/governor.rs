//! Front door of the engine: validation, admission, deadline, error reporting.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use crate::dispatch::{Dispatcher, Limits};
use crate::error::{Error, ErrorKind, Failure, Result};
use crate::registry::ModelRegistry;
use crate::request::{NormalizedRequest, NormalizedResult};
use crate::{Catalog, EngineConfig, Loader};

pub struct Governor {
    registry: Arc<ModelRegistry>,
    dispatcher: Arc<Dispatcher>,
    permits: Arc<Semaphore>,
    max_concurrent: usize,
    timeout: Duration,
}

impl Governor {
    pub fn new(config: &EngineConfig, catalog: Arc<Catalog>, loader: Arc<dyn Loader>) -> Result<Self> {
        config.validate()?;
        let registry = Arc::new(ModelRegistry::new(
            catalog.clone(),
            loader,
            config.memory_budget,
        ));
        Ok(Self {
            registry,
            dispatcher: Arc::new(Dispatcher::new(catalog, Limits::from(config))),
            permits: Arc::new(Semaphore::new(config.max_concurrent_requests)),
            max_concurrent: config.max_concurrent_requests,
            timeout: config.request_timeout,
        })
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        self.registry.catalog()
    }

    pub fn limits(&self) -> Limits {
        self.dispatcher.limits()
    }

    /// Serves one request and reports any failure in the caller-facing shape.
    ///
    /// `deadline` can only shorten the configured request timeout.
    pub async fn handle(
        &self,
        request: NormalizedRequest,
        deadline: Option<Duration>,
    ) -> std::result::Result<NormalizedResult, Failure> {
        let key = request.model_key().to_string();
        self.run(request, deadline)
            .await
            .map_err(|err| report(&key, &err))
    }

    /// Same as [`handle`](Self::handle) but with the internal error type.
    pub async fn run(
        &self,
        request: NormalizedRequest,
        deadline: Option<Duration>,
    ) -> Result<NormalizedResult> {
        let started = Instant::now();
        let plan = self.dispatcher.plan(request)?;
        let descriptor = plan.descriptor().clone();

        let permit = self
            .permits
            .clone()
            .try_acquire_owned()
            .map_err(|_| Error::Busy(self.max_concurrent))?;

        // The permit belongs to the work, not to the caller: on timeout the decode,
        // load and inference keep running in the background and hold their slot
        // until they finish. A finished load still lands in the registry.
        let work = {
            let registry = self.registry.clone();
            let dispatcher = self.dispatcher.clone();
            tokio::spawn(async move {
                let _permit = permit;
                let plan = dispatcher.decode(plan).await?;
                let backend = registry.acquire(&plan.descriptor().key).await?;
                dispatcher.execute(backend, plan).await
            })
        };

        let budget = deadline.map_or(self.timeout, |d| d.min(self.timeout));
        let output_text = match tokio::time::timeout(budget, work).await {
            Ok(Ok(result)) => result?,
            Ok(Err(err)) => {
                return Err(Error::InferenceFailed {
                    key: descriptor.key.clone(),
                    cause: Arc::new(anyhow!("request task failed: {err}")),
                })
            }
            Err(_) => return Err(Error::Timeout(budget)),
        };

        let latency_ms = started.elapsed().as_millis() as u64;
        info!(model = %descriptor.key, family = %descriptor.family, latency_ms, "request served");
        Ok(NormalizedResult {
            model_key: descriptor.key.clone(),
            output_text,
            latency_ms,
            model_family: descriptor.family,
        })
    }
}

fn report(key: &str, err: &Error) -> Failure {
    let failure = Failure::from_error(err);
    let id = failure.correlation_id;
    match failure.error_kind {
        ErrorKind::LoadFailed | ErrorKind::InferenceFailed => {
            error!(correlation_id = %id, model = %key, error = %err, "request failed")
        }
        ErrorKind::ServiceUnavailable | ErrorKind::Timeout => {
            warn!(correlation_id = %id, model = %key, error = %err, "request not served")
        }
        _ => info!(correlation_id = %id, model = %key, error = %err, "request rejected"),
    }
    failure
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use async_trait::async_trait;
    use image::{DynamicImage, ImageFormat, Rgb, RgbImage};

    use super::*;
    use crate::request::{AnalyzeRequest, GenerateRequest, Invocation};
    use crate::{Architecture, Family, ModelDescriptor, ModelLike};

    struct Fixed(&'static str);

    impl ModelLike for Fixed {
        fn run(&self, _invocation: &Invocation) -> anyhow::Result<Vec<String>> {
            Ok(vec![self.0.to_string()])
        }
    }

    struct FixedLoader;

    #[async_trait]
    impl Loader for FixedLoader {
        async fn load(&self, _descriptor: &ModelDescriptor) -> anyhow::Result<Arc<dyn ModelLike>> {
            Ok(Arc::new(Fixed("a red square")))
        }
    }

    struct NeverLoads;

    #[async_trait]
    impl Loader for NeverLoads {
        async fn load(&self, _descriptor: &ModelDescriptor) -> anyhow::Result<Arc<dyn ModelLike>> {
            std::future::pending().await
        }
    }

    fn governor(config: EngineConfig, loader: Arc<dyn Loader>) -> Governor {
        let catalog = Catalog::new([
            ModelDescriptor::new("cap", Family::VisionCaptioner, Architecture::Blip, "t/cap"),
            ModelDescriptor::new("lm", Family::TextGenerator, Architecture::Qwen2, "t/lm"),
        ])
        .unwrap();
        Governor::new(&config, Arc::new(catalog), loader).unwrap()
    }

    fn png() -> Vec<u8> {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(4, 4, Rgb([255, 0, 0])));
        let mut bytes = Vec::new();
        img.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        bytes
    }

    #[tokio::test]
    async fn serves_and_reports_family() {
        let g = governor(EngineConfig::default(), Arc::new(FixedLoader));
        let result = g
            .handle(
                AnalyzeRequest {
                    model_key: "cap".into(),
                    image_bytes: png(),
                    ..Default::default()
                }
                .into(),
                None,
            )
            .await
            .unwrap();
        assert_eq!(result.model_key, "cap");
        assert_eq!(result.output_text, "a red square");
        assert_eq!(result.model_family, Family::VisionCaptioner);
    }

    #[tokio::test]
    async fn validation_failures_never_reach_the_loader() {
        let g = governor(EngineConfig::default(), Arc::new(NeverLoads));
        let failure = g
            .handle(
                GenerateRequest {
                    model_key: "lm".into(),
                    prompt: "hi".into(),
                    temperature: Some(5.0),
                    ..Default::default()
                }
                .into(),
                None,
            )
            .await
            .unwrap_err();
        assert_eq!(failure.error_kind, ErrorKind::InvalidParameter);
        assert!(g
            .registry()
            .status()
            .iter()
            .all(|s| s.load_attempts == 0));
    }

    #[tokio::test]
    async fn caller_deadline_shortens_timeout() {
        let g = governor(EngineConfig::default(), Arc::new(NeverLoads));
        let failure = g
            .handle(
                GenerateRequest {
                    model_key: "lm".into(),
                    prompt: "hi".into(),
                    ..Default::default()
                }
                .into(),
                Some(Duration::from_millis(20)),
            )
            .await
            .unwrap_err();
        assert_eq!(failure.error_kind, ErrorKind::Timeout);
        assert!(failure.error_kind.is_retryable());
    }

    #[tokio::test]
    async fn busy_when_no_permit_is_free() {
        let config = EngineConfig {
            max_concurrent_requests: 1,
            ..Default::default()
        };
        let g = Arc::new(governor(config, Arc::new(NeverLoads)));
        let request: NormalizedRequest = GenerateRequest {
            model_key: "lm".into(),
            prompt: "hi".into(),
            ..Default::default()
        }
        .into();

        let blocked = {
            let g = g.clone();
            let request = request.clone();
            tokio::spawn(async move { g.run(request, None).await })
        };
        while g.permits.available_permits() > 0 {
            tokio::task::yield_now().await;
        }

        let err = g.run(request, None).await.unwrap_err();
        assert!(matches!(err, Error::Busy(1)));
        assert_eq!(err.kind(), ErrorKind::ServiceUnavailable);
        blocked.abort();
    }

    struct Slow(Duration);

    impl ModelLike for Slow {
        fn run(&self, _invocation: &Invocation) -> anyhow::Result<Vec<String>> {
            std::thread::sleep(self.0);
            Ok(vec!["done".to_string()])
        }
    }

    struct SlowLoader(Duration);

    #[async_trait]
    impl Loader for SlowLoader {
        async fn load(&self, _descriptor: &ModelDescriptor) -> anyhow::Result<Arc<dyn ModelLike>> {
            Ok(Arc::new(Slow(self.0)))
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn abandoned_inference_keeps_its_permit() {
        let config = EngineConfig {
            max_concurrent_requests: 1,
            ..Default::default()
        };
        let g = governor(config, Arc::new(SlowLoader(Duration::from_millis(300))));
        let request = || -> NormalizedRequest {
            GenerateRequest {
                model_key: "lm".into(),
                prompt: "hi".into(),
                ..Default::default()
            }
            .into()
        };

        let err = g
            .run(request(), Some(Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert_eq!(g.permits.available_permits(), 0);

        let err = g.run(request(), None).await.unwrap_err();
        assert!(matches!(err, Error::Busy(1)));

        while g.permits.available_permits() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let result = g.run(request(), None).await.unwrap();
        assert_eq!(result.output_text, "done");
    }

    #[test]
    fn invalid_config_rejected() {
        let config = EngineConfig {
            max_concurrent_requests: 0,
            ..Default::default()
        };
        let catalog = Arc::new(Catalog::builtin());
        assert!(Governor::new(&config, catalog, Arc::new(FixedLoader)).is_err());
    }
}
