use std::sync::Arc;

use crate::artifact::ArtifactStore;
use crate::clock::Clock;
use crate::handler::HandlerRegistry;
use crate::metrics::RuntimeMetrics;
use crate::queue::WorkQueue;
use crate::ratelimit::{RateLimitConfig, RateLimitManager};
use crate::retry::RetryConfig;
use crate::store::StateStore;

/// Shared runtime services, passed explicitly to coordinator, worker, and
/// handler entry points. There are no globals; tests build one of these over
/// an in-memory store and a manual clock.
#[derive(Clone)]
pub struct RuntimeContext {
    pub store: Arc<dyn StateStore>,
    pub queue: Arc<WorkQueue>,
    pub limiter: Arc<RateLimitManager>,
    pub artifacts: ArtifactStore,
    pub registry: Arc<HandlerRegistry>,
    pub metrics: Arc<RuntimeMetrics>,
    pub clock: Arc<dyn Clock>,
    pub retry: RetryConfig,
}

impl RuntimeContext {
    pub fn new(
        store: Arc<dyn StateStore>,
        artifacts: ArtifactStore,
        registry: Arc<HandlerRegistry>,
        clock: Arc<dyn Clock>,
        limits: RateLimitConfig,
        retry: RetryConfig,
    ) -> Self {
        let metrics = Arc::new(RuntimeMetrics::default());
        let queue = Arc::new(WorkQueue::new(store.clone(), metrics.clone()));
        let limiter = Arc::new(RateLimitManager::new(
            store.clone(),
            clock.clone(),
            metrics.clone(),
            limits,
        ));
        Self {
            store,
            queue,
            limiter,
            artifacts,
            registry,
            metrics,
            clock,
            retry,
        }
    }
}
