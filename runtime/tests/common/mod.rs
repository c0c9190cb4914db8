//! Shared wiring for the runtime integration tests

#![allow(dead_code)]

use boxoffice_runtime::{
    HandlerRegistry, JobWorker, LifecycleConfig, TransactionLifecycle, WorkerConfig,
};
use boxoffice_testing::Fixture;
use std::sync::Arc;

pub struct Harness {
    pub fx: Fixture,
    pub lifecycle: Arc<TransactionLifecycle>,
    pub worker: JobWorker,
}

pub async fn harness() -> Harness {
    harness_with(LifecycleConfig::default()).await
}

pub async fn harness_with(config: LifecycleConfig) -> Harness {
    boxoffice_testing::helpers::init_tracing();
    let fx = Fixture::seeded().await;
    let lifecycle = Arc::new(
        TransactionLifecycle::builder(fx.dyn_store(), fx.dyn_queue())
            .notifier(fx.dyn_notifier())
            .asset_store(fx.dyn_assets())
            .clock(fx.dyn_clock())
            .config(config)
            .build(),
    );
    let worker = worker_for(&fx, HandlerRegistry::for_lifecycle(&lifecycle));
    Harness {
        fx,
        lifecycle,
        worker,
    }
}

pub fn worker_for(fx: &Fixture, registry: HandlerRegistry) -> JobWorker {
    JobWorker::new(
        fx.dyn_queue(),
        registry,
        fx.dyn_clock(),
        WorkerConfig::default(),
    )
}
