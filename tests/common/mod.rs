//! Shared fixtures for integration tests against the in-memory backends.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use sweepq::config::SweepConfig;
use sweepq::scheduler::{
    aggregate, AggregateReport, BackendKind, Connector, ParamFunction, PoolReport, WorkerPool,
    WorkerPoolConfig,
};

pub const WAIT: Duration = Duration::from_millis(20);

/// Fast timings so recovery paths finish within a test run.
pub fn test_config(kind: BackendKind, total: u64, chunk_size: u64) -> SweepConfig {
    SweepConfig::default()
        .with_backend(kind)
        .with_job(total, chunk_size)
        .with_staleness(Duration::from_millis(150), Duration::from_millis(30))
        .with_broker_retries(3, Duration::from_millis(20))
        .with_idle_timeout(Duration::from_millis(800))
        .with_block_timeout(Duration::from_millis(25))
}

/// Default timings scaled down a hundredfold, keeping their proportions.
pub fn scaled_default_config(kind: BackendKind, total: u64, chunk_size: u64) -> SweepConfig {
    let defaults = SweepConfig::default();
    let scaled = |ms: u64| Duration::from_millis(ms / 100);
    SweepConfig::default()
        .with_backend(kind)
        .with_job(total, chunk_size)
        .with_staleness(
            scaled(defaults.stream.staleness_threshold_ms),
            scaled(defaults.stream.sweep_interval_ms),
        )
        .with_broker_retries(defaults.broker.max_retries, scaled(defaults.broker.retry_delay_ms))
        .with_idle_timeout(scaled(defaults.worker.idle_timeout_ms))
        .with_block_timeout(scaled(defaults.worker.block_timeout_ms))
        .with_init_lease(scaled(defaults.worker.init_lease_ms))
}

pub async fn run_pool(
    connector: &Connector,
    config: &SweepConfig,
    workers: usize,
    function: Arc<dyn ParamFunction>,
) -> PoolReport {
    let mut pool = WorkerPool::new(
        WorkerPoolConfig::new(workers),
        config.clone(),
        connector.clone(),
        function,
    );
    pool.start().expect("start pool");
    let report = pool.wait().await.expect("wait for pool");
    assert!(
        report.first_error().is_none(),
        "worker failed: {:?}",
        report.first_error()
    );
    report
}

pub async fn aggregate_results(connector: &Connector, config: &SweepConfig) -> AggregateReport {
    let backend = connector.connect().await.expect("connect aggregator");
    aggregate(
        backend,
        &config.results_channel,
        &config.group,
        "aggregator",
        config.expected_chunks(),
        Duration::from_millis(300),
    )
    .await
    .expect("aggregate")
}
