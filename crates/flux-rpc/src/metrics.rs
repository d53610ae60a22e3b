//! Prometheus metrics for procedure invocations.

use std::time::Duration;

use anyhow::Result;
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};

/// Per-invocation observations, labelled by procedure name and outcome
/// (`success` or `error`).
#[derive(Clone)]
pub struct RpcMetrics {
    registry: Registry,
    executions: IntCounterVec,
    duration: HistogramVec,
}

impl RpcMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let executions = IntCounterVec::new(
            Opts::new(
                "flux_rpc_executions_total",
                "Total procedure executions by outcome",
            ),
            &["procedure", "outcome"],
        )?;
        registry.register(Box::new(executions.clone()))?;

        let duration = HistogramVec::new(
            HistogramOpts::new(
                "flux_rpc_execution_duration_seconds",
                "Procedure execution duration by outcome",
            ),
            &["procedure", "outcome"],
        )?;
        registry.register(Box::new(duration.clone()))?;

        Ok(Self {
            registry,
            executions,
            duration,
        })
    }

    /// Records one finished invocation.
    pub fn observe(&self, procedure: &str, outcome: &str, duration: Duration) {
        self.executions
            .with_label_values(&[procedure, outcome])
            .inc();
        self.duration
            .with_label_values(&[procedure, outcome])
            .observe(duration.as_secs_f64());
    }

    /// The registry backing the `/metrics` exposition endpoint.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}
