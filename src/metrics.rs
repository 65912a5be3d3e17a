//! Engine metrics
//!
//! Prometheus counters for module outcomes and object traffic, held in a
//! registry owned by the engine rather than the process-global one.

use crate::crd::{ModuleState, ModuleType};
use crate::error::{Error, Result};
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

pub struct EngineMetrics {
    registry: Registry,
    module_outcomes: IntCounterVec,
    objects_applied: IntCounter,
    objects_deleted: IntCounter,
    reconcile_duration: Histogram,
}

fn metrics_error(e: prometheus::Error) -> Error {
    Error::Internal(format!("metrics registration failed: {}", e))
}

impl EngineMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let module_outcomes = IntCounterVec::new(
            Opts::new(
                "csm_module_outcomes_total",
                "Module reconcile outcomes by module and result",
            ),
            &["module", "result"],
        )
        .map_err(metrics_error)?;
        let objects_applied = IntCounter::new(
            "csm_objects_applied_total",
            "Objects applied to the control plane",
        )
        .map_err(metrics_error)?;
        let objects_deleted = IntCounter::new(
            "csm_objects_deleted_total",
            "Objects deleted from the control plane",
        )
        .map_err(metrics_error)?;
        let reconcile_duration = Histogram::with_opts(HistogramOpts::new(
            "csm_reconcile_duration_seconds",
            "Duration of one reconcile pass",
        ))
        .map_err(metrics_error)?;

        registry
            .register(Box::new(module_outcomes.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(objects_applied.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(objects_deleted.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(reconcile_duration.clone()))
            .map_err(metrics_error)?;

        Ok(Self {
            registry,
            module_outcomes,
            objects_applied,
            objects_deleted,
            reconcile_duration,
        })
    }

    pub fn record_module(&self, module: ModuleType, state: ModuleState) {
        let result = match state {
            ModuleState::Applied => "applied",
            ModuleState::Removed => "removed",
            ModuleState::Failed => "failed",
        };
        self.module_outcomes
            .with_label_values(&[module.as_str(), result])
            .inc();
    }

    pub fn record_objects(&self, count: usize, deleted: bool) {
        let counter = if deleted {
            &self.objects_deleted
        } else {
            &self.objects_applied
        };
        counter.inc_by(count as u64);
    }

    pub fn observe_duration(&self, seconds: f64) {
        self.reconcile_duration.observe(seconds);
    }

    /// Count of one module/result pair
    pub fn module_count(&self, module: ModuleType, result: &str) -> u64 {
        self.module_outcomes
            .with_label_values(&[module.as_str(), result])
            .get()
    }

    /// Text exposition format, with its content type
    pub fn encode(&self) -> Result<(Vec<u8>, String)> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metrics_error)?;
        Ok((buffer, encoder.format_type().to_string()))
    }
}
