//! Ordered, idempotent teardown of the telemetry pipelines

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use opentelemetry_sdk::error::OTelSdkResult;
use tokio::time::{Instant, timeout_at};

use super::TelemetryHandle;

/// One or more teardown steps failed
#[derive(Debug, thiserror::Error)]
#[error("telemetry shutdown failures: {}", .failures.join("; "))]
pub struct ShutdownError {
    /// Failed steps, in the order they ran
    pub failures: Vec<String>,
}

/// Tears down a [`TelemetryHandle`] exactly once
///
/// Steps run in a fixed order: stop the push reader, flush both providers,
/// close the scrape listener, then shut down the tracer provider and the
/// meter provider. A failed step is recorded and the remaining steps still
/// run. Calls after the first return `Ok(())` without touching anything.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    telemetry: Arc<TelemetryHandle>,
    done: Arc<AtomicBool>,
}

impl ShutdownHandle {
    pub(crate) fn new(telemetry: Arc<TelemetryHandle>) -> Self {
        Self {
            telemetry,
            done: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Whether teardown has already been started
    pub fn is_shut_down(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    /// Flush and release every pipeline, giving up on steps still running
    /// once `deadline` has elapsed
    pub async fn shutdown(&self, deadline: Duration) -> Result<(), ShutdownError> {
        if self.done.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let until = Instant::now() + deadline;
        let mut failures = Vec::new();
        let telemetry = &self.telemetry;

        if let Some(push) = telemetry.metrics.push() {
            let push = push.clone();
            let budget = remaining(until);
            run_blocking(until, "push metrics reader", &mut failures, move || {
                push.stop(budget)
            })
            .await;
        }

        let meter_provider = telemetry.meter_provider.clone();
        run_blocking(until, "meter provider flush", &mut failures, move || {
            meter_provider.force_flush()
        })
        .await;
        let tracer_provider = telemetry.tracer_provider.clone();
        run_blocking(until, "tracer provider flush", &mut failures, move || {
            tracer_provider.force_flush()
        })
        .await;

        if let Some(pull) = telemetry.metrics.pull() {
            match timeout_at(until, pull.close()).await {
                Ok(Ok(())) => {},
                Ok(Err(e)) => failures.push(format!("metrics listener: {e}")),
                Err(_) => failures.push("metrics listener: timed out".to_string()),
            }
        }

        let tracer_provider = telemetry.tracer_provider.clone();
        let budget = remaining(until);
        run_blocking(until, "tracer provider shutdown", &mut failures, move || {
            tracer_provider.shutdown_with_timeout(budget)
        })
        .await;
        let meter_provider = telemetry.meter_provider.clone();
        let budget = remaining(until);
        run_blocking(until, "meter provider shutdown", &mut failures, move || {
            meter_provider.shutdown_with_timeout(budget)
        })
        .await;

        if failures.is_empty() {
            tracing::debug!("Telemetry shut down");
            Ok(())
        } else {
            Err(ShutdownError { failures })
        }
    }
}

fn remaining(until: Instant) -> Duration {
    until.saturating_duration_since(Instant::now())
}

/// Run a blocking SDK call off the async runtime, bounded by `until`
async fn run_blocking<F>(until: Instant, step: &str, failures: &mut Vec<String>, call: F)
where
    F: FnOnce() -> OTelSdkResult + Send + 'static,
{
    match timeout_at(until, tokio::task::spawn_blocking(call)).await {
        Ok(Ok(Ok(()))) => {},
        Ok(Ok(Err(e))) => failures.push(format!("{step}: {e}")),
        Ok(Err(e)) => failures.push(format!("{step}: task failed: {e}")),
        Err(_) => failures.push(format!("{step}: timed out")),
    }
}
