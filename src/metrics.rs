use crate::ScreenshotError;
use metrics::{register_counter, register_gauge, register_histogram, Counter, Gauge, Histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::time::Duration;
use tracing::info;

pub struct CacheMetrics {
    pub cache_hits: Counter,
    pub cache_misses: Counter,
    pub renders: Counter,
    pub render_failures: Counter,
    pub render_timeouts: Counter,
    pub invalidations: Counter,
    pub render_duration: Histogram,
    pub renders_in_flight: Gauge,
}

impl CacheMetrics {
    /// Handles bound to the globally installed recorder. Install the
    /// recorder first, otherwise every handle is a no-op.
    pub fn new() -> Self {
        Self {
            cache_hits: register_counter!("screenshot_cache_hits_total"),
            cache_misses: register_counter!("screenshot_cache_misses_total"),
            renders: register_counter!("screenshot_renders_total"),
            render_failures: register_counter!("screenshot_render_failures_total"),
            render_timeouts: register_counter!("screenshot_render_timeouts_total"),
            invalidations: register_counter!("screenshot_invalidations_total"),
            render_duration: register_histogram!("screenshot_render_duration_seconds"),
            renders_in_flight: register_gauge!("screenshot_renders_in_flight"),
        }
    }

    pub fn noop() -> Self {
        Self {
            cache_hits: Counter::noop(),
            cache_misses: Counter::noop(),
            renders: Counter::noop(),
            render_failures: Counter::noop(),
            render_timeouts: Counter::noop(),
            invalidations: Counter::noop(),
            render_duration: Histogram::noop(),
            renders_in_flight: Gauge::noop(),
        }
    }

    pub fn record_hit(&self) {
        self.cache_hits.increment(1);
    }

    pub fn record_miss(&self) {
        self.cache_misses.increment(1);
    }

    pub fn record_invalidation(&self) {
        self.invalidations.increment(1);
    }

    pub fn render_started(&self) {
        self.renders.increment(1);
        self.renders_in_flight.increment(1.0);
    }

    /// Records the outcome of a completed render. The in-flight gauge is
    /// released separately by `render_ended`, which also runs for renders
    /// abandoned mid-way.
    pub fn render_finished(&self, duration: Duration, error: Option<&ScreenshotError>) {
        self.render_duration.record(duration.as_secs_f64());

        match error {
            Some(ScreenshotError::Timeout(_)) => {
                self.render_failures.increment(1);
                self.render_timeouts.increment(1);
            }
            Some(_) => self.render_failures.increment(1),
            None => {}
        }
    }

    pub fn render_ended(&self) {
        self.renders_in_flight.decrement(1.0);
    }
}

impl Default for CacheMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Install the Prometheus recorder and return a handle that renders the
/// current snapshot in text exposition format.
pub fn install_prometheus_recorder() -> Result<PrometheusHandle, ScreenshotError> {
    let recorder = PrometheusBuilder::new().build_recorder();
    let handle = recorder.handle();

    metrics::set_boxed_recorder(Box::new(recorder))
        .map_err(|e| ScreenshotError::Configuration(e.to_string()))?;

    info!("Prometheus recorder installed");
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noop_metrics_accept_records() {
        let metrics = CacheMetrics::noop();
        metrics.record_hit();
        metrics.record_miss();
        metrics.record_invalidation();
        metrics.render_started();
        metrics.render_finished(
            Duration::from_millis(10),
            Some(&ScreenshotError::Timeout(Duration::from_secs(45))),
        );
        metrics.render_ended();
        metrics.render_started();
        metrics.render_finished(Duration::from_millis(10), None);
        metrics.render_ended();
    }
}
