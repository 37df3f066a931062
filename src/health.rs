use crate::{is_regular_file, ScreenshotCache};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthLevel {
    Healthy,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub overall: HealthLevel,
    pub renderer: HealthLevel,
    pub storage: HealthLevel,
    pub load: HealthLevel,
    pub screenshots_enabled: bool,
    pub renders_in_flight: usize,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct HealthThresholds {
    /// Concurrent renders above which the service reports a warning.
    pub max_renders_in_flight: usize,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            max_renders_in_flight: 8,
        }
    }
}

pub struct HealthChecker {
    cache: Option<Arc<ScreenshotCache>>,
    thresholds: HealthThresholds,
}

impl HealthChecker {
    pub fn new(cache: Option<Arc<ScreenshotCache>>) -> Self {
        Self {
            cache,
            thresholds: HealthThresholds::default(),
        }
    }

    pub fn with_thresholds(mut self, thresholds: HealthThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub async fn check(&self) -> HealthStatus {
        let renderer = self.check_renderer();
        let storage = self.check_storage().await;
        let load = self.check_load();
        let overall = determine_overall_health(&[renderer, storage, load]);

        match overall {
            HealthLevel::Healthy => info!("Health check: OK"),
            HealthLevel::Warning => warn!(
                "Health check: WARNING - renderer: {:?}, storage: {:?}, load: {:?}",
                renderer, storage, load
            ),
            HealthLevel::Critical => error!(
                "Health check: CRITICAL - renderer: {:?}, storage: {:?}, load: {:?}",
                renderer, storage, load
            ),
        }

        HealthStatus {
            overall,
            renderer,
            storage,
            load,
            screenshots_enabled: self.cache.is_some(),
            renders_in_flight: self
                .cache
                .as_ref()
                .map(|cache| cache.renders_in_flight())
                .unwrap_or(0),
            timestamp: Utc::now(),
        }
    }

    fn check_renderer(&self) -> HealthLevel {
        match &self.cache {
            // Disabled at startup on purpose; the rest of the service works.
            None => HealthLevel::Warning,
            Some(cache) if !is_regular_file(cache.renderer()) => {
                error!("Renderer {} has disappeared", cache.renderer().display());
                HealthLevel::Critical
            }
            Some(_) => HealthLevel::Healthy,
        }
    }

    async fn check_storage(&self) -> HealthLevel {
        let Some(cache) = &self.cache else {
            return HealthLevel::Healthy;
        };

        let probe = cache
            .cache_dir()
            .join(format!(".health-{}", uuid::Uuid::new_v4()));
        match tokio::fs::write(&probe, b"ok").await {
            Ok(()) => {
                let _ = tokio::fs::remove_file(&probe).await;
                HealthLevel::Healthy
            }
            Err(e) => {
                error!(
                    "Screenshot directory {} is not writable: {}",
                    cache.cache_dir().display(),
                    e
                );
                HealthLevel::Critical
            }
        }
    }

    fn check_load(&self) -> HealthLevel {
        let in_flight = self
            .cache
            .as_ref()
            .map(|cache| cache.renders_in_flight())
            .unwrap_or(0);

        if in_flight > self.thresholds.max_renders_in_flight {
            HealthLevel::Warning
        } else {
            HealthLevel::Healthy
        }
    }
}

fn determine_overall_health(levels: &[HealthLevel]) -> HealthLevel {
    if levels.contains(&HealthLevel::Critical) {
        HealthLevel::Critical
    } else if levels.contains(&HealthLevel::Warning) {
        HealthLevel::Warning
    } else {
        HealthLevel::Healthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overall_health_takes_the_worst() {
        use HealthLevel::*;
        assert_eq!(determine_overall_health(&[Healthy, Healthy]), Healthy);
        assert_eq!(determine_overall_health(&[Healthy, Warning]), Warning);
        assert_eq!(determine_overall_health(&[Warning, Critical, Healthy]), Critical);
    }

    #[tokio::test]
    async fn test_disabled_screenshots_report_warning() {
        let status = HealthChecker::new(None).check().await;
        assert_eq!(status.overall, HealthLevel::Warning);
        assert_eq!(status.renderer, HealthLevel::Warning);
        assert!(!status.screenshots_enabled);

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["overall"], "warning");
        assert_eq!(json["screenshots_enabled"], false);
    }
}
