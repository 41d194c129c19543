//! Resource monitor loop
//!
//! Polls the GPU probe on its own interval and publishes the last
//! successful device list. Readers never wait on the probe.

use super::GpuProbe;
use crate::error::{Result, ScalerError};
use crate::models::{DeviceInfo, GpuVendor};
use crate::observability::ScalerMetrics;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard};
use std::time::Duration;
use tokio::time::interval;
use tracing::{debug, info, warn};

/// Aggregated view of the last successful refresh
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuSummary {
    /// False when no vendor tool was found or no device was reported
    pub available: bool,
    pub vendor: GpuVendor,
    pub device_count: usize,
    pub total_memory_mb: u64,
    pub used_memory_mb: u64,
    pub free_memory_mb: u64,
    /// Used over total across all devices
    pub memory_utilization_percent: f64,
    /// Mean compute utilization across devices
    pub utilization_percent: f64,
    pub agent_count: usize,
    pub last_refresh: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl GpuSummary {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            available: false,
            vendor: GpuVendor::Unknown,
            device_count: 0,
            total_memory_mb: 0,
            used_memory_mb: 0,
            free_memory_mb: 0,
            memory_utilization_percent: 0.0,
            utilization_percent: 0.0,
            agent_count: 0,
            last_refresh: None,
            last_error: Some(reason.into()),
        }
    }

    pub fn from_devices(vendor: GpuVendor, devices: &[DeviceInfo]) -> Self {
        if devices.is_empty() {
            return Self {
                vendor,
                ..Self::unavailable("no GPU devices reported")
            };
        }

        let total: u64 = devices.iter().map(|d| d.total_memory_mb).sum();
        let used: u64 = devices.iter().map(|d| d.used_memory_mb).sum();
        let free: u64 = devices.iter().map(|d| d.free_memory_mb).sum();
        let memory_utilization_percent = if total == 0 {
            0.0
        } else {
            (used.min(total) as f64 / total as f64 * 100.0).clamp(0.0, 100.0)
        };

        Self {
            available: true,
            vendor,
            device_count: devices.len(),
            total_memory_mb: total,
            used_memory_mb: used,
            free_memory_mb: free,
            memory_utilization_percent,
            utilization_percent: mean(devices.iter().map(|d| d.utilization_percent)),
            agent_count: 0,
            last_refresh: None,
            last_error: None,
        }
    }
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, count) = values.fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}

#[derive(Debug, Default)]
struct MonitorState {
    devices: Vec<DeviceInfo>,
    last_refresh: Option<DateTime<Utc>>,
    last_error: Option<String>,
    consecutive_failures: u32,
}

/// Periodic GPU telemetry with cached aggregations
pub struct ResourceMonitor {
    probe: Option<Arc<dyn GpuProbe>>,
    state: RwLock<MonitorState>,
    agent_count: AtomicUsize,
    interval: Duration,
}

impl ResourceMonitor {
    /// Create a monitor; `None` means telemetry is unavailable
    pub fn new(probe: Option<Arc<dyn GpuProbe>>, interval: Duration) -> Self {
        let state = MonitorState {
            last_error: probe
                .is_none()
                .then(|| "no supported GPU tool found".to_string()),
            ..Default::default()
        };

        Self {
            probe,
            state: RwLock::new(state),
            agent_count: AtomicUsize::new(0),
            interval,
        }
    }

    fn read_state(&self) -> RwLockReadGuard<'_, MonitorState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn vendor(&self) -> GpuVendor {
        self.probe
            .as_ref()
            .map(|p| p.vendor())
            .unwrap_or(GpuVendor::Unknown)
    }

    /// Query the probe and replace the device list
    ///
    /// On failure the previous list is kept and the error is recorded.
    pub async fn refresh(&self) -> Result<Vec<DeviceInfo>> {
        let Some(probe) = &self.probe else {
            return Err(ScalerError::TelemetryUnavailable(
                "no supported GPU tool found".into(),
            ));
        };

        let result = probe.sample().await;
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);

        match result {
            Ok(devices) => {
                state.devices = devices.clone();
                state.last_refresh = Some(Utc::now());
                state.last_error = None;
                state.consecutive_failures = 0;
                Ok(devices)
            }
            Err(e) => {
                state.last_error = Some(e.to_string());
                state.consecutive_failures += 1;
                Err(e)
            }
        }
    }

    pub fn devices(&self) -> Vec<DeviceInfo> {
        self.read_state().devices.clone()
    }

    pub fn total_memory_mb(&self) -> u64 {
        self.read_state().devices.iter().map(|d| d.total_memory_mb).sum()
    }

    pub fn free_memory_mb(&self) -> u64 {
        self.read_state().devices.iter().map(|d| d.free_memory_mb).sum()
    }

    pub fn average_utilization(&self) -> f64 {
        mean(self.read_state().devices.iter().map(|d| d.utilization_percent))
    }

    pub fn average_memory_utilization(&self) -> f64 {
        mean(
            self.read_state()
                .devices
                .iter()
                .map(DeviceInfo::memory_utilization_percent),
        )
    }

    /// Agent count fed back from the lifecycle manager
    pub fn set_agent_count(&self, count: usize) {
        self.agent_count.store(count, Ordering::Relaxed);
    }

    /// Mean GPU utilization attributed to each agent
    pub fn utilization_per_agent(&self) -> f64 {
        let agents = self.agent_count.load(Ordering::Relaxed);
        if agents == 0 {
            return 0.0;
        }
        self.average_utilization() / agents as f64
    }

    pub fn summary(&self) -> GpuSummary {
        let state = self.read_state();
        let mut summary = if self.probe.is_none() {
            GpuSummary::unavailable("no supported GPU tool found")
        } else if state.last_refresh.is_none() {
            GpuSummary {
                vendor: self.vendor(),
                ..GpuSummary::unavailable("no successful GPU refresh yet")
            }
        } else {
            GpuSummary::from_devices(self.vendor(), &state.devices)
        };

        summary.agent_count = self.agent_count.load(Ordering::Relaxed);
        summary.last_refresh = state.last_refresh;
        if state.last_error.is_some() {
            summary.last_error = state.last_error.clone();
        }
        summary
    }

    /// Run the polling loop until shutdown
    pub async fn run(self: Arc<Self>, mut shutdown: tokio::sync::broadcast::Receiver<()>) {
        if self.probe.is_none() {
            warn!("No GPU telemetry available, resource monitor idle");
        }
        info!(
            interval_secs = self.interval.as_secs(),
            vendor = %self.vendor(),
            "Starting resource monitor"
        );

        let metrics = ScalerMetrics::new();
        let mut ticker = interval(self.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.probe.is_none() {
                        continue;
                    }
                    match self.refresh().await {
                        Ok(devices) => debug!(devices = devices.len(), "GPU telemetry refreshed"),
                        Err(e) => {
                            metrics.inc_telemetry_errors();
                            let failures = self.read_state().consecutive_failures;
                            warn!(
                                error = %e,
                                consecutive_failures = failures,
                                "GPU telemetry refresh failed"
                            );
                        }
                    }
                }
                _ = shutdown.recv() => {
                    info!("Shutting down resource monitor");
                    break;
                }
            }
        }
    }
}
