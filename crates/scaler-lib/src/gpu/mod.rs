//! GPU telemetry and memory-budget modeling
//!
//! This module provides probes for reading accelerator memory and
//! utilization through the vendor tools (`nvidia-smi`, `rocm-smi`,
//! `xpu-smi`) with automatic vendor detection, plus the model memory
//! table used to turn free memory into an agent ceiling.

mod host;
mod monitor;
mod parse;
mod probe;
mod profiles;

pub use host::{HostLoad, HostSampler};
pub use monitor::{GpuSummary, ResourceMonitor};
pub use parse::{
    parse_nvidia_csv, parse_rocm_json, parse_xpu_csv, parse_xpu_discovery, ParsedDevices,
};
pub use probe::{detect_vendor, probe_for_vendor, run_tool, SmiProbe, XpuProbe};
pub use profiles::{MemoryBudget, ModelMemoryProfile, ModelProfiles, DEFAULT_RECOMMENDED_MEMORY_MB};

use crate::error::Result;
use crate::models::{DeviceInfo, GpuVendor};
use std::sync::Arc;
use std::time::Duration;

pub use async_trait::async_trait;

/// Trait for GPU telemetry sources
#[async_trait]
pub trait GpuProbe: Send + Sync {
    /// Vendor this probe reads
    fn vendor(&self) -> GpuVendor;

    /// Query every device once
    async fn sample(&self) -> Result<Vec<DeviceInfo>>;
}

/// Detect the vendor and create the matching probe
pub async fn create_probe(timeout: Duration) -> Option<Arc<dyn GpuProbe>> {
    let vendor = detect_vendor(timeout).await;

    match probe_for_vendor(vendor, timeout) {
        Some(probe) => {
            tracing::info!(vendor = %vendor, "Detected GPU vendor, using command-line probe");
            Some(probe)
        }
        None => {
            tracing::warn!("Could not detect a GPU vendor, telemetry unavailable");
            None
        }
    }
}
