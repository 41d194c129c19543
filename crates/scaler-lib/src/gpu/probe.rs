//! Vendor tool invocation
//!
//! Every call runs under a timeout with `kill_on_drop`, so a hung tool
//! never stalls the monitor loop.

use super::parse::{
    parse_nvidia_csv, parse_rocm_json, parse_xpu_csv, parse_xpu_discovery, ParsedDevices,
};
use super::GpuProbe;
use crate::error::{Result, ScalerError};
use crate::models::{DeviceInfo, GpuVendor};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::RwLock;
use tracing::{debug, warn};

const XPU_DUMP_ARGS: &[&str] = &["dump", "-d", "-1", "-m", "0,1,3,5,18", "-n", "1"];
const XPU_DISCOVERY_ARGS: &[&str] = &["discovery", "--dump", "1,16"];

/// Detection commands, in priority order
const DETECTION_ORDER: &[(GpuVendor, &str, &[&str])] = &[
    (
        GpuVendor::Nvidia,
        "nvidia-smi",
        &["--query-gpu=name", "--format=csv,noheader"],
    ),
    (GpuVendor::Amd, "rocm-smi", &["--showid"]),
    (GpuVendor::Intel, "xpu-smi", &["discovery"]),
];

/// Run a tool and return its stdout
pub async fn run_tool(program: &str, args: &[&str], timeout: Duration) -> Result<String> {
    let child = Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .output();

    let output = tokio::time::timeout(timeout, child)
        .await
        .map_err(|_| ScalerError::ProbeTimeout {
            program: program.to_string(),
            timeout_secs: timeout.as_secs(),
        })?
        .map_err(|e| ScalerError::ProbeFailed {
            program: program.to_string(),
            reason: e.to_string(),
        })?;

    if !output.status.success() {
        return Err(ScalerError::ProbeFailed {
            program: program.to_string(),
            reason: format!(
                "exit status {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Probe vendor tools in priority order and return the first that answers
pub async fn detect_vendor(timeout: Duration) -> GpuVendor {
    for (vendor, program, args) in DETECTION_ORDER {
        match run_tool(program, args, timeout).await {
            Ok(out) if !out.trim().is_empty() => {
                debug!(vendor = %vendor, program = %program, "GPU tool responded");
                return *vendor;
            }
            Ok(_) => debug!(program = %program, "GPU tool reported no devices"),
            Err(e) => debug!(program = %program, error = %e, "GPU tool not usable"),
        }
    }
    GpuVendor::Unknown
}

fn log_skipped(vendor: GpuVendor, parsed: &ParsedDevices) {
    for error in &parsed.errors {
        warn!(vendor = %vendor, error = %error, "Skipping unparseable device line");
    }
}

/// Command-line probe for a detected vendor, `None` for `Unknown`
pub fn probe_for_vendor(vendor: GpuVendor, timeout: Duration) -> Option<Arc<dyn GpuProbe>> {
    match vendor {
        GpuVendor::Intel => Some(Arc::new(XpuProbe::new(timeout))),
        other => SmiProbe::for_vendor(other, timeout).map(|p| Arc::new(p) as Arc<dyn GpuProbe>),
    }
}

type Parser = fn(&str) -> ParsedDevices;

/// Samples devices through the vendor's command-line tool
pub struct SmiProbe {
    vendor: GpuVendor,
    program: &'static str,
    args: &'static [&'static str],
    parser: Parser,
    timeout: Duration,
}

impl SmiProbe {
    /// Single-command probe, `None` for vendors that need more than one call
    pub fn for_vendor(vendor: GpuVendor, timeout: Duration) -> Option<Self> {
        let (program, args, parser): (&'static str, &'static [&'static str], Parser) =
            match vendor {
                GpuVendor::Nvidia => (
                    "nvidia-smi",
                    &[
                        "--query-gpu=index,name,memory.total,memory.used,memory.free,utilization.gpu,temperature.gpu,power.draw",
                        "--format=csv,noheader,nounits",
                    ],
                    parse_nvidia_csv,
                ),
                GpuVendor::Amd => (
                    "rocm-smi",
                    &[
                        "--showproductname",
                        "--showmeminfo",
                        "vram",
                        "--showuse",
                        "--showtemp",
                        "--showpower",
                        "--json",
                    ],
                    parse_rocm_json,
                ),
                GpuVendor::Intel | GpuVendor::Unknown => return None,
            };

        Some(Self {
            vendor,
            program,
            args,
            parser,
            timeout,
        })
    }
}

#[async_trait]
impl GpuProbe for SmiProbe {
    fn vendor(&self) -> GpuVendor {
        self.vendor
    }

    async fn sample(&self) -> Result<Vec<DeviceInfo>> {
        let output = run_tool(self.program, self.args, self.timeout).await?;
        let parsed = (self.parser)(&output);
        log_skipped(self.vendor, &parsed);
        Ok(parsed.devices)
    }
}

/// Intel probe: `xpu-smi dump` for live metrics
///
/// The dump has no memory-total column, so physical memory per device is
/// read once from `xpu-smi discovery` and cached.
pub struct XpuProbe {
    timeout: Duration,
    memory_totals: RwLock<HashMap<u32, u64>>,
}

impl XpuProbe {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            memory_totals: RwLock::new(HashMap::new()),
        }
    }

    async fn memory_totals(&self) -> HashMap<u32, u64> {
        {
            let cached = self.memory_totals.read().await;
            if !cached.is_empty() {
                return cached.clone();
            }
        }

        match run_tool("xpu-smi", XPU_DISCOVERY_ARGS, self.timeout).await {
            Ok(output) => {
                let totals = parse_xpu_discovery(&output);
                if !totals.is_empty() {
                    *self.memory_totals.write().await = totals.clone();
                }
                totals
            }
            Err(e) => {
                warn!(
                    error = %e,
                    "xpu-smi discovery failed, deriving memory totals from utilization"
                );
                HashMap::new()
            }
        }
    }
}

#[async_trait]
impl GpuProbe for XpuProbe {
    fn vendor(&self) -> GpuVendor {
        GpuVendor::Intel
    }

    async fn sample(&self) -> Result<Vec<DeviceInfo>> {
        let totals = self.memory_totals().await;
        let output = run_tool("xpu-smi", XPU_DUMP_ARGS, self.timeout).await?;
        let parsed = parse_xpu_csv(&output, &totals);
        log_skipped(GpuVendor::Intel, &parsed);
        Ok(parsed.devices)
    }
}
