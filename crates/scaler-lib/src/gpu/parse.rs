//! Vendor tool output parsing
//!
//! Each parser turns raw tool output into `DeviceInfo` records. A malformed
//! device line is reported in `errors` and skipped, the other devices are
//! still returned.

use crate::error::ScalerError;
use crate::models::{DeviceInfo, GpuVendor};
use serde_json::Value;
use std::collections::HashMap;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Devices parsed from one tool invocation plus the lines that were skipped
#[derive(Debug, Default)]
pub struct ParsedDevices {
    pub devices: Vec<DeviceInfo>,
    pub errors: Vec<ScalerError>,
}

fn parse_error(line: &str, reason: impl Into<String>) -> ScalerError {
    ScalerError::Parse {
        line: line.to_string(),
        reason: reason.into(),
    }
}

/// Values like `[N/A]` or `[Not Supported]` mean the field is absent
fn optional_number(field: &str) -> Option<f64> {
    let field = field.trim();
    if field.is_empty() || field.starts_with('[') || field.eq_ignore_ascii_case("n/a") {
        return None;
    }
    field.parse::<f64>().ok()
}

fn required_number(field: Option<&&str>, name: &str, line: &str) -> Result<f64, ScalerError> {
    let raw = field.ok_or_else(|| parse_error(line, format!("missing {}", name)))?;
    optional_number(raw)
        .ok_or_else(|| parse_error(line, format!("invalid {}: {:?}", name, raw.trim())))
}

/// Parse `nvidia-smi --query-gpu=index,name,memory.total,memory.used,memory.free,
/// utilization.gpu,temperature.gpu,power.draw --format=csv,noheader,nounits`
pub fn parse_nvidia_csv(output: &str) -> ParsedDevices {
    let mut parsed = ParsedDevices::default();

    for line in output.lines().filter(|l| !l.trim().is_empty()) {
        match parse_nvidia_line(line) {
            Ok(device) => parsed.devices.push(device),
            Err(e) => parsed.errors.push(e),
        }
    }

    parsed
}

fn parse_nvidia_line(line: &str) -> Result<DeviceInfo, ScalerError> {
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    if fields.len() < 6 {
        return Err(parse_error(
            line,
            format!("expected at least 6 fields, got {}", fields.len()),
        ));
    }

    let index = fields[0]
        .parse::<u32>()
        .map_err(|_| parse_error(line, format!("invalid index: {:?}", fields[0])))?;
    let total = required_number(fields.get(2), "memory.total", line)? as u64;
    let used = required_number(fields.get(3), "memory.used", line)? as u64;
    let free = fields
        .get(4)
        .and_then(|f| optional_number(f))
        .map(|f| f as u64)
        .unwrap_or_else(|| total.saturating_sub(used));
    let utilization = required_number(fields.get(5), "utilization.gpu", line)?;

    Ok(DeviceInfo {
        index,
        name: fields[1].to_string(),
        vendor: GpuVendor::Nvidia,
        total_memory_mb: total,
        used_memory_mb: used,
        free_memory_mb: free,
        utilization_percent: utilization.clamp(0.0, 100.0),
        temperature_c: fields.get(6).and_then(|f| optional_number(f)),
        power_watts: fields.get(7).and_then(|f| optional_number(f)),
    })
}

fn json_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => optional_number(s),
        _ => None,
    }
}

fn first_number(card: &serde_json::Map<String, Value>, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|k| card.get(*k).and_then(json_number))
}

/// Parse `rocm-smi --showproductname --showmeminfo vram --showuse --showtemp
/// --showpower --json`, one object per `cardN` key
pub fn parse_rocm_json(output: &str) -> ParsedDevices {
    let mut parsed = ParsedDevices::default();

    let root: Value = match serde_json::from_str(output) {
        Ok(v) => v,
        Err(e) => {
            parsed.errors.push(parse_error(output.trim(), e.to_string()));
            return parsed;
        }
    };
    let Some(cards) = root.as_object() else {
        parsed
            .errors
            .push(parse_error(output.trim(), "top-level value is not an object"));
        return parsed;
    };

    for (key, card) in cards {
        let Some(index) = key.strip_prefix("card").and_then(|i| i.parse::<u32>().ok()) else {
            // "system" and other non-device sections
            continue;
        };
        match parse_rocm_card(index, card) {
            Ok(device) => parsed.devices.push(device),
            Err(e) => parsed.errors.push(e),
        }
    }

    parsed.devices.sort_by_key(|d| d.index);
    parsed
}

fn parse_rocm_card(index: u32, card: &Value) -> Result<DeviceInfo, ScalerError> {
    let line = card.to_string();
    let card = card
        .as_object()
        .ok_or_else(|| parse_error(&line, "card entry is not an object"))?;

    let total_bytes = first_number(card, &["VRAM Total Memory (B)"])
        .ok_or_else(|| parse_error(&line, "missing VRAM Total Memory (B)"))?;
    let used_bytes = first_number(card, &["VRAM Total Used Memory (B)"])
        .ok_or_else(|| parse_error(&line, "missing VRAM Total Used Memory (B)"))?;
    let utilization = first_number(card, &["GPU use (%)"])
        .ok_or_else(|| parse_error(&line, "missing GPU use (%)"))?;

    let total = (total_bytes / BYTES_PER_MB) as u64;
    let used = (used_bytes / BYTES_PER_MB) as u64;
    let name = ["Card series", "Card SKU", "Device Name"]
        .iter()
        .find_map(|k| card.get(*k).and_then(Value::as_str))
        .unwrap_or("AMD GPU")
        .to_string();

    Ok(DeviceInfo {
        index,
        name,
        vendor: GpuVendor::Amd,
        total_memory_mb: total,
        used_memory_mb: used,
        free_memory_mb: total.saturating_sub(used),
        utilization_percent: utilization.clamp(0.0, 100.0),
        temperature_c: first_number(
            card,
            &[
                "Temperature (Sensor edge) (C)",
                "Temperature (Sensor junction) (C)",
            ],
        ),
        power_watts: first_number(
            card,
            &[
                "Average Graphics Package Power (W)",
                "Current Socket Graphics Package Power (W)",
            ],
        ),
    })
}

/// Leading number of a field such as `16384.00 MiB`
fn leading_number(field: &str) -> Option<f64> {
    optional_number(field.split_whitespace().next().unwrap_or(""))
}

/// Parse `xpu-smi discovery --dump 1,16` into physical memory per device, in MiB
pub fn parse_xpu_discovery(output: &str) -> HashMap<u32, u64> {
    let mut lines = output.lines().filter(|l| !l.trim().is_empty());
    let Some(header) = lines.next() else {
        return HashMap::new();
    };
    let columns: Vec<&str> = header.split(',').map(str::trim).collect();
    let (Some(id_col), Some(mem_col)) = (
        columns.iter().position(|c| *c == "Device ID"),
        columns.iter().position(|c| *c == "Memory Physical Size"),
    ) else {
        return HashMap::new();
    };

    lines
        .filter_map(|line| {
            let fields: Vec<&str> = line.split(',').map(str::trim).collect();
            let index = fields.get(id_col)?.parse::<u32>().ok()?;
            let total = leading_number(fields.get(mem_col)?)?;
            Some((index, total.round() as u64))
        })
        .collect()
}

/// Parse `xpu-smi dump` CSV output. Columns are located by header name.
///
/// Total memory comes from `memory_totals` (see `parse_xpu_discovery`).
/// Without an entry it is derived from used memory and memory utilization;
/// an idle device with no known total is kept with zero memory.
pub fn parse_xpu_csv(output: &str, memory_totals: &HashMap<u32, u64>) -> ParsedDevices {
    let mut parsed = ParsedDevices::default();
    let mut lines = output.lines().filter(|l| !l.trim().is_empty());

    let Some(header) = lines.next() else {
        return parsed;
    };
    let columns: Vec<&str> = header.split(',').map(str::trim).collect();
    let position = |name: &str| columns.iter().position(|c| *c == name);

    let (Some(id_col), Some(util_col), Some(mem_used_col), Some(mem_util_col)) = (
        position("DeviceId"),
        position("GPU Utilization (%)"),
        position("GPU Memory Used (MiB)"),
        position("GPU Memory Utilization (%)"),
    ) else {
        parsed
            .errors
            .push(parse_error(header, "missing required xpu-smi columns"));
        return parsed;
    };
    let power_col = position("GPU Power (W)");
    let temp_col = position("GPU Core Temperature (Celsius Degree)");

    for line in lines {
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        let device = (|| -> Result<DeviceInfo, ScalerError> {
            let index = fields
                .get(id_col)
                .and_then(|f| f.parse::<u32>().ok())
                .ok_or_else(|| parse_error(line, "invalid DeviceId"))?;
            let utilization = required_number(fields.get(util_col), "GPU Utilization", line)?;
            let used = required_number(fields.get(mem_used_col), "GPU Memory Used", line)?;
            let mem_util =
                required_number(fields.get(mem_util_col), "GPU Memory Utilization", line)?;
            let total = match memory_totals.get(&index) {
                Some(total) => *total,
                None if mem_util > 0.0 => (used / (mem_util / 100.0)).round() as u64,
                None => used as u64,
            };
            let used = (used as u64).min(total);

            Ok(DeviceInfo {
                index,
                name: format!("Intel GPU {}", index),
                vendor: GpuVendor::Intel,
                total_memory_mb: total,
                used_memory_mb: used,
                free_memory_mb: total.saturating_sub(used),
                utilization_percent: utilization.clamp(0.0, 100.0),
                temperature_c: temp_col
                    .and_then(|c| fields.get(c))
                    .and_then(|f| optional_number(f)),
                power_watts: power_col
                    .and_then(|c| fields.get(c))
                    .and_then(|f| optional_number(f)),
            })
        })();

        match device {
            Ok(device) => parsed.devices.push(device),
            Err(e) => parsed.errors.push(e),
        }
    }

    parsed
}
