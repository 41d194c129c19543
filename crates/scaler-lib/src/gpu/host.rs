//! Host CPU and memory sampling

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use sysinfo::System;

/// Host load in percent
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct HostLoad {
    pub cpu_percent: f64,
    pub memory_percent: f64,
}

/// Samples host load with `sysinfo`
///
/// The refresh calls block, so sampling runs on the blocking pool.
#[derive(Clone)]
pub struct HostSampler {
    system: Arc<Mutex<System>>,
}

impl Default for HostSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl HostSampler {
    pub fn new() -> Self {
        Self {
            system: Arc::new(Mutex::new(System::new())),
        }
    }

    pub async fn sample(&self) -> HostLoad {
        let system = self.system.clone();

        tokio::task::spawn_blocking(move || {
            let mut sys = system.lock().unwrap_or_else(PoisonError::into_inner);
            sys.refresh_cpu_usage();
            sys.refresh_memory();

            let total = sys.total_memory();
            let memory_percent = if total == 0 {
                0.0
            } else {
                sys.used_memory() as f64 / total as f64 * 100.0
            };

            HostLoad {
                cpu_percent: f64::from(sys.global_cpu_usage()).clamp(0.0, 100.0),
                memory_percent: memory_percent.clamp(0.0, 100.0),
            }
        })
        .await
        .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sample_is_bounded() {
        let load = HostSampler::new().sample().await;
        assert!((0.0..=100.0).contains(&load.cpu_percent));
        assert!((0.0..=100.0).contains(&load.memory_percent));
    }
}
