//! Model memory profiles and the per-agent memory budget

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Recommended memory per agent for models missing from the table
pub const DEFAULT_RECOMMENDED_MEMORY_MB: u64 = 3072;

/// Memory requirements of one model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMemoryProfile {
    pub model: String,
    pub min_memory_mb: u64,
    pub recommended_memory_mb: u64,
    pub context_length: u32,
    pub parameter_count: String,
}

impl ModelMemoryProfile {
    fn new(
        model: &str,
        min_memory_mb: u64,
        recommended_memory_mb: u64,
        context_length: u32,
        parameter_count: &str,
    ) -> Self {
        Self {
            model: model.to_string(),
            min_memory_mb,
            recommended_memory_mb,
            context_length,
            parameter_count: parameter_count.to_string(),
        }
    }
}

/// Immutable lookup table, built once at startup
#[derive(Debug, Clone)]
pub struct ModelProfiles {
    profiles: HashMap<String, ModelMemoryProfile>,
}

impl Default for ModelProfiles {
    fn default() -> Self {
        Self::builtin()
    }
}

impl ModelProfiles {
    /// Table of commonly served local models
    pub fn builtin() -> Self {
        let entries = [
            ModelMemoryProfile::new("llama3.2:1b", 1024, 2048, 8192, "1B"),
            ModelMemoryProfile::new("llama3.2:3b", 2048, 3072, 8192, "3B"),
            ModelMemoryProfile::new("llama3.1:8b", 5120, 6144, 8192, "8B"),
            ModelMemoryProfile::new("llama3.1:70b", 40960, 43008, 8192, "70B"),
            ModelMemoryProfile::new("qwen2.5:7b", 4608, 5632, 32768, "7B"),
            ModelMemoryProfile::new("qwen2.5-coder:7b", 4608, 5632, 32768, "7B"),
            ModelMemoryProfile::new("mistral:7b", 4608, 5632, 8192, "7B"),
            ModelMemoryProfile::new("phi3:mini", 2304, 3072, 4096, "3.8B"),
            ModelMemoryProfile::new("gemma2:9b", 5632, 7168, 8192, "9B"),
            ModelMemoryProfile::new("codellama:13b", 8192, 10240, 16384, "13B"),
        ];
        Self::from_profiles(entries)
    }

    pub fn from_profiles(profiles: impl IntoIterator<Item = ModelMemoryProfile>) -> Self {
        let profiles = profiles
            .into_iter()
            .map(|p| (p.model.to_lowercase(), p))
            .collect();
        Self { profiles }
    }

    /// Add or replace entries, consuming the table
    pub fn with_overrides(
        mut self,
        overrides: impl IntoIterator<Item = ModelMemoryProfile>,
    ) -> Self {
        for profile in overrides {
            self.profiles.insert(profile.model.to_lowercase(), profile);
        }
        self
    }

    pub fn get(&self, model: &str) -> Option<&ModelMemoryProfile> {
        self.profiles.get(&model.to_lowercase())
    }

    /// Recommended memory for one agent running `model`
    pub fn recommended_memory_mb(&self, model: &str) -> u64 {
        self.get(model)
            .map(|p| p.recommended_memory_mb)
            .unwrap_or(DEFAULT_RECOMMENDED_MEMORY_MB)
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

/// Converts free memory into an agent count
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemoryBudget {
    /// Fraction of free memory held back
    pub safety_margin: f64,
    /// Fixed amount held back after the margin
    pub buffer_mb: u64,
}

impl Default for MemoryBudget {
    fn default() -> Self {
        Self {
            safety_margin: 0.15,
            buffer_mb: 1024,
        }
    }
}

impl MemoryBudget {
    /// Memory left for new agents after margin and buffer
    pub fn usable_memory_mb(&self, free_memory_mb: u64) -> u64 {
        let after_margin = free_memory_mb as f64 * (1.0 - self.safety_margin);
        (after_margin - self.buffer_mb as f64).max(0.0) as u64
    }

    /// How many more agents fit into the free memory
    pub fn agent_capacity(&self, free_memory_mb: u64, per_agent_mb: u64) -> usize {
        if per_agent_mb == 0 {
            return 0;
        }
        (self.usable_memory_mb(free_memory_mb) / per_agent_mb) as usize
    }
}
