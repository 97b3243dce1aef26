use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{ModelOpsError, Result};

pub const DEFAULT_GPU_MEMORY_GB: f64 = 32.0;
pub const DEFAULT_CONTEXT_SIZE: u32 = 16384;

/// Free and total memory of the target accelerator, in GB.
#[derive(Clone, Copy, Debug, PartialEq, Deserialize, Serialize)]
pub struct GpuMemory {
    pub available_gb: f64,
    pub total_gb: f64,
}

impl Default for GpuMemory {
    fn default() -> Self {
        Self {
            available_gb: DEFAULT_GPU_MEMORY_GB,
            total_gb: DEFAULT_GPU_MEMORY_GB,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MemoryEstimate {
    pub model: f64,
    pub context: f64,
    pub total: f64,
    pub available: f64,
    pub percentage: f64,
    pub fits: bool,
}

fn number_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[\d.]+").expect("valid regex"))
}

/// Weight size in GB for "14.5 GB", "800 MB" or "7B" (billions of fp16 parameters).
pub fn parse_model_size(s: &str) -> Result<f64> {
    let upper = s.to_ascii_uppercase();
    let number = number_re()
        .find(&upper)
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .ok_or_else(|| ModelOpsError::InvalidSettings(format!("unrecognised model size: {s:?}")))?;

    if upper.contains("GB") {
        Ok(number)
    } else if upper.contains("MB") {
        Ok(number / 1024.0)
    } else if upper.contains('B') {
        Ok(number * 2.0)
    } else {
        Err(ModelOpsError::InvalidSettings(format!("unrecognised model size unit: {s:?}")))
    }
}

pub fn quantization_multiplier(quantization: &str) -> f64 {
    match quantization.to_ascii_uppercase().as_str() {
        "F16" | "FP16" => 1.0,
        "Q8_0" => 0.5,
        "Q5_K_M" => 0.375,
        "Q4_K_M" | "AWQ" | "GPTQ" => 0.25,
        "Q3_K_M" => 0.1875,
        _ => 0.25,
    }
}

fn round_to(v: f64, places: i32) -> f64 {
    let f = 10f64.powi(places);
    (v * f).round() / f
}

/// Rough footprint: quantized weights plus a KV cache of `ctx * 8` bytes,
/// with 20% headroom.
pub fn estimate_memory(model_size: &str, quantization: &str, context_size: u32, gpu: GpuMemory) -> Result<MemoryEstimate> {
    let model = parse_model_size(model_size)? * quantization_multiplier(quantization);
    let context = (context_size as f64 * 4.0 * 2.0) / 1024f64.powi(3);
    let total = (model + context) * 1.2;
    let percentage = if gpu.total_gb > 0.0 { total / gpu.total_gb * 100.0 } else { 0.0 };

    Ok(MemoryEstimate {
        model: round_to(model, 2),
        context: round_to(context, 2),
        total: round_to(total, 2),
        available: round_to(gpu.available_gb, 2),
        percentage: round_to(percentage, 1),
        fits: total <= gpu.available_gb,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_model_size() {
        assert_eq!(parse_model_size("14 GB").unwrap(), 14.0);
        assert_eq!(parse_model_size("512 MB").unwrap(), 0.5);
        assert_eq!(parse_model_size("7B").unwrap(), 14.0);
        assert!(parse_model_size("huge").is_err());
    }

    #[test]
    fn test_estimate_32b_awq() {
        let est = estimate_memory("32B", "AWQ", 16384, GpuMemory::default()).unwrap();
        assert_eq!(est.model, 16.0);
        assert_eq!(est.context, 0.0);
        assert_eq!(est.total, 19.2);
        assert_eq!(est.percentage, 60.0);
        assert!(est.fits);
    }

    #[test]
    fn test_estimate_does_not_fit() {
        let gpu = GpuMemory { available_gb: 8.0, total_gb: 24.0 };
        let est = estimate_memory("70B", "fp16", 4096, gpu).unwrap();
        assert_eq!(est.model, 140.0);
        assert!(!est.fits);
        assert_eq!(est.available, 8.0);
    }

    #[test]
    fn test_unknown_quantization_uses_4bit() {
        assert_eq!(quantization_multiplier("IQ2_XS"), 0.25);
    }
}
