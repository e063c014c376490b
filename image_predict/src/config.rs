use std::fmt::Display;

use burn::config::Config;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::PredictError;

/// Compute device asked for on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceRequest {
    #[default]
    Cpu,
    Gpu,
}

impl DeviceRequest {
    /// Only the literal `gpu` asks for an accelerator.
    pub fn from_flag(flag: &str) -> Self {
        if flag == "gpu" {
            DeviceRequest::Gpu
        } else {
            DeviceRequest::Cpu
        }
    }

    /// Settles the device once per run, warning when an accelerator was asked for but is missing.
    pub fn resolve(self, accelerator: Option<usize>) -> ComputeDevice {
        match (self, accelerator) {
            (DeviceRequest::Gpu, Some(index)) => ComputeDevice::Cuda(index),
            (DeviceRequest::Gpu, None) => {
                warn!("GPU inference requested but no accelerator is available, falling back to CPU");
                ComputeDevice::Cpu
            }
            (DeviceRequest::Cpu, _) => ComputeDevice::Cpu,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComputeDevice {
    Cpu,
    Cuda(usize),
}

impl Display for ComputeDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ComputeDevice::Cpu => write!(f, "cpu"),
            ComputeDevice::Cuda(index) => write!(f, "cuda:{index}"),
        }
    }
}

#[derive(Config, Debug)]
pub struct PredictConfig {
    pub image_path: String,
    pub checkpoint_path: String,
    #[config(default = 5)]
    pub top_k: usize,
    #[config(default = "None")]
    pub category_names_file: Option<String>,
    #[config(default = "DeviceRequest::Cpu")]
    pub device: DeviceRequest,
}

impl PredictConfig {
    /// Checks caller input that can be rejected without touching the filesystem.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.top_k == 0 {
            return Err(PredictError::invalid_argument("top_k must be at least 1"));
        }
        if self.image_path.is_empty() {
            return Err(PredictError::invalid_argument("image path is empty"));
        }
        if self.checkpoint_path.is_empty() {
            return Err(PredictError::invalid_argument("checkpoint path is empty"));
        }
        Ok(())
    }
}

/// Converts a signed command line value, rejecting zero and negatives.
pub fn top_k_from_arg(value: i64) -> crate::error::Result<usize> {
    usize::try_from(value)
        .ok()
        .filter(|top_k| *top_k > 0)
        .ok_or_else(|| PredictError::invalid_argument(format!("top_k must be a positive integer, got {value}")))
}
