//! Accelerator detection and placement-target to device mapping.

use std::fmt;
use std::path::Path;

use candle_core::{DType, Device};

use crate::config::DeviceId;

/// Highest accelerator index probed during detection
const MAX_PROBED_DEVICES: usize = 16;

const NVIDIA_DRIVER_VERSION_FILE: &str = "/proc/driver/nvidia/version";

/// Accelerator backend compiled into this build
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Cuda,
    Metal,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Cuda => write!(f, "CUDA"),
            Backend::Metal => write!(f, "Metal"),
        }
    }
}

/// What the host offers in terms of accelerators. Informational.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AcceleratorInfo {
    pub backend: Option<Backend>,
    /// Number of usable accelerator devices
    pub count: usize,
    /// Index of the device used by default
    pub current_index: Option<usize>,
    pub driver_version: Option<String>,
}

impl AcceleratorInfo {
    pub fn available(&self) -> bool {
        self.count > 0
    }
}

impl fmt::Display for AcceleratorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.backend, self.current_index) {
            (Some(backend), Some(index)) if self.available() => {
                write!(f, "{} available: true, device: {}", backend, index)?;
                if let Some(version) = &self.driver_version {
                    write!(f, ", driver: {}", version)?;
                }
                Ok(())
            }
            _ => write!(f, "Accelerator available: false"),
        }
    }
}

/// Detect accelerators. CUDA > Metal, CPU-only builds report none.
pub fn detect_accelerators() -> AcceleratorInfo {
    let backend = if candle_core::utils::cuda_is_available() {
        Backend::Cuda
    } else if candle_core::utils::metal_is_available() {
        Backend::Metal
    } else {
        tracing::debug!("No accelerator backend compiled in");
        return AcceleratorInfo::default();
    };

    let count = (0..MAX_PROBED_DEVICES)
        .take_while(|idx| match open_accelerator(backend, *idx) {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!("{} device {} unavailable: {}", backend, idx, e);
                false
            }
        })
        .count();

    let driver_version = match backend {
        Backend::Cuda => read_nvidia_driver_version(Path::new(NVIDIA_DRIVER_VERSION_FILE)),
        Backend::Metal => None,
    };

    let info = AcceleratorInfo {
        backend: Some(backend),
        count,
        current_index: (count > 0).then_some(0),
        driver_version,
    };
    tracing::info!("Accelerators detected: {:?}", info);
    info
}

fn open_accelerator(backend: Backend, index: usize) -> crate::Result<Device> {
    let device = match backend {
        Backend::Cuda => Device::new_cuda(index)?,
        Backend::Metal => Device::new_metal(index)?,
    };
    Ok(device)
}

/// Compute device for a placement target. Disk has none.
pub fn device_for(target: DeviceId) -> crate::Result<Option<Device>> {
    match target {
        DeviceId::Cpu => Ok(Some(Device::Cpu)),
        DeviceId::Disk => Ok(None),
        DeviceId::Accelerator(index) => {
            let backend = if candle_core::utils::metal_is_available() {
                Backend::Metal
            } else {
                Backend::Cuda
            };
            open_accelerator(backend, index).map(Some).map_err(|e| {
                crate::FetchError::PlacementError(format!(
                    "Cannot open accelerator {}: {}",
                    index, e
                ))
            })
        }
    }
}

/// Parse dtype string to candle DType
pub fn parse_dtype(dtype_str: &str) -> crate::Result<DType> {
    match dtype_str.to_lowercase().as_str() {
        "f32" | "float32" | "float" => Ok(DType::F32),
        "f16" | "float16" | "half" => Ok(DType::F16),
        "bf16" | "bfloat16" => Ok(DType::BF16),
        other => Err(crate::FetchError::ConfigError(format!(
            "Unsupported dtype '{}', expected f32, f16 or bf16",
            other
        ))),
    }
}

/// Read the kernel module version from the NVIDIA proc file.
fn read_nvidia_driver_version(path: &Path) -> Option<String> {
    let content = std::fs::read_to_string(path).ok()?;
    parse_nvidia_driver_version(&content)
}

fn parse_nvidia_driver_version(content: &str) -> Option<String> {
    let line = content.lines().find(|l| l.starts_with("NVRM version"))?;
    let mut tokens = line.split_whitespace();
    tokens.find(|t| *t == "Module")?;
    tokens
        .find(|t| t.chars().next().is_some_and(|c| c.is_ascii_digit()))
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_dtype() {
        assert_eq!(parse_dtype("bfloat16").unwrap(), DType::BF16);
        assert_eq!(parse_dtype("F16").unwrap(), DType::F16);
        assert_eq!(parse_dtype("float").unwrap(), DType::F32);
        assert!(parse_dtype("int4").is_err());
    }

    #[test]
    fn test_parse_nvidia_driver_version() {
        let content = "NVRM version: NVIDIA UNIX x86_64 Kernel Module  535.104.05  Sat Aug 19 01:15:15 UTC 2023\n\
                       GCC version:  gcc version 12.2.0 (Debian 12.2.0-14)\n";
        assert_eq!(
            parse_nvidia_driver_version(content),
            Some("535.104.05".to_string())
        );

        let open = "NVRM version: NVIDIA UNIX Open Kernel Module for x86_64  550.54.14  Release Build\n";
        assert_eq!(
            parse_nvidia_driver_version(open),
            Some("550.54.14".to_string())
        );

        assert_eq!(parse_nvidia_driver_version("garbage"), None);
    }

    #[test]
    fn test_cpu_and_disk_targets() {
        assert!(matches!(device_for(DeviceId::Cpu), Ok(Some(Device::Cpu))));
        assert!(matches!(device_for(DeviceId::Disk), Ok(None)));
    }

    #[test]
    fn test_info_display() {
        assert_eq!(
            AcceleratorInfo::default().to_string(),
            "Accelerator available: false"
        );

        let info = AcceleratorInfo {
            backend: Some(Backend::Cuda),
            count: 1,
            current_index: Some(0),
            driver_version: Some("535.104.05".to_string()),
        };
        assert!(info.available());
        assert_eq!(
            info.to_string(),
            "CUDA available: true, device: 0, driver: 535.104.05"
        );
    }

    #[test]
    fn test_detection_is_consistent() {
        let info = detect_accelerators();
        assert_eq!(info.available(), info.current_index.is_some());
    }
}
