use std::{fmt, str::FromStr};

use itertools::Itertools;
use tch::{utils::has_mps, Device};
use thiserror::Error;

/// Picks MPS on macOS, then the first CUDA device, then the CPU.
pub fn get_optimal_device() -> Device {
    if cfg!(target_os = "macos") && has_mps() {
        return Device::Mps;
    }
    Device::cuda_if_available()
}

/// Where a run trains. Training is single-device, so `cuda` means the first GPU.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TrainDevice {
    #[default]
    Auto,
    Cpu,
    Mps,
    Cuda(usize),
}

impl TrainDevice {
    pub fn device(self) -> Device {
        match self {
            TrainDevice::Auto => get_optimal_device(),
            TrainDevice::Cpu => Device::Cpu,
            TrainDevice::Mps => Device::Mps,
            TrainDevice::Cuda(index) => Device::Cuda(index),
        }
    }

    pub fn is_available(self) -> bool {
        match self {
            TrainDevice::Auto | TrainDevice::Cpu => true,
            TrainDevice::Mps => has_mps(),
            TrainDevice::Cuda(index) => {
                tch::Cuda::is_available() && index < tch::Cuda::device_count() as usize
            }
        }
    }
}

impl fmt::Display for TrainDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrainDevice::Auto => write!(f, "auto"),
            TrainDevice::Cpu => write!(f, "cpu"),
            TrainDevice::Mps => write!(f, "mps"),
            TrainDevice::Cuda(index) => write!(f, "cuda:{index}"),
        }
    }
}

fn available_devices() -> String {
    let cuda = (0..tch::Cuda::device_count()).map(|i| format!("cuda:{i}"));
    ["auto", "cpu"]
        .into_iter()
        .map(str::to_owned)
        .chain(has_mps().then(|| "mps".to_owned()))
        .chain(cuda)
        .join(", ")
}

#[derive(Error, Debug)]
pub enum DeviceParseError {
    #[error("device {0} is not available on this system. Available devices are: {1}")]
    NotAvailable(String, String),

    #[error("invalid CUDA index in '{0}'")]
    InvalidIndex(String),

    #[error("invalid device '{0}'. Available devices are: {1}")]
    Unknown(String, String),
}

impl FromStr for TrainDevice {
    type Err = DeviceParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_lowercase();
        let parsed = match s.as_str() {
            "auto" => TrainDevice::Auto,
            "cpu" => TrainDevice::Cpu,
            "mps" => TrainDevice::Mps,
            "cuda" => TrainDevice::Cuda(0),
            other => {
                let Some(index) = other.strip_prefix("cuda:") else {
                    return Err(DeviceParseError::Unknown(s, available_devices()));
                };
                let index = index
                    .parse::<usize>()
                    .map_err(|_| DeviceParseError::InvalidIndex(s.clone()))?;
                TrainDevice::Cuda(index)
            }
        };
        if !parsed.is_available() {
            return Err(DeviceParseError::NotAvailable(s, available_devices()));
        }
        Ok(parsed)
    }
}

/// Blocks until queued kernels on the device have finished. A no-op off CUDA.
pub trait CudaSynchronize {
    fn cuda_synchronize(&self);
}

impl CudaSynchronize for Device {
    fn cuda_synchronize(&self) {
        if let Device::Cuda(idx) = self {
            tch::Cuda::synchronize(*idx as i64);
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tch::{Kind, Tensor};

    use super::*;

    #[test]
    fn parses_device_names() {
        assert_eq!("auto".parse::<TrainDevice>().unwrap(), TrainDevice::Auto);
        assert_eq!("CPU".parse::<TrainDevice>().unwrap(), TrainDevice::Cpu);
        assert_eq!(" cpu ".parse::<TrainDevice>().unwrap(), TrainDevice::Cpu);
        assert!(matches!(
            "banana".parse::<TrainDevice>(),
            Err(DeviceParseError::Unknown(..))
        ));
        assert!(matches!(
            "cuda:abc".parse::<TrainDevice>(),
            Err(DeviceParseError::InvalidIndex(_))
        ));
        assert!(matches!(
            "cuda:-1".parse::<TrainDevice>(),
            Err(DeviceParseError::InvalidIndex(_))
        ));

        let gpus = tch::Cuda::device_count() as usize;
        if tch::Cuda::is_available() && gpus > 0 {
            assert_eq!("cuda".parse::<TrainDevice>().unwrap(), TrainDevice::Cuda(0));
            assert_eq!(
                format!("cuda:{}", gpus - 1).parse::<TrainDevice>().unwrap(),
                TrainDevice::Cuda(gpus - 1)
            );
        }
        assert!(matches!(
            format!("cuda:{gpus}").parse::<TrainDevice>(),
            Err(DeviceParseError::NotAvailable(..))
        ));

        if !has_mps() {
            assert!(matches!(
                "mps".parse::<TrainDevice>(),
                Err(DeviceParseError::NotAvailable(..))
            ));
        }
    }

    #[test]
    fn display_round_trips_through_parse() {
        for device in [TrainDevice::Auto, TrainDevice::Cpu] {
            assert_eq!(device.to_string().parse::<TrainDevice>().unwrap(), device);
        }
        assert_eq!(TrainDevice::Cuda(3).to_string(), "cuda:3");
    }

    #[test]
    fn auto_resolves_to_a_usable_device() {
        let device = TrainDevice::Auto.device();
        let tensor = Tensor::ones([2, 3], (Kind::Float, device));
        device.cuda_synchronize();
        assert_eq!(tensor.sum(Kind::Float).double_value(&[]), 6.0);
        assert_eq!(TrainDevice::Cpu.device(), Device::Cpu);
    }
}
