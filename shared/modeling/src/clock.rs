use std::time::{Duration, Instant};

use tch::Device;

use crate::CudaSynchronize;

/// Wall clock that only runs while training, so evaluation time is excluded from throughput.
///
/// The device is synchronized before every reading so queued kernels are counted.
#[derive(Debug)]
pub struct TrainingClock {
    device: Device,
    accumulated: Duration,
    running_since: Option<Instant>,
}

impl TrainingClock {
    /// A stopped clock at zero.
    pub fn new(device: Device) -> Self {
        Self {
            device,
            accumulated: Duration::ZERO,
            running_since: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running_since.is_some()
    }

    pub fn resume(&mut self) {
        if self.running_since.is_none() {
            self.device.cuda_synchronize();
            self.running_since = Some(Instant::now());
        }
    }

    pub fn pause(&mut self) {
        if let Some(since) = self.running_since.take() {
            self.device.cuda_synchronize();
            self.accumulated += since.elapsed();
        }
    }

    pub fn elapsed(&self) -> Duration {
        match self.running_since {
            Some(since) => {
                self.device.cuda_synchronize();
                self.accumulated + since.elapsed()
            }
            None => self.accumulated,
        }
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.elapsed().as_secs_f64()
    }
}
