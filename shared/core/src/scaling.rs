//! Empirical scaling fits that size a run from its parameter count.
//!
//! The constants were fit on models between roughly 45M and 1.5B parameters. Outside that range
//! they still produce finite values, but nothing guarantees they produce good ones.

/// Parameter count of the reference (scale 1.0) model.
pub const REFERENCE_PARAM_COUNT: f64 = 46_009_736.0;

/// Tokens resident per batch on the reference accelerator at capacity scalar 1.0.
pub const BASE_GPU_TOKEN_CAPACITY: f64 = 114_688.0;

pub fn to_nearest_64(x: f64) -> usize {
    ((x / 64.0).round() * 64.0).max(0.0) as usize
}

pub fn width_from_scale(scale: f64) -> usize {
    to_nearest_64(384.0 * (1.0 + scale).log2())
}

pub fn depth_from_scale(scale: f64) -> usize {
    (8.0 * (1.0 + scale).log2()).round().max(0.0) as usize
}

pub fn gpu_token_capacity(capacity_scalar: f64) -> f64 {
    BASE_GPU_TOKEN_CAPACITY * capacity_scalar
}

/// Shrinks the raw device capacity for models larger than the reference one.
pub fn tokens_per_batch_capacity(gpu_token_capacity: f64, num_params: usize) -> usize {
    let model_scale = num_params as f64 / REFERENCE_PARAM_COUNT;
    (gpu_token_capacity / (1.52174 + 0.482 * model_scale.powf(0.87))).floor() as usize
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScalingLaws {
    num_params: f64,
    ln_params: f64,
}

impl ScalingLaws {
    pub fn new(num_params: usize) -> Self {
        let num_params = num_params as f64;
        Self {
            num_params,
            ln_params: num_params.ln(),
        }
    }

    pub fn num_params(&self) -> f64 {
        self.num_params
    }

    /// Learning rate every group multiplier is applied to.
    pub fn base_lr(&self) -> f64 {
        9e7 / self.ln_params.powf(8.8)
    }

    /// Base raised to the training loss to get the weight-decay divisor.
    pub fn weight_decay_pow_base(&self) -> f64 {
        0.007 * (0.01 * self.ln_params).powf(-4.0)
    }

    /// Decay coefficient for the catch-all group, growing as loss approaches zero.
    pub fn dynamic_weight_decay(&self, weight_decay_mult: f64, loss: f64) -> f64 {
        weight_decay_mult / self.weight_decay_pow_base().powf(loss + 1e-8)
    }

    pub fn expected_grad_norm_pow(&self) -> f64 {
        -0.677 * self.ln_params.powf(-0.2)
    }

    pub fn grad_norm_steps_scale(&self) -> f64 {
        self.ln_params * self.num_params
    }

    /// Expected per-parameter gradient norm at `step`.
    pub fn grad_norm_target(&self, step: u32) -> f64 {
        (self.grad_norm_steps_scale() * (step as f64 + 1e-2)).powf(self.expected_grad_norm_pow())
    }

    /// Normalizes a whole-model gradient norm to a roughly size-invariant per-parameter norm.
    pub fn per_param_grad_norm(&self, grad_norm: f64) -> f64 {
        grad_norm / self.num_params.sqrt()
    }
}
