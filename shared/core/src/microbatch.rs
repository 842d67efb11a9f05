use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::debug;

use crate::{dither::discretize_depth, MicrobatchConfig, ScalingLaws};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MicrobatchUpdate {
    pub grad_norm_per_param: f64,
    pub grad_norm_target: f64,
    pub ratio: f64,
    pub estimate: f64,
}

/// Proportional controller for the gradient-accumulation depth.
///
/// Holds a fractional depth estimate that widens when measured gradient norms run above the
/// power-law target and narrows when they fall below it. The depth actually used by each
/// accumulation group is a stochastic rounding of that estimate.
#[derive(Debug)]
pub struct MicrobatchController {
    config: MicrobatchConfig,
    laws: ScalingLaws,
    estimate: f64,
    depth: usize,
    rng: ChaCha8Rng,
}

impl MicrobatchController {
    pub fn new(config: MicrobatchConfig, laws: ScalingLaws, seed: u64) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let estimate = config.initial_estimate;
        let depth = discretize_depth(estimate, &mut rng);
        Self {
            config,
            laws,
            estimate,
            depth,
            rng,
        }
    }

    pub fn estimate(&self) -> f64 {
        self.estimate
    }

    /// Accumulation depth of the current group.
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn is_resample_step(&self, step: u32) -> bool {
        step % self.config.sample_every == 0
    }

    /// Feeds one whole-model gradient norm measured at `step` into the estimate.
    pub fn observe_grad_norm(&mut self, step: u32, grad_norm: f64) -> MicrobatchUpdate {
        let grad_norm_per_param = self.laws.per_param_grad_norm(grad_norm);
        let grad_norm_target = self.laws.grad_norm_target(step);
        let ratio = grad_norm_per_param / grad_norm_target;

        let gain = self.config.sample_every as f64 * self.config.scale_lr;
        self.estimate *= 1.0 + gain * (ratio - 1.0);
        self.estimate = self.estimate.max(self.config.min_estimate);

        debug!(
            step,
            grad_norm,
            grad_norm_per_param,
            grad_norm_target,
            estimate = self.estimate,
            "Updated accumulation estimate"
        );

        MicrobatchUpdate {
            grad_norm_per_param,
            grad_norm_target,
            ratio,
            estimate: self.estimate,
        }
    }

    /// Draws the accumulation depth for the next group.
    pub fn sample_depth(&mut self) -> usize {
        self.depth = discretize_depth(self.estimate, &mut self.rng);
        self.depth
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> MicrobatchController {
        MicrobatchController::new(
            MicrobatchConfig::default(),
            ScalingLaws::new(46_009_736),
            100,
        )
    }

    #[test]
    fn starts_at_depth_one() {
        let controller = controller();
        assert_eq!(controller.estimate(), 0.0);
        assert_eq!(controller.depth(), 1);
    }

    #[test]
    fn clamps_to_floor_from_zero() {
        let mut controller = controller();
        let laws = ScalingLaws::new(46_009_736);
        let on_target = laws.grad_norm_target(0) * laws.num_params().sqrt();
        let update = controller.observe_grad_norm(0, on_target);
        assert!((update.ratio - 1.0).abs() < 1e-9);
        assert_eq!(update.estimate, 0.1);
    }

    #[test]
    fn large_gradients_widen_accumulation() {
        let mut controller = controller();
        let laws = ScalingLaws::new(46_009_736);
        let mut last = controller.estimate();
        for step in (0..50).step_by(5) {
            let norm = 4.0 * laws.grad_norm_target(step) * laws.num_params().sqrt();
            let update = controller.observe_grad_norm(step, norm);
            assert!(update.estimate > last || last == 0.0);
            last = update.estimate;
        }
        assert!(controller.sample_depth() > 1);
    }

    #[test]
    fn small_gradients_shrink_to_floor() {
        let mut controller = controller();
        let laws = ScalingLaws::new(46_009_736);
        let big = 4.0 * laws.grad_norm_target(0) * laws.num_params().sqrt();
        for _ in 0..5 {
            controller.observe_grad_norm(0, big);
        }
        assert!(controller.estimate() > 1.0);
        for _ in 0..100 {
            controller.observe_grad_norm(0, 0.0);
        }
        assert_eq!(controller.estimate(), 0.1);
        for _ in 0..100 {
            assert_eq!(controller.sample_depth(), 1);
        }
    }

    #[test]
    fn resamples_on_cadence() {
        let controller = controller();
        assert!(controller.is_resample_step(0));
        assert!(!controller.is_resample_step(3));
        assert!(controller.is_resample_step(10));
    }
}
