//! AdamW over the four parameter buckets, each with its own learning rate, betas,
//! decoupled weight decay and multiplicative schedule.
//!
//! # Algorithm
//!
//! For every parameter with a gradient, in bucket order:
//! ```text
//! θ = θ * (1 - lr * wd)
//! m_t = β1 * m_{t-1} + (1 - β1) * g_t
//! v_t = β2 * v_{t-1} + (1 - β2) * g_t^2
//! θ = θ - lr * (m_t / (1 - β1^t)) / (sqrt(v_t / (1 - β2^t)) + eps)
//! ```
//! Moments are kept in f32 regardless of the parameter kind.

use speedy_core::{GroupHyperparameters, OptimizerConfig, ParamBucket};
use tch::{Kind, Tensor};
use tracing::trace;

use crate::TaggedParameter;

#[derive(Debug)]
struct ParamState {
    name: String,
    tensor: Tensor,
    exp_avg: Tensor,
    exp_avg_sq: Tensor,
}

impl ParamState {
    fn new(parameter: TaggedParameter) -> Self {
        let exp_avg = Tensor::zeros(parameter.tensor.size(), (Kind::Float, parameter.tensor.device()));
        let exp_avg_sq = exp_avg.zeros_like();
        Self {
            name: parameter.name,
            tensor: parameter.tensor,
            exp_avg,
            exp_avg_sq,
        }
    }
}

#[derive(Debug)]
struct ParamGroup {
    hyper: GroupHyperparameters,
    lr: f64,
    weight_decay: f64,
    schedule_step: u32,
    params: Vec<ParamState>,
}

impl ParamGroup {
    fn scheduled_lr(&self) -> f64 {
        self.hyper.lr * self.hyper.schedule.multiplier(self.schedule_step)
    }
}

#[derive(Debug)]
pub struct GroupedAdamW {
    groups: Vec<ParamGroup>,
    step: u64,
}

impl GroupedAdamW {
    pub fn new(parameters: Vec<TaggedParameter>, config: &OptimizerConfig, base_lr: f64) -> Self {
        let mut groups: Vec<ParamGroup> = ParamBucket::ALL
            .iter()
            .map(|&bucket| {
                let hyper = config.group_hyperparameters(bucket, base_lr);
                let mut group = ParamGroup {
                    hyper,
                    lr: 0.0,
                    weight_decay: hyper.weight_decay,
                    schedule_step: 0,
                    params: Vec::new(),
                };
                group.lr = group.scheduled_lr();
                group
            })
            .collect();

        for parameter in parameters {
            groups[parameter.bucket.index()]
                .params
                .push(ParamState::new(parameter));
        }

        Self { groups, step: 0 }
    }

    fn group(&self, bucket: ParamBucket) -> &ParamGroup {
        &self.groups[bucket.index()]
    }

    /// Current learning rate of a bucket, schedule included.
    pub fn lr(&self, bucket: ParamBucket) -> f64 {
        self.group(bucket).lr
    }

    pub fn weight_decay(&self, bucket: ParamBucket) -> f64 {
        self.group(bucket).weight_decay
    }

    pub fn set_weight_decay(&mut self, bucket: ParamBucket, weight_decay: f64) {
        self.groups[bucket.index()].weight_decay = weight_decay;
    }

    pub fn num_tensors(&self, bucket: ParamBucket) -> usize {
        self.group(bucket).params.len()
    }

    pub fn step_count(&self) -> u64 {
        self.step
    }

    /// Applies one update from the accumulated gradients. Parameters without a gradient are skipped.
    pub fn step(&mut self) {
        self.step += 1;
        let step = self.step as i32;
        let _guard = tch::no_grad_guard();

        for group in &mut self.groups {
            let lr = group.lr;
            let weight_decay = group.weight_decay;
            let (beta1, beta2) = group.hyper.betas;
            let eps = group.hyper.eps;
            let bias_correction1 = 1.0 - beta1.powi(step);
            let bias_correction2 = 1.0 - beta2.powi(step);

            for state in &mut group.params {
                let grad = state.tensor.grad();
                if !grad.defined() {
                    continue;
                }
                let grad = grad.to_kind(Kind::Float);

                if weight_decay > 0.0 {
                    let _ = state.tensor.g_mul_scalar_(1.0 - lr * weight_decay);
                }

                let _ = state.exp_avg.g_mul_scalar_(beta1);
                let _ = state.exp_avg.g_add_(&(&grad * (1.0 - beta1)));

                let _ = state.exp_avg_sq.g_mul_scalar_(beta2);
                let _ = state.exp_avg_sq.g_add_(&(grad.square() * (1.0 - beta2)));

                let denom = (&state.exp_avg_sq / bias_correction2).sqrt() + eps;
                let update = (&state.exp_avg / bias_correction1) / denom;
                let update = (update * (-lr)).to_kind(state.tensor.kind());
                let _ = state.tensor.g_add_(&update);
            }
            trace!(
                bucket = %group.hyper.bucket,
                lr,
                weight_decay,
                tensors = group.params.len(),
                "stepped group"
            );
        }
    }

    /// Advances every bucket's schedule by one step.
    pub fn scheduler_step(&mut self) {
        for group in &mut self.groups {
            group.schedule_step += 1;
            group.lr = group.scheduled_lr();
        }
    }

    pub fn zero_grad(&self) {
        for state in self.groups.iter().flat_map(|g| &g.params) {
            let mut grad = state.tensor.grad();
            if grad.defined() {
                let _ = grad.zero_();
            }
        }
    }

    /// Names of the parameters stepped in `bucket`.
    pub fn parameter_names(&self, bucket: ParamBucket) -> impl Iterator<Item = &str> {
        self.group(bucket).params.iter().map(|p| p.name.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{tagged, tagged_parameters};
    use pretty_assertions::assert_eq;
    use tch::{nn, Device};

    fn config() -> OptimizerConfig {
        OptimizerConfig {
            warmup_steps: 2,
            ..Default::default()
        }
    }

    #[test]
    fn groups_start_on_their_schedules() {
        let vs = nn::VarStore::new(Device::Cpu);
        let root = vs.root();
        let _w = (&root / "dense").var("weight", &[2, 2], nn::Init::Const(1.0));
        let _p = tagged(&root / "bias", ParamBucket::PositionBias).var(
            "mult",
            &[],
            nn::Init::Const(1.0),
        );
        let config = config();
        let mut optimizer = GroupedAdamW::new(tagged_parameters(&vs).unwrap(), &config, 1e-3);

        let decay = config.group_hyperparameters(ParamBucket::Decay, 1e-3);
        let position = config.group_hyperparameters(ParamBucket::PositionBias, 1e-3);
        let output = config.group_hyperparameters(ParamBucket::Output, 1e-3);
        assert!((optimizer.lr(ParamBucket::Decay) - decay.lr * config.warmup_floor).abs() < 1e-12);
        assert!((optimizer.lr(ParamBucket::PositionBias) - position.lr).abs() < 1e-12);
        assert!((optimizer.lr(ParamBucket::Output) - output.lr).abs() < 1e-12);

        optimizer.scheduler_step();
        assert!(
            (optimizer.lr(ParamBucket::PositionBias) - position.lr * config.position_bias_decay)
                .abs()
                < 1e-12
        );
        optimizer.scheduler_step();
        assert!((optimizer.lr(ParamBucket::Decay) - decay.lr).abs() < 1e-12);

        assert_eq!(optimizer.num_tensors(ParamBucket::Decay), 1);
        assert_eq!(
            optimizer
                .parameter_names(ParamBucket::PositionBias)
                .collect::<Vec<_>>(),
            vec!["bias.mult"]
        );
        assert_eq!(optimizer.num_tensors(ParamBucket::NormBiasEmbedding), 0);
    }

    #[test]
    fn weight_decay_is_decoupled_and_scaled_by_lr() {
        let vs = nn::VarStore::new(Device::Cpu);
        let root = vs.root();
        let w = (&root / "dense").var("weight", &[3], nn::Init::Const(2.0));
        let mut optimizer = GroupedAdamW::new(tagged_parameters(&vs).unwrap(), &config(), 1e-3);
        optimizer.set_weight_decay(ParamBucket::Decay, 10.0);
        assert_eq!(optimizer.weight_decay(ParamBucket::Decay), 10.0);

        // Zero gradient: only the decay term moves the weight.
        (&w * 0.0).sum(Kind::Float).backward();
        let lr = optimizer.lr(ParamBucket::Decay);
        optimizer.step();

        let expected = 2.0 * (1.0 - lr * 10.0);
        let diff = (&w - expected).abs().max().double_value(&[]);
        assert!(diff < 1e-6, "diff {diff}");
        assert_eq!(optimizer.step_count(), 1);
    }

    #[test]
    fn parameters_without_gradients_are_untouched() {
        let vs = nn::VarStore::new(Device::Cpu);
        let root = vs.root();
        let w = (&root / "dense").var("weight", &[3], nn::Init::Const(2.0));
        let mut optimizer = GroupedAdamW::new(tagged_parameters(&vs).unwrap(), &config(), 1e-3);
        optimizer.set_weight_decay(ParamBucket::Decay, 10.0);
        optimizer.step();
        assert_eq!((&w - 2.0).abs().max().double_value(&[]), 0.0);
    }

    #[test]
    fn fits_a_linear_regression() {
        tch::manual_seed(1);
        let vs = nn::VarStore::new(Device::Cpu);
        let root = vs.root();
        let linear = nn::linear(&root / "dense", 4, 1, Default::default());
        let mut optimizer = GroupedAdamW::new(tagged_parameters(&vs).unwrap(), &config(), 2e-2);
        optimizer.set_weight_decay(ParamBucket::Decay, 0.0);

        let xs = Tensor::randn([64, 4], (Kind::Float, Device::Cpu));
        let true_w = Tensor::from_slice(&[1.0f32, -2.0, 0.5, 3.0]).view([4, 1]);
        let ys = xs.matmul(&true_w);

        let loss_at = |linear: &nn::Linear| {
            use tch::nn::Module;
            (linear.forward(&xs) - &ys).square().mean(Kind::Float)
        };

        let initial = loss_at(&linear).double_value(&[]);
        for _ in 0..300 {
            let loss = loss_at(&linear);
            loss.backward();
            optimizer.step();
            optimizer.scheduler_step();
            optimizer.zero_grad();
        }
        let last = loss_at(&linear).double_value(&[]);
        assert!(last < initial * 0.01, "loss went from {initial} to {last}");
    }
}
