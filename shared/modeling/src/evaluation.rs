use anyhow::Result;
use speedy_core::RunConfig;
use speedy_data_provider::{BatchSampler, Split};
use tch::{nn::Module, Kind, Tensor};
use tracing::debug;

use crate::{accuracy, calc_pplx, cross_entropy, DeviceBatch, SpeedyLangNet};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvalMetrics {
    pub loss: f64,
    pub accuracy: f64,
    pub pplx: f64,
    pub num_batches: usize,
}

/// Mean loss and accuracy over the fixed held-out sweep at the maximum sequence length.
///
/// The sweep is a pure function of the weights, so repeated calls without training in
/// between return identical values.
pub fn evaluate<S: BatchSampler + ?Sized>(
    model: &SpeedyLangNet,
    sampler: &S,
    config: &RunConfig,
) -> Result<EvalMetrics> {
    let length = config.max_sequence_length();
    let batch_size = config.eval_batch_size();
    let num_batches = config.num_eval_steps();

    let was_training = model.is_training();
    model.set_training(false);
    let sums = tch::no_grad(|| sweep(model, sampler, batch_size, length, num_batches));
    model.set_training(was_training);
    let (loss_sum, acc_sum) = sums?;

    let loss = loss_sum / num_batches as f64;
    let accuracy = acc_sum / num_batches as f64;

    debug!(num_batches, batch_size, length, loss, accuracy, "evaluated");
    Ok(EvalMetrics {
        loss,
        accuracy,
        pplx: calc_pplx(loss),
        num_batches,
    })
}

/// Summed loss and accuracy over the first `num_batches` held-out batches.
fn sweep<S: BatchSampler + ?Sized>(
    model: &SpeedyLangNet,
    sampler: &S,
    batch_size: usize,
    length: usize,
    num_batches: usize,
) -> Result<(f64, f64)> {
    let device = model.device();
    let mut loss_sum = Tensor::zeros([], (Kind::Float, device));
    let mut acc_sum = Tensor::zeros([], (Kind::Float, device));
    for index in 0..num_batches {
        let batch = sampler.fixed_batch(Split::Eval, index, batch_size, length)?;
        let batch = DeviceBatch::new(&batch, device);
        let logits = model.forward(&batch.inputs);
        loss_sum += cross_entropy(&logits, &batch.targets);
        acc_sum += accuracy(&logits, &batch.targets);
    }
    Ok((loss_sum.double_value(&[]), acc_sum.double_value(&[])))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AttentionImplementation;
    use pretty_assertions::assert_eq;
    use speedy_core::{OptimizerConfig, SequenceConfig};
    use speedy_data_provider::{TokenSplits, UniformSampler};
    use tch::Device;

    fn tiny_run() -> RunConfig {
        RunConfig::builder()
            .depth(Some(1))
            .width(Some(64))
            .vocab_size(16)
            .max_sequence_length(16)
            .sequence(SequenceConfig {
                initial_length: 8,
                ..Default::default()
            })
            .optimizer(OptimizerConfig {
                num_eval_tokens: 64,
                ..Default::default()
            })
            .capacity_scalar(0.0035)
            .build()
            .unwrap()
    }

    #[test]
    fn repeated_evaluation_is_identical() {
        tch::manual_seed(7);
        let config = tiny_run();
        let model = SpeedyLangNet::new(
            &config.model,
            AttentionImplementation::Sdpa,
            Device::Cpu,
            Kind::Float,
        )
        .unwrap();
        let eval: Vec<i32> = (0..200).map(|i| (i * 7 % 16) as i32).collect();
        let sampler = UniformSampler::new(TokenSplits::new(eval.clone(), eval), 3);

        let first = evaluate(&model, &sampler, &config).unwrap();
        let second = evaluate(&model, &sampler, &config).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.num_batches, config.num_eval_steps());
        assert!(first.loss.is_finite());
        assert!((0.0..=1.0).contains(&first.accuracy));
        assert!(model.is_training());
    }

    #[test]
    fn short_eval_split_is_an_error() {
        let config = tiny_run();
        let model = SpeedyLangNet::new(
            &config.model,
            AttentionImplementation::Eager,
            Device::Cpu,
            Kind::Float,
        )
        .unwrap();
        let sampler = UniformSampler::new(TokenSplits::new(vec![0; 100], vec![0; 10]), 3);
        assert!(evaluate(&model, &sampler, &config).is_err());
        assert!(model.is_training());

        model.set_training(false);
        assert!(evaluate(&model, &sampler, &config).is_err());
        assert!(!model.is_training());
    }

    #[test]
    fn multi_row_eval_batches() {
        let config = RunConfig::builder()
            .depth(Some(1))
            .width(Some(64))
            .vocab_size(16)
            .max_sequence_length(16)
            .sequence(SequenceConfig {
                initial_length: 8,
                ..Default::default()
            })
            .optimizer(OptimizerConfig {
                num_eval_tokens: 256,
                ..Default::default()
            })
            .capacity_scalar(0.02)
            .build()
            .unwrap();
        assert!(config.eval_batch_size() > 1);

        let model = SpeedyLangNet::new(
            &config.model,
            AttentionImplementation::Sdpa,
            Device::Cpu,
            Kind::Float,
        )
        .unwrap();
        let eval: Vec<i32> = (0..512).map(|i| (i % 16) as i32).collect();
        let sampler = UniformSampler::new(TokenSplits::new(eval.clone(), eval), 1);
        let metrics = evaluate(&model, &sampler, &config).unwrap();
        assert!(metrics.loss.is_finite());
    }
}
