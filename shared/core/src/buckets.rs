use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{LrSchedule, OptimizerConfig};

/// The four disjoint optimizer groups every trainable parameter is tagged with at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamBucket {
    /// Catch-all for dot-product weights; the only group with weight decay.
    Decay,
    PositionBias,
    NormBiasEmbedding,
    Output,
}

impl ParamBucket {
    /// Stepping order of the groups.
    pub const ALL: [ParamBucket; 4] = [
        ParamBucket::Decay,
        ParamBucket::PositionBias,
        ParamBucket::NormBiasEmbedding,
        ParamBucket::Output,
    ];

    pub fn index(self) -> usize {
        match self {
            ParamBucket::Decay => 0,
            ParamBucket::PositionBias => 1,
            ParamBucket::NormBiasEmbedding => 2,
            ParamBucket::Output => 3,
        }
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn name(self) -> &'static str {
        match self {
            ParamBucket::Decay => "decay",
            ParamBucket::PositionBias => "position_bias_mult",
            ParamBucket::NormBiasEmbedding => "norm_bias_embedding",
            ParamBucket::Output => "output",
        }
    }
}

impl fmt::Display for ParamBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GroupHyperparameters {
    pub bucket: ParamBucket,
    pub lr: f64,
    pub betas: (f64, f64),
    pub eps: f64,
    pub weight_decay: f64,
    pub schedule: LrSchedule,
}

impl OptimizerConfig {
    pub fn schedule_for(&self, bucket: ParamBucket) -> LrSchedule {
        match bucket {
            ParamBucket::Decay | ParamBucket::NormBiasEmbedding => LrSchedule::WarmupPowerLaw {
                floor: self.warmup_floor,
                warmup_steps: self.warmup_steps,
                exponent: self.decay_exponent,
            },
            ParamBucket::Output => LrSchedule::PowerLaw {
                exponent: self.output_decay_exponent,
            },
            ParamBucket::PositionBias => LrSchedule::ExponentialDecay {
                decay: self.position_bias_decay,
            },
        }
    }

    /// Starting hyperparameters of one group given the run's base learning rate.
    pub fn group_hyperparameters(&self, bucket: ParamBucket, base_lr: f64) -> GroupHyperparameters {
        let scaled_lr = base_lr * self.lr_mult.base;
        let (lr, betas, weight_decay) = match bucket {
            ParamBucket::Decay => (scaled_lr, self.betas, self.weight_decay),
            ParamBucket::PositionBias => (scaled_lr * self.lr_mult.position_bias, self.betas, 0.0),
            ParamBucket::NormBiasEmbedding => {
                (scaled_lr * self.lr_mult.non_dot_products, self.betas, 0.0)
            }
            ParamBucket::Output => (scaled_lr * self.lr_mult.output, self.output_betas, 0.0),
        };
        GroupHyperparameters {
            bucket,
            lr,
            betas,
            eps: self.eps,
            weight_decay,
            schedule: self.schedule_for(bucket),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indices_round_trip_in_order() {
        for (i, bucket) in ParamBucket::ALL.iter().enumerate() {
            assert_eq!(bucket.index(), i);
            assert_eq!(ParamBucket::from_index(i), Some(*bucket));
        }
        assert_eq!(ParamBucket::from_index(4), None);
    }

    #[test]
    fn only_decay_group_decays() {
        let config = OptimizerConfig::default();
        for bucket in ParamBucket::ALL {
            let group = config.group_hyperparameters(bucket, 1e-3);
            assert_eq!(group.weight_decay > 0.0, bucket == ParamBucket::Decay);
        }
    }

    #[test]
    fn group_rates_follow_multipliers() {
        let config = OptimizerConfig::default();
        let decay = config.group_hyperparameters(ParamBucket::Decay, 1e-3);
        let bias = config.group_hyperparameters(ParamBucket::PositionBias, 1e-3);
        let output = config.group_hyperparameters(ParamBucket::Output, 1e-3);
        assert!((decay.lr - 2.62e-3).abs() < 1e-12);
        assert!((bias.lr / decay.lr - 100.0).abs() < 1e-9);
        assert!((output.lr / decay.lr - 2.0).abs() < 1e-9);
        assert_eq!(output.betas, (0.6, 0.95));
        assert_eq!(decay.betas, (0.9, 0.95));
    }
}
