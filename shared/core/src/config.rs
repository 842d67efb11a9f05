use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    depth_from_scale, gpu_token_capacity, to_nearest_64, tokens_per_batch_capacity,
    width_from_scale, ScalingLaws, REFERENCE_PARAM_COUNT,
};

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("set both depth and width explicitly, or neither (got depth={depth:?}, width={width:?})")]
    PartialDimensions {
        depth: Option<usize>,
        width: Option<usize>,
    },

    #[error("model scale must be positive and finite, got {0}")]
    InvalidScale(f64),

    #[error("{0} must be non-zero")]
    Zero(&'static str),

    #[error("width {width} is not divisible by {what} ({divisor})")]
    NotDivisible {
        width: usize,
        divisor: usize,
        what: &'static str,
    },

    #[error("initial sequence length {initial} must be between 1 and the maximum {max}")]
    InvalidSequenceLengths { initial: usize, max: usize },

    #[error("recorded parameter count {recorded} does not match the model's {actual}")]
    StaleParamCount { recorded: usize, actual: usize },

    #[error(
        "configuration takes up too much memory: {capacity} tokens per batch gives batch size {batch_size} at length {max_length}, which must be greater than 1"
    )]
    TokenCapacityTooSmall {
        capacity: usize,
        max_length: usize,
        batch_size: usize,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValuePathway {
    /// Attention values come out of the GeGLU gate.
    #[default]
    Gated,
    /// Attention values skip the gate and use the pre-activation channels.
    Linear,
}

fn default_vocab_size() -> usize {
    50304
}

fn default_num_heads() -> usize {
    1
}

fn default_qk_dim_div() -> usize {
    8
}

fn default_expand_factor() -> usize {
    2
}

fn default_max_sequence_length() -> usize {
    1024
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_vocab_size")]
    pub vocab_size: usize,
    pub width: usize,
    pub depth: usize,
    #[serde(default = "default_num_heads")]
    pub num_heads: usize,
    #[serde(default)]
    pub value_pathway: ValuePathway,
    #[serde(default = "default_qk_dim_div")]
    pub qk_dim_div: usize,
    #[serde(default = "default_expand_factor")]
    pub expand_factor: usize,
    /// Longest sequence the position constants are built for.
    #[serde(default = "default_max_sequence_length")]
    pub max_sequence_length: usize,
}

impl ModelConfig {
    pub fn new(width: usize, depth: usize) -> Self {
        Self {
            vocab_size: default_vocab_size(),
            width,
            depth,
            num_heads: default_num_heads(),
            value_pathway: ValuePathway::default(),
            qk_dim_div: default_qk_dim_div(),
            expand_factor: default_expand_factor(),
            max_sequence_length: default_max_sequence_length(),
        }
    }

    pub fn qk_dim(&self) -> usize {
        self.width / self.qk_dim_div
    }

    pub fn expand_dim(&self) -> usize {
        self.width * self.expand_factor
    }

    pub fn value_dim(&self) -> usize {
        self.width
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (value, name) in [
            (self.vocab_size, "vocab_size"),
            (self.width, "width"),
            (self.depth, "depth"),
            (self.num_heads, "num_heads"),
            (self.qk_dim_div, "qk_dim_div"),
            (self.expand_factor, "expand_factor"),
            (self.max_sequence_length, "max_sequence_length"),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero(name));
            }
        }
        if self.width % self.qk_dim_div != 0 {
            return Err(ConfigError::NotDivisible {
                width: self.width,
                divisor: self.qk_dim_div,
                what: "the query/key divisor",
            });
        }
        if self.width % self.num_heads != 0 || self.qk_dim() % self.num_heads != 0 {
            return Err(ConfigError::NotDivisible {
                width: self.width,
                divisor: self.num_heads,
                what: "the head count at both model and query/key width",
            });
        }
        Ok(())
    }

    fn block_params(&self) -> usize {
        let norm = self.width;
        let expand = (2 * self.qk_dim() + 2 * self.expand_dim()) * self.width;
        let project = self.width * self.expand_dim();
        let position_bias_mult = 1;
        norm + expand + project + position_bias_mult
    }

    /// Parameters in the attention blocks and the final norm.
    pub fn num_non_embedding_params(&self) -> usize {
        self.depth * self.block_params() + self.width
    }

    pub fn num_params(&self) -> usize {
        let embedding = self.vocab_size * self.width;
        let outputs = self.width * self.vocab_size;
        embedding + outputs + self.num_non_embedding_params()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SequenceConfig {
    pub initial_length: usize,
    /// Optimizer steps between doublings.
    pub growth_steps: u32,
}

impl Default for SequenceConfig {
    fn default() -> Self {
        Self {
            initial_length: 32,
            growth_steps: 80,
        }
    }
}

impl SequenceConfig {
    pub fn should_grow(&self, step: u32, current_length: usize, max_length: usize) -> bool {
        step != 0 && step % self.growth_steps == 0 && current_length < max_length
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LrMultipliers {
    pub base: f64,
    pub position_bias: f64,
    pub non_dot_products: f64,
    pub output: f64,
}

impl Default for LrMultipliers {
    fn default() -> Self {
        Self {
            base: 2.62,
            position_bias: 100.0,
            non_dot_products: 32.0,
            output: 2.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MicrobatchConfig {
    /// Optimizer steps between accumulation-depth resamples.
    pub sample_every: u32,
    pub scale_lr: f64,
    pub min_estimate: f64,
    pub initial_estimate: f64,
}

impl Default for MicrobatchConfig {
    fn default() -> Self {
        Self {
            sample_every: 5,
            scale_lr: 0.1,
            min_estimate: 0.1,
            initial_estimate: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub lr_mult: LrMultipliers,
    /// Multiplier of the loss-driven weight decay.
    pub weight_decay: f64,
    pub warmup_steps: u32,
    pub warmup_floor: f64,
    pub decay_exponent: f64,
    pub output_decay_exponent: f64,
    pub position_bias_decay: f64,
    pub eps: f64,
    pub betas: (f64, f64),
    pub output_betas: (f64, f64),
    pub total_steps: u32,
    pub eval_every: u32,
    pub num_eval_tokens: usize,
    pub max_epochs_between_evals: f64,
    pub log_every: u32,
    pub microbatch: MicrobatchConfig,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            lr_mult: LrMultipliers::default(),
            weight_decay: 16.0,
            warmup_steps: 100,
            warmup_floor: 2e-2,
            decay_exponent: -0.08,
            output_decay_exponent: -0.2,
            position_bias_decay: 0.995,
            eps: 1e-9,
            betas: (0.9, 0.95),
            output_betas: (0.6, 0.95),
            total_steps: 1000,
            eval_every: 50,
            num_eval_tokens: 153_600,
            max_epochs_between_evals: 0.25,
            log_every: 10,
            microbatch: MicrobatchConfig::default(),
        }
    }
}

/// Description of one training run. [`RunConfigBuilder::build`] validates it and
/// [`RunConfig::validate`] re-checks it after edits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub model: ModelConfig,
    pub sequence: SequenceConfig,
    pub optimizer: OptimizerConfig,
    pub gpu_token_capacity: f64,
    pub tokens_per_batch_capacity: usize,
    pub num_params: usize,
    pub seed: u64,
}

impl RunConfig {
    pub fn builder() -> RunConfigBuilder {
        RunConfigBuilder::default()
    }

    /// Re-checks what `build` checked. The fields are public, so a config edited or
    /// deserialized after building is not otherwise guaranteed to be consistent.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.model.validate()?;
        check_schedule(&self.model, &self.sequence, &self.optimizer)?;
        let actual = self.model.num_params();
        if self.num_params != actual {
            return Err(ConfigError::StaleParamCount {
                recorded: self.num_params,
                actual,
            });
        }
        check_capacity(self.tokens_per_batch_capacity, self.model.max_sequence_length)
    }

    pub fn max_sequence_length(&self) -> usize {
        self.model.max_sequence_length
    }

    pub fn model_scale(&self) -> f64 {
        self.num_params as f64 / REFERENCE_PARAM_COUNT
    }

    pub fn scaling_laws(&self) -> ScalingLaws {
        ScalingLaws::new(self.num_params)
    }

    pub fn batch_size_for(&self, length: usize) -> usize {
        self.tokens_per_batch_capacity / length
    }

    pub fn initial_batch_size(&self) -> usize {
        self.batch_size_for(self.sequence.initial_length)
    }

    pub fn final_batch_size(&self) -> usize {
        self.batch_size_for(self.max_sequence_length())
    }

    /// Held-out batches are sixteen times smaller than the training batch at the same length.
    pub fn eval_batch_size(&self) -> usize {
        (self.final_batch_size() / 16).max(1)
    }

    pub fn num_eval_steps(&self) -> usize {
        let sequences = self.optimizer.num_eval_tokens / self.max_sequence_length();
        (sequences / self.eval_batch_size()).max(1)
    }
}

#[derive(Debug, Clone)]
pub struct RunConfigBuilder {
    scale: f64,
    depth: Option<usize>,
    width: Option<usize>,
    num_heads: usize,
    value_pathway: ValuePathway,
    vocab_size: usize,
    max_sequence_length: usize,
    capacity_scalar: f64,
    seed: u64,
    sequence: SequenceConfig,
    optimizer: OptimizerConfig,
}

impl Default for RunConfigBuilder {
    fn default() -> Self {
        Self {
            scale: 1.0,
            depth: None,
            width: None,
            num_heads: default_num_heads(),
            value_pathway: ValuePathway::default(),
            vocab_size: default_vocab_size(),
            max_sequence_length: default_max_sequence_length(),
            capacity_scalar: 1.0,
            seed: 100,
            sequence: SequenceConfig::default(),
            optimizer: OptimizerConfig::default(),
        }
    }
}

impl RunConfigBuilder {
    /// Sizes depth and width from one knob. Ignored when both dimensions are explicit.
    pub fn scale(mut self, scale: f64) -> Self {
        self.scale = scale;
        self
    }

    pub fn depth(mut self, depth: Option<usize>) -> Self {
        self.depth = depth;
        self
    }

    /// Explicit width, rounded to the nearest multiple of 64.
    pub fn width(mut self, width: Option<usize>) -> Self {
        self.width = width;
        self
    }

    pub fn num_heads(mut self, num_heads: usize) -> Self {
        self.num_heads = num_heads;
        self
    }

    pub fn value_pathway(mut self, value_pathway: ValuePathway) -> Self {
        self.value_pathway = value_pathway;
        self
    }

    pub fn vocab_size(mut self, vocab_size: usize) -> Self {
        self.vocab_size = vocab_size;
        self
    }

    pub fn max_sequence_length(mut self, max_sequence_length: usize) -> Self {
        self.max_sequence_length = max_sequence_length;
        self
    }

    pub fn capacity_scalar(mut self, capacity_scalar: f64) -> Self {
        self.capacity_scalar = capacity_scalar;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn sequence(mut self, sequence: SequenceConfig) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn optimizer(mut self, optimizer: OptimizerConfig) -> Self {
        self.optimizer = optimizer;
        self
    }

    pub fn total_steps(mut self, total_steps: u32) -> Self {
        self.optimizer.total_steps = total_steps;
        self
    }

    pub fn build(self) -> Result<RunConfig, ConfigError> {
        let (depth, width) = match (self.depth, self.width) {
            (Some(depth), Some(width)) => (depth, to_nearest_64(width as f64)),
            (None, None) => {
                if !(self.scale.is_finite() && self.scale > 0.0) {
                    return Err(ConfigError::InvalidScale(self.scale));
                }
                (depth_from_scale(self.scale), width_from_scale(self.scale))
            }
            (depth, width) => return Err(ConfigError::PartialDimensions { depth, width }),
        };

        let model = ModelConfig {
            vocab_size: self.vocab_size,
            width,
            depth,
            num_heads: self.num_heads,
            value_pathway: self.value_pathway,
            qk_dim_div: default_qk_dim_div(),
            expand_factor: default_expand_factor(),
            max_sequence_length: self.max_sequence_length,
        };
        model.validate()?;
        check_schedule(&model, &self.sequence, &self.optimizer)?;

        let num_params = model.num_params();
        let gpu_token_capacity = gpu_token_capacity(self.capacity_scalar);
        let capacity = tokens_per_batch_capacity(gpu_token_capacity, num_params);
        check_capacity(capacity, model.max_sequence_length)?;

        Ok(RunConfig {
            model,
            sequence: self.sequence,
            optimizer: self.optimizer,
            gpu_token_capacity,
            tokens_per_batch_capacity: capacity,
            num_params,
            seed: self.seed,
        })
    }
}

fn check_schedule(
    model: &ModelConfig,
    sequence: &SequenceConfig,
    optimizer: &OptimizerConfig,
) -> Result<(), ConfigError> {
    let initial = sequence.initial_length;
    if initial == 0 || initial > model.max_sequence_length {
        return Err(ConfigError::InvalidSequenceLengths {
            initial,
            max: model.max_sequence_length,
        });
    }
    for (value, name) in [
        (sequence.growth_steps, "growth_steps"),
        (optimizer.eval_every, "eval_every"),
        (optimizer.log_every, "log_every"),
        (optimizer.microbatch.sample_every, "sample_every"),
    ] {
        if value == 0 {
            return Err(ConfigError::Zero(name));
        }
    }
    Ok(())
}

/// The largest sequence must still fit more than one row per batch.
fn check_capacity(capacity: usize, max_length: usize) -> Result<(), ConfigError> {
    let batch_size = capacity / max_length;
    if batch_size <= 1 {
        return Err(ConfigError::TokenCapacityTooSmall {
            capacity,
            max_length,
            batch_size,
        });
    }
    Ok(())
}
