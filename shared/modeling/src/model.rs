use std::sync::atomic::{AtomicBool, Ordering};

use speedy_core::{ConfigError, ModelConfig, ParamBucket};
use tch::{
    nn::{self, Module},
    Device, Kind, Tensor,
};

use crate::{
    param_groups::tagged, tagged_parameters, AttentionImplementation, BucketSummary, LayerNorm,
    LatentAttentionBlock, ParamGroupError, PositionConstants, TaggedParameter,
};

/// Target id excluded from the loss.
pub const IGNORE_INDEX: i64 = -1;

/// Mean next-token cross-entropy in f32, skipping [`IGNORE_INDEX`] targets.
pub fn cross_entropy(logits: &Tensor, targets: &Tensor) -> Tensor {
    let vocab_size = *logits.size().last().unwrap();
    logits
        .reshape([-1, vocab_size])
        .to_kind(Kind::Float)
        .cross_entropy_loss::<Tensor>(
            &targets.reshape([-1]),
            None,
            tch::Reduction::Mean,
            IGNORE_INDEX,
            0.0,
        )
}

/// Fraction of positions where the arg-max logit is the target.
pub fn accuracy(logits: &Tensor, targets: &Tensor) -> Tensor {
    logits
        .argmax(-1, false)
        .eq_tensor(targets)
        .to_kind(Kind::Float)
        .mean(Kind::Float)
}

/// Embedding, a stack of latent attention blocks, a final norm and a vocabulary projection.
#[derive(Debug)]
pub struct SpeedyLangNet {
    variables: nn::VarStore,
    embedding: nn::Embedding,
    blocks: Vec<LatentAttentionBlock>,
    norm: LayerNorm,
    outputs: nn::Linear,
    constants: PositionConstants,
    config: ModelConfig,
    device: Device,
    training: AtomicBool,
}

impl SpeedyLangNet {
    pub fn new(
        config: &ModelConfig,
        attn_implementation: AttentionImplementation,
        device: Device,
        kind: Kind,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let mut variables = nn::VarStore::new(device);
        variables.set_kind(kind);

        let width = config.width as i64;
        let vocab_size = config.vocab_size as i64;
        let inv_sqrt_width = 1.0 / (width as f64).sqrt();

        let (embedding, blocks, norm, outputs) = {
            let _no_grad = tch::no_grad_guard();
            let root = variables.root();

            let embedding = nn::embedding(
                tagged(&root / "embedding", ParamBucket::NormBiasEmbedding),
                vocab_size,
                width,
                nn::EmbeddingConfig {
                    scale_grad_by_freq: true,
                    ws_init: nn::Init::Randn {
                        mean: 0.0,
                        stdev: 0.25 * inv_sqrt_width,
                    },
                    ..Default::default()
                },
            );
            let blocks = (0..config.depth)
                .map(|i| {
                    LatentAttentionBlock::new(&root / "blocks" / i, config, attn_implementation)
                })
                .collect::<Vec<_>>();
            let norm = LayerNorm::new(
                tagged(&root / "norm", ParamBucket::NormBiasEmbedding),
                width,
                1e-5,
            );
            let outputs = nn::linear(
                tagged(&root / "outputs", ParamBucket::Output),
                width,
                vocab_size,
                nn::LinearConfig {
                    ws_init: nn::Init::Randn {
                        mean: 0.0,
                        stdev: 0.5 * inv_sqrt_width,
                    },
                    bs_init: None,
                    bias: false,
                },
            );
            (embedding, blocks, norm, outputs)
        };

        let constants = PositionConstants::new(config.max_sequence_length as i64, kind, device);

        Ok(Self {
            variables,
            embedding,
            blocks,
            norm,
            outputs,
            constants,
            config: config.clone(),
            device,
            training: AtomicBool::new(true),
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn kind(&self) -> Kind {
        self.variables.kind()
    }

    pub fn var_store(&self) -> &nn::VarStore {
        &self.variables
    }

    pub fn var_store_mut(&mut self) -> &mut nn::VarStore {
        &mut self.variables
    }

    pub fn blocks(&self) -> &[LatentAttentionBlock] {
        &self.blocks
    }

    pub fn parameters(&self) -> Result<Vec<TaggedParameter>, ParamGroupError> {
        tagged_parameters(&self.variables)
    }

    pub fn bucket_summary(&self) -> Result<BucketSummary, ParamGroupError> {
        Ok(BucketSummary::from_parameters(&self.parameters()?))
    }

    pub fn num_params(&self) -> usize {
        self.variables
            .trainable_variables()
            .iter()
            .map(|t| t.numel())
            .sum()
    }

    pub fn is_training(&self) -> bool {
        self.training.load(Ordering::Relaxed)
    }

    /// Training and evaluation run the same computation; the flag only tracks which phase owns
    /// the model.
    pub fn set_training(&self, training: bool) {
        self.training.store(training, Ordering::Relaxed);
    }

    /// Zeroes every accumulated gradient.
    pub fn zero_grad(&self) {
        for tensor in self.variables.trainable_variables() {
            let mut grad = tensor.grad();
            if grad.defined() {
                let _ = grad.zero_();
            }
        }
    }

    /// L2 norm over all accumulated gradients, summed in f64.
    pub fn grad_norm(&self) -> f64 {
        let _guard = tch::no_grad_guard();
        self.variables
            .trainable_variables()
            .iter()
            .map(|t| t.grad())
            .filter(|g| g.defined())
            .map(|g| {
                g.to_kind(Kind::Float)
                    .square()
                    .sum(Kind::Double)
                    .double_value(&[])
            })
            .sum::<f64>()
            .sqrt()
    }
}

impl Module for SpeedyLangNet {
    /// Token ids `[batch, length]` to logits `[batch, length, vocab]`.
    fn forward(&self, tokens: &Tensor) -> Tensor {
        let mut xs = self.embedding.forward(tokens);
        for block in &self.blocks {
            xs = block.forward(&xs, &self.constants);
        }
        self.outputs.forward(&self.norm.forward(&xs))
    }
}
