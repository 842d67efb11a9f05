use speedy_core::{ModelConfig, ParamBucket, ValuePathway};
use tch::{
    nn::{self, Module},
    Kind, Tensor,
};

use crate::{param_groups::tagged, LayerNorm, PositionConstants};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AttentionImplementation {
    /// Fused `scaled_dot_product_attention`.
    #[default]
    Sdpa,
    /// Explicit matmul/softmax; slower, fully deterministic on CPU.
    Eager,
}

/// One residual layer: a fused projection feeding a GeGLU channel mixer and a single attention
/// operation whose values come out of that mixer.
#[derive(Debug)]
pub struct LatentAttentionBlock {
    norm: LayerNorm,
    expand: Tensor,
    project: Tensor,
    position_bias_mult: Tensor,
    qk_dim: i64,
    expand_dim: i64,
    value_dim: i64,
    num_heads: i64,
    value_pathway: ValuePathway,
    attn_implementation: AttentionImplementation,
}

impl LatentAttentionBlock {
    pub fn new(
        vs: nn::Path,
        config: &ModelConfig,
        attn_implementation: AttentionImplementation,
    ) -> Self {
        assert_eq!(
            config.width % config.qk_dim_div,
            0,
            "width must be divisible by the query/key divisor"
        );
        assert_eq!(
            config.qk_dim() % config.num_heads,
            0,
            "query/key width must be divisible by num_heads"
        );
        assert_eq!(
            config.width % config.num_heads,
            0,
            "width must be divisible by num_heads"
        );

        let width = config.width as i64;
        let qk_dim = config.qk_dim() as i64;
        let expand_dim = config.expand_dim() as i64;
        let expand_factor = config.expand_factor as f64;
        let inv_sqrt_width = 1.0 / (width as f64).sqrt();

        let norm = LayerNorm::new(
            tagged(&vs / "norm", ParamBucket::NormBiasEmbedding),
            width,
            1e-5,
        );
        let expand = tagged(&vs / "expand", ParamBucket::Decay).var(
            "weight",
            &[2 * qk_dim + 2 * expand_dim, width],
            nn::Init::Randn {
                mean: 0.0,
                stdev: 0.5 * inv_sqrt_width / expand_factor,
            },
        );
        // shrinks each residual contribution as depth grows
        let project = tagged(&vs / "project", ParamBucket::Decay).var(
            "weight",
            &[width, expand_dim],
            nn::Init::Randn {
                mean: 0.0,
                stdev: inv_sqrt_width / expand_factor / (config.depth as f64).sqrt(),
            },
        );
        let position_bias_mult = tagged(&vs / "position_bias", ParamBucket::PositionBias).var(
            "mult",
            &[],
            nn::Init::Const(1.0),
        );

        Self {
            norm,
            expand,
            project,
            position_bias_mult,
            qk_dim,
            expand_dim,
            value_dim: config.value_dim() as i64,
            num_heads: config.num_heads as i64,
            value_pathway: config.value_pathway,
            attn_implementation,
        }
    }

    pub fn position_bias_mult(&self) -> &Tensor {
        &self.position_bias_mult
    }

    pub fn forward(&self, xs: &Tensor, constants: &PositionConstants) -> Tensor {
        let (b, t, _) = xs.size3().unwrap();

        let normed = self.norm.forward(xs);
        let projected = normed.linear::<Tensor>(&self.expand, None).split_with_sizes(
            [self.qk_dim, self.qk_dim, self.expand_dim, self.expand_dim],
            -1,
        );
        let (query, key, linear, pre_gelu) =
            (&projected[0], &projected[1], &projected[2], &projected[3]);

        let geglu = linear * pre_gelu.gelu("none");
        let local_dim = self.expand_dim - self.value_dim;
        let local = geglu.narrow(-1, 0, local_dim);
        let value = match self.value_pathway {
            ValuePathway::Gated => geglu.narrow(-1, local_dim, self.value_dim),
            ValuePathway::Linear => pre_gelu.narrow(-1, local_dim, self.value_dim),
        };

        let bias = constants.attention_bias(t, &self.position_bias_mult);
        let attention = self.attend(query, key, &value, &bias, b, t);

        let out = Tensor::cat(&[local, attention], -1).linear::<Tensor>(&self.project, None);
        xs + out
    }

    fn attend(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        bias: &Tensor,
        b: i64,
        t: i64,
    ) -> Tensor {
        let split_heads = |x: &Tensor| x.reshape([b, t, self.num_heads, -1]).transpose(1, 2);
        let (q, k, v) = (split_heads(query), split_heads(key), split_heads(value));
        let scale = 1.0 / ((self.qk_dim / self.num_heads) as f64).sqrt();

        let y = match self.attn_implementation {
            AttentionImplementation::Sdpa => Tensor::scaled_dot_product_attention::<&Tensor>(
                &q,
                &k,
                &v,
                Some(bias),
                0.0,
                false,
                Some(scale),
                false,
            ),
            AttentionImplementation::Eager => {
                let kind = q.kind();
                let att = q.matmul(&k.transpose(-2, -1)) * scale + bias;
                att.softmax(-1, Kind::Float).to_kind(kind).matmul(&v)
            }
        };
        y.transpose(1, 2)
            .contiguous()
            .reshape([b, t, self.value_dim])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Device;

    fn block_config(num_heads: usize, value_pathway: ValuePathway) -> ModelConfig {
        ModelConfig {
            vocab_size: 32,
            num_heads,
            value_pathway,
            max_sequence_length: 16,
            ..ModelConfig::new(64, 2)
        }
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f64 {
        (a - b).abs().max().double_value(&[])
    }

    #[test]
    fn preserves_shape() {
        let vs = nn::VarStore::new(Device::Cpu);
        let config = block_config(1, ValuePathway::Gated);
        let block = LatentAttentionBlock::new(vs.root(), &config, AttentionImplementation::Sdpa);
        let constants = PositionConstants::new(16, Kind::Float, Device::Cpu);
        let xs = Tensor::randn([2, 10, 64], (Kind::Float, Device::Cpu));
        assert_eq!(block.forward(&xs, &constants).size(), vec![2, 10, 64]);
    }

    #[test]
    fn weight_shapes_and_buckets() {
        let vs = nn::VarStore::new(Device::Cpu);
        let config = block_config(1, ValuePathway::Gated);
        let _block = LatentAttentionBlock::new(vs.root(), &config, AttentionImplementation::Sdpa);
        let parameters = crate::tagged_parameters(&vs).unwrap();
        let shapes: Vec<_> = parameters
            .iter()
            .map(|p| (p.name.as_str(), p.tensor.size(), p.bucket))
            .collect();
        assert_eq!(
            shapes,
            vec![
                ("expand.weight", vec![272, 64], ParamBucket::Decay),
                ("norm.weight", vec![64], ParamBucket::NormBiasEmbedding),
                ("position_bias.mult", vec![], ParamBucket::PositionBias),
                ("project.weight", vec![64, 128], ParamBucket::Decay),
            ]
        );
    }

    #[test]
    fn sdpa_matches_eager() {
        for (num_heads, value_pathway) in [
            (1, ValuePathway::Gated),
            (2, ValuePathway::Linear),
            (4, ValuePathway::Gated),
        ] {
            let config = block_config(num_heads, value_pathway);
            let build = |attn_implementation| {
                tch::manual_seed(3);
                let vs = nn::VarStore::new(Device::Cpu);
                let block = LatentAttentionBlock::new(vs.root(), &config, attn_implementation);
                (vs, block)
            };
            let (_sdpa_vs, sdpa) = build(AttentionImplementation::Sdpa);
            let (_eager_vs, eager) = build(AttentionImplementation::Eager);
            let constants = PositionConstants::new(16, Kind::Float, Device::Cpu);
            let xs = Tensor::randn([2, 12, 64], (Kind::Float, Device::Cpu));
            let a = sdpa.forward(&xs, &constants);
            let b = eager.forward(&xs, &constants);
            let diff = max_abs_diff(&a, &b);
            assert!(diff < 1e-4, "heads={num_heads}: max_abs_diff={diff}");
        }
    }

    #[test]
    fn output_is_causal() {
        tch::manual_seed(11);
        let vs = nn::VarStore::new(Device::Cpu);
        let config = block_config(2, ValuePathway::Gated);
        let block = LatentAttentionBlock::new(vs.root(), &config, AttentionImplementation::Eager);
        let constants = PositionConstants::new(16, Kind::Float, Device::Cpu);

        let xs = Tensor::randn([1, 12, 64], (Kind::Float, Device::Cpu));
        let position = 5;
        let mut perturbed = xs.copy();
        let tail = Tensor::randn([1, 12 - position - 1, 64], (Kind::Float, Device::Cpu));
        perturbed
            .narrow(1, position + 1, 12 - position - 1)
            .copy_(&tail);

        let before = block.forward(&xs, &constants).narrow(1, 0, position + 1);
        let after = block.forward(&perturbed, &constants).narrow(1, 0, position + 1);
        assert_eq!(max_abs_diff(&before, &after), 0.0);

        let later_before = block.forward(&xs, &constants).narrow(1, position + 1, 1);
        let later_after = block.forward(&perturbed, &constants).narrow(1, position + 1, 1);
        assert!(max_abs_diff(&later_before, &later_after) > 0.0);
    }

    #[test]
    fn position_bias_receives_gradient() {
        let vs = nn::VarStore::new(Device::Cpu);
        let config = block_config(1, ValuePathway::Gated);
        let block = LatentAttentionBlock::new(vs.root(), &config, AttentionImplementation::Sdpa);
        let constants = PositionConstants::new(16, Kind::Float, Device::Cpu);
        let xs = Tensor::randn([2, 8, 64], (Kind::Float, Device::Cpu));
        block.forward(&xs, &constants).square().sum(Kind::Float).backward();
        let grad = block.position_bias_mult().grad();
        assert!(grad.defined());
        assert!(grad.double_value(&[]).abs() > 0.0);
    }
}
