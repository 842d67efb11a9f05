use tch::{Device, Kind, Tensor};

/// Numerically stable `ln(1 + e^x)`.
pub fn softplus(xs: &Tensor) -> Tensor {
    xs.relu() + (-xs.abs()).exp().log1p()
}

/// Position tables built once for the longest sequence and sliced by every block.
#[derive(Debug)]
pub struct PositionConstants {
    /// `[i][j] = j - i`, non-positive on and below the diagonal.
    relative_positions: Tensor,
    causal_mask: Tensor,
    negative_infinity: Tensor,
    max_length: i64,
}

impl PositionConstants {
    pub fn new(max_length: i64, kind: Kind, device: Device) -> Self {
        let _guard = tch::no_grad_guard();
        let range = Tensor::arange(max_length, (kind, device));
        let relative_positions = range.unsqueeze(0) - range.unsqueeze(1);
        let causal_mask = Tensor::ones([max_length, max_length], (Kind::Bool, device)).tril(0);
        let negative_infinity = Tensor::full(
            [max_length, max_length],
            f64::NEG_INFINITY,
            (kind, device),
        );
        Self {
            relative_positions,
            causal_mask,
            negative_infinity,
            max_length,
        }
    }

    pub fn max_length(&self) -> i64 {
        self.max_length
    }

    fn square(&self, table: &Tensor, length: i64) -> Tensor {
        assert!(
            length <= self.max_length,
            "sequence length {length} exceeds the maximum {}",
            self.max_length
        );
        table.narrow(0, 0, length).narrow(1, 0, length)
    }

    pub fn relative_positions(&self, length: i64) -> Tensor {
        self.square(&self.relative_positions, length)
    }

    pub fn causal_mask(&self, length: i64) -> Tensor {
        self.square(&self.causal_mask, length)
    }

    pub fn negative_infinity(&self, length: i64) -> Tensor {
        self.square(&self.negative_infinity, length)
    }

    /// Additive attention mask: `softplus(scale) * (j - i)` where `j <= i`, `-inf` elsewhere.
    pub fn attention_bias(&self, length: i64, scale: &Tensor) -> Tensor {
        let bias = softplus(scale) * self.relative_positions(length);
        bias.where_self(&self.causal_mask(length), &self.negative_infinity(length))
    }
}
