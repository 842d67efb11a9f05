use tch::{
    nn::{self, Module},
    Tensor,
};

/// LayerNorm with a learned gain and no bias.
#[derive(Debug)]
pub struct LayerNorm {
    weight: Tensor,
    size: i64,
    eps: f64,
}

impl LayerNorm {
    pub fn new(vs: nn::Path, size: i64, eps: f64) -> Self {
        let weight = vs.var("weight", &[size], nn::Init::Const(1.0));
        Self { weight, size, eps }
    }
}

impl Module for LayerNorm {
    fn forward(&self, xs: &Tensor) -> Tensor {
        xs.layer_norm([self.size], Some(&self.weight), None, self.eps, true)
    }
}
