use candle_core::{Module, Result, Tensor};
use candle_nn::{linear, Linear, VarBuilder};

use crate::adapters::NonLinearity;

/// First half of the feed-forward block (`intermediate.dense` + activation).
pub(crate) struct Intermediate {
    dense: Linear,
    act: NonLinearity,
}

impl Intermediate {
    pub fn new(
        hidden_size: usize,
        intermediate_size: usize,
        act: NonLinearity,
        vb: VarBuilder,
    ) -> Result<Self> {
        let dense = linear(hidden_size, intermediate_size, vb.pp("dense"))?;
        Ok(Self { dense, act })
    }
}

impl Module for Intermediate {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.dense.forward(xs)?.apply(&self.act)
    }
}
