//! Bottleneck adapter: down-project, non-linearity, up-project.

use candle_core::{Module, Result, Tensor};
use candle_nn::{linear, Linear, VarBuilder};

use super::config::{NonLinearity, Placement};
use super::context::ForwardContext;
use super::injection::{Compose, HookState};

/// A single bottleneck module attached at one slot of one layer.
///
/// ```text
/// contribution = scaling * adapter_up(act(adapter_down(source)))
/// ```
///
/// `source` is the sub-layer output for sequential placement and the
/// sub-layer input for parallel placement. The contribution is always added
/// to the sub-layer output.
pub struct BottleneckAdapter {
    adapter_down: Linear,
    adapter_up: Linear,
    non_linearity: NonLinearity,
    scaling: f64,
    placement: Placement,
    in_features: usize,
    bottleneck_size: usize,
}

impl BottleneckAdapter {
    pub fn new(
        in_features: usize,
        bottleneck_size: usize,
        non_linearity: NonLinearity,
        scaling: f64,
        placement: Placement,
        vb: VarBuilder,
    ) -> Result<Self> {
        let adapter_down = linear(in_features, bottleneck_size, vb.pp("adapter_down"))?;
        let adapter_up = linear(bottleneck_size, in_features, vb.pp("adapter_up"))?;
        Ok(Self {
            adapter_down,
            adapter_up,
            non_linearity,
            scaling,
            placement,
            in_features,
            bottleneck_size,
        })
    }

    pub fn in_features(&self) -> usize {
        self.in_features
    }

    pub fn bottleneck_size(&self) -> usize {
        self.bottleneck_size
    }

    /// Effective ratio between input width and bottleneck width.
    pub fn reduction_factor(&self) -> f64 {
        self.in_features as f64 / self.bottleneck_size as f64
    }

    pub fn placement(&self) -> Placement {
        self.placement
    }
}

impl Module for BottleneckAdapter {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let hidden = xs
            .apply(&self.adapter_down)?
            .apply(&self.non_linearity)?
            .apply(&self.adapter_up)?;
        if (self.scaling - 1.0).abs() > f64::EPSILON {
            hidden.affine(self.scaling, 0.0)
        } else {
            Ok(hidden)
        }
    }
}

impl Compose for BottleneckAdapter {
    fn compose(&self, _name: &str, state: &mut HookState, _ctx: &ForwardContext) -> Result<()> {
        let HookState::Residual {
            input,
            output,
            delta,
        } = state
        else {
            return Ok(());
        };
        let source = match self.placement {
            Placement::Sequential => &*output,
            Placement::Parallel => &*input,
        };
        let contribution = self.forward(source)?;
        *delta = Some(match delta.take() {
            Some(acc) => acc.add(&contribution)?,
            None => contribution,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn adapter(placement: Placement, scaling: f64) -> BottleneckAdapter {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        BottleneckAdapter::new(16, 4, NonLinearity::Relu, scaling, placement, vb.pp("a")).unwrap()
    }

    #[test]
    fn test_shapes_and_reduction_factor() {
        let a = adapter(Placement::Sequential, 1.0);
        assert_eq!(a.in_features(), 16);
        assert_eq!(a.bottleneck_size(), 4);
        assert_eq!(a.reduction_factor(), 4.0);

        let x = Tensor::randn(0f32, 1.0, (2, 3, 16), &Device::Cpu).unwrap();
        assert_eq!(a.forward(&x).unwrap().dims(), &[2, 3, 16]);
    }

    #[test]
    fn test_parameters_are_registered_under_prefix() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let _a = BottleneckAdapter::new(8, 2, NonLinearity::Relu, 1.0, Placement::Sequential, vb.pp("x.adapters.t"))
            .unwrap();
        let data = varmap.data().lock().unwrap();
        let mut names: Vec<&String> = data.keys().collect();
        names.sort();
        assert_eq!(
            names,
            vec![
                "x.adapters.t.adapter_down.bias",
                "x.adapters.t.adapter_down.weight",
                "x.adapters.t.adapter_up.bias",
                "x.adapters.t.adapter_up.weight",
            ]
        );
    }

    #[test]
    fn test_parallel_reads_input_sequential_reads_output() {
        let device = Device::Cpu;
        let input = Tensor::randn(0f32, 1.0, (1, 2, 16), &device).unwrap();
        let output = Tensor::randn(0f32, 1.0, (1, 2, 16), &device).unwrap();
        let ctx = ForwardContext::default();

        for placement in [Placement::Sequential, Placement::Parallel] {
            let a = adapter(placement, 2.0);
            let mut state = HookState::Residual {
                input: input.clone(),
                output: output.clone(),
                delta: None,
            };
            a.compose("a", &mut state, &ctx).unwrap();
            let HookState::Residual { delta, .. } = state else {
                unreachable!()
            };
            let source = match placement {
                Placement::Sequential => &output,
                Placement::Parallel => &input,
            };
            let expected = a.forward(source).unwrap();
            let diff: f32 = (delta.unwrap() - expected)
                .unwrap()
                .abs()
                .unwrap()
                .sum_all()
                .unwrap()
                .to_scalar()
                .unwrap();
            assert_eq!(diff, 0.0);
        }
    }

    #[test]
    fn test_contributions_are_summed() {
        let device = Device::Cpu;
        let x = Tensor::randn(0f32, 1.0, (1, 2, 16), &device).unwrap();
        let a = adapter(Placement::Sequential, 1.0);
        let b = adapter(Placement::Sequential, 1.0);
        let ctx = ForwardContext::default();
        let mut state = HookState::Residual {
            input: x.clone(),
            output: x.clone(),
            delta: None,
        };
        a.compose("a", &mut state, &ctx).unwrap();
        b.compose("b", &mut state, &ctx).unwrap();

        let HookState::Residual { delta, .. } = state else {
            unreachable!()
        };
        let expected = (a.forward(&x).unwrap() + b.forward(&x).unwrap()).unwrap();
        let diff: f32 = (delta.unwrap() - expected)
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(diff < 1e-5);
    }
}
