//! Invertible coupling adapters hooked at the embedding slot.
//!
//! The hidden vector is split in two halves `x1 | x2` and two small subnets
//! `F` and `G` are coupled so the transform can be undone exactly:
//!
//! ```text
//! nice:  y1 = x1 + F(x2)                 y2 = x2 + G(y1)
//! glow:  y1 = x1 * exp(s_F) + t_F        y2 = x2 * exp(s_G) + t_G
//! ```
//!
//! with `(s, t)` produced by the subnet and `s` squashed through `tanh`.
//! The forward direction runs on the embedding output, the inverse on the
//! input of an output head.

use candle_core::{Module, Result, Tensor, D};
use candle_nn::{linear, Linear, VarBuilder};

use super::config::{bottleneck_width, InvertibleConfig, InvertibleKind, NonLinearity};

struct CouplingNet {
    fc_in: Linear,
    fc_out: Linear,
    non_linearity: NonLinearity,
}

impl CouplingNet {
    fn new(
        in_dim: usize,
        hidden: usize,
        out_dim: usize,
        non_linearity: NonLinearity,
        vb: VarBuilder,
    ) -> Result<Self> {
        Ok(Self {
            fc_in: linear(in_dim, hidden, vb.pp("0"))?,
            fc_out: linear(hidden, out_dim, vb.pp("2"))?,
            non_linearity,
        })
    }
}

impl Module for CouplingNet {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        xs.apply(&self.fc_in)?
            .apply(&self.non_linearity)?
            .apply(&self.fc_out)
    }
}

pub struct InvertibleAdapter {
    kind: InvertibleKind,
    f: CouplingNet,
    g: CouplingNet,
    split: usize,
    hidden_size: usize,
}

impl InvertibleAdapter {
    /// Build under `vb`, which should already be scoped to
    /// `invertible_adapters.{name}`.
    pub fn new(hidden_size: usize, cfg: &InvertibleConfig, vb: VarBuilder) -> Result<Self> {
        let split = hidden_size / 2;
        let rest = hidden_size - split;
        let width = |in_dim: usize| {
            bottleneck_width(in_dim, cfg.reduction_factor)
                .map_err(|e| candle_core::Error::Msg(e.to_string()))
        };
        // glow subnets emit a (scale, shift) pair
        let out_mult = match cfg.kind {
            InvertibleKind::Nice => 1,
            InvertibleKind::Glow => 2,
        };
        let f = CouplingNet::new(rest, width(rest)?, split * out_mult, cfg.non_linearity, vb.pp("F"))?;
        let g = CouplingNet::new(split, width(split)?, rest * out_mult, cfg.non_linearity, vb.pp("G"))?;
        Ok(Self {
            kind: cfg.kind,
            f,
            g,
            split,
            hidden_size,
        })
    }

    pub fn kind(&self) -> InvertibleKind {
        self.kind
    }

    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    fn halves(&self, xs: &Tensor) -> Result<(Tensor, Tensor)> {
        let x1 = xs.narrow(D::Minus1, 0, self.split)?;
        let x2 = xs.narrow(D::Minus1, self.split, self.hidden_size - self.split)?;
        Ok((x1, x2))
    }

    /// `(exp(tanh(s)), t)` from a glow subnet output.
    fn scale_shift(out: &Tensor, width: usize) -> Result<(Tensor, Tensor)> {
        let scale = out.narrow(D::Minus1, 0, width)?.tanh()?.exp()?;
        let shift = out.narrow(D::Minus1, width, width)?;
        Ok((scale, shift))
    }

    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (x1, x2) = self.halves(xs)?;
        let rest = self.hidden_size - self.split;
        let (y1, y2) = match self.kind {
            InvertibleKind::Nice => {
                let y1 = (&x1 + self.f.forward(&x2)?)?;
                let y2 = (&x2 + self.g.forward(&y1)?)?;
                (y1, y2)
            }
            InvertibleKind::Glow => {
                let (s1, t1) = Self::scale_shift(&self.f.forward(&x2)?, self.split)?;
                let y1 = x1.mul(&s1)?.add(&t1)?;
                let (s2, t2) = Self::scale_shift(&self.g.forward(&y1)?, rest)?;
                let y2 = x2.mul(&s2)?.add(&t2)?;
                (y1, y2)
            }
        };
        Tensor::cat(&[&y1, &y2], D::Minus1)
    }

    pub fn inverse(&self, ys: &Tensor) -> Result<Tensor> {
        let (y1, y2) = self.halves(ys)?;
        let rest = self.hidden_size - self.split;
        let (x1, x2) = match self.kind {
            InvertibleKind::Nice => {
                let x2 = (&y2 - self.g.forward(&y1)?)?;
                let x1 = (&y1 - self.f.forward(&x2)?)?;
                (x1, x2)
            }
            InvertibleKind::Glow => {
                let (s2, t2) = Self::scale_shift(&self.g.forward(&y1)?, rest)?;
                let x2 = y2.sub(&t2)?.div(&s2)?;
                let (s1, t1) = Self::scale_shift(&self.f.forward(&x2)?, self.split)?;
                let x1 = y1.sub(&t1)?.div(&s1)?;
                (x1, x2)
            }
        };
        Tensor::cat(&[&x1, &x2], D::Minus1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar()
            .unwrap()
    }

    #[test]
    fn test_inverse_undoes_forward() {
        for kind in [InvertibleKind::Nice, InvertibleKind::Glow] {
            let varmap = VarMap::new();
            let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
            let cfg = InvertibleConfig {
                kind,
                ..InvertibleConfig::default()
            };
            let inv = InvertibleAdapter::new(16, &cfg, vb).unwrap();

            let x = Tensor::randn(0f32, 1.0, (2, 5, 16), &Device::Cpu).unwrap();
            let y = inv.forward(&x).unwrap();
            assert_eq!(y.dims(), x.dims());
            assert!(max_abs_diff(&x, &y) > 0.0);

            let back = inv.inverse(&y).unwrap();
            assert!(max_abs_diff(&x, &back) < 1e-4, "{kind:?} inverse diverged");
        }
    }

    #[test]
    fn test_odd_hidden_size_splits() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let inv = InvertibleAdapter::new(9, &InvertibleConfig::default(), vb).unwrap();
        let x = Tensor::randn(0f32, 1.0, (1, 2, 9), &Device::Cpu).unwrap();
        let back = inv.inverse(&inv.forward(&x).unwrap()).unwrap();
        assert!(max_abs_diff(&x, &back) < 1e-4);
    }

    #[test]
    fn test_parameter_names() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let _inv =
            InvertibleAdapter::new(8, &InvertibleConfig::default(), vb.pp("invertible_adapters.x"))
                .unwrap();
        let data = varmap.data().lock().unwrap();
        for sub in ["F.0", "F.2", "G.0", "G.2"] {
            for p in ["weight", "bias"] {
                let key = format!("invertible_adapters.x.{sub}.{p}");
                assert!(data.contains_key(&key), "missing {key}");
            }
        }
        assert_eq!(data.len(), 8);
    }
}
