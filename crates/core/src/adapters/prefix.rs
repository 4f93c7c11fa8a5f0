//! Prefix tuning: learned key/value prefixes for self-attention.
//!
//! A prefix pool produces a single `[prefix_length, num_layers * 2 * hidden]`
//! tensor per forward pass. Each layer's [`PrefixShim`] slices its keys and
//! values out of that tensor and hands them to the attention block, which
//! concatenates them ahead of the base sequence.

use candle_core::{Result, Tensor, Var};
use candle_nn::{embedding, init, linear, Embedding, Linear, VarBuilder};

use super::config::{NonLinearity, PrefixTuningConfig};
use super::context::ForwardContext;
use super::injection::{Compose, HookState, HostDims};

/// Shape of the prefix states shared by the pool and its per-layer shims.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrefixGeometry {
    pub prefix_length: usize,
    pub num_layers: usize,
    pub num_heads: usize,
    pub head_dim: usize,
}

impl PrefixGeometry {
    pub fn new(prefix_length: usize, dims: &HostDims) -> Self {
        Self {
            prefix_length,
            num_layers: dims.num_layers,
            num_heads: dims.num_heads,
            head_dim: dims.head_dim(),
        }
    }

    pub fn hidden_size(&self) -> usize {
        self.num_heads * self.head_dim
    }

    /// Width of one row of the pooled prefix states.
    pub fn state_width(&self) -> usize {
        self.num_layers * 2 * self.hidden_size()
    }
}

enum PrefixEncoder {
    /// Embedding followed by a two-layer MLP.
    Reparameterized {
        wte: Embedding,
        control_trans_in: Linear,
        control_trans_out: Linear,
        non_linearity: NonLinearity,
    },
    /// States stored directly as a parameter.
    Flat { control_trans: Tensor },
}

/// Prefix generator owned by one adapter.
pub struct PrefixTuning {
    encoder: PrefixEncoder,
    geometry: PrefixGeometry,
}

impl PrefixTuning {
    /// Build the pool under `vb`, which should already be scoped to
    /// `prefix_tunings.{name}`.
    pub fn new(cfg: &PrefixTuningConfig, dims: &HostDims, vb: VarBuilder) -> Result<Self> {
        let geometry = PrefixGeometry::new(cfg.prefix_length, dims);
        let hidden = geometry.hidden_size();
        let encoder = if cfg.flat {
            let control_trans = vb.get_with_hints(
                (geometry.prefix_length, geometry.state_width()),
                "control_trans",
                init::Init::Randn {
                    mean: 0.0,
                    stdev: 0.02,
                },
            )?;
            PrefixEncoder::Flat { control_trans }
        } else {
            PrefixEncoder::Reparameterized {
                wte: embedding(geometry.prefix_length, hidden, vb.pp("wte"))?,
                control_trans_in: linear(hidden, cfg.bottleneck_size, vb.pp("control_trans.0"))?,
                control_trans_out: linear(
                    cfg.bottleneck_size,
                    geometry.state_width(),
                    vb.pp("control_trans.2"),
                )?,
                non_linearity: cfg.non_linearity,
            }
        };
        Ok(Self { encoder, geometry })
    }

    pub fn geometry(&self) -> PrefixGeometry {
        self.geometry
    }

    pub fn is_flat(&self) -> bool {
        matches!(self.encoder, PrefixEncoder::Flat { .. })
    }

    /// Pooled prefix states, `[prefix_length, num_layers * 2 * hidden]`.
    pub fn states(&self) -> Result<Tensor> {
        match &self.encoder {
            PrefixEncoder::Flat { control_trans } => Ok(control_trans.clone()),
            PrefixEncoder::Reparameterized {
                wte,
                control_trans_in,
                control_trans_out,
                non_linearity,
            } => wte
                .embeddings()
                .apply(control_trans_in)?
                .apply(non_linearity)?
                .apply(control_trans_out),
        }
    }

    /// Replace the generator MLP by its current output.
    ///
    /// Returns the new `control_trans` parameter so the caller can register
    /// it in the adapter's parameter set, or `None` if the pool was already
    /// flat.
    pub fn eject(&mut self) -> Result<Option<Var>> {
        if self.is_flat() {
            return Ok(None);
        }
        let states = self.states()?.detach();
        let control_trans = Var::from_tensor(&states)?;
        self.encoder = PrefixEncoder::Flat {
            control_trans: control_trans.as_tensor().clone(),
        };
        Ok(Some(control_trans))
    }
}

/// Per-layer view into an adapter's prefix pool.
#[derive(Debug, Clone)]
pub struct PrefixShim {
    layer_idx: usize,
    geometry: PrefixGeometry,
}

impl PrefixShim {
    pub fn new(layer_idx: usize, geometry: PrefixGeometry) -> Self {
        Self {
            layer_idx,
            geometry,
        }
    }

    pub fn prefix_length(&self) -> usize {
        self.geometry.prefix_length
    }

    /// Keys and values of this layer, each `[batch, heads, prefix_length, head_dim]`.
    pub fn key_values(&self, states: &Tensor, batch_size: usize) -> Result<(Tensor, Tensor)> {
        let g = &self.geometry;
        let per_layer = states
            .reshape((g.prefix_length, g.num_layers, 2, g.num_heads, g.head_dim))?
            .narrow(1, self.layer_idx, 1)?
            .squeeze(1)?;
        let expand = |t: Tensor| -> Result<Tensor> {
            t.squeeze(1)?
                .transpose(0, 1)?
                .unsqueeze(0)?
                .broadcast_as((batch_size, g.num_heads, g.prefix_length, g.head_dim))?
                .contiguous()
        };
        let keys = expand(per_layer.narrow(1, 0, 1)?)?;
        let values = expand(per_layer.narrow(1, 1, 1)?)?;
        Ok((keys, values))
    }
}

impl Compose for PrefixShim {
    fn compose(&self, name: &str, state: &mut HookState, ctx: &ForwardContext) -> Result<()> {
        let HookState::KeyValue { keys, values } = state else {
            return Ok(());
        };
        let Some(states) = ctx.prefix_states(name) else {
            return Ok(());
        };
        let (k, v) = self.key_values(states, ctx.batch_size())?;
        keys.push(k);
        values.push(v);
        Ok(())
    }
}
