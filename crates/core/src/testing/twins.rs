use candle_core::{DType, Device, Result, Tensor};

use crate::config::ModelConfig;
use crate::model::TransformerModel;

/// Two independent models over the same random base weights.
///
/// Adapters added to one do not affect the other, so an artifact saved from
/// the first can be loaded into the second and outputs compared exactly.
pub fn twin_models(cfg: &ModelConfig) -> Result<(TransformerModel, TransformerModel)> {
    let device = Device::Cpu;
    let first = TransformerModel::new(cfg, &device, DType::F32)?;
    let second =
        TransformerModel::from_weights(cfg, first.base_weights().clone(), &device, DType::F32)?;
    Ok((first, second))
}

/// Deterministic `[batch, seq_len]` token ids below the tiny vocabulary size.
pub fn sample_input_ids(batch: usize, seq_len: usize, device: &Device) -> Result<Tensor> {
    let vocab = super::tiny_config().vocab_size as u32;
    let ids: Vec<u32> = (0..(batch * seq_len) as u32)
        .map(|i| (i * 7 + 3) % vocab)
        .collect();
    Tensor::from_vec(ids, (batch, seq_len), device)
}

/// Largest absolute element-wise difference, as f32.
pub fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
    (a - b)?
        .abs()?
        .flatten_all()?
        .max(0)?
        .to_dtype(DType::F32)?
        .to_scalar::<f32>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_ids_are_deterministic() {
        let a = sample_input_ids(2, 3, &Device::Cpu).unwrap();
        let b = sample_input_ids(2, 3, &Device::Cpu).unwrap();
        assert_eq!(a.dims(), &[2, 3]);
        assert_eq!(
            a.to_vec2::<u32>().unwrap(),
            b.to_vec2::<u32>().unwrap()
        );
        assert_eq!(a.to_vec2::<u32>().unwrap()[0], vec![3, 10, 17]);
    }

    #[test]
    fn test_max_abs_diff_of_equal_tensors_is_zero() {
        let t = Tensor::new(&[1f32, -2.0, 3.5], &Device::Cpu).unwrap();
        assert_eq!(max_abs_diff(&t, &t).unwrap(), 0.0);
        let u = Tensor::new(&[1f32, 0.0, 3.0], &Device::Cpu).unwrap();
        assert_eq!(max_abs_diff(&t, &u).unwrap(), 2.0);
    }
}
