#![allow(dead_code)]
use candle_core::{DType, Device, Result, Tensor};
use ferritin_evoformer::{EvoformerBlockConfig, EvoformerStackConfig};
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn small_block_config() -> EvoformerBlockConfig {
    EvoformerBlockConfig {
        c_m: 16,
        c_z: 8,
        c_hidden_msa_att: 4,
        c_hidden_opm: 4,
        c_hidden_tri_mul: 8,
        c_hidden_tri_att: 4,
        num_heads_msa: 2,
        num_heads_tri: 2,
        transition_n: 2,
        ..Default::default()
    }
}

pub fn small_stack_config(num_blocks: usize) -> EvoformerStackConfig {
    EvoformerStackConfig {
        block: small_block_config(),
        c_s: 12,
        num_blocks,
    }
}

/// Random `(m, z)` plus all-ones masks.
pub fn evoformer_inputs(
    batch: usize,
    n_seq: usize,
    n_res: usize,
    config: &EvoformerBlockConfig,
    dev: &Device,
) -> Result<(Tensor, Tensor, Tensor, Tensor)> {
    let m = Tensor::randn(0f32, 1., (batch, n_seq, n_res, config.c_m), dev)?;
    let z = Tensor::randn(0f32, 1., (batch, n_res, n_res, config.c_z), dev)?;
    let msa_mask = Tensor::ones((batch, n_seq, n_res), DType::F32, dev)?;
    let pair_mask = Tensor::ones((batch, n_res, n_res), DType::F32, dev)?;
    Ok((m, z, msa_mask, pair_mask))
}

pub fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
    (a - b)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()
}

pub fn all_finite(t: &Tensor) -> Result<bool> {
    Ok(t
        .flatten_all()?
        .to_dtype(DType::F32)?
        .to_vec1::<f32>()?
        .iter()
        .all(|v| v.is_finite()))
}

/// Element-wise comparison with a tolerance scaled by the magnitude of `expected`.
pub fn assert_close(actual: &Tensor, expected: &Tensor, tol: f32, what: &str) -> Result<()> {
    assert_eq!(actual.dims(), expected.dims(), "{what}: shape");
    let a = actual.flatten_all()?.to_vec1::<f32>()?;
    let e = expected.flatten_all()?.to_vec1::<f32>()?;
    for (i, (x, y)) in a.iter().zip(e.iter()).enumerate() {
        assert!(
            (x - y).abs() <= tol * (1. + y.abs()),
            "{what}: mismatch at {i}: {x} vs {y} (tolerance {tol})"
        );
    }
    Ok(())
}
