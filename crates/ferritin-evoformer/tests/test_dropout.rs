use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use ferritin_evoformer::layers::dropout::SharedDropout;
use ferritin_evoformer::{ConfigError, FusionConfig, Mode, ParallelContext, SingleProcess, ThreadGroup};

mod common;
use common::max_abs_diff;

fn inputs(dev: &Device) -> Result<(Tensor, Tensor)> {
    let x = Tensor::randn(0f32, 1., (2, 4, 8, 6), dev)?;
    let y = Tensor::randn(0f32, 1., (2, 4, 8, 6), dev)?;
    Ok((x, y))
}

#[test]
fn test_zero_probability_is_plain_residual() -> Result<()> {
    let dev = Device::Cpu;
    let (x, y) = inputs(&dev)?;
    let expected = (&y + &x)?;
    for enabled in [true, false] {
        let dropout = SharedDropout::rowwise(0.0, FusionConfig { enabled })?;
        let out = dropout.forward(&x, &y, &SingleProcess, None, Mode::Training { seed: 7 })?;
        assert_eq!(max_abs_diff(&out, &expected)?, 0.0);
    }
    Ok(())
}

#[test]
fn test_unit_probability_drops_everything() -> Result<()> {
    let dev = Device::Cpu;
    let (x, y) = inputs(&dev)?;
    for dropout in [
        SharedDropout::rowwise(1.0, FusionConfig::default())?,
        SharedDropout::columnwise(1.0, FusionConfig::default())?,
    ] {
        let out = dropout.forward(&x, &y, &SingleProcess, None, Mode::Training { seed: 3 })?;
        assert_eq!(max_abs_diff(&out, &y)?, 0.0);
    }
    Ok(())
}

#[test]
fn test_inference_ignores_probability() -> Result<()> {
    let dev = Device::Cpu;
    let (x, y) = inputs(&dev)?;
    let expected = (&y + &x)?;
    for p in [0.0, 0.3, 0.9, 1.0] {
        let dropout = SharedDropout::rowwise(p, FusionConfig::default())?;
        let out = dropout.forward(&x, &y, &SingleProcess, None, Mode::Inference)?;
        assert_eq!(max_abs_diff(&out, &expected)?, 0.0, "p = {p}");
    }
    Ok(())
}

#[test]
fn test_rowwise_mask_is_shared_across_sequences() -> Result<()> {
    let dev = Device::Cpu;
    let x = Tensor::ones((1, 4, 8, 6), DType::F32, &dev)?;
    let y = x.zeros_like()?;
    let dropout = SharedDropout::rowwise(0.5, FusionConfig::default())?;
    let out = dropout.forward(&x, &y, &SingleProcess, None, Mode::Training { seed: 11 })?;

    let values = out.flatten_all()?.to_vec1::<f32>()?;
    assert!(values.iter().all(|&v| v == 0.0 || v == 2.0), "values must be 0 or 1/(1-p)");
    assert!(values.iter().any(|&v| v == 0.0) && values.iter().any(|&v| v == 2.0));

    let first = out.narrow(1, 0, 1)?;
    for s in 1..4 {
        let row = out.narrow(1, s, 1)?;
        assert_eq!(max_abs_diff(&row, &first)?, 0.0, "sequence {s} has its own mask");
    }
    Ok(())
}

#[test]
fn test_columnwise_mask_is_shared_across_residues() -> Result<()> {
    let dev = Device::Cpu;
    let x = Tensor::ones((1, 4, 8, 6), DType::F32, &dev)?;
    let y = x.zeros_like()?;
    let dropout = SharedDropout::columnwise(0.5, FusionConfig::default())?;
    let out = dropout.forward(&x, &y, &SingleProcess, None, Mode::Training { seed: 5 })?;
    let first = out.narrow(2, 0, 1)?;
    for r in 1..8 {
        assert_eq!(max_abs_diff(&out.narrow(2, r, 1)?, &first)?, 0.0);
    }
    Ok(())
}

#[test]
fn test_masks_follow_the_seed() -> Result<()> {
    let dev = Device::Cpu;
    let (x, y) = inputs(&dev)?;
    let dropout = SharedDropout::rowwise(0.5, FusionConfig::default())?;
    let a = dropout.forward(&x, &y, &SingleProcess, None, Mode::Training { seed: 1 })?;
    let b = dropout.forward(&x, &y, &SingleProcess, None, Mode::Training { seed: 1 })?;
    let c = dropout.forward(&x, &y, &SingleProcess, None, Mode::Training { seed: 2 })?;
    assert_eq!(max_abs_diff(&a, &b)?, 0.0);
    assert!(max_abs_diff(&a, &c)? > 0.0);
    Ok(())
}

#[test]
fn test_sharded_axis_gets_the_global_mask() -> Result<()> {
    let dev = Device::Cpu;
    let (x, y) = inputs(&dev)?;
    let dropout = SharedDropout::rowwise(0.5, FusionConfig::default())?;
    let mode = Mode::Training { seed: 42 };
    let full = dropout.forward(&x, &y, &SingleProcess, None, mode)?;

    // scatter needs no communication, so the ranks can be driven from one thread
    for ctx in ThreadGroup::new_group(2) {
        let x_shard = ctx.scatter(&x, 2)?;
        let y_shard = ctx.scatter(&y, 2)?;
        let out = dropout.forward(&x_shard, &y_shard, &ctx, Some(2), mode)?;
        let expected = ctx.scatter(&full, 2)?;
        assert_eq!(max_abs_diff(&out, &expected)?, 0.0, "rank {}", ctx.rank());
    }
    Ok(())
}

#[test]
fn test_invalid_probability_is_rejected() {
    let err = SharedDropout::rowwise(1.5, FusionConfig::default()).unwrap_err();
    assert_eq!(
        err,
        ConfigError::InvalidProbability {
            name: "dropout",
            value: 1.5
        }
    );
    assert!(SharedDropout::columnwise(-0.1, FusionConfig::default()).is_err());
}
