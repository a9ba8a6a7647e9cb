use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use ferritin_evoformer::{
    EvoformerBlock, EvoformerStack, EvoformerStackConfig, FusionConfig, Mode, SingleProcess,
    ThreadGroup,
};

mod common;
use common::{all_finite, evoformer_inputs, max_abs_diff, small_block_config, small_stack_config};

#[test]
fn test_single_block_keeps_shapes_and_stays_finite() -> Result<()> {
    common::init_tracing();
    let dev = Device::Cpu;
    let config = small_block_config();
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
    let block = EvoformerBlock::load(vb.pp("block"), &config, FusionConfig::default())?;

    let (m, z, msa_mask, pair_mask) = evoformer_inputs(1, 4, 8, &config, &dev)?;
    let (m_out, z_out) = block.forward(&m, &z, &msa_mask, &pair_mask, &SingleProcess, Mode::Inference)?;
    assert_eq!(m_out.dims(), &[1, 4, 8, 16]);
    assert_eq!(z_out.dims(), &[1, 8, 8, 8]);
    assert!(all_finite(&m_out)?);
    assert!(all_finite(&z_out)?);
    assert!(max_abs_diff(&m_out, &m)? > 0.0, "block left m untouched");
    Ok(())
}

#[test]
fn test_training_mode_is_seed_deterministic() -> Result<()> {
    let dev = Device::Cpu;
    let config = small_block_config();
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
    let block = EvoformerBlock::load(vb, &config, FusionConfig::default())?;
    let (m, z, msa_mask, pair_mask) = evoformer_inputs(1, 4, 8, &config, &dev)?;

    let run = |mode| block.forward(&m, &z, &msa_mask, &pair_mask, &SingleProcess, mode);
    let (m1, z1) = run(Mode::Training { seed: 9 })?;
    let (m2, z2) = run(Mode::Training { seed: 9 })?;
    let (m3, _) = run(Mode::Inference)?;
    assert_eq!(max_abs_diff(&m1, &m2)?, 0.0);
    assert_eq!(max_abs_diff(&z1, &z2)?, 0.0);
    assert!(max_abs_diff(&m1, &m3)? > 0.0, "dropout had no effect in training mode");
    assert!(all_finite(&z1)?);
    Ok(())
}

#[test]
fn test_partial_masks_stay_finite() -> Result<()> {
    let dev = Device::Cpu;
    let config = small_block_config();
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
    let block = EvoformerBlock::load(vb, &config, FusionConfig::default())?;
    let (m, z, _, _) = evoformer_inputs(1, 4, 6, &config, &dev)?;
    // last residue and last sequence padded out
    let res = Tensor::new(&[1f32, 1., 1., 1., 1., 0.], &dev)?;
    let seq = Tensor::new(&[1f32, 1., 1., 0.], &dev)?;
    let msa_mask = seq.unsqueeze(1)?.broadcast_mul(&res.unsqueeze(0)?)?.unsqueeze(0)?;
    let pair_mask = res.unsqueeze(1)?.broadcast_mul(&res.unsqueeze(0)?)?.unsqueeze(0)?;
    let (m_out, z_out) = block.forward(&m, &z, &msa_mask, &pair_mask, &SingleProcess, Mode::Inference)?;
    assert!(all_finite(&m_out)?);
    assert!(all_finite(&z_out)?);
    Ok(())
}

#[test]
fn test_stack_outputs_single_representation() -> Result<()> {
    let dev = Device::Cpu;
    let config = small_stack_config(2);
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
    let stack = EvoformerStack::load(vb, &config, FusionConfig::default())?;
    assert_eq!(stack.blocks().len(), 2);

    let (m, z, msa_mask, pair_mask) = evoformer_inputs(2, 4, 8, &config.block, &dev)?;
    let (m_out, z_out, s) = stack.forward(&m, &z, &msa_mask, &pair_mask, &SingleProcess, Mode::Inference)?;
    assert_eq!(m_out.dims(), m.dims());
    assert_eq!(z_out.dims(), z.dims());
    assert_eq!(s.dims(), &[2, 8, 12]);
    assert!(all_finite(&s)?);
    Ok(())
}

#[test]
fn test_mismatched_shapes_fail_fast() -> Result<()> {
    let dev = Device::Cpu;
    let config = small_block_config();
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
    let block = EvoformerBlock::load(vb, &config, FusionConfig::default())?;
    let (m, _, msa_mask, _) = evoformer_inputs(1, 4, 8, &config, &dev)?;
    let (_, z_short, _, pair_short) = evoformer_inputs(1, 4, 7, &config, &dev)?;

    let err = block
        .forward(&m, &z_short, &msa_mask, &pair_short, &SingleProcess, Mode::Inference)
        .unwrap_err();
    assert!(err.to_string().contains("size mismatch"), "{err}");

    let wide_m = Tensor::zeros((1, 4, 8, 17), DType::F32, &dev)?;
    let (_, z, _, pair_mask) = evoformer_inputs(1, 4, 8, &config, &dev)?;
    assert!(block
        .forward(&wide_m, &z, &msa_mask, &pair_mask, &SingleProcess, Mode::Inference)
        .is_err());
    Ok(())
}

#[test]
fn test_invalid_config_is_rejected_at_load() {
    let dev = Device::Cpu;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
    let mut config = small_stack_config(1);
    config.block.pair_dropout = 2.0;
    let err = EvoformerStack::load(vb, &config, FusionConfig::default()).unwrap_err();
    assert!(err.to_string().contains("pair_dropout"), "{err}");

    let json = r#"{"num_blocks": 0}"#;
    assert!(EvoformerStackConfig::from_json_str(json).is_err());
}

#[test]
fn test_indivisible_sequence_axis_is_reported() -> Result<()> {
    let dev = Device::Cpu;
    let config = small_stack_config(1);
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
    let stack = EvoformerStack::load(vb, &config, FusionConfig::default())?;
    let (m, z, msa_mask, pair_mask) = evoformer_inputs(1, 3, 8, &config.block, &dev)?;

    let group = ThreadGroup::new_group(2);
    let results: Vec<_> = std::thread::scope(|scope| {
        let handles: Vec<_> = group
            .iter()
            .map(|ctx| {
                let stack = &stack;
                let (m, z, msa_mask, pair_mask) = (&m, &z, &msa_mask, &pair_mask);
                scope.spawn(move || stack.forward(m, z, msa_mask, pair_mask, ctx, Mode::Inference))
            })
            .collect();
        handles.into_iter().map(|h| h.join().expect("rank panicked")).collect()
    });
    for result in results {
        let Err(err) = result else {
            panic!("3 sequences cannot be split across 2 ranks")
        };
        assert!(err.to_string().contains("N_seq"), "{err}");
    }
    Ok(())
}
