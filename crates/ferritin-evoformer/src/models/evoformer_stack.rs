//! Stack of Evoformer blocks (Algorithm 6) followed by the projection of the
//! first MSA row into the single representation.
use super::evoformer_block::EvoformerBlock;
use crate::config::{EvoformerStackConfig, FusionConfig};
use crate::error::ConfigError;
use crate::layers::dropout::Mode;
use crate::layers::linear::Linear;
use crate::utils::checkpoint::RecomputeTape;
use crate::utils::dap::ParallelContext;
use candle_core::{Module, Result, Tensor};
use candle_nn::VarBuilder;

#[derive(Debug, Clone)]
pub struct EvoformerStack {
    blocks: Vec<EvoformerBlock>,
    linear: Linear,
    config: EvoformerStackConfig,
}

impl EvoformerStack {
    pub fn load(vb: VarBuilder, config: &EvoformerStackConfig, fusion: FusionConfig) -> Result<Self> {
        config.validate()?;
        let vb_blocks = vb.pp("blocks");
        let blocks = (0..config.num_blocks)
            .map(|i| EvoformerBlock::load(vb_blocks.pp(i), &config.block, fusion))
            .collect::<Result<Vec<_>>>()?;
        let linear = Linear::load(config.block.c_m, config.c_s, vb.pp("linear"))?;
        tracing::debug!(
            num_blocks = config.num_blocks,
            c_m = config.block.c_m,
            c_z = config.block.c_z,
            c_s = config.c_s,
            fused = fusion.enabled,
            "loaded evoformer stack"
        );
        Ok(Self {
            blocks,
            linear,
            config: config.clone(),
        })
    }

    pub fn config(&self) -> &EvoformerStackConfig {
        &self.config
    }

    pub fn blocks(&self) -> &[EvoformerBlock] {
        &self.blocks
    }

    fn scatter_inputs(
        &self,
        m: &Tensor,
        z: &Tensor,
        ctx: &dyn ParallelContext,
    ) -> Result<(Tensor, Tensor)> {
        if !ctx.is_active() {
            return Ok((m.clone(), z.clone()));
        }
        for (axis, size) in [("N_seq", m.dim(1)?), ("N_res", z.dim(1)?)] {
            if size % ctx.size() != 0 {
                return Err(ConfigError::IndivisibleShard {
                    axis,
                    size,
                    group_size: ctx.size(),
                }
                .into());
            }
        }
        tracing::info!(rank = ctx.rank(), size = ctx.size(), "evoformer: scattering inputs");
        Ok((ctx.scatter(m, 1)?, ctx.scatter(z, 1)?))
    }

    /// Gathers the block outputs and projects `m[:, 0]` to `s`.
    fn finish(&self, m: &Tensor, z: &Tensor, ctx: &dyn ParallelContext) -> Result<(Tensor, Tensor, Tensor)> {
        let (m, z) = if ctx.is_active() {
            tracing::info!(rank = ctx.rank(), size = ctx.size(), "evoformer: gathering outputs");
            (ctx.gather(m, 1)?, ctx.gather(z, 1)?)
        } else {
            (m.clone(), z.clone())
        };
        let s = self.linear.forward(&m.narrow(1, 0, 1)?.squeeze(1)?)?;
        Ok((m, z, s))
    }

    /// Runs every block keeping the whole autograd graph.
    ///
    /// # Arguments
    /// * `m` - `[b, N_seq, N_res, c_m]`
    /// * `z` - `[b, N_res, N_res, c_z]`
    /// * `msa_mask` - `[b, N_seq, N_res]`
    /// * `pair_mask` - `[b, N_res, N_res]`
    ///
    /// Returns `(m, z, s)` with `s` of shape `[b, N_res, c_s]`. Under an
    /// active DAP context every rank must call this with the same full inputs.
    pub fn forward(
        &self,
        m: &Tensor,
        z: &Tensor,
        msa_mask: &Tensor,
        pair_mask: &Tensor,
        ctx: &dyn ParallelContext,
        mode: Mode,
    ) -> Result<(Tensor, Tensor, Tensor)> {
        tracing::info!(blocks = self.blocks.len(), ?mode, "evoformer: direct forward");
        let (mut m, mut z) = self.scatter_inputs(m, z, ctx)?;
        for (i, block) in self.blocks.iter().enumerate() {
            tracing::trace!(block = i, m = ?m.dims(), z = ?z.dims(), "evoformer block");
            (m, z) = block.forward(&m, &z, msa_mask, pair_mask, ctx, mode.fork(i as u64))?;
        }
        self.finish(&m, &z, ctx)
    }

    /// Same outputs as [`EvoformerStack::forward`], but block activations are
    /// dropped after each block. The returned tape re-runs blocks on demand to
    /// back-propagate gradients w.r.t. the block outputs `(m, z)`.
    #[allow(clippy::type_complexity)]
    pub fn forward_with_recompute<'a>(
        &'a self,
        m: &Tensor,
        z: &Tensor,
        msa_mask: &Tensor,
        pair_mask: &Tensor,
        ctx: &'a dyn ParallelContext,
        mode: Mode,
    ) -> Result<(
        (Tensor, Tensor, Tensor),
        RecomputeTape<impl Fn(usize, &Tensor, &Tensor) -> Result<(Tensor, Tensor)> + 'a>,
    )> {
        tracing::info!(blocks = self.blocks.len(), ?mode, "evoformer: forward with recomputation");
        let (msa_mask, pair_mask) = (msa_mask.clone(), pair_mask.clone());
        let step = move |i: usize, m: &Tensor, z: &Tensor| -> Result<(Tensor, Tensor)> {
            self.blocks[i].forward(m, z, &msa_mask, &pair_mask, ctx, mode.fork(i as u64))
        };
        let mut tape = RecomputeTape::new(step).distributed(ctx.is_active());
        let (mut m, mut z) = self.scatter_inputs(m, z, ctx)?;
        for i in 0..self.blocks.len() {
            tracing::trace!(block = i, m = ?m.dims(), z = ?z.dims(), "evoformer block (recompute)");
            (m, z) = tape.run(&m, &z)?;
        }
        Ok((self.finish(&m, &z, ctx)?, tape))
    }
}
