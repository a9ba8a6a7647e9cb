//! One Evoformer block (Algorithm 6, lines 2-3 plus the core).
use super::evoformer_block_core::EvoformerBlockCore;
use crate::config::{EvoformerBlockConfig, FusionConfig};
use crate::error::ConfigError;
use crate::layers::dropout::{Mode, SharedDropout};
use crate::layers::msa_attention::{MsaColumnAttention, MsaRowAttentionWithPairBias};
use crate::utils::dap::ParallelContext;
use candle_core::{bail, Result, Tensor};
use candle_nn::VarBuilder;

#[derive(Debug, Clone)]
pub struct EvoformerBlock {
    msa_att_row: MsaRowAttentionWithPairBias,
    msa_att_col: MsaColumnAttention,
    msa_dropout_row: SharedDropout,
    core: EvoformerBlockCore,
    config: EvoformerBlockConfig,
}

impl EvoformerBlock {
    pub fn load(vb: VarBuilder, config: &EvoformerBlockConfig, fusion: FusionConfig) -> Result<Self> {
        config.validate()?;
        let msa_att_row = MsaRowAttentionWithPairBias::load(
            vb.pp("msa_att_row"),
            config.c_m,
            config.c_z,
            config.c_hidden_msa_att,
            config.num_heads_msa,
            config.inf,
        )?;
        let msa_att_col = MsaColumnAttention::load(
            vb.pp("msa_att_col"),
            config.c_m,
            config.c_hidden_msa_att,
            config.num_heads_msa,
            config.inf,
        )?;
        let msa_dropout_row = SharedDropout::rowwise(config.msa_dropout, fusion)?;
        let core = EvoformerBlockCore::load(vb.pp("core"), config, fusion)?;
        Ok(Self {
            msa_att_row,
            msa_att_col,
            msa_dropout_row,
            core,
            config: config.clone(),
        })
    }

    pub fn config(&self) -> &EvoformerBlockConfig {
        &self.config
    }

    /// Checks the local shards against the full masks before any compute.
    ///
    /// `m` is `[b, S / n, R, c_m]`, `z` `[b, R / n, R, c_z]`, `msa_mask`
    /// `[b, S, R]` and `pair_mask` `[b, R, R]` for a group of size `n`.
    fn check_shapes(
        &self,
        m: &Tensor,
        z: &Tensor,
        msa_mask: &Tensor,
        pair_mask: &Tensor,
        ctx: &dyn ParallelContext,
    ) -> Result<()> {
        let n = ctx.size();
        let (b, s_local, r, c_m) = m.dims4()?;
        let (bz, r_local, rz, c_z) = z.dims4()?;
        let (bm, s, rm) = msa_mask.dims3()?;
        let (bp, rp1, rp2) = pair_mask.dims3()?;
        if c_m != self.config.c_m || c_z != self.config.c_z {
            bail!(
                "evoformer block: expected c_m={} c_z={}, got m {:?} z {:?}",
                self.config.c_m,
                self.config.c_z,
                m.dims(),
                z.dims()
            )
        }
        if s % n != 0 {
            return Err(ConfigError::IndivisibleShard {
                axis: "N_seq",
                size: s,
                group_size: n,
            }
            .into());
        }
        if r % n != 0 {
            return Err(ConfigError::IndivisibleShard {
                axis: "N_res",
                size: r,
                group_size: n,
            }
            .into());
        }
        let consistent = [bz, bm, bp].iter().all(|&x| x == b)
            && s_local * n == s
            && r_local * n == r
            && [rz, rm, rp1, rp2].iter().all(|&x| x == r);
        if !consistent {
            bail!(
                "evoformer block: size mismatch between m {:?}, z {:?}, msa_mask {:?}, pair_mask {:?} (group size {n})",
                m.dims(),
                z.dims(),
                msa_mask.dims(),
                pair_mask.dims()
            )
        }
        Ok(())
    }

    /// Updates row-sharded `(m, z)`; both are returned row-sharded.
    ///
    /// Masks are passed unsharded and resharded here for each stage. Outside
    /// of DAP every shard is the full tensor.
    pub fn forward(
        &self,
        m: &Tensor,
        z: &Tensor,
        msa_mask: &Tensor,
        pair_mask: &Tensor,
        ctx: &dyn ParallelContext,
        mode: Mode,
    ) -> Result<(Tensor, Tensor)> {
        self.check_shapes(m, z, msa_mask, pair_mask, ctx)?;
        let msa_mask = msa_mask.to_dtype(m.dtype())?;
        let pair_mask = pair_mask.to_dtype(z.dtype())?;
        let (msa_mask_row, msa_mask_col) = if ctx.is_active() {
            (ctx.scatter(&msa_mask, 1)?, ctx.scatter(&msa_mask, 2)?)
        } else {
            (msa_mask.clone(), msa_mask.clone())
        };

        let update = self.msa_att_row.forward(m, z, &msa_mask_row, ctx)?;
        let m = self
            .msa_dropout_row
            .forward(&update, m, ctx, None, mode.fork(0))?;

        let m = ctx.row_to_col(&m)?;
        let m = self.msa_att_col.forward(&m, &msa_mask_col)?;

        self.core
            .forward(&m, z, &msa_mask, &pair_mask, ctx, mode.fork(1))
    }
}
