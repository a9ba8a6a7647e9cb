//! Dropout with a mask shared along chosen axes.
//!
//! Supplementary '1.11.6 Dropout details'. The mask is sampled once per call
//! with the shared axes collapsed to length 1 and broadcast back, so whole
//! rows (or columns) of the update are kept or dropped together. The result is
//! always added onto a residual: `add_output_to + x * mask`.
use crate::config::FusionConfig;
use crate::error::ConfigError;
use crate::utils::dap::ParallelContext;
use crate::utils::fusion::{mul_add, Kernel};
use candle_core::shape::Dim;
use candle_core::{bail, Result, Tensor, D};
use rand::{rngs::StdRng, Rng, SeedableRng};

/// Forward-pass mode.
///
/// Training carries a seed from which every dropout site derives its own
/// stream, so a replayed forward pass (recomputation) or another DAP rank
/// driven with the same seed samples identical masks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Inference,
    Training { seed: u64 },
}

impl Mode {
    pub fn is_training(&self) -> bool {
        matches!(self, Mode::Training { .. })
    }

    /// Derives an independent mode for sub-module `stream`.
    pub fn fork(&self, stream: u64) -> Mode {
        match *self {
            Mode::Inference => Mode::Inference,
            Mode::Training { seed } => Mode::Training {
                seed: splitmix64(seed ^ splitmix64(stream)),
            },
        }
    }
}

fn splitmix64(x: u64) -> u64 {
    let mut z = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

#[derive(Debug, Clone)]
pub struct SharedDropout {
    p: f64,
    share_axes: Vec<D>,
    fusion: FusionConfig,
}

impl SharedDropout {
    pub fn new(p: f64, share_axes: Vec<D>, fusion: FusionConfig) -> std::result::Result<Self, ConfigError> {
        if !(0.0..=1.0).contains(&p) {
            return Err(ConfigError::InvalidProbability {
                name: "dropout",
                value: p,
            });
        }
        Ok(Self {
            p,
            share_axes,
            fusion,
        })
    }

    /// Shares the mask across the sequence axis of `[*, N_seq, N_res, C]`.
    pub fn rowwise(p: f64, fusion: FusionConfig) -> std::result::Result<Self, ConfigError> {
        Self::new(p, vec![D::Minus(3)], fusion)
    }

    /// Shares the mask across the residue axis of `[*, N_seq, N_res, C]`.
    pub fn columnwise(p: f64, fusion: FusionConfig) -> std::result::Result<Self, ConfigError> {
        Self::new(p, vec![D::Minus2], fusion)
    }

    pub fn p(&self) -> f64 {
        self.p
    }

    /// Mask shape: `x`'s shape with the shared axes set to 1 and, if given,
    /// the DAP-scattered axis widened back to its global size.
    fn mask_shape(
        &self,
        x: &Tensor,
        ctx: &dyn ParallelContext,
        scattered_axis: Option<usize>,
    ) -> Result<Vec<usize>> {
        let mut shape = x.dims().to_vec();
        for axis in self.share_axes.iter() {
            let idx = axis.to_index(x.shape(), "shared-dropout")?;
            shape[idx] = 1;
        }
        if let Some(axis) = scattered_axis {
            if axis >= shape.len() {
                bail!("scattered axis {axis} out of range for rank {}", shape.len())
            }
            shape[axis] *= ctx.size();
        }
        Ok(shape)
    }

    fn sample_mask(&self, x: &Tensor, shape: &[usize], seed: u64) -> Result<Tensor> {
        if self.p >= 1.0 {
            return Tensor::zeros(shape, x.dtype(), x.device());
        }
        let scale = (1.0 / (1.0 - self.p)) as f32;
        let mut rng = StdRng::seed_from_u64(seed);
        let numel = shape.iter().product::<usize>();
        let values: Vec<f32> = (0..numel)
            .map(|_| {
                if rng.gen::<f64>() >= self.p {
                    scale
                } else {
                    0.0
                }
            })
            .collect();
        Tensor::from_vec(values, shape, x.device())?.to_dtype(x.dtype())
    }

    /// Returns `add_output_to + x * mask`.
    ///
    /// In [`Mode::Inference`] the mask is the identity and the
    /// result is exactly `add_output_to + x`. `scattered_axis` names the axis
    /// of `x` that is sharded across `ctx`; the mask is then sampled at the
    /// global size and scattered the same way.
    pub fn forward(
        &self,
        x: &Tensor,
        add_output_to: &Tensor,
        ctx: &dyn ParallelContext,
        scattered_axis: Option<usize>,
        mode: Mode,
    ) -> Result<Tensor> {
        if x.dims() != add_output_to.dims() {
            bail!(
                "shared-dropout: x {:?} and add_output_to {:?} differ in shape",
                x.dims(),
                add_output_to.dims()
            )
        }
        let seed = match mode {
            Mode::Inference => return add_output_to.add(x),
            Mode::Training { seed } => seed,
        };
        let shape = self.mask_shape(x, ctx, scattered_axis)?;
        let mut mask = self.sample_mask(x, &shape, seed)?;
        if let Some(axis) = scattered_axis {
            mask = ctx.scatter(&mask, axis)?;
        }
        let kernel = Kernel::select_mul_add(x.device(), ctx.size(), &self.fusion);
        mul_add(kernel, x, &mask, add_output_to)
    }
}
