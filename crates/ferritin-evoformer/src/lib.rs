//! ferritin-evoformer
//!
//! The Evoformer stack and Invariant Point Attention of
//! [AlphaFold 2](https://www.nature.com/articles/s41586-021-03819-2),
//! following the module layout of [OpenFold](https://github.com/aqlaboratory/openfold)
//! and the dynamic axial parallelism of [FastFold](https://github.com/hpcaitech/FastFold).
//!
//! ```ignore
//! use candle_core::{DType, Device};
//! use candle_nn::{VarBuilder, VarMap};
//! use ferritin_evoformer::{EvoformerStack, EvoformerStackConfig, FusionConfig, Mode, SingleProcess};
//!
//! let varmap = VarMap::new();
//! let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
//! let stack = EvoformerStack::load(vb, &EvoformerStackConfig::default(), FusionConfig::default())?;
//! let (m, z, s) = stack.forward(&m, &z, &msa_mask, &pair_mask, &SingleProcess, Mode::Inference)?;
//! ```
pub use config::{EvoformerBlockConfig, EvoformerStackConfig, FusionConfig, IpaConfig};
pub use error::ConfigError;
pub use layers::dropout::{Mode, SharedDropout};
pub use models::evoformer_block::EvoformerBlock;
pub use models::evoformer_block_core::EvoformerBlockCore;
pub use models::evoformer_stack::EvoformerStack;
pub use models::invariant_point_attention::InvariantPointAttention;
pub use utils::checkpoint::{RecomputeGrads, RecomputeTape};
pub use utils::dap::{ParallelContext, SingleProcess, ThreadGroup};
pub use utils::fusion::Kernel;
pub use utils::rigid::{Rigid, RotationError, RotationMatrix};

pub mod config;
pub mod error;
pub mod layers;
pub mod models;
pub mod utils;

use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::{Device, Result};

/// Picks an accelerator when one is compiled in and available.
pub fn device(cpu: bool) -> Result<Device> {
    if cpu {
        Ok(Device::Cpu)
    } else if cuda_is_available() {
        Ok(Device::new_cuda(0)?)
    } else if metal_is_available() {
        Ok(Device::new_metal(0)?)
    } else {
        tracing::info!("no accelerator available, running on CPU");
        Ok(Device::Cpu)
    }
}
