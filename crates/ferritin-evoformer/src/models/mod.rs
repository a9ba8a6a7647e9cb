pub mod evoformer_block;
pub mod evoformer_block_core;
pub mod evoformer_stack;
pub mod invariant_point_attention;
