pub mod checkpoint;
pub mod dap;
pub mod fusion;
pub mod rigid;
