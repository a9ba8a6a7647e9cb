//! Dynamic axial parallelism (DAP).
//!
//! A [`ParallelContext`] is threaded explicitly through every forward pass.
//! Block bodies operate on shards of the MSA / pair representations; the
//! collectives here move shards between ranks. Every rank of a group must
//! issue the same collectives in the same order, otherwise the group blocks
//! forever.
//!
//! - [`SingleProcess`] is the no-op context used outside of DAP.
//! - [`ThreadGroup`] runs one rank per thread and exchanges shards through a
//!   shared barrier-synchronized mailbox.
use candle_core::{bail, Result, Tensor};
use std::sync::{Arc, Barrier, Mutex};

pub trait ParallelContext: Send + Sync {
    /// Number of ranks in the group.
    fn size(&self) -> usize;

    /// This rank's index (0-based).
    fn rank(&self) -> usize;

    fn is_active(&self) -> bool {
        self.size() > 1
    }

    /// Keeps this rank's contiguous slice of `x` along `axis`. No communication.
    fn scatter(&self, x: &Tensor, axis: usize) -> Result<Tensor> {
        if !self.is_active() {
            return Ok(x.clone());
        }
        let dim = x.dim(axis)?;
        let chunk = shard_len(dim, self.size())?;
        x.narrow(axis, self.rank() * chunk, chunk)?.contiguous()
    }

    /// Concatenates the shards of every rank along `axis`, in rank order.
    fn gather(&self, x: &Tensor, axis: usize) -> Result<Tensor>;

    /// Reshards an MSA tensor `[batch, N_seq / n, N_res, c]` (row-sharded) into
    /// `[batch, N_seq, N_res / n, c]` (column-sharded).
    fn row_to_col(&self, x: &Tensor) -> Result<Tensor>;

    /// Inverse of [`ParallelContext::row_to_col`].
    fn col_to_row(&self, x: &Tensor) -> Result<Tensor>;
}

fn shard_len(dim: usize, size: usize) -> Result<usize> {
    if dim % size != 0 {
        bail!("cannot shard axis of size {dim} across a parallel group of {size}")
    }
    Ok(dim / size)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SingleProcess;

impl ParallelContext for SingleProcess {
    fn size(&self) -> usize {
        1
    }

    fn rank(&self) -> usize {
        0
    }

    fn gather(&self, x: &Tensor, _axis: usize) -> Result<Tensor> {
        Ok(x.clone())
    }

    fn row_to_col(&self, x: &Tensor) -> Result<Tensor> {
        Ok(x.clone())
    }

    fn col_to_row(&self, x: &Tensor) -> Result<Tensor> {
        Ok(x.clone())
    }
}

/// Mailbox shared by all ranks of a [`ThreadGroup`]: slot `src * size + dst`
/// holds the tensor rank `src` sends to rank `dst` during the current round.
#[derive(Debug)]
struct Exchange {
    barrier: Barrier,
    slots: Mutex<Vec<Option<Tensor>>>,
}

/// One rank of an in-process DAP group. Each rank must be driven by its own thread.
#[derive(Debug, Clone)]
pub struct ThreadGroup {
    rank_id: usize,
    world: usize,
    exchange: Arc<Exchange>,
}

impl ThreadGroup {
    /// Creates `world_size` contexts sharing one mailbox.
    pub fn new_group(world_size: usize) -> Vec<Self> {
        let exchange = Arc::new(Exchange {
            barrier: Barrier::new(world_size),
            slots: Mutex::new(vec![None; world_size * world_size]),
        });
        (0..world_size)
            .map(|rank_id| ThreadGroup {
                rank_id,
                world: world_size,
                exchange: exchange.clone(),
            })
            .collect()
    }

    /// Sends `parts[dst]` to rank `dst` and returns what every rank sent here,
    /// indexed by source rank.
    fn all_to_all(&self, parts: Vec<Tensor>) -> Result<Vec<Tensor>> {
        if parts.len() != self.world {
            bail!(
                "all_to_all expects {} parts, got {}",
                self.world,
                parts.len()
            )
        }
        {
            let mut slots = self
                .exchange
                .slots
                .lock()
                .map_err(|_| candle_core::Error::Msg("DAP exchange lock poisoned".into()))?;
            for (dst, part) in parts.into_iter().enumerate() {
                slots[self.rank_id * self.world + dst] = Some(part);
            }
        }
        self.exchange.barrier.wait();
        let received = {
            let mut slots = self
                .exchange
                .slots
                .lock()
                .map_err(|_| candle_core::Error::Msg("DAP exchange lock poisoned".into()))?;
            (0..self.world)
                .map(|src| {
                    slots[src * self.world + self.rank_id].take().ok_or_else(|| {
                        candle_core::Error::Msg(format!(
                            "rank {} received no shard from rank {src}",
                            self.rank_id
                        ))
                    })
                })
                .collect::<Result<Vec<_>>>()
        };
        // Nobody may start the next round before every rank drained this one.
        self.exchange.barrier.wait();
        received
    }

    fn split(x: &Tensor, axis: usize, parts: usize) -> Result<Vec<Tensor>> {
        let chunk = shard_len(x.dim(axis)?, parts)?;
        (0..parts)
            .map(|i| x.narrow(axis, i * chunk, chunk)?.contiguous())
            .collect()
    }
}

impl ParallelContext for ThreadGroup {
    fn size(&self) -> usize {
        self.world
    }

    fn rank(&self) -> usize {
        self.rank_id
    }

    fn gather(&self, x: &Tensor, axis: usize) -> Result<Tensor> {
        if !self.is_active() {
            return Ok(x.clone());
        }
        let shards = self.all_to_all(vec![x.clone(); self.world])?;
        Tensor::cat(&shards, axis)
    }

    fn row_to_col(&self, x: &Tensor) -> Result<Tensor> {
        if !self.is_active() {
            return Ok(x.clone());
        }
        let parts = Self::split(x, 2, self.world)?;
        let received = self.all_to_all(parts)?;
        Tensor::cat(&received, 1)
    }

    fn col_to_row(&self, x: &Tensor) -> Result<Tensor> {
        if !self.is_active() {
            return Ok(x.clone());
        }
        let parts = Self::split(x, 1, self.world)?;
        let received = self.all_to_all(parts)?;
        Tensor::cat(&received, 2)
    }
}
