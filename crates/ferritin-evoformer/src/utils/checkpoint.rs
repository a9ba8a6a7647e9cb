//! Activation recomputation for a chain of `(m, z) -> (m, z)` steps.
//!
//! [`RecomputeTape::run`] evaluates a step on detached inputs, so none of its
//! intermediate activations outlive the call, and logs only the step inputs.
//! [`RecomputeTape::backward`] walks the log in reverse, re-materializes one
//! step at a time with a fresh graph and pulls the upstream gradient through
//! it. Replays must be deterministic: dropout draws its masks from the
//! [`Mode`](crate::layers::dropout::Mode) seed, not from global state.
use candle_core::{bail, Result, Tensor, Var};

/// Gradients returned by [`RecomputeTape::backward`].
#[derive(Debug)]
pub struct RecomputeGrads {
    /// Gradient w.r.t. the `m` fed to the first step.
    pub m: Tensor,
    /// Gradient w.r.t. the `z` fed to the first step.
    pub z: Tensor,
    /// Accumulated gradient per requested variable, `None` if a variable was
    /// not reached by any step.
    pub vars: Vec<Option<Tensor>>,
}

pub struct RecomputeTape<F>
where
    F: Fn(usize, &Tensor, &Tensor) -> Result<(Tensor, Tensor)>,
{
    step: F,
    inputs: Vec<(Tensor, Tensor)>,
    distributed: bool,
}

impl<F> RecomputeTape<F>
where
    F: Fn(usize, &Tensor, &Tensor) -> Result<(Tensor, Tensor)>,
{
    /// `step(i, m, z)` evaluates the `i`-th step of the chain.
    pub fn new(step: F) -> Self {
        Self {
            step,
            inputs: Vec::new(),
            distributed: false,
        }
    }

    /// Marks the tape as recorded under an active DAP group. Forward replay is
    /// still available; [`RecomputeTape::backward`] is not, since the local
    /// graph does not see gradient contributions of the other ranks.
    pub fn distributed(mut self, distributed: bool) -> Self {
        self.distributed = distributed;
        self
    }

    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }

    /// Runs the next step and returns its detached outputs.
    pub fn run(&mut self, m: &Tensor, z: &Tensor) -> Result<(Tensor, Tensor)> {
        let index = self.inputs.len();
        let (m, z) = (m.detach(), z.detach());
        let (m_out, z_out) = (self.step)(index, &m, &z)?;
        self.inputs.push((m, z));
        Ok((m_out.detach(), z_out.detach()))
    }

    /// Re-materializes step `index` from its logged inputs.
    pub fn replay(&self, index: usize) -> Result<(Tensor, Tensor)> {
        let Some((m, z)) = self.inputs.get(index) else {
            bail!("recompute: step {index} was never recorded ({} steps)", self.len())
        };
        (self.step)(index, m, z)
    }

    /// Back-propagates `grad_m` / `grad_z`, the gradients w.r.t. the outputs of
    /// the last step, to the inputs of the first step and to `vars`.
    pub fn backward(&self, grad_m: &Tensor, grad_z: &Tensor, vars: &[Var]) -> Result<RecomputeGrads> {
        if self.distributed {
            bail!("recompute: backward is only supported for tapes recorded outside of DAP")
        }
        let mut grad_m = grad_m.clone();
        let mut grad_z = grad_z.clone();
        let mut var_grads: Vec<Option<Tensor>> = vec![None; vars.len()];

        for (index, (m_in, z_in)) in self.inputs.iter().enumerate().rev() {
            tracing::trace!(step = index, "recompute: replaying step for backward");
            let m_var = Var::from_tensor(m_in)?;
            let z_var = Var::from_tensor(z_in)?;
            let (m_out, z_out) = (self.step)(index, m_var.as_tensor(), z_var.as_tensor())?;
            let surrogate = ((m_out * &grad_m)?.sum_all()? + (z_out * &grad_z)?.sum_all()?)?;
            let grads = surrogate.backward()?;

            grad_m = match grads.get(&m_var) {
                Some(g) => g.clone(),
                None => m_in.zeros_like()?,
            };
            grad_z = match grads.get(&z_var) {
                Some(g) => g.clone(),
                None => z_in.zeros_like()?,
            };
            for (slot, var) in var_grads.iter_mut().zip(vars.iter()) {
                if let Some(g) = grads.get(var) {
                    *slot = Some(match slot.take() {
                        Some(acc) => (acc + g)?,
                        None => g.clone(),
                    });
                }
            }
        }
        Ok(RecomputeGrads {
            m: grad_m,
            z: grad_z,
            vars: var_grads,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_tape_gradient_of_polynomial_chain() -> Result<()> {
        let dev = Device::Cpu;
        let w = Var::new(&[2f32, -1.], &dev)?;
        // step: m <- m * w, z <- z + m
        let step = |_: usize, m: &Tensor, z: &Tensor| -> Result<(Tensor, Tensor)> {
            let m_out = m.broadcast_mul(w.as_tensor())?;
            let z_out = (z + m)?;
            Ok((m_out, z_out))
        };
        let mut tape = RecomputeTape::new(step);
        let m0 = Tensor::new(&[1f32, 3.], &dev)?;
        let z0 = Tensor::new(&[0f32, 0.], &dev)?;
        let (m1, z1) = tape.run(&m0, &z0)?;
        let (m2, z2) = tape.run(&m1, &z1)?;
        assert_eq!(tape.len(), 2);
        assert_eq!(m2.to_vec1::<f32>()?, vec![4., 3.]);
        assert_eq!(z2.to_vec1::<f32>()?, vec![3., 0.]);

        // loss = sum(z2) = sum(m0 + m0 * w)  ->  d/dm0 = 1 + w, d/dw = m0
        let ones = Tensor::ones(2, candle_core::DType::F32, &dev)?;
        let zeros = ones.zeros_like()?;
        let grads = tape.backward(&zeros, &ones, &[w.clone()])?;
        assert_eq!(grads.m.to_vec1::<f32>()?, vec![3., 0.]);
        assert_eq!(grads.z.to_vec1::<f32>()?, vec![1., 1.]);
        let Some(gw) = &grads.vars[0] else {
            bail!("missing weight gradient")
        };
        assert_eq!(gw.to_vec1::<f32>()?, vec![1., 3.]);
        Ok(())
    }
}
