//! Eager vs. fused kernel selection.
//!
//! A handful of arithmetic-heavy steps have two interchangeable
//! implementations with identical signatures: a straightforward one built from
//! candle tensor ops, and a fused one. The choice is a plain [`Kernel`] value
//! resolved once per module (or per call) from the device and the DAP group
//! size. Both paths agree up to floating-point reassociation.
//!
//! The fused elementwise kernels are single-pass host kernels implemented as
//! candle custom ops, so they are only selected on the CPU backend.
use crate::config::FusionConfig;
use candle_core::{
    bail, CpuStorage, CustomOp1, CustomOp3, DType, Device, Layout, Result, Shape, Tensor,
    WithDType, D,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kernel {
    Eager,
    Fused,
}

impl Kernel {
    /// Selection for kernels that do not interact with the parallel group.
    pub fn select(device: &Device, config: &FusionConfig) -> Self {
        if config.enabled && device.is_cpu() {
            Kernel::Fused
        } else {
            Kernel::Eager
        }
    }

    /// Selection for the dropout mul-add. Under DAP the residual and the mask
    /// live on different shard layouts, so the fused path is only taken for a
    /// group of one.
    pub fn select_mul_add(device: &Device, dap_size: usize, config: &FusionConfig) -> Self {
        match Self::select(device, config) {
            Kernel::Fused if dap_size <= 1 => Kernel::Fused,
            _ => Kernel::Eager,
        }
    }

    pub fn is_fused(&self) -> bool {
        matches!(self, Kernel::Fused)
    }
}

fn host_kernel_supports(x: &Tensor) -> bool {
    x.device().is_cpu() && matches!(x.dtype(), DType::F32 | DType::F64)
}

fn contiguous<'a, T>(data: &'a [T], layout: &Layout) -> Result<&'a [T]> {
    match layout.contiguous_offsets() {
        Some((start, end)) => Ok(&data[start..end]),
        None => bail!("fused kernels require contiguous inputs"),
    }
}

/// `y + x * mask`, all three of the same shape.
struct MulAdd;

impl MulAdd {
    fn run<T: WithDType>(
        x: &[T],
        l1: &Layout,
        m: &[T],
        l2: &Layout,
        y: &[T],
        l3: &Layout,
    ) -> Result<Vec<T>> {
        let (x, m, y) = (contiguous(x, l1)?, contiguous(m, l2)?, contiguous(y, l3)?);
        if x.len() != m.len() || x.len() != y.len() {
            bail!(
                "fused-mul-add: element counts differ ({}, {}, {})",
                x.len(),
                m.len(),
                y.len()
            )
        }
        Ok(x
            .iter()
            .zip(m.iter())
            .zip(y.iter())
            .map(|((&x, &m), &y)| y + x * m)
            .collect())
    }
}

impl CustomOp3 for MulAdd {
    fn name(&self) -> &'static str {
        "fused-mul-add"
    }

    fn cpu_fwd(
        &self,
        s1: &CpuStorage,
        l1: &Layout,
        s2: &CpuStorage,
        l2: &Layout,
        s3: &CpuStorage,
        l3: &Layout,
    ) -> Result<(CpuStorage, Shape)> {
        let out = match (s1, s2, s3) {
            (CpuStorage::F32(x), CpuStorage::F32(m), CpuStorage::F32(y)) => {
                CpuStorage::F32(Self::run(x, l1, m, l2, y, l3)?)
            }
            (CpuStorage::F64(x), CpuStorage::F64(m), CpuStorage::F64(y)) => {
                CpuStorage::F64(Self::run(x, l1, m, l2, y, l3)?)
            }
            _ => bail!("fused-mul-add: unsupported dtype combination"),
        };
        Ok((out, l1.shape().clone()))
    }

    fn bwd(
        &self,
        x: &Tensor,
        mask: &Tensor,
        _y: &Tensor,
        _res: &Tensor,
        grad: &Tensor,
    ) -> Result<(Option<Tensor>, Option<Tensor>, Option<Tensor>)> {
        Ok((
            Some(grad.mul(mask)?),
            Some(grad.mul(x)?),
            Some(grad.clone()),
        ))
    }
}

/// `sqrt(sum(p^2, -1) + eps)` over a trailing axis of size 3.
struct PointNorm {
    eps: f64,
}

impl PointNorm {
    fn run<T: WithDType>(&self, p: &[T], layout: &Layout) -> Result<Vec<T>> {
        let p = contiguous(p, layout)?;
        Ok(p.chunks_exact(3)
            .map(|xyz| {
                let sq: f64 = xyz.iter().map(|v| v.to_f64() * v.to_f64()).sum();
                T::from_f64((sq + self.eps).sqrt())
            })
            .collect())
    }
}

impl CustomOp1 for PointNorm {
    fn name(&self) -> &'static str {
        "fused-point-norm"
    }

    fn cpu_fwd(&self, storage: &CpuStorage, layout: &Layout) -> Result<(CpuStorage, Shape)> {
        let dims = layout.shape().dims();
        if dims.last() != Some(&3) {
            bail!("fused-point-norm: expected a trailing axis of 3, got {dims:?}")
        }
        let out = match storage {
            CpuStorage::F32(p) => CpuStorage::F32(self.run(p, layout)?),
            CpuStorage::F64(p) => CpuStorage::F64(self.run(p, layout)?),
            _ => bail!("fused-point-norm: unsupported dtype"),
        };
        Ok((out, Shape::from(&dims[..dims.len() - 1])))
    }

    fn bwd(&self, arg: &Tensor, res: &Tensor, grad_res: &Tensor) -> Result<Option<Tensor>> {
        let scale = grad_res.div(res)?.unsqueeze(res.rank())?;
        Ok(Some(arg.broadcast_mul(&scale)?))
    }
}

/// `y + x * mask` where `mask` broadcasts to the shape of `x` and `y`.
pub fn mul_add(kernel: Kernel, x: &Tensor, mask: &Tensor, y: &Tensor) -> Result<Tensor> {
    if x.dims() != y.dims() {
        bail!(
            "mul_add: shape mismatch between x {:?} and add_output_to {:?}",
            x.dims(),
            y.dims()
        )
    }
    match kernel {
        Kernel::Fused if host_kernel_supports(x) && x.dtype() == y.dtype() => {
            let mask = mask.to_dtype(x.dtype())?.broadcast_as(x.shape())?.contiguous()?;
            x.contiguous()?.apply_op3(&mask, &y.contiguous()?, MulAdd)
        }
        _ => y.add(&x.broadcast_mul(mask)?),
    }
}

/// Per-point Euclidean norm with an epsilon floor, reducing the trailing `xyz` axis.
pub fn point_norm(kernel: Kernel, points: &Tensor, eps: f64) -> Result<Tensor> {
    match kernel {
        Kernel::Fused if host_kernel_supports(points) => {
            points.contiguous()?.apply_op1(PointNorm { eps })
        }
        _ => (points.sqr()?.sum(D::Minus1)? + eps)?.sqrt(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Var;

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
        (a - b)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()
    }

    #[test]
    fn test_selection_rules() {
        let cpu = Device::Cpu;
        let on = FusionConfig { enabled: true };
        let off = FusionConfig { enabled: false };
        assert_eq!(Kernel::select(&cpu, &on), Kernel::Fused);
        assert_eq!(Kernel::select(&cpu, &off), Kernel::Eager);
        assert_eq!(Kernel::select_mul_add(&cpu, 1, &on), Kernel::Fused);
        assert_eq!(Kernel::select_mul_add(&cpu, 2, &on), Kernel::Eager);
    }

    #[test]
    fn test_fused_mul_add_matches_eager() -> Result<()> {
        let dev = Device::Cpu;
        let x = Tensor::randn(0f32, 1., (2, 3, 4, 5), &dev)?;
        let y = Tensor::randn(0f32, 1., (2, 3, 4, 5), &dev)?;
        let mask = Tensor::randn(0f32, 1., (2, 1, 4, 5), &dev)?;
        let eager = mul_add(Kernel::Eager, &x, &mask, &y)?;
        let fused = mul_add(Kernel::Fused, &x, &mask, &y)?;
        assert!(max_abs_diff(&eager, &fused)? < 1e-6);
        Ok(())
    }

    #[test]
    fn test_mul_add_rejects_shape_mismatch() -> Result<()> {
        let dev = Device::Cpu;
        let x = Tensor::zeros((2, 3), DType::F32, &dev)?;
        let y = Tensor::zeros((3, 2), DType::F32, &dev)?;
        let mask = Tensor::ones((1, 3), DType::F32, &dev)?;
        assert!(mul_add(Kernel::Eager, &x, &mask, &y).is_err());
        assert!(mul_add(Kernel::Fused, &x, &mask, &y).is_err());
        Ok(())
    }

    #[test]
    fn test_fused_point_norm_matches_eager() -> Result<()> {
        let dev = Device::Cpu;
        let p = Tensor::randn(0f32, 2., (1, 5, 2, 4, 3), &dev)?;
        let eager = point_norm(Kernel::Eager, &p, 1e-8)?;
        let fused = point_norm(Kernel::Fused, &p, 1e-8)?;
        assert_eq!(fused.dims(), &[1, 5, 2, 4]);
        assert!(max_abs_diff(&eager, &fused)? < 1e-5);
        Ok(())
    }

    #[test]
    fn test_fused_point_norm_gradient() -> Result<()> {
        let dev = Device::Cpu;
        let p = Var::from_tensor(&Tensor::randn(0f32, 1., (4, 3), &dev)?)?;
        let eager = point_norm(Kernel::Eager, p.as_tensor(), 1e-8)?.sum_all()?;
        let fused = point_norm(Kernel::Fused, p.as_tensor(), 1e-8)?.sum_all()?;
        let g_eager = eager.backward()?;
        let g_fused = fused.backward()?;
        let (Some(a), Some(b)) = (g_eager.get(&p), g_fused.get(&p)) else {
            bail!("missing gradient")
        };
        assert!(max_abs_diff(a, b)? < 1e-5);
        Ok(())
    }
}
