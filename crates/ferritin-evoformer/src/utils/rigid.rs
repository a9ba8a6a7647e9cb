//! Rigid transformations (rotation + translation) for per-residue frames.
//!
//! Frames carry an arbitrary batch shape `[*]`; rotations are stored as
//! `[*, 3, 3]` matrices and translations as `[*, 3]`. Points passed to
//! [`Rigid::apply`] must have a batch shape that broadcasts against the
//! frame's batch shape, which is what [`Rigid::unsqueeze`] is for.
use candle_core::{DType, Device, Result, Tensor, D};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RotationError {
    #[error("Invalid rotation matrix shape: {0:?}")]
    InvalidShape(Vec<usize>),
    #[error("Invalid quaternion shape: {0:?}, expected [..., 4]")]
    InvalidQuaternion(Vec<usize>),
    #[error("Shape mismatch between translation {trans:?} and rotation {rots:?}")]
    ShapeMismatch { trans: Vec<usize>, rots: Vec<usize> },
}

#[derive(Clone, Debug)]
pub struct RotationMatrix {
    rots: Tensor,
}

impl RotationMatrix {
    /// Accepts `[*, 3, 3]` or flattened `[*, 9]` rotation tensors.
    pub fn new(rots: Tensor) -> Result<Self> {
        let dims = rots.dims().to_vec();
        let rots = if dims.last() == Some(&9) {
            let mut shape = dims[..dims.len() - 1].to_vec();
            shape.extend([3, 3]);
            rots.reshape(shape)?
        } else {
            rots
        };
        let dims = rots.dims();
        if dims.len() < 2 || dims[dims.len() - 1] != 3 || dims[dims.len() - 2] != 3 {
            return Err(candle_core::Error::wrap(RotationError::InvalidShape(
                dims.to_vec(),
            )));
        }
        Ok(Self { rots })
    }

    pub fn identity(shape: &[usize], device: &Device, dtype: DType) -> Result<Self> {
        let mut full = shape.to_vec();
        full.extend([3, 3]);
        let eye = [[1f32, 0., 0.], [0., 1., 0.], [0., 0., 1.]];
        let rots = Tensor::new(&eye, device)?
            .to_dtype(dtype)?
            .broadcast_as(full.as_slice())?
            .contiguous()?;
        Ok(Self { rots })
    }

    /// Builds rotations from (not necessarily normalized) `[*, 4]` quaternions
    /// in `(w, x, y, z)` order.
    pub fn from_quaternions(quats: &Tensor) -> Result<Self> {
        if quats.dims().last() != Some(&4) {
            return Err(candle_core::Error::wrap(RotationError::InvalidQuaternion(
                quats.dims().to_vec(),
            )));
        }
        let norm = quats.sqr()?.sum_keepdim(D::Minus1)?.sqrt()?;
        let quats = quats.broadcast_div(&norm)?;
        let part = |i: usize| quats.narrow(D::Minus1, i, 1);
        let (w, x, y, z) = (part(0)?, part(1)?, part(2)?, part(3)?);

        let twice = |a: &Tensor, b: &Tensor| -> Result<Tensor> { (a * b)?.affine(2.0, 0.0) };
        let diag = |a: &Tensor, b: &Tensor| -> Result<Tensor> {
            (a.sqr()? + b.sqr()?)?.affine(-2.0, 1.0)
        };

        let entries = [
            diag(&y, &z)?,
            (twice(&x, &y)? - twice(&w, &z)?)?,
            (twice(&x, &z)? + twice(&w, &y)?)?,
            (twice(&x, &y)? + twice(&w, &z)?)?,
            diag(&x, &z)?,
            (twice(&y, &z)? - twice(&w, &x)?)?,
            (twice(&x, &z)? - twice(&w, &y)?)?,
            (twice(&y, &z)? + twice(&w, &x)?)?,
            diag(&x, &y)?,
        ];
        Self::new(Tensor::cat(&entries, D::Minus1)?)
    }

    pub fn random(shape: &[usize], device: &Device, dtype: DType) -> Result<Self> {
        let mut quat_shape = shape.to_vec();
        quat_shape.push(4);
        let quats = Tensor::randn(0f32, 1f32, quat_shape.as_slice(), device)?.to_dtype(dtype)?;
        Self::from_quaternions(&quats)
    }

    pub fn to_3x3(&self) -> &Tensor {
        &self.rots
    }

    /// Batch shape, i.e. the shape without the trailing `[3, 3]`.
    pub fn shape(&self) -> &[usize] {
        let dims = self.rots.dims();
        &dims[..dims.len() - 2]
    }

    pub fn dtype(&self) -> DType {
        self.rots.dtype()
    }

    pub fn device(&self) -> &Device {
        self.rots.device()
    }

    /// `self * other`, as broadcast products summed over the shared index so
    /// that any number of batch axes is supported.
    pub fn compose(&self, other: &Self) -> Result<Self> {
        let lhs = self.rots.unsqueeze(self.rots.rank())?;
        let rhs = other.rots.unsqueeze(other.rots.rank() - 2)?;
        Ok(Self {
            rots: lhs.broadcast_mul(&rhs)?.sum(D::Minus2)?,
        })
    }

    pub fn invert(&self) -> Result<Self> {
        Ok(Self {
            rots: self.rots.transpose(D::Minus1, D::Minus2)?.contiguous()?,
        })
    }

    /// Rotates `[*, 3]` points: `sum_j R[*, i, j] * p[*, j]`.
    pub fn apply(&self, p: &Tensor) -> Result<Tensor> {
        if p.dims().last() != Some(&3) {
            candle_core::bail!("rotation: expected points of shape [*, 3], got {:?}", p.dims())
        }
        let row = p.unsqueeze(p.rank() - 1)?;
        self.rots.broadcast_mul(&row)?.sum(D::Minus1)
    }

    pub fn unsqueeze(&self, dim: usize) -> Result<Self> {
        Ok(Self {
            rots: self.rots.unsqueeze(dim)?,
        })
    }

    pub fn to_dtype(&self, dtype: DType) -> Result<Self> {
        Ok(Self {
            rots: self.rots.to_dtype(dtype)?,
        })
    }
}

/// A rigid transformation `x -> R x + t`.
#[derive(Clone, Debug)]
pub struct Rigid {
    rots: RotationMatrix,
    trans: Tensor,
}

impl Rigid {
    pub fn new(rots: RotationMatrix, trans: Tensor) -> Result<Self> {
        let trans_dims = trans.dims();
        if trans_dims.last() != Some(&3) || trans_dims[..trans_dims.len() - 1] != *rots.shape() {
            return Err(candle_core::Error::wrap(RotationError::ShapeMismatch {
                trans: trans_dims.to_vec(),
                rots: rots.to_3x3().dims().to_vec(),
            }));
        }
        Ok(Self { rots, trans })
    }

    pub fn identity(shape: &[usize], device: &Device, dtype: DType) -> Result<Self> {
        let mut trans_shape = shape.to_vec();
        trans_shape.push(3);
        let trans = Tensor::zeros(trans_shape.as_slice(), dtype, device)?;
        let rots = RotationMatrix::identity(shape, device, dtype)?;
        Ok(Self { rots, trans })
    }

    /// Random rotation with normally distributed translation of scale `std`.
    pub fn random(shape: &[usize], std: f64, device: &Device, dtype: DType) -> Result<Self> {
        let mut trans_shape = shape.to_vec();
        trans_shape.push(3);
        let trans =
            Tensor::randn(0f32, std as f32, trans_shape.as_slice(), device)?.to_dtype(dtype)?;
        let rots = RotationMatrix::random(shape, device, dtype)?;
        Ok(Self { rots, trans })
    }

    pub fn rots(&self) -> &RotationMatrix {
        &self.rots
    }

    pub fn trans(&self) -> &Tensor {
        &self.trans
    }

    pub fn shape(&self) -> &[usize] {
        self.rots.shape()
    }

    pub fn compose(&self, other: &Self) -> Result<Self> {
        let rots = self.rots.compose(&other.rots)?;
        let trans = self.rots.apply(&other.trans)?.broadcast_add(&self.trans)?;
        Ok(Self { rots, trans })
    }

    pub fn invert(&self) -> Result<Self> {
        let rots = self.rots.invert()?;
        let trans = rots.apply(&self.trans)?.neg()?;
        Ok(Self { rots, trans })
    }

    /// Local -> global.
    pub fn apply(&self, p: &Tensor) -> Result<Tensor> {
        self.rots.apply(p)?.broadcast_add(&self.trans)
    }

    /// Global -> local.
    pub fn invert_apply(&self, p: &Tensor) -> Result<Tensor> {
        let centered = p.broadcast_sub(&self.trans)?;
        self.rots.invert()?.apply(&centered)
    }

    /// Inserts a batch axis at `dim` so that frames broadcast over extra point axes.
    pub fn unsqueeze(&self, dim: usize) -> Result<Self> {
        Ok(Self {
            rots: self.rots.unsqueeze(dim)?,
            trans: self.trans.unsqueeze(dim)?,
        })
    }

    pub fn to_dtype(&self, dtype: DType) -> Result<Self> {
        Ok(Self {
            rots: self.rots.to_dtype(dtype)?,
            trans: self.trans.to_dtype(dtype)?,
        })
    }
}
