//! Invariant Point Attention (Supplementary Algorithm 22).
//!
//! Attention over residues whose logits combine scalar `q . k`, a bias
//! projected from the pair representation, and distances between 3D query /
//! key points placed in the global frame by each residue's rigid frame. The
//! value points are averaged in the global frame and mapped back into the
//! query residue's local frame, so the update is invariant to a global rigid
//! motion of all frames.
use crate::config::{FusionConfig, IpaConfig};
use crate::layers::linear::Linear;
use crate::layers::{mask_bias, softplus};
use crate::utils::fusion::{point_norm, Kernel};
use crate::utils::rigid::Rigid;
use candle_core::{bail, DType, Module, Result, Tensor, D};
use candle_nn::{Init, VarBuilder};

/// `softplus^-1(1)`: head weights start out contributing with weight 1.
const HEAD_WEIGHT_INIT: f64 = 0.541324854612918;

/// Projections of `s`, already split per head and with the points in the
/// global frame. All in the attention precision.
struct Projected {
    /// `[b, N, H, c]`
    q: Tensor,
    k: Tensor,
    v: Tensor,
    /// `[b, N, H, P, 3]`
    q_pts: Tensor,
    k_pts: Tensor,
    v_pts: Tensor,
}

#[derive(Debug, Clone)]
pub struct InvariantPointAttention {
    linear_q: Linear,
    linear_kv: Linear,
    linear_q_points: Linear,
    linear_kv_points: Linear,
    linear_b: Linear,
    linear_out: Linear,
    head_weights: Tensor,
    config: IpaConfig,
    fusion: FusionConfig,
}

impl InvariantPointAttention {
    pub fn load(vb: VarBuilder, config: &IpaConfig, fusion: FusionConfig) -> Result<Self> {
        config.validate()?;
        let IpaConfig {
            c_s,
            c_z,
            c_hidden,
            num_heads,
            num_qk_points,
            num_v_points,
            ..
        } = *config;
        let hc = c_hidden * num_heads;
        let hpq = num_heads * num_qk_points * 3;
        let hpkv = num_heads * (num_qk_points + num_v_points) * 3;

        let linear_q = Linear::load(c_s, hc, vb.pp("linear_q"))?;
        let linear_kv = Linear::load(c_s, 2 * hc, vb.pp("linear_kv"))?;
        let linear_q_points = Linear::load(c_s, hpq, vb.pp("linear_q_points"))?;
        let linear_kv_points = Linear::load(c_s, hpkv, vb.pp("linear_kv_points"))?;
        let linear_b = Linear::load(c_z, num_heads, vb.pp("linear_b"))?;
        let head_weights =
            vb.get_with_hints(num_heads, "head_weights", Init::Const(HEAD_WEIGHT_INIT))?;
        let linear_out = Linear::load(config.concat_out_dim(), c_s, vb.pp("linear_out"))?;

        tracing::debug!(
            c_s,
            c_z,
            c_hidden,
            num_heads,
            num_qk_points,
            num_v_points,
            fused = fusion.enabled,
            "loaded invariant point attention"
        );
        Ok(Self {
            linear_q,
            linear_kv,
            linear_q_points,
            linear_kv_points,
            linear_b,
            linear_out,
            head_weights,
            config: config.clone(),
            fusion,
        })
    }

    pub fn config(&self) -> &IpaConfig {
        &self.config
    }

    fn check_shapes(&self, s: &Tensor, z: &Tensor, r: &Rigid, mask: &Tensor) -> Result<()> {
        let (b, n, c_s) = s.dims3()?;
        let (bz, n1, n2, c_z) = z.dims4()?;
        let (bm, nm) = mask.dims2()?;
        let ok = c_s == self.config.c_s
            && c_z == self.config.c_z
            && (bz, n1, n2) == (b, n, n)
            && (bm, nm) == (b, n)
            && r.shape() == [b, n];
        if !ok {
            bail!(
                "invariant point attention: size mismatch between s {:?}, z {:?}, frames {:?}, mask {:?}",
                s.dims(),
                z.dims(),
                r.shape(),
                mask.dims()
            )
        }
        Ok(())
    }

    /// Logits are assembled in f32 when running in half precision.
    fn attention_dtype(dtype: DType) -> DType {
        match dtype {
            DType::F16 | DType::BF16 => DType::F32,
            other => other,
        }
    }

    fn s_projections(&self) -> [&Linear; 4] {
        [
            &self.linear_q,
            &self.linear_kv,
            &self.linear_q_points,
            &self.linear_kv_points,
        ]
    }

    /// `([c_s, total], [total])`: the four `s` projections side by side, read
    /// from the current parameter values.
    fn fused_projection(&self) -> Result<(Tensor, Tensor)> {
        let projections = self.s_projections();
        let weights: Vec<Tensor> = projections.iter().map(|l| l.weight().clone()).collect();
        let biases = projections
            .iter()
            .map(|l| match l.bias() {
                Some(b) => Ok(b.clone()),
                None => Tensor::zeros(l.out_dim(), l.weight().dtype(), l.weight().device()),
            })
            .collect::<Result<Vec<_>>>()?;
        Ok((
            Tensor::cat(&weights, 0)?.t()?.contiguous()?,
            Tensor::cat(&biases, 0)?,
        ))
    }

    /// The four projections of `s`, `[b, N, *]` each.
    fn project_s(&self, kernel: Kernel, s: &Tensor) -> Result<[Tensor; 4]> {
        if !kernel.is_fused() {
            return Ok([
                self.linear_q.forward(s)?,
                self.linear_kv.forward(s)?,
                self.linear_q_points.forward(s)?,
                self.linear_kv_points.forward(s)?,
            ]);
        }
        let (b, n, c_s) = s.dims3()?;
        let (weight_t, bias) = self.fused_projection()?;
        let all = s
            .reshape((b * n, c_s))?
            .matmul(&weight_t)?
            .broadcast_add(&bias)?
            .reshape((b, n, bias.dim(0)?))?;
        let widths = self.s_projections().map(|l| l.out_dim());
        let mut offset = 0;
        let mut parts = Vec::with_capacity(4);
        for width in widths {
            parts.push(all.narrow(2, offset, width)?);
            offset += width;
        }
        match <[Tensor; 4]>::try_from(parts) {
            Ok(parts) => Ok(parts),
            Err(_) => bail!("invariant point attention: fused projection split failed"),
        }
    }

    /// `[b, N, H * P * 3]` laid out as `x | y | z` blocks -> global-frame
    /// points `[b, N, H, P, 3]`.
    fn to_global_points(&self, raw: &Tensor, frames: &Rigid, points: usize) -> Result<Tensor> {
        let (b, n, width) = raw.dims3()?;
        let third = width / 3;
        let xyz = [
            raw.narrow(2, 0, third)?,
            raw.narrow(2, third, third)?,
            raw.narrow(2, 2 * third, third)?,
        ];
        let local = Tensor::stack(&xyz, 3)?;
        frames
            .unsqueeze(2)?
            .apply(&local)?
            .reshape((b, n, self.config.num_heads, points, 3))
    }

    fn project(&self, kernel: Kernel, s: &Tensor, frames: &Rigid, dtype: DType) -> Result<Projected> {
        let (b, n, _) = s.dims3()?;
        let IpaConfig {
            c_hidden,
            num_heads,
            num_qk_points,
            num_v_points,
            ..
        } = self.config;
        let [q, kv, q_pts, kv_pts] = self.project_s(kernel, s)?;

        let q = q.to_dtype(dtype)?.reshape((b, n, num_heads, c_hidden))?;
        let kv = kv.to_dtype(dtype)?.reshape((b, n, num_heads, 2 * c_hidden))?;
        let k = kv.narrow(3, 0, c_hidden)?;
        let v = kv.narrow(3, c_hidden, c_hidden)?;

        let q_pts = self.to_global_points(&q_pts.to_dtype(dtype)?, frames, num_qk_points)?;
        let kv_pts = self.to_global_points(
            &kv_pts.to_dtype(dtype)?,
            frames,
            num_qk_points + num_v_points,
        )?;
        let k_pts = kv_pts.narrow(3, 0, num_qk_points)?;
        let v_pts = kv_pts.narrow(3, num_qk_points, num_v_points)?;
        Ok(Projected {
            q,
            k,
            v,
            q_pts,
            k_pts,
            v_pts,
        })
    }

    /// Squared query/key point distances summed over points, `[b, H, N, N]`.
    fn point_distances(kernel: Kernel, q_pts: &Tensor, k_pts: &Tensor) -> Result<Tensor> {
        match kernel {
            Kernel::Fused => {
                // |q - k|^2 = |q|^2 + |k|^2 - 2 q.k, with q.k as one matmul per head
                let (b, n, h, p, _) = q_pts.dims5()?;
                let q = q_pts.permute((0, 2, 1, 3, 4))?.reshape((b, h, n, p * 3))?;
                let k = k_pts.permute((0, 2, 1, 3, 4))?.reshape((b, h, n, p * 3))?;
                let cross = q.matmul(&k.transpose(2, 3)?.contiguous()?)?;
                let q_sq = q.sqr()?.sum_keepdim(3)?;
                let k_sq = k.sqr()?.sum_keepdim(3)?.transpose(2, 3)?;
                q_sq.broadcast_add(&k_sq)?.broadcast_sub(&(cross * 2.0)?)
            }
            Kernel::Eager => {
                let diff = q_pts.unsqueeze(2)?.broadcast_sub(&k_pts.unsqueeze(1)?)?;
                diff.sqr()?
                    .sum(D::Minus1)?
                    .sum(D::Minus1)?
                    .permute((0, 3, 1, 2))
            }
        }
    }

    fn attend(&self, kernel: Kernel, p: &Projected, z: &Tensor, mask: &Tensor) -> Result<Tensor> {
        let dtype = p.q.dtype();
        let IpaConfig {
            c_hidden,
            num_heads,
            num_qk_points,
            inf,
            ..
        } = self.config;

        // [b, H, N, N]
        let q = p.q.transpose(1, 2)?.contiguous()?;
        let k = p.k.permute((0, 2, 3, 1))?.contiguous()?;
        let scalar = (q.matmul(&k)? * (1.0 / (3.0 * c_hidden as f64)).sqrt())?;

        let pair = self.linear_b.forward(z)?.to_dtype(dtype)?.permute((0, 3, 1, 2))?;
        let pair = (pair * (1.0 / 3.0f64).sqrt())?;

        let head_weights = (softplus(&self.head_weights.to_dtype(dtype)?)?
            * (1.0 / (3.0 * (num_qk_points as f64 * 9.0 / 2.0))).sqrt())?
        .reshape((1, num_heads, 1, 1))?;
        let points = Self::point_distances(kernel, &p.q_pts, &p.k_pts)?
            .broadcast_mul(&head_weights)?
            .affine(-0.5, 0.0)?;

        let mask = mask.to_dtype(dtype)?;
        let square_mask = mask.unsqueeze(2)?.broadcast_mul(&mask.unsqueeze(1)?)?;
        let square_mask = mask_bias(&square_mask, inf)?.unsqueeze(1)?;

        let logits = (scalar + pair)?.add(&points)?.broadcast_add(&square_mask)?;
        candle_nn::ops::softmax(&logits, D::Minus1)
    }

    /// Softmax attention weights `[b, H, N, N]` used by [`Self::forward`].
    pub fn attention_weights(
        &self,
        s: &Tensor,
        z: &Tensor,
        r: &Rigid,
        mask: &Tensor,
    ) -> Result<Tensor> {
        self.check_shapes(s, z, r, mask)?;
        let kernel = Kernel::select(s.device(), &self.fusion);
        let dtype = Self::attention_dtype(s.dtype());
        let frames = r.to_dtype(dtype)?;
        let projected = self.project(kernel, s, &frames, dtype)?;
        self.attend(kernel, &projected, z, mask)
    }

    /// # Arguments
    /// * `s` - single representation `[b, N, c_s]`
    /// * `z` - pair representation `[b, N, N, c_z]`
    /// * `r` - one frame per residue, shape `[b, N]`
    /// * `mask` - residue mask `[b, N]`
    ///
    /// Returns the update for `s`, `[b, N, c_s]`.
    pub fn forward(&self, s: &Tensor, z: &Tensor, r: &Rigid, mask: &Tensor) -> Result<Tensor> {
        self.check_shapes(s, z, r, mask)?;
        let (b, n, _) = s.dims3()?;
        let IpaConfig {
            c_hidden,
            c_z,
            num_heads,
            num_v_points,
            eps,
            ..
        } = self.config;
        let kernel = Kernel::select(s.device(), &self.fusion);
        let dtype = Self::attention_dtype(s.dtype());
        tracing::trace!(?kernel, ?dtype, s = ?s.dims(), "invariant point attention");

        let frames = r.to_dtype(dtype)?;
        let p = self.project(kernel, s, &frames, dtype)?;
        let a = self.attend(kernel, &p, z, mask)?;

        // scalar values: [b, N, H * c]
        let o = a
            .matmul(&p.v.transpose(1, 2)?.contiguous()?)?
            .transpose(1, 2)?
            .reshape((b, n, num_heads * c_hidden))?;

        // value points, averaged in the global frame then moved into each
        // query's local frame: [b, N, H, Pv, 3]
        let v_pts = p
            .v_pts
            .permute((0, 2, 1, 3, 4))?
            .reshape((b, num_heads, n, num_v_points * 3))?;
        let o_pt = a
            .matmul(&v_pts)?
            .reshape((b, num_heads, n, num_v_points, 3))?
            .permute((0, 2, 1, 3, 4))?;
        let o_pt = frames.unsqueeze(2)?.unsqueeze(3)?.invert_apply(&o_pt)?;
        let o_pt_norm = point_norm(kernel, &o_pt, eps)?.reshape((b, n, num_heads * num_v_points))?;
        let o_pt = o_pt.reshape((b, n, num_heads * num_v_points, 3))?;
        let [o_x, o_y, o_z] = [0, 1, 2].map(|i| o_pt.narrow(3, i, 1).and_then(|t| t.squeeze(3)));

        // pair values: [b, N, H * c_z]
        let o_pair = a
            .transpose(1, 2)?
            .contiguous()?
            .matmul(&z.to_dtype(dtype)?)?
            .reshape((b, n, num_heads * c_z))?;

        let cat = Tensor::cat(&[o, o_x?, o_y?, o_z?, o_pt_norm, o_pair], 2)?.to_dtype(s.dtype())?;
        self.linear_out.forward(&cat)
    }
}
