use super::gradient::Gradients;
use crate::{ensure_same_size, FlowField, Result};
use cv_core::Field;
use cv_imgproc::{neighbor_mean_into, BorderMode};
use rayon::prelude::*;
use wide::f32x8;

/// Added to the denominator so flat regions fall back to pure smoothing.
pub const STABILITY: f32 = 1e-6;

const LANES: usize = 8;

/// Velocity buffers owned by one solve.
///
/// `u`/`v` hold iteration k-1, the relaxation writes iteration k into
/// `u_next`/`v_next`, and the two pairs are swapped afterwards. No sample of
/// the field being written is ever read within the same iteration.
#[derive(Debug, Clone)]
pub(crate) struct VelocityState {
    u: Field,
    v: Field,
    u_next: Field,
    v_next: Field,
    u_avg: Field,
    v_avg: Field,
}

impl VelocityState {
    pub fn zeros(width: u32, height: u32) -> Self {
        let zero = Field::zeros(width, height);
        Self {
            u: zero.clone(),
            v: zero.clone(),
            u_next: zero.clone(),
            v_next: zero.clone(),
            u_avg: zero.clone(),
            v_avg: zero,
        }
    }

    /// One Jacobi sweep over the whole field. Returns `max(|u' - u|, |v' - v|)`.
    pub fn step(&mut self, gradients: &Gradients, alpha: f32, border: BorderMode) -> f32 {
        neighbor_mean_into(&self.u, &mut self.u_avg, border);
        neighbor_mean_into(&self.v, &mut self.v_avg, border);

        let delta = relax_into(
            gradients,
            Averages {
                u: &self.u_avg,
                v: &self.v_avg,
            },
            (&self.u, &self.v),
            (&mut self.u_next, &mut self.v_next),
            alpha,
        );

        std::mem::swap(&mut self.u, &mut self.u_next);
        std::mem::swap(&mut self.v, &mut self.v_next);
        delta
    }

    pub fn u(&self) -> &Field {
        &self.u
    }

    pub fn v(&self) -> &Field {
        &self.v
    }

    pub fn into_flow(self) -> FlowField {
        FlowField {
            u: self.u,
            v: self.v,
        }
    }
}

struct Averages<'a> {
    u: &'a Field,
    v: &'a Field,
}

/// Apply one relaxation update to `flow` and return the next estimate.
///
/// `flow` must have the shape of `gradients`. For every pixel
///
/// ```text
/// P  = Ix * u_avg + Iy * v_avg + It
/// D  = alpha^2 + Ix^2 + Iy^2 + STABILITY
/// u' = u_avg - Ix * P / D
/// v' = v_avg - Iy * P / D
/// ```
///
/// where `u_avg`/`v_avg` are 4-neighbour means of `flow` under `border`.
/// Fails with `SizeMismatch` unless both flow components and all three
/// gradient fields share one shape.
pub fn relax(
    gradients: &Gradients,
    flow: &FlowField,
    alpha: f32,
    border: BorderMode,
) -> Result<FlowField> {
    ensure_same_size(&flow.u, &flow.v, "flow components")?;
    for (field, what) in [
        (&gradients.ix, "ix and flow"),
        (&gradients.iy, "iy and flow"),
        (&gradients.it, "it and flow"),
    ] {
        ensure_same_size(field, &flow.u, what)?;
    }

    let (w, h) = flow.dimensions();
    let mut u_avg = Field::zeros(w, h);
    let mut v_avg = Field::zeros(w, h);
    neighbor_mean_into(&flow.u, &mut u_avg, border);
    neighbor_mean_into(&flow.v, &mut v_avg, border);

    let mut next = FlowField::new(w, h);
    relax_into(
        gradients,
        Averages {
            u: &u_avg,
            v: &v_avg,
        },
        (&flow.u, &flow.v),
        (&mut next.u, &mut next.v),
        alpha,
    );
    Ok(next)
}

fn relax_into(
    gradients: &Gradients,
    avg: Averages<'_>,
    (u, v): (&Field, &Field),
    (u_out, v_out): (&mut Field, &mut Field),
    alpha: f32,
) -> f32 {
    let width = u.width() as usize;
    if width == 0 {
        return 0.0;
    }
    let denom_base = alpha * alpha + STABILITY;

    u_out
        .as_mut_slice()
        .par_chunks_mut(width)
        .zip(v_out.as_mut_slice().par_chunks_mut(width))
        .enumerate()
        .map(|(y, (u_row, v_row))| {
            let start = y * width;
            let end = start + width;
            let row = RowInputs {
                ix: &gradients.ix.as_slice()[start..end],
                iy: &gradients.iy.as_slice()[start..end],
                it: &gradients.it.as_slice()[start..end],
                u_avg: &avg.u.as_slice()[start..end],
                v_avg: &avg.v.as_slice()[start..end],
                u: &u.as_slice()[start..end],
                v: &v.as_slice()[start..end],
            };
            relax_row(&row, u_row, v_row, denom_base)
        })
        .reduce(|| 0.0f32, f32::max)
}

struct RowInputs<'a> {
    ix: &'a [f32],
    iy: &'a [f32],
    it: &'a [f32],
    u_avg: &'a [f32],
    v_avg: &'a [f32],
    u: &'a [f32],
    v: &'a [f32],
}

#[inline]
fn lanes(src: &[f32], x: usize) -> f32x8 {
    let mut buf = [0.0f32; LANES];
    buf.copy_from_slice(&src[x..x + LANES]);
    f32x8::from(buf)
}

fn relax_row(row: &RowInputs<'_>, u_out: &mut [f32], v_out: &mut [f32], denom_base: f32) -> f32 {
    let n = u_out.len();
    let simd_end = n - n % LANES;
    let base = f32x8::splat(denom_base);
    let mut delta = 0.0f32;

    let mut x = 0;
    while x < simd_end {
        let ix = lanes(row.ix, x);
        let iy = lanes(row.iy, x);
        let it = lanes(row.it, x);
        let ua = lanes(row.u_avg, x);
        let va = lanes(row.v_avg, x);

        let ratio = (ix * ua + iy * va + it) / (base + ix * ix + iy * iy);
        let nu: [f32; LANES] = (ua - ix * ratio).into();
        let nv: [f32; LANES] = (va - iy * ratio).into();

        u_out[x..x + LANES].copy_from_slice(&nu);
        v_out[x..x + LANES].copy_from_slice(&nv);
        for i in 0..LANES {
            delta = delta
                .max((nu[i] - row.u[x + i]).abs())
                .max((nv[i] - row.v[x + i]).abs());
        }
        x += LANES;
    }

    for x in simd_end..n {
        let (ix, iy, it) = (row.ix[x], row.iy[x], row.it[x]);
        let (ua, va) = (row.u_avg[x], row.v_avg[x]);

        let ratio = (ix * ua + iy * va + it) / (denom_base + ix * ix + iy * iy);
        let nu = ua - ix * ratio;
        let nv = va - iy * ratio;

        u_out[x] = nu;
        v_out[x] = nv;
        delta = delta.max((nu - row.u[x]).abs()).max((nv - row.v[x]).abs());
    }

    delta
}
