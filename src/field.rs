//! Velocity-model seam and simple trainable baselines.
//!
//! The real denoising network lives outside this crate; anything that can
//! map `(x_t, t, log size factor, covariate embedding)` to a velocity plugs
//! in through [`VelocityModel`]. The baselines here are intentionally boring:
//! enough structure to exercise the training loop and the sampler without
//! importing an ML framework.

use ndarray::{Array2, ArrayView1, ArrayView2};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};

/// A conditional velocity field over the latent space.
///
/// `t`, `log_size_factor` have batch-size length; `cond` is the covariate
/// embedding with one row per sample. Implementations must not mutate any
/// captured conditioning.
pub trait VelocityModel {
    /// Latent dimensionality the field operates in.
    fn latent_dim(&self) -> usize;

    /// Predict velocities at `(x, t)` under the given conditioning.
    fn velocity(
        &self,
        x: &ArrayView2<f32>,
        t: &ArrayView1<f32>,
        log_size_factor: &ArrayView1<f32>,
        cond: &ArrayView2<f32>,
    ) -> Array2<f32>;
}

/// A velocity model that can be fitted in-crate with plain SGD.
pub trait TrainableVelocityModel: VelocityModel {
    /// One SGD step on mean-squared error against `target`; returns the
    /// batch MSE *before* the update.
    fn sgd_step(
        &mut self,
        x: &ArrayView2<f32>,
        t: &ArrayView1<f32>,
        log_size_factor: &ArrayView1<f32>,
        cond: &ArrayView2<f32>,
        target: &ArrayView2<f32>,
        lr: f32,
        weight_decay: f32,
    ) -> f32;
}

/// Linear conditional field:
///
/// `v(x, t; s, c) = W · [x; c; s; t; 1]`
///
/// where `s` is the log size factor and `c` the covariate embedding, so `W`
/// has shape `(d, d + c_dim + 3)`.
#[derive(Debug, Clone)]
pub struct LinearVelocityField {
    w: Array2<f32>,
    d: usize,
    c_dim: usize,
}

impl LinearVelocityField {
    /// All-zero parameters (predicts the zero field everywhere).
    pub fn new_zeros(d: usize, c_dim: usize) -> Self {
        Self {
            w: Array2::zeros((d, d + c_dim + 3)),
            d,
            c_dim,
        }
    }

    /// Small random init, deterministic in `seed`.
    pub fn new_random(d: usize, c_dim: usize, seed: u64) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let cols = d + c_dim + 3;
        let scale = 1.0 / (cols as f32).sqrt();
        let mut w = Array2::<f32>::zeros((d, cols));
        for v in w.iter_mut() {
            let z: f32 = StandardNormal.sample(&mut rng);
            *v = scale * z;
        }
        Self { w, d, c_dim }
    }

    pub fn weights(&self) -> &Array2<f32> {
        &self.w
    }

    #[inline]
    fn features(&self, xi: &ArrayView1<f32>, ci: &ArrayView1<f32>, s: f32, t: f32) -> Vec<f32> {
        let mut feat = Vec::with_capacity(self.d + self.c_dim + 3);
        feat.extend(xi.iter().copied());
        feat.extend(ci.iter().copied());
        feat.push(s);
        feat.push(t);
        feat.push(1.0);
        feat
    }
}

impl VelocityModel for LinearVelocityField {
    fn latent_dim(&self) -> usize {
        self.d
    }

    fn velocity(
        &self,
        x: &ArrayView2<f32>,
        t: &ArrayView1<f32>,
        log_size_factor: &ArrayView1<f32>,
        cond: &ArrayView2<f32>,
    ) -> Array2<f32> {
        let n = x.nrows();
        debug_assert_eq!(x.ncols(), self.d);
        debug_assert_eq!(cond.ncols(), self.c_dim);
        debug_assert_eq!(t.len(), n);
        debug_assert_eq!(log_size_factor.len(), n);
        debug_assert_eq!(cond.nrows(), n);

        let mut out = Array2::<f32>::zeros((n, self.d));
        for i in 0..n {
            let feat = self.features(&x.row(i), &cond.row(i), log_size_factor[i], t[i]);
            for r in 0..self.d {
                let mut s = 0.0f32;
                for (k, &f) in feat.iter().enumerate() {
                    s += self.w[[r, k]] * f;
                }
                out[[i, r]] = s;
            }
        }
        out
    }
}

impl TrainableVelocityModel for LinearVelocityField {
    fn sgd_step(
        &mut self,
        x: &ArrayView2<f32>,
        t: &ArrayView1<f32>,
        log_size_factor: &ArrayView1<f32>,
        cond: &ArrayView2<f32>,
        target: &ArrayView2<f32>,
        lr: f32,
        weight_decay: f32,
    ) -> f32 {
        let n = x.nrows();
        debug_assert_eq!(target.nrows(), n);
        debug_assert_eq!(target.ncols(), self.d);

        let pred = self.velocity(x, t, log_size_factor, cond);

        // Batch-mean gradient of 1/2 Σ_dims (pred - u)² plus L2 decay.
        let cols = self.d + self.c_dim + 3;
        let mut grad = Array2::<f32>::zeros((self.d, cols));
        let mut sq_err = 0.0f64;
        for i in 0..n {
            let feat = self.features(&x.row(i), &cond.row(i), log_size_factor[i], t[i]);
            for r in 0..self.d {
                let res = pred[[i, r]] - target[[i, r]];
                sq_err += (res as f64) * (res as f64);
                for (k, &f) in feat.iter().enumerate() {
                    grad[[r, k]] += res * f;
                }
            }
        }
        let inv_n = 1.0 / n.max(1) as f32;
        for r in 0..self.d {
            for k in 0..cols {
                let g = grad[[r, k]] * inv_n + weight_decay * self.w[[r, k]];
                self.w[[r, k]] -= lr * g;
            }
        }

        (sq_err / (n.max(1) as f64 * self.d as f64)) as f32
    }
}

/// Degenerate baseline predicting zero velocity everywhere.
///
/// Useful for plumbing tests: integrating it must return the initial state
/// unchanged regardless of step count.
#[derive(Debug, Clone, Copy)]
pub struct ZeroVelocity {
    pub d: usize,
}

impl VelocityModel for ZeroVelocity {
    fn latent_dim(&self) -> usize {
        self.d
    }

    fn velocity(
        &self,
        x: &ArrayView2<f32>,
        _t: &ArrayView1<f32>,
        _log_size_factor: &ArrayView1<f32>,
        _cond: &ArrayView2<f32>,
    ) -> Array2<f32> {
        Array2::zeros((x.nrows(), self.d))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array1;

    fn toy_inputs(n: usize, d: usize, c: usize) -> (Array2<f32>, Array1<f32>, Array1<f32>, Array2<f32>) {
        let mut x = Array2::<f32>::zeros((n, d));
        let mut cond = Array2::<f32>::zeros((n, c));
        for i in 0..n {
            for k in 0..d {
                x[[i, k]] = (i as f32 + 1.0) * 0.1 + k as f32 * 0.01;
            }
            for k in 0..c {
                cond[[i, k]] = if k == i % c { 1.0 } else { 0.0 };
            }
        }
        let t = Array1::from_elem(n, 0.5f32);
        let sf = Array1::from_elem(n, 7.0f32);
        (x, t, sf, cond)
    }

    #[test]
    fn zero_field_predicts_zero() {
        let (x, t, sf, cond) = toy_inputs(4, 3, 2);
        let f = LinearVelocityField::new_zeros(3, 2);
        let v = f.velocity(&x.view(), &t.view(), &sf.view(), &cond.view());
        assert!(v.iter().all(|&a| a == 0.0));
    }

    #[test]
    fn sgd_reduces_mse_on_fixed_target() {
        let (x, t, sf, cond) = toy_inputs(8, 3, 2);
        let mut target = Array2::<f32>::zeros((8, 3));
        for i in 0..8 {
            for k in 0..3 {
                target[[i, k]] = 0.5 * x[[i, k]] - 0.2;
            }
        }

        let mut f = LinearVelocityField::new_random(3, 2, 42);
        let first = f.sgd_step(
            &x.view(),
            &t.view(),
            &sf.view(),
            &cond.view(),
            &target.view(),
            0.05,
            0.0,
        );
        let mut last = first;
        for _ in 0..200 {
            last = f.sgd_step(
                &x.view(),
                &t.view(),
                &sf.view(),
                &cond.view(),
                &target.view(),
                0.05,
                0.0,
            );
        }
        assert!(last < 0.1 * first, "expected MSE drop: {first} -> {last}");
    }

    #[test]
    fn weight_decay_shrinks_weights_at_zero_error() {
        let (x, t, sf, cond) = toy_inputs(4, 2, 2);
        let mut f = LinearVelocityField::new_random(2, 2, 7);
        // Target equal to current prediction: residual gradient is zero,
        // so only the decay term moves the weights.
        let target = f.velocity(&x.view(), &t.view(), &sf.view(), &cond.view());
        let norm_before: f32 = f.weights().iter().map(|w| w * w).sum();
        f.sgd_step(
            &x.view(),
            &t.view(),
            &sf.view(),
            &cond.view(),
            &target.view(),
            0.1,
            0.01,
        );
        let norm_after: f32 = f.weights().iter().map(|w| w * w).sum();
        assert!(norm_after < norm_before);
    }
}
