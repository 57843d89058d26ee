//! Linear conditional probability path between a coupled pair of batches.
//!
//! Given endpoints `(x0, x1)` and a per-sample time `t ∈ [0,1]`, the path is
//! `N(t·x1 + (1-t)·x0, sigma)` with a *constant* noise scale `sigma` — a
//! deliberate simplification, not a time-varying schedule. The regression
//! target is the conditional velocity `u = x1 - x0`, which depends only on
//! the endpoints: the defining identity of conditional flow matching with a
//! linear path (Tong et al.).
//!
//! Endpoint arguments are symmetric; the orchestrator decides which slot is
//! noise and which is data.

use crate::{Error, Result};
use ndarray::{Array2, ArrayView1, ArrayView2};
use rand_distr::{Distribution, StandardNormal};

/// Path engine with a fixed noise scale.
#[derive(Debug, Clone, Copy)]
pub struct ConditionalPath {
    sigma: f32,
}

impl ConditionalPath {
    pub fn new(sigma: f32) -> Result<Self> {
        if !(sigma >= 0.0) || !sigma.is_finite() {
            return Err(Error::Domain("sigma must be nonnegative and finite"));
        }
        Ok(Self { sigma })
    }

    pub fn sigma(&self) -> f32 {
        self.sigma
    }

    fn check_pair(
        x0: &ArrayView2<f32>,
        x1: &ArrayView2<f32>,
        t: Option<&ArrayView1<f32>>,
    ) -> Result<()> {
        if x0.nrows() != x1.nrows() || x0.ncols() != x1.ncols() {
            return Err(Error::Shape("x0 and x1 must have identical shape"));
        }
        if let Some(t) = t {
            if t.len() != x0.nrows() {
                return Err(Error::Shape("t must have batch-size length"));
            }
        }
        Ok(())
    }

    /// Path mean `mu_t = t·x1 + (1-t)·x0`, with `t` broadcast across the
    /// feature dimension of each row.
    pub fn mean(
        &self,
        x0: &ArrayView2<f32>,
        x1: &ArrayView2<f32>,
        t: &ArrayView1<f32>,
    ) -> Result<Array2<f32>> {
        Self::check_pair(x0, x1, Some(t))?;
        let mut out = Array2::<f32>::zeros(x0.raw_dim());
        for i in 0..x0.nrows() {
            let ti = t[i];
            for k in 0..x0.ncols() {
                out[[i, k]] = ti * x1[[i, k]] + (1.0 - ti) * x0[[i, k]];
            }
        }
        Ok(out)
    }

    /// Path standard deviation; constant in `t` by design.
    pub fn std(&self, _t: f32) -> f32 {
        self.sigma
    }

    /// Draw `x_t = mu_t + sigma·noise` for caller-provided noise.
    pub fn sample_xt(
        &self,
        x0: &ArrayView2<f32>,
        x1: &ArrayView2<f32>,
        t: &ArrayView1<f32>,
        noise: &ArrayView2<f32>,
    ) -> Result<Array2<f32>> {
        Self::check_pair(x0, x1, Some(t))?;
        if noise.nrows() != x0.nrows() || noise.ncols() != x0.ncols() {
            return Err(Error::Shape("noise must match endpoint shape"));
        }
        let mut xt = self.mean(x0, x1, t)?;
        for i in 0..xt.nrows() {
            let s = self.std(t[i]);
            for k in 0..xt.ncols() {
                xt[[i, k]] += s * noise[[i, k]];
            }
        }
        Ok(xt)
    }

    /// Conditional target velocity `u = x1 - x0`: independent of `t` and of
    /// the realized `x_t`.
    pub fn target_velocity(
        &self,
        x0: &ArrayView2<f32>,
        x1: &ArrayView2<f32>,
    ) -> Result<Array2<f32>> {
        Self::check_pair(x0, x1, None)?;
        let mut u = Array2::<f32>::zeros(x0.raw_dim());
        for i in 0..x0.nrows() {
            for k in 0..x0.ncols() {
                u[[i, k]] = x1[[i, k]] - x0[[i, k]];
            }
        }
        Ok(u)
    }

    /// Score-weighting term `lambda(t) = 2·std(t) / (sigma² + eps)`.
    ///
    /// Exposed for score/flow hybrid objectives (Tong et al., simulation-free
    /// Schrödinger bridges); the default training loss does not use it.
    pub fn lambda(&self, t: f32) -> f32 {
        2.0 * self.std(t) / (self.sigma * self.sigma + 1e-8)
    }

    /// Combined draw: fresh i.i.d. standard-normal noise, then `(xt, ut)`.
    pub fn sample_location_and_flow(
        &self,
        x0: &ArrayView2<f32>,
        x1: &ArrayView2<f32>,
        t: &ArrayView1<f32>,
        rng: &mut impl rand::Rng,
    ) -> Result<(Array2<f32>, Array2<f32>)> {
        Self::check_pair(x0, x1, Some(t))?;
        let mut noise = Array2::<f32>::zeros(x0.raw_dim());
        for v in noise.iter_mut() {
            *v = StandardNormal.sample(rng);
        }
        let xt = self.sample_xt(x0, x1, t, &noise.view())?;
        let ut = self.target_velocity(x0, x1)?;
        Ok((xt, ut))
    }
}
