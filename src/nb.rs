//! Negative-binomial observation likelihood for count data.
//!
//! Counts are modeled per cell and gene as NB2 with mean `mu` (from the
//! decode bridge) and dispersion `theta = exp(log_theta)`:
//!
//! \[
//! \log p(x) = \ln\Gamma(x+\theta) - \ln\Gamma(\theta) - \ln\Gamma(x+1)
//!   + \theta \ln\frac{\theta}{\theta+\mu} + x \ln\frac{\mu}{\theta+\mu}
//! \]
//!
//! Everything runs in `f64` internally; `ln_gamma`/`digamma` come from
//! `statrs`. Sampling uses the Gamma–Poisson mixture
//! (`lambda ~ Gamma(theta, mu/theta)`, `x ~ Poisson(lambda)`).

use crate::{Error, Result};
use ndarray::{Array1, Array2, ArrayView2};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Gamma, Poisson, StandardNormal};
use statrs::function::gamma::{digamma, ln_gamma};

// Keep theta away from Gamma-function overflow territory; the bound is still
// extremely wide for expression data.
const LOG_THETA_LO: f32 = -10.0;
const LOG_THETA_HI: f32 = 8.0;

fn mu_floor(mu: f32) -> f64 {
    (mu as f64).max(1e-10)
}

/// Per-element NB2 log-probability.
pub fn nb_log_prob(x: f32, mu: f32, theta: f32) -> f64 {
    let x = x as f64;
    let theta = theta as f64;
    let mu = mu_floor(mu);
    ln_gamma(x + theta) - ln_gamma(theta) - ln_gamma(x + 1.0)
        + theta * (theta.ln() - (theta + mu).ln())
        + x * (mu.ln() - (theta + mu).ln())
}

/// `d log p / d mu` (NB2).
pub fn nb_dlogp_dmu(x: f32, mu: f32, theta: f32) -> f64 {
    let x = x as f64;
    let theta = theta as f64;
    let mu = mu_floor(mu);
    x / mu - (x + theta) / (mu + theta)
}

/// `d log p / d log_theta` (NB2); chain rule through `theta = exp(log_theta)`.
pub fn nb_dlogp_dlog_theta(x: f32, mu: f32, theta: f32) -> f64 {
    let x = x as f64;
    let theta = theta as f64;
    let mu = mu_floor(mu);
    let dtheta = digamma(x + theta) - digamma(theta) + theta.ln() + 1.0
        - (theta + mu).ln()
        - (theta + x) / (theta + mu);
    dtheta * theta
}

/// Indexed table of per-gene log-dispersion parameters.
///
/// One row per covariate category; the global (covariate-agnostic) case is a
/// single-row table broadcast to every category, so callers never branch on
/// which flavor they hold.
#[derive(Debug, Clone)]
pub struct DispersionTable {
    log_theta: Array2<f32>,
}

impl DispersionTable {
    /// Global dispersion: one shared row of `genes` parameters.
    pub fn global(genes: usize, seed: u64) -> Self {
        Self::with_rows(1, genes, seed)
    }

    /// Covariate-specific dispersion: one row per category.
    pub fn per_category(n_cat: usize, genes: usize, seed: u64) -> Result<Self> {
        if n_cat == 0 {
            return Err(Error::Domain("dispersion table needs >= 1 category"));
        }
        Ok(Self::with_rows(n_cat, genes, seed))
    }

    fn with_rows(rows: usize, genes: usize, seed: u64) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut log_theta = Array2::<f32>::zeros((rows, genes));
        for v in log_theta.iter_mut() {
            let z: f32 = StandardNormal.sample(&mut rng);
            *v = z;
        }
        Self { log_theta }
    }

    pub fn genes(&self) -> usize {
        self.log_theta.ncols()
    }

    pub fn rows(&self) -> usize {
        self.log_theta.nrows()
    }

    #[inline]
    fn row_for(&self, category: usize) -> Result<usize> {
        if self.log_theta.nrows() == 1 {
            return Ok(0);
        }
        if category >= self.log_theta.nrows() {
            return Err(Error::Domain("unknown covariate category for dispersion"));
        }
        Ok(category)
    }

    /// `theta` row (strictly positive) for a covariate category.
    pub fn theta_for(&self, category: usize) -> Result<Array1<f32>> {
        let r = self.row_for(category)?;
        Ok(self.log_theta.row(r).mapv(|v| v.exp()))
    }

    /// Snapshot of the raw parameters (for freeze/equality checks in tests).
    pub fn log_theta(&self) -> &Array2<f32> {
        &self.log_theta
    }

    /// Mean NB negative log-likelihood of `x` given decoded means `mu`.
    ///
    /// `categories[i]` selects the dispersion row for cell `i`.
    pub fn recon_loss(
        &self,
        x: &ArrayView2<f32>,
        mu: &ArrayView2<f32>,
        categories: &[usize],
    ) -> Result<f32> {
        let (n, g) = (x.nrows(), x.ncols());
        if mu.nrows() != n || mu.ncols() != g {
            return Err(Error::Shape("x and mu must have identical shape"));
        }
        if categories.len() != n {
            return Err(Error::Shape("categories must have batch-size length"));
        }
        if g != self.genes() {
            return Err(Error::Shape("gene dimension mismatch with dispersion table"));
        }
        let mut nll = 0.0f64;
        for i in 0..n {
            let r = self.row_for(categories[i])?;
            for k in 0..g {
                let theta = self.log_theta[[r, k]].exp();
                nll -= nb_log_prob(x[[i, k]], mu[[i, k]], theta);
            }
        }
        Ok((nll / n.max(1) as f64) as f32)
    }

    /// One SGD step on the dispersion parameters against the reconstruction
    /// loss; gradients are batch-mean, scattered per category row.
    pub fn sgd_step(
        &mut self,
        x: &ArrayView2<f32>,
        mu: &ArrayView2<f32>,
        categories: &[usize],
        lr: f32,
    ) -> Result<()> {
        let (n, g) = (x.nrows(), x.ncols());
        if mu.nrows() != n || mu.ncols() != g || categories.len() != n {
            return Err(Error::Shape("reconstruction batch shapes disagree"));
        }
        if g != self.genes() {
            return Err(Error::Shape("gene dimension mismatch with dispersion table"));
        }
        let mut grad = Array2::<f64>::zeros(self.log_theta.raw_dim());
        let inv_n = 1.0 / n.max(1) as f64;
        for i in 0..n {
            let r = self.row_for(categories[i])?;
            for k in 0..g {
                let theta = self.log_theta[[r, k]].exp();
                // loss = -mean log p, so the gradient flips sign.
                grad[[r, k]] -= nb_dlogp_dlog_theta(x[[i, k]], mu[[i, k]], theta) * inv_n;
            }
        }
        for (w, &gr) in self.log_theta.iter_mut().zip(grad.iter()) {
            *w = (*w - lr * gr as f32).clamp(LOG_THETA_LO, LOG_THETA_HI);
        }
        Ok(())
    }

    /// Draw counts from `NB(mu, theta)` per cell/gene via Gamma–Poisson.
    pub fn sample_counts(
        &self,
        mu: &ArrayView2<f32>,
        categories: &[usize],
        rng: &mut ChaCha8Rng,
    ) -> Result<Array2<f32>> {
        let (n, g) = (mu.nrows(), mu.ncols());
        if categories.len() != n {
            return Err(Error::Shape("categories must have batch-size length"));
        }
        if g != self.genes() {
            return Err(Error::Shape("gene dimension mismatch with dispersion table"));
        }
        let mut out = Array2::<f32>::zeros((n, g));
        for i in 0..n {
            let r = self.row_for(categories[i])?;
            for k in 0..g {
                let mu_ik = mu[[i, k]] as f64;
                if !(mu_ik >= 0.0) || !mu_ik.is_finite() {
                    return Err(Error::Domain("decoded mean must be nonnegative and finite"));
                }
                if mu_ik <= 0.0 {
                    continue;
                }
                let theta = self.log_theta[[r, k]].exp() as f64;
                let gamma = Gamma::new(theta, mu_ik / theta)
                    .map_err(|_| Error::Domain("invalid gamma parameters"))?;
                let lambda: f64 = gamma.sample(rng);
                if lambda > 0.0 {
                    let pois = Poisson::new(lambda)
                        .map_err(|_| Error::Domain("invalid poisson rate"))?;
                    out[[i, k]] = pois.sample(rng) as f32;
                }
            }
        }
        Ok(out)
    }
}
