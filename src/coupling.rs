//! Minibatch optimal-transport coupling for flow matching.
//!
//! Rectified/OT flow matching pairs each source point with a target point so
//! the training trajectories are straight rather than "curly". This module
//! computes that pairing per minibatch: an entropic (Sinkhorn) transport plan
//! over the Euclidean cost matrix, reduced to a one-to-one permutation by
//! greedy matching.
//!
//! The coupling is a variance-reduction device, not a correctness
//! precondition, so a failed solve must never halt training: the sampler
//! degrades to the identity pairing and reports it as
//! [`CouplingOutcome::Fallback`] so callers can track the fallback rate as a
//! health signal.

use crate::{Error, Result};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};

#[inline]
fn l2(a: &ArrayView1<f32>, b: &ArrayView1<f32>) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    let mut s = 0.0f32;
    for k in 0..a.len() {
        let d = a[k] - b[k];
        s += d * d;
    }
    s.sqrt()
}

/// Euclidean-distance cost matrix between two equal-sized point clouds.
///
/// Distance, not squared distance: this matters for `exp(-C / reg)` inside
/// Sinkhorn even though argmins agree.
fn euclidean_cost_matrix(x: &ArrayView2<f32>, y: &ArrayView2<f32>) -> Result<Array2<f32>> {
    let n = x.nrows();
    if y.nrows() != n {
        return Err(Error::Shape("x and y must have same number of rows"));
    }
    if x.ncols() != y.ncols() {
        return Err(Error::Shape("x and y must have same dimension"));
    }
    let mut cost = Array2::<f32>::zeros((n, n));
    for i in 0..n {
        let xi = x.row(i);
        for j in 0..n {
            cost[[i, j]] = l2(&xi, &y.row(j));
        }
    }
    Ok(cost)
}

#[inline]
fn logsumexp(v: &[f32]) -> f32 {
    let m = v.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if !m.is_finite() {
        return m;
    }
    let s: f32 = v.iter().map(|&x| (x - m).exp()).sum();
    m + s.ln()
}

/// Log-domain Sinkhorn with uniform marginals.
///
/// Returns the transport plan and the final marginal error. `None` when the
/// iteration produced non-finite potentials (numerical blow-up), which the
/// caller treats as a solve failure.
fn sinkhorn_log_uniform(
    cost: &Array2<f32>,
    reg: f32,
    max_iter: usize,
    tol: f32,
) -> Option<(Array2<f32>, f32)> {
    let n = cost.nrows();
    let log_a = -(n as f32).ln();

    let mut f = Array1::<f32>::zeros(n);
    let mut g = Array1::<f32>::zeros(n);
    let mut buf = vec![0.0f32; n];

    let mut err = f32::INFINITY;
    for _ in 0..max_iter {
        // f_i = reg * (log a_i - logsumexp_j (g_j - C_ij) / reg)
        for i in 0..n {
            for j in 0..n {
                buf[j] = (g[j] - cost[[i, j]]) / reg;
            }
            f[i] = reg * (log_a - logsumexp(&buf));
        }
        for j in 0..n {
            for i in 0..n {
                buf[i] = (f[i] - cost[[i, j]]) / reg;
            }
            g[j] = reg * (log_a - logsumexp(&buf));
        }
        if f.iter().any(|v| !v.is_finite()) || g.iter().any(|v| !v.is_finite()) {
            return None;
        }

        // Row-marginal error of the implied plan.
        err = 0.0;
        for i in 0..n {
            let mut row = 0.0f32;
            for j in 0..n {
                row += ((f[i] + g[j] - cost[[i, j]]) / reg).exp();
            }
            let e = (row - (1.0 / n as f32)).abs();
            if e > err {
                err = e;
            }
        }
        if err <= tol {
            break;
        }
    }

    let mut plan = Array2::<f32>::zeros((n, n));
    for i in 0..n {
        for j in 0..n {
            plan[[i, j]] = ((f[i] + g[j] - cost[[i, j]]) / reg).exp();
        }
    }
    if plan.iter().any(|v| !v.is_finite()) {
        return None;
    }
    Some((plan, err))
}

/// Build a greedy one-to-one matching (a permutation) from a nonnegative
/// `n×n` weight matrix: take the largest remaining entry, match that
/// row/column, repeat.
///
/// Not the Hungarian algorithm; a deterministic approximation that is cheap
/// and good enough for minibatch pairing.
pub fn greedy_match_from_plan(plan: &ArrayView2<f32>) -> Result<Vec<usize>> {
    let n = plan.nrows();
    if plan.ncols() != n {
        return Err(Error::Shape("plan matrix must be square"));
    }
    if n == 0 {
        return Ok(Vec::new());
    }
    if plan.iter().any(|&w| w.is_nan() || w < 0.0) {
        return Err(Error::Domain("plan weights must be nonnegative"));
    }

    let mut edges: Vec<(usize, usize, f32)> = Vec::with_capacity(n * n);
    for i in 0..n {
        for j in 0..n {
            edges.push((i, j, plan[[i, j]]));
        }
    }
    edges.sort_by(|a, b| b.2.total_cmp(&a.2));

    let mut matched_row = vec![false; n];
    let mut matched_col = vec![false; n];
    let mut perm = vec![usize::MAX; n];
    let mut remaining = n;
    for (i, j, _w) in edges {
        if matched_row[i] || matched_col[j] {
            continue;
        }
        matched_row[i] = true;
        matched_col[j] = true;
        perm[i] = j;
        remaining -= 1;
        if remaining == 0 {
            break;
        }
    }
    if perm.iter().any(|&j| j == usize::MAX) {
        return Err(Error::Domain("failed to construct a full matching"));
    }
    Ok(perm)
}

/// Sinkhorn solve parameters for the plan sampler.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CouplingConfig {
    /// Entropic regularization `reg` (larger = easier, smaller = sharper).
    pub reg: f32,
    /// Maximum Sinkhorn iterations per minibatch.
    pub max_iter: usize,
    /// Convergence tolerance on the marginal error.
    pub tol: f32,
}

impl Default for CouplingConfig {
    fn default() -> Self {
        Self {
            reg: 0.2,
            max_iter: 2_000,
            tol: 2e-3,
        }
    }
}

/// Result of a coupling attempt.
///
/// `Transport` carries a permutation extracted from a converged OT plan;
/// `Fallback` is the identity pairing used when the solve failed. Both are
/// valid pairings of the same batch size, so training proceeds either way.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CouplingOutcome {
    Transport(Vec<usize>),
    Fallback(Vec<usize>),
}

impl CouplingOutcome {
    pub fn permutation(&self) -> &[usize] {
        match self {
            CouplingOutcome::Transport(p) | CouplingOutcome::Fallback(p) => p,
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, CouplingOutcome::Fallback(_))
    }

    /// Reorder the rows of `y` so row `i` is the partner of source row `i`.
    pub fn reorder(&self, y: &ArrayView2<f32>) -> Array2<f32> {
        let perm = self.permutation();
        let mut out = Array2::<f32>::zeros((y.nrows(), y.ncols()));
        for (i, &j) in perm.iter().enumerate() {
            out.row_mut(i).assign(&y.row(j));
        }
        out
    }
}

/// Minibatch OT plan sampler.
///
/// Each call is independent: the pairing is recomputed from scratch and no
/// state crosses batches except the fallback counter.
#[derive(Debug, Clone)]
pub struct OtPlanSampler {
    cfg: CouplingConfig,
    fallbacks: u64,
    attempts: u64,
}

impl OtPlanSampler {
    pub fn new(cfg: CouplingConfig) -> Self {
        Self {
            cfg,
            fallbacks: 0,
            attempts: 0,
        }
    }

    /// Total couplings attempted and how many fell back to identity.
    pub fn fallback_stats(&self) -> (u64, u64) {
        (self.fallbacks, self.attempts)
    }

    /// Couple two equal-sized batches, approximately minimizing total
    /// transport cost.
    ///
    /// Shape mismatches are fatal; everything else (non-finite inputs,
    /// Sinkhorn blow-up or non-convergence) degrades to the identity pairing.
    pub fn sample_plan(
        &mut self,
        x: &ArrayView2<f32>,
        y: &ArrayView2<f32>,
    ) -> Result<CouplingOutcome> {
        let n = x.nrows();
        if y.nrows() != n {
            return Err(Error::Shape("x and y must have same number of rows"));
        }
        if x.ncols() != y.ncols() {
            return Err(Error::Shape("x and y must have same dimension"));
        }
        self.attempts += 1;
        if n == 0 {
            return Ok(CouplingOutcome::Transport(Vec::new()));
        }

        if x.iter().any(|v| !v.is_finite()) || y.iter().any(|v| !v.is_finite()) {
            return Ok(self.fall_back(n, "non-finite batch entries"));
        }

        let cost = euclidean_cost_matrix(x, y)?;
        let solved = sinkhorn_log_uniform(&cost, self.cfg.reg, self.cfg.max_iter, self.cfg.tol);
        let (plan, err) = match solved {
            Some(v) => v,
            None => return Ok(self.fall_back(n, "sinkhorn produced non-finite potentials")),
        };
        if err > self.cfg.tol {
            return Ok(self.fall_back(n, "sinkhorn did not converge"));
        }
        match greedy_match_from_plan(&plan.view()) {
            Ok(perm) => Ok(CouplingOutcome::Transport(perm)),
            Err(_) => Ok(self.fall_back(n, "plan did not yield a full matching")),
        }
    }

    fn fall_back(&mut self, n: usize, reason: &'static str) -> CouplingOutcome {
        self.fallbacks += 1;
        tracing::warn!(
            reason,
            fallbacks = self.fallbacks,
            attempts = self.attempts,
            "ot coupling fell back to identity pairing"
        );
        CouplingOutcome::Fallback((0..n).collect())
    }
}

/// Mean squared transport cost of a pairing (useful as an eval signal).
pub fn pairing_cost(x: &ArrayView2<f32>, y: &ArrayView2<f32>, perm: &[usize]) -> Result<f32> {
    let n = x.nrows();
    if y.nrows() != n || perm.len() != n {
        return Err(Error::Shape("pairing length must match batch size"));
    }
    if n == 0 {
        return Ok(0.0);
    }
    let mut s = 0.0f64;
    for (i, &j) in perm.iter().enumerate() {
        if j >= n {
            return Err(Error::Domain("pairing index out of range"));
        }
        let xi = x.row(i);
        let yj = y.row(j);
        for k in 0..x.ncols() {
            let d = (xi[k] - yj[k]) as f64;
            s += d * d;
        }
    }
    Ok((s / n as f64) as f32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use proptest::prelude::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use rand_distr::{Distribution, StandardNormal};

    fn is_permutation(p: &[usize]) -> bool {
        let n = p.len();
        let mut seen = vec![false; n];
        for &j in p {
            if j >= n || seen[j] {
                return false;
            }
            seen[j] = true;
        }
        true
    }

    fn random_batch(n: usize, d: usize, rng: &mut ChaCha8Rng) -> Array2<f32> {
        let mut x = Array2::<f32>::zeros((n, d));
        for i in 0..n {
            for k in 0..d {
                x[[i, k]] = StandardNormal.sample(rng);
            }
        }
        x
    }

    #[test]
    fn greedy_matching_is_a_permutation() {
        let w = array![[0.9, 0.1, 0.0], [0.2, 0.8, 0.1], [0.0, 0.1, 0.7]];
        let p = greedy_match_from_plan(&w.view()).unwrap();
        assert!(is_permutation(&p));
        assert_eq!(p, vec![0, 1, 2]);
    }

    #[test]
    fn matched_input_has_near_zero_cost() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let x = random_batch(12, 6, &mut rng);
        let mut sampler = OtPlanSampler::new(CouplingConfig::default());
        let outcome = sampler.sample_plan(&x.view(), &x.view()).unwrap();
        assert!(!outcome.is_fallback());
        let cost = pairing_cost(&x.view(), &x.view(), outcome.permutation()).unwrap();
        assert!(cost < 1e-3, "expected near-zero self-coupling cost: {cost}");
    }

    #[test]
    fn duplicate_points_do_not_fail() {
        // Fully degenerate batch: every point identical.
        let x = Array2::<f32>::from_elem((8, 4), 0.5);
        let mut sampler = OtPlanSampler::new(CouplingConfig::default());
        let outcome = sampler.sample_plan(&x.view(), &x.view()).unwrap();
        assert!(is_permutation(outcome.permutation()));
    }

    #[test]
    fn non_finite_batch_falls_back_to_identity() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let mut x = random_batch(6, 3, &mut rng);
        let y = random_batch(6, 3, &mut rng);
        x[[0, 0]] = f32::NAN;
        let mut sampler = OtPlanSampler::new(CouplingConfig::default());
        let outcome = sampler.sample_plan(&x.view(), &y.view()).unwrap();
        assert!(outcome.is_fallback());
        assert_eq!(outcome.permutation(), &[0, 1, 2, 3, 4, 5]);
        assert_eq!(sampler.fallback_stats(), (1, 1));
    }

    #[test]
    fn shape_mismatch_is_fatal() {
        let x = Array2::<f32>::zeros((4, 3));
        let y = Array2::<f32>::zeros((4, 5));
        let mut sampler = OtPlanSampler::new(CouplingConfig::default());
        assert!(sampler.sample_plan(&x.view(), &y.view()).is_err());
    }

    #[test]
    fn non_contiguous_views_couple_like_owned_copies() {
        // Rows of a transposed view are strided; the cost matrix must see
        // the real coordinates, not a degenerate zero cost.
        let mut rng = ChaCha8Rng::seed_from_u64(17);
        let x = random_batch(8, 3, &mut rng);
        let y_cols = random_batch(3, 8, &mut rng);
        let y_view = y_cols.t();
        let y_owned = y_view.to_owned();

        let mut s1 = OtPlanSampler::new(CouplingConfig::default());
        let mut s2 = OtPlanSampler::new(CouplingConfig::default());
        let o_view = s1.sample_plan(&x.view(), &y_view).unwrap();
        let o_owned = s2.sample_plan(&x.view(), &y_owned.view()).unwrap();

        assert!(!o_view.is_fallback());
        assert_eq!(o_view.permutation(), o_owned.permutation());
        let cost = pairing_cost(&x.view(), &y_owned.view(), o_view.permutation()).unwrap();
        assert!(cost > 0.0, "distinct clouds cannot have zero transport cost");
    }

    #[test]
    fn coupling_beats_identity_on_shifted_clusters() {
        // Two clusters offset so the identity pairing crosses them.
        let mut x = Array2::<f32>::zeros((8, 2));
        let mut y = Array2::<f32>::zeros((8, 2));
        for i in 0..4 {
            x[[i, 0]] = -2.0 + 0.05 * i as f32;
            y[[i, 0]] = 2.0 + 0.05 * i as f32;
            x[[i + 4, 0]] = 2.0 + 0.05 * i as f32;
            y[[i + 4, 0]] = -2.0 + 0.05 * i as f32;
        }
        let mut sampler = OtPlanSampler::new(CouplingConfig::default());
        let outcome = sampler.sample_plan(&x.view(), &y.view()).unwrap();
        assert!(!outcome.is_fallback());
        let identity: Vec<usize> = (0..8).collect();
        let c_ot = pairing_cost(&x.view(), &y.view(), outcome.permutation()).unwrap();
        let c_id = pairing_cost(&x.view(), &y.view(), &identity).unwrap();
        assert!(c_ot < c_id, "ot={c_ot} identity={c_id}");
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 24, .. ProptestConfig::default() })]
        #[test]
        fn prop_coupling_is_permutation_and_deterministic(
            n in 1usize..12,
            d in 1usize..8,
            seed in any::<u64>(),
        ) {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            let x = random_batch(n, d, &mut rng);
            let y = random_batch(n, d, &mut rng);

            let mut s1 = OtPlanSampler::new(CouplingConfig::default());
            let mut s2 = OtPlanSampler::new(CouplingConfig::default());
            let o1 = s1.sample_plan(&x.view(), &y.view()).unwrap();
            let o2 = s2.sample_plan(&x.view(), &y.view()).unwrap();

            prop_assert_eq!(o1.permutation(), o2.permutation());
            prop_assert!(is_permutation(o1.permutation()));
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 24, .. ProptestConfig::default() })]
        #[test]
        fn prop_reorder_matches_permutation(
            n in 1usize..10,
            d in 1usize..6,
            seed in any::<u64>(),
        ) {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            let x = random_batch(n, d, &mut rng);
            let y = random_batch(n, d, &mut rng);

            let mut sampler = OtPlanSampler::new(CouplingConfig::default());
            let outcome = sampler.sample_plan(&x.view(), &y.view()).unwrap();
            let reordered = outcome.reorder(&y.view());
            for (i, &j) in outcome.permutation().iter().enumerate() {
                for k in 0..d {
                    prop_assert_eq!(reordered[[i, k]].to_bits(), y[[j, k]].to_bits());
                }
            }
        }
    }
}
