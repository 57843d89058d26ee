//! ODE integration for sampling flow models.
//!
//! Sampling solves
//! \[
//! \frac{dx}{dt} = v_\theta(x, t; \cdot)
//! \]
//! over `[0, 1]` for a whole batch at once. Fixed-step Euler/Heun are kept
//! deterministic and tolerance-free; the adaptive method is an embedded
//! Bogacki–Shampine 3(2) pair with explicit absolute/relative tolerances.
//!
//! `n_points` is the number of output time points spanning the interval;
//! only the final state is returned (the sampler consumes nothing else).

use crate::field::VelocityModel;
use crate::{Error, Result};
use ndarray::{Array1, Array2, ArrayView2};

/// Integration method for sampling.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OdeMethod {
    /// Explicit Euler (1st order), fixed step.
    Euler,
    /// Heun / explicit trapezoid (2nd order), fixed step.
    Heun,
    /// Embedded Bogacki–Shampine 3(2), adaptive step.
    Adaptive { atol: f32, rtol: f32 },
}

impl Default for OdeMethod {
    fn default() -> Self {
        OdeMethod::Adaptive {
            atol: 1e-4,
            rtol: 1e-4,
        }
    }
}

fn axpy(out: &mut Array2<f32>, a: f32, v: &Array2<f32>) {
    for (o, &x) in out.iter_mut().zip(v.iter()) {
        *o += a * x;
    }
}

/// Integrate a batched ODE from `t0` to `t1` with `n_points` output time
/// points (so `n_points - 1` fixed steps); returns the final state only.
///
/// Divergence (non-finite state, adaptive step-size underflow) is fatal.
pub fn integrate_batch(
    method: OdeMethod,
    x0: &ArrayView2<f32>,
    t0: f32,
    t1: f32,
    n_points: usize,
    mut f: impl FnMut(f32, &ArrayView2<f32>) -> Array2<f32>,
) -> Result<Array2<f32>> {
    if n_points < 2 {
        return Err(Error::Domain("n_points must be >= 2"));
    }
    if !t0.is_finite() || !t1.is_finite() || t1 <= t0 {
        return Err(Error::Domain("time span must be finite with t1 > t0"));
    }

    let mut x = x0.to_owned();
    match method {
        OdeMethod::Euler => {
            let steps = n_points - 1;
            let dt = (t1 - t0) / steps as f32;
            let mut t = t0;
            for _ in 0..steps {
                let v = f(t, &x.view());
                axpy(&mut x, dt, &v);
                t += dt;
            }
        }
        OdeMethod::Heun => {
            let steps = n_points - 1;
            let dt = (t1 - t0) / steps as f32;
            let mut t = t0;
            for _ in 0..steps {
                let v0 = f(t, &x.view());
                let mut x_pred = x.clone();
                axpy(&mut x_pred, dt, &v0);
                let v1 = f(t + dt, &x_pred.view());
                for i in 0..x.nrows() {
                    for k in 0..x.ncols() {
                        x[[i, k]] += 0.5 * dt * (v0[[i, k]] + v1[[i, k]]);
                    }
                }
                t += dt;
            }
        }
        OdeMethod::Adaptive { atol, rtol } => {
            if !(atol > 0.0) || !(rtol > 0.0) || !atol.is_finite() || !rtol.is_finite() {
                return Err(Error::Domain("tolerances must be positive and finite"));
            }
            integrate_bs23(&mut x, t0, t1, atol, rtol, &mut f)?;
        }
    }

    if x.iter().any(|v| !v.is_finite()) {
        return Err(Error::Integration("state became non-finite"));
    }
    Ok(x)
}

/// Bogacki–Shampine 3(2): third-order solution with an embedded second-order
/// error estimate. Accepts when the scaled error is <= 1, otherwise shrinks
/// the step; step-size underflow is surfaced as a failure, not retried.
fn integrate_bs23(
    x: &mut Array2<f32>,
    t0: f32,
    t1: f32,
    atol: f32,
    rtol: f32,
    f: &mut impl FnMut(f32, &ArrayView2<f32>) -> Array2<f32>,
) -> Result<()> {
    let span = t1 - t0;
    let h_min = span * 1e-7;
    let max_steps = 100_000usize;

    let mut t = t0;
    let mut h = span / 16.0;
    let mut steps = 0usize;

    while t1 - t > span * 1e-9 {
        if steps >= max_steps {
            return Err(Error::Integration("adaptive step budget exhausted"));
        }
        steps += 1;
        if h < h_min {
            return Err(Error::Integration("adaptive step size underflow"));
        }
        // Clamp to the endpoint; the controller's `h` stays unclamped so a
        // tiny final step is not mistaken for underflow.
        let hs = h.min(t1 - t);

        let k1 = f(t, &x.view());
        let mut x2 = x.clone();
        axpy(&mut x2, 0.5 * hs, &k1);
        let k2 = f(t + 0.5 * hs, &x2.view());
        let mut x3 = x.clone();
        axpy(&mut x3, 0.75 * hs, &k2);
        let k3 = f(t + 0.75 * hs, &x3.view());

        // 3rd-order candidate.
        let mut x_hi = x.clone();
        axpy(&mut x_hi, hs * 2.0 / 9.0, &k1);
        axpy(&mut x_hi, hs / 3.0, &k2);
        axpy(&mut x_hi, hs * 4.0 / 9.0, &k3);

        let k4 = f(t + hs, &x_hi.view());

        // Embedded 2nd-order candidate.
        let mut x_lo = x.clone();
        axpy(&mut x_lo, hs * 7.0 / 24.0, &k1);
        axpy(&mut x_lo, hs / 4.0, &k2);
        axpy(&mut x_lo, hs / 3.0, &k3);
        axpy(&mut x_lo, hs / 8.0, &k4);

        if x_hi.iter().any(|v| !v.is_finite()) {
            return Err(Error::Integration("state became non-finite"));
        }

        // Scaled max-norm error.
        let mut err = 0.0f32;
        for ((&hi, &lo), &cur) in x_hi.iter().zip(x_lo.iter()).zip(x.iter()) {
            let scale = atol + rtol * hi.abs().max(cur.abs());
            let e = (hi - lo).abs() / scale;
            if e > err {
                err = e;
            }
        }

        if err <= 1.0 {
            t += hs;
            *x = x_hi;
        }

        // Standard 3rd-order controller with clamped growth.
        let factor = if err > 0.0 {
            (0.9 * err.powf(-1.0 / 3.0)).clamp(0.2, 5.0)
        } else {
            5.0
        };
        h = hs * factor;
    }
    Ok(())
}

/// Adapter presenting a conditioned velocity model as a pure `(t, x)`
/// function for the integrators.
///
/// The log size factor and covariate embedding are captured at construction
/// and held fixed across the whole trajectory.
pub struct FlowOde<'a, F: VelocityModel> {
    field: &'a F,
    log_size_factor: Array1<f32>,
    cond: Array2<f32>,
}

impl<'a, F: VelocityModel> FlowOde<'a, F> {
    pub fn new(field: &'a F, log_size_factor: Array1<f32>, cond: Array2<f32>) -> Result<Self> {
        if log_size_factor.len() != cond.nrows() {
            return Err(Error::Shape("conditioning rows must match batch size"));
        }
        Ok(Self {
            field,
            log_size_factor,
            cond,
        })
    }

    /// Velocity at integration time `t` (broadcast over the batch) and state `x`.
    pub fn evaluate(&self, t: f32, x: &ArrayView2<f32>) -> Array2<f32> {
        let tv = Array1::from_elem(x.nrows(), t);
        self.field.velocity(
            x,
            &tv.view(),
            &self.log_size_factor.view(),
            &self.cond.view(),
        )
    }

    /// Integrate the flow from `t = 0` to `t = 1` and return the final state.
    pub fn integrate(
        &self,
        x0: &ArrayView2<f32>,
        n_points: usize,
        method: OdeMethod,
    ) -> Result<Array2<f32>> {
        if x0.nrows() != self.cond.nrows() {
            return Err(Error::Shape("state rows must match conditioning rows"));
        }
        integrate_batch(method, x0, 0.0, 1.0, n_points, |t, x| self.evaluate(t, x))
    }
}
