//! # cellflow
//!
//! Conditional flow matching over single-cell gene-expression counts.
//!
//! This crate is intentionally small:
//!
//! - it implements the **flow-matching training step** and the **ODE sampling
//!   procedure** for count data (minibatch OT coupling, linear probability
//!   path, negative-binomial decoding),
//! - the denoising network, covariate embeddings, and the scaler are
//!   collaborators behind traits; data loading and evaluation live elsewhere.
//!
//! ## Public invariants (must not change)
//!
//! - **Determinism knobs are explicit**: training/sampling take `seed` (or
//!   configs do); no hidden RNG state outside the model object.
//! - **No hidden normalization**: decoded means are nonnegative and row-sum
//!   to the supplied size factor; this is stated per variant in [`bridge`].
//! - **Coupling never halts training**: a failed OT solve degrades to an
//!   identity pairing surfaced as [`coupling::CouplingOutcome::Fallback`].
//! - **ODE divergence is fatal**: integration failures propagate as
//!   [`Error::Integration`]; there is no retry policy.
//!
//! ## How this maps to "Flow Matching" (papers)
//!
//! The training objective is the standard *conditional flow matching*
//! regression with a linear path: sample `t`, draw
//! `x_t ~ N(t·x1 + (1-t)·x0, sigma)`, and regress a conditional velocity
//! field toward `u_t = x1 - x0` under a minibatch OT coupling
//! (Tong et al., *Improving and Generalizing Flow-Based Generative Models
//! with minibatch optimal transport*).
//!
//! ## Module map
//!
//! - `coupling`: minibatch OT plan sampler (Sinkhorn + greedy matching, with
//!   an explicit fallback pairing)
//! - `path`: linear probability path (mean/std/sample/target velocity)
//! - `ode`: fixed-step and adaptive integrators + the conditioned ODE adapter
//! - `field`: velocity-model seam and a linear trainable baseline
//! - `nb`: negative-binomial likelihood and the dispersion table
//! - `bridge`: encode/decode bridge between counts and the latent space
//! - `model`: the training/sampling orchestrator

pub mod bridge;
pub mod coupling;
pub mod field;
pub mod model;
pub mod nb;
pub mod ode;
pub mod path;

/// cellflow error variants.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("shape mismatch: {0}")]
    Shape(&'static str),
    #[error("domain error: {0}")]
    Domain(&'static str),
    #[error("ode integration failed: {0}")]
    Integration(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;
