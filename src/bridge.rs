//! Encode/decode bridge between raw expression counts and the latent space
//! the flow operates in.
//!
//! Three variants, selected by [`EncoderKind`]:
//!
//! - `Fixed`: identity on scaled input; decode inverts the scaling, applies a
//!   learnt per-gene correction, normalizes to the simplex, and rescales by
//!   the size factor.
//! - `LearntEncoder`: an MLP maps scaled expression to latent space; decode
//!   is softmax times size factor (the inverse is implied, never learnt).
//! - `LearntAutoencoder`: mirrored encoder/decoder MLPs (decoder dims are
//!   the reversed encoder dims); decode runs the decoder then
//!   softmax-and-rescale.
//!
//! Decode contract for every variant: the output is nonnegative and each row
//! sums to the supplied size factor. That vector parameterizes the mean of
//! the negative-binomial likelihood in [`crate::nb`], which also defines the
//! reconstruction loss used for encoder pretraining.

use crate::nb::{nb_dlogp_dmu, DispersionTable};
use crate::{Error, Result};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};

/// Scaling collaborator: maps normalized expression into the range the flow
/// trains in, and back (`reverse = true`).
pub trait Scaler {
    fn scale(&self, x: &ArrayView2<f32>, reverse: bool) -> Array2<f32>;
}

/// Per-gene affine scaler: forward `(x - shift) / scale`, reverse inverts.
#[derive(Debug, Clone)]
pub struct AffineScaler {
    shift: Array1<f32>,
    scale: Array1<f32>,
}

impl AffineScaler {
    pub fn new(shift: Array1<f32>, scale: Array1<f32>) -> Result<Self> {
        if shift.len() != scale.len() {
            return Err(Error::Shape("shift and scale must have equal length"));
        }
        if scale.iter().any(|&s| !(s > 0.0) || !s.is_finite()) {
            return Err(Error::Domain("scale entries must be positive and finite"));
        }
        Ok(Self { shift, scale })
    }

    /// No-op scaler (shift 0, scale 1).
    pub fn identity(genes: usize) -> Self {
        Self {
            shift: Array1::zeros(genes),
            scale: Array1::ones(genes),
        }
    }
}

impl Scaler for AffineScaler {
    fn scale(&self, x: &ArrayView2<f32>, reverse: bool) -> Array2<f32> {
        let mut out = x.to_owned();
        for mut row in out.rows_mut() {
            for k in 0..row.len() {
                row[k] = if reverse {
                    row[k] * self.scale[k] + self.shift[k]
                } else {
                    (row[k] - self.shift[k]) / self.scale[k]
                };
            }
        }
        out
    }
}

/// Encoder variant selector (configuration surface).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EncoderKind {
    /// No learnt encoder; the latent space is the scaled input space.
    Fixed,
    /// MLP encoder `genes -> hidden.. -> genes`.
    LearntEncoder { hidden: Vec<usize> },
    /// MLP encoder `genes -> hidden..` with a mirrored decoder.
    LearntAutoencoder { hidden: Vec<usize> },
}

struct DenseCache {
    /// Post-activation output of each layer; `acts[0]` is the input.
    acts: Vec<Array2<f32>>,
}

/// Feed-forward net with tanh hidden activations and a linear output layer.
/// Gradients are hand-rolled; no framework.
#[derive(Debug, Clone)]
pub struct Mlp {
    weights: Vec<Array2<f32>>, // out × in
    biases: Vec<Array1<f32>>,
}

impl Mlp {
    pub fn new(dims: &[usize], seed: u64) -> Result<Self> {
        if dims.len() < 2 {
            return Err(Error::Domain("mlp needs at least input and output dims"));
        }
        if dims.iter().any(|&d| d == 0) {
            return Err(Error::Domain("mlp dims must be nonzero"));
        }
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut weights = Vec::with_capacity(dims.len() - 1);
        let mut biases = Vec::with_capacity(dims.len() - 1);
        for win in dims.windows(2) {
            let (fan_in, fan_out) = (win[0], win[1]);
            let std = 1.0 / (fan_in as f32).sqrt();
            let mut w = Array2::<f32>::zeros((fan_out, fan_in));
            for v in w.iter_mut() {
                let z: f32 = StandardNormal.sample(&mut rng);
                *v = std * z;
            }
            weights.push(w);
            biases.push(Array1::zeros(fan_out));
        }
        Ok(Self { weights, biases })
    }

    pub fn in_dim(&self) -> usize {
        self.weights[0].ncols()
    }

    pub fn out_dim(&self) -> usize {
        self.weights[self.weights.len() - 1].nrows()
    }

    pub fn forward(&self, x: &ArrayView2<f32>) -> Array2<f32> {
        self.forward_cached(x).acts.pop().unwrap_or_else(|| x.to_owned())
    }

    fn forward_cached(&self, x: &ArrayView2<f32>) -> DenseCache {
        let last = self.weights.len() - 1;
        let mut acts: Vec<Array2<f32>> = Vec::with_capacity(self.weights.len() + 1);
        acts.push(x.to_owned());
        for (l, (w, b)) in self.weights.iter().zip(self.biases.iter()).enumerate() {
            let prev = &acts[l];
            let mut z = prev.dot(&w.t());
            for mut row in z.rows_mut() {
                for k in 0..row.len() {
                    row[k] += b[k];
                }
            }
            if l != last {
                z.mapv_inplace(f32::tanh);
            }
            acts.push(z);
        }
        DenseCache { acts }
    }

    /// Backpropagate `dout` (already including any batch averaging) and take
    /// one SGD step. Returns the gradient w.r.t. the input.
    fn backward_sgd(&mut self, cache: &DenseCache, dout: Array2<f32>, lr: f32) -> Array2<f32> {
        let last = self.weights.len() - 1;
        let mut delta = dout;
        for l in (0..self.weights.len()).rev() {
            if l != last {
                // tanh' from the cached post-activation.
                let a = &cache.acts[l + 1];
                for (d, &av) in delta.iter_mut().zip(a.iter()) {
                    *d *= 1.0 - av * av;
                }
            }
            let prev = &cache.acts[l];
            let grad_w = delta.t().dot(prev);
            let grad_b = delta.sum_axis(Axis(0));
            let d_prev = delta.dot(&self.weights[l]);
            self.weights[l].zip_mut_with(&grad_w, |w, &g| *w -= lr * g);
            self.biases[l].zip_mut_with(&grad_b, |b, &g| *b -= lr * g);
            delta = d_prev;
        }
        delta
    }

    /// Sum of squared parameters (used to detect frozen weights in tests).
    pub fn param_sq_norm(&self) -> f64 {
        let mut s = 0.0f64;
        for w in &self.weights {
            for &v in w.iter() {
                s += (v as f64) * (v as f64);
            }
        }
        for b in &self.biases {
            for &v in b.iter() {
                s += (v as f64) * (v as f64);
            }
        }
        s
    }
}

fn softmax_rows(o: &ArrayView2<f32>) -> Array2<f32> {
    let mut p = o.to_owned();
    for mut row in p.rows_mut() {
        let m = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let mut sum = 0.0f32;
        for v in row.iter_mut() {
            *v = (*v - m).exp();
            sum += *v;
        }
        for v in row.iter_mut() {
            *v /= sum;
        }
    }
    p
}

fn check_size_factor(size_factor: &ArrayView1<f32>, rows: usize) -> Result<()> {
    if size_factor.len() != rows {
        return Err(Error::Shape("size factor must have batch-size length"));
    }
    if size_factor.iter().any(|&s| !(s > 0.0) || !s.is_finite()) {
        return Err(Error::Domain("size factors must be strictly positive"));
    }
    Ok(())
}

enum BridgeVariant {
    Fixed { correction: Array1<f32> },
    Learnt { encoder: Mlp },
    Autoencoder { encoder: Mlp, decoder: Mlp },
}

/// Polymorphic encode/decode bridge (one variant per [`EncoderKind`]).
pub struct LatentBridge {
    variant: BridgeVariant,
    genes: usize,
    frozen: bool,
}

impl LatentBridge {
    pub fn new(kind: &EncoderKind, genes: usize, seed: u64) -> Result<Self> {
        if genes == 0 {
            return Err(Error::Domain("gene dimension must be nonzero"));
        }
        let variant = match kind {
            EncoderKind::Fixed => BridgeVariant::Fixed {
                correction: Array1::zeros(genes),
            },
            EncoderKind::LearntEncoder { hidden } => {
                let mut dims = vec![genes];
                dims.extend_from_slice(hidden);
                dims.push(genes);
                BridgeVariant::Learnt {
                    encoder: Mlp::new(&dims, seed)?,
                }
            }
            EncoderKind::LearntAutoencoder { hidden } => {
                if hidden.is_empty() {
                    return Err(Error::Domain("autoencoder needs at least one hidden dim"));
                }
                let mut enc_dims = vec![genes];
                enc_dims.extend_from_slice(hidden);
                let mut dec_dims = enc_dims.clone();
                dec_dims.reverse();
                BridgeVariant::Autoencoder {
                    encoder: Mlp::new(&enc_dims, seed)?,
                    decoder: Mlp::new(&dec_dims, seed ^ 0x9e3779b97f4a7c15)?,
                }
            }
        };
        Ok(Self {
            variant,
            genes,
            frozen: false,
        })
    }

    /// Dimensionality of the space the flow operates in.
    pub fn latent_dim(&self) -> usize {
        match &self.variant {
            BridgeVariant::Fixed { .. } => self.genes,
            BridgeVariant::Learnt { encoder } => encoder.out_dim(),
            BridgeVariant::Autoencoder { encoder, .. } => encoder.out_dim(),
        }
    }

    /// Permanently stop parameter updates on the encoder/decoder/correction.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Sum of squared bridge parameters; stable under joint-phase steps once
    /// frozen.
    pub fn param_sq_norm(&self) -> f64 {
        match &self.variant {
            BridgeVariant::Fixed { correction } => {
                correction.iter().map(|&v| (v as f64) * (v as f64)).sum()
            }
            BridgeVariant::Learnt { encoder } => encoder.param_sq_norm(),
            BridgeVariant::Autoencoder { encoder, decoder } => {
                encoder.param_sq_norm() + decoder.param_sq_norm()
            }
        }
    }

    /// Map scaled expression to the latent point `x0` the flow trains on.
    pub fn encode(&self, x_scaled: &ArrayView2<f32>) -> Result<Array2<f32>> {
        if x_scaled.ncols() != self.genes {
            return Err(Error::Shape("encode input must have gene dimension"));
        }
        Ok(match &self.variant {
            BridgeVariant::Fixed { .. } => x_scaled.to_owned(),
            BridgeVariant::Learnt { encoder } => encoder.forward(x_scaled),
            BridgeVariant::Autoencoder { encoder, .. } => encoder.forward(x_scaled),
        })
    }

    /// Pre-softmax logits for a latent batch.
    fn logits(&self, z: &ArrayView2<f32>, scaler: &dyn Scaler) -> Result<Array2<f32>> {
        Ok(match &self.variant {
            BridgeVariant::Fixed { correction } => {
                let mut o = scaler.scale(z, true);
                for mut row in o.rows_mut() {
                    for k in 0..row.len() {
                        row[k] += correction[k];
                    }
                }
                o
            }
            BridgeVariant::Learnt { .. } => z.to_owned(),
            BridgeVariant::Autoencoder { decoder, .. } => decoder.forward(z),
        })
    }

    /// Decode a latent batch into NB means: nonnegative, each row summing to
    /// its size factor.
    pub fn decode(
        &self,
        z: &ArrayView2<f32>,
        size_factor: &ArrayView1<f32>,
        scaler: &dyn Scaler,
    ) -> Result<Array2<f32>> {
        check_size_factor(size_factor, z.nrows())?;
        let o = self.logits(z, scaler)?;
        if o.ncols() != self.genes {
            return Err(Error::Shape("decoded logits must have gene dimension"));
        }
        let mut p = softmax_rows(&o.view());
        for (i, mut row) in p.rows_mut().into_iter().enumerate() {
            for v in row.iter_mut() {
                *v *= size_factor[i];
            }
        }
        Ok(p)
    }

    /// Mean NB reconstruction loss of raw counts given the current bridge
    /// and dispersion parameters (no updates).
    pub fn recon_loss(
        &self,
        x_counts: &ArrayView2<f32>,
        x_scaled: &ArrayView2<f32>,
        size_factor: &ArrayView1<f32>,
        categories: &[usize],
        theta: &DispersionTable,
        scaler: &dyn Scaler,
    ) -> Result<f32> {
        let z = self.encode(x_scaled)?;
        let mu = self.decode(&z.view(), size_factor, scaler)?;
        theta.recon_loss(x_counts, &mu.view(), categories)
    }

    /// One pretraining step: NB reconstruction loss backpropagated through
    /// softmax and the MLPs, plus a dispersion-table update. Returns the loss
    /// before the update.
    ///
    /// When the bridge is frozen only the dispersion table moves.
    #[allow(clippy::too_many_arguments)]
    pub fn pretrain_step(
        &mut self,
        x_counts: &ArrayView2<f32>,
        x_scaled: &ArrayView2<f32>,
        size_factor: &ArrayView1<f32>,
        categories: &[usize],
        theta: &mut DispersionTable,
        scaler: &dyn Scaler,
        lr: f32,
    ) -> Result<f32> {
        let n = x_counts.nrows();
        if x_scaled.nrows() != n {
            return Err(Error::Shape("count and scaled batches must align"));
        }
        check_size_factor(size_factor, n)?;
        if !(lr > 0.0) || !lr.is_finite() {
            return Err(Error::Domain("lr must be positive and finite"));
        }

        // Forward with caches where gradients will flow.
        let (enc_cache, z) = match &self.variant {
            BridgeVariant::Fixed { .. } => (None, x_scaled.to_owned()),
            BridgeVariant::Learnt { encoder } | BridgeVariant::Autoencoder { encoder, .. } => {
                let cache = encoder.forward_cached(x_scaled);
                let z = cache.acts[cache.acts.len() - 1].clone();
                (Some(cache), z)
            }
        };
        let dec_cache = match &self.variant {
            BridgeVariant::Autoencoder { decoder, .. } => Some(decoder.forward_cached(&z.view())),
            _ => None,
        };
        let o = match (&self.variant, &dec_cache) {
            (BridgeVariant::Fixed { .. }, _) => self.logits(&z.view(), scaler)?,
            (BridgeVariant::Learnt { .. }, _) => z.clone(),
            (BridgeVariant::Autoencoder { .. }, Some(c)) => c.acts[c.acts.len() - 1].clone(),
            (BridgeVariant::Autoencoder { .. }, None) => unreachable!(),
        };

        let p = softmax_rows(&o.view());
        let mut mu = p.clone();
        for (i, mut row) in mu.rows_mut().into_iter().enumerate() {
            for v in row.iter_mut() {
                *v *= size_factor[i];
            }
        }
        let loss = theta.recon_loss(x_counts, &mu.view(), categories)?;

        // dL/dmu with the batch mean folded in (loss = -mean log p).
        let inv_n = 1.0 / n.max(1) as f32;
        let g = self.genes;
        let mut dmu = Array2::<f32>::zeros((n, g));
        for i in 0..n {
            let theta_row = theta.theta_for(categories[i])?;
            for k in 0..g {
                dmu[[i, k]] =
                    -(nb_dlogp_dmu(x_counts[[i, k]], mu[[i, k]], theta_row[k]) as f32) * inv_n;
            }
        }

        // Softmax backprop: dL/do_j = sf * p_j * (G_j - Σ_k G_k p_k).
        let mut dout = Array2::<f32>::zeros((n, g));
        for i in 0..n {
            let mut dot = 0.0f32;
            for k in 0..g {
                dot += dmu[[i, k]] * p[[i, k]];
            }
            for j in 0..g {
                dout[[i, j]] = size_factor[i] * p[[i, j]] * (dmu[[i, j]] - dot);
            }
        }

        if !self.frozen {
            match &mut self.variant {
                BridgeVariant::Fixed { correction } => {
                    let grad = dout.sum_axis(Axis(0));
                    correction.zip_mut_with(&grad, |c, &gr| *c -= lr * gr);
                }
                BridgeVariant::Learnt { encoder } => {
                    let cache = enc_cache.as_ref().ok_or(Error::Domain("missing cache"))?;
                    encoder.backward_sgd(cache, dout, lr);
                }
                BridgeVariant::Autoencoder { encoder, decoder } => {
                    let dc = dec_cache.as_ref().ok_or(Error::Domain("missing cache"))?;
                    let dz = decoder.backward_sgd(dc, dout, lr);
                    let ec = enc_cache.as_ref().ok_or(Error::Domain("missing cache"))?;
                    encoder.backward_sgd(ec, dz, lr);
                }
            }
        }

        theta.sgd_step(x_counts, &mu.view(), categories, lr)?;
        Ok(loss)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toy_counts(n: usize, g: usize) -> (Array2<f32>, Array2<f32>, Array1<f32>) {
        let mut x = Array2::<f32>::zeros((n, g));
        for i in 0..n {
            for k in 0..g {
                x[[i, k]] = ((i * 7 + k * 3) % 9) as f32;
            }
            // Every cell needs at least one count for a positive size factor.
            x[[i, 0]] += 1.0;
        }
        let sf = x.sum_axis(Axis(1));
        let mut x_norm = x.clone();
        for (i, mut row) in x_norm.rows_mut().into_iter().enumerate() {
            for v in row.iter_mut() {
                *v /= sf[i];
            }
        }
        (x, x_norm, sf)
    }

    fn all_kinds() -> Vec<EncoderKind> {
        vec![
            EncoderKind::Fixed,
            EncoderKind::LearntEncoder { hidden: vec![8] },
            EncoderKind::LearntAutoencoder { hidden: vec![8, 4] },
        ]
    }

    #[test]
    fn decode_rows_sum_to_size_factor_for_all_variants() {
        let (_, x_norm, sf) = toy_counts(6, 5);
        let scaler = AffineScaler::identity(5);
        for kind in all_kinds() {
            let bridge = LatentBridge::new(&kind, 5, 11).unwrap();
            let z = bridge.encode(&x_norm.view()).unwrap();
            let mu = bridge.decode(&z.view(), &sf.view(), &scaler).unwrap();
            for (i, row) in mu.rows().into_iter().enumerate() {
                let sum: f32 = row.iter().sum();
                assert!(
                    (sum - sf[i]).abs() <= 1e-3 * sf[i].max(1.0),
                    "{kind:?}: row {i} sums to {sum}, want {}",
                    sf[i]
                );
                assert!(row.iter().all(|&v| v >= 0.0));
            }
        }
    }

    #[test]
    fn decode_rejects_nonpositive_size_factor() {
        let (_, x_norm, _) = toy_counts(3, 4);
        let scaler = AffineScaler::identity(4);
        let bridge = LatentBridge::new(&EncoderKind::Fixed, 4, 1).unwrap();
        let z = bridge.encode(&x_norm.view()).unwrap();
        let sf = Array1::from_vec(vec![5.0, 0.0, 3.0]);
        assert!(bridge.decode(&z.view(), &sf.view(), &scaler).is_err());
    }

    #[test]
    fn autoencoder_latent_dim_is_last_hidden() {
        let bridge = LatentBridge::new(
            &EncoderKind::LearntAutoencoder { hidden: vec![16, 4] },
            10,
            1,
        )
        .unwrap();
        assert_eq!(bridge.latent_dim(), 4);
        let fixed = LatentBridge::new(&EncoderKind::Fixed, 10, 1).unwrap();
        assert_eq!(fixed.latent_dim(), 10);
    }

    #[test]
    fn pretraining_reduces_reconstruction_loss() {
        let (x, x_norm, sf) = toy_counts(16, 5);
        let scaler = AffineScaler::identity(5);
        let cats = vec![0usize; 16];

        for kind in all_kinds() {
            let mut bridge = LatentBridge::new(&kind, 5, 21).unwrap();
            let mut theta = DispersionTable::global(5, 3);
            let before = bridge
                .recon_loss(&x.view(), &x_norm.view(), &sf.view(), &cats, &theta, &scaler)
                .unwrap();
            let mut last = before;
            for _ in 0..300 {
                last = bridge
                    .pretrain_step(
                        &x.view(),
                        &x_norm.view(),
                        &sf.view(),
                        &cats,
                        &mut theta,
                        &scaler,
                        0.01,
                    )
                    .unwrap();
            }
            assert!(
                last < before,
                "{kind:?}: expected loss drop, got {before} -> {last}"
            );
        }
    }

    #[test]
    fn frozen_bridge_parameters_do_not_move() {
        let (x, x_norm, sf) = toy_counts(8, 4);
        let scaler = AffineScaler::identity(4);
        let cats = vec![0usize; 8];
        let mut bridge =
            LatentBridge::new(&EncoderKind::LearntEncoder { hidden: vec![6] }, 4, 5).unwrap();
        let mut theta = DispersionTable::global(4, 2);

        bridge.freeze();
        let norm_before = bridge.param_sq_norm();
        bridge
            .pretrain_step(
                &x.view(),
                &x_norm.view(),
                &sf.view(),
                &cats,
                &mut theta,
                &scaler,
                0.05,
            )
            .unwrap();
        let norm_after = bridge.param_sq_norm();
        assert_eq!(norm_before.to_bits(), norm_after.to_bits());
    }

    #[test]
    fn affine_scaler_round_trips() {
        let shift = Array1::from_vec(vec![1.0, -2.0, 0.5]);
        let scale = Array1::from_vec(vec![2.0, 0.5, 3.0]);
        let scaler = AffineScaler::new(shift, scale).unwrap();
        let x = Array2::from_shape_fn((4, 3), |(i, j)| (i * 3 + j) as f32 * 0.7 - 1.0);
        let fwd = scaler.scale(&x.view(), false);
        let back = scaler.scale(&fwd.view(), true);
        for (a, b) in x.iter().zip(back.iter()) {
            assert!((a - b).abs() <= 1e-5);
        }
    }
}
